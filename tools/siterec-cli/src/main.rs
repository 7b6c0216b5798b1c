//! Siterec CLI: record web pages to video files.
//!
//! Usage:
//!   siterec record <URL> [OPTIONS]   Record one page
//!   siterec batch <FILE>             Record every request in a JSON file
//!   siterec check                    Check for a browser and the encoder

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use siterec_common::config::{AppConfig, OutputFormat, PacingMode};

mod commands;

#[derive(Parser)]
#[command(
    name = "siterec",
    about = "Record live web pages to video with a headless browser",
    version,
    author
)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output directory (overrides the configured one)
    #[arg(short, long, global = true)]
    output: Option<PathBuf>,

    /// Container and codec
    #[arg(long, global = true, value_enum)]
    format: Option<FormatArg>,

    /// Frame pacing strategy
    #[arg(long, global = true, value_enum)]
    pacing: Option<PacingArg>,

    /// Output frame rate
    #[arg(long, global = true)]
    fps: Option<u32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record a single page
    Record {
        /// Page URL (http, https or file)
        url: String,

        /// Recording duration in milliseconds
        #[arg(short, long)]
        duration: Option<u64>,

        /// Output width
        #[arg(long)]
        width: Option<u32>,

        /// Output height
        #[arg(long)]
        height: Option<u32>,

        /// Crop origin X in viewport pixels
        #[arg(long)]
        crop_x: Option<u32>,

        /// Crop origin Y in viewport pixels
        #[arg(long)]
        crop_y: Option<u32>,

        /// Browser viewport width
        #[arg(long)]
        viewport_width: Option<u32>,

        /// Browser viewport height
        #[arg(long)]
        viewport_height: Option<u32>,
    },

    /// Record every request in a JSON array file
    Batch {
        /// Path to a JSON array of request objects
        file: PathBuf,

        /// Maximum recordings running at once
        #[arg(short, long)]
        concurrency: Option<usize>,
    },

    /// Check for a browser and the encoder
    Check,
}

#[derive(Clone, Copy, ValueEnum)]
enum FormatArg {
    Mp4,
    Webm,
}

#[derive(Clone, Copy, ValueEnum)]
enum PacingArg {
    PassThrough,
    Throttle,
}

impl Cli {
    /// Apply command-line overrides on top of the loaded configuration.
    fn apply(&self, config: &mut AppConfig) {
        if self.verbose {
            config.logging.level = "debug".to_string();
        }
        if let Some(output) = &self.output {
            config.output_dir = output.clone();
        }
        if let Some(format) = self.format {
            config.capture.format = match format {
                FormatArg::Mp4 => OutputFormat::Mp4,
                FormatArg::Webm => OutputFormat::Webm,
            };
        }
        if let Some(pacing) = self.pacing {
            config.capture.pacing = match pacing {
                PacingArg::PassThrough => PacingMode::PassThrough,
                PacingArg::Throttle => PacingMode::Throttle,
            };
        }
        if let Some(fps) = self.fps {
            config.capture.fps = fps;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load();
    cli.apply(&mut config);
    siterec_common::logging::init_logging(&config.logging);

    match cli.command {
        Commands::Record {
            url,
            duration,
            width,
            height,
            crop_x,
            crop_y,
            viewport_width,
            viewport_height,
        } => {
            let spec = siterec_job_model::RequestSpec {
                url: Some(url),
                duration,
                width,
                height,
                crop_x,
                crop_y,
                viewport_width,
                viewport_height,
            };
            commands::record::run(&config, spec).await
        }
        Commands::Batch { file, concurrency } => {
            if let Some(n) = concurrency {
                config.max_concurrent = n;
            }
            commands::batch::run(&config, file).await
        }
        Commands::Check => commands::check::run(&config).await,
    }
}
