//! Check for a usable browser and encoder.

use siterec_capture_engine::browser::browser_candidates;
use siterec_capture_engine::is_encoder_available;
use siterec_common::config::{config_file_path, AppConfig};

pub async fn run(config: &AppConfig) -> anyhow::Result<()> {
    println!("Siterec System Check");
    println!("{}", "=".repeat(50));

    let config_path = config_file_path();
    if config_path.exists() {
        println!("[OK]   Config: {}", config_path.display());
    } else {
        println!("[INFO] Config: defaults ({} not found)", config_path.display());
    }
    println!("       Output directory: {}", config.output_dir.display());
    println!("       Max concurrent recordings: {}", config.max_concurrent);

    let ffmpeg = &config.capture.ffmpeg_path;
    let encoder_ok = is_encoder_available(ffmpeg).await;
    if encoder_ok {
        println!("[OK]   Encoder: {}", ffmpeg.display());
    } else {
        println!("[FAIL] Encoder: '{}' did not run", ffmpeg.display());
    }

    let candidates = browser_candidates(config.capture.browser_path.as_deref());
    let found = candidates.iter().find(|path| {
        (path.is_absolute() && path.exists())
            || std::env::var_os("PATH").is_some_and(|paths| {
                std::env::split_paths(&paths).any(|dir| dir.join(path).is_file())
            })
    });
    let browser_ok = match found {
        Some(path) => {
            println!("[OK]   Browser: {}", path.display());
            true
        }
        None => {
            println!("[FAIL] Browser: none of {} candidates found", candidates.len());
            println!("       Set CHROME_PATH or capture.browser_path in the config");
            false
        }
    };

    println!();
    if encoder_ok && browser_ok {
        println!("Siterec is ready to record.");
        Ok(())
    } else {
        anyhow::bail!("required tools are missing")
    }
}
