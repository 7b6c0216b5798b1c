//! Record a single page.

use std::sync::Arc;

use anyhow::Context as _;
use siterec_capture_engine::Recorder;
use siterec_common::config::AppConfig;
use siterec_job_model::{JobStatus, RequestSpec};
use siterec_scheduler::JobScheduler;

pub async fn run(config: &AppConfig, spec: RequestSpec) -> anyhow::Result<()> {
    let scheduler = JobScheduler::new(Arc::new(Recorder::from_app_config(config)), 1);
    let id = scheduler.submit_spec(spec)?;

    let job = scheduler.job(id).context("submitted job disappeared")?;
    let request = job.request();
    println!("Recording {}", request.url());
    println!("  Duration: {} ms", request.duration_ms());
    println!(
        "  Output:   {}x{} from a {}x{} viewport",
        request.width(),
        request.height(),
        request.viewport_width(),
        request.viewport_height()
    );
    println!("  Format:   {}", config.capture.format.extension());
    println!("  Saving to {}", config.output_dir.display());
    println!();

    let job = scheduler
        .wait_for(id)
        .await
        .context("submitted job disappeared")?;
    super::print_job(&job);

    if job.status() == JobStatus::Completed {
        Ok(())
    } else {
        anyhow::bail!("recording failed")
    }
}
