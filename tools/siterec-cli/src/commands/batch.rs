//! Record a batch of requests with bounded concurrency.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use siterec_capture_engine::Recorder;
use siterec_common::config::AppConfig;
use siterec_job_model::RequestSpec;
use siterec_scheduler::JobScheduler;

pub async fn run(config: &AppConfig, file: PathBuf) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(&file)
        .with_context(|| format!("failed to read batch file '{}'", file.display()))?;
    let specs: Vec<RequestSpec> = serde_json::from_str(&content)
        .with_context(|| format!("'{}' is not a JSON array of requests", file.display()))?;

    let scheduler = JobScheduler::new(
        Arc::new(Recorder::from_app_config(config)),
        config.max_concurrent,
    );

    let mut rejected = 0usize;
    for (index, spec) in specs.into_iter().enumerate() {
        match scheduler.submit_spec(spec) {
            Ok(id) => tracing::debug!(job_id = id, index, "Batch entry queued"),
            Err(e) => {
                rejected += 1;
                println!("[SKIP] entry {index}: {e}");
            }
        }
    }

    let status = scheduler.status();
    println!(
        "Queued {} recordings ({} running, {} waiting, at most {} at once)",
        status.queued + status.running,
        status.running,
        status.queued,
        scheduler.max_concurrent()
    );
    println!();

    scheduler.wait_idle().await;

    let mut jobs = scheduler.jobs();
    jobs.reverse();
    for job in &jobs {
        super::print_job(job);
    }

    let status = scheduler.status();
    println!();
    println!(
        "{} completed, {} failed, {} rejected",
        status.completed, status.failed, rejected
    );

    if status.failed > 0 || rejected > 0 {
        anyhow::bail!("{} of the batch did not record", status.failed + rejected);
    }
    Ok(())
}
