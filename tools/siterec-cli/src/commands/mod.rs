pub mod batch;
pub mod check;
pub mod record;

use siterec_job_model::{Job, JobStatus};

/// One-line summary of a finished job.
pub fn print_job(job: &Job) {
    match (job.status(), job.output()) {
        (JobStatus::Completed, Some(output)) => println!(
            "[OK]   #{} {} -> {} ({} bytes, {} frames, {} dropped{})",
            job.id(),
            job.request().url(),
            output.path.display(),
            output.size_bytes,
            output.frames_forwarded,
            output.frames_dropped,
            if output.navigation_completed {
                ""
            } else {
                ", page never finished loading"
            }
        ),
        (status, _) => println!(
            "[FAIL] #{} {} {}: {}",
            job.id(),
            job.request().url(),
            status,
            job.error().unwrap_or("no error recorded")
        ),
    }
}
