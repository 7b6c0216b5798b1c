//! The seam between the scheduler and whatever performs a recording.

use async_trait::async_trait;
use siterec_capture_engine::Recorder;
use siterec_common::error::SiterecResult;
use siterec_job_model::{JobId, RecordingOutput, RecordingRequest};

/// Runs one admitted job to completion.
///
/// An `Err` marks the job failed with the error's message.
#[async_trait]
pub trait JobRunner: Send + Sync + 'static {
    async fn run(&self, id: JobId, request: &RecordingRequest) -> SiterecResult<RecordingOutput>;
}

#[async_trait]
impl JobRunner for Recorder {
    async fn run(&self, id: JobId, request: &RecordingRequest) -> SiterecResult<RecordingOutput> {
        self.record(id, request).await
    }
}
