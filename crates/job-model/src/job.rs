//! Job lifecycle types.
//!
//! A job moves strictly forward through
//! `queued -> capturing -> completed | failed`. Transition methods reject any
//! attempt to reverse or repeat a phase.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use siterec_common::error::{SiterecError, SiterecResult};

use crate::request::RecordingRequest;

/// Scheduler-assigned job identifier. Unique and strictly increasing.
pub type JobId = u64;

/// Lifecycle phase of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Accepted, waiting for a free capture slot.
    Queued,
    /// A pipeline is running for this job.
    Capturing,
    /// Finished with a non-empty output file.
    Completed,
    /// Finished without a usable output file.
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Capturing => "capturing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether the job has reached a final state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a successful pipeline produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingOutput {
    /// Full path of the video file.
    pub path: PathBuf,

    /// File name component of `path`.
    pub file_name: String,

    /// Size of the file in bytes (always non-zero).
    pub size_bytes: u64,

    /// Frames delivered by the browser.
    pub frames_received: u64,

    /// Frames written to the encoder.
    pub frames_forwarded: u64,

    /// Frames acknowledged but discarded.
    pub frames_dropped: u64,

    /// Whether the page finished loading before the navigation timeout.
    pub navigation_completed: bool,
}

/// A submitted recording and its lifecycle state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    id: JobId,
    request: RecordingRequest,
    status: JobStatus,
    /// 0 until completion, then 100.
    progress: u8,
    created_at: DateTime<Utc>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    error: Option<String>,
    output: Option<RecordingOutput>,
}

impl Job {
    /// A freshly queued job.
    pub fn new(id: JobId, request: RecordingRequest) -> Self {
        Self {
            id,
            request,
            status: JobStatus::Queued,
            progress: 0,
            created_at: Utc::now(),
            start_time: None,
            end_time: None,
            error: None,
            output: None,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn request(&self) -> &RecordingRequest {
        &self.request
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn output(&self) -> Option<&RecordingOutput> {
        self.output.as_ref()
    }

    /// `queued -> capturing`.
    pub fn begin_capture(&mut self) -> SiterecResult<()> {
        self.transition(JobStatus::Queued, JobStatus::Capturing)?;
        self.start_time = Some(Utc::now());
        Ok(())
    }

    /// `capturing -> completed`.
    pub fn complete(&mut self, output: RecordingOutput) -> SiterecResult<()> {
        self.transition(JobStatus::Capturing, JobStatus::Completed)?;
        self.end_time = Some(Utc::now());
        self.progress = 100;
        self.output = Some(output);
        Ok(())
    }

    /// `capturing -> failed`.
    pub fn fail(&mut self, message: impl Into<String>) -> SiterecResult<()> {
        self.transition(JobStatus::Capturing, JobStatus::Failed)?;
        self.end_time = Some(Utc::now());
        self.progress = 0;
        self.error = Some(message.into());
        Ok(())
    }

    fn transition(&mut self, expected: JobStatus, next: JobStatus) -> SiterecResult<()> {
        if self.status != expected {
            return Err(SiterecError::JobState {
                id: self.id,
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }
}

/// Per-state job counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}
