//! Error types shared across Siterec crates.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type for Siterec operations.
#[derive(Debug, thiserror::Error)]
pub enum SiterecError {
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Browser launch failed: {message}")]
    Launch { message: String },

    #[error("Navigation failed: {message}")]
    Navigation { message: String },

    #[error("Browser transport error: {message}")]
    Transport { message: String },

    #[error("CDP error {code}: {message}")]
    Cdp { code: i64, message: String },

    #[error("{operation} timed out after {duration:?}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    #[error("Encoder error: {message}")]
    Encoder { message: String },

    #[error("Encoder exited with {status}: {stderr}")]
    EncoderExit { status: String, stderr: String },

    #[error("Encoder did not finish within {duration:?}; process killed")]
    EncoderTimeout { duration: Duration },

    #[error("Empty output at {path}. Captured {frames} frames but no video generated")]
    EmptyOutput { path: PathBuf, frames: u64 },

    #[error("Job {id} cannot move from {from} to {to}")]
    JobState { id: u64, from: String, to: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias using SiterecError.
pub type SiterecResult<T> = Result<T, SiterecError>;

impl SiterecError {
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: msg.into(),
        }
    }

    pub fn launch(msg: impl Into<String>) -> Self {
        Self::Launch {
            message: msg.into(),
        }
    }

    pub fn navigation(msg: impl Into<String>) -> Self {
        Self::Navigation {
            message: msg.into(),
        }
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport {
            message: msg.into(),
        }
    }

    pub fn encoder(msg: impl Into<String>) -> Self {
        Self::Encoder {
            message: msg.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }
}
