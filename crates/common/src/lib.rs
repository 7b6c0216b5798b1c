//! Siterec Common Utilities
//!
//! Shared infrastructure for all Siterec crates:
//! - Error types and result aliases
//! - Clock and frame pacing utilities for capture timing
//! - Tracing/logging initialization
//! - Configuration loading

pub mod clock;
pub mod config;
pub mod error;
pub mod logging;

pub use clock::*;
pub use config::*;
pub use error::*;
