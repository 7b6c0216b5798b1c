//! Siterec Job Model
//!
//! Defines the data contracts shared by the capture engine and the scheduler:
//! - **Requests:** What to record (URL, duration, output and viewport geometry, crop)
//! - **Jobs:** Lifecycle state of a submitted request (queued, capturing, terminal)
//! - **Naming:** How finished recordings are named on disk
//!
//! Output and viewport dimensions are always even once a request is accepted,
//! since the encoder's chroma-subsampled pixel format requires it.

pub mod job;
pub mod naming;
pub mod request;

pub use job::*;
pub use naming::*;
pub use request::*;
