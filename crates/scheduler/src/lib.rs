//! Siterec Scheduler
//!
//! Accepts recording requests, assigns job ids and runs at most N
//! pipelines at a time. Queued jobs are admitted in submission order as
//! slots free up. Every job ends `completed` or `failed`; a failing or
//! panicking pipeline never disturbs the others.

pub mod runner;
pub mod scheduler;

pub use runner::JobRunner;
pub use scheduler::JobScheduler;
