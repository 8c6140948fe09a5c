//! Single-worker job scheduler.
//!
//! [`JobScheduler`] accepts submissions from arbitrarily many
//! concurrent callers, tracks every job in an in-memory table, and runs
//! them strictly one at a time on a single background worker task. One
//! job at a time is an admission-control decision: the sandbox the
//! runner executes against is not safely shareable across concurrent
//! jobs.
//!
//! Job state never persists across process restarts and records are
//! never deleted; the external API layer reads them through
//! [`JobScheduler::get`] / [`JobScheduler::list`] for polling.

mod runner;
mod scheduler;
mod worker;

pub use runner::{JobContext, JobRunner};
pub use scheduler::{
    JobScheduler, SchedulerConfig, SchedulerError, TokenUsageHandle,
};
