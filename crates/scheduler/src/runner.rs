//! The runner seam: the external function that does a job's actual work.

use std::path::PathBuf;

use async_trait::async_trait;
use sagelab_core::payload::JobPayload;
use sagelab_core::types::JobId;

use crate::scheduler::TokenUsageHandle;

/// Everything a runner invocation gets about its job.
///
/// The context replaces any process-wide routing state: the log sink
/// path and token accounting travel with the job, so nothing can leak
/// between consecutive jobs.
pub struct JobContext {
    pub job_id: JobId,
    pub payload: JobPayload,
    /// Dedicated append-only log sink for this job. The runner owns the
    /// file for the duration of the call; nothing else writes to it.
    pub log_file: PathBuf,
    /// Accumulates prompt/completion token counts onto the job record.
    pub tokens: TokenUsageHandle,
}

/// Performs the actual work for one job.
///
/// Invoked by the worker with no lock held; may block on network I/O
/// for as long as it needs. Any returned error becomes the job's
/// failure reason. A typical implementation provisions or reuses a
/// sandbox container and drives it over the command channel.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Run the job to completion.
    ///
    /// The returned value is expected to carry the job output under a
    /// top-level `"result"` key; anything else is wrapped by the
    /// worker's fallback extraction.
    async fn run(&self, ctx: JobContext) -> anyhow::Result<serde_json::Value>;
}
