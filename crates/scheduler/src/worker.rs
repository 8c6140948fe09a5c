//! The single background worker loop.
//!
//! Dequeues job ids in FIFO order and executes them one at a time. The
//! table lock is held only for the bookkeeping transitions on either
//! side of the runner call, never across it. A failing (or even
//! panicking) runner finalizes its own job and the loop moves on.

use std::sync::Arc;

use sagelab_core::job::{JobStatus, META_PAPER_JOB_ID, META_PARENT_JOB_ID};
use sagelab_core::payload::{JobMode, JobPayload};
use sagelab_core::types::JobId;
use tokio::sync::mpsc;

use crate::runner::JobContext;
use crate::scheduler::{Shared, TokenUsageHandle};

/// Worker loop, spawned once per scheduler.
pub(crate) async fn run(shared: Arc<Shared>, mut queue_rx: mpsc::UnboundedReceiver<JobId>) {
    tracing::info!("Job worker started");
    loop {
        let job_id = tokio::select! {
            _ = shared.cancel.cancelled() => {
                tracing::info!("Job worker shutting down");
                return;
            }
            id = queue_rx.recv() => match id {
                Some(id) => id,
                // All senders dropped; nothing more will ever arrive.
                None => return,
            },
        };

        process_one(&shared, job_id).await;
    }
}

/// Execute one dequeued job end to end.
async fn process_one(shared: &Arc<Shared>, job_id: JobId) {
    // Re-check under the lock and transition to running. A job that was
    // cancelled while pending (or somehow re-enqueued) is skipped here.
    let ctx = {
        let mut jobs = shared.jobs.lock().await;
        let Some(job) = jobs.get_mut(&job_id) else {
            tracing::warn!(job_id = %job_id, "Dequeued unknown job id, skipping");
            return;
        };
        if job.status != JobStatus::Pending {
            tracing::debug!(job_id = %job_id, status = ?job.status, "Skipping non-pending job");
            return;
        }
        job.status = JobStatus::Running;
        job.started_at = Some(chrono::Utc::now());

        JobContext {
            job_id,
            payload: job.payload.clone(),
            log_file: job.log_file.clone(),
            tokens: TokenUsageHandle::new(Arc::clone(shared), job_id),
        }
    };

    tracing::info!(job_id = %job_id, "Job started");

    // Run in a spawned task so a panicking runner surfaces as a
    // JoinError instead of taking the worker loop down with it.
    let runner = Arc::clone(&shared.runner);
    let outcome = match tokio::spawn(async move { runner.run(ctx).await }).await {
        Ok(result) => result.map_err(|e| format!("{e:#}")),
        Err(join_err) => Err(format!("runner panicked: {join_err}")),
    };

    finalize(shared, job_id, outcome).await;
}

/// Record the terminal state for `job_id`. `finished_at` is stamped on
/// every path through here.
async fn finalize(shared: &Arc<Shared>, job_id: JobId, outcome: Result<serde_json::Value, String>) {
    let chain_payload = {
        let mut jobs = shared.jobs.lock().await;
        let Some(job) = jobs.get_mut(&job_id) else {
            return;
        };

        let mut chain = None;
        match outcome {
            Ok(value) => {
                if job.cancel_requested {
                    job.status = JobStatus::Cancelled;
                    job.error = Some("job cancelled during execution".into());
                    tracing::info!(job_id = %job_id, "Job cancelled during execution");
                } else {
                    job.result = Some(extract_result(value));
                    job.status = JobStatus::Succeeded;
                    tracing::info!(job_id = %job_id, "Job succeeded");
                    if job.payload.mode.chains_paper_generation() {
                        chain = Some(JobPayload {
                            question: job.payload.question.clone(),
                            reference: job.payload.reference.clone(),
                            mode: JobMode::PaperGeneration,
                        });
                    }
                }
            }
            Err(message) => {
                // A racing cancellation wins over the failure report.
                if job.status != JobStatus::Cancelled {
                    tracing::warn!(job_id = %job_id, error = %message, "Job failed");
                    job.error = Some(message);
                    job.status = JobStatus::Failed;
                }
            }
        }
        job.finished_at = Some(chrono::Utc::now());
        chain
    };

    if let Some(payload) = chain_payload {
        spawn_paper_generation(Arc::clone(shared), job_id, payload);
    }
}

/// Fire-and-forget follow-up: research jobs that succeed automatically
/// submit a paper-generation job. Runs in its own task so it never
/// blocks the worker loop, and its failure never touches the parent
/// record beyond a log line.
fn spawn_paper_generation(shared: Arc<Shared>, parent_id: JobId, payload: JobPayload) {
    tokio::spawn(async move {
        match shared.submit(payload).await {
            Ok(paper) => {
                let mut jobs = shared.jobs.lock().await;
                if let Some(record) = jobs.get_mut(&paper.id) {
                    record
                        .metadata
                        .insert(META_PARENT_JOB_ID.into(), parent_id.to_string().into());
                }
                if let Some(parent) = jobs.get_mut(&parent_id) {
                    parent
                        .metadata
                        .insert(META_PAPER_JOB_ID.into(), paper.id.to_string().into());
                }
                tracing::info!(
                    parent_job_id = %parent_id,
                    paper_job_id = %paper.id,
                    "Submitted paper-generation follow-up",
                );
            }
            Err(e) => {
                tracing::warn!(
                    parent_job_id = %parent_id,
                    error = %e,
                    "Failed to submit paper-generation follow-up",
                );
            }
        }
    });
}

/// Pull the job output out of the runner's return value.
///
/// Runners return `{"result": {...}}`; the inner object becomes the
/// record's `result`. Anything else is wrapped so the polling surface
/// always sees an object with an `answer` field.
fn extract_result(value: serde_json::Value) -> serde_json::Value {
    match value.get("result") {
        Some(serde_json::Value::Object(map)) => serde_json::Value::Object(map.clone()),
        Some(serde_json::Value::Null) | None => {
            serde_json::json!({ "answer": "No result returned" })
        }
        Some(serde_json::Value::String(text)) => serde_json::json!({ "answer": text }),
        Some(other) => serde_json::json!({ "answer": other.to_string() }),
    }
}
