//! Job record model and its status state machine.
//!
//! A [`JobRecord`] tracks one submitted unit of asynchronous work from
//! submission through a terminal state. Records live in the scheduler's
//! in-memory table for the lifetime of the process; they are serialized
//! as-is for the polling API layer.

use std::path::PathBuf;

use serde::Serialize;

use crate::payload::JobPayload;
use crate::types::{JobId, Timestamp};

/// Metadata key on a research job pointing at its auto-submitted
/// paper-generation follow-up.
pub const META_PAPER_JOB_ID: &str = "paper_job_id";

/// Metadata key on a paper-generation job pointing back at the research
/// job that spawned it.
pub const META_PARENT_JOB_ID: &str = "parent_job_id";

/// Lifecycle status of a job.
///
/// `Pending -> Running -> {Succeeded, Failed, Cancelled}`, plus the
/// shortcut `Pending -> Cancelled` when a job is cancelled before the
/// worker picks it up. Terminal states never transition again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// True once the job can no longer change state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// Structured progress sub-record.
///
/// Updated by external observers that tail the per-job log stream; the
/// scheduler itself only initializes it to its zero value.
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobProgress {
    /// Name of the agent currently driving the job, if known.
    pub current_agent: Option<String>,
    /// Human-readable description of the current step.
    pub current_step: Option<String>,
    /// Ordered sub-task checklist.
    pub subtasks: Vec<Subtask>,
    /// Rough ETA in seconds, when an observer can estimate one.
    pub estimated_time_remaining_secs: Option<u64>,
}

/// One entry in the progress checklist.
#[derive(Debug, Clone, Serialize)]
pub struct Subtask {
    pub name: String,
    pub status: SubtaskStatus,
}

/// Status of a single sub-task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

/// Token accounting for one job, accumulated by the runner.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    /// Fold another round of usage into the counters.
    pub fn add(&mut self, prompt: u64, completion: u64) {
        self.prompt_tokens += prompt;
        self.completion_tokens += completion;
        self.total_tokens += prompt + completion;
    }
}

/// One submitted unit of work and everything the polling API exposes
/// about it.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: JobId,
    pub status: JobStatus,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
    /// Caller-supplied input, immutable after submission.
    pub payload: JobPayload,
    /// Set at most once, false -> true. Cancellation is cooperative: a
    /// running job is never interrupted, only finalized as cancelled.
    pub cancel_requested: bool,
    /// Structured output, set only on success.
    pub result: Option<serde_json::Value>,
    /// Failure reason, set on failure (and on cancellation during
    /// execution, as an explanatory note).
    pub error: Option<String>,
    /// Dedicated append-only log sink, created at submission.
    pub log_file: PathBuf,
    pub progress: JobProgress,
    pub token_usage: TokenUsage,
    /// Free-form links between related jobs (parent/follow-up ids).
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl JobRecord {
    /// Create a fresh pending record.
    pub fn new(id: JobId, payload: JobPayload, log_file: PathBuf, created_at: Timestamp) -> Self {
        Self {
            id,
            status: JobStatus::Pending,
            created_at,
            started_at: None,
            finished_at: None,
            payload,
            cancel_requested: false,
            result: None,
            error: None,
            log_file,
            progress: JobProgress::default(),
            token_usage: TokenUsage::default(),
            metadata: serde_json::Map::new(),
        }
    }
}
