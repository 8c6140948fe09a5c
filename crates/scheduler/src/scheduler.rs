//! Job table, submission surface, and cancellation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use sagelab_core::job::JobRecord;
use sagelab_core::job::JobStatus;
use sagelab_core::payload::JobPayload;
use sagelab_core::types::JobId;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::runner::JobRunner;
use crate::worker;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Directory per-job log files are created under.
    pub log_root: PathBuf,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            log_root: PathBuf::from("logs/jobs"),
        }
    }
}

impl SchedulerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var               | Default     |
    /// |-----------------------|-------------|
    /// | `SAGELAB_JOB_LOG_DIR` | `logs/jobs` |
    pub fn from_env() -> Self {
        let log_root = std::env::var("SAGELAB_JOB_LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("logs/jobs"));
        Self { log_root }
    }
}

/// Errors from the submission surface.
///
/// Submission has exactly one plausible failure: the per-job log sink
/// cannot be created. Everything else about a job's outcome is reported
/// through the record's `status`/`error` fields.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("failed to create job log sink: {0}")]
    LogSink(#[from] std::io::Error),

    #[error("scheduler is shut down")]
    ShutDown,
}

/// State shared between the public handle, the worker task, and
/// fire-and-forget follow-up submissions.
pub(crate) struct Shared {
    /// The job table. All record reads and writes go through this lock;
    /// it is held only for bounded bookkeeping, never across the runner.
    pub(crate) jobs: Mutex<HashMap<JobId, JobRecord>>,
    queue_tx: mpsc::UnboundedSender<JobId>,
    pub(crate) runner: Arc<dyn JobRunner>,
    log_root: PathBuf,
    pub(crate) cancel: CancellationToken,
}

impl Shared {
    /// Insert a pending record and enqueue its id. Shared by the public
    /// `submit` and the chained paper-generation submission.
    pub(crate) async fn submit(self: &Arc<Self>, payload: JobPayload) -> Result<JobRecord, SchedulerError> {
        let id = JobId::new_v4();
        let log_file = self.create_log_sink(id).await?;
        let record = JobRecord::new(id, payload, log_file, chrono::Utc::now());

        self.jobs.lock().await.insert(id, record.clone());
        self.queue_tx
            .send(id)
            .map_err(|_| SchedulerError::ShutDown)?;

        tracing::info!(job_id = %id, mode = ?record.payload.mode, "Job submitted");
        Ok(record)
    }

    /// Create the job's dedicated append-only log file eagerly, so the
    /// log-tailing surface has something to point at from the moment
    /// the job exists.
    async fn create_log_sink(&self, id: JobId) -> Result<PathBuf, SchedulerError> {
        tokio::fs::create_dir_all(&self.log_root).await?;
        let path = self.log_root.join(format!("job_{id}.log"));
        tokio::fs::File::create(&path).await?;
        Ok(std::path::absolute(&path).unwrap_or(path))
    }
}

/// Accumulates token usage onto one job's record.
///
/// Handed to the runner inside [`crate::JobContext`]; cheap to clone.
#[derive(Clone)]
pub struct TokenUsageHandle {
    shared: Arc<Shared>,
    job_id: JobId,
}

impl TokenUsageHandle {
    pub(crate) fn new(shared: Arc<Shared>, job_id: JobId) -> Self {
        Self { shared, job_id }
    }

    /// Fold one round of prompt/completion usage into the record.
    pub async fn add(&self, prompt_tokens: u64, completion_tokens: u64) {
        let mut jobs = self.shared.jobs.lock().await;
        if let Some(job) = jobs.get_mut(&self.job_id) {
            job.token_usage.add(prompt_tokens, completion_tokens);
        }
    }
}

/// The public scheduler handle.
///
/// Creating one spawns the single background worker task; dropping it
/// without [`shutdown`](Self::shutdown) leaves the worker running until
/// the runtime stops, matching a process-lifetime scheduler.
pub struct JobScheduler {
    shared: Arc<Shared>,
    worker: tokio::task::JoinHandle<()>,
}

impl JobScheduler {
    /// Start a scheduler driving jobs through `runner`.
    pub fn new(runner: Arc<dyn JobRunner>, config: SchedulerConfig) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            jobs: Mutex::new(HashMap::new()),
            queue_tx,
            runner,
            log_root: config.log_root,
            cancel: CancellationToken::new(),
        });

        let worker = tokio::spawn(worker::run(Arc::clone(&shared), queue_rx));
        Self { shared, worker }
    }

    /// Submit a payload. Non-blocking: the returned record is a
    /// snapshot of the freshly inserted `pending` job.
    pub async fn submit(&self, payload: JobPayload) -> Result<JobRecord, SchedulerError> {
        self.shared.submit(payload).await
    }

    /// Point-in-time snapshot of one record.
    pub async fn get(&self, id: JobId) -> Option<JobRecord> {
        self.shared.jobs.lock().await.get(&id).cloned()
    }

    /// Request cancellation.
    ///
    /// Returns `false` for unknown ids and jobs already in a terminal
    /// state. A pending job is cancelled immediately and will never
    /// run; a running job only gets the advisory flag — the worker
    /// honors it when the runner returns.
    pub async fn cancel(&self, id: JobId) -> bool {
        let mut jobs = self.shared.jobs.lock().await;
        let Some(job) = jobs.get_mut(&id) else {
            return false;
        };
        if job.status.is_terminal() {
            return false;
        }

        job.cancel_requested = true;
        if job.status == JobStatus::Pending {
            job.status = JobStatus::Cancelled;
            job.finished_at = Some(chrono::Utc::now());
            tracing::info!(job_id = %id, "Pending job cancelled");
        } else {
            tracing::info!(job_id = %id, "Cancellation requested for running job");
        }
        true
    }

    /// Snapshot of every record, oldest first.
    pub async fn list(&self) -> Vec<JobRecord> {
        let jobs = self.shared.jobs.lock().await;
        let mut records: Vec<JobRecord> = jobs.values().cloned().collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    /// Stop the worker task. In-flight work is not interrupted; the
    /// worker exits after its current job finalizes.
    pub async fn shutdown(self) {
        self.shared.cancel.cancel();
        if tokio::time::timeout(std::time::Duration::from_secs(5), self.worker)
            .await
            .is_err()
        {
            tracing::warn!("Worker did not exit within 5s; detaching");
        }
    }
}
