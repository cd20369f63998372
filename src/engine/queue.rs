// Job queue and worker pool
// Idempotent enqueue keyed by run id, bounded concurrency, no automatic retries

//! # Job Queue & Worker Pool
//!
//! ## Queue
//!
//! [`JobQueue::enqueue`] uses the run id as the job id. While a record for that id is
//! retained (queued, running, or recently finished) a second enqueue is a no-op that
//! reports [`EnqueueOutcome::Duplicate`]. Every job gets exactly one attempt.
//!
//! Finished records are kept for observability and discarded by a periodic sweep:
//! completed jobs after 24 hours, failed jobs after 7 days (configurable).
//!
//! ## Pool
//!
//! [`WorkerPool`] pulls jobs in FIFO order and runs at most `concurrency` of them at a
//! time. Each job runs in its own task, so a panicking job becomes a failed run instead
//! of taking the dispatcher down.
//!
//! [`WorkerPool::shutdown`] stops intake and gives in-flight jobs a grace period. Jobs
//! still running when it elapses (typically parked at a review) are cancelled and
//! their runs failed with [`SHUTDOWN_CANCELLED`].
//!
//! ## Rust Learning Notes:
//!
//! ### Semaphores for Bounded Concurrency
//! The dispatcher acquires an owned semaphore permit before taking the next job and
//! moves the permit into the job's task. Dropping the permit when the task ends frees
//! the slot. Shutdown waits for in-flight jobs by acquiring every permit at once.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::config::QueueSettings;
use crate::engine::worker::{RunOutcome, Worker};
use crate::models::{GenerationJob, RunId};
use crate::{ForgeError, Result};

/// Automatic attempts per job
pub const MAX_ATTEMPTS: u32 = 1;

/// Error recorded on runs cancelled when the pool shut down
pub const SHUTDOWN_CANCELLED: &str = "worker shut down before the run finished";

/// Abort handles of running executions, keyed by run
type InFlight = Arc<Mutex<HashMap<RunId, AbortHandle>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_finished(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// Bookkeeping for one job
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRecord {
    pub job_id: RunId,
    pub state: JobState,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    Duplicate(JobState),
}

/// How long finished records are kept
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub completed: Duration,
    pub failed: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            completed: Duration::from_secs(24 * 60 * 60),
            failed: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

impl From<&QueueSettings> for RetentionPolicy {
    fn from(settings: &QueueSettings) -> Self {
        Self {
            completed: Duration::from_secs(settings.completed_retention_secs),
            failed: Duration::from_secs(settings.failed_retention_secs),
        }
    }
}

/// Receiving end handed to the worker pool
pub struct JobReceiver(mpsc::UnboundedReceiver<GenerationJob>);

struct QueueInner {
    records: Mutex<HashMap<RunId, JobRecord>>,
    sender: mpsc::UnboundedSender<GenerationJob>,
    retention: RetentionPolicy,
}

/// Idempotent FIFO job queue
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<QueueInner>,
}

impl JobQueue {
    pub fn new(retention: RetentionPolicy) -> (Self, JobReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let queue = Self {
            inner: Arc::new(QueueInner {
                records: Mutex::new(HashMap::new()),
                sender,
                retention,
            }),
        };
        (queue, JobReceiver(receiver))
    }

    fn records(&self) -> Result<std::sync::MutexGuard<'_, HashMap<RunId, JobRecord>>> {
        self.inner
            .records
            .lock()
            .map_err(|_| ForgeError::Internal("job queue lock poisoned".to_string()))
    }

    /// Add a job unless one with the same run id is still retained
    pub fn enqueue(&self, job: GenerationJob) -> Result<EnqueueOutcome> {
        let mut records = self.records()?;
        if let Some(existing) = records.get(&job.run_id) {
            debug!("Duplicate enqueue for {} ({:?})", job.run_id, existing.state);
            return Ok(EnqueueOutcome::Duplicate(existing.state));
        }

        let run_id = job.run_id.clone();
        self.inner
            .sender
            .send(job)
            .map_err(|_| ForgeError::QueueClosed)?;
        records.insert(
            run_id.clone(),
            JobRecord {
                job_id: run_id.clone(),
                state: JobState::Queued,
                attempts_made: 0,
                max_attempts: MAX_ATTEMPTS,
                enqueued_at: Utc::now(),
                started_at: None,
                finished_at: None,
                error: None,
            },
        );
        info!("📥 Enqueued run {}", run_id);
        Ok(EnqueueOutcome::Enqueued)
    }

    pub fn get(&self, job_id: &RunId) -> Option<JobRecord> {
        self.records().ok()?.get(job_id).cloned()
    }

    /// Number of retained records in a state
    pub fn count(&self, state: JobState) -> usize {
        self.records()
            .map(|records| records.values().filter(|r| r.state == state).count())
            .unwrap_or(0)
    }

    pub(crate) fn mark_running(&self, job_id: &RunId) {
        if let Ok(mut records) = self.records() {
            if let Some(record) = records.get_mut(job_id) {
                record.state = JobState::Running;
                record.attempts_made += 1;
                record.started_at = Some(Utc::now());
            }
        }
    }

    pub(crate) fn mark_finished(&self, job_id: &RunId, outcome: std::result::Result<(), String>) {
        if let Ok(mut records) = self.records() {
            if let Some(record) = records.get_mut(job_id) {
                record.finished_at = Some(Utc::now());
                match outcome {
                    Ok(()) => record.state = JobState::Completed,
                    Err(error) => {
                        record.state = JobState::Failed;
                        record.error = Some(error);
                    }
                }
            }
        }
    }

    /// Drop finished records older than their retention window
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let retention = self.inner.retention;
        let Ok(mut records) = self.records() else {
            return 0;
        };
        let before = records.len();
        records.retain(|_, record| {
            let keep_for = match record.state {
                JobState::Completed => retention.completed,
                JobState::Failed => retention.failed,
                JobState::Queued | JobState::Running => return true,
            };
            let keep_for = chrono::Duration::from_std(keep_for).unwrap_or(chrono::Duration::MAX);
            record
                .finished_at
                .map_or(true, |finished| now.signed_duration_since(finished) < keep_for)
        });
        before - records.len()
    }

    /// Prune on a fixed interval in the background
    pub fn spawn_retention_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let removed = queue.prune(Utc::now());
                if removed > 0 {
                    debug!("🧹 Pruned {} finished job records", removed);
                }
            }
        })
    }
}

/// Fixed-size pool executing queued jobs
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    dispatcher: JoinHandle<()>,
    in_flight: InFlight,
}

impl WorkerPool {
    pub fn start(queue: JobQueue, receiver: JobReceiver, worker: Arc<Worker>, concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let in_flight = InFlight::default();
        let dispatcher = tokio::spawn(dispatch(
            queue,
            receiver,
            worker,
            concurrency,
            shutdown_rx,
            in_flight.clone(),
        ));
        info!("👷 Worker pool started with concurrency {}", concurrency);
        Self {
            shutdown,
            dispatcher,
            in_flight,
        }
    }

    /// Number of jobs currently executing
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().map(|jobs| jobs.len()).unwrap_or(0)
    }

    /// Stop taking jobs, wait up to `grace` for in-flight jobs, then cancel the rest
    pub async fn shutdown(mut self, grace: Duration) {
        let _ = self.shutdown.send(true);
        let joined = match tokio::time::timeout(grace, &mut self.dispatcher).await {
            Ok(joined) => joined,
            Err(_) => {
                let cancelled = self.cancel_in_flight();
                warn!(
                    "⏱️ Shutdown grace of {:?} elapsed, cancelled {} in-flight job(s)",
                    grace, cancelled
                );
                self.dispatcher.await
            }
        };
        if let Err(e) = joined {
            error!("❌ Worker pool dispatcher ended abnormally: {}", e);
        }
        info!("👋 Worker pool stopped");
    }

    fn cancel_in_flight(&self) -> usize {
        let Ok(jobs) = self.in_flight.lock() else {
            return 0;
        };
        for (run_id, handle) in jobs.iter() {
            debug!("Cancelling run {}", run_id);
            handle.abort();
        }
        jobs.len()
    }
}

async fn dispatch(
    queue: JobQueue,
    mut receiver: JobReceiver,
    worker: Arc<Worker>,
    concurrency: usize,
    mut shutdown: watch::Receiver<bool>,
    in_flight: InFlight,
) {
    let slots = Arc::new(Semaphore::new(concurrency));

    loop {
        let permit = tokio::select! {
            permit = slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = shutdown.changed() => break,
        };
        let job = tokio::select! {
            job = receiver.0.recv() => match job {
                Some(job) => job,
                None => break,
            },
            _ = shutdown.changed() => break,
        };

        queue.mark_running(&job.run_id);
        let execution = {
            let worker = worker.clone();
            let job = job.clone();
            tokio::spawn(async move { worker.process(&job).await })
        };
        if let Ok(mut jobs) = in_flight.lock() {
            jobs.insert(job.run_id.clone(), execution.abort_handle());
        }

        let queue = queue.clone();
        let worker = worker.clone();
        let in_flight = in_flight.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let outcome = match execution.await {
                Ok(Ok(RunOutcome::Completed { .. })) => Ok(()),
                Ok(Ok(RunOutcome::Failed { error })) => Err(error),
                Ok(Err(e)) => Err(e.to_string()),
                Err(join_error) => {
                    let reason = if join_error.is_panic() {
                        "worker panicked"
                    } else {
                        SHUTDOWN_CANCELLED
                    };
                    error!("💥 Run {} aborted: {}", job.run_id, reason);
                    worker.abandon(&job, reason).await;
                    Err(reason.to_string())
                }
            };
            if let Ok(mut jobs) = in_flight.lock() {
                jobs.remove(&job.run_id);
            }
            queue.mark_finished(&job.run_id, outcome);
        });
    }

    // Wait for every in-flight job to release its slot
    let _ = slots.acquire_many(concurrency as u32).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::GenerationRequest;

    fn job(id: &str) -> GenerationJob {
        GenerationJob::new(RunId::parse(id).unwrap(), "owner", GenerationRequest::new("topic"))
    }

    #[test]
    fn test_duplicate_enqueue_is_noop() {
        let (queue, mut receiver) = JobQueue::new(RetentionPolicy::default());
        assert_eq!(queue.enqueue(job("r1")).unwrap(), EnqueueOutcome::Enqueued);
        assert_eq!(
            queue.enqueue(job("r1")).unwrap(),
            EnqueueOutcome::Duplicate(JobState::Queued)
        );
        assert!(receiver.0.try_recv().is_ok());
        assert!(receiver.0.try_recv().is_err());
    }

    #[test]
    fn test_records_track_single_attempt() {
        let (queue, _receiver) = JobQueue::new(RetentionPolicy::default());
        let run_id = RunId::parse("r2").unwrap();
        queue.enqueue(job("r2")).unwrap();
        queue.mark_running(&run_id);
        queue.mark_finished(&run_id, Err("stage failed".into()));

        let record = queue.get(&run_id).unwrap();
        assert_eq!(record.state, JobState::Failed);
        assert_eq!(record.attempts_made, 1);
        assert_eq!(record.max_attempts, 1);
        assert_eq!(record.error.as_deref(), Some("stage failed"));
        assert_eq!(
            queue.enqueue(job("r2")).unwrap(),
            EnqueueOutcome::Duplicate(JobState::Failed)
        );
    }

    #[test]
    fn test_prune_respects_retention_per_state() {
        let (queue, _receiver) = JobQueue::new(RetentionPolicy {
            completed: Duration::from_secs(60),
            failed: Duration::from_secs(600),
        });
        for id in ["done", "broken", "waiting"] {
            queue.enqueue(job(id)).unwrap();
        }
        let done = RunId::parse("done").unwrap();
        let broken = RunId::parse("broken").unwrap();
        queue.mark_finished(&done, Ok(()));
        queue.mark_finished(&broken, Err("x".into()));

        let later = Utc::now() + chrono::Duration::seconds(120);
        assert_eq!(queue.prune(later), 1);
        assert!(queue.get(&done).is_none());
        assert!(queue.get(&broken).is_some());
        assert_eq!(queue.count(JobState::Queued), 1);

        // Once pruned, the id can be enqueued again
        assert_eq!(queue.enqueue(job("done")).unwrap(), EnqueueOutcome::Enqueued);
    }
}
