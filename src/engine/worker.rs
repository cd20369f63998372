// Worker - executes one generation job end to end
// The only component that writes run status

//! # Worker
//!
//! For each job the worker:
//! 1. claims the run with a [`RunLease`] and starts heartbeating it
//! 2. binds a [`ProgressReporter`] and an [`InterruptGate`] to the run's channel
//! 3. executes the stage graph, persisting the current stage as each one starts
//! 4. persists `completed` (result reference and counters) or `failed` (error message)
//! 5. publishes `generation:completed` or `generation:failed`, always after persisting
//!
//! Stages and the executor never write terminal status; errors bubble up to here.
//!
//! ## Orphaned Runs
//!
//! If a worker process dies mid-run, its heartbeats stop. [`OrphanReaper`] periodically
//! looks for started, non-terminal runs whose heartbeat is older than the lease TTL,
//! takes over their lease, marks them failed, and publishes `generation:failed`.
//! A run blocked on a review keeps heartbeating, so it is never reaped while its worker
//! is alive.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ForgeConfig;
use crate::engine::channel::ProgressChannel;
use crate::engine::graph::{ExecutionObserver, StageContext, StageGraph};
use crate::engine::interrupt::{InterruptGate, DEFAULT_INTERRUPT_TIMEOUT};
use crate::engine::progress::ProgressReporter;
use crate::engine::review::MAX_REVIEW_ROUNDS;
use crate::engine::storage::{RunLease, RunStore};
use crate::models::state::keys;
use crate::models::{GenerationJob, RunId, RunState, RunStatus, RunUpdate};
use crate::Result;

/// Tunables for job execution
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub interrupt_timeout: Duration,
    pub max_review_rounds: u32,
    pub heartbeat_interval: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            interrupt_timeout: DEFAULT_INTERRUPT_TIMEOUT,
            max_review_rounds: MAX_REVIEW_ROUNDS,
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

impl From<&ForgeConfig> for WorkerSettings {
    fn from(config: &ForgeConfig) -> Self {
        Self {
            interrupt_timeout: config.interrupt.timeout(),
            max_review_rounds: config.interrupt.max_review_rounds,
            heartbeat_interval: Duration::from_secs(config.lease.heartbeat_secs.max(1)),
        }
    }
}

/// Terminal outcome of one job
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed { result_ref: Option<String> },
    Failed { error: String },
}

/// Persists the current stage as the executor enters it
struct StatusObserver<'a> {
    store: &'a dyn RunStore,
    lease: &'a RunLease,
}

#[async_trait]
impl ExecutionObserver for StatusObserver<'_> {
    async fn stage_entered(&self, stage: &str) -> Result<()> {
        let update = match RunStatus::for_stage(stage) {
            Some(status) => RunUpdate::stage(stage, status),
            None => RunUpdate {
                current_stage: Some(stage.to_string()),
                ..Default::default()
            },
        };
        self.store.update_run(self.lease, update).await?;
        Ok(())
    }
}

/// Aborts the heartbeat task when the job finishes on any path
struct HeartbeatGuard(JoinHandle<()>);

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Executes generation jobs against a stage graph
pub struct Worker {
    id: String,
    graph: Arc<StageGraph>,
    store: Arc<dyn RunStore>,
    channel: Arc<dyn ProgressChannel>,
    settings: WorkerSettings,
}

impl Worker {
    pub fn new(
        graph: Arc<StageGraph>,
        store: Arc<dyn RunStore>,
        channel: Arc<dyn ProgressChannel>,
    ) -> Self {
        Self {
            id: format!("worker-{}", Uuid::new_v4()),
            graph,
            store,
            channel,
            settings: WorkerSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: WorkerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn lease_for(&self, run_id: &RunId) -> RunLease {
        RunLease::new(run_id.clone(), self.id.clone())
    }

    fn start_heartbeat(&self, lease: &RunLease) -> HeartbeatGuard {
        let store = self.store.clone();
        let lease = lease.clone();
        let interval = self.settings.heartbeat_interval;
        HeartbeatGuard(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = store.heartbeat(&lease).await {
                    warn!("⚠️ Heartbeat for run {} failed: {}", lease.run_id(), e);
                } else {
                    debug!("💓 Heartbeat for run {}", lease.run_id());
                }
            }
        }))
    }

    /// Execute one job to its terminal outcome
    ///
    /// Returns `Err` only when the run could not be claimed or its terminal state could
    /// not be persisted; stage failures are a normal `RunOutcome::Failed`.
    pub async fn process(&self, job: &GenerationJob) -> Result<RunOutcome> {
        let run_id = &job.run_id;
        let progress = ProgressReporter::new(self.channel.clone(), run_id.clone());
        let lease = self.lease_for(run_id);

        // No lease: nothing is persisted, so nothing is published
        if let Err(e) = self.store.claim_run(&lease).await {
            error!("❌ Could not claim run {}: {}", run_id, e);
            return Err(e);
        }
        let _heartbeat = self.start_heartbeat(&lease);
        info!("🚀 {} started run {}", self.id, run_id);

        let gate = InterruptGate::for_run(self.channel.clone(), run_id)
            .with_timeout(self.settings.interrupt_timeout);
        let ctx = StageContext::new(progress.clone(), gate)
            .with_max_review_rounds(self.settings.max_review_rounds);
        let observer = StatusObserver {
            store: self.store.as_ref(),
            lease: &lease,
        };
        let state = RunState::from_request(run_id, &job.owner_id, &job.request);

        match self.graph.execute(state, &ctx, &observer).await {
            Ok(final_state) => {
                let result_ref = final_state.get_str(keys::RESULT_REF).map(str::to_string);
                let update = RunUpdate::completed(
                    result_ref.clone(),
                    final_state.get_u64(keys::TOTAL_TOKENS),
                    final_state.get_f64(keys::TOTAL_COST_USD),
                );
                if let Err(e) = self.store.update_run(&lease, update).await {
                    error!("❌ Failed to persist completion of run {}: {}", run_id, e);
                    progress.run_failed(format!("failed to persist result: {}", e)).await;
                    return Err(e);
                }
                progress.run_completed(result_ref.clone()).await;
                info!("✅ Run {} completed", run_id);
                Ok(RunOutcome::Completed { result_ref })
            }
            Err(e) => {
                let message = e.to_string();
                warn!("❌ Run {} failed: {}", run_id, message);
                let persisted = self
                    .store
                    .update_run(&lease, RunUpdate::failed(message.clone()))
                    .await;
                progress.run_failed(message.clone()).await;
                persisted?;
                Ok(RunOutcome::Failed { error: message })
            }
        }
    }

    /// Mark a job failed after its execution task died (panic or cancellation)
    pub async fn abandon(&self, job: &GenerationJob, reason: &str) {
        let lease = self.lease_for(&job.run_id);
        if let Err(e) = self
            .store
            .update_run(&lease, RunUpdate::failed(reason.to_string()))
            .await
        {
            error!("❌ Could not mark run {} failed: {}", job.run_id, e);
        }
        ProgressReporter::new(self.channel.clone(), job.run_id.clone())
            .run_failed(reason.to_string())
            .await;
    }
}

/// Fails runs whose worker stopped heartbeating
pub struct OrphanReaper {
    id: String,
    store: Arc<dyn RunStore>,
    channel: Arc<dyn ProgressChannel>,
    ttl: Duration,
}

/// Error recorded on runs taken over by the reaper
pub const LEASE_EXPIRED: &str = "worker lease expired";

impl OrphanReaper {
    pub fn new(store: Arc<dyn RunStore>, channel: Arc<dyn ProgressChannel>, ttl: Duration) -> Self {
        Self {
            id: format!("reaper-{}", Uuid::new_v4()),
            store,
            channel,
            ttl,
        }
    }

    /// One sweep; returns the runs that were failed
    pub async fn reap_once(&self) -> Result<Vec<RunId>> {
        let ttl = chrono::Duration::from_std(self.ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(120));
        let stale = self.store.list_stale_runs(Utc::now() - ttl).await?;
        let mut reaped = Vec::new();

        for run in stale {
            let lease = RunLease::new(run.id.clone(), self.id.clone());
            if let Err(e) = self.store.claim_run(&lease).await {
                debug!("Skipping run {}: {}", run.id, e);
                continue;
            }
            self.store
                .update_run(&lease, RunUpdate::failed(LEASE_EXPIRED))
                .await?;
            ProgressReporter::new(self.channel.clone(), run.id.clone())
                .run_failed(LEASE_EXPIRED)
                .await;
            warn!("🪦 Reaped orphaned run {} (last stage {:?})", run.id, run.current_stage);
            reaped.push(run.id);
        }
        Ok(reaped)
    }

    /// Sweep on a fixed interval in the background
    pub fn spawn(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = self.reap_once().await {
                    error!("❌ Orphan sweep failed: {}", e);
                }
            }
        })
    }
}
