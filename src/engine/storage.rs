// Storage abstraction for runs and finished articles
// This defines the persistence contracts the worker writes through

//! # Storage Abstraction Layer
//!
//! Two collaborators live here:
//! - [`RunStore`]: the durable summary of each run (status, counters, result, error)
//! - [`ArticleSink`]: where the assembled article ends up
//!
//! ## Single Writer
//!
//! Every write to a run goes through a [`RunLease`]. Leases can only be minted inside
//! the engine, by the worker that executes the run (or by the orphan reaper when it
//! takes over a dead worker's run). A store rejects writes whose lease holder does not
//! match the holder it recorded in [`RunStore::claim_run`], so a stale worker cannot
//! overwrite a run that has been reclaimed.
//!
//! ## Rust Learning Notes:
//!
//! ### Restricted Constructors
//! `RunLease::new` is `pub(crate)`. Code outside the crate can receive, clone, and pass
//! leases along, but cannot forge one. The type system carries the ownership rule.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{Run, RunId, RunStatus, RunUpdate};
use crate::{ForgeError, Result};

/// Proof of write ownership over one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLease {
    run_id: RunId,
    holder: String,
}

impl RunLease {
    pub(crate) fn new(run_id: RunId, holder: impl Into<String>) -> Self {
        Self {
            run_id,
            holder: holder.into(),
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }
}

/// Persistence of run summaries
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Store a new run; fails if the id is taken
    async fn create_run(&self, run: Run) -> Result<Run>;

    /// Get a run by id; `Ok(None)` when it does not exist
    async fn get_run(&self, id: &RunId) -> Result<Option<Run>>;

    /// Runs newest first, optionally restricted to one owner
    async fn list_runs(&self, owner_id: Option<&str>) -> Result<Vec<Run>>;

    /// Record the lease holder and start its heartbeat; terminal runs cannot be claimed
    async fn claim_run(&self, lease: &RunLease) -> Result<()>;

    /// Apply a partial update as the lease holder
    async fn update_run(&self, lease: &RunLease, update: RunUpdate) -> Result<Run>;

    /// Refresh the lease heartbeat
    async fn heartbeat(&self, lease: &RunLease) -> Result<()>;

    /// Non-terminal, started runs whose heartbeat is older than `cutoff`
    async fn list_stale_runs(&self, cutoff: DateTime<Utc>) -> Result<Vec<Run>>;
}

struct StoredRun {
    run: Run,
    lease_holder: Option<String>,
}

/// In-memory run store for development and tests
#[derive(Default)]
pub struct InMemoryRunStore {
    runs: RwLock<HashMap<RunId, StoredRun>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn check_lease(stored: &StoredRun, lease: &RunLease) -> Result<()> {
    match stored.lease_holder.as_deref() {
        Some(holder) if holder == lease.holder() => Ok(()),
        Some(holder) => Err(ForgeError::Forbidden(format!(
            "run {} is leased by {}",
            lease.run_id(),
            holder
        ))),
        None => Err(ForgeError::Forbidden(format!(
            "run {} has not been claimed",
            lease.run_id()
        ))),
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn create_run(&self, run: Run) -> Result<Run> {
        let mut runs = self.runs.write().await;
        if runs.contains_key(&run.id) {
            return Err(ForgeError::Duplicate(format!("run {}", run.id)));
        }
        runs.insert(
            run.id.clone(),
            StoredRun {
                run: run.clone(),
                lease_holder: None,
            },
        );
        Ok(run)
    }

    async fn get_run(&self, id: &RunId) -> Result<Option<Run>> {
        Ok(self.runs.read().await.get(id).map(|stored| stored.run.clone()))
    }

    async fn list_runs(&self, owner_id: Option<&str>) -> Result<Vec<Run>> {
        let runs = self.runs.read().await;
        let mut list: Vec<Run> = runs
            .values()
            .filter(|stored| owner_id.map_or(true, |owner| stored.run.owner_id == owner))
            .map(|stored| stored.run.clone())
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(list)
    }

    async fn claim_run(&self, lease: &RunLease) -> Result<()> {
        let mut runs = self.runs.write().await;
        let stored = runs
            .get_mut(lease.run_id())
            .ok_or_else(|| ForgeError::NotFound(format!("run {}", lease.run_id())))?;
        if stored.run.status.is_terminal() {
            return Err(ForgeError::InvalidInput(format!(
                "run {} is already {}",
                lease.run_id(),
                stored.run.status
            )));
        }
        stored.lease_holder = Some(lease.holder().to_string());
        stored.run.heartbeat_at = Some(Utc::now());
        Ok(())
    }

    async fn update_run(&self, lease: &RunLease, update: RunUpdate) -> Result<Run> {
        let mut runs = self.runs.write().await;
        let stored = runs
            .get_mut(lease.run_id())
            .ok_or_else(|| ForgeError::NotFound(format!("run {}", lease.run_id())))?;
        check_lease(stored, lease)?;
        stored.run.apply(&update);
        Ok(stored.run.clone())
    }

    async fn heartbeat(&self, lease: &RunLease) -> Result<()> {
        let mut runs = self.runs.write().await;
        let stored = runs
            .get_mut(lease.run_id())
            .ok_or_else(|| ForgeError::NotFound(format!("run {}", lease.run_id())))?;
        check_lease(stored, lease)?;
        stored.run.heartbeat_at = Some(Utc::now());
        Ok(())
    }

    async fn list_stale_runs(&self, cutoff: DateTime<Utc>) -> Result<Vec<Run>> {
        let runs = self.runs.read().await;
        Ok(runs
            .values()
            .map(|stored| &stored.run)
            .filter(|run| !run.status.is_terminal() && run.status != RunStatus::Pending)
            .filter(|run| run.heartbeat_at.unwrap_or(run.updated_at) < cutoff)
            .cloned()
            .collect())
    }
}

/// The assembled result of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    pub run_id: RunId,
    pub owner_id: String,
    pub title: String,
    pub content: String,
    pub content_type: String,
    pub images: Vec<String>,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
}

/// Destination for finished articles
#[async_trait]
pub trait ArticleSink: Send + Sync {
    /// Store the article and return its reference
    async fn save_article(&self, article: Article) -> Result<String>;
}

/// In-memory article sink
#[derive(Default)]
pub struct InMemoryArticleSink {
    articles: RwLock<HashMap<String, Article>>,
}

impl InMemoryArticleSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_article(&self, id: &str) -> Option<Article> {
        self.articles.read().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.articles.read().await.len()
    }
}

#[async_trait]
impl ArticleSink for InMemoryArticleSink {
    async fn save_article(&self, article: Article) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        self.articles.write().await.insert(id.clone(), article);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::GenerationRequest;

    async fn stored_run(store: &InMemoryRunStore) -> Run {
        store
            .create_run(Run::new(RunId::new(), "owner-1", GenerationRequest::new("topic")))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_is_unique() {
        let store = InMemoryRunStore::new();
        let run = stored_run(&store).await;
        assert!(store.create_run(run.clone()).await.is_err());
        assert_eq!(store.get_run(&run.id).await.unwrap(), Some(run));
    }

    #[tokio::test]
    async fn test_writes_require_matching_lease() {
        let store = InMemoryRunStore::new();
        let run = stored_run(&store).await;

        let lease = RunLease::new(run.id.clone(), "worker-a");
        assert!(store
            .update_run(&lease, RunUpdate::status(RunStatus::Research))
            .await
            .is_err());

        store.claim_run(&lease).await.unwrap();
        let updated = store
            .update_run(&lease, RunUpdate::stage("research", RunStatus::Research))
            .await
            .unwrap();
        assert_eq!(updated.status, RunStatus::Research);

        let intruder = RunLease::new(run.id.clone(), "worker-b");
        let denied = store
            .update_run(&intruder, RunUpdate::failed("nope"))
            .await;
        assert!(matches!(denied, Err(ForgeError::Forbidden(_))));
    }

    #[tokio::test]
    async fn test_terminal_runs_cannot_be_claimed() {
        let store = InMemoryRunStore::new();
        let run = stored_run(&store).await;
        let lease = RunLease::new(run.id.clone(), "worker-a");
        store.claim_run(&lease).await.unwrap();
        store.update_run(&lease, RunUpdate::failed("boom")).await.unwrap();

        let again = RunLease::new(run.id.clone(), "worker-b");
        assert!(store.claim_run(&again).await.is_err());
    }

    #[tokio::test]
    async fn test_stale_runs_exclude_pending_and_terminal() {
        let store = InMemoryRunStore::new();
        let pending = stored_run(&store).await;
        let active = stored_run(&store).await;

        let lease = RunLease::new(active.id.clone(), "worker-a");
        store.claim_run(&lease).await.unwrap();
        store
            .update_run(&lease, RunUpdate::stage("research", RunStatus::Research))
            .await
            .unwrap();

        let future = Utc::now() + chrono::Duration::seconds(5);
        let stale = store.list_stale_runs(future).await.unwrap();
        let ids: Vec<_> = stale.iter().map(|run| run.id.clone()).collect();
        assert_eq!(ids, vec![active.id.clone()]);
        assert!(!ids.contains(&pending.id));

        let past = Utc::now() - chrono::Duration::seconds(60);
        assert!(store.list_stale_runs(past).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_article_sink_returns_reference() {
        let sink = InMemoryArticleSink::new();
        let id = sink
            .save_article(Article {
                run_id: RunId::new(),
                owner_id: "owner".into(),
                title: "Title".into(),
                content: "# Title".into(),
                content_type: "longread".into(),
                images: vec![],
                total_tokens: 10,
                total_cost_usd: 0.1,
            })
            .await
            .unwrap();
        assert_eq!(sink.get_article(&id).await.map(|a| a.title), Some("Title".to_string()));
    }
}
