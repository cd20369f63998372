// PostgreSQL run store
// Durable run summaries shared by every server instance

//! # PostgreSQL Run Store
//!
//! Runs live in a single `generation_runs` table. The generation request is stored as
//! JSON text, and the current lease holder sits next to the summary columns so that
//! lease checks and updates happen in one statement.
//!
//! Queries are built at runtime with `sqlx::query` so the crate compiles without a
//! live database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::info;

use crate::engine::storage::{RunLease, RunStore};
use crate::models::{GenerationRequest, Run, RunId, RunStatus, RunUpdate};
use crate::{ForgeError, Result};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS generation_runs (
    id              TEXT PRIMARY KEY,
    owner_id        TEXT NOT NULL,
    request         TEXT NOT NULL,
    status          TEXT NOT NULL,
    current_stage   TEXT,
    total_tokens    BIGINT NOT NULL DEFAULT 0,
    total_cost_usd  DOUBLE PRECISION NOT NULL DEFAULT 0,
    result_ref      TEXT,
    error_message   TEXT,
    lease_holder    TEXT,
    created_at      TIMESTAMPTZ NOT NULL,
    updated_at      TIMESTAMPTZ NOT NULL,
    completed_at    TIMESTAMPTZ,
    heartbeat_at    TIMESTAMPTZ
)
"#;

const COLUMNS: &str = "id, owner_id, request, status, current_stage, total_tokens, \
    total_cost_usd, result_ref, error_message, created_at, updated_at, completed_at, heartbeat_at";

/// Run store backed by a PostgreSQL pool
#[derive(Clone)]
pub struct PostgresRunStore {
    pool: PgPool,
}

impl PostgresRunStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        info!("✅ Connected to PostgreSQL run store");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the runs table if it does not exist
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(SCHEMA).execute(&self.pool).await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS generation_runs_owner_idx ON generation_runs (owner_id, created_at DESC)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Explain why a lease-guarded statement touched no row
    async fn lease_failure(&self, lease: &RunLease) -> ForgeError {
        let holder = sqlx::query("SELECT lease_holder FROM generation_runs WHERE id = $1")
            .bind(lease.run_id().as_str())
            .fetch_optional(&self.pool)
            .await;
        match holder {
            Ok(Some(row)) => {
                let holder: Option<String> = row.try_get("lease_holder").unwrap_or(None);
                ForgeError::Forbidden(format!(
                    "run {} is leased by {}",
                    lease.run_id(),
                    holder.unwrap_or_else(|| "nobody".to_string())
                ))
            }
            Ok(None) => ForgeError::NotFound(format!("run {}", lease.run_id())),
            Err(e) => ForgeError::Database(e),
        }
    }
}

fn run_from_row(row: &PgRow) -> Result<Run> {
    let id: String = row.try_get("id")?;
    let request: String = row.try_get("request")?;
    let status: String = row.try_get("status")?;
    let total_tokens: i64 = row.try_get("total_tokens")?;

    Ok(Run {
        id: RunId::parse(id)?,
        owner_id: row.try_get("owner_id")?,
        request: serde_json::from_str::<GenerationRequest>(&request)?,
        status: status.parse::<RunStatus>()?,
        current_stage: row.try_get("current_stage")?,
        total_tokens: total_tokens.max(0) as u64,
        total_cost_usd: row.try_get("total_cost_usd")?,
        result_ref: row.try_get("result_ref")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        completed_at: row.try_get("completed_at")?,
        heartbeat_at: row.try_get("heartbeat_at")?,
    })
}

#[async_trait]
impl RunStore for PostgresRunStore {
    async fn create_run(&self, run: Run) -> Result<Run> {
        let query = format!(
            "INSERT INTO generation_runs ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
            COLUMNS
        );
        sqlx::query(&query)
            .bind(run.id.as_str())
            .bind(&run.owner_id)
            .bind(serde_json::to_string(&run.request)?)
            .bind(run.status.as_str())
            .bind(&run.current_stage)
            .bind(run.total_tokens as i64)
            .bind(run.total_cost_usd)
            .bind(&run.result_ref)
            .bind(&run.error_message)
            .bind(run.created_at)
            .bind(run.updated_at)
            .bind(run.completed_at)
            .bind(run.heartbeat_at)
            .execute(&self.pool)
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(db) if db.is_unique_violation() => {
                    ForgeError::Duplicate(format!("run {}", run.id))
                }
                _ => ForgeError::Database(e),
            })?;
        Ok(run)
    }

    async fn get_run(&self, id: &RunId) -> Result<Option<Run>> {
        let query = format!("SELECT {} FROM generation_runs WHERE id = $1", COLUMNS);
        let row = sqlx::query(&query)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn list_runs(&self, owner_id: Option<&str>) -> Result<Vec<Run>> {
        let query = format!(
            "SELECT {} FROM generation_runs WHERE ($1::TEXT IS NULL OR owner_id = $1) ORDER BY created_at DESC",
            COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(run_from_row).collect()
    }

    async fn claim_run(&self, lease: &RunLease) -> Result<()> {
        let claimed = sqlx::query(
            "UPDATE generation_runs SET lease_holder = $2, heartbeat_at = NOW() \
             WHERE id = $1 AND status NOT IN ('completed', 'failed')",
        )
        .bind(lease.run_id().as_str())
        .bind(lease.holder())
        .execute(&self.pool)
        .await?;
        if claimed.rows_affected() == 0 {
            return Err(ForgeError::InvalidInput(format!(
                "run {} is missing or already finished",
                lease.run_id()
            )));
        }
        Ok(())
    }

    async fn update_run(&self, lease: &RunLease, update: RunUpdate) -> Result<Run> {
        let query = format!(
            "UPDATE generation_runs SET \
                status = COALESCE($3, status), \
                current_stage = COALESCE($4, current_stage), \
                total_tokens = COALESCE($5, total_tokens), \
                total_cost_usd = COALESCE($6, total_cost_usd), \
                result_ref = COALESCE($7, result_ref), \
                error_message = COALESCE($8, error_message), \
                completed_at = CASE WHEN $3 IN ('completed', 'failed') THEN NOW() ELSE completed_at END, \
                updated_at = NOW() \
             WHERE id = $1 AND lease_holder = $2 \
             RETURNING {}",
            COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(lease.run_id().as_str())
            .bind(lease.holder())
            .bind(update.status.map(|status| status.as_str()))
            .bind(update.current_stage)
            .bind(update.total_tokens.map(|tokens| tokens as i64))
            .bind(update.total_cost_usd)
            .bind(update.result_ref)
            .bind(update.error_message)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => run_from_row(&row),
            None => Err(self.lease_failure(lease).await),
        }
    }

    async fn heartbeat(&self, lease: &RunLease) -> Result<()> {
        let beat = sqlx::query(
            "UPDATE generation_runs SET heartbeat_at = NOW() WHERE id = $1 AND lease_holder = $2",
        )
        .bind(lease.run_id().as_str())
        .bind(lease.holder())
        .execute(&self.pool)
        .await?;
        if beat.rows_affected() == 0 {
            return Err(self.lease_failure(lease).await);
        }
        Ok(())
    }

    async fn list_stale_runs(&self, cutoff: DateTime<Utc>) -> Result<Vec<Run>> {
        let query = format!(
            "SELECT {} FROM generation_runs \
             WHERE status NOT IN ('pending', 'completed', 'failed') \
               AND COALESCE(heartbeat_at, updated_at) < $1",
            COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(run_from_row).collect()
    }
}
