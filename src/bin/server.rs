// Article Forge - Main Server
// Runs the HTTP surface, the worker pool, and the background sweepers in one process
// Run with: cargo run --bin server

//! # Article Forge Server Binary
//!
//! This executable wires the library together:
//!
//! ```text
//! main()
//!   ↓ loads
//! ForgeConfig (defaults → forge.toml → FORGE__* env)
//!   ↓ picks
//! ProgressChannel (memory | NATS)   RunStore (memory | Postgres)
//!   ↓ feeds
//! Worker ← StageGraph ← StageServices (OpenRouter, context, article sink)
//!   ↓ driven by
//! JobQueue → WorkerPool (bounded concurrency)
//!   ↓ alongside
//! ForgeServer (REST, server push, duplex relay)
//! ```
//!
//! Two background tasks run next to the pool: the retention sweeper drops finished job
//! records, and the orphan reaper fails runs whose worker stopped heartbeating.
//!
//! ## Rust Learning Notes:
//!
//! ### Trait Objects at the Seams
//! The channel and store are chosen at runtime, so `main` holds them as
//! `Arc<dyn ProgressChannel>` and `Arc<dyn RunStore>`. Everything downstream is written
//! against the traits and never learns which backend it got.
//!
//! ### Shutdown
//! `tokio::select!` races the server against Ctrl-C. When the signal wins, the pool is
//! asked to stop and waits for in-flight jobs up to the configured grace period; runs
//! still parked at a review after that are marked failed before the process exits.

use article_forge::{
    api::{auth::JwtAuthProvider, AppState, ForgeServer},
    config::{ChannelBackend, ForgeConfig, DEFAULT_CONFIG_FILE},
    engine::{
        generation_graph, InMemoryArticleSink, InMemoryContextRetriever,
        InMemoryProgressChannel, InMemoryRunStore, JobQueue, NatsProgressChannel,
        OpenRouterService, OrphanReaper, PostgresRunStore, ProgressChannel, RetentionPolicy,
        RunStore, StageServices, Worker, WorkerPool, WorkerSettings,
    },
};
use dotenv::dotenv;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // .env is optional; deployments set variables directly
    if let Err(e) = dotenv() {
        eprintln!("Warning: Could not load .env file: {}", e);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("🚀 Starting Article Forge Server...");
    info!("=====================================");

    let config_path = env::var("FORGE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
    let config = ForgeConfig::load_from(&config_path)?;
    info!("Config file: {}", config_path);
    info!("Server: {}", config.bind_address());
    info!("Worker concurrency: {}", config.queue.concurrency);

    if config.auth.jwt_secret == "change-me" {
        warn!("⚠️ Using the default JWT secret; set FORGE__AUTH__JWT_SECRET in production");
    }

    // Progress channel backend
    let channel: Arc<dyn ProgressChannel> = match config.channel.backend {
        ChannelBackend::Memory => {
            info!("📡 Progress channel: in-memory");
            Arc::new(InMemoryProgressChannel::with_capacity(config.relay.channel_capacity))
        }
        ChannelBackend::Nats => {
            info!("📡 Progress channel: NATS at {}", config.channel.nats_url);
            Arc::new(NatsProgressChannel::connect(&config.channel.nats_url).await?)
        }
    };

    // Run persistence
    let store: Arc<dyn RunStore> = match &config.database_url {
        Some(url) => {
            let store = PostgresRunStore::connect(url).await?;
            store.migrate().await?;
            info!("🗄️ Run store: Postgres");
            Arc::new(store)
        }
        None => {
            info!("🗄️ Run store: in-memory (runs are lost on restart)");
            Arc::new(InMemoryRunStore::new())
        }
    };

    // Stage collaborators
    if config.generation.api_key.is_none() {
        warn!("⚠️ No generation API key configured; stage calls will be rejected upstream");
    } else {
        info!("✅ Generation API key configured");
    }
    let services = StageServices {
        generator: Arc::new(OpenRouterService::new(config.generation.clone())?),
        retriever: Arc::new(InMemoryContextRetriever::new()),
        articles: Arc::new(InMemoryArticleSink::new()),
    };
    let graph = Arc::new(generation_graph(&services)?);

    // Queue, pool, and background sweepers
    let worker = Arc::new(
        Worker::new(graph, store.clone(), channel.clone())
            .with_settings(WorkerSettings::from(&config)),
    );
    let (queue, jobs) = JobQueue::new(RetentionPolicy::from(&config.queue));
    let pool = WorkerPool::start(queue.clone(), jobs, worker, config.queue.concurrency);
    let sweeper =
        queue.spawn_retention_sweeper(Duration::from_secs(config.queue.retention_sweep_secs.max(1)));
    let reaper = OrphanReaper::new(
        store.clone(),
        channel.clone(),
        Duration::from_secs(config.lease.ttl_secs),
    )
    .spawn(Duration::from_secs(config.lease.reap_interval_secs.max(1)));

    let auth = Arc::new(JwtAuthProvider::new(&config.auth));
    let state = AppState::new(store, channel, queue, auth, config.relay.clone());
    let server = ForgeServer::new(config.server.clone(), state);

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("🛑 Shutdown requested"),
    }

    sweeper.abort();
    reaper.abort();
    pool.shutdown(config.queue.shutdown_grace()).await;
    info!("👋 Article Forge stopped");
    Ok(())
}
