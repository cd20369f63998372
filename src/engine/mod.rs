// Article Forge Engine
// Channels, gates, the stage graph executor, and background job execution

//! # Engine Module
//!
//! The engine is the layer between the domain models and the outside world. It owns
//! everything that happens to a run after it has been created.
//!
//! ## Architecture Overview
//!
//! ```text
//! JobQueue ──> WorkerPool ──> Worker ──> StageGraph ──> Stage ...
//!                               │             │            │
//!                               │             │            ├── ProgressReporter ──┐
//!                               │             │            └── InterruptGate <────┤
//!                               │             │                                   │
//!                               └── RunStore  └── stage:* events ──> ProgressChannel
//! ```
//!
//! ## Engine Components
//!
//! ### Progress Channel (`channel`, `nats_channel`)
//! - Per-run publish/subscribe named `generation.{run_id}`
//! - In-process broadcast implementation and a NATS implementation for multi-process deployments
//!
//! ### Interrupt Gate (`interrupt`, `review`)
//! - Suspends a stage until a matching `interrupt:response` arrives or the timeout fires
//! - `ReviewLoop` implements approve / reject-and-regenerate / edit with a round cap
//!
//! ### Stage Graph (`graph`, `stages`)
//! - Validated graph with unconditional, conditional, and fan-out edges
//! - The concrete article workflow and its stages
//!
//! ### Execution (`queue`, `worker`)
//! - Idempotent job queue, bounded worker pool, lease-guarded run updates
//! - Orphan reaper for runs whose worker died
//!
//! ### Collaborators (`generation`, `context`, `storage`, `postgres_storage`)
//! - Text/image generation with per-model cost accounting
//! - Reference and style retrieval
//! - Run summaries and finished articles
//!
//! ## Rust Learning Notes:
//!
//! ### Trait Objects at the Seams
//! Every external collaborator is an `Arc<dyn Trait>`. Production wiring picks NATS,
//! PostgreSQL, and OpenRouter; tests swap in the in-memory implementations without
//! touching the stage or worker code.

/// Per-run publish/subscribe
pub mod channel;

/// NATS-backed progress channel for multi-process deployments
pub mod nats_channel;

/// Typed event publishing for one run
pub mod progress;

/// Suspend-until-response gate
pub mod interrupt;

/// Human review loop built on the interrupt gate
pub mod review;

/// Stage graph definition, validation, and execution
pub mod graph;

/// Article workflow stages and graph wiring
pub mod stages;

/// Text and image generation with cost accounting
pub mod generation;

/// Reference material and style retrieval
pub mod context;

/// Run and article persistence contracts
pub mod storage;

/// PostgreSQL run store
pub mod postgres_storage;

/// Idempotent job queue and worker pool
pub mod queue;

/// Job execution and orphan recovery
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

#[cfg(test)]
mod graph_tests;


// Re-export main engine types for clean API access

pub use channel::{ChannelId, EventSubscription, InMemoryProgressChannel, ProgressChannel, SharedChannel};
pub use context::{ContextRetriever, InMemoryContextRetriever};
pub use generation::{CostTable, GenerationService, OpenRouterService};
pub use graph::{Edge, Stage, StageContext, StageGraph, StageGraphBuilder, END};
pub use interrupt::{submit_decision, InterruptGate};
pub use nats_channel::NatsProgressChannel;
pub use postgres_storage::PostgresRunStore;
pub use progress::ProgressReporter;
pub use queue::{EnqueueOutcome, JobQueue, JobReceiver, JobRecord, JobState, RetentionPolicy, WorkerPool};
pub use review::{ReviewLoop, ReviewOutcome};
pub use stages::{generation_graph, StageServices};
pub use storage::{ArticleSink, InMemoryArticleSink, InMemoryRunStore, RunStore};
pub use worker::{OrphanReaper, RunOutcome, Worker, WorkerSettings};
