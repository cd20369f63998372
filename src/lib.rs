// Article Forge - Rust Edition
// Staged content-generation runs with live progress and human review gates

//! # Article Forge Library
//!
//! This is the library root for Article Forge, an orchestrator that turns a topic into a
//! finished long-form article by running a graph of AI stages. Each run executes in the
//! background while callers watch it live and answer review prompts.
//!
//! ## Core Components
//!
//! ### Domain Models
//! - [`RunId`] / [`RunStatus`] / [`Run`]: identity and lifecycle of a generation run
//! - [`ProgressEvent`]: the typed messages published on a run's progress channel
//! - [`RunState`] / [`StatePatch`]: the shared map stages read from and write into
//!
//! ### Engine
//! - [`ProgressChannel`]: per-run publish/subscribe (in-memory or NATS)
//! - [`InterruptGate`]: suspends a stage until a reviewer answers, with a timeout
//! - [`StageGraph`]: validated stage graph with conditional edges and fan-out barriers
//! - [`JobQueue`] / [`WorkerPool`]: idempotent background execution with bounded concurrency
//!
//! ### API
//! - Server push relay (`/api/sse/generation/:run_id`)
//! - Duplex relay (`/api/ws/generation`) for interrupt prompts and review decisions
//! - REST endpoints to create, inspect, and review runs
//!
//! ### Client
//! - [`ReconnectController`]: reconnect policy shared by the watch clients
//! - [`ApiClient`], [`SseWatcher`], [`DuplexClient`]: typed clients for the HTTP surface
//!
//! ## Rust Learning Notes:
//!
//! ### Error Handling
//! Every fallible operation in the crate returns [`Result<T>`], an alias over
//! [`ForgeError`]. `thiserror` derives `Display` and `From` so that `?` converts
//! storage, serialization, and configuration errors automatically.

use std::time::Duration;

pub mod api;
pub mod client;
pub mod config;
pub mod engine;
pub mod models;

// Re-export core domain types for easy access
pub use models::{
    GenerationJob, GenerationRequest, ProgressEvent, ReviewAction, ReviewDecision, Run, RunId,
    RunState, RunStatus, RunUpdate, StatePatch,
};

// Re-export engine types for convenience
pub use engine::{
    channel::{ChannelId, EventSubscription, InMemoryProgressChannel, ProgressChannel},
    graph::{Edge, Stage, StageContext, StageGraph, StageGraphBuilder, END},
    interrupt::InterruptGate,
    progress::ProgressReporter,
    queue::{EnqueueOutcome, JobQueue, JobState, WorkerPool},
    review::{ReviewLoop, ReviewOutcome},
    storage::{InMemoryRunStore, RunStore},
    worker::Worker,
};

pub use client::{
    reconnect::{ReconnectController, ReconnectPolicy},
    ApiClient, DuplexClient, SseWatcher, WatchEvent,
};
pub use config::ForgeConfig;

/// Error types for the orchestrator
#[derive(Debug, thiserror::Error)]
pub enum ForgeError {
    #[error("Stage '{stage}' failed: {message}")]
    StageExecution { stage: String, message: String },

    #[error("Timed out after {timeout:?} waiting for review of stage '{stage}'")]
    InterruptTimeout { stage: String, timeout: Duration },

    #[error("Channel subscribe failed: {0}")]
    ChannelSubscribe(String),

    #[error("Channel publish failed: {0}")]
    ChannelPublish(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Already exists: {0}")]
    Duplicate(String),

    #[error("Invalid stage graph: {0}")]
    InvalidGraph(String),

    #[error("Conflicting writes to state key '{key}'")]
    StateConflict { key: String },

    #[error("Job queue is closed")]
    QueueClosed,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Generation error: {0}")]
    Generation(String),

    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ::config::ConfigError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for ForgeError {
    fn from(err: std::io::Error) -> Self {
        ForgeError::Internal(format!("IO error: {}", err))
    }
}

impl ForgeError {
    /// Stage name carried by stage-scoped errors
    pub fn stage(&self) -> Option<&str> {
        match self {
            ForgeError::StageExecution { stage, .. } | ForgeError::InterruptTimeout { stage, .. } => {
                Some(stage)
            }
            _ => None,
        }
    }
}

/// Result type for orchestrator operations
pub type Result<T> = std::result::Result<T, ForgeError>;
