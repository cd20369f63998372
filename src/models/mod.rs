// Core domain models for Article Forge
// These are the plain data structures shared by the engine, the relays, and the clients

//! # Domain Models Module
//!
//! This module contains the data that flows through a generation run:
//! - [`run`]: run identity, lifecycle status, the request that started it, and the job
//!   handed to the queue
//! - [`event`]: the progress events published on a run's channel and the review
//!   decisions that answer interrupts
//! - [`state`]: the key/value map stages read from and the patches they return
//!
//! ## Rust Learning Notes:
//!
//! ### Re-exports for Clean APIs
//! The `pub use` statements at the bottom create a flat API, so callers can write
//! `use article_forge::models::RunId` instead of `use article_forge::models::run::RunId`.

// Run identity, status, request, and job types
pub mod run;

// Progress events and review decisions
pub mod event;

// Shared run state and stage patches
pub mod state;

pub use event::{ProgressEvent, ReviewAction, ReviewDecision};
pub use run::{GenerationJob, GenerationRequest, Run, RunId, RunStatus, RunUpdate};
pub use state::{RunState, StatePatch};
