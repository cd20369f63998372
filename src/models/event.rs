// Progress events and review decisions
// The vocabulary carried on a run's progress channel

//! # Event Model
//!
//! Every message on a run's channel is a [`ProgressEvent`] serialized as a JSON object
//! tagged by `type`:
//!
//! ```json
//! {"type":"stage:progress","stage":"write_sections","message":"Writing section 2/5","percent":40}
//! ```
//!
//! Events are immutable facts. A subscriber only sees events published after it
//! joined; nothing is replayed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ForgeError, Result};

/// Tagged fact about a run's progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ProgressEvent {
    #[serde(rename = "stage:started")]
    StageStarted {
        stage: String,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "stage:progress")]
    StageProgress {
        stage: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        percent: Option<u8>,
    },

    #[serde(rename = "stage:completed")]
    StageCompleted {
        stage: String,
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tokens: Option<u64>,
    },

    #[serde(rename = "stage:failed")]
    StageFailed { stage: String, error: String },

    #[serde(rename = "interrupt:waiting")]
    InterruptWaiting { stage: String, data: Value },

    #[serde(rename = "interrupt:response")]
    InterruptResponse {
        stage: String,
        action: ReviewAction,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        feedback: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        updated_data: Option<Value>,
    },

    #[serde(rename = "interrupt:resumed")]
    InterruptResumed { stage: String },

    #[serde(rename = "generation:completed")]
    GenerationCompleted {
        #[serde(default)]
        result_ref: Option<String>,
    },

    #[serde(rename = "generation:failed")]
    GenerationFailed { error: String },
}

impl ProgressEvent {
    pub fn stage_started(stage: impl Into<String>) -> Self {
        ProgressEvent::StageStarted {
            stage: stage.into(),
            timestamp: Utc::now(),
        }
    }

    /// Wire name of the event, used as the server-push event name
    pub fn event_name(&self) -> &'static str {
        match self {
            ProgressEvent::StageStarted { .. } => "stage:started",
            ProgressEvent::StageProgress { .. } => "stage:progress",
            ProgressEvent::StageCompleted { .. } => "stage:completed",
            ProgressEvent::StageFailed { .. } => "stage:failed",
            ProgressEvent::InterruptWaiting { .. } => "interrupt:waiting",
            ProgressEvent::InterruptResponse { .. } => "interrupt:response",
            ProgressEvent::InterruptResumed { .. } => "interrupt:resumed",
            ProgressEvent::GenerationCompleted { .. } => "generation:completed",
            ProgressEvent::GenerationFailed { .. } => "generation:failed",
        }
    }

    /// True for the two events that end a run's stream
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressEvent::GenerationCompleted { .. } | ProgressEvent::GenerationFailed { .. }
        )
    }

    pub fn stage(&self) -> Option<&str> {
        match self {
            ProgressEvent::StageStarted { stage, .. }
            | ProgressEvent::StageProgress { stage, .. }
            | ProgressEvent::StageCompleted { stage, .. }
            | ProgressEvent::StageFailed { stage, .. }
            | ProgressEvent::InterruptWaiting { stage, .. }
            | ProgressEvent::InterruptResponse { stage, .. }
            | ProgressEvent::InterruptResumed { stage } => Some(stage),
            ProgressEvent::GenerationCompleted { .. } | ProgressEvent::GenerationFailed { .. } => {
                None
            }
        }
    }
}

impl From<(String, ReviewDecision)> for ProgressEvent {
    fn from((stage, decision): (String, ReviewDecision)) -> Self {
        let (action, feedback, updated_data) = match decision {
            ReviewDecision::Approve => (ReviewAction::Approve, None, None),
            ReviewDecision::Reject { feedback } => (ReviewAction::Reject, Some(feedback), None),
            ReviewDecision::Edit { content } => (ReviewAction::Edit, None, Some(content)),
        };
        ProgressEvent::InterruptResponse {
            stage,
            action,
            feedback,
            updated_data,
        }
    }
}

/// Reviewer action as it appears on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewAction {
    Approve,
    Reject,
    Edit,
}

/// A validated reviewer decision
#[derive(Debug, Clone, PartialEq)]
pub enum ReviewDecision {
    Approve,
    Reject { feedback: String },
    Edit { content: Value },
}

impl ReviewDecision {
    /// Build a decision from loose wire fields
    ///
    /// `reject` needs non-blank feedback and `edit` needs a replacement payload.
    pub fn from_parts(
        action: ReviewAction,
        feedback: Option<String>,
        updated_data: Option<Value>,
    ) -> Result<Self> {
        match action {
            ReviewAction::Approve => Ok(ReviewDecision::Approve),
            ReviewAction::Reject => match feedback {
                Some(feedback) if !feedback.trim().is_empty() => {
                    Ok(ReviewDecision::Reject { feedback })
                }
                _ => Err(ForgeError::InvalidInput(
                    "reject requires feedback".to_string(),
                )),
            },
            ReviewAction::Edit => match updated_data {
                Some(content) if !content.is_null() => Ok(ReviewDecision::Edit { content }),
                _ => Err(ForgeError::InvalidInput(
                    "edit requires updated_data".to_string(),
                )),
            },
        }
    }

    pub fn action(&self) -> ReviewAction {
        match self {
            ReviewDecision::Approve => ReviewAction::Approve,
            ReviewDecision::Reject { .. } => ReviewAction::Reject,
            ReviewDecision::Edit { .. } => ReviewAction::Edit,
        }
    }
}
