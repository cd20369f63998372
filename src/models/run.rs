// Run identity and lifecycle
// A run is one execution of the generation workflow for one request

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::models::event::ProgressEvent;
use crate::{ForgeError, Result};

/// Opaque identifier of a generation run
///
/// Run ids double as job ids in the queue and as the suffix of the run's
/// channel subject, so they may not contain whitespace or the subject
/// separators `.`, `*`, `>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Mint a fresh random run id
    pub fn new() -> Self {
        RunId(Uuid::new_v4().to_string())
    }

    /// Validate and wrap an externally supplied run id
    pub fn parse(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(ForgeError::InvalidInput("run id cannot be empty".to_string()));
        }
        if raw
            .chars()
            .any(|c| c.is_whitespace() || c == '.' || c == '*' || c == '>')
        {
            return Err(ForgeError::InvalidInput(format!(
                "run id '{}' contains reserved characters",
                raw
            )));
        }
        Ok(RunId(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle status of a run
///
/// Non-terminal statuses mirror the stage currently executing; `completed`
/// and `failed` are terminal and never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Research,
    RagContext,
    BuildStyleGuide,
    Outline,
    OutlineReview,
    Writing,
    Editing,
    EditReview,
    Images,
    Assembling,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    /// Status a run shows while the named stage executes
    pub fn for_stage(stage: &str) -> Option<Self> {
        let status = match stage {
            "research" => RunStatus::Research,
            "rag_context" => RunStatus::RagContext,
            "build_style_guide" => RunStatus::BuildStyleGuide,
            "create_outline" => RunStatus::Outline,
            "outline_review" => RunStatus::OutlineReview,
            "write_sections" => RunStatus::Writing,
            "edit_polish" => RunStatus::Editing,
            "edit_review" => RunStatus::EditReview,
            "image_generate" => RunStatus::Images,
            "assemble" => RunStatus::Assembling,
            _ => return None,
        };
        Some(status)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Research => "research",
            RunStatus::RagContext => "rag_context",
            RunStatus::BuildStyleGuide => "build_style_guide",
            RunStatus::Outline => "outline",
            RunStatus::OutlineReview => "outline_review",
            RunStatus::Writing => "writing",
            RunStatus::Editing => "editing",
            RunStatus::EditReview => "edit_review",
            RunStatus::Images => "images",
            RunStatus::Assembling => "assembling",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = ForgeError;

    fn from_str(s: &str) -> Result<Self> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| ForgeError::InvalidInput(format!("unknown run status '{}'", s)))
    }
}

fn default_content_type() -> String {
    "longread".to_string()
}

/// What the caller asked to generate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub topic: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    #[serde(default)]
    pub input_urls: Vec<String>,
    #[serde(default)]
    pub company_links: Vec<String>,
    #[serde(default)]
    pub target_keywords: Vec<String>,
    #[serde(default)]
    pub enable_outline_review: bool,
    #[serde(default)]
    pub enable_edit_review: bool,
}

impl GenerationRequest {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            content_type: default_content_type(),
            input_urls: Vec::new(),
            company_links: Vec::new(),
            target_keywords: Vec::new(),
            enable_outline_review: false,
            enable_edit_review: false,
        }
    }

    pub fn with_outline_review(mut self, enabled: bool) -> Self {
        self.enable_outline_review = enabled;
        self
    }

    pub fn with_edit_review(mut self, enabled: bool) -> Self {
        self.enable_edit_review = enabled;
        self
    }

    pub fn with_keywords(mut self, keywords: Vec<String>) -> Self {
        self.target_keywords = keywords;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.topic.trim().is_empty() {
            return Err(ForgeError::InvalidInput("topic is required".to_string()));
        }
        if self.content_type.trim().is_empty() {
            return Err(ForgeError::InvalidInput("content_type cannot be blank".to_string()));
        }
        Ok(())
    }
}

/// Durable summary of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub owner_id: String,
    pub request: GenerationRequest,
    pub status: RunStatus,
    pub current_stage: Option<String>,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    pub result_ref: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn new(id: RunId, owner_id: impl Into<String>, request: GenerationRequest) -> Self {
        let now = Utc::now();
        Self {
            id,
            owner_id: owner_id.into(),
            request,
            status: RunStatus::Pending,
            current_stage: None,
            total_tokens: 0,
            total_cost_usd: 0.0,
            result_ref: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            heartbeat_at: None,
        }
    }

    /// The terminal event matching a finished run's summary; `None` while it is running
    pub fn terminal_event(&self) -> Option<ProgressEvent> {
        match self.status {
            RunStatus::Completed => Some(ProgressEvent::GenerationCompleted {
                result_ref: self.result_ref.clone(),
            }),
            RunStatus::Failed => Some(ProgressEvent::GenerationFailed {
                error: self
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "generation failed".to_string()),
            }),
            _ => None,
        }
    }

    /// Apply a partial update in place
    pub fn apply(&mut self, update: &RunUpdate) {
        if let Some(status) = update.status {
            self.status = status;
            if status.is_terminal() {
                self.completed_at = Some(Utc::now());
            }
        }
        if let Some(stage) = &update.current_stage {
            self.current_stage = Some(stage.clone());
        }
        if let Some(tokens) = update.total_tokens {
            self.total_tokens = tokens;
        }
        if let Some(cost) = update.total_cost_usd {
            self.total_cost_usd = cost;
        }
        if let Some(result_ref) = &update.result_ref {
            self.result_ref = Some(result_ref.clone());
        }
        if let Some(error) = &update.error_message {
            self.error_message = Some(error.clone());
        }
        self.updated_at = Utc::now();
    }
}

/// Partial update of a run; `None` leaves a field untouched
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunUpdate {
    pub status: Option<RunStatus>,
    pub current_stage: Option<String>,
    pub total_tokens: Option<u64>,
    pub total_cost_usd: Option<f64>,
    pub result_ref: Option<String>,
    pub error_message: Option<String>,
}

impl RunUpdate {
    pub fn status(status: RunStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn stage(stage: impl Into<String>, status: RunStatus) -> Self {
        Self {
            status: Some(status),
            current_stage: Some(stage.into()),
            ..Default::default()
        }
    }

    pub fn completed(result_ref: Option<String>, total_tokens: u64, total_cost_usd: f64) -> Self {
        Self {
            status: Some(RunStatus::Completed),
            result_ref,
            total_tokens: Some(total_tokens),
            total_cost_usd: Some(total_cost_usd),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(RunStatus::Failed),
            error_message: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Unit of work handed to the job queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationJob {
    pub run_id: RunId,
    pub owner_id: String,
    pub request: GenerationRequest,
}

impl GenerationJob {
    pub fn new(run_id: RunId, owner_id: impl Into<String>, request: GenerationRequest) -> Self {
        Self {
            run_id,
            owner_id: owner_id.into(),
            request,
        }
    }
}
