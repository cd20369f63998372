// Review loop - bounded approve/reject/edit rounds around one interrupt gate

//! # Review Loop
//!
//! A review stage shows content to a human and waits for a decision:
//!
//! - `approve` keeps the current content
//! - `edit` replaces it with the reviewer's version
//! - `reject` counts a round and regenerates with the feedback, then asks again
//!
//! Running out of rounds is not an error. After the last allowed rejection the loop
//! exits with the most recent content and reports [`ReviewOutcome::Exhausted`].
//! Only a timeout (or a regeneration failure) makes the loop fail.

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use crate::engine::graph::StageContext;
use crate::models::ReviewDecision;
use crate::Result;

/// Default number of rejection rounds before the loop gives up asking
pub const MAX_REVIEW_ROUNDS: u32 = 3;

/// New content produced after a rejection
#[derive(Debug, Clone, PartialEq)]
pub struct Revision {
    pub content: Value,
    pub tokens: u64,
    pub cost_usd: f64,
}

/// Produces a new version of reviewed content from reviewer feedback
#[async_trait]
pub trait Regenerate: Send + Sync {
    async fn regenerate(&self, feedback: &str, previous: &Value) -> Result<Revision>;
}

/// How the review ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewOutcome {
    Approved,
    Edited,
    Exhausted,
}

/// Final content and accounting of one review loop
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewResult {
    pub outcome: ReviewOutcome,
    pub content: Value,
    pub rejections: u32,
    pub tokens: u64,
    pub cost_usd: f64,
}

/// Drives the interrupt rounds of one review stage
pub struct ReviewLoop<'a> {
    stage: &'a str,
    ctx: &'a StageContext,
    max_rounds: u32,
}

impl<'a> ReviewLoop<'a> {
    pub fn new(stage: &'a str, ctx: &'a StageContext) -> Self {
        Self {
            stage,
            ctx,
            max_rounds: ctx.max_review_rounds.max(1),
        }
    }

    pub async fn run(&self, initial: Value, regenerator: &dyn Regenerate) -> Result<ReviewResult> {
        let mut content = initial;
        let mut rejections = 0u32;
        let mut tokens = 0u64;
        let mut cost_usd = 0.0f64;

        let outcome = loop {
            // Arm before announcing so a fast reviewer cannot slip past the gate
            let pending = self.ctx.gate.arm(self.stage).await?;
            self.ctx
                .progress
                .interrupt_waiting(self.stage, content.clone())
                .await;
            info!(
                "⏸️ Run {} waiting for review of {} (round {}/{})",
                self.ctx.run_id,
                self.stage,
                rejections + 1,
                self.max_rounds
            );

            match pending.wait().await? {
                ReviewDecision::Approve => break ReviewOutcome::Approved,
                ReviewDecision::Edit { content: edited } => {
                    content = edited;
                    break ReviewOutcome::Edited;
                }
                ReviewDecision::Reject { feedback } => {
                    rejections += 1;
                    if rejections >= self.max_rounds {
                        warn!(
                            "⚠️ Review of {} for run {} hit {} rejections, keeping last content",
                            self.stage, self.ctx.run_id, rejections
                        );
                        break ReviewOutcome::Exhausted;
                    }
                    self.ctx
                        .progress
                        .stage_progress(
                            self.stage,
                            format!("Regenerating (round {})...", rejections + 1),
                            None,
                        )
                        .await;
                    let revision = regenerator.regenerate(&feedback, &content).await?;
                    content = revision.content;
                    tokens += revision.tokens;
                    cost_usd += revision.cost_usd;
                }
            }
        };

        self.ctx.progress.interrupt_resumed(self.stage).await;

        Ok(ReviewResult {
            outcome,
            content,
            rejections,
            tokens,
            cost_usd,
        })
    }
}

/// Render reviewed content as text; string payloads are taken verbatim
pub fn content_as_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
