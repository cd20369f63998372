// Interrupt Gate - suspend a stage until a reviewer answers
// A single-shot future backed by a channel subscription

//! # Interrupt Gate
//!
//! A review stage publishes `interrupt:waiting`, then blocks on the gate until an
//! `interrupt:response` for the same stage shows up on the run's channel. The
//! reviewer typically answers through a different connection, possibly handled by a
//! different process, which is why the wait goes through the channel instead of an
//! in-process oneshot.
//!
//! ## Arming Before Publishing
//!
//! Channels do not replay, so the gate must be subscribed before the waiting event
//! goes out. [`InterruptGate::arm`] subscribes and returns a [`PendingInterrupt`];
//! the caller publishes the waiting event and then calls [`PendingInterrupt::wait`].
//! [`InterruptGate::wait_for_response`] does both steps for callers that already
//! published.
//!
//! ## Cleanup
//!
//! The subscription lives inside the `PendingInterrupt` and is dropped when `wait`
//! returns, whether it resolved, timed out, or the channel closed.

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::engine::channel::{ChannelId, EventSubscription, ProgressChannel};
use crate::models::{ProgressEvent, ReviewDecision, RunId};
use crate::{ForgeError, Result};

/// How long a stage waits for a reviewer before the run fails
pub const DEFAULT_INTERRUPT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Blocking wait for review decisions on one run's channel
#[derive(Clone)]
pub struct InterruptGate {
    channel: Arc<dyn ProgressChannel>,
    channel_id: ChannelId,
    timeout: Duration,
}

impl InterruptGate {
    pub fn new(channel: Arc<dyn ProgressChannel>, channel_id: ChannelId) -> Self {
        Self {
            channel,
            channel_id,
            timeout: DEFAULT_INTERRUPT_TIMEOUT,
        }
    }

    pub fn for_run(channel: Arc<dyn ProgressChannel>, run_id: &RunId) -> Self {
        Self::new(channel, ChannelId::for_run(run_id))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Subscribe for the next response to `stage`
    pub async fn arm(&self, stage: &str) -> Result<PendingInterrupt> {
        let subscription = self.channel.subscribe(&self.channel_id).await?;
        debug!("⏸️ Interrupt gate armed for {} on {}", stage, self.channel_id);
        Ok(PendingInterrupt {
            subscription,
            stage: stage.to_string(),
            timeout: self.timeout,
        })
    }

    /// Wait for the first valid response to `stage`
    pub async fn wait_for_response(&self, stage: &str) -> Result<ReviewDecision> {
        self.arm(stage).await?.wait().await
    }
}

/// An armed gate waiting for one stage's response
pub struct PendingInterrupt {
    subscription: EventSubscription,
    stage: String,
    timeout: Duration,
}

impl PendingInterrupt {
    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// Resolve on the first matching response or fail on timeout
    ///
    /// Responses for other stages are ignored. Responses that fail validation
    /// (reject without feedback, edit without payload) are skipped.
    pub async fn wait(self) -> Result<ReviewDecision> {
        let PendingInterrupt {
            mut subscription,
            stage,
            timeout,
        } = self;

        let next_decision = async {
            while let Some(event) = subscription.next().await {
                let ProgressEvent::InterruptResponse {
                    stage: responded,
                    action,
                    feedback,
                    updated_data,
                } = event
                else {
                    continue;
                };
                if responded != stage {
                    continue;
                }
                match ReviewDecision::from_parts(action, feedback, updated_data) {
                    Ok(decision) => return Ok(decision),
                    Err(e) => warn!("⚠️ Ignoring invalid response for {}: {}", stage, e),
                }
            }
            Err(ForgeError::ChannelSubscribe(format!(
                "channel closed while waiting for review of '{}'",
                stage
            )))
        };

        match tokio::time::timeout(timeout, next_decision).await {
            Ok(result) => result,
            Err(_) => Err(ForgeError::InterruptTimeout {
                stage: stage.clone(),
                timeout,
            }),
        }
    }
}

/// Publish a reviewer decision as an `interrupt:response` event
pub async fn submit_decision(
    channel: &dyn ProgressChannel,
    run_id: &RunId,
    stage: &str,
    decision: ReviewDecision,
) -> Result<()> {
    let event = ProgressEvent::from((stage.to_string(), decision));
    channel.publish(&ChannelId::for_run(run_id), &event).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::channel::InMemoryProgressChannel;
    use crate::models::ReviewAction;
    use serde_json::json;

    fn setup() -> (Arc<InMemoryProgressChannel>, RunId) {
        (Arc::new(InMemoryProgressChannel::new()), RunId::new())
    }

    #[tokio::test]
    async fn test_matching_response_unblocks() {
        let (bus, run_id) = setup();
        let gate = InterruptGate::for_run(bus.clone(), &run_id);
        let pending = gate.arm("outline_review").await.unwrap();

        submit_decision(bus.as_ref(), &run_id, "outline_review", ReviewDecision::Approve)
            .await
            .unwrap();

        let decision = pending.wait().await.unwrap();
        assert_eq!(decision, ReviewDecision::Approve);
        assert_eq!(bus.subscriber_count(&ChannelId::for_run(&run_id)), 0);
    }

    #[tokio::test]
    async fn test_mismatched_stage_does_not_unblock() {
        let (bus, run_id) = setup();
        let gate = InterruptGate::for_run(bus.clone(), &run_id)
            .with_timeout(Duration::from_millis(100));
        let pending = gate.arm("edit_review").await.unwrap();

        submit_decision(bus.as_ref(), &run_id, "outline_review", ReviewDecision::Approve)
            .await
            .unwrap();

        let result = pending.wait().await;
        assert!(matches!(result, Err(ForgeError::InterruptTimeout { ref stage, .. }) if stage == "edit_review"));
    }

    #[tokio::test]
    async fn test_invalid_response_is_skipped() {
        let (bus, run_id) = setup();
        let channel_id = ChannelId::for_run(&run_id);
        let gate = InterruptGate::for_run(bus.clone(), &run_id);
        let pending = gate.arm("edit_review").await.unwrap();

        bus.publish(
            &channel_id,
            &ProgressEvent::InterruptResponse {
                stage: "edit_review".into(),
                action: ReviewAction::Edit,
                feedback: None,
                updated_data: None,
            },
        )
        .await
        .unwrap();
        submit_decision(
            bus.as_ref(),
            &run_id,
            "edit_review",
            ReviewDecision::Edit {
                content: json!("Final text"),
            },
        )
        .await
        .unwrap();

        let decision = pending.wait().await.unwrap();
        assert_eq!(
            decision,
            ReviewDecision::Edit {
                content: json!("Final text")
            }
        );
    }

    #[tokio::test]
    async fn test_timeout_releases_subscription() {
        let (bus, run_id) = setup();
        let gate = InterruptGate::for_run(bus.clone(), &run_id)
            .with_timeout(Duration::from_millis(20));

        let result = gate.wait_for_response("outline_review").await;
        assert!(matches!(result, Err(ForgeError::InterruptTimeout { .. })));
        assert_eq!(bus.subscriber_count(&ChannelId::for_run(&run_id)), 0);
    }
}
