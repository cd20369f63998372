// Progress reporting for a single run
// Thin publisher bound to one run's channel

use std::sync::Arc;
use std::time::Duration;
use serde_json::Value;
use tracing::warn;

use crate::engine::channel::{ChannelId, ProgressChannel};
use crate::models::{ProgressEvent, RunId};

/// Publishes lifecycle events for one run
///
/// Progress is a convenience stream, so publish failures are logged and
/// swallowed rather than failing the stage that reported them.
#[derive(Clone)]
pub struct ProgressReporter {
    channel: Arc<dyn ProgressChannel>,
    channel_id: ChannelId,
    run_id: RunId,
}

impl ProgressReporter {
    pub fn new(channel: Arc<dyn ProgressChannel>, run_id: RunId) -> Self {
        Self {
            channel_id: ChannelId::for_run(&run_id),
            channel,
            run_id,
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    pub fn channel(&self) -> &Arc<dyn ProgressChannel> {
        &self.channel
    }

    pub async fn emit(&self, event: ProgressEvent) {
        if let Err(e) = self.channel.publish(&self.channel_id, &event).await {
            warn!(
                "⚠️ Failed to publish {} for run {}: {}",
                event.event_name(),
                self.run_id,
                e
            );
        }
    }

    pub async fn stage_started(&self, stage: &str) {
        self.emit(ProgressEvent::stage_started(stage)).await;
    }

    pub async fn stage_progress(&self, stage: &str, message: impl Into<String>, percent: Option<u8>) {
        self.emit(ProgressEvent::StageProgress {
            stage: stage.to_string(),
            message: message.into(),
            percent: percent.map(|p| p.min(100)),
        })
        .await;
    }

    pub async fn stage_completed(&self, stage: &str, duration: Duration, tokens: Option<u64>) {
        self.emit(ProgressEvent::StageCompleted {
            stage: stage.to_string(),
            duration_ms: duration.as_millis() as u64,
            tokens,
        })
        .await;
    }

    pub async fn stage_failed(&self, stage: &str, error: impl Into<String>) {
        self.emit(ProgressEvent::StageFailed {
            stage: stage.to_string(),
            error: error.into(),
        })
        .await;
    }

    pub async fn interrupt_waiting(&self, stage: &str, data: Value) {
        self.emit(ProgressEvent::InterruptWaiting {
            stage: stage.to_string(),
            data,
        })
        .await;
    }

    pub async fn interrupt_resumed(&self, stage: &str) {
        self.emit(ProgressEvent::InterruptResumed {
            stage: stage.to_string(),
        })
        .await;
    }

    pub async fn run_completed(&self, result_ref: Option<String>) {
        self.emit(ProgressEvent::GenerationCompleted { result_ref }).await;
    }

    pub async fn run_failed(&self, error: impl Into<String>) {
        self.emit(ProgressEvent::GenerationFailed {
            error: error.into(),
        })
        .await;
    }
}
