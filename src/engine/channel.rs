// Progress Channel - per-run publish/subscribe
// Decouples the worker producing events from any number of readers

//! # Progress Channel
//!
//! Every run owns one named channel, derived from its run id. The worker publishes
//! [`ProgressEvent`]s to it; relays and interrupt gates subscribe to it.
//!
//! ## Delivery Contract
//!
//! - `publish` never waits for subscribers; publishing to a channel nobody listens to is a no-op
//! - `subscribe` yields only events published after the call returned
//! - each subscription receives its own copy of every event, in publish order
//! - at most once: a subscriber that falls behind or disconnects loses the gap
//!
//! ## Cleanup
//!
//! A subscription is an [`EventSubscription`] value. Dropping it releases the
//! underlying receiver on every path (normal end, timeout, client abort), and the
//! in-memory backend forgets a channel once its last receiver is gone.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{debug, warn};

use crate::models::{ProgressEvent, RunId};
use crate::Result;

/// Name of a run's channel
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelId(String);

impl ChannelId {
    /// Channel for a run: `generation.{run_id}`
    pub fn for_run(run_id: &RunId) -> Self {
        ChannelId(format!("generation.{}", run_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Boxed stream of events for one subscription
pub type EventStream = Pin<Box<dyn Stream<Item = ProgressEvent> + Send>>;

/// A live subscription to one channel
///
/// Field order matters: the stream (and its receiver) drops before the guard
/// runs, so the guard observes the final receiver count.
pub struct EventSubscription {
    stream: EventStream,
    _guard: Option<Box<dyn Send + Sync>>,
}

impl EventSubscription {
    pub fn new(stream: EventStream) -> Self {
        Self {
            stream,
            _guard: None,
        }
    }

    /// Attach a value that is dropped right after the stream
    pub fn with_guard<G: Send + Sync + 'static>(mut self, guard: G) -> Self {
        self._guard = Some(Box::new(guard));
        self
    }
}

impl Stream for EventSubscription {
    type Item = ProgressEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.stream.as_mut().poll_next(cx)
    }
}

/// Publish/subscribe contract shared by all channel backends
#[async_trait]
pub trait ProgressChannel: Send + Sync {
    /// Publish an event; does not wait for or require subscribers
    async fn publish(&self, channel: &ChannelId, event: &ProgressEvent) -> Result<()>;

    /// Subscribe to events published from now on
    async fn subscribe(&self, channel: &ChannelId) -> Result<EventSubscription>;
}

/// Shared handle to a channel backend
pub type SharedChannel = Arc<dyn ProgressChannel>;

/// In-process channel backend over tokio broadcast channels
#[derive(Clone)]
pub struct InMemoryProgressChannel {
    channels: Arc<DashMap<ChannelId, broadcast::Sender<ProgressEvent>>>,
    capacity: usize,
}

impl InMemoryProgressChannel {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// Per-channel buffer size; a subscriber lagging by more than this loses events
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Number of live subscriptions on a channel
    pub fn subscriber_count(&self, channel: &ChannelId) -> usize {
        self.channels
            .get(channel)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    /// Number of channels with at least one subscriber
    pub fn active_channels(&self) -> usize {
        self.channels.len()
    }
}

impl Default for InMemoryProgressChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// Forgets a channel once its last receiver is gone
struct ChannelCleanup {
    channels: Arc<DashMap<ChannelId, broadcast::Sender<ProgressEvent>>>,
    id: ChannelId,
}

impl Drop for ChannelCleanup {
    fn drop(&mut self) {
        if self
            .channels
            .remove_if(&self.id, |_, sender| sender.receiver_count() == 0)
            .is_some()
        {
            debug!("🧹 Released channel {}", self.id);
        }
    }
}

#[async_trait]
impl ProgressChannel for InMemoryProgressChannel {
    async fn publish(&self, channel: &ChannelId, event: &ProgressEvent) -> Result<()> {
        if let Some(sender) = self.channels.get(channel) {
            // No receivers is not an error
            let _ = sender.send(event.clone());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &ChannelId) -> Result<EventSubscription> {
        let receiver = self
            .channels
            .entry(channel.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();

        let id = channel.clone();
        let stream = BroadcastStream::new(receiver).filter_map(move |item| {
            let item = match item {
                Ok(event) => Some(event),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!("⚠️ Subscriber on {} lagged, dropped {} events", id, skipped);
                    None
                }
            };
            futures::future::ready(item)
        });

        Ok(EventSubscription::new(Box::pin(stream)).with_guard(ChannelCleanup {
            channels: self.channels.clone(),
            id: channel.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn progress(n: u8) -> ProgressEvent {
        ProgressEvent::StageProgress {
            stage: "write_sections".into(),
            message: format!("tick {}", n),
            percent: Some(n),
        }
    }

    #[test]
    fn test_channel_name_is_derived_from_run() {
        let run_id = RunId::parse("r-1").unwrap();
        assert_eq!(ChannelId::for_run(&run_id).as_str(), "generation.r-1");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let bus = InMemoryProgressChannel::new();
        let channel = ChannelId::for_run(&RunId::new());
        bus.publish(&channel, &progress(1)).await.unwrap();
        assert_eq!(bus.active_channels(), 0);
    }

    #[tokio::test]
    async fn test_subscribers_see_same_order() {
        let bus = InMemoryProgressChannel::new();
        let channel = ChannelId::for_run(&RunId::new());
        let mut first = bus.subscribe(&channel).await.unwrap();
        let mut second = bus.subscribe(&channel).await.unwrap();

        for n in 0..5 {
            bus.publish(&channel, &progress(n)).await.unwrap();
        }

        for n in 0..5 {
            assert_eq!(first.next().await, Some(progress(n)));
            assert_eq!(second.next().await, Some(progress(n)));
        }
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_earlier_events() {
        let bus = InMemoryProgressChannel::new();
        let channel = ChannelId::for_run(&RunId::new());
        let _early = bus.subscribe(&channel).await.unwrap();
        bus.publish(&channel, &progress(1)).await.unwrap();

        let mut late = bus.subscribe(&channel).await.unwrap();
        bus.publish(&channel, &progress(2)).await.unwrap();
        assert_eq!(late.next().await, Some(progress(2)));
    }

    #[tokio::test]
    async fn test_dropping_last_subscription_releases_channel() {
        let bus = InMemoryProgressChannel::new();
        let channel = ChannelId::for_run(&RunId::new());
        let first = bus.subscribe(&channel).await.unwrap();
        let second = bus.subscribe(&channel).await.unwrap();
        assert_eq!(bus.subscriber_count(&channel), 2);

        drop(first);
        assert_eq!(bus.subscriber_count(&channel), 1);
        assert_eq!(bus.active_channels(), 1);

        drop(second);
        assert_eq!(bus.subscriber_count(&channel), 0);
        assert_eq!(bus.active_channels(), 0);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_skips_instead_of_failing() {
        let bus = InMemoryProgressChannel::with_capacity(2);
        let channel = ChannelId::for_run(&RunId::new());
        let mut slow = bus.subscribe(&channel).await.unwrap();
        for n in 0..6 {
            bus.publish(&channel, &progress(n)).await.unwrap();
        }
        let next = tokio::time::timeout(Duration::from_secs(1), slow.next())
            .await
            .unwrap();
        assert_eq!(next, Some(progress(4)));
    }
}
