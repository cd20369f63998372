// NATS progress channel backend
// Lets workers and relays in different processes share run channels

//! # NATS Progress Channel
//!
//! Core NATS (not JetStream) subjects match the channel contract exactly: publishing
//! is fire-and-forget, subscribers only see messages sent after they subscribed,
//! and there is no replay. Each run's channel maps to the subject `generation.{run_id}`.
//!
//! Dropping the returned subscription drops the NATS `Subscriber`, which unsubscribes
//! from the server.

use async_nats::Client;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tracing::{info, warn};

use crate::engine::channel::{ChannelId, EventSubscription, ProgressChannel};
use crate::models::ProgressEvent;
use crate::{ForgeError, Result};

/// Channel backend over a NATS connection
#[derive(Clone)]
pub struct NatsProgressChannel {
    client: Client,
}

impl NatsProgressChannel {
    /// Connect to a NATS server (comma-separated URLs accepted)
    pub async fn connect(url: &str) -> Result<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to connect to NATS: {}", e))?;
        info!("✅ Connected to NATS at {}", url);
        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ProgressChannel for NatsProgressChannel {
    async fn publish(&self, channel: &ChannelId, event: &ProgressEvent) -> Result<()> {
        let payload = Bytes::from(serde_json::to_vec(event)?);
        self.client
            .publish(channel.as_str().to_string(), payload)
            .await
            .map_err(|e| ForgeError::ChannelPublish(format!("{}: {}", channel, e)))
    }

    async fn subscribe(&self, channel: &ChannelId) -> Result<EventSubscription> {
        let subscriber = self
            .client
            .subscribe(channel.as_str().to_string())
            .await
            .map_err(|e| ForgeError::ChannelSubscribe(format!("{}: {}", channel, e)))?;

        let subject = channel.clone();
        let stream = subscriber.filter_map(move |message| {
            let event = match serde_json::from_slice::<ProgressEvent>(&message.payload) {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!("⚠️ Skipping malformed event on {}: {}", subject, e);
                    None
                }
            };
            futures::future::ready(event)
        });

        Ok(EventSubscription::new(Box::pin(stream)))
    }
}
