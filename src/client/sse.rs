// Server-push watcher with reconnect
// Follows one run until it finishes or the reconnect policy gives up

use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use reqwest::{header, Client, Response, StatusCode};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};
use url::Url;

use crate::client::reconnect::{ReconnectController, ReconnectDecision, ReconnectPolicy};
use crate::client::rest::ApiClient;
use crate::client::{parse_base_url, status_error};
use crate::models::{ProgressEvent, RunId};
use crate::{ForgeError, Result};

/// What a watcher reports to its consumer
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    /// The stream is (re)connected
    Connected,
    /// A channel event relayed by the server
    Progress(ProgressEvent),
    Heartbeat,
    /// The transport dropped; the watcher will retry after `delay`
    Reconnecting { attempt: u32, delay: Duration },
    /// The watcher stopped without seeing the run finish
    GaveUp { reason: String },
}

#[derive(Debug, Clone)]
pub struct SseWatcher {
    client: Client,
    base_url: Url,
    token: String,
    policy: ReconnectPolicy,
    /// Reads the run summary between connections
    api: ApiClient,
}

enum OpenError {
    /// Retrying cannot help (bad token, no access, unknown run)
    Refused(String),
    Transient(String),
}

impl SseWatcher {
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self> {
        let token = token.into();
        Ok(Self {
            client: Client::new(),
            base_url: parse_base_url(base_url)?,
            api: ApiClient::new(base_url, token.clone())?,
            token,
            policy: ReconnectPolicy::default(),
        })
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn stream_url(&self, run_id: &RunId) -> Result<Url> {
        self.base_url
            .join(&format!("/api/sse/generation/{}", run_id))
            .map_err(|e| ForgeError::InvalidInput(e.to_string()))
    }

    /// Follow a run; the stream ends after a terminal event or when the watcher gives up
    pub fn watch(&self, run_id: &RunId) -> Result<impl Stream<Item = WatchEvent> + Send + Unpin> {
        let url = self.stream_url(run_id)?;
        let (tx, rx) = mpsc::channel(64);
        let watcher = self.clone();
        let run_id = run_id.clone();
        tokio::spawn(async move {
            if watcher.follow(&run_id, &url, &tx).await.is_none() {
                debug!("Watch consumer for run {} went away", run_id);
            }
        });
        Ok(ReceiverStream::new(rx))
    }

    async fn open(&self, url: &Url) -> std::result::Result<Response, OpenError> {
        let response = self
            .client
            .get(url.clone())
            .bearer_auth(&self.token)
            .header(header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| OpenError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let refused = matches!(
            status,
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND
        );
        let message = status_error(status, status.to_string()).to_string();
        if refused {
            Err(OpenError::Refused(message))
        } else {
            Err(OpenError::Transient(message))
        }
    }

    /// Connection loop; `None` means the consumer dropped the stream
    async fn follow(
        &self,
        run_id: &RunId,
        url: &Url,
        tx: &mpsc::Sender<WatchEvent>,
    ) -> Option<()> {
        let mut controller = ReconnectController::new(self.policy);

        while controller.connect() {
            let decision = match self.open(url).await {
                Ok(response) => {
                    let cause = relay(response, &mut controller, tx).await?;
                    if controller.is_terminal() {
                        info!("🏁 Run finished, watcher stopping");
                        return Some(());
                    }
                    controller.transport_error(&cause)
                }
                Err(OpenError::Refused(reason)) => controller.refused(reason),
                Err(OpenError::Transient(cause)) => controller.transport_error(&cause),
            };

            match decision {
                ReconnectDecision::Retry { attempt, delay } => {
                    warn!("📡 Stream dropped, reconnect attempt {} in {:?}", attempt, delay);
                    tx.send(WatchEvent::Reconnecting { attempt, delay }).await.ok()?;
                    tokio::time::sleep(delay).await;

                    // The terminal event may have been published while we were away
                    if let Some(outcome) = self.finished_outcome(run_id, &mut controller).await {
                        info!("🏁 Run {} finished while disconnected", run_id);
                        tx.send(WatchEvent::Progress(outcome)).await.ok()?;
                        return Some(());
                    }
                }
                ReconnectDecision::GiveUp { reason } => {
                    warn!("📡 Giving up on stream: {}", reason);
                    tx.send(WatchEvent::GaveUp { reason }).await.ok()?;
                }
                ReconnectDecision::Ignore => {}
            }
        }
        Some(())
    }

    /// Terminal event rebuilt from the run summary, if the run has finished
    ///
    /// A failed lookup is not fatal here; the next connection attempt reports it.
    async fn finished_outcome(
        &self,
        run_id: &RunId,
        controller: &mut ReconnectController,
    ) -> Option<ProgressEvent> {
        match self.api.get_generation(run_id).await {
            Ok(run) => {
                controller.observe_status(run.status);
                run.terminal_event()
            }
            Err(e) => {
                debug!("Run summary unavailable before reconnect: {}", e);
                None
            }
        }
    }
}

/// Forward one connection's events; returns why the connection ended
async fn relay(
    response: Response,
    controller: &mut ReconnectController,
    tx: &mpsc::Sender<WatchEvent>,
) -> Option<String> {
    let mut events = response.bytes_stream().eventsource();
    while let Some(item) = events.next().await {
        let event = match item {
            Ok(event) => event,
            Err(e) => return Some(e.to_string()),
        };
        let watch_event = match event.event.as_str() {
            "connected" => {
                controller.connected();
                WatchEvent::Connected
            }
            "heartbeat" => WatchEvent::Heartbeat,
            _ => match serde_json::from_str::<ProgressEvent>(&event.data) {
                Ok(progress) => {
                    controller.observe_event(&progress);
                    WatchEvent::Progress(progress)
                }
                Err(e) => {
                    debug!("Skipping malformed '{}' event: {}", event.event, e);
                    continue;
                }
            },
        };
        tx.send(watch_event).await.ok()?;
        if controller.is_terminal() {
            break;
        }
    }
    Some("stream ended".to_string())
}
