// Duplex relay
// One authenticated socket per client: watch a run's interrupts and answer them

//! # Duplex Relay
//!
//! `GET /api/ws/generation?token=...` upgrades to a WebSocket. The token is checked right
//! after the upgrade; a bad or missing token gets an `error` message followed by close
//! code `4001`, and nothing else happens on that socket.
//!
//! Once connected, a client sends `{action: "subscribe", run_id}` to watch a run
//! (replacing any previous subscription) and `{action: "approve" | "reject" | "edit", ...}`
//! to answer an interrupt. Answers are republished on the run's channel as
//! `interrupt:response`; only the waiting worker acts on them.
//!
//! Only interrupt traffic is forwarded: `interrupt:waiting` goes out as
//! `interrupt:request`, and `interrupt:resumed` is passed through.
//!
//! ## Shared Upstream Subscriptions
//!
//! [`RelayRegistry`] keeps one channel subscription per run, shared by every socket
//! watching that run and reference counted by [`RelayMembership`]. Dropping the last
//! membership removes the entry and aborts its pump task, which drops the upstream
//! subscription.
//!
//! ## Backpressure
//!
//! Each socket has a bounded outbound queue. Relay traffic is offered with `try_send`;
//! when a slow client's queue is full the message is dropped for that client only.
//!
//! ## Rust Learning Notes:
//!
//! ### Locks and `.await`
//! The registry map sits behind a `std::sync::Mutex` that is never held across an
//! `.await`. `join` subscribes upstream first, then takes the lock; if another socket
//! won the race, the spare subscription is simply dropped.

use axum::{
    extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    extract::{RawQuery, State},
    response::IntoResponse,
};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::api::auth::{token_from_query, Identity};
use crate::api::handlers::visible_run;
use crate::api::types::{DuplexMessage, DuplexRequest};
use crate::api::AppState;
use crate::engine::channel::{ChannelId, ProgressChannel};
use crate::engine::interrupt::submit_decision;
use crate::models::{ProgressEvent, ReviewAction, ReviewDecision, RunId};
use crate::{ForgeError, Result};

/// Close code sent when the connect token is missing or invalid
pub const CLOSE_UNAUTHORIZED: u16 = 4001;

struct RunRelay {
    sender: broadcast::Sender<DuplexMessage>,
    members: usize,
    pump: JoinHandle<()>,
}

/// Reference-counted upstream subscriptions, one per watched run
#[derive(Clone)]
pub struct RelayRegistry {
    relays: Arc<Mutex<HashMap<RunId, RunRelay>>>,
    channel: Arc<dyn ProgressChannel>,
    capacity: usize,
}

impl RelayRegistry {
    pub fn new(channel: Arc<dyn ProgressChannel>, capacity: usize) -> Self {
        Self {
            relays: Arc::new(Mutex::new(HashMap::new())),
            channel,
            capacity: capacity.max(1),
        }
    }

    fn relays(&self) -> MutexGuard<'_, HashMap<RunId, RunRelay>> {
        // A poisoned map is still structurally valid
        self.relays.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Join the relay for a run, creating its upstream subscription if needed
    pub async fn join(&self, run_id: &RunId) -> Result<RelayMembership> {
        if let Some(membership) = self.join_existing(run_id) {
            return Ok(membership);
        }

        let mut upstream = self
            .channel
            .subscribe(&ChannelId::for_run(run_id))
            .await
            .map_err(|e| ForgeError::ChannelSubscribe(e.to_string()))?;

        let mut relays = self.relays();
        if let Some(relay) = relays.get_mut(run_id) {
            relay.members += 1;
            return Ok(self.membership(run_id, relay.sender.clone()));
        }

        let (sender, _) = broadcast::channel(self.capacity);
        let outbound = sender.clone();
        let pump_run = run_id.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = upstream.next().await {
                if let Some(message) = interrupt_message(&pump_run, event) {
                    // No receivers between joins is fine
                    let _ = outbound.send(message);
                }
            }
            debug!("Upstream for run {} ended", pump_run);
        });
        relays.insert(
            run_id.clone(),
            RunRelay {
                sender: sender.clone(),
                members: 1,
                pump,
            },
        );
        info!("🔌 Opened duplex relay for run {}", run_id);
        Ok(self.membership(run_id, sender))
    }

    fn join_existing(&self, run_id: &RunId) -> Option<RelayMembership> {
        let mut relays = self.relays();
        let relay = relays.get_mut(run_id)?;
        relay.members += 1;
        let sender = relay.sender.clone();
        drop(relays);
        Some(self.membership(run_id, sender))
    }

    fn membership(&self, run_id: &RunId, sender: broadcast::Sender<DuplexMessage>) -> RelayMembership {
        RelayMembership {
            registry: self.clone(),
            run_id: run_id.clone(),
            sender,
        }
    }

    fn leave(&self, run_id: &RunId) {
        let mut relays = self.relays();
        let Some(relay) = relays.get_mut(run_id) else {
            return;
        };
        relay.members = relay.members.saturating_sub(1);
        if relay.members == 0 {
            if let Some(relay) = relays.remove(run_id) {
                relay.pump.abort();
                info!("🔌 Closed duplex relay for run {}", run_id);
            }
        }
    }

    /// Sockets currently watching a run
    pub fn member_count(&self, run_id: &RunId) -> usize {
        self.relays().get(run_id).map_or(0, |relay| relay.members)
    }

    /// Runs with an open upstream subscription
    pub fn active_relays(&self) -> usize {
        self.relays().len()
    }
}

/// One socket's share of a run relay; leaving happens on drop
pub struct RelayMembership {
    registry: RelayRegistry,
    run_id: RunId,
    sender: broadcast::Sender<DuplexMessage>,
}

impl RelayMembership {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn receiver(&self) -> broadcast::Receiver<DuplexMessage> {
        self.sender.subscribe()
    }
}

impl Drop for RelayMembership {
    fn drop(&mut self) {
        self.registry.leave(&self.run_id);
    }
}

/// Translate a channel event into what duplex clients see, if anything
fn interrupt_message(run_id: &RunId, event: ProgressEvent) -> Option<DuplexMessage> {
    match event {
        ProgressEvent::InterruptWaiting { stage, data } => Some(DuplexMessage::InterruptRequest {
            run_id: run_id.to_string(),
            stage,
            data,
        }),
        ProgressEvent::InterruptResumed { stage } => Some(DuplexMessage::InterruptResumed {
            run_id: run_id.to_string(),
            stage,
        }),
        _ => None,
    }
}

/// Active subscription of one socket
struct Watch {
    membership: RelayMembership,
    forwarder: JoinHandle<()>,
}

impl Drop for Watch {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

/// `GET /api/ws/generation`
pub async fn duplex_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
) -> impl IntoResponse {
    let token = query.as_deref().and_then(token_from_query);
    ws.on_upgrade(move |socket| handle_socket(socket, state, token))
}

async fn refuse(mut socket: WebSocket, reason: &str) {
    warn!("🚫 Duplex connection refused: {}", reason);
    if let Ok(text) = serde_json::to_string(&DuplexMessage::error(reason)) {
        let _ = socket.send(Message::Text(text)).await;
    }
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: CLOSE_UNAUTHORIZED,
            reason: Cow::from("Unauthorized"),
        })))
        .await;
}

async fn handle_socket(socket: WebSocket, state: AppState, token: Option<String>) {
    let Some(token) = token else {
        refuse(socket, "Authentication required: provide ?token= query parameter").await;
        return;
    };
    let identity = match state.auth.authenticate(&token).await {
        Ok(identity) => identity,
        Err(_) => {
            refuse(socket, "Invalid or expired session token").await;
            return;
        }
    };
    info!("🔗 Duplex connection opened by {}", identity.user_id);

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (outbound, mut outbound_rx) = mpsc::channel::<DuplexMessage>(state.relay.outbound_buffer.max(1));

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to serialize duplex message: {}", e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let _ = outbound
        .send(DuplexMessage::Connected {
            timestamp: Utc::now(),
        })
        .await;

    let mut watch: Option<Watch> = None;
    while let Some(Ok(frame)) = ws_receiver.next().await {
        match frame {
            Message::Text(text) => {
                let reply = match serde_json::from_str::<DuplexRequest>(&text) {
                    Ok(request) => handle_request(&state, &identity, &outbound, &mut watch, request).await,
                    Err(e) => Some(DuplexMessage::error(format!("Invalid message: {}", e))),
                };
                if let Some(reply) = reply {
                    if outbound.send(reply).await.is_err() {
                        break;
                    }
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    drop(watch);
    writer.abort();
    info!("🔗 Duplex connection closed for {}", identity.user_id);
}

/// Apply one client request; returns the direct reply, if any
async fn handle_request(
    state: &AppState,
    identity: &Identity,
    outbound: &mpsc::Sender<DuplexMessage>,
    watch: &mut Option<Watch>,
    request: DuplexRequest,
) -> Option<DuplexMessage> {
    let result = match request {
        DuplexRequest::Ping => {
            return Some(DuplexMessage::Pong {
                timestamp: Utc::now(),
            })
        }
        DuplexRequest::Subscribe { run_id } => subscribe(state, identity, outbound, watch, &run_id)
            .await
            .map(|run_id| Some(DuplexMessage::Subscribed { run_id })),
        DuplexRequest::Approve { run_id, stage } => {
            respond(state, identity, &run_id, &stage, ReviewAction::Approve, None, None)
                .await
                .map(|_| None)
        }
        DuplexRequest::Reject {
            run_id,
            stage,
            feedback,
        } => respond(state, identity, &run_id, &stage, ReviewAction::Reject, feedback, None)
            .await
            .map(|_| None),
        DuplexRequest::Edit {
            run_id,
            stage,
            updated_data,
        } => respond(state, identity, &run_id, &stage, ReviewAction::Edit, None, updated_data)
            .await
            .map(|_| None),
    };

    result.unwrap_or_else(|e| Some(DuplexMessage::error(e.to_string())))
}

async fn subscribe(
    state: &AppState,
    identity: &Identity,
    outbound: &mpsc::Sender<DuplexMessage>,
    watch: &mut Option<Watch>,
    raw_run_id: &str,
) -> Result<String> {
    let run = visible_run(state, identity, raw_run_id).await?;

    // Leave the previous run before joining the next one
    *watch = None;

    let membership = state.relays.join(&run.id).await?;
    let mut relay_rx = membership.receiver();
    let outbound = outbound.clone();
    let run_id = run.id.clone();
    let forwarder = tokio::spawn(async move {
        loop {
            match relay_rx.recv().await {
                Ok(message) => match outbound.try_send(message) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!("⚠️ Slow duplex client on run {}, dropped a message", run_id);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("⚠️ Duplex client on run {} lagged by {}", run_id, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    debug!("{} subscribed to run {}", identity.user_id, run.id);
    *watch = Some(Watch {
        membership,
        forwarder,
    });
    Ok(run.id.to_string())
}

async fn respond(
    state: &AppState,
    identity: &Identity,
    raw_run_id: &str,
    stage: &str,
    action: ReviewAction,
    feedback: Option<String>,
    updated_data: Option<serde_json::Value>,
) -> Result<()> {
    identity.require_write()?;
    if stage.trim().is_empty() {
        return Err(ForgeError::InvalidInput(
            "Missing required fields: action, run_id, stage".to_string(),
        ));
    }
    let decision = ReviewDecision::from_parts(action, feedback, updated_data)?;
    let run = visible_run(state, identity, raw_run_id).await?;
    submit_decision(state.channel.as_ref(), &run.id, stage, decision).await?;
    info!("🗳️ {} sent {:?} for {} / {} over duplex", identity.user_id, action, run.id, stage);
    Ok(())
}
