// Server-push relay
// Streams one run's progress channel to a read-only client

//! # Server-Push Relay
//!
//! `GET /api/sse/generation/:run_id` opens one channel subscription per connection and
//! writes:
//!
//! 1. a synthetic `connected` event
//! 2. every channel event verbatim, named by its `type` (`stage:started`, ...)
//! 3. a `heartbeat` event whenever the heartbeat interval elapses
//!
//! The stream ends right after `generation:completed` or `generation:failed`. A run that
//! already finished gets `connected` plus one terminal event built from its stored summary,
//! so a client that missed the live event still learns the outcome.
//!
//! Events are produced by a per-connection task feeding a bounded buffer. The task also
//! watches the buffer's receiving side: when the client goes away axum drops the response
//! body, the task sees the buffer close on its next poll and drops the subscription
//! without waiting for another write.
//!
//! Event ids are a per-connection sequence number. There is no replay: a reconnecting
//! client only sees events published after it subscribed again.

use axum::{
    extract::{Path, State},
    response::sse::{Event, Sse},
};
use chrono::Utc;
use futures::stream::{BoxStream, Stream, StreamExt};
use serde_json::json;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};

use crate::api::auth::AuthenticatedUser;
use crate::api::handlers::visible_run;
use crate::api::types::ApiError;
use crate::api::AppState;
use crate::engine::channel::{ChannelId, EventSubscription};
use crate::models::{ProgressEvent, RunId};
use crate::ForgeError;

// Events buffered between the relay task and the response body
const RELAY_BUFFER: usize = 16;

/// Per-connection relay state
struct RelayState {
    run_id: RunId,
    events: EventSubscription,
    heartbeat: Interval,
    sequence: u64,
    out: mpsc::Sender<Event>,
}

impl RelayState {
    fn next_id(&mut self) -> String {
        self.sequence += 1;
        self.sequence.to_string()
    }

    /// Forward until a terminal event, a closed subscription, or a gone client
    async fn run(mut self) {
        loop {
            let (event, terminal) = tokio::select! {
                biased;
                _ = self.out.closed() => {
                    debug!("Client left server-push stream for run {}", self.run_id);
                    return;
                }
                next = self.events.next() => {
                    let event = match next {
                        Some(event) => event,
                        None => return,
                    };
                    let id = self.next_id();
                    (relay_event(&event, id), event.is_terminal())
                }
                _ = self.heartbeat.tick() => {
                    let id = self.next_id();
                    (heartbeat_event(id), false)
                }
            };
            if self.out.send(event).await.is_err() {
                return;
            }
            if terminal {
                info!("🏁 Run {} finished, closing server-push stream", self.run_id);
                return;
            }
        }
    }
}

impl Drop for RelayState {
    fn drop(&mut self) {
        debug!("📴 Server-push stream for run {} closed", self.run_id);
    }
}

fn relay_event(event: &ProgressEvent, id: String) -> Event {
    Event::default()
        .event(event.event_name())
        .data(serde_json::to_string(event).unwrap_or_default())
        .id(id)
}

fn connected_event(run_id: &RunId) -> Event {
    Event::default()
        .event("connected")
        .data(json!({ "run_id": run_id, "timestamp": Utc::now() }).to_string())
        .id("0")
}

fn heartbeat_event(id: String) -> Event {
    Event::default()
        .event("heartbeat")
        .data(json!({ "timestamp": Utc::now() }).to_string())
        .id(id)
}

/// Relay a subscription as server-push events until a terminal event arrives
pub fn relay_stream(
    run_id: RunId,
    events: EventSubscription,
    heartbeat: Duration,
) -> impl Stream<Item = Result<Event, Infallible>> + Send {
    let mut ticker = interval_at(Instant::now() + heartbeat, heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let (out, rx) = mpsc::channel(RELAY_BUFFER);
    // Capacity is fresh, so the greeting always fits
    let _ = out.try_send(connected_event(&run_id));

    let state = RelayState {
        run_id,
        events,
        heartbeat: ticker,
        sequence: 0,
        out,
    };
    tokio::spawn(state.run());

    ReceiverStream::new(rx).map(Ok)
}

/// `connected` followed by the stored outcome of a run that already finished
pub fn finished_stream(
    run_id: RunId,
    outcome: ProgressEvent,
) -> impl Stream<Item = Result<Event, Infallible>> + Send {
    let events = vec![
        Ok(connected_event(&run_id)),
        Ok(relay_event(&outcome, "1".to_string())),
    ];
    futures::stream::iter(events)
}

/// `GET /api/sse/generation/:run_id`
pub async fn generation_stream(
    State(state): State<AppState>,
    AuthenticatedUser(identity): AuthenticatedUser,
    Path(run_id): Path<String>,
) -> Result<Sse<BoxStream<'static, Result<Event, Infallible>>>, ApiError> {
    let run = visible_run(&state, &identity, &run_id).await?;
    let events = state
        .channel
        .subscribe(&ChannelId::for_run(&run.id))
        .await
        .map_err(|e| match e {
            ForgeError::ChannelSubscribe(_) => e,
            other => ForgeError::ChannelSubscribe(other.to_string()),
        })?;

    // Re-read after subscribing so a run finishing in between is not missed
    let current = state.store.get_run(&run.id).await?.unwrap_or(run);
    if let Some(outcome) = current.terminal_event() {
        info!(
            "🏁 {} watching finished run {}, replaying its outcome",
            identity.user_id, current.id
        );
        drop(events);
        return Ok(Sse::new(finished_stream(current.id, outcome).boxed()));
    }

    info!("📡 {} watching run {} via server push", identity.user_id, current.id);
    Ok(Sse::new(
        relay_stream(current.id, events, state.relay.heartbeat()).boxed(),
    ))
}
