// Reconnect policy shared by the watch clients
// Pure state machine: the caller owns the transport and the timers

//! # Reconnect Controller
//!
//! ```text
//! Disconnected ──connect()──▶ Connecting ──connected()──▶ Connected
//!      ▲                          │                            │
//!      └──── transport_error() ───┴────────────────────────────┘
//!
//! any state ──terminal event / terminal status──▶ Terminal (absorbing)
//! ```
//!
//! After a transport error the controller answers with a [`ReconnectDecision`]: retry
//! after `base_delay * 2^attempt`, give up once `max_attempts` retries are spent, or
//! ignore the error because the run already finished. A successful connection resets
//! the attempt counter.
//!
//! Once the client has seen `generation:completed` or `generation:failed` (or read a
//! terminal status from the run summary) the controller is `Terminal` and every later
//! transport error is ignored. A finished run never publishes again, so there is
//! nothing to reconnect for.

use std::time::Duration;

use crate::models::{ProgressEvent, RunStatus};

/// Backoff settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (zero based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Terminal,
}

/// What to do after a transport error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Wait `delay`, then connect again
    Retry { attempt: u32, delay: Duration },
    /// Stop and surface `reason` as a persistent connection error
    GiveUp { reason: String },
    /// The run is finished; nothing to do
    Ignore,
}

#[derive(Debug, Clone)]
pub struct ReconnectController {
    policy: ReconnectPolicy,
    state: ConnectionState,
    attempts: u32,
    error: Option<String>,
}

impl ReconnectController {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            state: ConnectionState::Disconnected,
            attempts: 0,
            error: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Retries spent since the last successful connection
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Persistent connection error, set once the controller gave up
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_terminal(&self) -> bool {
        self.state == ConnectionState::Terminal
    }

    /// Whether the caller should (re)connect now
    pub fn should_connect(&self) -> bool {
        self.state == ConnectionState::Disconnected && self.error.is_none()
    }

    /// Mark a connection attempt; false when connecting is no longer allowed
    pub fn connect(&mut self) -> bool {
        if !self.should_connect() {
            return false;
        }
        self.state = ConnectionState::Connecting;
        true
    }

    /// The transport is up
    pub fn connected(&mut self) {
        if self.state == ConnectionState::Terminal {
            return;
        }
        self.state = ConnectionState::Connected;
        self.attempts = 0;
        self.error = None;
    }

    /// Feed every received event; terminal events end reconnection for good
    pub fn observe_event(&mut self, event: &ProgressEvent) {
        if event.is_terminal() {
            self.state = ConnectionState::Terminal;
        }
    }

    /// Feed a status read from the run summary
    pub fn observe_status(&mut self, status: RunStatus) {
        if status.is_terminal() {
            self.state = ConnectionState::Terminal;
        }
    }

    /// The transport failed or closed
    pub fn transport_error(&mut self, cause: &str) -> ReconnectDecision {
        if self.state == ConnectionState::Terminal {
            return ReconnectDecision::Ignore;
        }
        self.state = ConnectionState::Disconnected;
        if self.error.is_some() {
            return ReconnectDecision::Ignore;
        }

        if self.attempts >= self.policy.max_attempts {
            let reason = format!(
                "Connection lost after {} reconnection attempts: {}",
                self.attempts, cause
            );
            self.error = Some(reason.clone());
            return ReconnectDecision::GiveUp { reason };
        }

        let delay = self.policy.delay_for(self.attempts);
        self.attempts += 1;
        ReconnectDecision::Retry {
            attempt: self.attempts,
            delay,
        }
    }

    /// The server refused us for good (for example an authentication failure)
    pub fn refused(&mut self, reason: impl Into<String>) -> ReconnectDecision {
        if self.state == ConnectionState::Terminal {
            return ReconnectDecision::Ignore;
        }
        let reason = reason.into();
        self.state = ConnectionState::Disconnected;
        self.error = Some(reason.clone());
        ReconnectDecision::GiveUp { reason }
    }
}

impl Default for ReconnectController {
    fn default() -> Self {
        Self::new(ReconnectPolicy::default())
    }
}
