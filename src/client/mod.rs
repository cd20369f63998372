// Clients for the Article Forge HTTP surface
// Used by the admin binary and by anything that wants to drive runs from Rust

//! # Client Module
//!
//! - [`ApiClient`]: REST calls (create, inspect, list, review)
//! - [`SseWatcher`]: follows a run over server push, reconnecting with backoff
//! - [`DuplexClient`]: one duplex socket for interrupt prompts and decisions
//! - [`reconnect`]: the reconnect state machine both watchers share
//!
//! All clients authenticate with the same bearer token the server issues (see the
//! admin `token` command).

pub mod duplex;
pub mod reconnect;
pub mod rest;
pub mod sse;

#[cfg(test)]
mod client_tests;

pub use duplex::DuplexClient;
pub use reconnect::{ConnectionState, ReconnectController, ReconnectDecision, ReconnectPolicy};
pub use rest::ApiClient;
pub use sse::{SseWatcher, WatchEvent};

use url::Url;

use crate::{ForgeError, Result};

/// Parse a server base URL such as `http://localhost:4000`
pub(crate) fn parse_base_url(base_url: &str) -> Result<Url> {
    let url = Url::parse(base_url)
        .map_err(|e| ForgeError::InvalidInput(format!("invalid server URL '{}': {}", base_url, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ForgeError::InvalidInput(format!(
            "server URL must be http or https, got '{}'",
            other
        ))),
    }
}

/// Map an error status from the server back onto the crate error
pub(crate) fn status_error(status: reqwest::StatusCode, message: String) -> ForgeError {
    match status.as_u16() {
        400 => ForgeError::InvalidInput(message),
        401 => ForgeError::Authentication(message),
        403 => ForgeError::Forbidden(message),
        404 => ForgeError::NotFound(message),
        409 => ForgeError::Duplicate(message),
        503 => ForgeError::ChannelSubscribe(message),
        _ => ForgeError::Transport(format!("server returned {}: {}", status, message)),
    }
}
