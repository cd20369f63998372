// Runtime configuration for the server, workers, and relays

//! # Configuration
//!
//! [`ForgeConfig`] is layered with the `config` crate, later sources winning:
//!
//! 1. compiled defaults ([`ForgeConfig::default`])
//! 2. an optional TOML file (`forge.toml` unless another path is given)
//! 3. environment variables prefixed `FORGE__`, using `__` between nesting levels
//!
//! ```text
//! FORGE__QUEUE__CONCURRENCY=4
//! FORGE__INTERRUPT__TIMEOUT_SECS=600
//! FORGE__CHANNEL__BACKEND=nats
//! ```

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::Result;

/// Default config file looked up next to the working directory
pub const DEFAULT_CONFIG_FILE: &str = "forge.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForgeConfig {
    pub server: ServerSettings,
    pub queue: QueueSettings,
    pub interrupt: InterruptSettings,
    pub relay: RelaySettings,
    pub channel: ChannelSettings,
    pub lease: LeaseSettings,
    pub generation: GenerationSettings,
    pub auth: AuthSettings,
    pub database_url: Option<String>,
}

impl Default for ForgeConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            queue: QueueSettings::default(),
            interrupt: InterruptSettings::default(),
            relay: RelaySettings::default(),
            channel: ChannelSettings::default(),
            lease: LeaseSettings::default(),
            generation: GenerationSettings::default(),
            auth: AuthSettings::default(),
            database_url: None,
        }
    }
}

impl ForgeConfig {
    /// Load from defaults, `forge.toml`, and the environment
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load with an explicit config file path (missing file is fine)
    pub fn load_from(path: &str) -> Result<Self> {
        let settings = Config::builder()
            .add_source(Config::try_from(&ForgeConfig::default())?)
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix("FORGE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub cors_enabled: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4000,
            cors_enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub concurrency: usize,
    pub completed_retention_secs: u64,
    pub failed_retention_secs: u64,
    pub retention_sweep_secs: u64,
    /// How long shutdown waits for in-flight jobs before cancelling them
    pub shutdown_grace_secs: u64,
}

impl QueueSettings {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            concurrency: 2,
            completed_retention_secs: 24 * 60 * 60,
            failed_retention_secs: 7 * 24 * 60 * 60,
            retention_sweep_secs: 60,
            shutdown_grace_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterruptSettings {
    pub timeout_secs: u64,
    pub max_review_rounds: u32,
}

impl InterruptSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for InterruptSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 30 * 60,
            max_review_rounds: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    pub heartbeat_secs: u64,
    pub channel_capacity: usize,
    pub outbound_buffer: usize,
}

impl RelaySettings {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            heartbeat_secs: 15,
            channel_capacity: 1024,
            outbound_buffer: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelBackend {
    Memory,
    Nats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelSettings {
    pub backend: ChannelBackend,
    pub nats_url: String,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            backend: ChannelBackend::Memory,
            nats_url: "nats://localhost:4222".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseSettings {
    pub heartbeat_secs: u64,
    pub ttl_secs: u64,
    pub reap_interval_secs: u64,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            heartbeat_secs: 30,
            ttl_secs: 120,
            reap_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub research_model: String,
    pub writer_model: String,
    pub fast_model: String,
    pub image_model: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            base_url: "https://openrouter.ai/api/v1".to_string(),
            api_key: None,
            research_model: "perplexity/sonar-pro".to_string(),
            writer_model: "google/gemini-3-pro-preview".to_string(),
            fast_model: "openai/gpt-4o-mini".to_string(),
            image_model: None,
            request_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    pub jwt_secret: String,
    pub token_ttl_secs: u64,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            jwt_secret: "change-me".to_string(),
            token_ttl_secs: 24 * 60 * 60,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ForgeConfig::default();
        assert_eq!(config.queue.concurrency, 2);
        assert_eq!(config.queue.completed_retention_secs, 86_400);
        assert_eq!(config.queue.failed_retention_secs, 604_800);
        assert_eq!(config.queue.shutdown_grace(), Duration::from_secs(30));
        assert_eq!(config.interrupt.timeout(), Duration::from_secs(1800));
        assert_eq!(config.interrupt.max_review_rounds, 3);
        assert_eq!(config.relay.heartbeat(), Duration::from_secs(15));
        assert_eq!(config.channel.backend, ChannelBackend::Memory);
        assert!(config.database_url.is_none());
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = ForgeConfig::load_from("does-not-exist.toml").unwrap();
        assert_eq!(config.server.port, ForgeConfig::default().server.port);
        assert_eq!(config.generation.base_url, "https://openrouter.ai/api/v1");
    }

    #[test]
    fn test_partial_toml_keeps_other_defaults() {
        let parsed: ForgeConfig = Config::builder()
            .add_source(Config::try_from(&ForgeConfig::default()).unwrap())
            .add_source(config::File::from_str(
                "[queue]\nconcurrency = 5\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(parsed.queue.concurrency, 5);
        assert_eq!(parsed.queue.failed_retention_secs, 604_800);
        assert_eq!(parsed.relay.outbound_buffer, 64);
    }
}
