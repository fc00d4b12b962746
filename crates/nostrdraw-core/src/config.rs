//! Sync configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Relays used when nothing else is configured.
pub const DEFAULT_RELAYS: [&str; 5] = [
    "wss://relay.damus.io",
    "wss://nos.lol",
    "wss://relay.snort.social",
    "wss://relay.nsec.app",
    "wss://relay.primal.net",
];

/// Relay advertised in pairing URIs.
pub const DEFAULT_RENDEZVOUS_RELAY: &str = "wss://relay.damus.io";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Invalid config file: {0}")]
    Parse(String),
    #[error("Invalid value for {name}: {reason}")]
    InvalidValue { name: &'static str, reason: String },
    #[error("No relays configured")]
    NoRelays,
    #[error("Invalid relay URL {url}: {reason}")]
    InvalidRelay { url: String, reason: String },
}

/// Relay endpoints and protocol timings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub relays: Vec<String>,
    pub rendezvous_relay: String,
    pub publish_timeout_ms: u64,
    pub query_timeout_ms: u64,
    /// Minimum gap between two cursor broadcasts.
    pub cursor_interval_ms: u64,
    /// Cursors older than this are not drawn.
    pub cursor_window_ms: u64,
    /// Collaborators silent for longer than this are offline.
    pub online_window_ms: u64,
    pub overlay_ttl_ms: u64,
    pub overlay_sweep_ms: u64,
    pub handshake_lookback_secs: u64,
    pub presence_lookback_secs: u64,
    pub pairing_timeout_ms: u64,
    pub remote_sign_timeout_ms: u64,
    pub autosave_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            relays: DEFAULT_RELAYS.iter().map(|r| r.to_string()).collect(),
            rendezvous_relay: DEFAULT_RENDEZVOUS_RELAY.to_string(),
            publish_timeout_ms: 5_000,
            query_timeout_ms: 10_000,
            cursor_interval_ms: 100,
            cursor_window_ms: 5_000,
            online_window_ms: 10_000,
            overlay_ttl_ms: 2_000,
            overlay_sweep_ms: 100,
            handshake_lookback_secs: 60,
            presence_lookback_secs: 60,
            pairing_timeout_ms: 300_000,
            remote_sign_timeout_ms: 30_000,
            autosave_interval_secs: 30,
        }
    }
}

impl SyncConfig {
    /// Config using only the given relays.
    pub fn with_relays<I, S>(relays: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let relays: Vec<String> = relays.into_iter().map(Into::into).collect();
        let rendezvous_relay = relays.first().cloned().unwrap_or_default();
        Self {
            relays,
            rendezvous_relay,
            ..Self::default()
        }
    }

    /// Read a JSON config file. Missing fields keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("Failed to read {}: {}", path.display(), e)))?;
        serde_json::from_str(&json).map_err(|e| ConfigError::Parse(format!("{}: {}", path.display(), e)))
    }

    /// Apply `NOSTRDRAW_*` overrides from the process environment.
    pub fn from_env(self) -> Result<Self, ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        if let Some(relays) = var("NOSTRDRAW_RELAYS") {
            self.relays = relays
                .split(',')
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(relay) = var("NOSTRDRAW_RENDEZVOUS_RELAY") {
            self.rendezvous_relay = relay.trim().to_string();
        }
        if let Some(ms) = var("NOSTRDRAW_PUBLISH_TIMEOUT_MS") {
            self.publish_timeout_ms = parse_millis("NOSTRDRAW_PUBLISH_TIMEOUT_MS", &ms)?;
        }
        if let Some(ms) = var("NOSTRDRAW_QUERY_TIMEOUT_MS") {
            self.query_timeout_ms = parse_millis("NOSTRDRAW_QUERY_TIMEOUT_MS", &ms)?;
        }
        Ok(self)
    }

    /// Check relay URLs and timings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.relays.is_empty() {
            return Err(ConfigError::NoRelays);
        }
        for relay in self.relays.iter().chain(std::iter::once(&self.rendezvous_relay)) {
            check_relay_url(relay)?;
        }
        if self.publish_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                name: "publish_timeout_ms",
                reason: "must be positive".to_string(),
            });
        }
        if self.query_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                name: "query_timeout_ms",
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn cursor_interval(&self) -> Duration {
        Duration::from_millis(self.cursor_interval_ms)
    }

    pub fn overlay_ttl(&self) -> Duration {
        Duration::from_millis(self.overlay_ttl_ms)
    }

    pub fn overlay_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.overlay_sweep_ms)
    }

    pub fn pairing_timeout(&self) -> Duration {
        Duration::from_millis(self.pairing_timeout_ms)
    }

    pub fn remote_sign_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_sign_timeout_ms)
    }

    pub fn autosave_interval(&self) -> Duration {
        Duration::from_secs(self.autosave_interval_secs)
    }
}

fn parse_millis(name: &'static str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse().map_err(|e: std::num::ParseIntError| ConfigError::InvalidValue {
        name,
        reason: e.to_string(),
    })
}

fn check_relay_url(relay: &str) -> Result<(), ConfigError> {
    let parsed = Url::parse(relay).map_err(|e| ConfigError::InvalidRelay {
        url: relay.to_string(),
        reason: e.to_string(),
    })?;
    match parsed.scheme() {
        "ws" | "wss" => Ok(()),
        other => Err(ConfigError::InvalidRelay {
            url: relay.to_string(),
            reason: format!("unsupported scheme {}", other),
        }),
    }
}
