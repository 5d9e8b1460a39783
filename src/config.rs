//! Bridge configuration
//!
//! Loaded from a JSON file; every field has a default, so `{}` is a valid
//! configuration. Durations are stored in seconds or milliseconds as the
//! field name says.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use crate::error::{BridgeError, Result};
use crate::protocol::Method;

/// Relay used when none is configured
pub const DEFAULT_RELAY: &str = "wss://relay.damus.io";

/// Reconnection backoff: `initial_ms * factor^attempt`, capped at `max_ms`,
/// then scaled by a random factor in `1 ± jitter`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub factor: f64,
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 1_000,
            max_ms: 60_000,
            factor: 2.0,
            jitter: 0.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub relays: Vec<String>,
    /// Max event ids remembered for duplicate suppression
    pub dedup_capacity: usize,
    pub dedup_ttl_secs: u64,
    pub max_concurrent_requests: usize,
    pub inbound_queue: usize,
    /// Per-relay outbound queue
    pub outbound_queue: usize,
    pub connect_timeout_secs: u64,
    pub backoff: BackoffConfig,
    pub shutdown_grace_secs: u64,
    /// Methods enabled for this bridge; connections may be granted a subset
    pub methods: BTreeSet<Method>,
    /// Lightning address advertised in pairing URIs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lud16: Option<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            relays: vec![DEFAULT_RELAY.to_string()],
            dedup_capacity: 10_000,
            dedup_ttl_secs: 600,
            max_concurrent_requests: 16,
            inbound_queue: 1_024,
            outbound_queue: 256,
            connect_timeout_secs: 10,
            backoff: BackoffConfig::default(),
            shutdown_grace_secs: 5,
            methods: Method::ALL.into_iter().collect(),
            lud16: None,
        }
    }
}

impl BridgeConfig {
    /// Read and validate a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&data).map_err(|e| {
            BridgeError::Configuration(format!("invalid config {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.relays.is_empty() {
            return Err(BridgeError::Configuration(
                "at least one relay is required".to_string(),
            ));
        }
        for relay in &self.relays {
            validate_relay_url(relay)?;
        }

        let limits = [
            ("dedup_capacity", self.dedup_capacity),
            ("max_concurrent_requests", self.max_concurrent_requests),
            ("inbound_queue", self.inbound_queue),
            ("outbound_queue", self.outbound_queue),
        ];
        for (name, value) in limits {
            if value == 0 {
                return Err(BridgeError::Configuration(format!("{} must be non-zero", name)));
            }
        }
        if self.dedup_ttl_secs == 0 || self.connect_timeout_secs == 0 {
            return Err(BridgeError::Configuration(
                "dedup_ttl_secs and connect_timeout_secs must be non-zero".to_string(),
            ));
        }

        let b = &self.backoff;
        if b.initial_ms == 0 || b.max_ms < b.initial_ms || b.factor < 1.0 {
            return Err(BridgeError::Configuration(format!(
                "invalid backoff: {:?}",
                b
            )));
        }
        if !(0.0..1.0).contains(&b.jitter) {
            return Err(BridgeError::Configuration(
                "backoff jitter must be in [0, 1)".to_string(),
            ));
        }

        if self.methods.is_empty() {
            return Err(BridgeError::Configuration(
                "at least one method must be enabled".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_relays(mut self, relays: Vec<String>) -> Self {
        self.relays = relays;
        self
    }

    pub fn with_methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.methods = methods.into_iter().collect();
        self
    }

    pub fn with_dedup(mut self, capacity: usize, ttl: Duration) -> Self {
        self.dedup_capacity = capacity;
        self.dedup_ttl_secs = ttl.as_secs();
        self
    }

    pub fn with_max_concurrent_requests(mut self, max: usize) -> Self {
        self.max_concurrent_requests = max;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_secs = timeout.as_secs();
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace_secs = grace.as_secs();
        self
    }

    pub fn with_lud16(mut self, lud16: impl Into<String>) -> Self {
        self.lud16 = Some(lud16.into());
        self
    }

    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.dedup_ttl_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Accept only `ws://` and `wss://` URLs with a host
pub fn validate_relay_url(relay: &str) -> Result<()> {
    let url = url::Url::parse(relay)
        .map_err(|e| BridgeError::Configuration(format!("invalid relay url {}: {}", relay, e)))?;
    if !matches!(url.scheme(), "ws" | "wss") || url.host_str().is_none() {
        return Err(BridgeError::Configuration(format!(
            "relay url must be ws:// or wss://: {}",
            relay
        )));
    }
    Ok(())
}
