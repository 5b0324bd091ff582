//! Configuration for an embedded proxy instance.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Published rendezvous broker.
pub const DEFAULT_BROKER_URL: &str = "https://broker.polynya.net/";

/// Published NAT probe endpoint.
pub const DEFAULT_PROBE_URL: &str = "https://probe.polynya.net:8443/probe";

/// Published upstream relay.
pub const DEFAULT_RELAY_URL: &str = "wss://relay.polynya.net/";

/// Public STUN server used during ICE gathering.
pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

/// How often the broker is asked for a waiting client.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// How long after sending an answer the proxy assumes the client is not
/// going to connect.
pub const DEFAULT_DATA_CHANNEL_TIMEOUT: Duration = Duration::from_secs(20);

/// Main configuration for a [`Proxy`](crate::Proxy).
///
/// All fields are fixed once the proxy starts; there is no dynamic
/// reconfiguration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Maximum number of concurrent client sessions (at least 1)
    pub capacity: usize,

    /// Rendezvous broker base URL (http:// or https://)
    pub broker_url: String,

    /// NAT probe endpoint URL (http:// or https://)
    pub probe_url: String,

    /// Upstream relay WebSocket URL (ws:// or wss://)
    pub relay_url: String,

    /// STUN server URL handed to ICE. Empty disables server-reflexive
    /// candidate gathering (host candidates only).
    pub stun_url: String,

    /// Keep private-range ICE candidates in outgoing answers
    pub keep_local_addresses: bool,

    /// Broker poll cadence
    pub poll_interval: Duration,

    /// Per-session data-channel readiness deadline
    pub data_channel_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            capacity: 1,
            broker_url: DEFAULT_BROKER_URL.to_string(),
            probe_url: DEFAULT_PROBE_URL.to_string(),
            relay_url: DEFAULT_RELAY_URL.to_string(),
            stun_url: DEFAULT_STUN_URL.to_string(),
            keep_local_addresses: false,
            poll_interval: DEFAULT_POLL_INTERVAL,
            data_channel_timeout: DEFAULT_DATA_CHANNEL_TIMEOUT,
        }
    }
}

impl ProxyConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `capacity` is 0
    /// - `broker_url` or `probe_url` is not a valid http(s) URL
    /// - `relay_url` is not a valid ws(s) URL
    /// - `stun_url` is non-empty but unparseable
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(Error::InvalidConfig(
                "capacity must be at least 1".to_string(),
            ));
        }

        let broker = Url::parse(&self.broker_url)
            .map_err(|e| Error::InvalidConfig(format!("invalid broker url: {}", e)))?;
        if broker.scheme() != "http" && broker.scheme() != "https" {
            return Err(Error::InvalidConfig(format!(
                "broker url must be http:// or https://, got {}",
                self.broker_url
            )));
        }

        let probe = Url::parse(&self.probe_url)
            .map_err(|e| Error::InvalidConfig(format!("invalid probe url: {}", e)))?;
        if probe.scheme() != "http" && probe.scheme() != "https" {
            return Err(Error::InvalidConfig(format!(
                "probe url must be http:// or https://, got {}",
                self.probe_url
            )));
        }

        let relay = Url::parse(&self.relay_url)
            .map_err(|e| Error::InvalidConfig(format!("invalid relay url: {}", e)))?;
        if relay.scheme() != "ws" && relay.scheme() != "wss" {
            return Err(Error::InvalidConfig(format!(
                "relay url must be ws:// or wss://, got {}",
                self.relay_url
            )));
        }

        if !self.stun_url.is_empty() {
            Url::parse(&self.stun_url)
                .map_err(|e| Error::InvalidConfig(format!("invalid stun url: {}", e)))?;
        }

        Ok(())
    }

    /// Set the session capacity
    ///
    /// Useful for chaining on `ProxyConfig::default()`.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set the broker URL
    pub fn with_broker_url(mut self, broker_url: &str) -> Self {
        self.broker_url = broker_url.to_string();
        self
    }

    /// Set the probe URL
    pub fn with_probe_url(mut self, probe_url: &str) -> Self {
        self.probe_url = probe_url.to_string();
        self
    }

    /// Set the relay URL
    pub fn with_relay_url(mut self, relay_url: &str) -> Self {
        self.relay_url = relay_url.to_string();
        self
    }

    /// Set the STUN URL
    pub fn with_stun_url(mut self, stun_url: &str) -> Self {
        self.stun_url = stun_url.to_string();
        self
    }

    /// Keep or strip private-range candidates in outgoing answers
    pub fn with_keep_local_addresses(mut self, keep: bool) -> Self {
        self.keep_local_addresses = keep;
        self
    }
}
