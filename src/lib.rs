//! Volunteer WebRTC circumvention proxy.
//!
//! A long-running process that rendezvouses with a central broker, accepts
//! short-lived peer-to-peer sessions from censored clients, and relays
//! their bytestreams to a fixed upstream relay. The proxy is fungible: it
//! contributes NAT-traversable bandwidth and an address the censor has not
//! yet enumerated.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  Proxy                                               │
//! │  ├─ TokenPool (bounded session admission)            │
//! │  ├─ SignalingEndpoint (HTTP poll/answer vs. broker)  │
//! │  ├─ NAT prober (one-shot, before the polling loop)   │
//! │  └─ per session:                                     │
//! │      offer ─▶ peer connection ─▶ data channel        │
//! │                      │                               │
//! │                 byte pipe ◀─▶ relay WebSocket        │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! Each session speaks browser-compatible WebRTC (ICE/STUN, DTLS, SCTP
//! data channel) toward the client and a plain WebSocket toward the relay;
//! the copy loop in between is this crate's reason to exist.
//!
//! # Example
//!
//! ```no_run
//! use polynya::{Proxy, ProxyConfig};
//!
//! # async fn example() -> polynya::Result<()> {
//! let config = ProxyConfig::default().with_capacity(10);
//! let proxy = std::sync::Arc::new(Proxy::new(config)?);
//!
//! let runner = std::sync::Arc::clone(&proxy);
//! tokio::spawn(async move { runner.start().await });
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod error;

mod messages;
mod nat;
mod peer;
mod proxy;
mod relay;
mod sdp;
mod signaling;
mod tokens;

pub use config::ProxyConfig;
pub use error::{Error, Result};
pub use nat::NatType;
pub use proxy::Proxy;

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
