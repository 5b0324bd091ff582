//! Wire messages exchanged with the broker and probe endpoints.
//!
//! Encoding is deterministic JSON. Decoding is version tolerant: unknown
//! fields are ignored and absent fields fall back to their defaults, so a
//! non-empty `sdp` stays the sole signal that a client was assigned.

use crate::nat::NatType;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Proxy kind advertised to the broker.
pub(crate) const PROXY_TYPE: &str = "standalone";

fn default_true() -> bool {
    true
}

/// `POST <broker>/proxy` request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PollRequest {
    pub sid: String,
    pub proxy_type: String,
    pub nat_type: NatType,
    pub clients_available: usize,
}

impl PollRequest {
    pub(crate) fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Codec(e.to_string()))
    }
}

/// `POST <broker>/proxy` response body.
///
/// The same shape, with `success` set, is what the probe endpoint accepts
/// as its request envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct PollResponse {
    #[serde(default)]
    pub sdp: String,
    #[serde(default = "default_true")]
    pub success: bool,
    /// Broker-selected relay; this proxy relays to its configured URL and
    /// ignores the field on decode.
    #[serde(default, rename = "relayURL")]
    pub relay_url: String,
}

impl PollResponse {
    pub(crate) fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Codec(e.to_string()))
    }

    pub(crate) fn from_bytes(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw).map_err(|e| Error::Codec(e.to_string()))
    }
}

/// `POST <broker>/answer` request body; also the probe's response shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct AnswerRequest {
    #[serde(default)]
    pub sid: String,
    pub answer: String,
}

impl AnswerRequest {
    pub(crate) fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Codec(e.to_string()))
    }

    pub(crate) fn from_bytes(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw).map_err(|e| Error::Codec(e.to_string()))
    }
}

/// `POST <broker>/answer` response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct AnswerResponse {
    pub success: bool,
}

impl AnswerResponse {
    pub(crate) fn from_bytes(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw).map_err(|e| Error::Codec(e.to_string()))
    }
}
