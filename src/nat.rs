//! NAT classification against the probe endpoint.
//!
//! The probe runs once, before the polling loop: offer a throwaway peer
//! connection to the probe service and see whether the data channel comes
//! up. If the probe can dial back in, clients behind restrictive NATs can
//! too, and the broker is told so on every poll.

use crate::messages::{AnswerRequest, PollResponse};
use crate::peer;
use crate::sdp;
use crate::signaling::SignalingEndpoint;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::RTCPeerConnection;

/// Coarse NAT compatibility class advertised to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NatType {
    /// Compatibility has not been determined
    #[default]
    Unknown,
    /// Only clients with unrestricted NATs can connect
    Restricted,
    /// Clients behind restrictive NATs can connect
    Unrestricted,
}

impl fmt::Display for NatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NatType::Unknown => "unknown",
            NatType::Restricted => "restricted",
            NatType::Unrestricted => "unrestricted",
        })
    }
}

/// Process-wide NAT type slot: written once by the prober before the
/// polling loop starts, read on every poll thereafter.
pub(crate) struct NatTypeCell(AtomicU8);

impl NatTypeCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(NatType::Unknown as u8))
    }

    pub(crate) fn set(&self, value: NatType) {
        self.0.store(value as u8, Ordering::Relaxed);
    }

    pub(crate) fn get(&self) -> NatType {
        match self.0.load(Ordering::Relaxed) {
            1 => NatType::Restricted,
            2 => NatType::Unrestricted,
            _ => NatType::Unknown,
        }
    }
}

/// Run the one-shot probe exchange and classify the NAT.
///
/// The probe peer connection is closed on every outcome. Errors leave the
/// caller's previous NAT type in place.
pub(crate) async fn check_nat_type(
    probe_url: &str,
    ice_servers: Vec<RTCIceServer>,
    open_timeout: Duration,
) -> Result<NatType> {
    let probe = SignalingEndpoint::new(probe_url, false)?;
    let (opened_tx, mut opened_rx) = mpsc::channel(1);
    let pc = peer::new_probe_connection(ice_servers, opened_tx).await?;

    let outcome = classify(&probe, &pc, &mut opened_rx, open_timeout).await;
    if let Err(e) = pc.close().await {
        debug!("probe connection close: {}", e);
    }
    outcome
}

async fn classify(
    probe: &SignalingEndpoint,
    pc: &RTCPeerConnection,
    opened_rx: &mut mpsc::Receiver<()>,
    open_timeout: Duration,
) -> Result<NatType> {
    let local = pc
        .local_description()
        .await
        .ok_or_else(|| Error::Sdp("probe offer not set".to_string()))?;
    let offer = sdp::serialize_description(&local)?;

    // The probe endpoint accepts the poll-response envelope with the
    // success marker set, and replies in the answer-request shape.
    let envelope = PollResponse {
        sdp: offer,
        success: true,
        relay_url: String::new(),
    };
    let raw = probe.post(probe.url().clone(), envelope.to_bytes()?).await?;
    let answer = AnswerRequest::from_bytes(&raw)?.answer;

    let answer = sdp::deserialize_description(&answer)?;
    pc.set_remote_description(answer)
        .await
        .map_err(|e| Error::PeerConnection(format!("set probe answer: {}", e)))?;

    Ok(
        match tokio::time::timeout(open_timeout, opened_rx.recv()).await {
            Ok(_) => NatType::Unrestricted,
            Err(_) => NatType::Restricted,
        },
    )
}
