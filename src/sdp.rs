//! Session-description envelopes and ICE candidate sanitization.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// JSON envelope carrying an SDP blob plus its negotiation role.
#[derive(Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    sdp: String,
}

/// Serialize a session description into the signaling envelope.
pub(crate) fn serialize_description(desc: &RTCSessionDescription) -> Result<String> {
    let envelope = Envelope {
        kind: desc.sdp_type.to_string(),
        sdp: desc.sdp.clone(),
    };
    serde_json::to_string(&envelope).map_err(|e| Error::Sdp(e.to_string()))
}

/// Parse a signaling envelope back into a session description.
pub(crate) fn deserialize_description(raw: &str) -> Result<RTCSessionDescription> {
    let envelope: Envelope = serde_json::from_str(raw).map_err(|e| Error::Sdp(e.to_string()))?;
    let desc = match envelope.kind.as_str() {
        "offer" => RTCSessionDescription::offer(envelope.sdp),
        "pranswer" => RTCSessionDescription::pranswer(envelope.sdp),
        "answer" => RTCSessionDescription::answer(envelope.sdp),
        other => {
            return Err(Error::Sdp(format!(
                "unsupported description type {:?}",
                other
            )))
        }
    };
    desc.map_err(|e| Error::Sdp(e.to_string()))
}

/// Whether an address is reachable from outside the host's own networks.
pub(crate) fn is_remote_address(ip: IpAddr) -> bool {
    !(is_local(ip) || ip.is_unspecified() || ip.is_loopback())
}

fn is_local(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            let head = v6.segments()[0];
            // fc00::/7 unique local, fe80::/10 link local
            (head & 0xfe00) == 0xfc00 || (head & 0xffc0) == 0xfe80
        }
    }
}

/// Drop ICE candidate lines whose connection address a censored client
/// could never reach (private, loopback, unspecified).
///
/// Candidates with non-IP addresses (e.g. mDNS hostnames) are kept as-is.
pub(crate) fn strip_local_addresses(sdp: &str) -> String {
    let kept: Vec<&str> = sdp
        .split("\r\n")
        .filter(|line| {
            let Some(rest) = line.strip_prefix("a=candidate:") else {
                return true;
            };
            // foundation component transport priority address port typ ...
            let Some(addr) = rest.split_whitespace().nth(4) else {
                return true;
            };
            match addr.parse::<IpAddr>() {
                Ok(ip) => is_remote_address(ip),
                Err(_) => true,
            }
        })
        .collect();
    kept.join("\r\n")
}
