//! HTTP signaling against the rendezvous broker.

use crate::messages::{AnswerRequest, AnswerResponse, PollRequest, PollResponse, PROXY_TYPE};
use crate::nat::NatTypeCell;
use crate::sdp;
use crate::tokens::TokenPool;
use crate::{Error, Result};
use futures::StreamExt;
use reqwest::StatusCode;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};
use url::Url;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

/// Response deadline for broker and probe requests.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum number of bytes read from a response body.
const READ_LIMIT: usize = 100_000;

/// Client counts are reported to the broker rounded down to a multiple of
/// this, so the broker sees bucketed load rather than exact concurrency.
const CLIENT_BUCKET: usize = 8;

/// One rendezvous endpoint: a parsed base URL plus the HTTP transport used
/// to reach it. One instance is bound to the broker for the lifetime of
/// the proxy; a second transient one talks to the NAT probe.
pub(crate) struct SignalingEndpoint {
    url: Url,
    client: reqwest::Client,
    keep_local_addresses: bool,
}

impl SignalingEndpoint {
    pub(crate) fn new(raw_url: &str, keep_local_addresses: bool) -> Result<Self> {
        let url = Url::parse(raw_url)
            .map_err(|e| Error::InvalidConfig(format!("invalid signaling url {:?}: {}", raw_url, e)))?;
        let client = reqwest::Client::builder()
            .timeout(RESPONSE_TIMEOUT)
            .build()
            .map_err(|e| Error::Transport(format!("failed to create http client: {}", e)))?;
        Ok(Self {
            url,
            client,
            keep_local_addresses,
        })
    }

    pub(crate) fn url(&self) -> &Url {
        &self.url
    }

    /// POST `body` to `url`, reading at most `READ_LIMIT` bytes back.
    ///
    /// A non-200 status or an over-long body is an error; there are no
    /// retries at this layer.
    pub(crate) async fn post(&self, url: Url, body: Vec<u8>) -> Result<Vec<u8>> {
        let response = self
            .client
            .post(url)
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        if response.status() != StatusCode::OK {
            return Err(Error::RemoteStatus(response.status().as_u16()));
        }

        let mut data = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::Transport(e.to_string()))?;
            if data.len() + chunk.len() > READ_LIMIT {
                data.extend_from_slice(&chunk[..READ_LIMIT - data.len()]);
                return Err(Error::ResponseTruncated);
            }
            data.extend_from_slice(&chunk);
        }
        Ok(data)
    }

    fn resolve(&self, path: &str) -> Result<Url> {
        self.url
            .join(path)
            .map_err(|e| Error::InvalidConfig(format!("cannot resolve {:?}: {}", path, e)))
    }

    /// Poll the broker until it hands out a client offer.
    ///
    /// One request is issued immediately, then one per tick. Returns `None`
    /// when the shutdown gate closes or a response fails to decode;
    /// transport errors only log and keep the ticker running.
    pub(crate) async fn poll_offer(
        &self,
        sid: &str,
        nat_type: &NatTypeCell,
        tokens: &TokenPool,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Option<RTCSessionDescription> {
        let poll_url = match self.resolve("proxy") {
            Ok(url) => url,
            Err(e) => {
                warn!("{}", e);
                return None;
            }
        };

        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait_for(|stopped| *stopped) => return None,
                _ = ticker.tick() => {}
            }

            let clients_available = (tokens.in_use() / CLIENT_BUCKET) * CLIENT_BUCKET;
            let request = PollRequest {
                sid: sid.to_string(),
                proxy_type: PROXY_TYPE.to_string(),
                nat_type: nat_type.get(),
                clients_available,
            };
            let body = match request.to_bytes() {
                Ok(body) => body,
                Err(e) => {
                    warn!("error encoding poll message: {}", e);
                    return None;
                }
            };

            let raw = match self.post(poll_url.clone(), body).await {
                Ok(raw) => raw,
                Err(e) => {
                    warn!("error polling broker: {}", e);
                    continue;
                }
            };

            let response = match PollResponse::from_bytes(&raw) {
                Ok(response) => response,
                Err(e) => {
                    warn!("error reading broker response: {}", e);
                    return None;
                }
            };
            if response.sdp.is_empty() {
                debug!("no client waiting");
                continue;
            }

            match sdp::deserialize_description(&response.sdp) {
                Ok(offer) => return Some(offer),
                Err(e) => {
                    warn!("error processing session description: {}", e);
                    return None;
                }
            }
        }
    }

    /// Deliver the local answer for `sid` back through the broker.
    ///
    /// Strips private-range candidates first unless the endpoint was built
    /// with `keep_local_addresses`. A `success: false` reply means the
    /// client stopped waiting.
    pub(crate) async fn send_answer(&self, sid: &str, pc: &RTCPeerConnection) -> Result<()> {
        let answer_url = self.resolve("answer")?;

        let local = pc
            .local_description()
            .await
            .ok_or_else(|| Error::Sdp("local description not set".to_string()))?;
        let local = if self.keep_local_addresses {
            local
        } else {
            RTCSessionDescription::answer(sdp::strip_local_addresses(&local.sdp))
                .map_err(|e| Error::Sdp(e.to_string()))?
        };

        let request = AnswerRequest {
            sid: sid.to_string(),
            answer: sdp::serialize_description(&local)?,
        };
        let raw = self.post(answer_url, request.to_bytes()?).await?;

        let response = AnswerResponse::from_bytes(&raw)?;
        if !response.success {
            return Err(Error::ClientTimeout);
        }
        Ok(())
    }
}
