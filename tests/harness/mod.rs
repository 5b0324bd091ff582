//! Test fixtures: a mock broker, a mock NAT probe, an echoing relay, and a
//! real WebRTC client peer.
//!
//! The broker and probe speak the proxy's wire format from literal JSON so
//! the tests double as wire-compatibility checks. The client peer and the
//! probe's answering peer are real `webrtc` peer connections; tests run
//! them host-candidate-only (no STUN) so everything stays in-process.

#![allow(dead_code)]

use anyhow::Result;
use axum::body::Bytes as AxumBytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use polynya::ProxyConfig;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio_tungstenite::tungstenite::handshake::server::{
    Request as WsRequest, Response as WsResponse,
};
use tokio_tungstenite::tungstenite::Message;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

/// Initialize test logging (call once per test)
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,polynya=debug")
        .try_init();
}

/// Poll `cond` until it holds or `timeout` elapses.
pub async fn wait_until<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    cond()
}

/// Proxy configuration pointed at the given fixtures, tuned for tests:
/// host-candidate-only ICE, answers keep local addresses, fast cadences.
pub fn test_config(broker_url: &str, relay_url: &str, probe_url: &str) -> ProxyConfig {
    let mut config = ProxyConfig::default()
        .with_broker_url(broker_url)
        .with_relay_url(relay_url)
        .with_probe_url(probe_url)
        .with_stun_url("")
        .with_keep_local_addresses(true);
    config.poll_interval = Duration::from_millis(50);
    config.data_channel_timeout = Duration::from_secs(10);
    config
}

/// A probe URL nothing listens on; the probe fails fast and the proxy
/// proceeds with its previous NAT type.
pub const DEAD_PROBE_URL: &str = "http://127.0.0.1:1/";

// ============================================================================
// Mock broker
// ============================================================================

pub struct BrokerState {
    /// Serialized offer envelope handed out on the next poll, once.
    pub offer: Mutex<Option<String>>,
    /// Receives the answer envelope the proxy sends back.
    pub answer_tx: Mutex<Option<oneshot::Sender<String>>>,
    /// Total `/proxy` requests seen.
    pub polls: AtomicUsize,
    /// Body of the most recent poll, decoded.
    pub last_poll: Mutex<Option<Value>>,
    /// `success` flag returned from `/answer`.
    pub answer_success: AtomicBool,
    /// Respond to polls with bytes that are not JSON.
    pub garbage: AtomicBool,
    /// Status code for poll responses.
    pub poll_status: AtomicU16,
}

impl BrokerState {
    fn new() -> Self {
        Self {
            offer: Mutex::new(None),
            answer_tx: Mutex::new(None),
            polls: AtomicUsize::new(0),
            last_poll: Mutex::new(None),
            answer_success: AtomicBool::new(true),
            garbage: AtomicBool::new(false),
            poll_status: AtomicU16::new(200),
        }
    }
}

pub struct MockBroker {
    pub state: Arc<BrokerState>,
    addr: SocketAddr,
}

impl MockBroker {
    pub async fn start() -> Result<Self> {
        let state = Arc::new(BrokerState::new());
        let router = Router::new()
            .route("/proxy", post(broker_poll))
            .route("/answer", post(broker_answer))
            .with_state(Arc::clone(&state));

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        Ok(Self { state, addr })
    }

    pub fn url(&self) -> String {
        format!("http://{}/", self.addr)
    }

    /// Queue an offer and return the channel on which the proxy's answer
    /// envelope arrives.
    pub async fn expect_session(&self, offer_envelope: String) -> oneshot::Receiver<String> {
        *self.state.offer.lock().await = Some(offer_envelope);
        let (tx, rx) = oneshot::channel();
        *self.state.answer_tx.lock().await = Some(tx);
        rx
    }
}

async fn broker_poll(State(state): State<Arc<BrokerState>>, body: AxumBytes) -> Response {
    state.polls.fetch_add(1, Ordering::SeqCst);
    if let Ok(value) = serde_json::from_slice::<Value>(&body) {
        *state.last_poll.lock().await = Some(value);
    }

    let status = state.poll_status.load(Ordering::SeqCst);
    if status != 200 {
        return StatusCode::from_u16(status).unwrap().into_response();
    }
    if state.garbage.load(Ordering::SeqCst) {
        return "definitely not json".into_response();
    }

    let sdp = state.offer.lock().await.take().unwrap_or_default();
    Json(json!({ "sdp": sdp, "relayURL": "" })).into_response()
}

async fn broker_answer(State(state): State<Arc<BrokerState>>, body: AxumBytes) -> Response {
    let value: Value = serde_json::from_slice(&body).unwrap_or_default();
    let answer = value["answer"].as_str().unwrap_or_default().to_string();
    if let Some(tx) = state.answer_tx.lock().await.take() {
        let _ = tx.send(answer);
    }
    Json(json!({ "success": state.answer_success.load(Ordering::SeqCst) })).into_response()
}

// ============================================================================
// Mock NAT probe
// ============================================================================

/// What the probe's answering peer does after replying.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum ProbeMode {
    /// Stay alive so the probe's data channel opens.
    Reachable,
    /// Close immediately so the data channel never opens.
    Unreachable,
}

struct ProbeState {
    mode: ProbeMode,
    /// Keeps reachable answering peers alive for the duration of the test.
    peers: Mutex<Vec<Arc<RTCPeerConnection>>>,
}

pub struct MockProbe {
    addr: SocketAddr,
    state: Arc<ProbeState>,
}

impl MockProbe {
    pub async fn start(mode: ProbeMode) -> Result<Self> {
        let state = Arc::new(ProbeState {
            mode,
            peers: Mutex::new(Vec::new()),
        });
        let router = Router::new()
            .route("/", post(probe_exchange))
            .with_state(Arc::clone(&state));

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        Ok(Self { addr, state })
    }

    pub fn url(&self) -> String {
        format!("http://{}/", self.addr)
    }
}

async fn probe_exchange(State(state): State<Arc<ProbeState>>, body: AxumBytes) -> Response {
    let value: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };
    if value["success"] != json!(true) {
        return StatusCode::BAD_REQUEST.into_response();
    }
    let offer_envelope = value["sdp"].as_str().unwrap_or_default();

    let (pc, answer_envelope) = match answering_peer(offer_envelope).await {
        Ok(pair) => pair,
        Err(e) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    };

    match state.mode {
        ProbeMode::Reachable => state.peers.lock().await.push(pc),
        ProbeMode::Unreachable => {
            let _ = pc.close().await;
        }
    }

    Json(json!({ "sid": "probe", "answer": answer_envelope })).into_response()
}

// ============================================================================
// WebRTC helpers
// ============================================================================

async fn new_test_peer() -> Result<Arc<RTCPeerConnection>> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;
    let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();
    let pc = api.new_peer_connection(RTCConfiguration::default()).await?;
    Ok(Arc::new(pc))
}

fn envelope(kind: &str, sdp: &str) -> String {
    json!({ "type": kind, "sdp": sdp }).to_string()
}

pub fn envelope_sdp(raw: &str) -> Result<(String, String)> {
    let value: Value = serde_json::from_str(raw)?;
    let kind = value["type"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("envelope missing type"))?;
    let sdp = value["sdp"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("envelope missing sdp"))?;
    Ok((kind.to_string(), sdp.to_string()))
}

/// Answer an offer envelope with a fresh peer connection; returns the peer
/// and its serialized answer envelope (full candidate set).
async fn answering_peer(offer_envelope: &str) -> Result<(Arc<RTCPeerConnection>, String)> {
    let (kind, sdp) = envelope_sdp(offer_envelope)?;
    anyhow::ensure!(kind == "offer", "expected offer, got {kind}");

    let pc = new_test_peer().await?;
    pc.set_remote_description(RTCSessionDescription::offer(sdp)?)
        .await?;

    let answer = pc.create_answer(None).await?;
    let mut gather_complete = pc.gathering_complete_promise().await;
    pc.set_local_description(answer).await?;
    let _ = gather_complete.recv().await;

    let local = pc
        .local_description()
        .await
        .ok_or_else(|| anyhow::anyhow!("no local description"))?;
    let answer_envelope = envelope("answer", &local.sdp);
    Ok((pc, answer_envelope))
}

/// A censored client, as the proxy sees one: a real peer connection that
/// creates the data channel, offers, and later applies the answer that
/// came back through the broker.
pub struct ClientPeer {
    pub pc: Arc<RTCPeerConnection>,
    pub dc: Arc<RTCDataChannel>,
    opened: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    received: Arc<Mutex<Vec<u8>>>,
}

impl ClientPeer {
    pub async fn new() -> Result<Self> {
        let pc = new_test_peer().await?;
        let dc = pc.create_data_channel("relaydata", None).await?;

        let opened = Arc::new(AtomicBool::new(false));
        let closed = Arc::new(AtomicBool::new(false));
        let received: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));

        let opened_flag = Arc::clone(&opened);
        dc.on_open(Box::new(move || {
            let opened = Arc::clone(&opened_flag);
            Box::pin(async move {
                opened.store(true, Ordering::SeqCst);
            })
        }));

        let closed_flag = Arc::clone(&closed);
        dc.on_close(Box::new(move || {
            let closed = Arc::clone(&closed_flag);
            Box::pin(async move {
                closed.store(true, Ordering::SeqCst);
            })
        }));

        let inbox = Arc::clone(&received);
        dc.on_message(Box::new(move |msg| {
            let inbox = Arc::clone(&inbox);
            Box::pin(async move {
                inbox.lock().await.extend_from_slice(&msg.data);
            })
        }));

        let offer = pc.create_offer(None).await?;
        let mut gather_complete = pc.gathering_complete_promise().await;
        pc.set_local_description(offer).await?;
        let _ = gather_complete.recv().await;

        Ok(Self {
            pc,
            dc,
            opened,
            closed,
            received,
        })
    }

    pub async fn offer_envelope(&self) -> Result<String> {
        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| anyhow::anyhow!("no local description"))?;
        Ok(envelope("offer", &local.sdp))
    }

    pub async fn apply_answer(&self, answer_envelope: &str) -> Result<()> {
        let (kind, sdp) = envelope_sdp(answer_envelope)?;
        anyhow::ensure!(kind == "answer", "expected answer, got {kind}");
        self.pc
            .set_remote_description(RTCSessionDescription::answer(sdp)?)
            .await?;
        Ok(())
    }

    pub async fn wait_open(&self, timeout: Duration) -> bool {
        let opened = Arc::clone(&self.opened);
        wait_until(move || opened.load(Ordering::SeqCst), timeout).await
    }

    pub async fn wait_closed(&self, timeout: Duration) -> bool {
        let closed = Arc::clone(&self.closed);
        wait_until(move || closed.load(Ordering::SeqCst), timeout).await
    }

    pub async fn send(&self, data: &[u8]) -> Result<()> {
        self.dc.send(&bytes::Bytes::copy_from_slice(data)).await?;
        Ok(())
    }

    pub async fn wait_received(&self, len: usize, timeout: Duration) -> Vec<u8> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let inbox = self.received.lock().await;
                if inbox.len() >= len || tokio::time::Instant::now() >= deadline {
                    return inbox.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    pub async fn close(&self) {
        let _ = self.pc.close().await;
    }
}

// ============================================================================
// Echo relay
// ============================================================================

/// WebSocket server that echoes binary frames back to the sender.
pub struct EchoRelay {
    addr: SocketAddr,
    pub connections: Arc<AtomicUsize>,
    /// Request URIs of accepted connections, including query strings.
    pub uris: Arc<std::sync::Mutex<Vec<String>>>,
}

impl EchoRelay {
    pub async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicUsize::new(0));
        let uris: Arc<std::sync::Mutex<Vec<String>>> = Arc::new(std::sync::Mutex::new(Vec::new()));

        let accepted = Arc::clone(&connections);
        let uri_log = Arc::clone(&uris);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                accepted.fetch_add(1, Ordering::SeqCst);
                let uri_log = Arc::clone(&uri_log);
                tokio::spawn(async move {
                    let callback = move |req: &WsRequest, resp: WsResponse| {
                        uri_log.lock().unwrap().push(req.uri().to_string());
                        Ok(resp)
                    };
                    let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await
                    else {
                        return;
                    };
                    while let Some(Ok(msg)) = ws.next().await {
                        match msg {
                            Message::Binary(data) => {
                                if ws.send(Message::Binary(data)).await.is_err() {
                                    break;
                                }
                            }
                            Message::Close(_) => break,
                            _ => {}
                        }
                    }
                });
            }
        });

        Ok(Self {
            addr,
            connections,
            uris,
        })
    }

    pub fn url(&self) -> String {
        format!("ws://{}/", self.addr)
    }
}
