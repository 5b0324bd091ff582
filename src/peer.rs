//! Peer-connection construction and data-channel plumbing.
//!
//! The transport library delivers data-channel events through boxed async
//! callbacks. Everything the callbacks learn is converted into message
//! passing: a one-shot gate signals that the client showed up, and an
//! in-memory byte pipe carries inbound payloads to the relay splice in
//! arrival order.

use crate::config::ProxyConfig;
use crate::relay::{self, SpliceContext};
use crate::{Error, Result};
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::io::{simplex, AsyncWriteExt, SimplexStream, WriteHalf};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

/// Bytes buffered between the data-channel callback and the relay splice.
const PIPE_CAPACITY: usize = 64 * 1024;

/// ICE servers for the configured STUN URL.
pub(crate) fn ice_servers(config: &ProxyConfig) -> Vec<RTCIceServer> {
    if config.stun_url.is_empty() {
        return Vec::new();
    }
    vec![RTCIceServer {
        urls: vec![config.stun_url.clone()],
        ..Default::default()
    }]
}

fn build_api() -> Result<API> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(|e| Error::PeerConnection(format!("register codecs: {}", e)))?;

    let registry = register_default_interceptors(Registry::new(), &mut media_engine)
        .map_err(|e| Error::PeerConnection(format!("register interceptors: {}", e)))?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

async fn new_peer_connection(ice_servers: Vec<RTCIceServer>) -> Result<Arc<RTCPeerConnection>> {
    let api = build_api()?;
    let pc = api
        .new_peer_connection(RTCConfiguration {
            ice_servers,
            ..Default::default()
        })
        .await
        .map_err(|e| Error::PeerConnection(format!("create: {}", e)))?;
    Ok(Arc::new(pc))
}

async fn close_on_error(pc: &RTCPeerConnection) {
    if let Err(e) = pc.close().await {
        warn!("peer connection close after failure: {}", e);
    }
}

/// Per-session byte counters, reported when the data channel closes.
pub(crate) struct TrafficStats {
    /// client -> relay
    inbound: AtomicU64,
    /// relay -> client
    outbound: AtomicU64,
    started: Instant,
}

impl TrafficStats {
    fn new() -> Self {
        Self {
            inbound: AtomicU64::new(0),
            outbound: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub(crate) fn add_inbound(&self, n: usize) {
        self.inbound.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_outbound(&self, n: usize) {
        self.outbound.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn summary(&self) -> String {
        format!(
            "relayed {} B up, {} B down in {} s",
            self.inbound.load(Ordering::Relaxed),
            self.outbound.load(Ordering::Relaxed),
            self.started.elapsed().as_secs()
        )
    }
}

/// Live client session handed to the relay splice.
#[derive(Clone)]
pub(crate) struct PeerSession {
    pc: Arc<RTCPeerConnection>,
    dc: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    pub(crate) traffic: Arc<TrafficStats>,
}

impl PeerSession {
    /// Forward relay bytes to the client.
    pub(crate) async fn send(&self, data: &[u8]) -> Result<()> {
        // Clone the handle out so the slot lock is never held across I/O.
        let dc = self.dc.lock().await.clone();
        let dc = dc.ok_or_else(|| Error::DataChannel("channel closed".to_string()))?;
        dc.send(&Bytes::copy_from_slice(data))
            .await
            .map_err(|e| Error::DataChannel(e.to_string()))?;
        self.traffic.add_outbound(data.len());
        Ok(())
    }

    pub(crate) async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            debug!("peer connection close: {}", e);
        }
    }
}

/// Build a peer connection from a client offer.
///
/// Installs an on-data-channel handler that fires the `opened` gate,
/// plumbs inbound messages into a byte pipe, and spawns the relay splice.
/// Blocks until ICE gathering completes, so the local description carries
/// the full candidate set when this returns.
pub(crate) async fn connect_from_offer(
    offer: RTCSessionDescription,
    ice_servers: Vec<RTCIceServer>,
    opened: mpsc::Sender<()>,
    ctx: SpliceContext,
) -> Result<Arc<RTCPeerConnection>> {
    let pc = new_peer_connection(ice_servers).await?;

    // The handler lives inside the peer connection, so it may only hold a
    // weak reference back to it. An upgrade failure means the session was
    // already torn down and the late channel is ignored.
    let pc_for_channel = Arc::downgrade(&pc);
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        info!("incoming data channel: {}", dc.label());
        let _ = opened.try_send(());
        let pc: Option<Arc<RTCPeerConnection>> = Weak::upgrade(&pc_for_channel);
        let ctx = ctx.clone();
        Box::pin(async move {
            match pc {
                Some(pc) => accept_channel(pc, dc, ctx).await,
                None => debug!("data channel after session teardown; ignoring"),
            }
        })
    }));

    let mut gather_complete = pc.gathering_complete_promise().await;

    if let Err(e) = pc.set_remote_description(offer).await {
        close_on_error(&pc).await;
        return Err(Error::PeerConnection(format!(
            "set remote description: {}",
            e
        )));
    }
    debug!("client offer accepted");

    let answer = match pc.create_answer(None).await {
        Ok(answer) => answer,
        Err(e) => {
            close_on_error(&pc).await;
            return Err(Error::PeerConnection(format!("create answer: {}", e)));
        }
    };
    if let Err(e) = pc.set_local_description(answer).await {
        close_on_error(&pc).await;
        return Err(Error::PeerConnection(format!(
            "set local description: {}",
            e
        )));
    }

    // The answer goes back through the broker as a single blob, so wait
    // for the candidate set to be complete instead of trickling.
    let _ = gather_complete.recv().await;

    Ok(pc)
}

/// Wire a freshly announced data channel into a session and launch its
/// relay splice.
async fn accept_channel(pc: Arc<RTCPeerConnection>, dc: Arc<RTCDataChannel>, ctx: SpliceContext) {
    let (pipe_reader, pipe_writer) = simplex(PIPE_CAPACITY);
    let writer: Arc<Mutex<Option<WriteHalf<SimplexStream>>>> =
        Arc::new(Mutex::new(Some(pipe_writer)));
    let traffic = Arc::new(TrafficStats::new());

    let session = PeerSession {
        pc: Arc::clone(&pc),
        dc: Arc::new(Mutex::new(Some(Arc::clone(&dc)))),
        traffic: Arc::clone(&traffic),
    };

    dc.on_open(Box::new(|| {
        Box::pin(async {
            info!("data channel open");
        })
    }));

    let dc_slot = Arc::clone(&session.dc);
    let writer_for_close = Arc::clone(&writer);
    let traffic_for_close = Arc::clone(&traffic);
    dc.on_close(Box::new(move || {
        let dc_slot = Arc::clone(&dc_slot);
        let writer = Arc::clone(&writer_for_close);
        let traffic = Arc::clone(&traffic_for_close);
        Box::pin(async move {
            let mut slot = dc_slot.lock().await;
            if let Some(dc) = slot.take() {
                if let Err(e) = dc.close().await {
                    debug!("data channel close: {}", e);
                }
            }
            drop(slot);
            // Dropping the write half ends the uplink at EOF.
            writer.lock().await.take();
            info!("data channel closed; {}", traffic.summary());
        })
    }));

    let writer_for_message = Arc::clone(&writer);
    let traffic_for_message = Arc::clone(&traffic);
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let writer = Arc::clone(&writer_for_message);
        let traffic = Arc::clone(&traffic_for_message);
        Box::pin(async move {
            let mut guard = writer.lock().await;
            let Some(pipe) = guard.as_mut() else {
                return;
            };
            match pipe.write_all(&msg.data).await {
                Ok(()) => traffic.add_inbound(msg.data.len()),
                Err(e) if e.kind() == std::io::ErrorKind::WriteZero => {
                    // An in-memory pipe that short-writes has broken its
                    // contract; nothing downstream can be trusted.
                    panic!("short write on session pipe: {}", e);
                }
                Err(e) => {
                    debug!("session pipe write failed: {}", e);
                    guard.take();
                }
            }
        })
    }));

    let client_addr = remote_peer_addr(&pc).await;
    tokio::spawn(relay::splice(session, pipe_reader, client_addr, ctx));
}

/// Textual address of the selected remote ICE candidate, if one exists.
async fn remote_peer_addr(pc: &RTCPeerConnection) -> Option<String> {
    let pair = pc
        .sctp()
        .transport()
        .ice_transport()
        .get_selected_candidate_pair()
        .await?;
    Some(format!("{}:{}", pair.remote.address, pair.remote.port))
}

/// Build the probe's outbound peer connection.
///
/// A data channel must exist before the offer is created; its open event
/// feeds the `opened` gate the prober races against the deadline. Blocks
/// until ICE gathering completes.
pub(crate) async fn new_probe_connection(
    ice_servers: Vec<RTCIceServer>,
    opened: mpsc::Sender<()>,
) -> Result<Arc<RTCPeerConnection>> {
    let pc = new_peer_connection(ice_servers).await?;

    let dc = match pc.create_data_channel("probe", None).await {
        Ok(dc) => dc,
        Err(e) => {
            close_on_error(&pc).await;
            return Err(Error::DataChannel(format!("create: {}", e)));
        }
    };
    dc.on_open(Box::new(move || {
        let opened = opened.clone();
        Box::pin(async move {
            debug!("probe data channel open");
            let _ = opened.try_send(());
        })
    }));
    dc.on_close(Box::new(|| {
        Box::pin(async {
            debug!("probe data channel closed");
        })
    }));

    let offer = match pc.create_offer(None).await {
        Ok(offer) => offer,
        Err(e) => {
            close_on_error(&pc).await;
            return Err(Error::PeerConnection(format!("create offer: {}", e)));
        }
    };

    let mut gather_complete = pc.gathering_complete_promise().await;
    if let Err(e) = pc.set_local_description(offer).await {
        close_on_error(&pc).await;
        return Err(Error::PeerConnection(format!(
            "set local description: {}",
            e
        )));
    }
    let _ = gather_complete.recv().await;

    Ok(pc)
}
