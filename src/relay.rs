//! Relay dialing and the bidirectional copy loop.

use crate::peer::PeerSession;
use crate::tokens::SessionToken;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, ReadHalf, SimplexStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

/// Read granularity of the uplink copier.
const COPY_BUF: usize = 32 * 1024;

/// Everything a session needs to reach the relay and wind itself down.
#[derive(Clone)]
pub(crate) struct SpliceContext {
    pub(crate) relay_url: Url,
    pub(crate) shutdown: watch::Receiver<bool>,
    pub(crate) token: Arc<SessionToken>,
}

/// Relay URL with the client address tagged on when the transport
/// reported one. An existing `client_ip` parameter is overwritten.
pub(crate) fn relay_url_for(relay: &Url, client_addr: Option<&str>) -> Url {
    let mut url = relay.clone();
    if let Some(addr) = client_addr {
        let retained: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(key, _)| key != "client_ip")
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();
        let mut pairs = url.query_pairs_mut();
        pairs.clear();
        pairs.extend_pairs(retained);
        pairs.append_pair("client_ip", addr);
    }
    url
}

/// Splice a client session onto the relay.
///
/// Two copiers run until either direction finishes or the shutdown gate
/// closes; then both endpoints are closed and the session's token goes
/// back to the pool. Errors end the splice but never propagate.
pub(crate) async fn splice(
    session: PeerSession,
    mut pipe: ReadHalf<SimplexStream>,
    client_addr: Option<String>,
    ctx: SpliceContext,
) {
    let SpliceContext {
        relay_url,
        mut shutdown,
        token,
    } = ctx;

    if client_addr.is_none() {
        warn!("no remote address reported for session");
    }
    let url = relay_url_for(&relay_url, client_addr.as_deref());

    let ws = match connect_async(url.as_str()).await {
        Ok((ws, _)) => ws,
        Err(e) => {
            info!("error dialing relay: {}", e);
            session.close().await;
            token.release();
            return;
        }
    };
    info!("connected to relay");

    let (mut sink, mut stream) = ws.split();
    let (done_tx, mut done_rx) = mpsc::channel::<()>(2);

    let done_for_uplink = done_tx.clone();
    let uplink = tokio::spawn(async move {
        let mut buf = vec![0u8; COPY_BUF];
        loop {
            match pipe.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if let Err(e) = sink.send(Message::Binary(buf[..n].to_vec())).await {
                        info!("relay send failed: {}", e);
                        break;
                    }
                }
                Err(e) => {
                    // A vanished pipe just means the other side won.
                    debug!("session pipe read ended: {}", e);
                    break;
                }
            }
        }
        let _ = done_for_uplink.try_send(());
    });

    let session_for_downlink = session.clone();
    let downlink = tokio::spawn(async move {
        while let Some(next) = stream.next().await {
            match next {
                Ok(Message::Binary(data)) => {
                    if let Err(e) = session_for_downlink.send(&data).await {
                        debug!("forward to client failed: {}", e);
                        break;
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    info!("relay receive failed: {}", e);
                    break;
                }
            }
        }
        let _ = done_tx.try_send(());
    });

    tokio::select! {
        _ = done_rx.recv() => {}
        _ = shutdown.wait_for(|stopped| *stopped) => {}
    }

    uplink.abort();
    downlink.abort();
    session.close().await;
    token.release();
    info!("copy loop ended");
}
