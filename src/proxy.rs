//! Process-wide runtime: the polling loop and per-session supervision.

use crate::config::ProxyConfig;
use crate::nat::{self, NatType, NatTypeCell};
use crate::peer;
use crate::relay::SpliceContext;
use crate::signaling::SignalingEndpoint;
use crate::tokens::{SessionToken, TokenPool};
use crate::{Error, Result};
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use url::Url;

const SESSION_ID_LENGTH: usize = 16;

/// A volunteer proxy instance.
///
/// Construction validates the configuration; [`start`](Proxy::start)
/// probes NAT compatibility once and then polls the broker for clients
/// until [`stop`](Proxy::stop) closes the shutdown gate. Each admitted
/// session bridges one client's data channel to the upstream relay.
///
/// # Example
///
/// ```no_run
/// use polynya::{Proxy, ProxyConfig};
///
/// # async fn example() -> polynya::Result<()> {
/// let proxy = std::sync::Arc::new(Proxy::new(ProxyConfig::default().with_capacity(10))?);
///
/// let runner = std::sync::Arc::clone(&proxy);
/// tokio::spawn(async move { runner.start().await });
///
/// // ... later ...
/// proxy.stop();
/// # Ok(())
/// # }
/// ```
pub struct Proxy {
    config: ProxyConfig,
    broker: SignalingEndpoint,
    relay_url: Url,
    tokens: Arc<TokenPool>,
    nat_type: NatTypeCell,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Proxy {
    /// Validate `config` and bind the broker endpoint and token pool.
    pub fn new(config: ProxyConfig) -> Result<Self> {
        config.validate()?;

        let broker = SignalingEndpoint::new(&config.broker_url, config.keep_local_addresses)?;
        let relay_url = Url::parse(&config.relay_url)
            .map_err(|e| Error::InvalidConfig(format!("invalid relay url: {}", e)))?;
        let tokens = Arc::new(TokenPool::new(config.capacity));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            config,
            broker,
            relay_url,
            tokens,
            nat_type: NatTypeCell::new(),
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Probe NAT compatibility, then run the polling loop until `stop`.
    ///
    /// The loop admits at most `capacity` concurrent sessions; splices and
    /// data-channel callbacks run on their own tasks, so a long-lived
    /// session never blocks the next poll.
    pub async fn start(&self) -> Result<()> {
        info!("starting; session capacity {}", self.tokens.capacity());

        match nat::check_nat_type(
            &self.config.probe_url,
            peer::ice_servers(&self.config),
            self.config.data_channel_timeout,
        )
        .await
        {
            Ok(kind) => self.nat_type.set(kind),
            Err(e) => warn!("NAT probe failed: {}", e),
        }
        info!("NAT type: {}", self.nat_type.get());

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        let mut shutdown = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait_for(|stopped| *stopped) => break,
                _ = ticker.tick() => {}
            }

            self.tokens.acquire().await;
            let sid = gen_session_id();
            self.run_session(&sid).await;
        }

        info!("polling loop stopped");
        Ok(())
    }

    /// Close the shutdown gate.
    ///
    /// Every long wait — the poll ticker, the supervisor's readiness wait,
    /// the copy loops — observes the gate and exits promptly. Calling this
    /// more than once has no further effect.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// NAT type determined by the startup probe.
    pub fn nat_type(&self) -> NatType {
        self.nat_type.get()
    }

    /// Number of sessions currently holding a token. Approximate: the
    /// value may be stale by the time the caller reads it.
    pub fn active_sessions(&self) -> usize {
        self.tokens.in_use()
    }

    /// Drive one session: poll an offer, build the peer connection, send
    /// the answer, then wait for the client's data channel.
    ///
    /// Every exit path returns the session's token exactly once — either
    /// here, or in the relay splice once the data channel has opened.
    async fn run_session(&self, sid: &str) {
        let token = Arc::new(SessionToken::new(Arc::clone(&self.tokens)));

        let offer = match self
            .broker
            .poll_offer(
                sid,
                &self.nat_type,
                &self.tokens,
                self.config.poll_interval,
                self.shutdown_rx.clone(),
            )
            .await
        {
            Some(offer) => offer,
            None => {
                token.release();
                return;
            }
        };

        let (opened_tx, mut opened_rx) = mpsc::channel(1);
        let ctx = SpliceContext {
            relay_url: self.relay_url.clone(),
            shutdown: self.shutdown_rx.clone(),
            token: Arc::clone(&token),
        };

        let pc = match peer::connect_from_offer(
            offer,
            peer::ice_servers(&self.config),
            opened_tx,
            ctx,
        )
        .await
        {
            Ok(pc) => pc,
            Err(e) => {
                warn!("error building peer connection: {}", e);
                token.release();
                return;
            }
        };

        if let Err(e) = self.broker.send_answer(sid, &pc).await {
            warn!("error sending answer through broker: {}", e);
            if let Err(e) = pc.close().await {
                warn!("peer connection close: {}", e);
            }
            token.release();
            return;
        }

        tokio::select! {
            biased;
            _ = opened_rx.recv() => {
                info!("connection successful");
            }
            _ = tokio::time::sleep(self.config.data_channel_timeout) => {
                info!("timed out waiting for client to open data channel");
                if let Err(e) = pc.close().await {
                    warn!("peer connection close: {}", e);
                }
                token.release();
            }
        }
    }
}

/// Fresh 16-byte session identifier, base64 without padding.
pub(crate) fn gen_session_id() -> String {
    let mut buf = [0u8; SESSION_ID_LENGTH];
    OsRng.fill_bytes(&mut buf);
    STANDARD_NO_PAD.encode(buf)
}
