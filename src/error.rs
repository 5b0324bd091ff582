//! Error types for the proxy engine.

/// Result type alias using the proxy Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while rendezvousing, negotiating, or relaying.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Network-level failure talking to the broker or probe
    #[error("transport error: {0}")]
    Transport(String),

    /// Broker or probe answered with a non-success status
    #[error("remote returned status code {0}")]
    RemoteStatus(u16),

    /// Response body was larger than the read limit
    #[error("response body exceeded the read limit")]
    ResponseTruncated,

    /// Wire message failed to encode or decode
    #[error("message codec error: {0}")]
    Codec(String),

    /// Session description failed to (de)serialize or parse
    #[error("session description error: {0}")]
    Sdp(String),

    /// Broker reported that the client gave up waiting for our answer
    #[error("broker reported client timeout")]
    ClientTimeout,

    /// WebRTC peer connection error
    #[error("peer connection error: {0}")]
    PeerConnection(String),

    /// Data channel error
    #[error("data channel error: {0}")]
    DataChannel(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the poll loop should keep ticking after this error.
    ///
    /// Transport-level failures are soft; everything else ends the session.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::RemoteStatus(_) | Error::ResponseTruncated
        )
    }
}
