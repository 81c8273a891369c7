//! Error types for the telemetry relay library.

use std::fmt;

/// Errors that can occur in the telemetry relay library.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Capture**: [`CaptureUnavailable`](Self::CaptureUnavailable): the
///   device was denied, missing, busy, or revoked. Fatal to a publisher session.
/// - **Encoding**: [`EncodeFailure`](Self::EncodeFailure): one frame could not
///   be compressed. The publisher skips the tick.
/// - **Channel**: [`ChannelFault`](Self::ChannelFault),
///   [`WebSocket`](Self::WebSocket), [`Io`](Self::Io): handled by the
///   [`ReconnectSupervisor`](crate::channel::ReconnectSupervisor), never
///   surfaced to `start()` callers.
/// - **Control**: [`InvalidSource`](Self::InvalidSource),
///   [`Http`](Self::Http): returned from pull commands.
/// - **Messages**: [`MalformedMessage`](Self::MalformedMessage),
///   [`Json`](Self::Json): one inbound message was dropped.
/// - **Lifecycle**: [`NotStarted`](Self::NotStarted),
///   [`AlreadyRunning`](Self::AlreadyRunning).
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// The capture device could not be acquired or was permanently revoked.
    #[error("capture unavailable: {0}")]
    CaptureUnavailable(String),

    /// A captured image could not be encoded within the size bound.
    #[error("encode failure: {kind}")]
    EncodeFailure { kind: EncodeErrorKind },

    /// The duplex channel dropped or failed to connect.
    #[error("channel fault: {0}")]
    ChannelFault(String),

    /// A pull command was issued with an unusable source URL.
    #[error("invalid source: {0}")]
    InvalidSource(String),

    /// An inbound envelope could not be interpreted.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket handshake or framing error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Control-plane HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// [`RelayServer::start`](crate::RelayServer::start) has not been called yet.
    #[error("relay not started")]
    NotStarted,

    /// `start()` was called while already running.
    #[error("already running")]
    AlreadyRunning,
}

/// Specific kind of encode failure.
#[derive(Debug)]
pub enum EncodeErrorKind {
    /// Pixel buffer length does not match `width * height * 3`.
    BufferMismatch,
    /// The codec rejected the image.
    Codec(String),
    /// Output stayed above the size bound after every downscale attempt.
    OverBudget { bytes: usize, limit: usize },
}

impl fmt::Display for EncodeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BufferMismatch => write!(f, "pixel buffer does not match dimensions"),
            Self::Codec(msg) => write!(f, "codec error: {msg}"),
            Self::OverBudget { bytes, limit } => {
                write!(f, "encoded size {bytes} exceeds limit {limit}")
            }
        }
    }
}

/// Convenience alias for `Result<T, RelayError>`.
pub type Result<T> = std::result::Result<T, RelayError>;
