//! Wire formats exchanged with the relay.
//!
//! ## Channels
//!
//! | Direction | Encoding | Contents |
//! |-----------|----------|----------|
//! | Publisher → relay | binary message | one JPEG per message, no header |
//! | Relay → subscriber | JSON text | [`Envelope`] tagged by `type` |
//! | Subscriber → relay | text | `"ping"` liveness messages |
//!
//! ## Control plane (HTTP)
//!
//! ```text
//! POST /stream/start   {"url": "...", "kind": "fire"|"ppe"|"both"}
//! POST /stream/stop    {}
//! GET  /stream/status
//! POST /stream/push    {"image": "data:image/jpeg;base64,...", "kind": "both"}
//! ```

pub mod control;
pub mod envelope;

pub use control::{PullKind, PullStatus, PushBody, PushReply, StartBody};
pub use envelope::{
    AlertPayload, Detection, Envelope, FramePayload, RiskLevel, RiskSignal, decode_data_url,
    jpeg_data_url,
};

/// Text a subscriber sends to keep its connection alive.
pub const PING: &str = "ping";
