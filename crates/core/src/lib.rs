//! Live visual telemetry relay.
//!
//! Camera frames flow one way through a relay:
//!
//! ```text
//! Publisher ──binary JPEG──> relay ──JSON envelopes──> Subscriber × N
//!                              ^
//!                PullController│start/stop (relay fetches frames itself)
//! ```
//!
//! Publishers and subscribers each hold one supervised WebSocket that
//! reconnects with backoff until stopped.

pub mod channel;
pub mod config;
pub mod error;
pub mod media;
pub mod protocol;
pub mod publisher;
pub mod pull;
pub mod relay;
pub mod subscriber;

pub use channel::{ChannelHandle, ChannelMessage, ChannelState, Connector, ReconnectSupervisor};
pub use config::{BackoffConfig, ClientConfig, RelayConfig};
pub use error::{RelayError, Result};
pub use media::{CaptureError, CaptureSource, SyntheticCamera};
pub use protocol::{Envelope, PullKind, RiskLevel, RiskSignal};
pub use publisher::{Publisher, PublisherStatus};
pub use pull::{ControlClient, HttpControlClient, PullController, PullState};
pub use relay::{RelayServer, Viewer};
pub use subscriber::{Subscriber, ViewState};
