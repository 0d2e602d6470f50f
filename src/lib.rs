//! Frontend side of the AetherVisor backend pipe.
//!
//! A [`Channel`] owns one connection to the backend's well-known pipe, sends
//! requests as length-prefixed frames and dispatches inbound frames to
//! [`ChannelObserver`]s from a background reader thread. The frame format
//! itself lives in the `aether-proto` crate.

mod channel;
mod config;
mod error;
mod event;
mod reader;
#[cfg(test)]
mod testing;
mod transport;

pub use aether_proto as proto;
pub use aether_proto::{AnalysisResult, ProtocolError};
pub use channel::{Channel, ConnectionState};
pub use config::{default_pipe_dir, ChannelConfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_PIPE_NAME};
pub use error::{ConnectError, DisconnectReason, SendError};
pub use event::{ChannelEvent, ChannelObserver, EventSender};
