use aether_proto::ProtocolError;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("channel is already connected")]
    AlreadyConnected,

    #[error("another connect attempt is in progress")]
    InProgress,

    #[error("pipe {path:?} not found")]
    NotFound { path: PathBuf },

    #[error("pipe {path:?} did not accept a connection within {waited:?}")]
    Timeout { path: PathBuf, waited: Duration },

    #[error("access to pipe {path:?} denied")]
    AccessDenied { path: PathBuf },

    #[error("connect cancelled by disconnect")]
    Cancelled,

    #[error("connect failed: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("channel is not connected")]
    NotConnected,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("write failed: {0}")]
    Io(#[from] io::Error),
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `disconnect()` was called.
    Requested,
    /// The backend closed the pipe on a frame boundary.
    PeerClosed,
    /// Read or write on the pipe failed.
    Io(io::ErrorKind),
    /// The backend sent something the decoder could not accept.
    Faulted(ProtocolError),
    /// An observer callback panicked on the reader thread.
    ObserverPanicked,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::Requested => write!(f, "disconnect requested"),
            DisconnectReason::PeerClosed => write!(f, "backend closed the pipe"),
            DisconnectReason::Io(kind) => write!(f, "pipe I/O error: {}", kind),
            DisconnectReason::Faulted(err) => write!(f, "protocol fault: {}", err),
            DisconnectReason::ObserverPanicked => write!(f, "observer panicked"),
        }
    }
}
