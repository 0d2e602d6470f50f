//! Inbound notifications and the observer seam the UI layer subscribes through.
//!
//! Observers run on the channel's reader thread, in frame arrival order.
//! Marshaling onto a UI thread is up to the observer.

use crate::error::DisconnectReason;
use aether_proto::{AnalysisResult, ProtocolError};
use serde::{Serialize, Serializer};
use std::sync::mpsc;

pub trait ChannelObserver: Send + Sync {
    fn on_console_output(&self, _line: &str) {}

    fn on_status_update(&self, _status: &str) {}

    fn on_analysis_result(&self, _result: AnalysisResult) {}

    /// The read loop hit a protocol error. Always followed by
    /// `on_disconnected(DisconnectReason::Faulted(..))`.
    fn on_faulted(&self, _error: &ProtocolError) {}

    fn on_disconnected(&self, _reason: &DisconnectReason) {}
}

/// Owned form of every observer callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ChannelEvent {
    ConsoleOutput {
        line: String,
    },
    StatusUpdate {
        status: String,
    },
    AnalysisResult {
        #[serde(serialize_with = "serialize_analysis_result")]
        result: AnalysisResult,
    },
    Faulted {
        #[serde(serialize_with = "serialize_display")]
        error: ProtocolError,
    },
    Disconnected {
        #[serde(serialize_with = "serialize_display")]
        reason: DisconnectReason,
    },
}

fn serialize_analysis_result<S: Serializer>(
    result: &AnalysisResult,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(result.as_str())
}

fn serialize_display<T: std::fmt::Display, S: Serializer>(
    value: &T,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

/// Observer that forwards every callback into an mpsc channel.
pub struct EventSender {
    tx: mpsc::Sender<ChannelEvent>,
}

impl EventSender {
    pub fn new() -> (Self, mpsc::Receiver<ChannelEvent>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: ChannelEvent) {
        // Receiver gone means nobody is listening any more.
        let _ = self.tx.send(event);
    }
}

impl ChannelObserver for EventSender {
    fn on_console_output(&self, line: &str) {
        self.forward(ChannelEvent::ConsoleOutput {
            line: line.to_string(),
        });
    }

    fn on_status_update(&self, status: &str) {
        self.forward(ChannelEvent::StatusUpdate {
            status: status.to_string(),
        });
    }

    fn on_analysis_result(&self, result: AnalysisResult) {
        self.forward(ChannelEvent::AnalysisResult { result });
    }

    fn on_faulted(&self, error: &ProtocolError) {
        self.forward(ChannelEvent::Faulted {
            error: error.clone(),
        });
    }

    fn on_disconnected(&self, reason: &DisconnectReason) {
        self.forward(ChannelEvent::Disconnected {
            reason: reason.clone(),
        });
    }
}
