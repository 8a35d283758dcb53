//! Core event channel
//!
//! The protocol core never calls back into presentation code. Instead it
//! emits [`CoreEvent`] values on an unbounded channel; the host (GUI, TUI,
//! daemon) drains the receiver and renders as it sees fit.
//!
//! Events fire from arbitrary connection tasks and from the scan pool, many
//! times per second during a transfer, so emitting must stay cheap and
//! non-blocking. A dropped receiver silently discards further events.

use crate::device::Device;
use tokio::sync::mpsc;

/// Sentinel progress value reported when a scan sweep has finished.
///
/// Distinguishes "done" from the 0.0 a fresh sweep starts at.
pub const SCAN_DONE: f64 = -1.0;

/// Events surfaced to the host layer
#[derive(Debug, Clone)]
pub enum CoreEvent {
    /// A scan probe got a handshake response; the device is already in the
    /// registry when this fires.
    DeviceFound(Device),

    /// A transfer record changed (progress, error, cancellation, seen flag).
    /// Fired once per chunk during streaming.
    TransferUpdated { peer_id: String, transfer_id: String },

    /// An inbound text message arrived. Doubles as the notification surface.
    MessageReceived {
        peer_id: String,
        sender_name: String,
        text: String,
    },

    /// A peer announced it has viewed our conversation; the relevant
    /// transfers are already flagged seen in the registry.
    ConversationSeen { peer_id: String },

    /// Fraction of scan addresses dispatched so far, or [`SCAN_DONE`]
    ScanProgress(f64),
}

/// Cloneable emitter handed to the engine, server and scanner
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<CoreEvent>,
}

impl EventBus {
    /// Create a bus and the receiving end for the host to drain
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<CoreEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Emit an event, ignoring a disconnected host
    pub fn emit(&self, event: CoreEvent) {
        let _ = self.tx.send(event);
    }

    /// Shorthand for the per-chunk progress event
    pub fn transfer_updated(&self, peer_id: &str, transfer_id: &str) {
        self.emit(CoreEvent::TransferUpdated {
            peer_id: peer_id.to_string(),
            transfer_id: transfer_id.to_string(),
        });
    }
}
