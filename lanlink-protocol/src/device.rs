//! Peer and transfer data model
//!
//! A [`Device`] is a peer learned from a scan response or an inbound
//! handshake. A [`Transfer`] is one history entry: either a text message or
//! a resource batch ([`FileTransfer`]) with per-file progress.
//!
//! Transfer records are mutated throughout the chunk loop and become
//! terminal when fully transferred, canceled, or errored. Canceled and
//! errored are distinct states: cancellation is a clean mutual agreement,
//! an error is an involuntary fault. Both remain resumable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;

/// Prefix applied to the receiving side's copy of a transfer id, so a
/// loopback exchange never collides with the sender's own record.
pub const INBOUND_ID_PREFIX: &str = "R";

/// A peer on the local network
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    /// Opaque peer-supplied id, stable across sessions
    pub id: String,

    /// Last known address
    pub addr: IpAddr,

    /// Human-readable display name
    pub name: String,

    /// Peer operating system string
    pub os: String,

    /// Unseen-notification counter
    pub notifications: u64,

    /// Whether the peer answered the most recent scan sweep
    pub online: bool,
}

impl Device {
    /// Create a device from a handshake or scan response.
    ///
    /// New devices start online with no pending notifications; the registry
    /// preserves the prior counter when re-registering a known id.
    pub fn new(id: impl Into<String>, addr: IpAddr, name: impl Into<String>, os: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            addr,
            name: name.into(),
            os: os.into(),
            notifications: 0,
            online: true,
        }
    }
}

/// Direction of a transfer relative to this process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// One entry in a resource batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    /// Local path: the source file when sending, the destination when
    /// receiving
    pub path: PathBuf,

    /// Wire name: path relative to the batch root, `/`-joined
    pub name: String,

    /// Total size in bytes
    pub size: u64,

    /// Bytes transferred so far; invariant `progress <= size`
    pub progress: u64,
}

impl FileEntry {
    pub fn new(path: impl Into<PathBuf>, name: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
            size,
            progress: 0,
        }
    }

    /// Whether every byte of this file has been transferred
    pub fn is_complete(&self) -> bool {
        self.progress >= self.size
    }
}

/// Payload of a resource transfer
///
/// Invariants: `transferred_bytes <= total_bytes`; files before
/// `current_index` are fully transferred; `current_index` points at the file
/// in flight or next to resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileTransfer {
    pub files: Vec<FileEntry>,
    pub current_index: u64,
    pub transferred_bytes: u64,
    pub total_bytes: u64,
    pub canceled: bool,
}

impl FileTransfer {
    pub fn new(files: Vec<FileEntry>, total_bytes: u64) -> Self {
        Self {
            files,
            current_index: 0,
            transferred_bytes: 0,
            total_bytes,
            canceled: false,
        }
    }

    /// Whether every file in the batch has been fully transferred
    pub fn is_complete(&self) -> bool {
        self.current_index >= self.files.len() as u64
    }
}

/// One history entry: a message or a resource exchange with a peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transfer {
    /// Unique transfer id; stable across resume attempts
    pub id: String,

    /// Peer this transfer belongs to
    pub peer_id: String,

    /// Creation time
    pub timestamp: DateTime<Utc>,

    pub direction: Direction,

    /// Whether the user has viewed this entry
    pub seen: bool,

    /// Text payload, for message transfers
    pub message: Option<String>,

    /// Last error, if the transfer faulted
    pub error: Option<String>,

    /// File payload, for resource transfers
    pub payload: Option<FileTransfer>,
}

impl Transfer {
    /// Create a message transfer record
    pub fn message(
        id: impl Into<String>,
        peer_id: impl Into<String>,
        direction: Direction,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            peer_id: peer_id.into(),
            timestamp: Utc::now(),
            direction,
            seen: false,
            message: Some(text.into()),
            error: None,
            payload: None,
        }
    }

    /// Create a resource transfer record
    pub fn resources(
        id: impl Into<String>,
        peer_id: impl Into<String>,
        direction: Direction,
        payload: FileTransfer,
    ) -> Self {
        Self {
            id: id.into(),
            peer_id: peer_id.into(),
            timestamp: Utc::now(),
            direction,
            seen: false,
            message: None,
            error: None,
            payload: Some(payload),
        }
    }

    /// The wire-level transfer id, without the inbound prefix.
    ///
    /// Resume requests always carry this id so the original sender can find
    /// its own record.
    pub fn wire_id(&self) -> &str {
        match self.direction {
            Direction::Inbound => self
                .id
                .strip_prefix(INBOUND_ID_PREFIX)
                .unwrap_or(&self.id),
            Direction::Outbound => &self.id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn new_device_is_online() {
        let dev = Device::new("abc", IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), "desk", "linux");
        assert!(dev.online);
        assert_eq!(dev.notifications, 0);
    }

    #[test]
    fn wire_id_strips_inbound_prefix() {
        let inbound = Transfer::message("Rxyz", "peer", Direction::Inbound, "hi");
        assert_eq!(inbound.wire_id(), "xyz");

        let outbound = Transfer::message("xyz", "peer", Direction::Outbound, "hi");
        assert_eq!(outbound.wire_id(), "xyz");
    }

    #[test]
    fn file_transfer_completion() {
        let files = vec![FileEntry::new("/tmp/a", "a", 4)];
        let mut ft = FileTransfer::new(files, 4);
        assert!(!ft.is_complete());
        ft.current_index = 1;
        assert!(ft.is_complete());
    }
}
