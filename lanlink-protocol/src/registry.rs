//! Peer registry and transfer history
//!
//! Process-wide tables of known devices and transfer records, shared as
//! `Arc<Registry>` between the server, the scanner and the host layer. All
//! mutation goes through the methods here; callers never hold references
//! into the underlying collections, so concurrent connection tasks cannot
//! tear an insert against an iteration.
//!
//! Devices are never deleted once learned, only marked offline by
//! [`Registry::invalidate_all`] at the start of a scan sweep. History is
//! append-only with no eviction; unbounded retention is an accepted
//! limitation of this design.
//!
//! The inner lock is a `std::sync::Mutex` held only for short, non-awaiting
//! map operations.

use crate::device::{Device, Transfer};
use std::sync::Mutex;
use tracing::debug;

#[derive(Debug, Default)]
struct Tables {
    /// Most-recently-seen first
    devices: Vec<Device>,
    /// Receipt order
    history: Vec<Transfer>,
}

/// Shared registry of devices and transfer history
#[derive(Debug, Default)]
pub struct Registry {
    tables: Mutex<Tables>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the device with this id.
    ///
    /// A re-registration preserves the prior notification counter, marks the
    /// device online, and moves it to the front of the iteration order.
    /// Device ids are globally unique; the same id never duplicates entries.
    pub fn upsert_device(&self, mut device: Device) {
        let mut tables = self.tables.lock().expect("registry lock poisoned");
        if let Some(pos) = tables.devices.iter().position(|d| d.id == device.id) {
            device.notifications = tables.devices[pos].notifications;
            tables.devices.remove(pos);
        }
        device.online = true;
        debug!(id = %device.id, addr = %device.addr, "registered device");
        tables.devices.insert(0, device);
    }

    /// Mark every known device offline.
    ///
    /// Called at the start of a scan sweep so stale devices age out of the
    /// online view without being forgotten.
    pub fn invalidate_all(&self) {
        let mut tables = self.tables.lock().expect("registry lock poisoned");
        for device in &mut tables.devices {
            device.online = false;
        }
    }

    pub fn find_device(&self, id: &str) -> Option<Device> {
        let tables = self.tables.lock().expect("registry lock poisoned");
        tables.devices.iter().find(|d| d.id == id).cloned()
    }

    /// Find a device by its last known address
    pub fn find_device_by_addr(&self, addr: std::net::IpAddr) -> Option<Device> {
        let tables = self.tables.lock().expect("registry lock poisoned");
        tables.devices.iter().find(|d| d.addr == addr).cloned()
    }

    /// Snapshot of all known devices, most-recently-seen first
    pub fn list_devices(&self) -> Vec<Device> {
        let tables = self.tables.lock().expect("registry lock poisoned");
        tables.devices.clone()
    }

    /// Add one to a device's unseen-notification counter
    pub fn bump_notifications(&self, id: &str) {
        let mut tables = self.tables.lock().expect("registry lock poisoned");
        if let Some(device) = tables.devices.iter_mut().find(|d| d.id == id) {
            device.notifications += 1;
        }
    }

    /// Reset a device's unseen-notification counter
    pub fn clear_notifications(&self, id: &str) {
        let mut tables = self.tables.lock().expect("registry lock poisoned");
        if let Some(device) = tables.devices.iter_mut().find(|d| d.id == id) {
            device.notifications = 0;
        }
    }

    pub fn find_transfer(&self, id: &str) -> Option<Transfer> {
        let tables = self.tables.lock().expect("registry lock poisoned");
        tables.history.iter().find(|t| t.id == id).cloned()
    }

    /// Insert or replace the transfer with this id (last write wins)
    pub fn upsert_transfer(&self, transfer: Transfer) {
        let mut tables = self.tables.lock().expect("registry lock poisoned");
        if let Some(existing) = tables.history.iter_mut().find(|t| t.id == transfer.id) {
            *existing = transfer;
        } else {
            tables.history.push(transfer);
        }
    }

    /// Apply a mutation to the transfer with this id, if present.
    ///
    /// Used by the chunk loops to publish progress without cloning the whole
    /// record per chunk.
    pub fn with_transfer_mut<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut Transfer) -> R,
    ) -> Option<R> {
        let mut tables = self.tables.lock().expect("registry lock poisoned");
        tables.history.iter_mut().find(|t| t.id == id).map(f)
    }

    /// All transfers for one peer, in insertion order
    pub fn history_for_peer(&self, peer_id: &str) -> Vec<Transfer> {
        let tables = self.tables.lock().expect("registry lock poisoned");
        tables
            .history
            .iter()
            .filter(|t| t.peer_id == peer_id)
            .cloned()
            .collect()
    }

    /// Mark all of a peer's transfers seen and clear its notification
    /// counter. Called when the user views a conversation.
    pub fn mark_seen(&self, peer_id: &str) {
        let mut tables = self.tables.lock().expect("registry lock poisoned");
        for transfer in tables.history.iter_mut().filter(|t| t.peer_id == peer_id) {
            transfer.seen = true;
        }
        if let Some(device) = tables.devices.iter_mut().find(|d| d.id == peer_id) {
            device.notifications = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Direction;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;

    fn addr(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, last))
    }

    #[test]
    fn upsert_preserves_notifications_and_reorders() {
        let registry = Registry::new();
        registry.upsert_device(Device::new("a", addr(2), "first", "linux"));
        registry.upsert_device(Device::new("b", addr(3), "second", "android"));
        registry.bump_notifications("a");

        // Re-registering "a" keeps its counter and moves it to the front
        registry.upsert_device(Device::new("a", addr(4), "renamed", "linux"));
        let devices = registry.list_devices();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].id, "a");
        assert_eq!(devices[0].name, "renamed");
        assert_eq!(devices[0].addr, addr(4));
        assert_eq!(devices[0].notifications, 1);
    }

    #[test]
    fn invalidate_marks_offline_without_forgetting() {
        let registry = Registry::new();
        registry.upsert_device(Device::new("a", addr(2), "first", "linux"));
        registry.invalidate_all();
        let device = registry.find_device("a").unwrap();
        assert!(!device.online);

        registry.upsert_device(Device::new("a", addr(2), "first", "linux"));
        assert!(registry.find_device("a").unwrap().online);
    }

    #[test]
    fn history_filters_by_peer_in_order() {
        let registry = Registry::new();
        registry.upsert_transfer(Transfer::message("t1", "a", Direction::Outbound, "one"));
        registry.upsert_transfer(Transfer::message("t2", "b", Direction::Inbound, "two"));
        registry.upsert_transfer(Transfer::message("t3", "a", Direction::Inbound, "three"));

        let history = registry.history_for_peer("a");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, "t1");
        assert_eq!(history[1].id, "t3");
    }

    #[test]
    fn mark_seen_flags_all_peer_transfers() {
        let registry = Registry::new();
        registry.upsert_device(Device::new("a", addr(2), "first", "linux"));
        registry.bump_notifications("a");
        registry.upsert_transfer(Transfer::message("t1", "a", Direction::Inbound, "one"));
        registry.upsert_transfer(Transfer::message("t2", "a", Direction::Inbound, "two"));

        registry.mark_seen("a");
        assert!(registry.history_for_peer("a").iter().all(|t| t.seen));
        assert_eq!(registry.find_device("a").unwrap().notifications, 0);
    }

    #[tokio::test]
    async fn concurrent_upserts_never_duplicate() {
        let registry = Arc::new(Registry::new());
        let mut handles = Vec::new();
        for i in 0..64u8 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                registry.upsert_device(Device::new(
                    "same-id",
                    addr(i),
                    format!("name-{i}"),
                    "linux",
                ));
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let devices = registry.list_devices();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id, "same-id");
    }
}
