//! Durable tier connectivity

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, warn};

use super::storage_id::StorageId;
use super::store::{AvailabilityListener, StorageStatus};

/// Connectivity flags flipped by the durable tier's callbacks.
///
/// The durable tier may call in from its own thread while the cache holds its
/// lock, so the monitor only touches atomics.
#[derive(Debug)]
pub struct AvailabilityMonitor {
    storage_id: StorageId,
    connected: AtomicBool,
    reconnected: AtomicBool,
}

impl AvailabilityMonitor {
    pub fn new(storage_id: StorageId) -> Self {
        Self {
            storage_id,
            connected: AtomicBool::new(false),
            reconnected: AtomicBool::new(false),
        }
    }

    /// Durable tier reachable
    #[inline]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Consume the "came back since last asked" flag
    pub fn take_reconnected(&self) -> bool {
        self.reconnected.swap(false, Ordering::SeqCst)
    }

    /// Whether a reconnect is waiting to be handled
    pub fn has_reconnected(&self) -> bool {
        self.reconnected.load(Ordering::SeqCst)
    }
}

impl AvailabilityListener for AvailabilityMonitor {
    fn storage_unavailable(&self, old_status: StorageStatus) {
        warn!(
            "Durable tier of '{}' is unavailable (was {}), running on the transient tier",
            self.storage_id, old_status
        );
        self.connected.store(false, Ordering::SeqCst);
    }

    fn storage_available(&self, old_status: StorageStatus) {
        if old_status == StorageStatus::Undef {
            return;
        }
        info!(
            "Durable tier of '{}' is available again (was {})",
            self.storage_id, old_status
        );
        self.connected.store(true, Ordering::SeqCst);
        self.reconnected.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        let monitor = AvailabilityMonitor::new(StorageId::new("cache", "m"));
        monitor.set_connected(true);

        monitor.storage_unavailable(StorageStatus::Available);
        assert!(!monitor.is_connected());
        assert!(!monitor.has_reconnected());

        monitor.storage_available(StorageStatus::Unavailable);
        assert!(monitor.is_connected());
        assert!(monitor.take_reconnected());
        assert!(!monitor.take_reconnected());
    }

    #[test]
    fn test_undef_is_ignored() {
        let monitor = AvailabilityMonitor::new(StorageId::new("cache", "m"));
        monitor.storage_available(StorageStatus::Undef);
        assert!(!monitor.is_connected());
        assert!(!monitor.has_reconnected());
    }
}
