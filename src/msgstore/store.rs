//! Store capability
//!
//! The narrow interface both tiers implement. The cache controller only talks
//! to tiers through this trait and does not care how a tier persists data.

use std::io::Write;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use super::config::TierLimits;
use super::entry::{EntryHeader, MapEntry};
use super::registry::StoreKind;
use super::storage_id::StorageId;
use crate::error::Result;

/// Entry predicate used by `get_all`
pub type EntryFilter<'a> = &'a (dyn Fn(&MapEntry) -> bool + Send + Sync);

/// Connection status reported by a tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum StorageStatus {
    /// Not yet known
    Undef = 0,
    /// Reachable
    Available = 1,
    /// Lost connection
    Unavailable = 2,
}

impl StorageStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => StorageStatus::Available,
            2 => StorageStatus::Unavailable,
            _ => StorageStatus::Undef,
        }
    }
}

impl std::fmt::Display for StorageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageStatus::Undef => write!(f, "undef"),
            StorageStatus::Available => write!(f, "available"),
            StorageStatus::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// Receives connection changes of a tier.
///
/// Called from whatever thread detected the change; implementations must not
/// block.
pub trait AvailabilityListener: Send + Sync {
    /// The tier lost its connection
    fn storage_unavailable(&self, old_status: StorageStatus);

    /// The tier is reachable again
    fn storage_available(&self, old_status: StorageStatus);
}

/// Tracks a tier's status and fans transitions out to listeners
#[derive(Default)]
pub struct AvailabilityNotifier {
    status: AtomicU8,
    listeners: RwLock<Vec<Arc<dyn AvailabilityListener>>>,
}

impl AvailabilityNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current status
    pub fn status(&self) -> StorageStatus {
        StorageStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Move to `status`; listeners are told only on an actual change.
    /// Returns the previous status.
    pub fn transition(&self, status: StorageStatus) -> StorageStatus {
        let old = StorageStatus::from_u8(self.status.swap(status as u8, Ordering::AcqRel));
        if old == status {
            return old;
        }
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            match status {
                StorageStatus::Available => listener.storage_available(old),
                StorageStatus::Unavailable => listener.storage_unavailable(old),
                StorageStatus::Undef => {}
            }
        }
        old
    }

    /// Returns false if the listener was already registered
    pub fn register(&self, listener: Arc<dyn AvailabilityListener>) -> bool {
        let mut listeners = self.listeners.write();
        if listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            return false;
        }
        listeners.push(listener);
        true
    }

    /// Returns false if the listener was not registered
    pub fn unregister(&self, listener: &Arc<dyn AvailabilityListener>) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }
}

/// One line of a store dump
#[derive(Debug, Serialize)]
pub struct DumpRecord<'a> {
    #[serde(flatten)]
    pub header: EntryHeader,
    pub swapped: bool,
    /// Payload forced into readable text
    pub payload: std::borrow::Cow<'a, str>,
}

/// A storage tier
pub trait Store: Send + Sync {
    /// Which kind of store this is
    fn kind(&self) -> StoreKind;

    /// Storage this tier belongs to
    fn storage_id(&self) -> &StorageId;

    /// True if the tier loses its content on restart
    fn is_transient(&self) -> bool;

    /// Store an entry. Returns 1 if stored, 0 if an entry with the same id was
    /// already present (the stored entry is left untouched).
    fn put(&self, entry: Arc<MapEntry>) -> Result<usize>;

    /// Look up an entry by id
    fn get(&self, unique_id: u64) -> Result<Option<Arc<MapEntry>>>;

    /// All entries accepted by `filter` (all if `None`)
    fn get_all(&self, filter: Option<EntryFilter<'_>>) -> Result<Vec<Arc<MapEntry>>>;

    /// Headers of all entries in eviction order. Stores keeping payloads
    /// outside memory answer this without reading them.
    fn headers(&self) -> Result<Vec<EntryHeader>> {
        Ok(self.get_all(None)?.iter().map(|e| e.header()).collect())
    }

    /// Remove the entry with the id of `entry`; returns the number removed
    fn remove(&self, entry: &MapEntry) -> Result<usize> {
        self.remove_by_id(entry.unique_id())
    }

    /// Remove by id; returns the number removed
    fn remove_by_id(&self, unique_id: u64) -> Result<usize>;

    /// Remove and return the first entry in eviction order
    fn remove_oldest(&self) -> Result<Option<Arc<MapEntry>>>;

    /// Replace `old` by `new` (same id) keeping the counters consistent
    fn change(&self, old: &MapEntry, new: Arc<MapEntry>) -> Result<Arc<MapEntry>>;

    /// Remove everything; returns the number of removed entries
    fn clear(&self) -> Result<u64>;

    fn num_entries(&self) -> u64;

    fn num_bytes(&self) -> u64;

    fn num_persistent_entries(&self) -> u64;

    fn num_persistent_bytes(&self) -> u64;

    /// Current capacity limits
    fn limits(&self) -> TierLimits;

    /// Replace the capacity limits. Shrinking below the current residency is
    /// allowed; it only blocks further puts.
    fn set_limits(&self, limits: TierLimits) -> Result<()>;

    fn max_entries(&self) -> u64 {
        self.limits().max_entries
    }

    fn max_bytes(&self) -> u64 {
        self.limits().max_bytes
    }

    /// Whether one more entry of `entry_bytes` fits
    fn has_space_for(&self, entry_bytes: u64) -> bool {
        self.limits()
            .admits(self.num_entries(), self.num_bytes(), entry_bytes)
    }

    /// Release in-memory resources, keep durable data
    fn shutdown(&self);

    fn is_shutdown(&self) -> bool;

    /// Discard all data permanently
    fn destroy(&self) -> Result<()>;

    /// Register for connection changes; false if the tier never reports any
    fn register_availability_listener(&self, _listener: Arc<dyn AvailabilityListener>) -> bool {
        false
    }

    fn unregister_availability_listener(&self, _listener: &Arc<dyn AvailabilityListener>) -> bool {
        false
    }

    /// Re-check a lost connection and report a recovery to the listeners.
    /// Tiers that detect recovery on their own keep the no-op.
    fn check_available(&self) {}

    /// Write all entries as JSON lines to `out`; returns the number written.
    ///
    /// A non persistent entry in a durable tier is always a swapped one.
    fn dump(&self, out: &mut dyn Write) -> Result<u64> {
        let mut entries = self.get_all(None)?;
        entries.sort_by_key(|e| e.unique_id());
        let durable = !self.is_transient();
        for entry in &entries {
            let record = DumpRecord {
                header: entry.header(),
                swapped: entry.is_swapped() || (durable && !entry.is_persistent()),
                payload: String::from_utf8_lossy(entry.payload()),
            };
            serde_json::to_writer(&mut *out, &record)?;
            out.write_all(b"\n")?;
        }
        Ok(entries.len() as u64)
    }
}

// =============================================================================
// Tests
// =============================================================================
