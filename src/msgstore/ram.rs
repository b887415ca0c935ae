//! RAM Store - memory-resident tier
//!
//! The default transient tier. Entries sit in a hash map; a sorted index keyed
//! by the configured [`EvictionOrder`] answers "which entry is oldest".
//!
//! # Design
//!
//! - One mutex over map and index, counters as atomics for lock-free reads
//! - A put is refused only once the store is already above its limits, so
//!   the store may hold one entry more than configured ("superload once").
//!   Capacity planning is the caller's job.
//! - A duplicate put keeps the stored entry and reports 0

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use super::config::TierLimits;
use super::entry::MapEntry;
use super::policy::{EvictionOrder, OrderKey};
use super::registry::StoreKind;
use super::storage_id::StorageId;
use super::store::{EntryFilter, Store};
use crate::error::{Error, Result};

struct Slot {
    entry: Arc<MapEntry>,
    key: OrderKey,
}

#[derive(Default)]
struct RamInner {
    entries: HashMap<u64, Slot>,
    index: BTreeSet<OrderKey>,
}

/// In-memory store
pub struct RamStore {
    storage_id: StorageId,
    order: EvictionOrder,
    inner: Mutex<RamInner>,
    limits: RwLock<TierLimits>,
    /// Access sequence for LRU ordering
    clock: AtomicU64,
    num_entries: AtomicU64,
    num_bytes: AtomicU64,
    num_persistent_entries: AtomicU64,
    num_persistent_bytes: AtomicU64,
    shutdown: AtomicBool,
}

impl RamStore {
    /// Create an empty store
    pub fn new(storage_id: StorageId, limits: TierLimits, order: EvictionOrder) -> Self {
        debug!(
            "Creating RAM store '{}' max_entries={} max_bytes={} order={}",
            storage_id, limits.max_entries, limits.max_bytes, order
        );
        Self {
            storage_id,
            order,
            inner: Mutex::new(RamInner::default()),
            limits: RwLock::new(limits),
            clock: AtomicU64::new(0),
            num_entries: AtomicU64::new(0),
            num_bytes: AtomicU64::new(0),
            num_persistent_entries: AtomicU64::new(0),
            num_persistent_bytes: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Eviction order in use
    pub fn eviction_order(&self) -> EvictionOrder {
        self.order
    }

    /// Check if the store contains an id
    pub fn contains(&self, unique_id: u64) -> bool {
        self.inner.lock().entries.contains_key(&unique_id)
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn account_add(&self, entry: &MapEntry) {
        self.num_entries.fetch_add(1, Ordering::Relaxed);
        self.num_bytes
            .fetch_add(entry.size_in_bytes(), Ordering::Relaxed);
        if entry.is_persistent() {
            self.num_persistent_entries.fetch_add(1, Ordering::Relaxed);
            self.num_persistent_bytes
                .fetch_add(entry.size_in_bytes(), Ordering::Relaxed);
        }
    }

    fn account_sub(&self, entry: &MapEntry) {
        self.num_entries.fetch_sub(1, Ordering::Relaxed);
        self.num_bytes
            .fetch_sub(entry.size_in_bytes(), Ordering::Relaxed);
        if entry.is_persistent() {
            self.num_persistent_entries.fetch_sub(1, Ordering::Relaxed);
            self.num_persistent_bytes
                .fetch_sub(entry.size_in_bytes(), Ordering::Relaxed);
        }
    }

    fn reset_counters(&self) {
        self.num_entries.store(0, Ordering::Relaxed);
        self.num_bytes.store(0, Ordering::Relaxed);
        self.num_persistent_entries.store(0, Ordering::Relaxed);
        self.num_persistent_bytes.store(0, Ordering::Relaxed);
    }

    fn take(&self, inner: &mut RamInner, unique_id: u64) -> Option<Arc<MapEntry>> {
        let slot = inner.entries.remove(&unique_id)?;
        inner.index.remove(&slot.key);
        self.account_sub(&slot.entry);
        Some(slot.entry)
    }
}

impl Store for RamStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Ram
    }

    fn storage_id(&self) -> &StorageId {
        &self.storage_id
    }

    fn is_transient(&self) -> bool {
        true
    }

    fn put(&self, entry: Arc<MapEntry>) -> Result<usize> {
        if self.is_shutdown() {
            return Err(Error::ResourceUnavailable {
                storage_id: self.storage_id.id(),
                location: "RamStore::put".into(),
                reason: "store is shut down".into(),
            });
        }

        let mut inner = self.inner.lock();
        if inner.entries.contains_key(&entry.unique_id()) {
            return Ok(0);
        }
        self.limits().check_not_exceeded(
            &self.storage_id,
            "RamStore::put",
            self.num_entries(),
            self.num_bytes(),
            entry.size_in_bytes(),
        )?;

        let key = self.order.order_key(&entry, self.tick());
        self.account_add(&entry);
        inner.index.insert(key);
        inner.entries.insert(entry.unique_id(), Slot { entry, key });
        Ok(1)
    }

    fn get(&self, unique_id: u64) -> Result<Option<Arc<MapEntry>>> {
        let mut inner = self.inner.lock();
        if !self.order.touches_on_access() {
            return Ok(inner.entries.get(&unique_id).map(|s| s.entry.clone()));
        }

        let touch = self.tick();
        let RamInner { entries, index } = &mut *inner;
        match entries.get_mut(&unique_id) {
            Some(slot) => {
                index.remove(&slot.key);
                slot.key = self.order.order_key(&slot.entry, touch);
                index.insert(slot.key);
                Ok(Some(slot.entry.clone()))
            }
            None => Ok(None),
        }
    }

    fn get_all(&self, filter: Option<EntryFilter<'_>>) -> Result<Vec<Arc<MapEntry>>> {
        let inner = self.inner.lock();
        // index order, so callers see oldest first
        let entries = inner
            .index
            .iter()
            .filter_map(|key| inner.entries.get(&key.1))
            .filter(|slot| filter.map_or(true, |f| f(&slot.entry)))
            .map(|slot| slot.entry.clone())
            .collect();
        Ok(entries)
    }

    fn remove_by_id(&self, unique_id: u64) -> Result<usize> {
        let mut inner = self.inner.lock();
        Ok(self.take(&mut inner, unique_id).map_or(0, |_| 1))
    }

    fn remove_oldest(&self) -> Result<Option<Arc<MapEntry>>> {
        let mut inner = self.inner.lock();
        let oldest = match inner.index.iter().next() {
            Some(key) => key.1,
            None => return Ok(None),
        };
        Ok(self.take(&mut inner, oldest))
    }

    fn change(&self, old: &MapEntry, new: Arc<MapEntry>) -> Result<Arc<MapEntry>> {
        if old.unique_id() != new.unique_id() {
            return Err(Error::IllegalArgument {
                location: "RamStore::change".into(),
                reason: format!(
                    "entry id {} can not be changed to {}",
                    old.unique_id(),
                    new.unique_id()
                ),
            });
        }

        let mut inner = self.inner.lock();
        let previous = self.take(&mut inner, old.unique_id()).ok_or_else(|| {
            Error::IllegalArgument {
                location: "RamStore::change".into(),
                reason: format!("entry {} is not stored in '{}'", old.unique_id(), self.storage_id),
            }
        })?;

        let key = self.order.order_key(&new, self.tick());
        new.set_swapped(previous.is_swapped());
        self.account_add(&new);
        inner.index.insert(key);
        inner.entries.insert(new.unique_id(), Slot { entry: new.clone(), key });
        Ok(new)
    }

    fn clear(&self) -> Result<u64> {
        let mut inner = self.inner.lock();
        let removed = inner.entries.len() as u64;
        inner.entries.clear();
        inner.index.clear();
        self.reset_counters();
        Ok(removed)
    }

    fn num_entries(&self) -> u64 {
        self.num_entries.load(Ordering::Relaxed)
    }

    fn num_bytes(&self) -> u64 {
        self.num_bytes.load(Ordering::Relaxed)
    }

    fn num_persistent_entries(&self) -> u64 {
        self.num_persistent_entries.load(Ordering::Relaxed)
    }

    fn num_persistent_bytes(&self) -> u64 {
        self.num_persistent_bytes.load(Ordering::Relaxed)
    }

    fn limits(&self) -> TierLimits {
        *self.limits.read()
    }

    fn set_limits(&self, limits: TierLimits) -> Result<()> {
        *self.limits.write() = limits;
        Ok(())
    }

    fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        let remaining = self.num_entries();
        if remaining > 0 {
            debug!("Shutting down RAM store '{}', dropping {} entries", self.storage_id, remaining);
        }
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.index.clear();
        self.reset_counters();
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn destroy(&self) -> Result<()> {
        self.clear()?;
        self.shutdown();
        Ok(())
    }
}

impl std::fmt::Debug for RamStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RamStore")
            .field("storage_id", &self.storage_id)
            .field("order", &self.order)
            .field("num_entries", &self.num_entries())
            .field("num_bytes", &self.num_bytes())
            .field("limits", &self.limits())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
