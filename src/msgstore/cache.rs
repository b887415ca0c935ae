//! Tiered Cache Controller
//!
//! [`PersistenceCache`] presents one storage made of a transient tier and an
//! optional durable tier.
//!
//! # Placement
//!
//! - Persistent entries are written to the durable tier first, then to the
//!   transient tier. Evicting them from the transient tier loses nothing.
//! - Non persistent entries live in the transient tier. When space is needed
//!   the oldest one is swapped to the durable tier and swapped back on `get`.
//! - Persistent entries that could not be written durably (tier disconnected
//!   or write failed) are tracked as pending. They are swapped like non
//!   persistent entries and flushed once the durable tier is back.
//!
//! # Locking
//!
//! One mutex serializes every operation touching both tiers. Connectivity is
//! an atomic flipped by the durable tier's own thread. Size listeners are
//! called after the mutex is released.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use super::availability::AvailabilityMonitor;
use super::config::{CacheConfig, TierLimits};
use super::entry::MapEntry;
use super::listener::{SizeChange, SizeListenerRegistry, StorageSizeListener};
use super::metrics::{CacheMetrics, MetricsSnapshot};
use super::policy::reload_order;
use super::registry::{StoreContext, StoreKind, StoreRegistry};
use super::storage_id::StorageId;
use super::store::{AvailabilityListener, EntryFilter, Store};
use crate::error::{Error, Result};

/// Capacity setting changed through the `set_max_*` operations
#[derive(Debug, Clone, Copy)]
enum Limit {
    Entries,
    Bytes,
    EntriesCache,
    BytesCache,
}

impl Limit {
    fn name(self) -> &'static str {
        match self {
            Limit::Entries => "NumOfEntries",
            Limit::Bytes => "NumOfBytes",
            Limit::EntriesCache => "NumOfEntriesCache",
            Limit::BytesCache => "NumOfBytesCache",
        }
    }

    fn get(self, config: &CacheConfig) -> u64 {
        match self {
            Limit::Entries => config.max_entries,
            Limit::Bytes => config.max_bytes,
            Limit::EntriesCache => config.max_entries_cache,
            Limit::BytesCache => config.max_bytes_cache,
        }
    }

    fn set(self, config: &mut CacheConfig, value: u64) {
        match self {
            Limit::Entries => config.max_entries = value,
            Limit::Bytes => config.max_bytes = value,
            Limit::EntriesCache => config.max_entries_cache = value,
            Limit::BytesCache => config.max_bytes_cache = value,
        }
    }
}

// =============================================================================
// Locked State
// =============================================================================

struct CacheState {
    storage_id: StorageId,
    config: CacheConfig,
    transient: Option<Arc<dyn Store>>,
    durable: Option<Arc<dyn Store>>,
    monitor: Option<Arc<AvailabilityMonitor>>,
    /// Persistent entries held only by the transient tier: id -> size
    pending: BTreeMap<u64, u64>,
}

impl CacheState {
    fn new() -> Self {
        Self {
            storage_id: StorageId::new("cache", "uninitialized"),
            config: CacheConfig::default(),
            transient: None,
            durable: None,
            monitor: None,
            pending: BTreeMap::new(),
        }
    }

    fn transient(&self) -> Result<Arc<dyn Store>> {
        self.transient
            .clone()
            .ok_or_else(|| Error::ResourceUnavailable {
                storage_id: self.storage_id.id(),
                location: "PersistenceCache".into(),
                reason: "cache is not initialized".into(),
            })
    }

    fn is_connected(&self) -> bool {
        self.durable.is_some() && self.monitor.as_ref().map_or(false, |m| m.is_connected())
    }

    fn connected_durable(&self) -> Option<Arc<dyn Store>> {
        if self.is_connected() {
            self.durable.clone()
        } else {
            None
        }
    }

    fn pending_bytes(&self) -> u64 {
        self.pending.values().sum()
    }

    // Logical sizes. Persistent entries sit in both tiers, pending ones only
    // in the transient tier.

    fn num_entries(&self) -> u64 {
        let Some(transient) = &self.transient else {
            return 0;
        };
        match self.connected_durable() {
            Some(durable) => durable.num_entries()
                + transient
                    .num_entries()
                    .saturating_sub(transient.num_persistent_entries())
                + self.pending.len() as u64,
            None => transient.num_entries(),
        }
    }

    fn num_bytes(&self) -> u64 {
        let Some(transient) = &self.transient else {
            return 0;
        };
        match self.connected_durable() {
            Some(durable) => durable.num_bytes()
                + transient
                    .num_bytes()
                    .saturating_sub(transient.num_persistent_bytes())
                + self.pending_bytes(),
            None => transient.num_bytes(),
        }
    }

    fn num_persistent_entries(&self) -> u64 {
        let Some(transient) = &self.transient else {
            return 0;
        };
        match self.connected_durable() {
            Some(durable) => durable.num_persistent_entries() + self.pending.len() as u64,
            None => transient.num_persistent_entries(),
        }
    }

    fn num_persistent_bytes(&self) -> u64 {
        let Some(transient) = &self.transient else {
            return 0;
        };
        match self.connected_durable() {
            Some(durable) => durable.num_persistent_bytes() + self.pending_bytes(),
            None => transient.num_persistent_bytes(),
        }
    }

    /// Non persistent entries currently living in the durable tier
    fn num_swapped(&self) -> u64 {
        match self.connected_durable() {
            Some(durable) => durable
                .num_entries()
                .saturating_sub(durable.num_persistent_entries()),
            None => 0,
        }
    }

    fn limits(&self) -> TierLimits {
        match (self.connected_durable(), &self.transient) {
            (Some(durable), _) => durable.limits(),
            (None, Some(transient)) => transient.limits(),
            (None, None) => self.config.transient_limits(),
        }
    }

    /// Limits the whole storage is admitted against
    fn admission_limits(&self) -> TierLimits {
        match self.connected_durable() {
            Some(durable) => durable.limits(),
            None => self.config.durable_limits(),
        }
    }

    fn cache_limits(&self) -> TierLimits {
        self.transient
            .as_ref()
            .map_or_else(|| self.config.transient_limits(), |t| t.limits())
    }

    fn describe(&self) -> String {
        let durable = match (&self.durable, self.is_connected()) {
            (None, _) => "none".to_string(),
            (Some(d), true) => format!("{} connected", d.kind()),
            (Some(d), false) => format!("{} disconnected", d.kind()),
        };
        let limits = self.limits();
        let cache_limits = self.cache_limits();
        let (cached_entries, cached_bytes) = self
            .transient
            .as_ref()
            .map_or((0, 0), |t| (t.num_entries(), t.num_bytes()));
        format!(
            "'{}' entries={}/{} bytes={}/{} cached={}/{} cachedBytes={}/{} swapped={} pending={} durable={}",
            self.storage_id,
            self.num_entries(),
            limits.max_entries,
            self.num_bytes(),
            limits.max_bytes,
            cached_entries,
            cache_limits.max_entries,
            cached_bytes,
            cache_limits.max_bytes,
            self.num_swapped(),
            self.pending.len(),
            durable
        )
    }

    fn size_change(&self, is_shutdown: bool) -> SizeChange {
        SizeChange {
            storage_id: self.storage_id.clone(),
            num_entries: self.num_entries(),
            num_bytes: self.num_bytes(),
            is_shutdown,
        }
    }

    /// Stop receiving connection changes. The last known connectivity stays
    /// readable so `destroy` after `shutdown` still reaches the durable tier.
    fn unregister_monitor(&self) {
        if let (Some(durable), Some(monitor)) = (&self.durable, &self.monitor) {
            let listener: Arc<dyn AvailabilityListener> = monitor.clone();
            durable.unregister_availability_listener(&listener);
        }
    }

    fn detach_monitor(&mut self) {
        self.unregister_monitor();
        self.monitor = None;
    }

    /// Ask a disconnected durable tier whether it is back
    fn recheck_durable(&self) {
        if let (Some(durable), Some(monitor)) = (&self.durable, &self.monitor) {
            if !monitor.is_connected() {
                durable.check_available();
            }
        }
    }

    fn apply_config(&mut self, config: CacheConfig) -> Result<()> {
        config.validate()?;
        if let Some(transient) = &self.transient {
            transient.set_limits(config.transient_limits())?;
        }
        if let Some(durable) = &self.durable {
            durable.set_limits(config.durable_limits())?;
        }
        self.config = config;
        Ok(())
    }

    // =========================================================================
    // Operations
    // =========================================================================

    fn put(&mut self, entry: &Arc<MapEntry>, metrics: &CacheMetrics) -> Result<usize> {
        const LOCATION: &str = "PersistenceCache::put";
        let transient = self.transient()?;
        let size = entry.size_in_bytes();

        if self.holds(entry.unique_id())? {
            debug!("'{}' already holds {}, put ignored", self.storage_id, entry.log_id());
            return Ok(0);
        }

        if let Err(e) = self.admission_limits().check_admission(
            &self.storage_id,
            LOCATION,
            self.num_entries(),
            self.num_bytes(),
            size,
        ) {
            debug!("{}", e);
            metrics.record_overflow();
            return Err(e);
        }

        let mut durable_put = 0;
        let mut undurable = false;
        if entry.is_persistent() {
            if let Some(durable) = self.connected_durable() {
                if let Err(e) = durable.limits().check_admission(
                    &self.storage_id,
                    LOCATION,
                    durable.num_entries(),
                    durable.num_bytes(),
                    size,
                ) {
                    debug!("{}", e);
                    metrics.record_overflow();
                    return Err(e);
                }
                match durable.put(entry.clone()) {
                    Ok(n) => durable_put = n,
                    Err(e) => {
                        error!(
                            "'{}' writing persistent entry {} to the durable tier failed, handling it as transient for now: {}",
                            self.storage_id,
                            entry.log_id(),
                            e
                        );
                        metrics.record_durable_write_failure();
                        undurable = true;
                    }
                }
            } else if self.durable.is_some() {
                debug!(
                    "'{}' durable tier disconnected, persistent entry {} is held transient",
                    self.storage_id,
                    entry.log_id()
                );
                undurable = true;
            }
        }

        let transient_put = match self
            .assure_transient_space(entry, metrics)
            .and_then(|_| transient.put(entry.clone()))
        {
            Ok(n) => n,
            Err(e) => {
                if durable_put > 0 {
                    self.undo_durable_put(entry);
                }
                if e.is_overflow() {
                    metrics.record_overflow();
                }
                return Err(e);
            }
        };

        if undurable && transient_put > 0 {
            self.pending.insert(entry.unique_id(), size);
        }
        metrics.record_put();
        Ok(durable_put.max(transient_put))
    }

    /// Whether any reachable tier holds `unique_id`
    fn holds(&self, unique_id: u64) -> Result<bool> {
        if self.transient()?.get(unique_id)?.is_some() {
            return Ok(true);
        }
        match self.connected_durable() {
            Some(durable) => Ok(durable.get(unique_id)?.is_some()),
            None => Ok(false),
        }
    }

    fn undo_durable_put(&self, entry: &MapEntry) {
        if let Some(durable) = &self.durable {
            if let Err(e) = durable.remove(entry) {
                error!(
                    "'{}' could not take back durable copy of rejected entry {}: {}",
                    self.storage_id,
                    entry.log_id(),
                    e
                );
            }
        }
    }

    /// Swap entries out of the transient tier until `entry` fits.
    ///
    /// An evicted entry that can not be written durably is put back and the
    /// error returned, so nothing is lost.
    fn assure_transient_space(&mut self, entry: &MapEntry, metrics: &CacheMetrics) -> Result<()> {
        let transient = self.transient()?;

        while !transient.has_space_for(entry.size_in_bytes()) {
            if transient.num_entries() == 0 {
                debug!(
                    "'{}' transient tier is empty, accepting oversized entry {}",
                    self.storage_id,
                    entry.log_id()
                );
                break;
            }
            let Some(oldest) = transient.remove_oldest()? else {
                break;
            };

            let id = oldest.unique_id();
            let must_swap =
                !oldest.is_persistent() || self.durable.is_none() || self.pending.contains_key(&id);
            if must_swap {
                if let Err(e) = self.swap_out(&oldest, entry) {
                    if let Err(undo) = transient.put(oldest.clone()) {
                        error!(
                            "'{}' could not restore entry {} after failed swap: {}",
                            self.storage_id,
                            oldest.log_id(),
                            undo
                        );
                    }
                    return Err(e);
                }
                self.pending.remove(&id);
                metrics.record_swap_out();
            }
            oldest.set_swapped(true);
        }
        Ok(())
    }

    fn swap_out(&self, oldest: &Arc<MapEntry>, incoming: &MapEntry) -> Result<()> {
        const LOCATION: &str = "PersistenceCache::assure_transient_space";
        let durable = match (&self.durable, self.is_connected()) {
            (Some(durable), true) => durable.clone(),
            (Some(_), false) => {
                return Err(Error::DurableUnavailable {
                    storage_id: self.storage_id.id(),
                    location: LOCATION.into(),
                    reason: format!(
                        "durable tier is disconnected, entry {} is not handled",
                        incoming.log_id()
                    ),
                })
            }
            (None, _) => {
                return Err(Error::DurableUnavailable {
                    storage_id: self.storage_id.id(),
                    location: LOCATION.into(),
                    reason: format!(
                        "no durable tier configured to swap to, entry {} is not handled",
                        incoming.log_id()
                    ),
                })
            }
        };

        durable.limits().check_admission(
            &self.storage_id,
            LOCATION,
            durable.num_entries(),
            durable.num_bytes(),
            oldest.size_in_bytes(),
        )?;

        debug!("'{}' swapping {} to the durable tier", self.storage_id, oldest.log_id());
        durable.put(oldest.clone()).map_err(|e| {
            error!(
                "'{}' swapping {} failed, entry {} is rejected: {}",
                self.storage_id,
                oldest.log_id(),
                incoming.log_id(),
                e
            );
            e
        })?;
        Ok(())
    }

    fn get(&mut self, unique_id: u64, metrics: &CacheMetrics) -> Result<Option<Arc<MapEntry>>> {
        let transient = self.transient()?;
        if let Some(entry) = transient.get(unique_id)? {
            entry.set_swapped(false);
            metrics.record_transient_hit();
            return Ok(Some(entry));
        }

        let Some(durable) = self.connected_durable() else {
            metrics.record_miss();
            return Ok(None);
        };
        let Some(entry) = durable.get(unique_id)? else {
            metrics.record_miss();
            return Ok(None);
        };
        metrics.record_durable_hit();

        let swapped_in = !entry.is_persistent();
        if swapped_in {
            durable.remove(&entry)?;
        }
        let promoted = self
            .assure_transient_space(&entry, metrics)
            .and_then(|_| transient.put(entry.clone()));
        if let Err(e) = promoted {
            if swapped_in {
                if let Err(undo) = durable.put(entry.clone()) {
                    error!(
                        "'{}' could not return entry {} to the durable tier: {}",
                        self.storage_id,
                        entry.log_id(),
                        undo
                    );
                }
            }
            return Err(e);
        }
        if swapped_in {
            metrics.record_swap_in();
        }
        entry.set_swapped(false);
        Ok(Some(entry))
    }

    fn get_all(&self, filter: Option<EntryFilter<'_>>) -> Result<Vec<Arc<MapEntry>>> {
        let transient = self.transient()?;
        let mut by_id = BTreeMap::new();
        if let Some(durable) = self.connected_durable() {
            for entry in durable.get_all(filter)? {
                by_id.insert(entry.unique_id(), entry);
            }
        }
        // the transient copy wins for entries in both tiers
        for entry in transient.get_all(filter)? {
            by_id.insert(entry.unique_id(), entry);
        }
        Ok(by_id.into_values().collect())
    }

    fn remove(&mut self, entry: &MapEntry) -> Result<usize> {
        let transient = self.transient()?;
        let unique_id = entry.unique_id();
        let from_transient = transient.remove_by_id(unique_id)?;

        let mut from_durable = 0;
        if let Some(durable) = self.connected_durable() {
            if entry.is_persistent() || (from_transient == 0 && self.num_swapped() > 0) {
                from_durable = durable.remove_by_id(unique_id)?;
            }
        }
        self.pending.remove(&unique_id);
        Ok(from_transient.max(from_durable))
    }

    fn remove_by_id(&mut self, unique_id: u64) -> Result<usize> {
        let transient = self.transient()?;
        if let Some(entry) = transient.get(unique_id)? {
            return self.remove(&entry);
        }
        // not cached: only the durable tier can hold it
        self.pending.remove(&unique_id);
        match self.connected_durable() {
            Some(durable) => durable.remove_by_id(unique_id),
            None => Ok(0),
        }
    }

    fn change(&mut self, old: &Arc<MapEntry>, new: MapEntry) -> Result<Arc<MapEntry>> {
        const LOCATION: &str = "PersistenceCache::change";
        if new.unique_id() != old.unique_id() {
            return Err(Error::IllegalArgument {
                location: LOCATION.into(),
                reason: format!(
                    "changed entry has id {}, expected {}",
                    new.unique_id(),
                    old.unique_id()
                ),
            });
        }
        if new.is_persistent() != old.is_persistent() {
            return Err(Error::not_implemented(
                LOCATION,
                &format!(
                    "Changing the persistence flag of '{}' to persistent={}",
                    old.log_id(),
                    new.is_persistent()
                ),
            ));
        }

        let transient = self.transient()?;
        let unique_id = old.unique_id();
        let new = Arc::new(new);
        let mut changed = None;

        let cached = transient.get(unique_id)?.is_some();
        if cached {
            changed = Some(transient.change(old, new.clone())?);
        }

        let durable_copy = if old.is_persistent() {
            !self.pending.contains_key(&unique_id)
        } else {
            !cached
        };
        if durable_copy {
            match self.connected_durable() {
                Some(durable) => changed = Some(durable.change(old, new.clone())?),
                None => debug!(
                    "'{}' can't update entry {} in the durable tier",
                    self.storage_id,
                    old.log_id()
                ),
            }
        }

        if let Some(size) = self.pending.get_mut(&unique_id) {
            *size = new.size_in_bytes();
        }

        changed.ok_or_else(|| Error::IllegalArgument {
            location: LOCATION.into(),
            reason: format!("entry {} is not stored in '{}'", old.log_id(), self.storage_id),
        })
    }

    fn clear(&mut self) -> u64 {
        let removed = self.num_entries();
        if let Some(transient) = &self.transient {
            if let Err(e) = transient.clear() {
                error!("'{}' could not clear the transient tier: {}", self.storage_id, e);
            }
        }
        if let Some(durable) = self.connected_durable() {
            if let Err(e) = durable.clear() {
                error!("'{}' could not clear the durable tier: {}", self.storage_id, e);
            }
        }
        self.pending.clear();
        removed
    }

    /// Write pending persistent entries to the durable tier
    fn reconcile(&mut self, metrics: &CacheMetrics) -> Result<u64> {
        const LOCATION: &str = "PersistenceCache::reconcile";
        if self.pending.is_empty() {
            return Ok(0);
        }
        let Some(durable) = self.connected_durable() else {
            return Ok(0);
        };
        let transient = self.transient()?;

        let pending = &self.pending;
        let is_pending = |e: &MapEntry| pending.contains_key(&e.unique_id());
        let entries = transient.get_all(Some(&is_pending))?;

        let mut flushed = 0;
        let mut result = Ok(());
        for entry in entries {
            let unique_id = entry.unique_id();
            let written = durable
                .limits()
                .check_admission(
                    &self.storage_id,
                    LOCATION,
                    durable.num_entries(),
                    durable.num_bytes(),
                    entry.size_in_bytes(),
                )
                .and_then(|_| durable.put(entry));
            match written {
                Ok(_) => {
                    self.pending.remove(&unique_id);
                    flushed += 1;
                }
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }

        metrics.record_reconciled(flushed);
        if flushed > 0 {
            info!(
                "'{}' flushed {} persistent entries to the durable tier, {} still pending",
                self.storage_id,
                flushed,
                self.pending.len()
            );
        }
        result.map(|_| flushed)
    }
}

/// Load the durable tier's persistent entries into an empty transient tier.
///
/// Only entries that fit the transient limits are read.
fn prefill(transient: &dyn Store, durable: &dyn Store) -> Result<u64> {
    let mut headers: Vec<_> = durable
        .headers()?
        .into_iter()
        .filter(|h| h.persistent)
        .collect();
    headers.sort_by(reload_order);

    let mut loaded = 0;
    for header in headers {
        if !transient.has_space_for(header.size_in_bytes) {
            break;
        }
        if let Some(entry) = durable.get(header.unique_id)? {
            loaded += transient.put(entry)? as u64;
        }
    }
    Ok(loaded)
}

/// Drop swapped entries a previous run left in the durable tier
fn purge_swapped(durable: &dyn Store) -> Result<u64> {
    let mut removed = 0;
    for header in durable.headers()?.iter().filter(|h| !h.persistent) {
        removed += durable.remove_by_id(header.unique_id)? as u64;
    }
    Ok(removed)
}

// =============================================================================
// Persistence Cache
// =============================================================================

/// Storage made of a transient and an optional durable tier
pub struct PersistenceCache {
    registry: Arc<StoreRegistry>,
    state: Mutex<CacheState>,
    size_listeners: SizeListenerRegistry,
    metrics: CacheMetrics,
    is_down: AtomicBool,
}

impl PersistenceCache {
    /// Uninitialized cache using the built-in stores
    pub fn new() -> Self {
        Self::with_registry(Arc::new(StoreRegistry::new()))
    }

    /// Uninitialized cache resolving tiers through `registry`
    pub fn with_registry(registry: Arc<StoreRegistry>) -> Self {
        Self {
            registry,
            state: Mutex::new(CacheState::new()),
            size_listeners: SizeListenerRegistry::new(),
            metrics: CacheMetrics::new(),
            is_down: AtomicBool::new(true),
        }
    }

    /// Create and initialize in one step
    pub fn open(storage_id: StorageId, config: CacheConfig) -> Result<Self> {
        let cache = Self::new();
        cache.initialize(storage_id, config)?;
        Ok(cache)
    }

    /// Provision both tiers. Does nothing when already up.
    ///
    /// A durable tier that can not be provisioned is logged and the cache
    /// runs transient-only.
    pub fn initialize(&self, storage_id: StorageId, config: CacheConfig) -> Result<()> {
        let mut state = self.state.lock();
        if !self.is_down.load(Ordering::SeqCst) {
            debug!("'{}' is already initialized", state.storage_id);
            return Ok(());
        }
        config.validate()?;

        let transient_kind = StoreKind::parse_tier(&config.transient_store, StoreKind::Ram)?;
        let transient = self.registry.create(
            &transient_kind,
            &StoreContext {
                storage_id: storage_id.clone(),
                limits: config.transient_limits(),
                config: config.clone(),
            },
        )?;

        let monitor = Arc::new(AvailabilityMonitor::new(storage_id.clone()));
        let durable = match &config.durable_store {
            None => None,
            Some(plugin) => {
                let created = StoreKind::parse_tier(plugin, StoreKind::File).and_then(|kind| {
                    self.registry.create(
                        &kind,
                        &StoreContext {
                            storage_id: storage_id.clone(),
                            limits: config.durable_limits(),
                            config: config.clone(),
                        },
                    )
                });
                match created {
                    Ok(durable) => {
                        monitor.set_connected(true);
                        durable.register_availability_listener(monitor.clone());
                        Some(durable)
                    }
                    Err(e) => {
                        error!(
                            "'{}' could not provision durable tier '{}', running transient-only: {}",
                            storage_id, plugin, e
                        );
                        None
                    }
                }
            }
        };

        if let Some(durable) = &durable {
            match purge_swapped(durable.as_ref()) {
                Ok(0) => {}
                Ok(n) => info!("'{}' removed {} swapped entries of a previous run", storage_id, n),
                Err(e) => error!("'{}' could not remove stale swapped entries: {}", storage_id, e),
            }
            if durable.num_entries() > 0 {
                match prefill(transient.as_ref(), durable.as_ref()) {
                    Ok(n) => info!("'{}' prefilled cache with {} entries", storage_id, n),
                    Err(e) => error!(
                        "'{}' could not reload entries from the durable tier: {}",
                        storage_id, e
                    ),
                }
            }
        }

        *state = CacheState {
            storage_id,
            config,
            transient: Some(transient),
            durable,
            monitor: Some(monitor),
            pending: BTreeMap::new(),
        };
        self.is_down.store(false, Ordering::SeqCst);
        info!("Initialized persistence cache {}", state.describe());
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        let mut state = self.state.lock();
        if !self.is_down.load(Ordering::SeqCst) {
            state.recheck_durable();
            self.after_reconnect(&mut state);
        }
        state
    }

    fn lock_active(&self, location: &str) -> Result<MutexGuard<'_, CacheState>> {
        let state = self.lock();
        if self.is_down.load(Ordering::SeqCst) {
            return Err(Error::ResourceUnavailable {
                storage_id: state.storage_id.id(),
                location: location.to_string(),
                reason: "cache is down".into(),
            });
        }
        Ok(state)
    }

    fn after_reconnect(&self, state: &mut CacheState) {
        let reconnected = state.monitor.as_ref().map_or(false, |m| m.take_reconnected());
        if !reconnected || state.pending.is_empty() {
            return;
        }
        if state.config.reconcile_on_reconnect {
            if let Err(e) = state.reconcile(&self.metrics) {
                warn!(
                    "'{}' reconciling after reconnect stopped, {} entries still pending: {}",
                    state.storage_id,
                    state.pending.len(),
                    e
                );
            }
        } else {
            warn!(
                "'{}' durable tier reconnected, {} persistent entries admitted meanwhile stay transient only",
                state.storage_id,
                state.pending.len()
            );
        }
    }

    fn notify(&self, change: Option<SizeChange>) {
        if let Some(change) = change {
            self.size_listeners.notify(&change);
        }
    }

    fn size_change(&self, state: &CacheState) -> Option<SizeChange> {
        if self.size_listeners.is_empty() {
            None
        } else {
            Some(state.size_change(false))
        }
    }

    // =========================================================================
    // Entry Operations
    // =========================================================================

    /// Store an entry; returns 1 if any tier took it, 0 for a duplicate
    pub fn put(&self, entry: Arc<MapEntry>) -> Result<usize> {
        let (stored, change) = {
            let mut state = self.lock_active("PersistenceCache::put")?;
            let stored = state.put(&entry, &self.metrics)?;
            (stored, self.size_change(&state))
        };
        self.notify(change);
        Ok(stored)
    }

    /// Look up an entry, swapping it back into the transient tier if needed
    pub fn get(&self, unique_id: u64) -> Result<Option<Arc<MapEntry>>> {
        let mut state = self.lock_active("PersistenceCache::get")?;
        state.get(unique_id, &self.metrics)
    }

    /// All entries accepted by `filter`, sorted by id
    pub fn get_all(&self, filter: Option<EntryFilter<'_>>) -> Result<Vec<Arc<MapEntry>>> {
        let state = self.lock_active("PersistenceCache::get_all")?;
        state.get_all(filter)
    }

    /// Remove an entry from every tier holding it
    pub fn remove(&self, entry: &MapEntry) -> Result<usize> {
        let (removed, change) = {
            let mut state = self.lock_active("PersistenceCache::remove")?;
            let removed = state.remove(entry)?;
            (removed, self.size_change(&state))
        };
        self.notify(change);
        Ok(removed)
    }

    /// Remove by id without promoting a swapped entry first
    pub fn remove_by_id(&self, unique_id: u64) -> Result<usize> {
        let (removed, change) = {
            let mut state = self.lock_active("PersistenceCache::remove_by_id")?;
            let removed = state.remove_by_id(unique_id)?;
            (removed, self.size_change(&state))
        };
        self.notify(change);
        Ok(removed)
    }

    /// Always fails with `NotImplemented`
    pub fn remove_oldest(&self) -> Result<Option<Arc<MapEntry>>> {
        Err(Error::not_implemented("PersistenceCache::remove_oldest", "remove_oldest"))
    }

    /// Always fails with `NotImplemented`
    pub fn remove_transient(&self) -> Result<u64> {
        Err(Error::not_implemented(
            "PersistenceCache::remove_transient",
            "remove_transient",
        ))
    }

    /// Replace `entry` by what `f` returns. `None` leaves it untouched.
    ///
    /// The persistence flag can not be changed.
    pub fn change<F>(&self, entry: &Arc<MapEntry>, f: F) -> Result<Arc<MapEntry>>
    where
        F: FnOnce(&MapEntry) -> Option<MapEntry>,
    {
        let mut state = self.lock_active("PersistenceCache::change")?;
        match f(entry.as_ref()) {
            Some(new) => state.change(entry, new),
            None => Ok(entry.clone()),
        }
    }

    /// [`change`](Self::change) for the entry with `unique_id`; `None` if
    /// there is no such entry
    pub fn change_by_id<F>(&self, unique_id: u64, f: F) -> Result<Option<Arc<MapEntry>>>
    where
        F: FnOnce(&MapEntry) -> Option<MapEntry>,
    {
        let mut state = self.lock_active("PersistenceCache::change_by_id")?;
        let Some(entry) = state.get(unique_id, &self.metrics)? else {
            return Ok(None);
        };
        match f(entry.as_ref()) {
            Some(new) => state.change(&entry, new).map(Some),
            None => Ok(Some(entry)),
        }
    }

    /// Flush pending persistent entries to the durable tier now
    pub fn reconcile(&self) -> Result<u64> {
        let mut state = self.lock_active("PersistenceCache::reconcile")?;
        state.reconcile(&self.metrics)
    }

    /// Remove everything from both tiers; returns the logical number of
    /// entries removed. Tier errors are logged.
    pub fn clear(&self) -> u64 {
        let (removed, change) = {
            let mut state = self.lock();
            let removed = state.clear();
            (removed, self.size_change(&state))
        };
        self.notify(change);
        removed
    }

    // =========================================================================
    // Sizes
    // =========================================================================

    pub fn num_entries(&self) -> u64 {
        self.lock().num_entries()
    }

    pub fn num_bytes(&self) -> u64 {
        self.lock().num_bytes()
    }

    pub fn num_persistent_entries(&self) -> u64 {
        self.lock().num_persistent_entries()
    }

    pub fn num_persistent_bytes(&self) -> u64 {
        self.lock().num_persistent_bytes()
    }

    /// Durable tier's limit when connected, else the transient tier's
    pub fn max_entries(&self) -> u64 {
        self.lock().limits().max_entries
    }

    pub fn max_bytes(&self) -> u64 {
        self.lock().limits().max_bytes
    }

    /// Entries held by the transient tier
    pub fn num_cached_entries(&self) -> u64 {
        self.lock().transient.as_ref().map_or(0, |t| t.num_entries())
    }

    pub fn num_cached_bytes(&self) -> u64 {
        self.lock().transient.as_ref().map_or(0, |t| t.num_bytes())
    }

    pub fn max_entries_cache(&self) -> u64 {
        self.lock().cache_limits().max_entries
    }

    pub fn max_bytes_cache(&self) -> u64 {
        self.lock().cache_limits().max_bytes
    }

    /// Non persistent entries currently swapped to the durable tier
    pub fn num_swapped(&self) -> u64 {
        self.lock().num_swapped()
    }

    /// Persistent entries not yet written to the durable tier
    pub fn num_pending(&self) -> u64 {
        self.lock().pending.len() as u64
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    pub fn set_max_entries(&self, max: u64) -> String {
        self.set_max(Limit::Entries, max)
    }

    pub fn set_max_bytes(&self, max: u64) -> String {
        self.set_max(Limit::Bytes, max)
    }

    pub fn set_max_entries_cache(&self, max: u64) -> String {
        self.set_max(Limit::EntriesCache, max)
    }

    pub fn set_max_bytes_cache(&self, max: u64) -> String {
        self.set_max(Limit::BytesCache, max)
    }

    fn set_max(&self, limit: Limit, max: u64) -> String {
        let loc = limit.name();
        let mut state = self.lock();
        let id = state.storage_id.clone();
        if state.durable.is_none() {
            return format!("{}: No persistence store found, setMax{}({}) ignored", id, loc, max);
        }

        let old = limit.get(&state.config);
        info!("{}: Change request of max{}={}, to {} ...", id, loc, old, max);
        if max == old {
            return format!(
                "{}: Currently max{}={}, changing to setMax{}({}) are identical",
                id, loc, old, loc, max
            );
        }

        // shrinking below the current residency only blocks further puts
        let mut config = state.config.clone();
        limit.set(&mut config, max);
        let word = if max < old { "decreased" } else { "increased" };
        match state.apply_config(config) {
            Ok(()) => format!("{}: Successfully {} max{}={} to {}", id, word, loc, old, max),
            Err(e) => {
                warn!("{}: setMax{}({}) failed: {}", id, loc, max, e);
                format!("{}: setMax{}({}) failed: {}", id, loc, max, e)
            }
        }
    }

    /// Apply a new configuration's limits to both tiers
    pub fn set_config(&self, config: CacheConfig) -> Result<()> {
        self.lock().apply_config(config)
    }

    /// Active configuration
    pub fn config(&self) -> CacheConfig {
        self.lock().config.clone()
    }

    pub fn storage_id(&self) -> StorageId {
        self.lock().storage_id.clone()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// True if no tier survives a restart
    pub fn is_transient(&self) -> bool {
        let state = self.lock();
        state.transient.as_ref().map_or(true, |t| t.is_transient())
            && state.durable.as_ref().map_or(true, |d| d.is_transient())
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_down.load(Ordering::SeqCst)
    }

    /// Durable tier configured and reachable
    pub fn is_connected(&self) -> bool {
        self.lock().is_connected()
    }

    /// Re-check a disconnected durable tier now and flush pending entries
    /// if it is back. Every operation does this on its own; returns whether
    /// the durable tier is connected afterwards.
    pub fn check_durable(&self) -> bool {
        self.lock().is_connected()
    }

    /// Release both tiers keeping durable data. The cache can be initialized
    /// again afterwards.
    pub fn shutdown(&self) {
        let change = {
            let mut state = self.state.lock();
            if self.is_down.swap(true, Ordering::SeqCst) {
                return;
            }
            let transients = state
                .num_entries()
                .saturating_sub(state.num_persistent_entries());
            if transients > 0 {
                warn!(
                    "Shutting down persistence cache '{}' which contains {} transient entries",
                    state.storage_id, transients
                );
            }
            let change = state.size_change(true);

            if let Some(transient) = &state.transient {
                transient.shutdown();
            }
            if let Some(durable) = state.connected_durable() {
                durable.shutdown();
            }
            state.unregister_monitor();
            state.pending.clear();
            change
        };

        self.size_listeners.notify(&change);
        self.size_listeners.clear();
        info!("Persistence cache '{}' is shut down", change.storage_id);
    }

    /// Discard the data of both tiers.
    ///
    /// The transient tier is always destroyed; a durable failure is returned
    /// afterwards.
    pub fn destroy(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.is_down.store(true, Ordering::SeqCst);

        let durable = state.connected_durable();
        state.detach_monitor();
        let durable_result = match durable {
            Some(durable) => durable.destroy(),
            None => Ok(()),
        };

        if let Some(transient) = &state.transient {
            if let Err(e) = transient.destroy() {
                error!("'{}' could not destroy the transient tier: {}", state.storage_id, e);
            }
        }
        state.pending.clear();

        if let Err(e) = &durable_result {
            error!("'{}' could not destroy the durable tier: {}", state.storage_id, e);
        } else {
            info!("Persistence cache '{}' destroyed", state.storage_id);
        }
        durable_result
    }

    // =========================================================================
    // Listeners
    // =========================================================================

    pub fn add_size_listener(&self, listener: Arc<dyn StorageSizeListener>) -> bool {
        self.size_listeners.add(listener)
    }

    pub fn remove_size_listener(&self, listener: &Arc<dyn StorageSizeListener>) -> bool {
        self.size_listeners.remove(listener)
    }

    /// With `None`: whether any size listener is registered
    pub fn has_size_listener(&self, listener: Option<&Arc<dyn StorageSizeListener>>) -> bool {
        self.size_listeners.contains(listener)
    }

    /// Register with the durable tier; false without one
    pub fn register_availability_listener(&self, listener: Arc<dyn AvailabilityListener>) -> bool {
        match &self.lock().durable {
            Some(durable) => durable.register_availability_listener(listener),
            None => false,
        }
    }

    pub fn unregister_availability_listener(&self, listener: &Arc<dyn AvailabilityListener>) -> bool {
        match &self.lock().durable {
            Some(durable) => durable.unregister_availability_listener(listener),
            None => false,
        }
    }

    // =========================================================================
    // Administration
    // =========================================================================

    /// Dump the durable tier as JSON lines; 0 without a durable tier
    pub fn dump_durable(&self, out: &mut dyn Write) -> Result<u64> {
        let state = self.lock();
        match &state.durable {
            Some(durable) => durable.dump(out),
            None => {
                warn!(
                    "'{}' has no durable tier, dumping transient entries is not supported",
                    state.storage_id
                );
                Ok(0)
            }
        }
    }

    /// Dump the durable tier to `path` (default `<stripped id>.jsonl`)
    pub fn dump_to_file(&self, path: Option<&Path>) -> Result<String> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => PathBuf::from(format!("{}.jsonl", self.storage_id().stripped_id())),
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::io::BufWriter::new(std::fs::File::create(&path)?);
        let count = self.dump_durable(&mut out)?;
        out.flush()?;
        let shown = path.canonicalize().unwrap_or(path);
        Ok(format!("Dumped {} entries to '{}'", count, shown.display()))
    }

    /// Counters since creation
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// One-line state summary
    pub fn describe(&self) -> String {
        self.lock().describe()
    }
}

impl Default for PersistenceCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PersistenceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceCache")
            .field("state", &self.state.lock().describe())
            .field("is_down", &self.is_shutdown())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msgstore::entry::{EntryHeader, Priority};
    use crate::msgstore::ram::RamStore;
    use crate::msgstore::store::{AvailabilityNotifier, StorageStatus};
    use assert_matches::assert_matches;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;

    /// Durable stand-in that can be disconnected and made to fail
    struct SwitchStore {
        inner: RamStore,
        notifier: AvailabilityNotifier,
        fail_writes: AtomicBool,
        fail_destroy: AtomicBool,
        heal_on_check: AtomicBool,
        loads: AtomicUsize,
    }

    impl SwitchStore {
        fn new(limits: TierLimits) -> Arc<Self> {
            let store = Arc::new(Self {
                inner: RamStore::new(
                    StorageId::new("cache", "switch"),
                    limits,
                    Default::default(),
                ),
                notifier: AvailabilityNotifier::new(),
                fail_writes: AtomicBool::new(false),
                fail_destroy: AtomicBool::new(false),
                heal_on_check: AtomicBool::new(false),
                loads: AtomicUsize::new(0),
            });
            store.notifier.transition(StorageStatus::Available);
            store
        }

        fn disconnect(&self) {
            self.notifier.transition(StorageStatus::Unavailable);
        }

        fn reconnect(&self) {
            self.notifier.transition(StorageStatus::Available);
        }

        fn io_error() -> Error {
            Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk gone"))
        }
    }

    impl Store for SwitchStore {
        fn kind(&self) -> StoreKind {
            StoreKind::Custom("SWITCH".into())
        }
        fn storage_id(&self) -> &StorageId {
            self.inner.storage_id()
        }
        fn is_transient(&self) -> bool {
            false
        }
        fn put(&self, entry: Arc<MapEntry>) -> Result<usize> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(Self::io_error());
            }
            self.inner.put(entry)
        }
        fn get(&self, unique_id: u64) -> Result<Option<Arc<MapEntry>>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            self.inner.get(unique_id)
        }
        fn get_all(&self, filter: Option<EntryFilter<'_>>) -> Result<Vec<Arc<MapEntry>>> {
            let entries = self.inner.get_all(filter)?;
            self.loads.fetch_add(entries.len(), Ordering::SeqCst);
            Ok(entries)
        }
        fn headers(&self) -> Result<Vec<EntryHeader>> {
            self.inner.headers()
        }
        fn remove_by_id(&self, unique_id: u64) -> Result<usize> {
            self.inner.remove_by_id(unique_id)
        }
        fn remove_oldest(&self) -> Result<Option<Arc<MapEntry>>> {
            self.inner.remove_oldest()
        }
        fn change(&self, old: &MapEntry, new: Arc<MapEntry>) -> Result<Arc<MapEntry>> {
            self.inner.change(old, new)
        }
        fn clear(&self) -> Result<u64> {
            self.inner.clear()
        }
        fn num_entries(&self) -> u64 {
            self.inner.num_entries()
        }
        fn num_bytes(&self) -> u64 {
            self.inner.num_bytes()
        }
        fn num_persistent_entries(&self) -> u64 {
            self.inner.num_persistent_entries()
        }
        fn num_persistent_bytes(&self) -> u64 {
            self.inner.num_persistent_bytes()
        }
        fn limits(&self) -> TierLimits {
            self.inner.limits()
        }
        fn set_limits(&self, limits: TierLimits) -> Result<()> {
            self.inner.set_limits(limits)
        }
        fn shutdown(&self) {
            self.inner.shutdown()
        }
        fn is_shutdown(&self) -> bool {
            self.inner.is_shutdown()
        }
        fn destroy(&self) -> Result<()> {
            if self.fail_destroy.load(Ordering::SeqCst) {
                return Err(Self::io_error());
            }
            self.inner.destroy()
        }
        fn register_availability_listener(&self, listener: Arc<dyn AvailabilityListener>) -> bool {
            self.notifier.register(listener)
        }
        fn unregister_availability_listener(&self, listener: &Arc<dyn AvailabilityListener>) -> bool {
            self.notifier.unregister(listener)
        }
        fn check_available(&self) {
            if self.heal_on_check.load(Ordering::SeqCst) {
                self.reconnect();
            }
        }
    }

    fn config(max_entries: u64, max_entries_cache: u64) -> CacheConfig {
        CacheConfig {
            max_entries,
            max_entries_cache,
            durable_store: Some("SWITCH,1.0".into()),
            ..CacheConfig::default()
        }
    }

    fn switchable(config: CacheConfig) -> (PersistenceCache, Arc<SwitchStore>) {
        let durable = SwitchStore::new(config.durable_limits());
        let cache = switchable_over(durable.clone(), config);
        (cache, durable)
    }

    fn switchable_over(durable: Arc<SwitchStore>, config: CacheConfig) -> PersistenceCache {
        let registry = Arc::new(StoreRegistry::new());
        let handle = durable.clone();
        registry.register(
            "SWITCH",
            Arc::new(move |_ctx: &StoreContext| -> Result<Arc<dyn Store>> { Ok(handle.clone()) }),
        );
        let cache = PersistenceCache::with_registry(registry);
        cache
            .initialize(StorageId::new("msgUnitStore", "unit"), config)
            .unwrap();
        cache
    }

    fn transient(id: u64) -> Arc<MapEntry> {
        Arc::new(MapEntry::new(id, Bytes::from_static(b"0123456789")))
    }

    fn persistent(id: u64) -> Arc<MapEntry> {
        Arc::new(MapEntry::new(id, Bytes::from_static(b"0123456789")).with_persistent(true))
    }

    #[test]
    fn test_uninitialized_cache_is_down() {
        let cache = PersistenceCache::new();
        assert!(cache.is_shutdown());
        assert_matches!(cache.put(transient(1)), Err(Error::ResourceUnavailable { .. }));
        assert_eq!(cache.num_entries(), 0);
        assert_eq!(cache.clear(), 0);
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let (cache, durable) = switchable(config(10, 2));
        cache.put(transient(1)).unwrap();
        cache
            .initialize(StorageId::new("other", "id"), config(99, 99))
            .unwrap();
        assert_eq!(cache.storage_id(), StorageId::new("msgUnitStore", "unit"));
        assert_eq!(cache.num_entries(), 1);
        assert!(cache.is_connected());
        assert_eq!(durable.notifier.listener_count(), 1);
    }

    #[test]
    fn test_swap_out_and_in() {
        let (cache, durable) = switchable(config(10, 1));
        cache.put(transient(1)).unwrap();
        cache.put(transient(2)).unwrap();

        assert_eq!(cache.num_cached_entries(), 1);
        assert_eq!(cache.num_swapped(), 1);
        assert_eq!(cache.num_entries(), 2);
        assert!(durable.get(1).unwrap().unwrap().is_swapped());

        let a = cache.get(1).unwrap().unwrap();
        assert!(!a.is_swapped());
        assert!(durable.get(1).unwrap().is_none());
        assert!(durable.get(2).unwrap().is_some());
        assert_eq!(cache.num_entries(), 2);

        let metrics = cache.metrics();
        assert_eq!(metrics.swap_outs, 2);
        assert_eq!(metrics.swap_ins, 1);
    }

    #[test]
    fn test_persistent_entries_live_in_both_tiers() {
        let (cache, durable) = switchable(config(10, 1));
        cache.put(persistent(1)).unwrap();
        assert_eq!(durable.num_entries(), 1);
        assert_eq!(cache.num_cached_entries(), 1);
        assert_eq!(cache.num_entries(), 1);
        assert_eq!(cache.num_persistent_entries(), 1);

        // evicted without a second durable write
        cache.put(transient(2)).unwrap();
        assert_eq!(durable.num_entries(), 1);
        assert_eq!(cache.num_swapped(), 0);
        assert_eq!(cache.num_entries(), 2);
        assert_eq!(cache.metrics().swap_outs, 0);

        assert!(cache.get(1).unwrap().is_some());
    }

    #[test]
    fn test_overflow_leaves_state_unchanged() {
        let (cache, durable) = switchable(config(2, 1));
        cache.put(transient(1)).unwrap();
        cache.put(transient(2)).unwrap();

        let err = cache.put(transient(3)).unwrap_err();
        assert_matches!(err, Error::OverflowEntries { max_entries: 2, .. });
        assert_eq!(cache.num_entries(), 2);
        assert_eq!(cache.num_cached_entries(), 1);
        assert_eq!(durable.num_entries(), 1);
        assert_eq!(cache.metrics().overflow_rejections, 1);
    }

    #[test]
    fn test_duplicate_put_is_ignored() {
        let (cache, durable) = switchable(config(2, 1));
        assert_eq!(cache.put(transient(1)).unwrap(), 1);
        assert_eq!(cache.put(transient(2)).unwrap(), 1);

        // 1 is swapped out, 2 is cached; the storage is full
        assert_eq!(cache.put(transient(1)).unwrap(), 0);
        assert_eq!(cache.put(transient(2)).unwrap(), 0);
        assert_eq!(cache.num_entries(), 2);
        assert_eq!(durable.num_entries(), 1);
        assert_eq!(cache.metrics().overflow_rejections, 0);
    }

    #[test]
    fn test_durable_capacity_checked_for_persistent_put() {
        let mut cfg = config(10, 10);
        cfg.max_bytes = 15;
        let (cache, durable) = switchable(cfg);
        cache.put(persistent(1)).unwrap();
        assert_matches!(cache.put(persistent(2)), Err(Error::OverflowBytes { .. }));
        assert_eq!(durable.num_entries(), 1);
        assert_eq!(cache.num_cached_entries(), 1);
    }

    #[test]
    fn test_durable_write_failure_degrades_to_transient() {
        let (cache, durable) = switchable(config(10, 10));
        durable.fail_writes.store(true, Ordering::SeqCst);

        assert_eq!(cache.put(persistent(1)).unwrap(), 1);
        assert_eq!(cache.num_pending(), 1);
        assert_eq!(cache.num_entries(), 1);
        assert_eq!(cache.num_persistent_entries(), 1);
        assert_eq!(cache.metrics().durable_write_failures, 1);

        durable.fail_writes.store(false, Ordering::SeqCst);
        assert_eq!(cache.reconcile().unwrap(), 1);
        assert_eq!(cache.num_pending(), 0);
        assert_eq!(durable.num_persistent_entries(), 1);
        assert_eq!(cache.num_entries(), 1);
    }

    #[test]
    fn test_failed_swap_restores_evicted_entry() {
        let (cache, durable) = switchable(config(10, 1));
        cache.put(transient(1)).unwrap();
        durable.fail_writes.store(true, Ordering::SeqCst);

        assert_matches!(cache.put(transient(2)), Err(Error::Io(_)));
        assert_eq!(cache.num_cached_entries(), 1);
        assert!(cache.get(1).unwrap().is_some());
        assert!(cache.get(2).unwrap().is_none());
    }

    #[test]
    fn test_disconnect_and_reconnect_flushes_pending() {
        let (cache, durable) = switchable(config(10, 10));
        cache.put(persistent(1)).unwrap();
        durable.disconnect();
        assert!(!cache.is_connected());

        cache.put(persistent(2)).unwrap();
        assert_eq!(durable.num_entries(), 1);
        assert_eq!(cache.num_entries(), 2);
        assert_eq!(cache.num_pending(), 1);

        durable.reconnect();
        // the next locked operation flushes
        assert_eq!(cache.num_entries(), 2);
        assert_eq!(durable.num_entries(), 2);
        assert_eq!(cache.num_pending(), 0);
        assert_eq!(cache.metrics().reconciled, 1);
    }

    #[test]
    fn test_reconnect_without_reconciliation() {
        let mut cfg = config(10, 10);
        cfg.reconcile_on_reconnect = false;
        let (cache, durable) = switchable(cfg);
        durable.disconnect();
        cache.put(persistent(1)).unwrap();
        durable.reconnect();

        assert_eq!(cache.num_entries(), 1);
        assert_eq!(durable.num_entries(), 0);
        assert_eq!(cache.num_pending(), 1);
    }

    #[test]
    fn test_pending_entries_are_swapped_not_dropped() {
        let (cache, durable) = switchable(config(10, 1));
        durable.disconnect();
        cache.put(persistent(1)).unwrap();

        // swapping needs the durable tier
        assert_matches!(cache.put(transient(2)), Err(Error::DurableUnavailable { .. }));
        assert_eq!(cache.num_cached_entries(), 1);

        durable.reconnect();
        cache.put(transient(2)).unwrap();
        assert!(durable.get(1).unwrap().is_some());
        assert!(cache.get(1).unwrap().is_some());
    }

    #[test]
    fn test_remove_returns_max_of_tiers() {
        let (cache, durable) = switchable(config(10, 1));
        cache.put(persistent(1)).unwrap();
        assert_eq!(cache.remove(&persistent(1)).unwrap(), 1);
        assert_eq!(durable.num_entries(), 0);

        cache.put(transient(2)).unwrap();
        cache.put(transient(3)).unwrap();
        // 2 is swapped; removing by id does not promote it
        assert_eq!(cache.remove_by_id(2).unwrap(), 1);
        assert_eq!(cache.metrics().swap_ins, 0);
        assert_eq!(cache.num_entries(), 1);
        assert_eq!(cache.remove_by_id(2).unwrap(), 0);
    }

    #[test]
    fn test_get_all_merges_tiers_sorted() {
        let (cache, _durable) = switchable(config(10, 2));
        for id in [5, 1, 3, 2] {
            cache.put(transient(id)).unwrap();
        }
        cache.put(persistent(4)).unwrap();

        let ids: Vec<u64> = cache
            .get_all(None)
            .unwrap()
            .iter()
            .map(|e| e.unique_id())
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);

        let odd = |e: &MapEntry| e.unique_id() % 2 == 1;
        assert_eq!(cache.get_all(Some(&odd)).unwrap().len(), 3);
    }

    #[test]
    fn test_change_entry() {
        let (cache, durable) = switchable(config(10, 10));
        let entry = persistent(1);
        cache.put(entry.clone()).unwrap();

        let changed = cache
            .change(&entry, |e| {
                Some(
                    MapEntry::new(e.unique_id(), Bytes::from_static(b"x"))
                        .with_persistent(true)
                        .with_priority(Priority::HIGH),
                )
            })
            .unwrap();
        assert_eq!(changed.priority(), Priority::HIGH);
        assert_eq!(durable.get(1).unwrap().unwrap().priority(), Priority::HIGH);
        assert_eq!(cache.num_bytes(), 1);

        let unchanged = cache.change(&changed, |_| None).unwrap();
        assert!(Arc::ptr_eq(&unchanged, &changed));

        let err = cache
            .change(&changed, |e| Some(MapEntry::new(e.unique_id(), Bytes::new())))
            .unwrap_err();
        assert_matches!(err, Error::NotImplemented { .. });
    }

    #[test]
    fn test_change_by_id() {
        let (cache, _durable) = switchable(config(10, 10));
        cache.put(transient(1)).unwrap();
        let changed = cache
            .change_by_id(1, |e| Some(e.clone().with_priority(Priority::MAX)))
            .unwrap()
            .unwrap();
        assert_eq!(changed.priority(), Priority::MAX);
        assert!(cache.change_by_id(42, |e| Some(e.clone())).unwrap().is_none());
    }

    #[test]
    fn test_unsupported_operations() {
        let (cache, _durable) = switchable(config(10, 10));
        assert_matches!(cache.remove_oldest(), Err(Error::NotImplemented { .. }));
        assert_matches!(cache.remove_transient(), Err(Error::NotImplemented { .. }));
    }

    #[test]
    fn test_set_max_messages() {
        let (cache, durable) = switchable(config(10, 5));
        let msg = cache.set_max_entries(10);
        assert!(msg.contains("are identical"), "{}", msg);

        let msg = cache.set_max_entries(20);
        assert!(msg.contains("Successfully increased maxNumOfEntries=10 to 20"), "{}", msg);
        assert_eq!(durable.max_entries(), 20);
        assert_eq!(cache.max_entries(), 20);

        let msg = cache.set_max_entries_cache(3);
        assert!(msg.contains("decreased"), "{}", msg);
        assert_eq!(cache.max_entries_cache(), 3);

        let msg = cache.set_max_bytes(0);
        assert!(msg.contains("failed"), "{}", msg);

        let transient_only =
            PersistenceCache::open(StorageId::new("cache", "t"), CacheConfig::transient_only(2, 100))
                .unwrap();
        let msg = transient_only.set_max_bytes_cache(200);
        assert!(msg.contains("No persistence store found"), "{}", msg);
        assert_eq!(transient_only.max_bytes_cache(), 100);
    }

    #[derive(Default)]
    struct SizeRecorder {
        changes: parking_lot::Mutex<Vec<SizeChange>>,
    }

    impl StorageSizeListener for SizeRecorder {
        fn storage_size_changed(&self, change: &SizeChange) {
            self.changes.lock().push(change.clone());
        }
    }

    #[test]
    fn test_size_listener_notifications() {
        let (cache, _durable) = switchable(config(10, 10));
        let recorder = Arc::new(SizeRecorder::default());
        let listener: Arc<dyn StorageSizeListener> = recorder.clone();
        assert!(cache.add_size_listener(listener.clone()));
        assert!(cache.has_size_listener(Some(&listener)));

        cache.put(transient(1)).unwrap();
        cache.put(transient(2)).unwrap();
        cache.remove_by_id(1).unwrap();
        cache.clear();
        cache.shutdown();

        let changes = recorder.changes.lock();
        let counts: Vec<u64> = changes.iter().map(|c| c.num_entries).collect();
        assert_eq!(counts, vec![1, 2, 1, 0, 0]);
        assert!(changes.last().unwrap().is_shutdown);
        assert!(!cache.has_size_listener(None));
    }

    #[test]
    fn test_shutdown_releases_durable_tier() {
        let (cache, durable) = switchable(config(10, 10));
        cache.put(persistent(1)).unwrap();
        cache.shutdown();
        assert!(cache.is_shutdown());
        assert_eq!(durable.notifier.listener_count(), 0);
        assert_matches!(cache.get(1), Err(Error::ResourceUnavailable { .. }));
    }

    #[test]
    fn test_destroy_after_shutdown_reaches_durable_tier() {
        let (cache, durable) = switchable(config(10, 10));
        cache.put(persistent(1)).unwrap();
        cache.shutdown();
        durable.fail_destroy.store(true, Ordering::SeqCst);

        // the failure proves the durable tier was asked to destroy
        assert_matches!(cache.destroy(), Err(Error::Io(_)));
        assert_eq!(durable.notifier.listener_count(), 0);
    }

    #[test]
    fn test_disconnected_tier_is_rechecked() {
        let (cache, durable) = switchable(config(10, 10));
        durable.disconnect();
        cache.put(persistent(1)).unwrap();
        assert!(!cache.check_durable());
        assert_eq!(cache.num_pending(), 1);

        durable.heal_on_check.store(true, Ordering::SeqCst);
        assert!(cache.check_durable());
        assert_eq!(cache.num_pending(), 0);
        assert_eq!(durable.num_persistent_entries(), 1);
    }

    #[test]
    fn test_initialize_reads_only_entries_that_fit() {
        let cfg = config(20, 2);
        let durable = SwitchStore::new(cfg.durable_limits());
        for id in 1..=5 {
            durable.inner.put(persistent(id)).unwrap();
        }
        durable.inner.put(transient(10)).unwrap();
        durable.inner.put(transient(11)).unwrap();

        let cache = switchable_over(durable.clone(), cfg);
        assert_eq!(durable.loads.load(Ordering::SeqCst), 2);
        assert_eq!(durable.num_entries(), 5);
        assert_eq!(cache.num_swapped(), 0);
        assert_eq!(cache.num_cached_entries(), 2);
        assert_eq!(cache.num_entries(), 5);
    }

    #[test]
    fn test_destroy_reraises_durable_failure() {
        let (cache, durable) = switchable(config(10, 10));
        cache.put(transient(1)).unwrap();
        durable.fail_destroy.store(true, Ordering::SeqCst);

        assert_matches!(cache.destroy(), Err(Error::Io(_)));
        assert!(cache.is_shutdown());
        assert_eq!(cache.num_cached_entries(), 0);
    }

    #[test]
    fn test_describe_mentions_state() {
        let (cache, durable) = switchable(config(10, 10));
        cache.put(transient(1)).unwrap();
        let text = cache.describe();
        assert!(text.contains("msgUnitStore:unit"), "{}", text);
        assert!(text.contains("SWITCH connected"), "{}", text);

        durable.disconnect();
        assert!(cache.describe().contains("disconnected"));
    }

    #[test]
    fn test_dump_durable() {
        let (cache, _durable) = switchable(config(10, 10));
        cache.put(persistent(1)).unwrap();
        cache.put(transient(2)).unwrap();
        let mut out = Vec::new();
        assert_eq!(cache.dump_durable(&mut out).unwrap(), 1);

        let transient_only =
            PersistenceCache::open(StorageId::new("cache", "t"), CacheConfig::transient_only(2, 100))
                .unwrap();
        assert_eq!(transient_only.dump_durable(&mut Vec::new()).unwrap(), 0);
    }
}
