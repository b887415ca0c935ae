//! File Store - directory-backed durable tier
//!
//! # Layout
//!
//! ```text
//! <root_dir>/<stripped storage id>/
//!     00001697040000000000042.entry    {"unique_id":..,"compression":"lz4",..}\n<payload>
//!     ...
//! ```
//!
//! Every entry is one record file: a JSON header line followed by the payload
//! (LZ4 compressed when that pays off). Records are written to a temp file and
//! renamed into place, so a crash leaves either the old or the new record.
//!
//! # Design
//!
//! - In-memory index of headers, rebuilt from the record files on open
//! - Payloads are read from disk on every `get`
//! - Any I/O failure flips the status to `Unavailable` and tells the
//!   availability listeners; [`FileStore::probe`] flips it back and is run by
//!   `check_available` while the store is unavailable

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::compression::{CompressionAlgorithm, PayloadCodec};
use super::config::{FileStoreConfig, TierLimits};
use super::entry::{EntryHeader, MapEntry};
use super::registry::StoreKind;
use super::storage_id::StorageId;
use super::store::{
    AvailabilityListener, AvailabilityNotifier, EntryFilter, StorageStatus, Store,
};
use crate::error::{Error, Result};

const RECORD_EXTENSION: &str = "entry";
const TEMP_EXTENSION: &str = "tmp";

/// Header line of a record file
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RecordHeader {
    #[serde(flatten)]
    entry: EntryHeader,
    /// Algorithm the payload bytes on disk are encoded with
    compression: CompressionAlgorithm,
    /// Length of the payload bytes on disk
    stored_len: u64,
    written_at: DateTime<Utc>,
}

#[derive(Default)]
struct FileIndex {
    headers: HashMap<u64, EntryHeader>,
    /// (priority, unique_id): lowest priority, then oldest first
    order: BTreeSet<(u8, u64)>,
}

impl FileIndex {
    fn insert(&mut self, header: EntryHeader) {
        self.order.insert((header.priority.value(), header.unique_id));
        self.headers.insert(header.unique_id, header);
    }

    fn remove(&mut self, unique_id: u64) -> Option<EntryHeader> {
        let header = self.headers.remove(&unique_id)?;
        self.order.remove(&(header.priority.value(), unique_id));
        Some(header)
    }
}

/// Durable store keeping one file per entry
pub struct FileStore {
    storage_id: StorageId,
    dir: PathBuf,
    codec: PayloadCodec,
    index: Mutex<FileIndex>,
    limits: RwLock<TierLimits>,
    notifier: AvailabilityNotifier,
    num_entries: AtomicU64,
    num_bytes: AtomicU64,
    num_persistent_entries: AtomicU64,
    num_persistent_bytes: AtomicU64,
    shutdown: AtomicBool,
}

impl FileStore {
    /// Open (or create) the store directory and rebuild the index
    pub fn open(storage_id: StorageId, limits: TierLimits, config: &FileStoreConfig) -> Result<Self> {
        let dir = config.root_dir.join(storage_id.stripped_id());
        fs::create_dir_all(&dir)?;

        let store = Self {
            storage_id,
            dir,
            codec: PayloadCodec::new(config.compression, config.min_compress_bytes),
            index: Mutex::new(FileIndex::default()),
            limits: RwLock::new(limits),
            notifier: AvailabilityNotifier::new(),
            num_entries: AtomicU64::new(0),
            num_bytes: AtomicU64::new(0),
            num_persistent_entries: AtomicU64::new(0),
            num_persistent_bytes: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
        };
        let loaded = store.rebuild_index()?;
        store.notifier.transition(StorageStatus::Available);

        info!(
            "Opened file store '{}' at {} with {} entries",
            store.storage_id,
            store.dir.display(),
            loaded
        );
        Ok(store)
    }

    /// Directory holding the record files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Current connection status
    pub fn status(&self) -> StorageStatus {
        self.notifier.status()
    }

    /// Check the directory is usable and update the status accordingly
    pub fn probe(&self) -> StorageStatus {
        let usable = fs::create_dir_all(&self.dir)
            .and_then(|_| fs::metadata(&self.dir))
            .map(|m| m.is_dir())
            .unwrap_or(false);
        let status = if usable {
            StorageStatus::Available
        } else {
            StorageStatus::Unavailable
        };
        self.notifier.transition(status);
        status
    }

    fn rebuild_index(&self) -> Result<u64> {
        let mut index = self.index.lock();
        *index = FileIndex::default();
        self.reset_counters();

        for dirent in fs::read_dir(&self.dir)? {
            let path = dirent?.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some(RECORD_EXTENSION) => {}
                Some(TEMP_EXTENSION) => {
                    debug!("Removing leftover temp record {}", path.display());
                    let _ = fs::remove_file(&path);
                    continue;
                }
                _ => continue,
            }
            match read_record(&path) {
                Ok((record, _)) => {
                    self.account_add(&record.entry);
                    index.insert(record.entry);
                }
                Err(e) => warn!("Skipping unreadable record {}: {}", path.display(), e),
            }
        }
        Ok(index.headers.len() as u64)
    }

    fn record_path(&self, unique_id: u64) -> PathBuf {
        self.dir.join(format!("{:023}.{}", unique_id, RECORD_EXTENSION))
    }

    fn ensure_running(&self, location: &str) -> Result<()> {
        if self.is_shutdown() {
            return Err(Error::ResourceUnavailable {
                storage_id: self.storage_id.id(),
                location: location.to_string(),
                reason: "store is shut down".into(),
            });
        }
        Ok(())
    }

    /// Flip to unavailable on I/O trouble and hand the error back
    fn failed(&self, operation: &str, err: Error) -> Error {
        if matches!(err, Error::Io(_)) {
            error!(
                "File store '{}' {} failed, marking unavailable: {}",
                self.storage_id, operation, err
            );
            self.notifier.transition(StorageStatus::Unavailable);
        }
        err
    }

    fn write_record(&self, entry: &MapEntry) -> Result<()> {
        let (stored, compression) = self.codec.encode(entry.payload());
        let record = RecordHeader {
            entry: entry.header(),
            compression,
            stored_len: stored.len() as u64,
            written_at: Utc::now(),
        };

        let path = self.record_path(entry.unique_id());
        let tmp = path.with_extension(TEMP_EXTENSION);
        {
            let mut file = fs::File::create(&tmp)?;
            serde_json::to_writer(&mut file, &record)?;
            file.write_all(b"\n")?;
            file.write_all(&stored)?;
            file.sync_data()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn load(&self, unique_id: u64) -> Result<MapEntry> {
        let (record, stored) = read_record(&self.record_path(unique_id))?;
        let payload = self.codec.decode(&stored, record.compression)?;
        Ok(MapEntry::from_parts(&record.entry, payload))
    }

    fn delete_record(&self, unique_id: u64) -> Result<()> {
        match fs::remove_file(self.record_path(unique_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn account_add(&self, header: &EntryHeader) {
        self.num_entries.fetch_add(1, Ordering::Relaxed);
        self.num_bytes.fetch_add(header.size_in_bytes, Ordering::Relaxed);
        if header.persistent {
            self.num_persistent_entries.fetch_add(1, Ordering::Relaxed);
            self.num_persistent_bytes
                .fetch_add(header.size_in_bytes, Ordering::Relaxed);
        }
    }

    fn account_sub(&self, header: &EntryHeader) {
        self.num_entries.fetch_sub(1, Ordering::Relaxed);
        self.num_bytes.fetch_sub(header.size_in_bytes, Ordering::Relaxed);
        if header.persistent {
            self.num_persistent_entries.fetch_sub(1, Ordering::Relaxed);
            self.num_persistent_bytes
                .fetch_sub(header.size_in_bytes, Ordering::Relaxed);
        }
    }

    fn reset_counters(&self) {
        self.num_entries.store(0, Ordering::Relaxed);
        self.num_bytes.store(0, Ordering::Relaxed);
        self.num_persistent_entries.store(0, Ordering::Relaxed);
        self.num_persistent_bytes.store(0, Ordering::Relaxed);
    }

    fn remove_locked(&self, index: &mut FileIndex, unique_id: u64) -> Result<usize> {
        if !index.headers.contains_key(&unique_id) {
            return Ok(0);
        }
        self.delete_record(unique_id)
            .map_err(|e| self.failed("remove", e))?;
        if let Some(header) = index.remove(unique_id) {
            self.account_sub(&header);
        }
        Ok(1)
    }
}

/// Read a record file into its header and the stored (still encoded) payload
fn read_record(path: &Path) -> Result<(RecordHeader, Bytes)> {
    let raw = fs::read(path)?;
    let split = raw.iter().position(|b| *b == b'\n').ok_or_else(|| {
        Error::Internal(format!("record {} has no header line", path.display()))
    })?;
    let record: RecordHeader = serde_json::from_slice(&raw[..split])?;
    let stored = Bytes::copy_from_slice(&raw[split + 1..]);
    if stored.len() as u64 != record.stored_len {
        return Err(Error::Internal(format!(
            "record {} is truncated: {} of {} payload bytes",
            path.display(),
            stored.len(),
            record.stored_len
        )));
    }
    Ok((record, stored))
}

impl Store for FileStore {
    fn kind(&self) -> StoreKind {
        StoreKind::File
    }

    fn storage_id(&self) -> &StorageId {
        &self.storage_id
    }

    fn is_transient(&self) -> bool {
        false
    }

    fn put(&self, entry: Arc<MapEntry>) -> Result<usize> {
        self.ensure_running("FileStore::put")?;
        let mut index = self.index.lock();
        if index.headers.contains_key(&entry.unique_id()) {
            return Ok(0);
        }
        self.limits().check_admission(
            &self.storage_id,
            "FileStore::put",
            self.num_entries(),
            self.num_bytes(),
            entry.size_in_bytes(),
        )?;

        self.write_record(&entry)
            .map_err(|e| self.failed("put", e))?;
        let header = entry.header();
        self.account_add(&header);
        index.insert(header);
        Ok(1)
    }

    fn get(&self, unique_id: u64) -> Result<Option<Arc<MapEntry>>> {
        self.ensure_running("FileStore::get")?;
        let index = self.index.lock();
        if !index.headers.contains_key(&unique_id) {
            return Ok(None);
        }
        let entry = self.load(unique_id).map_err(|e| self.failed("get", e))?;
        Ok(Some(Arc::new(entry)))
    }

    fn get_all(&self, filter: Option<EntryFilter<'_>>) -> Result<Vec<Arc<MapEntry>>> {
        self.ensure_running("FileStore::get_all")?;
        let index = self.index.lock();
        let mut entries = Vec::with_capacity(index.headers.len());
        for (_, unique_id) in index.order.iter() {
            let entry = self
                .load(*unique_id)
                .map_err(|e| self.failed("get_all", e))?;
            if filter.map_or(true, |f| f(&entry)) {
                entries.push(Arc::new(entry));
            }
        }
        Ok(entries)
    }

    fn headers(&self) -> Result<Vec<EntryHeader>> {
        self.ensure_running("FileStore::headers")?;
        let index = self.index.lock();
        Ok(index
            .order
            .iter()
            .filter_map(|(_, unique_id)| index.headers.get(unique_id).cloned())
            .collect())
    }

    fn remove_by_id(&self, unique_id: u64) -> Result<usize> {
        self.ensure_running("FileStore::remove")?;
        let mut index = self.index.lock();
        self.remove_locked(&mut index, unique_id)
    }

    fn remove_oldest(&self) -> Result<Option<Arc<MapEntry>>> {
        self.ensure_running("FileStore::remove_oldest")?;
        let mut index = self.index.lock();
        let unique_id = match index.order.iter().next() {
            Some((_, id)) => *id,
            None => return Ok(None),
        };
        let entry = self
            .load(unique_id)
            .map_err(|e| self.failed("remove_oldest", e))?;
        self.remove_locked(&mut index, unique_id)?;
        Ok(Some(Arc::new(entry)))
    }

    fn change(&self, old: &MapEntry, new: Arc<MapEntry>) -> Result<Arc<MapEntry>> {
        self.ensure_running("FileStore::change")?;
        if old.unique_id() != new.unique_id() {
            return Err(Error::IllegalArgument {
                location: "FileStore::change".into(),
                reason: format!(
                    "entry id {} can not be changed to {}",
                    old.unique_id(),
                    new.unique_id()
                ),
            });
        }

        let mut index = self.index.lock();
        if !index.headers.contains_key(&old.unique_id()) {
            return Err(Error::IllegalArgument {
                location: "FileStore::change".into(),
                reason: format!("entry {} is not stored in '{}'", old.unique_id(), self.storage_id),
            });
        }
        // rename replaces the old record atomically
        self.write_record(&new)
            .map_err(|e| self.failed("change", e))?;
        if let Some(previous) = index.remove(old.unique_id()) {
            self.account_sub(&previous);
        }
        let header = new.header();
        self.account_add(&header);
        index.insert(header);
        Ok(new)
    }

    fn clear(&self) -> Result<u64> {
        self.ensure_running("FileStore::clear")?;
        let mut index = self.index.lock();
        let ids: Vec<u64> = index.headers.keys().copied().collect();
        let mut removed = 0;
        for unique_id in ids {
            removed += self.remove_locked(&mut index, unique_id)? as u64;
        }
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
        debug!(
            "Shutting down file store '{}', {} entries stay on disk",
            self.storage_id,
            self.num_entries()
        );
        let mut index = self.index.lock();
        *index = FileIndex::default();
        self.reset_counters();
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn destroy(&self) -> Result<()> {
        {
            let mut index = self.index.lock();
            if self.dir.exists() {
                fs::remove_dir_all(&self.dir).map_err(|e| self.failed("destroy", e.into()))?;
            }
            *index = FileIndex::default();
            self.reset_counters();
        }
        self.shutdown.store(true, Ordering::SeqCst);
        info!("Destroyed file store '{}' at {}", self.storage_id, self.dir.display());
        Ok(())
    }

    fn register_availability_listener(&self, listener: Arc<dyn AvailabilityListener>) -> bool {
        self.notifier.register(listener)
    }

    fn unregister_availability_listener(&self, listener: &Arc<dyn AvailabilityListener>) -> bool {
        self.notifier.unregister(listener)
    }

    fn check_available(&self) {
        if !self.is_shutdown() && self.status() != StorageStatus::Available {
            self.probe();
        }
    }
}

impl std::fmt::Debug for FileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore")
            .field("storage_id", &self.storage_id)
            .field("dir", &self.dir)
            .field("status", &self.status())
            .field("num_entries", &self.num_entries())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
