//! Two-Tiered Message Storage
//!
//! Stores uniquely identified entries across a fast transient tier and a
//! slower durable tier behind one storage interface.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                        PersistenceCache                              │
//! │          (one lock: put / get / remove / change / clear)             │
//! ├──────────────────────────────────┬───────────────────────────────────┤
//! │  Transient tier (RamStore)       │  Durable tier (FileStore, ...)    │
//! │  ┌────────────────────────────┐  │  ┌─────────────────────────────┐  │
//! │  │ HashMap + eviction index   │  │  │ one record file per entry   │  │
//! │  │ limits: *_cache            │  │  │ limits: max_entries/bytes   │  │
//! │  └────────────────────────────┘  │  └─────────────────────────────┘  │
//! │               │  swap out (oldest, non persistent)  ▲                │
//! │               └─────────────────────────────────────┘                │
//! │               ◄──────── swap in on get ─────────────┘                │
//! ├──────────────────────────────────┴───────────────────────────────────┤
//! │  AvailabilityMonitor: durable tier connected / reconnected flags     │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Persistent entries live in the durable tier and possibly also in the
//! transient tier. Non persistent entries live in exactly one tier; they only
//! reach the durable tier when evicted ("swapped").

pub mod availability;
pub mod cache;
pub mod compression;
pub mod config;
pub mod entry;
pub mod file;
pub mod listener;
pub mod metrics;
pub mod policy;
pub mod ram;
pub mod registry;
pub mod storage_id;
pub mod store;

#[cfg(test)]
mod proptest;

pub use availability::AvailabilityMonitor;
pub use cache::PersistenceCache;
pub use compression::CompressionAlgorithm;
pub use config::{CacheConfig, FileStoreConfig, TierLimits};
pub use entry::{next_unique_id, EntryHeader, MapEntry, Priority};
pub use file::FileStore;
pub use listener::{SizeChange, SizeListenerRegistry, StorageSizeListener};
pub use metrics::{CacheMetrics, MetricsSnapshot};
pub use policy::EvictionOrder;
pub use ram::RamStore;
pub use registry::{StoreContext, StoreFactory, StoreKind, StoreRegistry};
pub use storage_id::StorageId;
pub use store::{AvailabilityListener, AvailabilityNotifier, EntryFilter, StorageStatus, Store};

/// Default overall entry limit
pub const DEFAULT_MAX_ENTRIES: u64 = 1000;

/// Default overall byte limit (10MB)
pub const DEFAULT_MAX_BYTES: u64 = 10 * 1024 * 1024;

/// Default entry limit of the transient tier
pub const DEFAULT_MAX_ENTRIES_CACHE: u64 = 1000;

/// Default byte limit of the transient tier (2MB)
pub const DEFAULT_MAX_BYTES_CACHE: u64 = 2 * 1024 * 1024;

// =============================================================================
// Tests
// =============================================================================
