//! Tiered Message Store
//!
//! A storage cache for uniquely identified message entries. A bounded RAM
//! tier serves reads; a durable tier keeps persistent entries and takes the
//! overflow of non persistent ones ("swapping").
//!
//! # Architecture
//!
//! ```text
//!              put / get / remove / change
//!                          │
//!                          ▼
//!               ┌─────────────────────┐     size listeners
//!               │  PersistenceCache   │────────────────────▶
//!               └──────────┬──────────┘
//!              ┌───────────┴───────────┐
//!              ▼                       ▼
//!      ┌───────────────┐       ┌───────────────┐
//!      │   RamStore    │ swap  │   FileStore   │
//!      │  (transient)  │──────▶│   (durable)   │
//!      └───────────────┘◀──────└───────────────┘
//! ```
//!
//! # Modules
//!
//! - [`msgstore`] - Cache controller, tiers and their configuration
//! - [`error`] - Error types and codes

pub mod error;
pub mod msgstore;

// Re-export commonly used types
pub use error::{Error, ErrorCode, Result};
pub use msgstore::{
    CacheConfig, FileStore, MapEntry, PersistenceCache, Priority, RamStore, StorageId, Store,
    StoreKind, StoreRegistry,
};
