//! Cache configuration
//!
//! One canonical [`CacheConfig`] describes the whole storage. The per-tier
//! capacity views are derived from it as immutable [`TierLimits`] values; the
//! tiers never see the canonical object.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::compression::CompressionAlgorithm;
use super::policy::EvictionOrder;
use super::storage_id::StorageId;
use super::{
    DEFAULT_MAX_BYTES, DEFAULT_MAX_BYTES_CACHE, DEFAULT_MAX_ENTRIES, DEFAULT_MAX_ENTRIES_CACHE,
};
use crate::error::{Error, Result};

/// Capacity limits of a single tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimits {
    /// Maximum number of resident entries
    pub max_entries: u64,
    /// Maximum number of resident bytes
    pub max_bytes: u64,
}

impl TierLimits {
    pub fn new(max_entries: u64, max_bytes: u64) -> Self {
        Self {
            max_entries,
            max_bytes,
        }
    }

    /// Whether a tier holding `num_entries`/`num_bytes` can take one more
    /// entry of `entry_bytes`
    #[inline]
    pub fn admits(&self, num_entries: u64, num_bytes: u64, entry_bytes: u64) -> bool {
        num_entries.saturating_add(1) <= self.max_entries
            && num_bytes.saturating_add(entry_bytes) <= self.max_bytes
    }

    /// [`admits`](Self::admits) reporting which limit was hit
    pub fn check_admission(
        &self,
        storage_id: &StorageId,
        location: &str,
        num_entries: u64,
        num_bytes: u64,
        entry_bytes: u64,
    ) -> Result<()> {
        if num_entries.saturating_add(1) > self.max_entries {
            return Err(Error::OverflowEntries {
                storage_id: storage_id.id(),
                location: location.to_string(),
                num_entries,
                max_entries: self.max_entries,
            });
        }
        if num_bytes.saturating_add(entry_bytes) > self.max_bytes {
            return Err(Error::OverflowBytes {
                storage_id: storage_id.id(),
                location: location.to_string(),
                num_bytes,
                entry_bytes,
                max_bytes: self.max_bytes,
            });
        }
        Ok(())
    }

    /// Fails only once a tier is already above its limits. A tier may thus
    /// exceed its limits by exactly one entry.
    pub fn check_not_exceeded(
        &self,
        storage_id: &StorageId,
        location: &str,
        num_entries: u64,
        num_bytes: u64,
        entry_bytes: u64,
    ) -> Result<()> {
        if num_entries > self.max_entries {
            return Err(Error::OverflowEntries {
                storage_id: storage_id.id(),
                location: location.to_string(),
                num_entries,
                max_entries: self.max_entries,
            });
        }
        if num_bytes > self.max_bytes {
            return Err(Error::OverflowBytes {
                storage_id: storage_id.id(),
                location: location.to_string(),
                num_bytes,
                entry_bytes,
                max_bytes: self.max_bytes,
            });
        }
        Ok(())
    }
}

/// File store settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileStoreConfig {
    /// Directory under which each storage gets its own sub-directory
    pub root_dir: PathBuf,
    /// Payload compression
    pub compression: CompressionAlgorithm,
    /// Payloads smaller than this are stored uncompressed
    pub min_compress_bytes: u64,
}

impl Default for FileStoreConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("/var/lib/tiered-msgstore"),
            compression: CompressionAlgorithm::Lz4,
            min_compress_bytes: 1024,
        }
    }
}

/// Canonical storage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Overall entry limit (durable tier)
    pub max_entries: u64,
    /// Overall byte limit (durable tier)
    pub max_bytes: u64,
    /// Entry limit of the transient (RAM) tier
    pub max_entries_cache: u64,
    /// Byte limit of the transient (RAM) tier
    pub max_bytes_cache: u64,
    /// Transient tier plugin, `"TYPE,VERSION"`
    pub transient_store: String,
    /// Durable tier plugin, `"TYPE,VERSION"`; `None` runs transient-only
    pub durable_store: Option<String>,
    /// Eviction order of the transient tier
    pub eviction_order: EvictionOrder,
    /// Flush persistent entries admitted while disconnected once the durable
    /// tier is back
    pub reconcile_on_reconnect: bool,
    /// Settings for `FILE` stores
    pub file_store: FileStoreConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            max_bytes: DEFAULT_MAX_BYTES,
            max_entries_cache: DEFAULT_MAX_ENTRIES_CACHE,
            max_bytes_cache: DEFAULT_MAX_BYTES_CACHE,
            transient_store: "RAM,1.0".to_string(),
            durable_store: Some("FILE,1.0".to_string()),
            eviction_order: EvictionOrder::default(),
            reconcile_on_reconnect: true,
            file_store: FileStoreConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Transient-only configuration with the given cache limits
    pub fn transient_only(max_entries_cache: u64, max_bytes_cache: u64) -> Self {
        Self {
            max_entries_cache,
            max_bytes_cache,
            durable_store: None,
            ..Self::default()
        }
    }

    /// Load from a YAML (or JSON) file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&text)
    }

    /// Parse YAML; JSON is accepted as a YAML subset
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: CacheConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject limits that would make every put fail
    pub fn validate(&self) -> Result<()> {
        if self.max_entries == 0 || self.max_bytes == 0 {
            return Err(Error::Config(format!(
                "max_entries={} and max_bytes={} must both be positive",
                self.max_entries, self.max_bytes
            )));
        }
        if self.max_entries_cache == 0 || self.max_bytes_cache == 0 {
            return Err(Error::Config(format!(
                "max_entries_cache={} and max_bytes_cache={} must both be positive",
                self.max_entries_cache, self.max_bytes_cache
            )));
        }
        if self.transient_store.trim().is_empty() {
            return Err(Error::Config("transient_store must not be empty".into()));
        }
        Ok(())
    }

    /// Limits of the transient tier (the `*_cache` settings)
    pub fn transient_limits(&self) -> TierLimits {
        TierLimits::new(self.max_entries_cache, self.max_bytes_cache)
    }

    /// Limits of the durable tier, which are also the overall limits
    pub fn durable_limits(&self) -> TierLimits {
        TierLimits::new(self.max_entries, self.max_bytes)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CacheConfig::default();
        assert_eq!(config.max_entries, 1000);
        assert_eq!(config.max_bytes, 10 * 1024 * 1024);
        assert_eq!(config.max_entries_cache, 1000);
        assert_eq!(config.max_bytes_cache, 2 * 1024 * 1024);
        assert_eq!(config.transient_store, "RAM,1.0");
        assert_eq!(config.durable_store.as_deref(), Some("FILE,1.0"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_derived_views() {
        let config = CacheConfig {
            max_entries: 10,
            max_bytes: 1000,
            max_entries_cache: 2,
            max_bytes_cache: 100,
            ..CacheConfig::default()
        };
        assert_eq!(config.transient_limits(), TierLimits::new(2, 100));
        assert_eq!(config.durable_limits(), TierLimits::new(10, 1000));
    }

    #[test]
    fn test_admits() {
        let limits = TierLimits::new(2, 100);
        assert!(limits.admits(0, 0, 100));
        assert!(limits.admits(1, 50, 50));
        assert!(!limits.admits(2, 0, 1));
        assert!(!limits.admits(1, 60, 41));
        assert!(!limits.admits(0, u64::MAX, 1));
    }

    #[test]
    fn test_check_admission_names_the_limit() {
        let id = StorageId::new("cache", "t");
        let limits = TierLimits::new(2, 100);
        assert!(limits.check_admission(&id, "test", 1, 50, 50).is_ok());
        assert!(matches!(
            limits.check_admission(&id, "test", 2, 0, 1),
            Err(Error::OverflowEntries { max_entries: 2, .. })
        ));
        assert!(matches!(
            limits.check_admission(&id, "test", 0, 90, 20),
            Err(Error::OverflowBytes { max_bytes: 100, .. })
        ));
    }

    #[test]
    fn test_check_not_exceeded_allows_one_over() {
        let id = StorageId::new("cache", "t");
        let limits = TierLimits::new(2, 100);
        assert!(limits.check_not_exceeded(&id, "test", 2, 100, 500).is_ok());
        assert!(limits.check_not_exceeded(&id, "test", 3, 0, 1).is_err());
        assert!(limits.check_not_exceeded(&id, "test", 0, 101, 1).is_err());
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
max_entries: 10
max_entries_cache: 2
durable_store: "FILE,1.0"
eviction_order: lru
file_store:
  root_dir: /tmp/msgstore
  compression: none
"#;
        let config = CacheConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.max_entries, 10);
        assert_eq!(config.max_entries_cache, 2);
        assert_eq!(config.max_bytes, DEFAULT_MAX_BYTES);
        assert_eq!(config.eviction_order, EvictionOrder::Lru);
        assert_eq!(config.file_store.root_dir, PathBuf::from("/tmp/msgstore"));
        assert_eq!(config.file_store.compression, CompressionAlgorithm::None);
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let config = CacheConfig::transient_only(0, 100);
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let yaml = "max_bytes: 0";
        assert!(CacheConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_transient_only() {
        let config = CacheConfig::transient_only(2, 1024);
        assert!(config.durable_store.is_none());
        assert_eq!(config.transient_limits(), TierLimits::new(2, 1024));
    }
}
