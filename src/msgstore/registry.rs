//! Store provisioning
//!
//! Tier plugins are configured as `"TYPE,VERSION"` strings. They are parsed
//! once into a [`StoreKind`]; the registry turns a kind into a live store.
//! Built-in kinds need no registration, other kinds resolve to factories the
//! host registered up front.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, error};

use super::config::{CacheConfig, TierLimits};
use super::file::FileStore;
use super::ram::RamStore;
use super::storage_id::StorageId;
use super::store::Store;
use crate::error::{Error, Result};

/// Plugin type reserved for the cache itself
const CACHE_TYPE: &str = "CACHE";

/// Supported tier kinds
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StoreKind {
    /// [`RamStore`]
    Ram,
    /// [`FileStore`]
    File,
    /// Host-provided store, upper-case type name
    Custom(String),
}

impl StoreKind {
    /// Parse `"TYPE,VERSION"`; returns the kind and the version (`1.0` when
    /// omitted)
    pub fn parse(plugin: &str) -> Result<(StoreKind, String)> {
        let mut parts = plugin.splitn(2, ',');
        let type_name = parts.next().unwrap_or_default().trim().to_ascii_uppercase();
        let version = parts
            .next()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or("1.0")
            .to_string();

        let kind = match type_name.as_str() {
            "" => {
                return Err(Error::Config(format!(
                    "store plugin '{}' has no type",
                    plugin
                )))
            }
            "RAM" => StoreKind::Ram,
            "FILE" => StoreKind::File,
            _ => StoreKind::Custom(type_name),
        };
        Ok((kind, version))
    }

    /// Parse a tier plugin, refusing the cache itself as a tier.
    ///
    /// A `CACHE` tier would recurse endlessly; it is logged and replaced by
    /// `fallback`.
    pub fn parse_tier(plugin: &str, fallback: StoreKind) -> Result<StoreKind> {
        let (kind, _) = Self::parse(plugin)?;
        if kind == StoreKind::Custom(CACHE_TYPE.to_string()) {
            error!(
                "Store plugin '{}' can not be used as a cache tier, using '{}' instead",
                plugin,
                fallback.name()
            );
            return Ok(fallback);
        }
        Ok(kind)
    }

    /// Type name as written in the plugin string
    pub fn name(&self) -> &str {
        match self {
            StoreKind::Ram => "RAM",
            StoreKind::File => "FILE",
            StoreKind::Custom(name) => name,
        }
    }
}

impl std::fmt::Display for StoreKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// What a factory needs to build one tier
#[derive(Debug, Clone)]
pub struct StoreContext {
    pub storage_id: StorageId,
    /// Limits of the tier being built
    pub limits: TierLimits,
    /// Canonical configuration of the whole storage
    pub config: CacheConfig,
}

/// Builds stores of one custom kind
pub trait StoreFactory: Send + Sync {
    fn create(&self, ctx: &StoreContext) -> Result<Arc<dyn Store>>;
}

impl<F> StoreFactory for F
where
    F: Fn(&StoreContext) -> Result<Arc<dyn Store>> + Send + Sync,
{
    fn create(&self, ctx: &StoreContext) -> Result<Arc<dyn Store>> {
        self(ctx)
    }
}

/// Resolves a [`StoreKind`] into a store
#[derive(Default)]
pub struct StoreRegistry {
    custom: DashMap<String, Arc<dyn StoreFactory>>,
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for a custom type name; replaces an existing one
    pub fn register(&self, type_name: &str, factory: Arc<dyn StoreFactory>) {
        let type_name = type_name.trim().to_ascii_uppercase();
        debug!("Registering store factory for '{}'", type_name);
        self.custom.insert(type_name, factory);
    }

    pub fn unregister(&self, type_name: &str) -> bool {
        self.custom
            .remove(&type_name.trim().to_ascii_uppercase())
            .is_some()
    }

    /// Whether `kind` can be built
    pub fn supports(&self, kind: &StoreKind) -> bool {
        match kind {
            StoreKind::Ram | StoreKind::File => true,
            StoreKind::Custom(name) => self.custom.contains_key(name),
        }
    }

    /// Build a store of `kind`
    pub fn create(&self, kind: &StoreKind, ctx: &StoreContext) -> Result<Arc<dyn Store>> {
        match kind {
            StoreKind::Ram => Ok(Arc::new(RamStore::new(
                ctx.storage_id.clone(),
                ctx.limits,
                ctx.config.eviction_order,
            ))),
            StoreKind::File => Ok(Arc::new(FileStore::open(
                ctx.storage_id.clone(),
                ctx.limits,
                &ctx.config.file_store,
            )?)),
            StoreKind::Custom(name) => {
                // clone out so the map shard is not locked while building
                let factory = self
                    .custom
                    .get(name)
                    .map(|f| Arc::clone(f.value()))
                    .ok_or_else(|| {
                        Error::Config(format!("no store factory registered for '{}'", name))
                    })?;
                factory.create(ctx)
            }
        }
    }
}

impl std::fmt::Debug for StoreRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.custom.iter().map(|e| e.key().clone()).collect();
        f.debug_struct("StoreRegistry").field("custom", &names).finish()
    }
}
