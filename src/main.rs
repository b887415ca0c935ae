//! Tiered Message Store CLI
//!
//! Administrative front end for a storage: load a configuration, push sample
//! traffic through the cache, inspect or dump a file-backed durable tier.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                    tiered-msgstore CLI                     │
//! ├───────────────────────────────────────────────────────────┤
//! │   exercise ──▶ PersistenceCache ──▶ RamStore / FileStore  │
//! │   inspect  ──▶ FileStore (read only use)                  │
//! │   dump     ──▶ PersistenceCache::dump_to_file             │
//! └───────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tiered_msgstore::msgstore::{
    CacheConfig, FileStore, MapEntry, PersistenceCache, Priority, StorageId, Store, TierLimits,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Tiered message store - RAM cache with swapping to a durable tier
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, global = true, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Push sample entries through a cache and report its state
    Exercise {
        /// YAML configuration file
        #[arg(long, env = "MSGSTORE_CONFIG")]
        config: Option<PathBuf>,

        /// Storage id, `relating:postfix`
        #[arg(long, default_value = "msgUnitStore:exercise")]
        storage_id: StorageId,

        /// Root directory of FILE stores, overrides the configuration
        #[arg(long, env = "MSGSTORE_ROOT_DIR")]
        root_dir: Option<PathBuf>,

        /// Number of entries to put
        #[arg(long, default_value = "100")]
        entries: u64,

        /// Payload size of each entry
        #[arg(long, default_value = "256")]
        payload_bytes: usize,

        /// Every n-th entry is persistent, 0 for none
        #[arg(long, default_value = "3")]
        persistent_every: u64,

        /// Destroy the storage afterwards instead of shutting it down
        #[arg(long)]
        destroy: bool,
    },

    /// Summarize the records of a FILE store
    Inspect {
        /// Root directory of FILE stores
        #[arg(long, env = "MSGSTORE_ROOT_DIR")]
        root_dir: PathBuf,

        /// Storage id, `relating:postfix`
        #[arg(long)]
        storage_id: StorageId,
    },

    /// Dump the durable tier of a storage as JSON lines
    Dump {
        /// YAML configuration file
        #[arg(long, env = "MSGSTORE_CONFIG")]
        config: Option<PathBuf>,

        /// Storage id, `relating:postfix`
        #[arg(long)]
        storage_id: StorageId,

        /// Root directory of FILE stores, overrides the configuration
        #[arg(long, env = "MSGSTORE_ROOT_DIR")]
        root_dir: Option<PathBuf>,

        /// Output file, defaults to `<stripped id>.jsonl`
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

// =============================================================================
// Main
// =============================================================================

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    match args.command {
        Command::Exercise {
            config,
            storage_id,
            root_dir,
            entries,
            payload_bytes,
            persistent_every,
            destroy,
        } => {
            let config = load_config(config, root_dir)?;
            exercise(storage_id, config, entries, payload_bytes, persistent_every, destroy)
        }
        Command::Inspect {
            root_dir,
            storage_id,
        } => inspect(root_dir, storage_id),
        Command::Dump {
            config,
            storage_id,
            root_dir,
            out,
        } => {
            let config = load_config(config, root_dir)?;
            let cache = PersistenceCache::open(storage_id.clone(), config)
                .with_context(|| format!("opening storage '{}'", storage_id))?;
            let result = cache.dump_to_file(out.as_deref());
            cache.shutdown();
            println!("{}", result?);
            Ok(())
        }
    }
}

fn load_config(path: Option<PathBuf>, root_dir: Option<PathBuf>) -> anyhow::Result<CacheConfig> {
    let mut config = match path {
        Some(path) => CacheConfig::from_file(&path)
            .with_context(|| format!("loading configuration {}", path.display()))?,
        None => CacheConfig::default(),
    };
    if let Some(root_dir) = root_dir {
        config.file_store.root_dir = root_dir;
    }
    Ok(config)
}

fn exercise(
    storage_id: StorageId,
    config: CacheConfig,
    entries: u64,
    payload_bytes: usize,
    persistent_every: u64,
    destroy: bool,
) -> anyhow::Result<()> {
    info!("Starting exercise of '{}'", storage_id);
    info!("  Entries: {}", entries);
    info!("  Payload bytes: {}", payload_bytes);
    info!("  Durable tier: {:?}", config.durable_store);

    let cache = PersistenceCache::open(storage_id.clone(), config)
        .with_context(|| format!("opening storage '{}'", storage_id))?;

    let payload = Bytes::from(vec![b'x'; payload_bytes]);
    let mut ids = Vec::with_capacity(entries as usize);
    let mut rejected = 0u64;
    for n in 0..entries {
        let persistent = persistent_every > 0 && n % persistent_every == 0;
        let entry = MapEntry::with_generated_id(payload.clone())
            .with_persistent(persistent)
            .with_priority(Priority::new((n % 10) as u8));
        let unique_id = entry.unique_id();
        match cache.put(Arc::new(entry)) {
            Ok(_) => ids.push(unique_id),
            Err(e) => {
                warn!("Put #{} rejected ({}): {}", n, e.code(), e);
                rejected += 1;
            }
        }
    }

    let mut found = 0u64;
    for unique_id in &ids {
        if cache.get(*unique_id)?.is_some() {
            found += 1;
        }
    }

    println!("{}", cache.describe());
    println!(
        "stored={} rejected={} read back={}",
        ids.len(),
        rejected,
        found
    );
    println!("{}", serde_json::to_string_pretty(&cache.metrics())?);

    if destroy {
        cache.destroy()?;
    } else {
        cache.shutdown();
    }
    Ok(())
}

fn inspect(root_dir: PathBuf, storage_id: StorageId) -> anyhow::Result<()> {
    let config = CacheConfig {
        file_store: tiered_msgstore::msgstore::FileStoreConfig {
            root_dir,
            ..Default::default()
        },
        ..CacheConfig::default()
    };
    let store = FileStore::open(
        storage_id.clone(),
        TierLimits::new(u64::MAX, u64::MAX),
        &config.file_store,
    )
    .with_context(|| format!("opening file store of '{}'", storage_id))?;

    let summary = serde_json::json!({
        "storage_id": storage_id.id(),
        "dir": store.dir().display().to_string(),
        "entries": store.num_entries(),
        "bytes": store.num_bytes(),
        "persistent_entries": store.num_persistent_entries(),
        "persistent_bytes": store.num_persistent_bytes(),
        "swapped_entries": store.num_entries().saturating_sub(store.num_persistent_entries()),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    store.shutdown();
    Ok(())
}

// =============================================================================
// Logging
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
