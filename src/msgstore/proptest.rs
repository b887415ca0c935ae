//! Property tests for the tiered cache
//!
//! Random put/get/remove sequences run against a RAM-over-RAM cache and a
//! plain map model. Entry attributes are derived from the id so a repeated
//! put is a true duplicate.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use proptest::prelude::*;

use super::{CacheConfig, MapEntry, PersistenceCache, Priority, StorageId};

const MAX_ENTRIES: u64 = 24;
const MAX_BYTES: u64 = 900;
const MAX_ENTRIES_CACHE: u64 = 5;
const MAX_BYTES_CACHE: u64 = 200;

#[derive(Debug, Clone)]
enum Op {
    Put(u64),
    Get(u64),
    Remove(u64),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0u64..48).prop_map(Op::Put),
        2 => (0u64..48).prop_map(Op::Get),
        1 => (0u64..48).prop_map(Op::Remove),
    ]
}

fn entry_for(id: u64) -> Arc<MapEntry> {
    let size = 10 + (id * 7) % 50;
    Arc::new(
        MapEntry::new(id, Bytes::from(vec![b'm'; size as usize]))
            .with_persistent(id % 3 == 0)
            .with_priority(Priority::new((id % 10) as u8)),
    )
}

fn cache() -> PersistenceCache {
    let config = CacheConfig {
        max_entries: MAX_ENTRIES,
        max_bytes: MAX_BYTES,
        max_entries_cache: MAX_ENTRIES_CACHE,
        max_bytes_cache: MAX_BYTES_CACHE,
        durable_store: Some("RAM,1.0".into()),
        ..CacheConfig::default()
    };
    PersistenceCache::open(StorageId::new("prop", "cache"), config).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_limits_hold(ops in prop::collection::vec(op_strategy(), 1..120)) {
        let cache = cache();
        for op in ops {
            match op {
                Op::Put(id) => { let _ = cache.put(entry_for(id)); }
                Op::Get(id) => { cache.get(id).unwrap(); }
                Op::Remove(id) => { cache.remove_by_id(id).unwrap(); }
            }
            prop_assert!(cache.num_cached_entries() <= MAX_ENTRIES_CACHE);
            prop_assert!(cache.num_cached_bytes() <= MAX_BYTES_CACHE);
            prop_assert!(cache.num_entries() <= MAX_ENTRIES);
            prop_assert!(cache.num_bytes() <= MAX_BYTES);
        }
    }

    #[test]
    fn prop_counts_match_model(ops in prop::collection::vec(op_strategy(), 1..120)) {
        let cache = cache();
        let mut model: BTreeMap<u64, Arc<MapEntry>> = BTreeMap::new();

        for op in ops {
            match op {
                Op::Put(id) => match cache.put(entry_for(id)) {
                    Ok(1) => { prop_assert!(model.insert(id, entry_for(id)).is_none()); }
                    Ok(_) => { prop_assert!(model.contains_key(&id)); }
                    Err(e) => { prop_assert!(e.is_overflow(), "unexpected error {}", e); }
                },
                Op::Get(id) => {
                    let found = cache.get(id).unwrap();
                    prop_assert_eq!(found.is_some(), model.contains_key(&id));
                    if let Some(entry) = found {
                        prop_assert!(!entry.is_swapped());
                    }
                }
                Op::Remove(id) => {
                    let removed = cache.remove_by_id(id).unwrap();
                    prop_assert_eq!(removed == 1, model.remove(&id).is_some());
                }
            }

            let bytes: u64 = model.values().map(|e| e.size_in_bytes()).sum();
            let persistent = model.values().filter(|e| e.is_persistent()).count() as u64;
            prop_assert_eq!(cache.num_entries(), model.len() as u64);
            prop_assert_eq!(cache.num_bytes(), bytes);
            prop_assert_eq!(cache.num_persistent_entries(), persistent);
        }

        let ids: Vec<u64> = cache.get_all(None).unwrap().iter().map(|e| e.unique_id()).collect();
        prop_assert_eq!(ids, model.keys().copied().collect::<Vec<_>>());
    }
}
