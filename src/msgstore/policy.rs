//! Eviction Ordering Policies
//!
//! Decides which resident entry of the transient tier counts as "oldest" and
//! is swapped out first when space is needed.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use super::entry::{EntryHeader, MapEntry};

/// Position of an entry in a tier's eviction index (smallest goes first)
pub type OrderKey = (u64, u64);

/// Eviction order of the transient tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvictionOrder {
    /// Lowest priority first, then oldest id
    #[default]
    PriorityAge,
    /// Least recently put or read first
    Lru,
}

impl EvictionOrder {
    /// Name of the policy
    pub fn name(&self) -> &'static str {
        match self {
            EvictionOrder::PriorityAge => "priority-age",
            EvictionOrder::Lru => "lru",
        }
    }

    /// Index key for `entry`; `touch` is the store's access sequence number
    #[inline]
    pub fn order_key(&self, entry: &MapEntry, touch: u64) -> OrderKey {
        match self {
            EvictionOrder::PriorityAge => (entry.priority().value() as u64, entry.unique_id()),
            EvictionOrder::Lru => (touch, entry.unique_id()),
        }
    }

    /// Whether a read moves the entry to the back of the eviction order
    #[inline]
    pub fn touches_on_access(&self) -> bool {
        matches!(self, EvictionOrder::Lru)
    }
}

impl std::fmt::Display for EvictionOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Order in which durable entries are reloaded into an empty transient tier:
/// highest priority first, oldest first within a priority.
pub fn reload_order(a: &EntryHeader, b: &EntryHeader) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.unique_id.cmp(&b.unique_id))
}

// =============================================================================
// Tests
// =============================================================================
