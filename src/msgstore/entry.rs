//! Map Entry Types
//!
//! The opaque unit stored by every tier. Only the `swapped` flag is mutated
//! after construction; everything else is read-only accounting data.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Message priority, `0` (lowest) to `9` (highest)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(u8);

impl Priority {
    pub const MIN: Priority = Priority(0);
    pub const LOW: Priority = Priority(3);
    pub const NORM: Priority = Priority(5);
    pub const HIGH: Priority = Priority(7);
    pub const MAX: Priority = Priority(9);

    /// Create a priority, clamping values above 9
    pub fn new(value: u8) -> Self {
        Priority(value.min(Self::MAX.0))
    }

    /// Numeric value
    #[inline]
    pub fn value(&self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::NORM
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

static LAST_UNIQUE_ID: AtomicU64 = AtomicU64::new(0);

/// Next process-wide unique entry id.
///
/// Ids are wall-clock nanoseconds, bumped by one whenever the clock has not
/// advanced, so they are strictly increasing and double as an age.
pub fn next_unique_id() -> u64 {
    let now = chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_default()
        .max(0) as u64;
    let mut last = LAST_UNIQUE_ID.load(Ordering::Relaxed);
    loop {
        let candidate = if now > last { now } else { last + 1 };
        match LAST_UNIQUE_ID.compare_exchange_weak(
            last,
            candidate,
            Ordering::AcqRel,
            Ordering::Relaxed,
        ) {
            Ok(_) => return candidate,
            Err(actual) => last = actual,
        }
    }
}

/// An entry stored in a map
pub struct MapEntry {
    unique_id: u64,
    priority: Priority,
    persistent: bool,
    size_in_bytes: u64,
    swapped: AtomicBool,
    payload: Bytes,
}

impl MapEntry {
    /// Create a transient entry with normal priority; size is the payload length
    pub fn new(unique_id: u64, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        Self {
            unique_id,
            priority: Priority::NORM,
            persistent: false,
            size_in_bytes: payload.len() as u64,
            swapped: AtomicBool::new(false),
            payload,
        }
    }

    /// Create with a freshly generated id
    pub fn with_generated_id(payload: impl Into<Bytes>) -> Self {
        Self::new(next_unique_id(), payload)
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the persistence flag
    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// Override the accounted size (defaults to payload length)
    pub fn with_size_in_bytes(mut self, size_in_bytes: u64) -> Self {
        self.size_in_bytes = size_in_bytes;
        self
    }

    #[inline]
    pub fn unique_id(&self) -> u64 {
        self.unique_id
    }

    #[inline]
    pub fn priority(&self) -> Priority {
        self.priority
    }

    #[inline]
    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    #[inline]
    pub fn size_in_bytes(&self) -> u64 {
        self.size_in_bytes
    }

    #[inline]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Resident only in the durable tier
    #[inline]
    pub fn is_swapped(&self) -> bool {
        self.swapped.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_swapped(&self, swapped: bool) {
        self.swapped.store(swapped, Ordering::Release);
    }

    /// Eviction ordering key: priority first, then age
    #[inline]
    pub fn sort_key(&self) -> (Priority, u64) {
        (self.priority, self.unique_id)
    }

    /// Short id used in log lines
    pub fn log_id(&self) -> String {
        format!(
            "{}/prio={}/{}",
            self.unique_id,
            self.priority,
            if self.persistent { "persistent" } else { "transient" }
        )
    }

    /// Header describing this entry, without the payload
    pub fn header(&self) -> EntryHeader {
        EntryHeader {
            unique_id: self.unique_id,
            priority: self.priority,
            persistent: self.persistent,
            size_in_bytes: self.size_in_bytes,
            payload_len: self.payload.len() as u64,
        }
    }

    /// Rebuild an entry from a stored header and payload
    pub fn from_parts(header: &EntryHeader, payload: Bytes) -> Self {
        Self::new(header.unique_id, payload)
            .with_priority(header.priority)
            .with_persistent(header.persistent)
            .with_size_in_bytes(header.size_in_bytes)
    }
}

impl Clone for MapEntry {
    fn clone(&self) -> Self {
        Self {
            unique_id: self.unique_id,
            priority: self.priority,
            persistent: self.persistent,
            size_in_bytes: self.size_in_bytes,
            swapped: AtomicBool::new(self.is_swapped()),
            payload: self.payload.clone(),
        }
    }
}

impl std::fmt::Debug for MapEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapEntry")
            .field("unique_id", &self.unique_id)
            .field("priority", &self.priority)
            .field("persistent", &self.persistent)
            .field("size_in_bytes", &self.size_in_bytes)
            .field("swapped", &self.is_swapped())
            .finish()
    }
}

/// Serializable entry description used by durable stores and dumps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryHeader {
    pub unique_id: u64,
    pub priority: Priority,
    pub persistent: bool,
    pub size_in_bytes: u64,
    pub payload_len: u64,
}

// =============================================================================
// Tests
// =============================================================================
