//! Cache Metrics Collection
//!
//! Counters describing how entries move between the tiers. The host decides
//! how to expose them.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    puts: AtomicU64,
    transient_hits: AtomicU64,
    durable_hits: AtomicU64,
    misses: AtomicU64,

    // movement between tiers
    swap_outs: AtomicU64,
    swap_ins: AtomicU64,

    overflow_rejections: AtomicU64,
    durable_write_failures: AtomicU64,
    reconciled: AtomicU64,
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_put(&self) {
        self.puts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transient_hit(&self) {
        self.transient_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_durable_hit(&self) {
        self.durable_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_swap_out(&self) {
        self.swap_outs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_swap_in(&self) {
        self.swap_ins.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_overflow(&self) {
        self.overflow_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_durable_write_failure(&self) {
        self.durable_write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconciled(&self, count: u64) {
        self.reconciled.fetch_add(count, Ordering::Relaxed);
    }

    pub fn swap_outs(&self) -> u64 {
        self.swap_outs.load(Ordering::Relaxed)
    }

    pub fn swap_ins(&self) -> u64 {
        self.swap_ins.load(Ordering::Relaxed)
    }

    /// Share of reads served without touching the durable tier
    pub fn transient_hit_ratio(&self) -> f64 {
        let hits = self.transient_hits.load(Ordering::Relaxed) as f64;
        let total = hits
            + self.durable_hits.load(Ordering::Relaxed) as f64
            + self.misses.load(Ordering::Relaxed) as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Point-in-time copy of all counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            puts: self.puts.load(Ordering::Relaxed),
            transient_hits: self.transient_hits.load(Ordering::Relaxed),
            durable_hits: self.durable_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            swap_outs: self.swap_outs(),
            swap_ins: self.swap_ins(),
            overflow_rejections: self.overflow_rejections.load(Ordering::Relaxed),
            durable_write_failures: self.durable_write_failures.load(Ordering::Relaxed),
            reconciled: self.reconciled.load(Ordering::Relaxed),
            transient_hit_ratio: self.transient_hit_ratio(),
        }
    }

    /// Reset all counters
    pub fn reset(&self) {
        for counter in [
            &self.puts,
            &self.transient_hits,
            &self.durable_hits,
            &self.misses,
            &self.swap_outs,
            &self.swap_ins,
            &self.overflow_rejections,
            &self.durable_write_failures,
            &self.reconciled,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Serializable metrics snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub puts: u64,
    pub transient_hits: u64,
    pub durable_hits: u64,
    pub misses: u64,
    pub swap_outs: u64,
    pub swap_ins: u64,
    pub overflow_rejections: u64,
    pub durable_write_failures: u64,
    pub reconciled: u64,
    pub transient_hit_ratio: f64,
}

// =============================================================================
// Tests
// =============================================================================
