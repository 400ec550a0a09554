use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Cache effectiveness counters. All counters are monotonic and updated
/// with relaxed atomics; they are diagnostics, not synchronization.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub(crate) lookups: AtomicU64,
    pub(crate) pos_hits: AtomicU64,
    pub(crate) neg_hits: AtomicU64,
    pub(crate) misses: AtomicU64,
    pub(crate) checks: AtomicU64,
    pub(crate) resolver_calls: AtomicU64,
    pub(crate) resolver_failures: AtomicU64,
    pub(crate) resurrections: AtomicU64,
    pub(crate) zaps: AtomicU64,
    pub(crate) deferred_zaps: AtomicU64,
    pub(crate) pos_evictions: AtomicU64,
    pub(crate) neg_evictions: AtomicU64,
    pub(crate) mount_hits: AtomicU64,
    pub(crate) mount_misses: AtomicU64,
}

macro_rules! bump {
    ($field:expr) => {
        $field.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    };
}
pub(crate) use bump;

/// Point-in-time view of the counters plus live entry counts, suitable
/// for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub generated_at: DateTime<Utc>,
    pub lookups: u64,
    pub pos_hits: u64,
    pub neg_hits: u64,
    pub misses: u64,
    pub checks: u64,
    pub resolver_calls: u64,
    pub resolver_failures: u64,
    pub resurrections: u64,
    pub zaps: u64,
    pub deferred_zaps: u64,
    pub pos_evictions: u64,
    pub neg_evictions: u64,
    pub mount_hits: u64,
    pub mount_misses: u64,
    pub live_entries: u64,
    pub live_positive: u64,
    pub live_negative: u64,
}

impl CacheStats {
    pub(crate) fn snapshot(
        &self,
        live_entries: u64,
        live_positive: u64,
        live_negative: u64,
    ) -> StatsSnapshot {
        StatsSnapshot {
            generated_at: Utc::now(),
            lookups: self.lookups.load(Ordering::Relaxed),
            pos_hits: self.pos_hits.load(Ordering::Relaxed),
            neg_hits: self.neg_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            checks: self.checks.load(Ordering::Relaxed),
            resolver_calls: self.resolver_calls.load(Ordering::Relaxed),
            resolver_failures: self.resolver_failures.load(Ordering::Relaxed),
            resurrections: self.resurrections.load(Ordering::Relaxed),
            zaps: self.zaps.load(Ordering::Relaxed),
            deferred_zaps: self.deferred_zaps.load(Ordering::Relaxed),
            pos_evictions: self.pos_evictions.load(Ordering::Relaxed),
            neg_evictions: self.neg_evictions.load(Ordering::Relaxed),
            mount_hits: self.mount_hits.load(Ordering::Relaxed),
            mount_misses: self.mount_misses.load(Ordering::Relaxed),
            live_entries,
            live_positive,
            live_negative,
        }
    }
}
