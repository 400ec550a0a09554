//! Capacity enforcement and the background maintenance thread.
//!
//! Each pool (positive, negative) is governed by a two-level hysteresis:
//! crossing the hard limit arms the pool and evicts a small critical
//! batch inline on the arming path; the background thread then works the
//! pool down to a low watermark before disarming. Deferred zaps are
//! retried here as well, escalating to a blocking parent acquisition
//! after repeated contention.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::cache::entry::{EntryRef, F_DEFERRED_ZAP};
use crate::cache::NameCache;
use crate::config::CacheConfig;
use crate::stats::bump;

/// Where an eviction pass is running from. Critical passes are inline on
/// a resolve path and stay small; background passes scale with overage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EvictContext {
    Critical,
    Background,
}

/// Armed/disarmed state per pool. Arming happens at the hard limit,
/// disarming at the low watermark, so the pools breathe instead of
/// thrashing at the boundary.
#[derive(Debug, Default)]
pub(crate) struct Hysteresis {
    pub(crate) pos_high: AtomicBool,
    pub(crate) neg_high: AtomicBool,
}

impl NameCache {
    fn batch_size(&self, ctx: EvictContext, count: u64, limit: u64) -> usize {
        match ctx {
            EvictContext::Critical => self.config().critical_batch,
            EvictContext::Background => {
                let low = CacheConfig::low_watermark(limit as usize) as u64;
                let overage = count.saturating_sub(low);
                (self.config().background_batch_min).max(overage as usize)
            }
        }
    }

    pub(crate) fn hysteresis_negative(&self, ctx: EvictContext) {
        let limit = self.config().negative_limit as u64;
        let count = self.num_negative.load(Ordering::Relaxed);
        let armed = self.hysteresis.neg_high.load(Ordering::Relaxed);
        if !armed {
            if count <= limit {
                return;
            }
            self.hysteresis.neg_high.store(true, Ordering::Relaxed);
        } else if count <= CacheConfig::low_watermark(limit as usize) as u64 {
            self.hysteresis.neg_high.store(false, Ordering::Relaxed);
            return;
        }
        let batch = self.batch_size(ctx, count, limit);
        self.evict_negative_batch(batch);
    }

    pub(crate) fn hysteresis_positive(&self, ctx: EvictContext) {
        let limit = self.config().positive_limit as u64;
        let count = self.num_positive.load(Ordering::Relaxed);
        let armed = self.hysteresis.pos_high.load(Ordering::Relaxed);
        if !armed {
            if count <= limit {
                return;
            }
            self.hysteresis.pos_high.store(true, Ordering::Relaxed);
        } else if count <= CacheConfig::low_watermark(limit as usize) as u64 {
            self.hysteresis.pos_high.store(false, Ordering::Relaxed);
            return;
        }
        let batch = self.batch_size(ctx, count, limit);
        self.evict_positive_batch(batch);
    }

    /// Evict up to `max` of the oldest negative entries. Everything is
    /// opportunistic: a candidate that is locked, re-ranked, revived, or
    /// re-held since the snapshot is simply skipped.
    pub(crate) fn evict_negative_batch(&self, max: usize) -> usize {
        let mut evicted = 0;
        for entry in self.negatives.eviction_candidates(max) {
            if !self.try_hold(&entry) {
                continue;
            }
            if !self.lock_clean(&entry) {
                self.drop_ref(&entry);
                continue;
            }
            // Only the structural reference and ours may remain; anything
            // else means the entry is in active use.
            if !entry.is_negative()
                || entry.has_children()
                || entry.is_root()
                || entry.refs.load(Ordering::Acquire) != 2
            {
                self.unlock(&entry);
                self.drop_ref(&entry);
                continue;
            }
            self.unresolve_inner(&entry);
            self.unlock(&entry);
            if self.try_zap(&entry, false) {
                evicted += 1;
                bump!(self.stats.neg_evictions);
            }
        }
        if evicted > 0 {
            trace!(evicted, "negative eviction pass");
        }
        evicted
    }

    /// Evict up to `max` unreferenced leaf positives, scanning buckets
    /// round-robin from a persistent cursor.
    pub(crate) fn evict_positive_batch(&self, max: usize) -> usize {
        let buckets = self.table.bucket_count();
        let mut evicted = 0;
        let mut scanned = 0;
        while evicted < max && scanned < buckets {
            let idx = self.pos_cursor.fetch_add(1, Ordering::Relaxed) & (buckets - 1);
            scanned += 1;
            for entry in self.table.snapshot(idx) {
                if evicted >= max {
                    break;
                }
                if entry.is_root()
                    || entry.is_destroyed()
                    || !entry.is_positive()
                    || entry.has_children()
                    || entry.refs.load(Ordering::Acquire) != 1
                {
                    continue;
                }
                if !self.try_hold(&entry) {
                    continue;
                }
                if !self.lock_clean(&entry) {
                    self.drop_ref(&entry);
                    continue;
                }
                // Re-validate now that we hold the lock: only the
                // structural reference and ours may remain.
                if !entry.is_positive()
                    || entry.has_children()
                    || entry.refs.load(Ordering::Acquire) != 2
                {
                    self.unlock(&entry);
                    self.drop_ref(&entry);
                    continue;
                }
                self.unresolve_inner(&entry);
                self.unlock(&entry);
                if self.try_zap(&entry, false) {
                    evicted += 1;
                    bump!(self.stats.pos_evictions);
                }
            }
        }
        if evicted > 0 {
            trace!(evicted, "positive eviction pass");
        }
        evicted
    }

    /// Retry zaps whose parent lock was contended. Each list element owns
    /// one logical reference; a pass either completes the zap (consuming
    /// it), hands it back to [`NameCache::drop_ref`] when the entry was
    /// revived, or re-queues via the deferral path inside `try_zap`.
    pub(crate) fn deferred_zap_sweep(&self) {
        let batch: Vec<EntryRef> = std::mem::take(&mut *self.deferred.lock());
        if batch.is_empty() {
            return;
        }
        let retries = self.config().deferred_zap_retries;
        for entry in batch {
            if !entry.has_flag(F_DEFERRED_ZAP) {
                // Resurrected or concurrently disposed; just release the
                // list's reference.
                self.drop_ref(&entry);
                continue;
            }
            if !entry.is_unresolved() {
                // Revived by a lookup while queued; it earned its keep.
                entry.flag_clear(F_DEFERRED_ZAP);
                entry.inner.lock().deferred_attempts = 0;
                self.drop_ref(&entry);
                continue;
            }
            let attempts = {
                let mut inner = entry.inner.lock();
                inner.deferred_attempts += 1;
                inner.deferred_attempts
            };
            entry.flag_clear(F_DEFERRED_ZAP);
            let blocking = attempts > retries;
            self.try_zap(&entry, blocking);
        }
    }

    /// One background maintenance cycle.
    pub(crate) fn maintain(&self) {
        self.deferred_zap_sweep();
        self.hysteresis_negative(EvictContext::Background);
        self.hysteresis_positive(EvictContext::Background);
    }

    /// Start the background maintenance thread. Runs until `shutdown` is
    /// set, sleeping in 1-second ticks between cycles so shutdown is
    /// noticed promptly.
    pub fn start_maintenance(
        self: &Arc<Self>,
        shutdown: Arc<AtomicBool>,
    ) -> std::thread::JoinHandle<()> {
        let cache = Arc::clone(self);
        let interval = cache.config().maintenance_interval;
        std::thread::Builder::new()
            .name("ncache-maintenance".to_string())
            .spawn(move || {
                debug!(?interval, "maintenance thread started");
                while !shutdown.load(Ordering::Relaxed) {
                    let mut remaining = interval;
                    let tick = Duration::from_secs(1);
                    while remaining > Duration::ZERO {
                        if shutdown.load(Ordering::Relaxed) {
                            break;
                        }
                        let sleep_time = remaining.min(tick);
                        std::thread::sleep(sleep_time);
                        remaining = remaining.saturating_sub(sleep_time);
                    }
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    cache.maintain();
                }
                debug!("maintenance thread shutting down");
            })
            .expect("failed to spawn maintenance thread")
    }
}
