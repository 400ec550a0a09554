use std::time::Duration;

/// Tunable parameters for the cache. All limits are soft: the eviction
/// hysteresis brings counts back under them rather than rejecting inserts.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Number of hash buckets; rounded up to a power of two.
    pub hash_buckets: usize,
    /// Number of negative-list shards; rounded up to a power of two.
    pub shards: usize,
    /// Soft cap on cached negative entries.
    pub negative_limit: usize,
    /// Soft cap on cached positive entries.
    pub positive_limit: usize,
    /// Entries evicted per critical-path hysteresis pass.
    pub critical_batch: usize,
    /// Minimum entries evicted per background hysteresis pass.
    pub background_batch_min: usize,
    /// Maximum recursion depth for invalidation before the walk is
    /// re-rooted at the overflowing node.
    pub max_invalidate_depth: usize,
    /// How long a blocking lock acquisition may stall before a
    /// diagnostic is logged. The acquisition never times out.
    pub lock_warn_threshold: Duration,
    /// Non-blocking zap attempts a deferred entry gets from the
    /// maintenance sweep before the sweep escalates to a blocking
    /// parent-lock acquisition.
    pub deferred_zap_retries: u32,
    /// Mount-crossing cache sets; rounded up to a power of two.
    pub mount_cache_sets: usize,
    /// Ways per mount-crossing cache set.
    pub mount_cache_ways: usize,
    /// Interval between background maintenance passes.
    pub maintenance_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            hash_buckets: 4096,
            shards: 16,
            // Keep at least 1024 negatives before eviction kicks in; the
            // positive pool is usually an order of magnitude larger.
            negative_limit: 1024,
            positive_limit: 16384,
            critical_batch: 8,
            background_batch_min: 32,
            max_invalidate_depth: 32,
            lock_warn_threshold: Duration::from_secs(5),
            deferred_zap_retries: 8,
            mount_cache_sets: 256,
            mount_cache_ways: 4,
            maintenance_interval: Duration::from_secs(5),
        }
    }
}

impl CacheConfig {
    /// Low watermark for a pool: eviction stays engaged until the live
    /// count drops below ~90% of the limit.
    pub(crate) fn low_watermark(limit: usize) -> usize {
        limit - limit / 10
    }

    pub(crate) fn bucket_count(&self) -> usize {
        self.hash_buckets.max(2).next_power_of_two()
    }

    pub(crate) fn shard_count(&self) -> usize {
        self.shards.max(1).next_power_of_two()
    }
}
