//! The fixed-size bucket array behind find-or-create lookup.
//!
//! Buckets are independently locked and hold plain vectors of entry
//! references; bucket critical sections are O(scan) reads plus O(1)
//! pointer edits. The (parent identity, name) hash is xxh3 seeded with
//! the parent's stable id.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;
use xxhash_rust::xxh3::xxh3_64_with_seed;

use crate::cache::entry::{EntryRef, F_DEFERRED_ZAP, F_UNRESOLVED};
use crate::stats::{bump, CacheStats};

pub(crate) struct HashTable {
    buckets: Vec<Bucket>,
    mask: u64,
}

struct Bucket {
    list: Mutex<Vec<EntryRef>>,
}

/// Result of a bucket scan for (parent, name).
pub(crate) enum FindOutcome {
    /// A live entry matched; it has been held (refs incremented) but the
    /// caller still has to lock and re-validate it.
    Live(EntryRef),
    /// A destroyed slot with matching identity and no external holders was
    /// rewritten in place. It is held and already exclusively locked.
    Resurrected(EntryRef),
    Miss,
}

impl HashTable {
    pub(crate) fn new(bucket_count: usize) -> Self {
        let buckets = (0..bucket_count)
            .map(|_| Bucket {
                list: Mutex::new(Vec::new()),
            })
            .collect();
        Self {
            buckets,
            mask: (bucket_count - 1) as u64,
        }
    }

    pub(crate) fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub(crate) fn index(&self, parent_id: u64, name: &[u8]) -> usize {
        (xxh3_64_with_seed(name, parent_id) & self.mask) as usize
    }

    /// Scan a bucket for (parent, name). Holds the match under the bucket
    /// lock so it cannot be zapped between the scan and the caller's lock
    /// attempt.
    pub(crate) fn find(
        &self,
        idx: usize,
        parent: &EntryRef,
        name: &[u8],
        allow_resurrect: bool,
        stats: &CacheStats,
    ) -> FindOutcome {
        let list = self.buckets[idx].list.lock();
        let mut dead_match: Option<&EntryRef> = None;
        for entry in list.iter() {
            bump!(stats.checks);
            if entry.matches(parent, name) {
                entry.refs.fetch_add(1, Ordering::AcqRel);
                return FindOutcome::Live(entry.clone());
            }
            if allow_resurrect
                && dead_match.is_none()
                && entry.is_destroyed()
                && !entry.has_flag(F_DEFERRED_ZAP)
            {
                let inner = entry.inner.lock();
                if inner.name == name
                    && inner.parent.as_ref().is_some_and(|p| Arc::ptr_eq(p, parent))
                {
                    dead_match = Some(entry);
                }
            }
        }

        // Opportunistic resurrection: a destroyed slot whose only
        // remaining reference is the hash/parent linkage can be rewritten
        // instead of freed and reallocated. Indistinguishable from
        // alloc+link for the caller: fresh generation, cleared state.
        if let Some(entry) = dead_match {
            if entry.refs.load(Ordering::Acquire) == 1 && entry.lock.try_lock_exclusive() {
                if entry.refs.load(Ordering::Acquire) == 1 {
                    entry.generation.fetch_add(1, Ordering::AcqRel);
                    entry
                        .flags
                        .store(F_UNRESOLVED, Ordering::Release);
                    {
                        let mut inner = entry.inner.lock();
                        inner.expires_at = None;
                        inner.ns_generation = 0;
                        inner.last_error = None;
                        inner.neg_shard = None;
                        inner.deferred_attempts = 0;
                    }
                    entry.refs.fetch_add(1, Ordering::AcqRel);
                    bump!(stats.resurrections);
                    return FindOutcome::Resurrected(entry.clone());
                }
                entry.lock.unlock_exclusive();
            }
        }

        FindOutcome::Miss
    }

    /// Link a freshly created (or re-hashed) entry into its bucket.
    pub(crate) fn insert(&self, idx: usize, entry: &EntryRef) {
        {
            let mut list = self.buckets[idx].list.lock();
            list.push(entry.clone());
        }
        entry.inner.lock().bucket = Some(idx);
    }

    /// Unlink an entry from its bucket. Returns false if it was not
    /// linked there.
    pub(crate) fn remove(&self, idx: usize, entry: &EntryRef) -> bool {
        let mut list = self.buckets[idx].list.lock();
        let before = list.len();
        list.retain(|e| !Arc::ptr_eq(e, entry));
        let removed = list.len() != before;
        if removed {
            entry.inner.lock().bucket = None;
        }
        removed
    }

    /// Snapshot a bucket's entries for eviction scans. No holds are
    /// taken; callers must hold and re-validate individually.
    pub(crate) fn snapshot(&self, idx: usize) -> Vec<EntryRef> {
        self.buckets[idx].list.lock().clone()
    }

    /// Remove an entry while running `check` atomically with the removal,
    /// under the bucket lock. Used by zap, where the refs check must
    /// exclude concurrent bucket-scan holds.
    pub(crate) fn remove_if(
        &self,
        idx: usize,
        entry: &EntryRef,
        check: impl FnOnce() -> bool,
    ) -> bool {
        let mut list = self.buckets[idx].list.lock();
        if !check() {
            return false;
        }
        list.retain(|e| !Arc::ptr_eq(e, entry));
        entry.inner.lock().bucket = None;
        true
    }
}

/// Shard selection for per-thread structures: hash of the calling
/// context, standing in for hardware CPU affinity.
pub(crate) fn shard_for_thread(token: u64, shard_mask: usize) -> usize {
    (xxh3_64_with_seed(&token.to_le_bytes(), 0x9e3779b97f4a7c15) as usize) & shard_mask
}

impl std::fmt::Debug for HashTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashTable")
            .field("buckets", &self.buckets.len())
            .finish()
    }
}
