//! Per-shard lists of negative (confirmed-absent) entries.
//!
//! Each shard is an independently locked queue ordered oldest-first, so
//! negative eviction can pop from the front of a round-robin shard
//! cursor without touching the others. Lists hold weak references; the
//! entry's logical refcount is not affected by list membership.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::cache::entry::{Entry, EntryRef};
use crate::cache::lock::current_thread_token;
use crate::cache::table::shard_for_thread;

pub(crate) struct NegativeShards {
    shards: Vec<Mutex<VecDeque<Weak<Entry>>>>,
    mask: usize,
    /// Round-robin cursor for eviction passes.
    cursor: AtomicUsize,
}

impl NegativeShards {
    pub(crate) fn new(shard_count: usize) -> Self {
        Self {
            shards: (0..shard_count).map(|_| Mutex::new(VecDeque::new())).collect(),
            mask: shard_count - 1,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Insert a freshly cached negative entry into the calling context's
    /// shard. Returns the shard index the entry must remember.
    pub(crate) fn insert(&self, entry: &EntryRef) -> usize {
        let shard = shard_for_thread(current_thread_token(), self.mask);
        self.shards[shard].lock().push_back(Arc::downgrade(entry));
        shard
    }

    /// Remove an entry from its shard. Idempotent.
    pub(crate) fn remove(&self, shard: usize, entry: &EntryRef) {
        let ptr = Arc::as_ptr(entry);
        self.shards[shard]
            .lock()
            .retain(|w| !std::ptr::eq(w.as_ptr(), ptr));
    }

    /// A negative hit re-ranks the entry to the MRU end of its shard so
    /// eviction stays oldest-first.
    pub(crate) fn touch(&self, shard: usize, entry: &EntryRef) {
        let ptr = Arc::as_ptr(entry);
        let mut list = self.shards[shard].lock();
        if let Some(pos) = list.iter().position(|w| std::ptr::eq(w.as_ptr(), ptr)) {
            if let Some(w) = list.remove(pos) {
                list.push_back(w);
            }
        }
    }

    /// Collect up to `max` of the oldest candidates from the next shard
    /// in round-robin order, pruning dangling weak references as we go.
    pub(crate) fn eviction_candidates(&self, max: usize) -> Vec<EntryRef> {
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        let mut out = Vec::new();
        for step in 0..self.shards.len() {
            let shard = (start + step) & self.mask;
            let mut list = self.shards[shard].lock();
            list.retain(|w| w.strong_count() > 0);
            for w in list.iter() {
                if out.len() >= max {
                    return out;
                }
                if let Some(e) = w.upgrade() {
                    out.push(e);
                }
            }
            if !out.is_empty() {
                // Stay within one shard per pass; the cursor advances the
                // round-robin for the next pass.
                return out;
            }
        }
        out
    }
}
