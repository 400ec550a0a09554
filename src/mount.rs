//! The mount-crossing cache: a small set-associative cache mapping
//! (filesystem mount, mount-point entry) to the mount stacked on top of
//! it, so path walking does not rescan the mount table at every
//! crossing.
//!
//! Reads are lock-free: each way carries a generation counter that is
//! incremented before and after every write (a seqlock), so a reader
//! that observes an odd or changed counter simply retries or misses.
//! Writes take the way's lock and replace the least-recently-touched way
//! in the set.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use xxhash_rust::xxh3::xxh3_64_with_seed;

use crate::cache::entry::EntryRef;
use crate::stats::{bump, CacheStats};

/// Opaque identity of a filesystem mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MountId(pub u64);

/// The external mount-table layer. `covering_mount` is the full-scan
/// fallback used on a cache miss. Attach/detach notifications must be
/// forwarded to [`crate::NameCache::on_mount_attach`] and
/// [`crate::NameCache::on_mount_detach`] or stale crossings will
/// silently redirect resolution across an unmount boundary.
pub trait MountTable: Send + Sync {
    /// Scan for the mount stacked on top of `entry_id` within `at`.
    fn covering_mount(&self, at: MountId, entry_id: u64) -> Option<MountId>;
}

// Target encoding: 0 = way empty, 1 = cached "no such mount",
// n + 2 = cached mount id n.
const TARGET_EMPTY: u64 = 0;
const TARGET_NONE: u64 = 1;

struct Way {
    /// Seqlock counter: odd while a write is in flight.
    updating: AtomicU64,
    key_mount: AtomicU64,
    key_entry: AtomicU64,
    key_gen: AtomicU64,
    target: AtomicU64,
    /// Global LRU tick of the last touch.
    touched: AtomicU64,
    write_lock: Mutex<()>,
}

impl Way {
    fn new() -> Self {
        Self {
            updating: AtomicU64::new(0),
            key_mount: AtomicU64::new(0),
            key_entry: AtomicU64::new(0),
            key_gen: AtomicU64::new(0),
            target: AtomicU64::new(TARGET_EMPTY),
            touched: AtomicU64::new(0),
            write_lock: Mutex::new(()),
        }
    }
}

pub struct MountCrossCache {
    ways: Vec<Way>,
    sets: usize,
    ways_per_set: usize,
    clock: AtomicU64,
}

impl MountCrossCache {
    pub(crate) fn new(sets: usize, ways_per_set: usize) -> Self {
        let sets = sets.max(1).next_power_of_two();
        let ways_per_set = ways_per_set.max(1);
        Self {
            ways: (0..sets * ways_per_set).map(|_| Way::new()).collect(),
            sets,
            ways_per_set,
            clock: AtomicU64::new(1),
        }
    }

    fn set_range(&self, mount: MountId, entry_id: u64) -> std::ops::Range<usize> {
        let h = xxh3_64_with_seed(&entry_id.to_le_bytes(), mount.0);
        let set = (h as usize) & (self.sets - 1);
        let start = set * self.ways_per_set;
        start..start + self.ways_per_set
    }

    /// Lock-free lookup. `Some(result)` is a hit, where `result` is the
    /// cached answer including "no mount stacked here". `None` is a miss
    /// (including a torn read lost to a concurrent writer).
    pub fn lookup(
        &self,
        mount: MountId,
        entry: &EntryRef,
        stats: &CacheStats,
    ) -> Option<Option<MountId>> {
        for idx in self.set_range(mount, entry.id()) {
            let way = &self.ways[idx];
            let seq1 = way.updating.load(Ordering::Acquire);
            if seq1 & 1 != 0 {
                continue;
            }
            let key_mount = way.key_mount.load(Ordering::Acquire);
            let key_entry = way.key_entry.load(Ordering::Acquire);
            let key_gen = way.key_gen.load(Ordering::Acquire);
            let target = way.target.load(Ordering::Acquire);
            let seq2 = way.updating.load(Ordering::Acquire);
            if seq1 != seq2 || target == TARGET_EMPTY {
                continue;
            }
            if key_mount != mount.0 || key_entry != entry.id() {
                continue;
            }
            // A generation mismatch means the entry went through a
            // destructive structural change since this way was filled.
            if key_gen != entry.generation() {
                continue;
            }
            way.touched
                .store(self.clock.fetch_add(1, Ordering::Relaxed), Ordering::Relaxed);
            bump!(stats.mount_hits);
            return Some(if target == TARGET_NONE {
                None
            } else {
                Some(MountId(target - 2))
            });
        }
        bump!(stats.mount_misses);
        None
    }

    /// Populate after a mount-table scan, replacing the least-recently
    /// touched way in the set.
    pub fn insert(&self, mount: MountId, entry: &EntryRef, result: Option<MountId>) {
        let range = self.set_range(mount, entry.id());
        let mut victim = range.start;
        let mut victim_tick = u64::MAX;
        for idx in range {
            let way = &self.ways[idx];
            let target = way.target.load(Ordering::Acquire);
            if target == TARGET_EMPTY {
                victim = idx;
                break;
            }
            let tick = way.touched.load(Ordering::Relaxed);
            if tick < victim_tick {
                victim_tick = tick;
                victim = idx;
            }
        }

        let way = &self.ways[victim];
        let _guard = way.write_lock.lock();
        way.updating.fetch_add(1, Ordering::AcqRel);
        way.key_mount.store(mount.0, Ordering::Release);
        way.key_entry.store(entry.id(), Ordering::Release);
        way.key_gen.store(entry.generation(), Ordering::Release);
        way.target.store(
            match result {
                None => TARGET_NONE,
                Some(m) => m.0 + 2,
            },
            Ordering::Release,
        );
        way.touched
            .store(self.clock.fetch_add(1, Ordering::Relaxed), Ordering::Relaxed);
        way.updating.fetch_add(1, Ordering::AcqRel);
    }

    /// Invalidate every way that references `mount`, either as the
    /// covered mount or as the cached answer. Called on mount attach and
    /// detach.
    pub fn scrub(&self, mount: MountId) {
        for way in &self.ways {
            let key_mount = way.key_mount.load(Ordering::Acquire);
            let target = way.target.load(Ordering::Acquire);
            if target == TARGET_EMPTY {
                continue;
            }
            let matches = key_mount == mount.0 || target == mount.0 + 2;
            if !matches {
                continue;
            }
            let _guard = way.write_lock.lock();
            way.updating.fetch_add(1, Ordering::AcqRel);
            way.target.store(TARGET_EMPTY, Ordering::Release);
            way.updating.fetch_add(1, Ordering::AcqRel);
        }
    }
}
