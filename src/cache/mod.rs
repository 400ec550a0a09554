//! The namecache engine: entry lifecycle, find-or-create lookup,
//! resolution, invalidation, rename, and disposal.
//!
//! Locking discipline, in order of nesting: an entry's resolution lock
//! (long-lived, protocol-level) is taken before any bucket lock; bucket
//! locks are taken before an entry's short inner mutex; inner mutexes
//! never nest. Operations needing a child and its parent take the child
//! first and acquire the parent non-blocking, cycling past contention.

pub mod entry;
pub(crate) mod eviction;
pub mod lock;
mod negative;
mod table;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::mount::{MountCrossCache, MountId, MountTable};
use crate::resolver::{BackingObject, Credentials, ObjectKind, ResolveOutcome, Resolver};
use crate::stats::{bump, CacheStats, StatsSnapshot};

use self::entry::{
    Entry, EntryRef, F_DEFERRED_ZAP, F_DESTROYED, F_IS_DIRECTORY, F_IS_MOUNTPOINT, F_IS_SYMLINK,
    F_ROOT, F_UNRESOLVED, F_WHITEOUT,
};
use self::eviction::{EvictContext, Hysteresis};
use self::negative::NegativeShards;
use self::table::{FindOutcome, HashTable};

/// Outcome of a successful resolve: the definitive cached answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Positive,
    Negative { whiteout: bool },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct InvalFlags {
    /// Also mark the entry (and, when recursing, its subtree) DESTROYED.
    pub destroy: bool,
    /// Also force the whole subtree through unresolve.
    pub recurse: bool,
}

pub struct NameCache {
    config: CacheConfig,
    resolver: Arc<dyn Resolver>,
    table: HashTable,
    negatives: NegativeShards,
    /// Reverse index: backing-object id -> entries resolved to it.
    by_object: DashMap<u64, Vec<Weak<Entry>>>,
    mount_cache: MountCrossCache,
    root: EntryRef,
    stats: CacheStats,
    pub(crate) hysteresis: Hysteresis,
    /// Entries whose zap could not take the parent lock; each element
    /// owns one logical reference on its entry.
    deferred: Mutex<Vec<EntryRef>>,
    next_entry_id: AtomicU64,
    /// Bumped on every mount attach/detach; cached negatives older than
    /// the current generation are lazily unresolved.
    ns_generation: AtomicU64,
    pub(crate) num_entries: AtomicU64,
    pub(crate) num_positive: AtomicU64,
    pub(crate) num_negative: AtomicU64,
    /// Round-robin bucket cursor for positive eviction.
    pub(crate) pos_cursor: AtomicUsize,
}

impl NameCache {
    pub fn new(config: CacheConfig, resolver: Arc<dyn Resolver>) -> Arc<NameCache> {
        let root = Arc::new(Entry::new(1, Vec::new(), None, F_ROOT));
        let table = HashTable::new(config.bucket_count());
        let negatives = NegativeShards::new(config.shard_count());
        let mount_cache = MountCrossCache::new(config.mount_cache_sets, config.mount_cache_ways);
        Arc::new(NameCache {
            config,
            resolver,
            table,
            negatives,
            by_object: DashMap::new(),
            mount_cache,
            root,
            stats: CacheStats::default(),
            hysteresis: Hysteresis::default(),
            deferred: Mutex::new(Vec::new()),
            next_entry_id: AtomicU64::new(2),
            ns_generation: AtomicU64::new(0),
            num_entries: AtomicU64::new(1),
            num_positive: AtomicU64::new(0),
            num_negative: AtomicU64::new(0),
            pos_cursor: AtomicUsize::new(0),
        })
    }

    fn alloc_id(&self) -> u64 {
        self.next_entry_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// The permanent namespace root: held, not locked.
    pub fn root(&self) -> EntryRef {
        self.hold(&self.root);
        self.root.clone()
    }

    /// Point the root at a backing object, zapping any previous
    /// association. May be called repeatedly during setup.
    pub fn set_root_object(&self, object: Option<Arc<dyn BackingObject>>) {
        self.root.lock.lock_exclusive(self.config.lock_warn_threshold);
        self.unresolve_inner(&self.root);
        if let Some(obj) = object {
            self.set_positive(&self.root, obj, None);
        }
        self.root.lock.unlock_exclusive();
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot(
            self.num_entries.load(Ordering::Relaxed),
            self.num_positive.load(Ordering::Relaxed),
            self.num_negative.load(Ordering::Relaxed),
        )
    }

    // -----------------------------------------------------------------
    // Reference counting
    // -----------------------------------------------------------------

    /// Take an additional reference. Legal only while at least one
    /// reference already exists (the caller's own, or the structural one
    /// implied by finding the entry via the hash table).
    pub fn hold(&self, entry: &EntryRef) {
        let prev = entry.refs.fetch_add(1, Ordering::AcqRel);
        assert!(prev >= 1, "namecache: hold on a dead entry (refs {prev})");
    }

    /// Release a reference. The 1->0 transition destroys the entry; an
    /// unresolved, childless entry whose only other reference is its
    /// linkage is opportunistically zapped instead of left as garbage.
    pub fn drop_ref(&self, entry: &EntryRef) {
        loop {
            let r = entry.refs.load(Ordering::Acquire);
            assert!(r >= 1, "namecache: ref underflow on drop (refs {r})");
            if r == 1 {
                assert!(
                    !self.is_linked(entry),
                    "namecache: last reference dropped on a linked entry"
                );
                if entry
                    .refs
                    .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    // No other holder can exist: unresolve without the
                    // lock and let the memory go.
                    self.unresolve_inner(entry);
                    entry.flag_set(F_DESTROYED);
                    self.num_entries.fetch_sub(1, Ordering::Relaxed);
                    return;
                }
                continue;
            }
            if r == 2
                && entry.is_unresolved()
                && !entry.is_root()
                && !entry.has_children()
                && self.is_linked(entry)
            {
                // We are the only external holder; try_zap consumes our
                // reference whether or not it succeeds.
                self.try_zap(entry, false);
                return;
            }
            if entry
                .refs
                .compare_exchange(r, r - 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Like [`Self::hold`], but tolerates losing the race against final
    /// destruction. Used where the entry was reached through a weak
    /// reference rather than an existing hold.
    pub(crate) fn try_hold(&self, entry: &EntryRef) -> bool {
        let mut r = entry.refs.load(Ordering::Acquire);
        while r >= 1 {
            match entry
                .refs
                .compare_exchange_weak(r, r + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(cur) => r = cur,
            }
        }
        false
    }

    fn drop_only(&self, entry: &EntryRef) {
        let prev = entry.refs.fetch_sub(1, Ordering::AcqRel);
        assert!(prev >= 1, "namecache: ref underflow on drop (refs {prev})");
    }

    fn is_linked(&self, entry: &EntryRef) -> bool {
        entry.inner.lock().bucket.is_some()
    }

    // -----------------------------------------------------------------
    // Locking
    // -----------------------------------------------------------------

    /// Blocking exclusive lock.
    pub fn lock(&self, entry: &EntryRef) {
        entry.lock.lock_exclusive(self.config.lock_warn_threshold);
    }

    /// Blocking shared lock. If the backing object turns out to be dead
    /// after acquisition, the lock is upgraded, the entry is unresolved,
    /// and the shared acquisition is retried.
    pub fn lock_shared(&self, entry: &EntryRef) {
        loop {
            entry.lock.lock_shared();
            let dead = entry.object().is_some_and(|o| !o.is_alive());
            if !dead {
                return;
            }
            entry.lock.unlock_shared();
            entry.lock.lock_exclusive(self.config.lock_warn_threshold);
            self.unresolve_inner(entry);
            entry.lock.unlock_exclusive();
        }
    }

    /// Non-blocking "clean" exclusive lock: fails on contention and on
    /// recursive re-entry; on success a dead backing object forces the
    /// entry back to UNRESOLVED before returning.
    pub fn lock_clean(&self, entry: &EntryRef) -> bool {
        if !entry.lock.try_lock_exclusive() {
            return false;
        }
        if entry.object().is_some_and(|o| !o.is_alive()) {
            self.unresolve_inner(entry);
        }
        true
    }

    /// Unlock whichever mode the calling thread holds.
    pub fn unlock(&self, entry: &EntryRef) {
        if entry.lock.held_exclusively_by_current() {
            entry.lock.unlock_exclusive();
        } else {
            entry.lock.unlock_shared();
        }
    }

    // -----------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------

    /// Find or create the child of `parent` named `name`. The parent
    /// must be exclusively locked by the caller; the returned entry is
    /// referenced and exclusively locked.
    pub fn lookup_or_create(&self, parent: &EntryRef, name: &[u8]) -> Result<EntryRef> {
        assert!(
            parent.lock.held_exclusively_by_current(),
            "lookup_or_create requires the parent exclusively locked"
        );
        bump!(self.stats.lookups);
        if parent.is_destroyed() {
            return Err(CacheError::Destroyed);
        }
        if parent.is_positive() && !parent.is_directory() {
            return Err(CacheError::NotDirectory);
        }

        let idx = self.table.index(parent.id, name);
        loop {
            match self.table.find(idx, parent, name, true, &self.stats) {
                FindOutcome::Live(found) => {
                    if !self.lock_clean(&found) {
                        if found.lock.held_exclusively_by_current() {
                            // Recursive re-entry: the caller already owns
                            // this entry's lock.
                            self.drop_ref(&found);
                            return Err(CacheError::WouldBlock);
                        }
                        found.lock.lock_exclusive(self.config.lock_warn_threshold);
                        if found.object().is_some_and(|o| !o.is_alive()) {
                            self.unresolve_inner(&found);
                        }
                    }
                    // Identity may have changed during the unlocked
                    // window (rename, zap + resurrection).
                    if !found.matches(parent, name) {
                        found.lock.unlock_exclusive();
                        self.drop_ref(&found);
                        trace!("lookup raced a structural change; retrying");
                        continue;
                    }
                    self.auto_unresolve(&found);
                    if found.is_positive() {
                        bump!(self.stats.pos_hits);
                    } else if found.is_negative() {
                        bump!(self.stats.neg_hits);
                        let shard = found.inner.lock().neg_shard;
                        if let Some(shard) = shard {
                            self.negatives.touch(shard, &found);
                        }
                    }
                    return Ok(found);
                }
                FindOutcome::Resurrected(entry) => {
                    bump!(self.stats.misses);
                    return Ok(entry);
                }
                FindOutcome::Miss => {
                    bump!(self.stats.misses);
                    return Ok(self.create_linked(parent, name, idx));
                }
            }
        }
    }

    /// Allocate a new unresolved entry and link it under `parent`. The
    /// parent's exclusive lock (asserted by the caller path) serializes
    /// creates for the same (parent, name), so the bucket insert cannot
    /// race a duplicate.
    fn create_linked(&self, parent: &EntryRef, name: &[u8], idx: usize) -> EntryRef {
        let entry = Arc::new(Entry::new(
            self.alloc_id(),
            name.to_vec(),
            Some(parent.clone()),
            0,
        ));
        let acquired = entry.lock.try_lock_exclusive();
        assert!(acquired, "fresh entry lock was contended");
        // One reference for the caller, one for the hash/parent linkage.
        entry.refs.fetch_add(1, Ordering::AcqRel);
        self.table.insert(idx, &entry);
        let pin = {
            let mut pi = parent.inner.lock();
            let was_childless = pi.children.is_empty();
            pi.children.push(entry.clone());
            was_childless && pi.object.is_some()
        };
        if pin {
            // First child pins the parent's object.
            if let Some(obj) = parent.inner.lock().object.clone() {
                obj.hold();
            }
        }
        self.num_entries.fetch_add(1, Ordering::Relaxed);
        entry
    }

    /// Read-mostly lookup: returns a referenced, shared-locked entry only
    /// if it is already usefully resolved and no exclusive request is
    /// pending; otherwise fails with `WouldBlock` and the caller falls
    /// back to [`Self::lookup_or_create`].
    pub fn lookup_shared(&self, parent: &EntryRef, name: &[u8]) -> Result<EntryRef> {
        bump!(self.stats.lookups);
        if parent.is_destroyed() {
            return Err(CacheError::Destroyed);
        }
        let idx = self.table.index(parent.id, name);
        let entry = match self.table.find(idx, parent, name, false, &self.stats) {
            FindOutcome::Live(e) => e,
            _ => {
                bump!(self.stats.misses);
                return Err(CacheError::WouldBlock);
            }
        };
        if !entry.lock.try_lock_shared() {
            self.drop_ref(&entry);
            return Err(CacheError::WouldBlock);
        }
        let valid = entry.matches(parent, name) && !entry.is_unresolved() && {
            if let Some(obj) = entry.object() {
                obj.is_alive() && !self.ttl_expired(&entry)
            } else {
                entry.inner.lock().ns_generation == self.ns_generation.load(Ordering::Acquire)
            }
        };
        if !valid {
            entry.lock.unlock_shared();
            // A dead object discovered on the shared path is invalidated
            // under the exclusive lock before failing over.
            if entry.object().is_some_and(|o| !o.is_alive()) {
                entry.lock.lock_exclusive(self.config.lock_warn_threshold);
                self.unresolve_inner(&entry);
                entry.lock.unlock_exclusive();
            }
            self.drop_ref(&entry);
            return Err(CacheError::WouldBlock);
        }
        if entry.is_positive() {
            bump!(self.stats.pos_hits);
        } else {
            bump!(self.stats.neg_hits);
            let shard = entry.inner.lock().neg_shard;
            if let Some(shard) = shard {
                self.negatives.touch(shard, &entry);
            }
        }
        Ok(entry)
    }

    // -----------------------------------------------------------------
    // Resolution
    // -----------------------------------------------------------------

    /// Resolve an unresolved entry through the backend. Idempotent on an
    /// already-resolved entry: the cached answer is returned without
    /// re-invoking the resolver. Requires the entry exclusively locked.
    pub fn resolve(&self, entry: &EntryRef, cred: &Credentials) -> Result<Resolution> {
        assert!(
            entry.lock.held_exclusively_by_current(),
            "resolve requires the entry exclusively locked"
        );
        if entry.is_destroyed() {
            return Err(CacheError::Destroyed);
        }
        self.auto_unresolve(entry);
        if !entry.is_unresolved() {
            return Ok(if entry.is_positive() {
                Resolution::Positive
            } else {
                Resolution::Negative {
                    whiteout: entry.is_whiteout(),
                }
            });
        }

        let (name, parent_obj) = {
            let inner = entry.inner.lock();
            (
                inner.name.clone(),
                inner.parent.as_ref().and_then(|p| p.object()),
            )
        };
        bump!(self.stats.resolver_calls);
        match self.resolver.resolve(&name, parent_obj.as_ref(), cred) {
            ResolveOutcome::Found { object, ttl } => {
                self.set_positive(entry, object, ttl);
                self.hysteresis_positive(EvictContext::Critical);
                Ok(Resolution::Positive)
            }
            ResolveOutcome::Absent { whiteout } => {
                self.set_negative(entry, whiteout);
                self.hysteresis_negative(EvictContext::Critical);
                Ok(Resolution::Negative { whiteout })
            }
            ResolveOutcome::Fail(err) => {
                // Cached failure: the entry stays unresolved and the
                // error replays until the next explicit resolve.
                entry.inner.lock().last_error = Some(err.clone());
                bump!(self.stats.resolver_failures);
                Err(err.into())
            }
        }
    }

    fn set_positive(
        &self,
        entry: &EntryRef,
        object: Arc<dyn BackingObject>,
        ttl: Option<std::time::Duration>,
    ) {
        object.hold();
        match object.kind() {
            ObjectKind::Directory => entry.flag_set(F_IS_DIRECTORY),
            ObjectKind::Symlink => entry.flag_set(F_IS_SYMLINK),
            _ => {}
        }
        {
            let mut inner = entry.inner.lock();
            if !inner.children.is_empty() {
                // Children pin the object.
                object.hold();
            }
            inner.object = Some(object.clone());
            inner.last_error = None;
            inner.expires_at = ttl
                .and_then(|d| chrono::Duration::from_std(d).ok())
                .map(|d| chrono::Utc::now() + d);
        }
        entry.flag_clear(F_UNRESOLVED);
        self.by_object
            .entry(object.id())
            .or_default()
            .push(Arc::downgrade(entry));
        self.num_positive.fetch_add(1, Ordering::Relaxed);
    }

    fn set_negative(&self, entry: &EntryRef, whiteout: bool) {
        {
            let mut inner = entry.inner.lock();
            inner.object = None;
            inner.last_error = None;
            inner.expires_at = None;
            inner.ns_generation = self.ns_generation.load(Ordering::Acquire);
        }
        if whiteout {
            entry.flag_set(F_WHITEOUT);
        }
        entry.flag_clear(F_UNRESOLVED);
        let shard = self.negatives.insert(entry);
        entry.inner.lock().neg_shard = Some(shard);
        self.num_negative.fetch_add(1, Ordering::Relaxed);
    }

    fn ttl_expired(&self, entry: &EntryRef) -> bool {
        let inner = entry.inner.lock();
        inner
            .expires_at
            .is_some_and(|t| chrono::Utc::now() >= t && inner.children.is_empty())
    }

    /// Lazily drop a resolution that can no longer be trusted: TTL
    /// expiry on a childless positive entry, a dead backing object, or a
    /// negative entry cached before the last mount attach/detach.
    fn auto_unresolve(&self, entry: &EntryRef) {
        if entry.is_unresolved() {
            return;
        }
        let stale = if let Some(obj) = entry.object() {
            !obj.is_alive() || self.ttl_expired(entry)
        } else {
            entry.inner.lock().ns_generation != self.ns_generation.load(Ordering::Acquire)
        };
        if stale {
            self.unresolve_inner(entry);
        }
    }

    /// Disassociate the backing object or negative-list membership and
    /// return to UNRESOLVED. Idempotent. Callers hold the exclusive
    /// lock, except during final destruction when no holder can exist.
    fn unresolve_inner(&self, entry: &EntryRef) {
        if entry.is_unresolved() {
            return;
        }
        let (object, neg_shard, had_children) = {
            let mut inner = entry.inner.lock();
            (
                inner.object.take(),
                inner.neg_shard.take(),
                !inner.children.is_empty(),
            )
        };
        entry.flag_set(F_UNRESOLVED);
        entry.flag_clear(F_IS_DIRECTORY | F_IS_SYMLINK | F_WHITEOUT);
        entry.inner.lock().expires_at = None;
        if let Some(obj) = object {
            let ptr = Arc::as_ptr(entry);
            if let Some(mut list) = self.by_object.get_mut(&obj.id()) {
                list.retain(|w| !std::ptr::eq(w.as_ptr(), ptr));
            }
            self.by_object.remove_if(&obj.id(), |_, v| v.is_empty());
            if had_children {
                obj.release();
            }
            obj.release();
            self.num_positive.fetch_sub(1, Ordering::Relaxed);
        } else if let Some(shard) = neg_shard {
            self.negatives.remove(shard, entry);
            self.num_negative.fetch_sub(1, Ordering::Relaxed);
        }
    }

    // -----------------------------------------------------------------
    // Invalidation
    // -----------------------------------------------------------------

    /// Force the entry (and optionally its subtree) back to UNRESOLVED.
    /// Requires the entry held and exclusively locked by the caller; the
    /// lock is still held on return.
    pub fn invalidate(&self, entry: &EntryRef, flags: InvalFlags) {
        assert!(
            entry.lock.held_exclusively_by_current(),
            "invalidate requires the entry exclusively locked"
        );
        self.unresolve_inner(entry);
        if flags.destroy && !entry.is_root() {
            entry.flag_set(F_DESTROYED);
            entry.generation.fetch_add(1, Ordering::AcqRel);
        }
        if !flags.recurse {
            return;
        }
        // Depth-bounded walk: nodes past the depth limit are remembered
        // (held) and re-walked as fresh top-level roots, converting deep
        // recursion into bounded iteration.
        let mut pending: Vec<EntryRef> = Vec::new();
        self.invalidate_children(entry, flags, 1, &mut pending);
        while let Some(node) = pending.pop() {
            node.lock.lock_exclusive(self.config.lock_warn_threshold);
            if !node.is_destroyed() {
                self.unresolve_inner(&node);
                if flags.destroy {
                    node.flag_set(F_DESTROYED);
                    node.generation.fetch_add(1, Ordering::AcqRel);
                }
                self.invalidate_children(&node, flags, 1, &mut pending);
            }
            node.lock.unlock_exclusive();
            self.drop_ref(&node);
        }
    }

    /// Process the children of a locked parent. The parent is unlocked
    /// around each child acquisition (child-before-parent ordering) and
    /// re-locked to continue the sibling scan; a parent-link mismatch
    /// after the unlocked window means a rename raced past, and the scan
    /// restarts at this level. Without `flags.recurse` the walk stops at
    /// the direct children and never touches `pending`.
    fn invalidate_children(
        &self,
        parent: &EntryRef,
        flags: InvalFlags,
        depth: usize,
        pending: &mut Vec<EntryRef>,
    ) {
        let warn = self.config.lock_warn_threshold;
        'restart: loop {
            let kids: Vec<EntryRef> = parent.inner.lock().children.clone();
            for child in kids {
                if child.is_destroyed() {
                    continue;
                }
                self.hold(&child);
                parent.lock.unlock_exclusive();
                child.lock.lock_exclusive(warn);

                let still_ours = child
                    .inner
                    .lock()
                    .parent
                    .as_ref()
                    .is_some_and(|p| Arc::ptr_eq(p, parent));
                if !still_ours || child.is_destroyed() {
                    child.lock.unlock_exclusive();
                    self.drop_ref(&child);
                    parent.lock.lock_exclusive(warn);
                    continue 'restart;
                }

                if flags.recurse && depth >= self.config.max_invalidate_depth {
                    // Trampoline: abort the descent here and finish this
                    // subtree as a fresh top-level walk later.
                    child.lock.unlock_exclusive();
                    pending.push(child);
                    parent.lock.lock_exclusive(warn);
                    continue;
                }

                self.unresolve_inner(&child);
                if flags.destroy {
                    child.flag_set(F_DESTROYED);
                    child.generation.fetch_add(1, Ordering::AcqRel);
                }
                if flags.recurse && child.has_children() {
                    self.invalidate_children(&child, flags, depth + 1, pending);
                    child.lock.unlock_exclusive();
                    self.drop_ref(&child);
                } else if child.has_children() {
                    // One-level walk: the grandchildren stay put, so the
                    // child cannot be disposed of here.
                    child.lock.unlock_exclusive();
                    self.drop_ref(&child);
                } else {
                    // Leaves fold directly into physical disposal.
                    self.try_zap(&child, false);
                    child.lock.unlock_exclusive();
                }
                parent.lock.lock_exclusive(warn);
            }
            return;
        }
    }

    /// Invalidate every entry currently resolved to `object_id`, plus
    /// their direct children. Catch-all purge for backends that cannot
    /// be more precise about what changed.
    pub fn purge_object(&self, object_id: u64) {
        let entries: Vec<EntryRef> = self
            .by_object
            .get(&object_id)
            .map(|v| v.iter().filter_map(|w| w.upgrade()).collect())
            .unwrap_or_default();
        let warn = self.config.lock_warn_threshold;
        for entry in entries {
            if !self.try_hold(&entry) {
                continue;
            }
            entry.lock.lock_exclusive(warn);
            if entry.is_destroyed() {
                entry.lock.unlock_exclusive();
                self.drop_ref(&entry);
                continue;
            }
            let mut pending = Vec::new();
            self.invalidate_children(&entry, InvalFlags::default(), 1, &mut pending);
            debug_assert!(pending.is_empty(), "purge hit the depth bound at depth 1");
            self.unresolve_inner(&entry);
            entry.lock.unlock_exclusive();
            if entry.is_root() || entry.has_children() {
                self.drop_ref(&entry);
            } else {
                self.try_zap(&entry, false);
            }
        }
    }

    // -----------------------------------------------------------------
    // Rename
    // -----------------------------------------------------------------

    /// Atomically relink `src_leaf` under `dst_par` with `dst_leaf`'s
    /// name, logically destroying the overwritten `dst_leaf`. All four
    /// entries must be referenced by the caller and unlocked; the
    /// four-way cross-lock is taken (and released) internally.
    pub fn rename(
        &self,
        src_par: &EntryRef,
        src_leaf: &EntryRef,
        dst_par: &EntryRef,
        dst_leaf: &EntryRef,
    ) -> Result<()> {
        if Arc::ptr_eq(src_leaf, dst_leaf) {
            return Ok(());
        }
        let warn = self.config.lock_warn_threshold;

        // Child first, then non-blocking acquires for the rest; any
        // contention releases everything, cycles past the holder, and
        // restarts the whole sequence.
        let others: [&EntryRef; 3] = [dst_leaf, src_par, dst_par];
        let mut locked: Vec<&EntryRef> = Vec::with_capacity(4);
        loop {
            src_leaf.lock.lock_exclusive(warn);
            locked.push(src_leaf);
            let mut blocked: Option<&EntryRef> = None;
            for e in others {
                if locked.iter().any(|a| Arc::ptr_eq(a, e)) {
                    continue;
                }
                if e.lock.try_lock_exclusive() {
                    locked.push(e);
                } else {
                    blocked = Some(e);
                    break;
                }
            }
            match blocked {
                None => break,
                Some(b) => {
                    for a in locked.drain(..) {
                        a.lock.unlock_exclusive();
                    }
                    // Cycle past whoever holds it, then restart.
                    b.lock.lock_exclusive(warn);
                    b.lock.unlock_exclusive();
                }
            }
        }

        let unlock_all = |locked: &mut Vec<&EntryRef>| {
            for a in locked.drain(..) {
                a.lock.unlock_exclusive();
            }
        };

        let parents_ok = src_leaf
            .inner
            .lock()
            .parent
            .as_ref()
            .is_some_and(|p| Arc::ptr_eq(p, src_par))
            && dst_leaf
                .inner
                .lock()
                .parent
                .as_ref()
                .is_some_and(|p| Arc::ptr_eq(p, dst_par));
        if src_leaf.is_destroyed()
            || dst_leaf.is_destroyed()
            || src_par.is_destroyed()
            || dst_par.is_destroyed()
            || !parents_ok
        {
            unlock_all(&mut locked);
            return Err(CacheError::Destroyed);
        }

        let new_name = dst_leaf.inner.lock().name.clone();

        // Dispose of the overwritten target first so the renamed source
        // is the only live holder of the name among its new siblings.
        self.unlink_locked(dst_leaf);

        // Unlink the source from its old bucket and parent.
        let old_bucket = src_leaf.inner.lock().bucket;
        if let Some(b) = old_bucket {
            self.table.remove(b, src_leaf);
        }
        let unpin = {
            let mut pi = src_par.inner.lock();
            pi.children.retain(|c| !Arc::ptr_eq(c, src_leaf));
            pi.children.is_empty() && pi.object.is_some()
        };
        if unpin {
            if let Some(obj) = src_par.inner.lock().object.clone() {
                obj.release();
            }
        }

        // Rewrite and relink under the new parent.
        {
            let mut inner = src_leaf.inner.lock();
            inner.name = new_name.clone();
            inner.parent = Some(dst_par.clone());
        }
        let new_bucket = self.table.index(dst_par.id, &new_name);
        self.table.insert(new_bucket, src_leaf);
        let pin = {
            let mut pi = dst_par.inner.lock();
            let was_childless = pi.children.is_empty();
            pi.children.push(src_leaf.clone());
            was_childless && pi.object.is_some()
        };
        if pin {
            if let Some(obj) = dst_par.inner.lock().object.clone() {
                obj.hold();
            }
        }

        debug!(
            name = %String::from_utf8_lossy(&new_name),
            "rename relinked entry under new parent"
        );
        unlock_all(&mut locked);
        Ok(())
    }

    // -----------------------------------------------------------------
    // Unlink / zap
    // -----------------------------------------------------------------

    /// Logical deletion: unresolve, mark DESTROYED, bump the generation
    /// so fresh lookups under the same (parent, name) allocate anew, and
    /// hint the object layer that the backing object may be reclaimable.
    /// Requires the entry exclusively locked. The entry stays linked
    /// until its last reference drops.
    pub fn unlink(&self, entry: &EntryRef) {
        assert!(
            entry.lock.held_exclusively_by_current(),
            "unlink requires the entry exclusively locked"
        );
        self.unlink_locked(entry);
    }

    fn unlink_locked(&self, entry: &EntryRef) {
        if entry.is_root() || entry.is_destroyed() {
            return;
        }
        let object = entry.object();
        self.unresolve_inner(entry);
        entry.flag_set(F_DESTROYED);
        entry.generation.fetch_add(1, Ordering::AcqRel);
        if let Some(obj) = object {
            obj.finalize_hint();
        }
    }

    /// Physical disposal. The entry must already be UNRESOLVED and the
    /// caller must own one logical reference, which is consumed whether
    /// or not the zap succeeds. With `blocking_parent` the parent lock
    /// is acquired blocking (deferred-zap escalation); otherwise a
    /// contended parent defers the zap to the maintenance sweep.
    ///
    /// Expected refs at disposal: exactly the caller's plus, if linked,
    /// the structural one. Any other holder aborts the zap.
    pub(crate) fn try_zap(&self, entry: &EntryRef, blocking_parent: bool) -> bool {
        debug_assert!(entry.is_unresolved(), "zap before unresolve");
        if entry.is_root() {
            self.drop_only(entry);
            return false;
        }

        let (parent, bucket) = {
            let inner = entry.inner.lock();
            (inner.parent.clone(), inner.bucket)
        };
        let (parent, bucket) = match (parent, bucket) {
            (Some(p), Some(b)) => (p, b),
            (None, None) => {
                // Unlinked: only the caller's reference may remain.
                if entry
                    .refs
                    .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    self.drop_only(entry);
                    return false;
                }
                entry.flag_set(F_DESTROYED);
                self.num_entries.fetch_sub(1, Ordering::Relaxed);
                bump!(self.stats.zaps);
                return true;
            }
            _ => {
                // Partially linked state mid-transition; leave it alone.
                self.drop_only(entry);
                return false;
            }
        };

        // Child-before-parent: we stand for the child, so the parent is
        // taken non-blocking unless this is the sweep's escalation.
        let reentrant = parent.lock.held_exclusively_by_current();
        let acquired = if reentrant {
            false
        } else if blocking_parent {
            parent.lock.lock_exclusive(self.config.lock_warn_threshold);
            true
        } else if parent.lock.try_lock_exclusive() {
            true
        } else {
            entry.flag_set(F_DEFERRED_ZAP);
            bump!(self.stats.deferred_zaps);
            // The deferred list takes over the caller's reference.
            self.deferred.lock().push(entry.clone());
            return false;
        };

        let release_parent = |acquired: bool| {
            if acquired {
                parent.lock.unlock_exclusive();
            }
        };

        // Re-validate linkage under the parent lock.
        let still_linked = {
            let inner = entry.inner.lock();
            inner
                .parent
                .as_ref()
                .is_some_and(|p| Arc::ptr_eq(p, &parent))
                && inner.bucket == Some(bucket)
        };
        if !still_linked || entry.has_children() {
            release_parent(acquired);
            entry.flag_clear(F_DEFERRED_ZAP);
            self.drop_only(entry);
            return false;
        }

        // The 2 -> 0 transition is decided under the bucket lock. A
        // bucket scan cannot hold the entry while we stand here, and a
        // stale-reference try_hold either lands first (the CAS then
        // fails and the zap aborts) or observes zero and fails itself.
        let removed = self.table.remove_if(bucket, entry, || {
            entry
                .refs
                .compare_exchange(2, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        });
        if !removed {
            release_parent(acquired);
            entry.flag_clear(F_DEFERRED_ZAP);
            self.drop_only(entry);
            return false;
        }

        let unpin = {
            let mut pi = parent.inner.lock();
            let had = !pi.children.is_empty();
            pi.children.retain(|c| !Arc::ptr_eq(c, entry));
            had && pi.children.is_empty() && pi.object.is_some()
        };
        if unpin {
            if let Some(obj) = parent.inner.lock().object.clone() {
                obj.release();
            }
        }
        release_parent(acquired);

        entry.inner.lock().parent = None;
        entry.flag_set(F_DESTROYED);
        entry.flag_clear(F_DEFERRED_ZAP);
        entry.generation.fetch_add(1, Ordering::AcqRel);
        self.num_entries.fetch_sub(1, Ordering::Relaxed);
        bump!(self.stats.zaps);
        true
    }

    // -----------------------------------------------------------------
    // Mount crossings
    // -----------------------------------------------------------------

    pub fn mount_cache(&self) -> &MountCrossCache {
        &self.mount_cache
    }

    /// Flag transitions for mount-point entries. Requires the entry
    /// exclusively locked.
    pub fn set_mountpoint(&self, entry: &EntryRef, is_mountpoint: bool) {
        assert!(
            entry.lock.held_exclusively_by_current(),
            "set_mountpoint requires the entry exclusively locked"
        );
        if is_mountpoint {
            entry.flag_set(F_IS_MOUNTPOINT);
        } else {
            entry.flag_clear(F_IS_MOUNTPOINT);
        }
    }

    /// Find the mount stacked on top of a mount-point entry, consulting
    /// the crossing cache before falling back to a full table scan.
    pub fn cross_mount(
        &self,
        mount: MountId,
        entry: &EntryRef,
        table: &dyn MountTable,
    ) -> Option<MountId> {
        if let Some(cached) = self.mount_cache.lookup(mount, entry, &self.stats) {
            return cached;
        }
        let result = table.covering_mount(mount, entry.id());
        self.mount_cache.insert(mount, entry, result);
        result
    }

    /// Mount-table notification: a mount was attached. Scrubs the
    /// crossing cache and invalidates cached negatives namespace-wide,
    /// since names absent before the attach may now exist.
    pub fn on_mount_attach(&self, mount: MountId) {
        self.ns_generation.fetch_add(1, Ordering::AcqRel);
        self.mount_cache.scrub(mount);
    }

    /// Mount-table notification: a mount was detached.
    pub fn on_mount_detach(&self, mount: MountId) {
        self.ns_generation.fetch_add(1, Ordering::AcqRel);
        self.mount_cache.scrub(mount);
    }
}

impl std::fmt::Debug for NameCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NameCache")
            .field("entries", &self.num_entries.load(Ordering::Relaxed))
            .field("positive", &self.num_positive.load(Ordering::Relaxed))
            .field("negative", &self.num_negative.load(Ordering::Relaxed))
            .finish()
    }
}
