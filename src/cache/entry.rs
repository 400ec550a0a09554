use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::cache::lock::EntryLock;
use crate::error::BackendError;
use crate::resolver::BackingObject;

/// Resolution state is unknown; the backing object field is meaningless.
pub const F_UNRESOLVED: u32 = 1 << 0;
/// Logically deleted; still linked until the last reference drops.
pub const F_DESTROYED: u32 = 1 << 1;
pub const F_IS_DIRECTORY: u32 = 1 << 2;
pub const F_IS_SYMLINK: u32 = 1 << 3;
pub const F_IS_MOUNTPOINT: u32 = 1 << 4;
/// Negative entry backed by a whited-out directory entry.
pub const F_WHITEOUT: u32 = 1 << 5;
/// Zap could not take the parent lock; the maintenance sweep retries.
pub const F_DEFERRED_ZAP: u32 = 1 << 6;
/// Permanent namespace root; never zapped.
pub const F_ROOT: u32 = 1 << 7;

/// A referenced cache entry. All public cache operations take these.
pub type EntryRef = Arc<Entry>;

/// Fields only mutated while the entry is exclusively locked (or during
/// final destruction, when no other holder can exist). The short inner
/// mutex makes individual reads coherent; the entry lock serializes the
/// protocol-level transitions.
pub(crate) struct EntryInner {
    pub name: Vec<u8>,
    pub parent: Option<EntryRef>,
    pub children: Vec<EntryRef>,
    pub object: Option<Arc<dyn BackingObject>>,
    /// Which negative shard list holds this entry, when negative.
    pub neg_shard: Option<usize>,
    /// Bucket index while linked into the hash table.
    pub bucket: Option<usize>,
    /// TTL expiry for backend-imposed resolution lifetimes.
    pub expires_at: Option<DateTime<Utc>>,
    /// Namespace generation recorded when a negative result was cached.
    pub ns_generation: u64,
    /// Last resolver failure, replayed until the next resolve attempt.
    pub last_error: Option<BackendError>,
    /// Failed non-blocking zap attempts since the entry was deferred.
    pub deferred_attempts: u32,
}

pub struct Entry {
    /// Stable identity used for hashing (children hash over the parent's
    /// id) and for the mount-crossing cache key.
    pub(crate) id: u64,
    /// Logical reference count. Exactly one reference belongs to the
    /// hash-table/parent linkage while the entry is linked; the rest are
    /// caller holds. The 1->0 transition is the unique destruction
    /// trigger.
    pub(crate) refs: AtomicI32,
    pub(crate) flags: AtomicU32,
    /// Bumped on destructive structural change so stale cached lookups
    /// (mount cache, resurrected slots) can be detected.
    pub(crate) generation: AtomicU64,
    pub(crate) lock: EntryLock,
    pub(crate) inner: Mutex<EntryInner>,
}

impl Entry {
    pub(crate) fn new(id: u64, name: Vec<u8>, parent: Option<EntryRef>, flags: u32) -> Entry {
        Entry {
            id,
            refs: AtomicI32::new(1),
            flags: AtomicU32::new(flags | F_UNRESOLVED),
            generation: AtomicU64::new(0),
            lock: EntryLock::new(),
            inner: Mutex::new(EntryInner {
                name,
                parent,
                children: Vec::new(),
                object: None,
                neg_shard: None,
                bucket: None,
                expires_at: None,
                ns_generation: 0,
                last_error: None,
                deferred_attempts: 0,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> Vec<u8> {
        self.inner.lock().name.clone()
    }

    pub fn parent(&self) -> Option<EntryRef> {
        self.inner.lock().parent.clone()
    }

    pub fn refs(&self) -> i32 {
        self.refs.load(Ordering::Acquire)
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn flag_set(&self, flag: u32) {
        self.flags.fetch_or(flag, Ordering::AcqRel);
    }

    pub(crate) fn flag_clear(&self, flag: u32) {
        self.flags.fetch_and(!flag, Ordering::AcqRel);
    }

    pub(crate) fn has_flag(&self, flag: u32) -> bool {
        self.flags.load(Ordering::Acquire) & flag != 0
    }

    pub fn is_unresolved(&self) -> bool {
        self.has_flag(F_UNRESOLVED)
    }

    pub fn is_destroyed(&self) -> bool {
        self.has_flag(F_DESTROYED)
    }

    pub fn is_directory(&self) -> bool {
        self.has_flag(F_IS_DIRECTORY)
    }

    pub fn is_symlink(&self) -> bool {
        self.has_flag(F_IS_SYMLINK)
    }

    pub fn is_mountpoint(&self) -> bool {
        self.has_flag(F_IS_MOUNTPOINT)
    }

    pub fn is_whiteout(&self) -> bool {
        self.has_flag(F_WHITEOUT)
    }

    pub fn is_root(&self) -> bool {
        self.has_flag(F_ROOT)
    }

    /// Resolved to a live filesystem object.
    pub fn is_positive(&self) -> bool {
        !self.is_unresolved() && self.inner.lock().object.is_some()
    }

    /// Resolved to confirmed absence.
    pub fn is_negative(&self) -> bool {
        !self.is_unresolved() && self.inner.lock().object.is_none()
    }

    pub fn has_children(&self) -> bool {
        !self.inner.lock().children.is_empty()
    }

    /// The backing object, if positively resolved.
    pub fn object(&self) -> Option<Arc<dyn BackingObject>> {
        if self.is_unresolved() {
            return None;
        }
        self.inner.lock().object.clone()
    }

    /// The cached resolver failure, if the last resolve attempt failed.
    pub fn last_error(&self) -> Option<BackendError> {
        self.inner.lock().last_error.clone()
    }

    /// True if the entry matches (parent, name) and is still live.
    /// Callers scanning a bucket re-check this after any unlocked window.
    pub(crate) fn matches(&self, parent: &EntryRef, name: &[u8]) -> bool {
        if self.is_destroyed() {
            return false;
        }
        let inner = self.inner.lock();
        inner.name == name
            && inner
                .parent
                .as_ref()
                .is_some_and(|p| Arc::ptr_eq(p, parent))
    }
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("id", &self.id)
            .field("name", &String::from_utf8_lossy(&self.inner.lock().name))
            .field("refs", &self.refs())
            .field("flags", &self.flags.load(Ordering::Relaxed))
            .finish()
    }
}
