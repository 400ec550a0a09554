//! The per-entry resolution lock.
//!
//! This wraps a raw rwlock with the extra bookkeeping the cache protocol
//! needs: exclusive re-entry by the owning thread, a pending-exclusive
//! count so the shared fast path can yield to writers, and a diagnostic
//! when a blocking acquisition stalls past the configured threshold.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::lock_api::{RawRwLock as RawRwLockApi, RawRwLockTimed};
use parking_lot::RawRwLock;
use tracing::warn;

static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TOKEN: u64 = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
}

/// Process-unique token for the current thread. Never zero.
pub(crate) fn current_thread_token() -> u64 {
    THREAD_TOKEN.with(|t| *t)
}

pub struct EntryLock {
    raw: RawRwLock,
    /// Thread token of the exclusive owner, 0 when not exclusively held.
    owner: AtomicU64,
    /// Exclusive recursion depth of the owner thread.
    recursion: AtomicU32,
    /// Threads currently blocked waiting for the exclusive lock.
    pending_exclusive: AtomicU32,
}

impl Default for EntryLock {
    fn default() -> Self {
        Self::new()
    }
}

impl EntryLock {
    pub fn new() -> Self {
        Self {
            raw: RawRwLockApi::INIT,
            owner: AtomicU64::new(0),
            recursion: AtomicU32::new(0),
            pending_exclusive: AtomicU32::new(0),
        }
    }

    /// Blocking exclusive acquire. Re-entrant for the owning thread. Logs
    /// a diagnostic if blocked past `warn_after` but never gives up.
    pub fn lock_exclusive(&self, warn_after: Duration) {
        let me = current_thread_token();
        if self.owner.load(Ordering::Acquire) == me {
            self.recursion.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.pending_exclusive.fetch_add(1, Ordering::AcqRel);
        if !self.raw.try_lock_exclusive_for(warn_after) {
            warn!(
                wait_secs = warn_after.as_secs_f64(),
                "entry lock acquisition stalled; still waiting"
            );
            self.raw.lock_exclusive();
        }
        self.pending_exclusive.fetch_sub(1, Ordering::AcqRel);
        self.owner.store(me, Ordering::Release);
        self.recursion.store(1, Ordering::Relaxed);
    }

    /// Non-blocking exclusive acquire. Refuses re-entry by the owning
    /// thread: a recursive attempt here indicates the caller is already
    /// operating on the entry and must not treat it as freshly acquired.
    pub fn try_lock_exclusive(&self) -> bool {
        let me = current_thread_token();
        if self.owner.load(Ordering::Acquire) == me {
            return false;
        }
        if !self.raw.try_lock_exclusive() {
            return false;
        }
        self.owner.store(me, Ordering::Release);
        self.recursion.store(1, Ordering::Relaxed);
        true
    }

    pub fn unlock_exclusive(&self) {
        let me = current_thread_token();
        assert_eq!(
            self.owner.load(Ordering::Acquire),
            me,
            "entry lock: exclusive unlock by non-owner thread"
        );
        if self.recursion.fetch_sub(1, Ordering::Relaxed) > 1 {
            return;
        }
        self.owner.store(0, Ordering::Release);
        // SAFETY: this thread holds the exclusive lock (owner check above).
        unsafe { self.raw.unlock_exclusive() };
    }

    /// Blocking shared acquire. Must not be called while this thread holds
    /// the lock exclusively.
    pub fn lock_shared(&self) {
        assert_ne!(
            self.owner.load(Ordering::Acquire),
            current_thread_token(),
            "entry lock: shared acquire while holding exclusive"
        );
        self.raw.lock_shared();
    }

    /// Shared fast path: acquires only when no exclusive request is
    /// pending and the lock is immediately available.
    pub fn try_lock_shared(&self) -> bool {
        if self.pending_exclusive.load(Ordering::Acquire) != 0 {
            return false;
        }
        self.raw.try_lock_shared()
    }

    pub fn unlock_shared(&self) {
        // SAFETY: callers pair this with a successful shared acquire.
        unsafe { self.raw.unlock_shared() };
    }

    /// True when the calling thread is the exclusive owner.
    pub fn held_exclusively_by_current(&self) -> bool {
        self.owner.load(Ordering::Acquire) == current_thread_token()
    }

    #[cfg(test)]
    pub(crate) fn has_pending_exclusive(&self) -> bool {
        self.pending_exclusive.load(Ordering::Acquire) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn exclusive_is_reentrant() {
        let lock = EntryLock::new();
        lock.lock_exclusive(Duration::from_secs(1));
        lock.lock_exclusive(Duration::from_secs(1));
        assert!(lock.held_exclusively_by_current());
        lock.unlock_exclusive();
        assert!(lock.held_exclusively_by_current());
        lock.unlock_exclusive();
        assert!(!lock.held_exclusively_by_current());
    }

    #[test]
    fn try_exclusive_refuses_reentry() {
        let lock = EntryLock::new();
        lock.lock_exclusive(Duration::from_secs(1));
        assert!(!lock.try_lock_exclusive());
        lock.unlock_exclusive();
        assert!(lock.try_lock_exclusive());
        lock.unlock_exclusive();
    }

    #[test]
    fn shared_yields_to_pending_exclusive() {
        let lock = Arc::new(EntryLock::new());
        lock.lock_shared();

        let contender = lock.clone();
        let t = std::thread::spawn(move || {
            contender.lock_exclusive(Duration::from_millis(50));
            contender.unlock_exclusive();
        });

        // Wait until the writer is queued, then the shared fast path must
        // refuse new readers.
        while !lock.has_pending_exclusive() {
            std::thread::yield_now();
        }
        assert!(!lock.try_lock_shared());

        lock.unlock_shared();
        t.join().unwrap();
        assert!(lock.try_lock_shared());
        lock.unlock_shared();
    }
}
