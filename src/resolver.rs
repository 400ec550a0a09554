//! Boundary traits for the external collaborators: the filesystem backend
//! that performs real name lookups, and the backing-object layer whose
//! reference counts the cache pins and releases.

use std::sync::Arc;
use std::time::Duration;

use crate::error::BackendError;

/// Credentials forwarded to the backend on every real lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
}

impl Credentials {
    pub const ROOT: Credentials = Credentials { uid: 0, gid: 0 };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    File,
    Directory,
    Symlink,
    Other,
}

/// A live filesystem object (inode analogue) an entry can resolve to.
///
/// `hold`/`release` are the object layer's own reference counting and are
/// distinct from entry reference counts: the cache takes one hold for the
/// association itself and a second pin while the entry has children, so a
/// populated subtree cannot have its directory object reclaimed underneath
/// it.
pub trait BackingObject: Send + Sync {
    /// Stable identity, unique among live objects.
    fn id(&self) -> u64;

    fn kind(&self) -> ObjectKind;

    fn hold(&self);

    fn release(&self);

    /// False once the object layer has begun reclaiming the object. A dead
    /// object found under a cache lock forces the entry back to UNRESOLVED.
    fn is_alive(&self) -> bool;

    /// Advisory: the cache believes nothing references this object anymore
    /// and the object layer may reclaim it promptly.
    fn finalize_hint(&self);
}

/// Outcome of a real backend lookup.
pub enum ResolveOutcome {
    /// The name exists and resolves to `object`. A `ttl` makes the cached
    /// result expire (networked backends); `None` caches it until
    /// invalidated.
    Found {
        object: Arc<dyn BackingObject>,
        ttl: Option<Duration>,
    },
    /// The name definitively does not exist. `whiteout` marks a whited-out
    /// directory entry rather than a plain miss.
    Absent { whiteout: bool },
    /// The lookup failed; the error is cached on the entry and the entry
    /// stays unresolved.
    Fail(BackendError),
}

/// The external lookup boundary. Implementations may block (real I/O) and
/// must be re-entrant: the cache can invoke it from many threads at once
/// for different entries.
pub trait Resolver: Send + Sync {
    fn resolve(
        &self,
        name: &[u8],
        parent: Option<&Arc<dyn BackingObject>>,
        cred: &Credentials,
    ) -> ResolveOutcome;
}
