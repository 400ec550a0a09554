//! ncache: a concurrent, in-memory path-resolution cache.
//!
//! The cache maps (parent directory, component name) pairs to entries
//! that remember either the backing object a name resolves to (positive)
//! or the confirmed absence of the name (negative). Entries form a tree
//! mirroring the portion of the namespace that has been looked up, carry
//! their own reader/writer locks so resolution can double as a
//! serialization point for namespace operations, and are disposed of by
//! per-pool eviction with hysteresis once capacity limits are crossed.
//!
//! The backend is abstracted behind [`Resolver`]; the cache never does
//! I/O of its own.

pub mod cache;
pub mod config;
pub mod error;
pub mod mount;
pub mod resolver;
pub mod stats;

pub use cache::entry::{Entry, EntryRef};
pub use cache::{InvalFlags, NameCache, Resolution};
pub use config::CacheConfig;
pub use error::{BackendError, CacheError, Result};
pub use mount::{MountCrossCache, MountId, MountTable};
pub use resolver::{BackingObject, Credentials, ObjectKind, ResolveOutcome, Resolver};
pub use stats::StatsSnapshot;
