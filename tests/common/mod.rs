//! Shared test fixtures: an in-memory resolver over a scripted namespace
//! and a mock backing-object layer with observable hold counts.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ncache::{
    BackendError, BackingObject, CacheConfig, Credentials, EntryRef, NameCache, ObjectKind,
    Resolution, ResolveOutcome, Resolver,
};

/// Root object id used by [`new_cache`].
pub const ROOT_OBJECT_ID: u64 = 1;

/// Install a test tracing subscriber once. Honors `RUST_LOG`.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub struct MockObject {
    id: u64,
    kind: ObjectKind,
    alive: AtomicBool,
    holds: AtomicI64,
    finalize_hints: AtomicU64,
}

impl MockObject {
    pub fn new(id: u64, kind: ObjectKind) -> Arc<MockObject> {
        Arc::new(MockObject {
            id,
            kind,
            alive: AtomicBool::new(true),
            holds: AtomicI64::new(0),
            finalize_hints: AtomicU64::new(0),
        })
    }

    pub fn holds(&self) -> i64 {
        self.holds.load(Ordering::SeqCst)
    }

    pub fn finalize_hints(&self) -> u64 {
        self.finalize_hints.load(Ordering::SeqCst)
    }

    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

impl BackingObject for MockObject {
    fn id(&self) -> u64 {
        self.id
    }

    fn kind(&self) -> ObjectKind {
        self.kind
    }

    fn hold(&self) {
        self.holds.fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self) {
        let prev = self.holds.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "release without matching hold on object {}", self.id);
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn finalize_hint(&self) {
        self.finalize_hints.fetch_add(1, Ordering::SeqCst);
    }
}

enum Scripted {
    Found(Arc<MockObject>, Option<Duration>),
    Absent { whiteout: bool },
    Fail(BackendError),
}

/// Resolver over a scripted map keyed by (parent object id, name). Names
/// not in the script resolve as plain absent, or as fresh directories
/// when `auto_directories` is set (for building deep trees).
pub struct MockResolver {
    script: Mutex<HashMap<(u64, Vec<u8>), Scripted>>,
    calls: AtomicU64,
    next_auto_id: AtomicU64,
    auto_directories: AtomicBool,
}

impl MockResolver {
    pub fn new() -> Arc<MockResolver> {
        Arc::new(MockResolver {
            script: Mutex::new(HashMap::new()),
            calls: AtomicU64::new(0),
            next_auto_id: AtomicU64::new(1_000_000),
            auto_directories: AtomicBool::new(false),
        })
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_auto_directories(&self, on: bool) {
        self.auto_directories.store(on, Ordering::SeqCst);
    }

    pub fn add_object(
        &self,
        parent_id: u64,
        name: &str,
        id: u64,
        kind: ObjectKind,
    ) -> Arc<MockObject> {
        let obj = MockObject::new(id, kind);
        self.script.lock().unwrap().insert(
            (parent_id, name.as_bytes().to_vec()),
            Scripted::Found(obj.clone(), None),
        );
        obj
    }

    pub fn add_file(&self, parent_id: u64, name: &str, id: u64) -> Arc<MockObject> {
        self.add_object(parent_id, name, id, ObjectKind::File)
    }

    pub fn add_dir(&self, parent_id: u64, name: &str, id: u64) -> Arc<MockObject> {
        self.add_object(parent_id, name, id, ObjectKind::Directory)
    }

    pub fn add_file_with_ttl(
        &self,
        parent_id: u64,
        name: &str,
        id: u64,
        ttl: Duration,
    ) -> Arc<MockObject> {
        let obj = MockObject::new(id, ObjectKind::File);
        self.script.lock().unwrap().insert(
            (parent_id, name.as_bytes().to_vec()),
            Scripted::Found(obj.clone(), Some(ttl)),
        );
        obj
    }

    pub fn set_whiteout(&self, parent_id: u64, name: &str) {
        self.script.lock().unwrap().insert(
            (parent_id, name.as_bytes().to_vec()),
            Scripted::Absent { whiteout: true },
        );
    }

    pub fn set_fail(&self, parent_id: u64, name: &str, errno: i32) {
        self.script.lock().unwrap().insert(
            (parent_id, name.as_bytes().to_vec()),
            Scripted::Fail(BackendError::new(errno, "scripted failure")),
        );
    }

    pub fn remove(&self, parent_id: u64, name: &str) {
        self.script
            .lock()
            .unwrap()
            .remove(&(parent_id, name.as_bytes().to_vec()));
    }
}

impl Resolver for MockResolver {
    fn resolve(
        &self,
        name: &[u8],
        parent: Option<&Arc<dyn BackingObject>>,
        _cred: &Credentials,
    ) -> ResolveOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let parent_id = parent.map(|p| p.id()).unwrap_or(0);
        let script = self.script.lock().unwrap();
        match script.get(&(parent_id, name.to_vec())) {
            Some(Scripted::Found(obj, ttl)) => ResolveOutcome::Found {
                object: obj.clone() as Arc<dyn BackingObject>,
                ttl: *ttl,
            },
            Some(Scripted::Absent { whiteout }) => ResolveOutcome::Absent {
                whiteout: *whiteout,
            },
            Some(Scripted::Fail(err)) => ResolveOutcome::Fail(err.clone()),
            None => {
                if self.auto_directories.load(Ordering::SeqCst) {
                    let id = self.next_auto_id.fetch_add(1, Ordering::SeqCst);
                    ResolveOutcome::Found {
                        object: MockObject::new(id, ObjectKind::Directory)
                            as Arc<dyn BackingObject>,
                        ttl: None,
                    }
                } else {
                    ResolveOutcome::Absent { whiteout: false }
                }
            }
        }
    }
}

/// A cache over a fresh mock resolver, with the root already associated
/// with a directory object of id [`ROOT_OBJECT_ID`].
pub fn new_cache(config: CacheConfig) -> (Arc<NameCache>, Arc<MockResolver>, Arc<MockObject>) {
    let resolver = MockResolver::new();
    let cache = NameCache::new(config, resolver.clone());
    let root_obj = MockObject::new(ROOT_OBJECT_ID, ObjectKind::Directory);
    cache.set_root_object(Some(root_obj.clone() as Arc<dyn BackingObject>));
    (cache, resolver, root_obj)
}

pub fn default_cache() -> (Arc<NameCache>, Arc<MockResolver>, Arc<MockObject>) {
    new_cache(CacheConfig::default())
}

/// Lookup and resolve `name` under `parent`, returning the held entry
/// unlocked. Panics on resolver failure.
pub fn resolve_child(cache: &NameCache, parent: &EntryRef, name: &str) -> (EntryRef, Resolution) {
    cache.lock(parent);
    let entry = cache
        .lookup_or_create(parent, name.as_bytes())
        .expect("lookup_or_create");
    let resolution = cache.resolve(&entry, &Credentials::ROOT).expect("resolve");
    cache.unlock(&entry);
    cache.unlock(parent);
    (entry, resolution)
}

/// Lookup without resolving; the entry comes back unlocked and held.
pub fn lookup_child(cache: &NameCache, parent: &EntryRef, name: &str) -> EntryRef {
    cache.lock(parent);
    let entry = cache
        .lookup_or_create(parent, name.as_bytes())
        .expect("lookup_or_create");
    cache.unlock(&entry);
    cache.unlock(parent);
    entry
}
