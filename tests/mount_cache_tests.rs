//! The mount-crossing cache: hit/miss behavior, cached "no mount here"
//! answers, scrubbing on attach/detach, and generation staleness.

mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use ncache::{MountId, MountTable};

use common::{default_cache, resolve_child, ROOT_OBJECT_ID};

/// Scripted mount table counting how often the slow path runs.
#[derive(Default)]
struct MockMountTable {
    covers: Mutex<HashMap<(u64, u64), MountId>>,
    scans: AtomicU64,
}

impl MockMountTable {
    fn set_cover(&self, at: MountId, entry_id: u64, covering: MountId) {
        self.covers.lock().unwrap().insert((at.0, entry_id), covering);
    }

    fn clear_cover(&self, at: MountId, entry_id: u64) {
        self.covers.lock().unwrap().remove(&(at.0, entry_id));
    }

    fn scans(&self) -> u64 {
        self.scans.load(Ordering::SeqCst)
    }
}

impl MountTable for MockMountTable {
    fn covering_mount(&self, at: MountId, entry_id: u64) -> Option<MountId> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        self.covers.lock().unwrap().get(&(at.0, entry_id)).copied()
    }
}

#[test]
fn crossing_is_cached_after_first_scan() {
    let (cache, resolver, _root_obj) = default_cache();
    resolver.add_dir(ROOT_OBJECT_ID, "mnt", 10);
    let root = cache.root();
    let (mnt, _) = resolve_child(&cache, &root, "mnt");

    let table = MockMountTable::default();
    let lower = MountId(1);
    let upper = MountId(2);
    table.set_cover(lower, mnt.id(), upper);

    assert_eq!(cache.cross_mount(lower, &mnt, &table), Some(upper));
    assert_eq!(table.scans(), 1);

    assert_eq!(cache.cross_mount(lower, &mnt, &table), Some(upper));
    assert_eq!(table.scans(), 1, "second crossing must be a cache hit");
    assert!(cache.stats().mount_hits >= 1);

    cache.drop_ref(&mnt);
    cache.drop_ref(&root);
}

#[test]
fn absence_of_a_covering_mount_is_cached_too() {
    let (cache, resolver, _root_obj) = default_cache();
    resolver.add_dir(ROOT_OBJECT_ID, "plain", 20);
    let root = cache.root();
    let (plain, _) = resolve_child(&cache, &root, "plain");

    let table = MockMountTable::default();
    let mount = MountId(1);

    assert_eq!(cache.cross_mount(mount, &plain, &table), None);
    assert_eq!(table.scans(), 1);
    assert_eq!(cache.cross_mount(mount, &plain, &table), None);
    assert_eq!(table.scans(), 1, "cached negative crossing must not rescan");

    cache.drop_ref(&plain);
    cache.drop_ref(&root);
}

#[test]
fn detach_scrubs_cached_crossings() {
    let (cache, resolver, _root_obj) = default_cache();
    resolver.add_dir(ROOT_OBJECT_ID, "mnt", 30);
    let root = cache.root();
    let (mnt, _) = resolve_child(&cache, &root, "mnt");

    let table = MockMountTable::default();
    let lower = MountId(1);
    let upper = MountId(2);
    table.set_cover(lower, mnt.id(), upper);

    assert_eq!(cache.cross_mount(lower, &mnt, &table), Some(upper));
    table.clear_cover(lower, mnt.id());
    cache.on_mount_detach(upper);

    assert_eq!(cache.cross_mount(lower, &mnt, &table), None);
    assert_eq!(table.scans(), 2, "detach must force a rescan");

    cache.drop_ref(&mnt);
    cache.drop_ref(&root);
}

#[test]
fn stale_generation_misses() {
    let (cache, resolver, _root_obj) = default_cache();
    resolver.add_dir(ROOT_OBJECT_ID, "mnt", 40);
    let root = cache.root();
    let (mnt, _) = resolve_child(&cache, &root, "mnt");

    let table = MockMountTable::default();
    let lower = MountId(1);
    table.set_cover(lower, mnt.id(), MountId(2));
    assert_eq!(cache.cross_mount(lower, &mnt, &table), Some(MountId(2)));

    // Unlinking bumps the entry generation, so the cached crossing for
    // the old identity must not be served.
    cache.lock(&mnt);
    cache.unlink(&mnt);
    cache.unlock(&mnt);

    assert_eq!(cache.cross_mount(lower, &mnt, &table), Some(MountId(2)));
    assert_eq!(table.scans(), 2);

    cache.drop_ref(&mnt);
    cache.drop_ref(&root);
}

#[test]
fn mountpoint_flag_round_trips() {
    let (cache, resolver, _root_obj) = default_cache();
    resolver.add_dir(ROOT_OBJECT_ID, "mnt", 50);
    let root = cache.root();
    let (mnt, _) = resolve_child(&cache, &root, "mnt");

    assert!(!mnt.is_mountpoint());
    cache.lock(&mnt);
    cache.set_mountpoint(&mnt, true);
    cache.unlock(&mnt);
    assert!(mnt.is_mountpoint());

    cache.lock(&mnt);
    cache.set_mountpoint(&mnt, false);
    cache.unlock(&mnt);
    assert!(!mnt.is_mountpoint());

    cache.drop_ref(&mnt);
    cache.drop_ref(&root);
}
