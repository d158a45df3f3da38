//! # Crash Recovery Scenarios
//!
//! Simulated crashes: storages dropped without flushing, atomic units left
//! open, and the log truncated at arbitrary byte positions. Reopening must
//! always land on the state of the last complete atomic unit.

use std::sync::Arc;

use bonsai::{BonsaiTree, BucketPointer, Int64Serializer, PaginatedStorage, Utf8Serializer};
use tempfile::tempdir;

type IntTree = BonsaiTree<Int64Serializer, Utf8Serializer>;

fn create_tree(storage: &Arc<PaginatedStorage>, name: &str) -> IntTree {
    IntTree::create(name, -1, Int64Serializer, Utf8Serializer, storage.clone()).unwrap()
}

fn load_tree(storage: &Arc<PaginatedStorage>, name: &str, root: BucketPointer) -> IntTree {
    IntTree::load(name, root, Int64Serializer, Utf8Serializer, storage.clone()).unwrap()
}

#[test]
fn committed_puts_survive_a_crash_without_flush() {
    let dir = tempdir().unwrap();
    let root;
    {
        let storage = PaginatedStorage::create(dir.path()).unwrap();
        let tree = create_tree(&storage, "links");
        for k in 0..100i64 {
            tree.put(k, format!("v{k}")).unwrap();
        }
        root = tree.get_root_bucket_pointer();
        // Crash: no flush, no close.
    }

    let storage = PaginatedStorage::open(dir.path()).unwrap();
    let tree = load_tree(&storage, "links", root);

    assert_eq!(tree.size().unwrap(), 100);
    for k in 0..100i64 {
        assert_eq!(tree.get(&k).unwrap(), Some(format!("v{k}")));
    }
}

#[test]
fn open_atomic_unit_rolls_back_on_recovery() {
    let dir = tempdir().unwrap();
    let root;
    {
        let storage = PaginatedStorage::create(dir.path()).unwrap();
        let tree = create_tree(&storage, "links");
        for k in 0..20i64 {
            tree.put(k, format!("committed{k}")).unwrap();
        }
        root = tree.get_root_bucket_pointer();

        // An outer unit that never ends: the ten puts below join it.
        storage.atomic_operations().start_atomic_operation().unwrap();
        for k in 100..110i64 {
            tree.put(k, format!("torn{k}")).unwrap();
        }
        // Worst case: the torn unit's pages reach the data file.
        storage.cache().flush_buffer().unwrap();
        // Crash before the unit's end record.
    }

    let storage = PaginatedStorage::open(dir.path()).unwrap();
    let tree = load_tree(&storage, "links", root);

    assert_eq!(tree.size().unwrap(), 20);
    for k in 0..20i64 {
        assert_eq!(tree.get(&k).unwrap(), Some(format!("committed{k}")));
    }
    for k in 100..110i64 {
        assert_eq!(tree.get(&k).unwrap(), None, "torn put {k} leaked");
    }
}

#[test]
fn explicitly_rolled_back_unit_is_reverted() {
    let dir = tempdir().unwrap();
    let root;
    {
        let storage = PaginatedStorage::create(dir.path()).unwrap();
        let tree = create_tree(&storage, "links");
        tree.put(1, "keep".into()).unwrap();
        root = tree.get_root_bucket_pointer();

        storage.atomic_operations().start_atomic_operation().unwrap();
        tree.put(2, "discard".into()).unwrap();
        storage
            .atomic_operations()
            .end_atomic_operation(true)
            .unwrap();
        storage.cache().flush_buffer().unwrap();
    }

    let storage = PaginatedStorage::open(dir.path()).unwrap();
    let tree = load_tree(&storage, "links", root);

    assert_eq!(tree.get(&1).unwrap(), Some("keep".into()));
    assert_eq!(tree.get(&2).unwrap(), None);
    assert_eq!(tree.size().unwrap(), 1);
}

#[test]
fn recovery_handles_splits_inside_units() {
    let dir = tempdir().unwrap();
    let root;
    let fat = "f".repeat(2000);
    {
        let storage = PaginatedStorage::create(dir.path()).unwrap();
        let tree = create_tree(&storage, "links");
        // Each put is its own unit; several of them split pages.
        for k in 0..50i64 {
            tree.put(k, format!("{k}:{fat}")).unwrap();
        }
        root = tree.get_root_bucket_pointer();
    }

    let storage = PaginatedStorage::open(dir.path()).unwrap();
    let tree = load_tree(&storage, "links", root);

    assert_eq!(tree.size().unwrap(), 50);
    assert_eq!(tree.get_root_bucket_pointer(), root);
    for k in 0..50i64 {
        let value = tree.get(&k).unwrap().unwrap();
        assert!(value.starts_with(&format!("{k}:")));
    }

    // The recovered tree must keep working as a writable structure.
    tree.put(50, format!("50:{fat}")).unwrap();
    assert_eq!(tree.size().unwrap(), 51);
}

#[test]
fn log_truncation_yields_a_prefix_of_complete_units() {
    let dir = tempdir().unwrap();
    let root;
    {
        let storage = PaginatedStorage::create(dir.path()).unwrap();
        let tree = create_tree(&storage, "links");
        for k in 1..=40i64 {
            tree.put(k, format!("v{k}")).unwrap();
        }
        root = tree.get_root_bucket_pointer();
        // Crash without flush: the log is the only persistent state.
    }

    let wal_path = dir.path().join("bonsai.wal");
    let full_log = std::fs::read(&wal_path).unwrap();

    // Chop the tail at arbitrary byte positions, including mid-record. The
    // smallest cut still keeps the tree-creation unit intact.
    for cut in [
        full_log.len() * 3 / 4,
        full_log.len() / 2,
        full_log.len() / 3,
        full_log.len() / 4,
    ] {
        let scratch = tempdir().unwrap();
        for entry in std::fs::read_dir(dir.path()).unwrap() {
            let entry = entry.unwrap();
            if entry.file_name() == "bonsai.wal" {
                continue;
            }
            std::fs::copy(entry.path(), scratch.path().join(entry.file_name())).unwrap();
        }
        std::fs::write(scratch.path().join("bonsai.wal"), &full_log[..cut]).unwrap();

        let storage = PaginatedStorage::open(scratch.path()).unwrap();
        let tree = load_tree(&storage, "links", root);

        // Puts committed in key order, so the surviving state is 1..=m.
        let size = tree.size().unwrap();
        assert!(size <= 40, "cut {cut} produced size {size}");
        for k in 1..=size as i64 {
            assert_eq!(
                tree.get(&k).unwrap(),
                Some(format!("v{k}")),
                "cut {cut} lost key {k}"
            );
        }
        for k in (size as i64 + 1)..=40 {
            assert_eq!(tree.get(&k).unwrap(), None, "cut {cut} leaked key {k}");
        }
    }
}

#[test]
fn clean_close_then_reopen_needs_no_log() {
    let dir = tempdir().unwrap();
    let root;
    {
        let storage = PaginatedStorage::create(dir.path()).unwrap();
        let tree = create_tree(&storage, "links");
        for k in 0..200i64 {
            tree.put(k, format!("v{k}")).unwrap();
        }
        root = tree.get_root_bucket_pointer();
        tree.close().unwrap();
        storage.close().unwrap();
    }

    assert_eq!(std::fs::metadata(dir.path().join("bonsai.wal")).unwrap().len(), 0);

    let storage = PaginatedStorage::open(dir.path()).unwrap();
    let tree = load_tree(&storage, "links", root);

    assert_eq!(tree.size().unwrap(), 200);
    assert_eq!(tree.get(&123).unwrap(), Some("v123".into()));

    tree.put(200, "fresh".into()).unwrap();
    assert_eq!(tree.size().unwrap(), 201);
}

#[test]
fn repeated_crashes_converge() {
    let dir = tempdir().unwrap();
    let root;
    {
        let storage = PaginatedStorage::create(dir.path()).unwrap();
        let tree = create_tree(&storage, "links");
        for k in 0..30i64 {
            tree.put(k, format!("v{k}")).unwrap();
        }
        root = tree.get_root_bucket_pointer();
    }

    for round in 0..3u64 {
        let storage = PaginatedStorage::open(dir.path()).unwrap();
        let tree = load_tree(&storage, "links", root);
        assert_eq!(tree.size().unwrap(), 30 + round);

        // One more committed put per round, then crash again.
        tree.put(30 + round as i64, format!("v{}", 30 + round)).unwrap();
    }

    let storage = PaginatedStorage::open(dir.path()).unwrap();
    let tree = load_tree(&storage, "links", root);
    assert_eq!(tree.size().unwrap(), 33);
}
