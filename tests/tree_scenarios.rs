//! # Tree End-to-End Scenarios
//!
//! Exercises the tree through its public API only: insertion orders, splits,
//! deletions, range scans, composite partial keys, and the agreement between
//! point operations and ordered traversal.

use std::sync::Arc;

use bonsai::{
    BonsaiTree, CompositeKey, CompositeKeySerializer, Int64Serializer, PaginatedStorage,
    TreeConfig, Utf8Serializer,
};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tempfile::tempdir;

type IntTree = BonsaiTree<Int64Serializer, Utf8Serializer>;

fn open_tree(dir: &std::path::Path, name: &str) -> (Arc<PaginatedStorage>, IntTree) {
    let storage = PaginatedStorage::create(dir).unwrap();
    let tree = IntTree::create(name, -1, Int64Serializer, Utf8Serializer, storage.clone())
        .unwrap();
    (storage, tree)
}

fn scan_keys(tree: &IntTree) -> Vec<i64> {
    let mut keys = Vec::new();
    tree.load_entries_major(&i64::MIN, true, |entry| {
        keys.push(entry.key);
        true
    })
    .unwrap();
    keys
}

#[test]
fn ascending_insert_with_splits() {
    let dir = tempdir().unwrap();
    let (_storage, tree) = open_tree(dir.path(), "ascending");

    for k in 1..=200i64 {
        tree.put(k, format!("v{k}")).unwrap();
    }

    assert_eq!(tree.size().unwrap(), 200);
    assert_eq!(tree.first_key().unwrap(), Some(1));
    assert_eq!(tree.last_key().unwrap(), Some(200));
    assert_eq!(tree.get(&100).unwrap(), Some("v100".into()));
    assert_eq!(tree.get(&201).unwrap(), None);

    let between = tree.get_values_between(&50, true, &60, true, -1).unwrap();
    let expected: Vec<String> = (50..=60).map(|k| format!("v{k}")).collect();
    assert_eq!(between, expected);
}

#[test]
fn descending_insert_reaches_the_same_state() {
    let dir = tempdir().unwrap();
    let (_storage, ascending) = open_tree(dir.path(), "fwd");
    let (_storage2, descending) = {
        let dir2 = dir.path().join("rev");
        let storage = PaginatedStorage::create(&dir2).unwrap();
        let tree = IntTree::create("rev", -1, Int64Serializer, Utf8Serializer, storage.clone())
            .unwrap();
        (storage, tree)
    };

    for k in 1..=200i64 {
        ascending.put(k, format!("v{k}")).unwrap();
    }
    for k in (1..=200i64).rev() {
        descending.put(k, format!("v{k}")).unwrap();
    }

    assert_eq!(descending.size().unwrap(), ascending.size().unwrap());
    assert_eq!(scan_keys(&descending), scan_keys(&ascending));
    assert_eq!(descending.first_key().unwrap(), Some(1));
    assert_eq!(descending.last_key().unwrap(), Some(200));
    assert_eq!(descending.get(&100).unwrap(), Some("v100".into()));
}

#[test]
fn shuffled_insert_then_delete_evens() {
    let dir = tempdir().unwrap();
    let (_storage, tree) = open_tree(dir.path(), "shuffled");

    let mut keys: Vec<i64> = (1..=1000).collect();
    keys.shuffle(&mut StdRng::seed_from_u64(0x5EED));

    for &k in &keys {
        tree.put(k, format!("v{k}")).unwrap();
    }
    assert_eq!(tree.size().unwrap(), 1000);

    for k in (2..=1000i64).step_by(2) {
        assert_eq!(tree.remove(&k).unwrap(), Some(format!("v{k}")));
    }

    assert_eq!(tree.size().unwrap(), 500);
    assert_eq!(tree.get(&500).unwrap(), None);
    assert_eq!(tree.get(&501).unwrap(), Some("v501".into()));

    let remaining = scan_keys(&tree);
    let odds: Vec<i64> = (1..=999).step_by(2).collect();
    assert_eq!(remaining, odds);
}

#[test]
fn insertion_order_does_not_affect_traversal() {
    let dir = tempdir().unwrap();
    let (_storage, first) = open_tree(dir.path(), "order-a");

    let keys: Vec<i64> = (0..500).map(|i| i * 7 % 501).collect();

    for &k in &keys {
        first.put(k, format!("v{k}")).unwrap();
    }

    let mut reshuffled = keys.clone();
    reshuffled.shuffle(&mut StdRng::seed_from_u64(99));

    let dir2 = tempdir().unwrap();
    let (_storage2, second) = open_tree(dir2.path(), "order-b");
    for &k in &reshuffled {
        second.put(k, format!("v{k}")).unwrap();
    }

    assert_eq!(scan_keys(&first), scan_keys(&second));
}

#[test]
fn point_range_returns_exactly_the_match() {
    let dir = tempdir().unwrap();
    let (_storage, tree) = open_tree(dir.path(), "point");

    for k in 1..=100i64 {
        tree.put(k, format!("v{k}")).unwrap();
    }

    let exact = tree.get_values_between(&42, true, &42, true, -1).unwrap();
    assert_eq!(exact, vec!["v42"]);

    let missing = tree.get_values_between(&0, true, &0, true, -1).unwrap();
    assert!(missing.is_empty());

    let empty_range = tree.get_values_between(&42, false, &42, false, -1).unwrap();
    assert!(empty_range.is_empty());
}

#[test]
fn boundary_keys_agree_with_scans() {
    let dir = tempdir().unwrap();
    let (_storage, tree) = open_tree(dir.path(), "bounds");

    let mut keys: Vec<i64> = (1..=300).map(|i| i * 3).collect();
    keys.shuffle(&mut StdRng::seed_from_u64(7));
    for &k in &keys {
        tree.put(k, format!("v{k}")).unwrap();
    }

    let ascending = tree.get_values_major(&i64::MIN, true, -1).unwrap();
    let descending = tree.get_values_minor(&i64::MAX, true, -1).unwrap();

    assert_eq!(
        tree.first_key().unwrap().map(|k| format!("v{k}")),
        ascending.first().cloned()
    );
    assert_eq!(
        tree.last_key().unwrap().map(|k| format!("v{k}")),
        descending.first().cloned()
    );
    assert_eq!(ascending.len(), 300);
    assert_eq!(descending.len(), 300);

    let mut reversed = descending.clone();
    reversed.reverse();
    assert_eq!(reversed, ascending);
}

#[test]
fn deep_trees_from_fat_values() {
    let dir = tempdir().unwrap();
    let (_storage, tree) = open_tree(dir.path(), "deep");
    let root = tree.get_root_bucket_pointer();

    // ~5 entries per leaf forces hundreds of leaves and interior splits.
    let filler = "f".repeat(3000);
    for k in 0..3000i64 {
        tree.put(k, format!("{k}:{filler}")).unwrap();
    }

    assert_eq!(tree.size().unwrap(), 3000);
    assert_eq!(tree.get_root_bucket_pointer(), root);
    assert_eq!(tree.first_key().unwrap(), Some(0));
    assert_eq!(tree.last_key().unwrap(), Some(2999));

    for k in (0..3000i64).step_by(97) {
        let value = tree.get(&k).unwrap().unwrap();
        assert!(value.starts_with(&format!("{k}:")));
    }

    assert_eq!(scan_keys(&tree), (0..3000).collect::<Vec<i64>>());
}

#[test]
fn growing_a_value_splits_without_losing_neighbors() {
    let dir = tempdir().unwrap();
    let (_storage, tree) = open_tree(dir.path(), "grow");

    for k in 0..120i64 {
        tree.put(k, "s".repeat(100)).unwrap();
    }
    let size_before = tree.size().unwrap();

    let long = "a much longer value ".repeat(400);
    tree.put(60, long.clone()).unwrap();

    assert_eq!(tree.size().unwrap(), size_before);
    assert_eq!(tree.get(&60).unwrap(), Some(long));
    assert_eq!(tree.get(&59).unwrap(), Some("s".repeat(100)));
    assert_eq!(tree.get(&61).unwrap(), Some("s".repeat(100)));
    assert_eq!(scan_keys(&tree), (0..120).collect::<Vec<i64>>());
}

#[test]
fn partial_composite_boundaries_match_expected_groups() {
    let dir = tempdir().unwrap();
    let storage = PaginatedStorage::create(dir.path()).unwrap();
    let tree = BonsaiTree::create_with(
        "pairs",
        -1,
        CompositeKeySerializer,
        Utf8Serializer,
        storage,
        TreeConfig {
            key_size: 2,
            ..TreeConfig::default()
        },
    )
    .unwrap();

    for a in 1..=3i64 {
        for b in 1..=3i64 {
            tree.put(CompositeKey::from([a, b]), format!("{a}.{b}")).unwrap();
        }
    }

    let inclusive = tree
        .get_values_major(&CompositeKey::from([2i64]), true, -1)
        .unwrap();
    assert_eq!(inclusive, vec!["2.1", "2.2", "2.3", "3.1", "3.2", "3.3"]);

    let exclusive = tree
        .get_values_major(&CompositeKey::from([2i64]), false, -1)
        .unwrap();
    assert_eq!(exclusive, vec!["3.1", "3.2", "3.3"]);

    let between = tree
        .get_values_between(
            &CompositeKey::from([2i64]),
            true,
            &CompositeKey::from([2i64]),
            true,
            -1,
        )
        .unwrap();
    assert_eq!(between, vec!["2.1", "2.2", "2.3"]);
}

#[test]
fn several_trees_share_one_container_file() {
    let dir = tempdir().unwrap();
    let storage = PaginatedStorage::create(dir.path()).unwrap();

    let first = IntTree::create("shared", -1, Int64Serializer, Utf8Serializer, storage.clone())
        .unwrap();
    let second = IntTree::create("shared", -1, Int64Serializer, Utf8Serializer, storage.clone())
        .unwrap();

    assert_ne!(
        first.get_root_bucket_pointer().page_index(),
        second.get_root_bucket_pointer().page_index()
    );

    for k in 0..200i64 {
        first.put(k, format!("first{k}")).unwrap();
        second.put(k, format!("second{k}")).unwrap();
    }

    assert_eq!(first.get(&7).unwrap(), Some("first7".into()));
    assert_eq!(second.get(&7).unwrap(), Some("second7".into()));
    assert_eq!(first.size().unwrap(), 200);
    assert_eq!(second.size().unwrap(), 200);

    // Only one data file backs both trees.
    let data_files: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".bns"))
        .collect();
    assert_eq!(data_files.len(), 1);
}

#[test]
fn removing_everything_leaves_a_usable_empty_tree() {
    let dir = tempdir().unwrap();
    let (_storage, tree) = open_tree(dir.path(), "drain");

    for k in 0..400i64 {
        tree.put(k, format!("v{k}")).unwrap();
    }
    for k in 0..400i64 {
        assert!(tree.remove(&k).unwrap().is_some());
    }

    assert_eq!(tree.size().unwrap(), 0);
    assert_eq!(tree.first_key().unwrap(), None);
    assert_eq!(tree.last_key().unwrap(), None);
    assert!(scan_keys(&tree).is_empty());

    tree.put(5, "back".into()).unwrap();
    assert_eq!(tree.get(&5).unwrap(), Some("back".into()));
    assert_eq!(tree.first_key().unwrap(), Some(5));
}
