use std::collections::BTreeMap;

use caprock::btree::BTree;
use caprock::RecordId;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn rid(key: i64) -> RecordId {
    RecordId::new(key as u32, (key % 7) as u16)
}

fn keys_of(rids: &[RecordId]) -> Vec<i64> {
    rids.iter().map(|r| r.page_id as i64).collect()
}

#[test]
fn test_churn_keeps_tree_searchable() {
    let mut tree = BTree::new(4);
    for key in [10, 20, 30, 40, 50, 60, 70, 80] {
        tree.insert(key, rid(key));
    }
    assert_eq!(keys_of(&tree.scan_all()), vec![10, 20, 30, 40, 50, 60, 70, 80]);

    assert!(tree.remove(40));
    assert!(tree.remove(30));
    assert!(tree.remove(50));

    assert_eq!(tree.search(40), None);
    assert_eq!(tree.search(20), Some(rid(20)));
    assert_eq!(keys_of(&tree.scan_all()), vec![10, 20, 60, 70, 80]);
}

#[test]
fn test_large_sequential_workload() {
    let mut tree = BTree::new(4);
    for key in 0..1000 {
        tree.insert(key, rid(key));
    }
    assert_eq!(keys_of(&tree.scan_all()), (0..1000).collect::<Vec<_>>());

    for key in (0..1000).filter(|k| k % 2 == 0) {
        assert!(tree.remove(key));
    }
    for key in 0..1000 {
        let expected = if key % 2 == 0 { None } else { Some(rid(key)) };
        assert_eq!(tree.search(key), expected, "key {key}");
    }
    assert_eq!(
        keys_of(&tree.scan_all()),
        (0..1000).filter(|k| k % 2 == 1).collect::<Vec<_>>()
    );
}

#[test]
fn test_range_queries_follow_the_leaf_chain() {
    let mut tree = BTree::new(4);
    for key in (0..1000).rev() {
        tree.insert(key * 2, rid(key * 2));
    }
    assert_eq!(keys_of(&tree.range(100, 120)), vec![100, 102, 104, 106, 108, 110, 112, 114, 116, 118, 120]);
    // Bounds that fall between keys still collect everything inside them.
    assert_eq!(keys_of(&tree.range(99, 107)), vec![100, 102, 104, 106]);
    assert!(tree.range(2001, 5000).is_empty());
}

#[test]
fn test_randomized_churn_matches_reference_model() {
    let mut rng = StdRng::seed_from_u64(0xCA9E0C);
    let mut tree = BTree::new(5);
    let mut model: BTreeMap<i64, RecordId> = BTreeMap::new();

    for _ in 0..5000 {
        let key = rng.gen_range(0..600);
        if rng.gen_bool(0.6) {
            let value = rid(key);
            tree.insert(key, value);
            model.insert(key, value);
        } else {
            assert_eq!(tree.remove(key), model.remove(&key).is_some(), "key {key}");
        }
    }

    let scanned = tree.scan_all();
    let expected: Vec<RecordId> = model.values().copied().collect();
    assert_eq!(scanned, expected);
    for key in 0..600 {
        assert_eq!(tree.search(key), model.get(&key).copied(), "key {key}");
    }
}

#[test]
fn test_clear_supports_index_rebuild() {
    let mut tree = BTree::new(4);
    for key in 0..128 {
        tree.insert(key, rid(key));
    }
    tree.clear();
    assert!(tree.is_empty());

    // Rebuild with different record ids, as a table reload would.
    for key in 0..128 {
        tree.insert(key, RecordId::new(1000 + key as u32, 0));
    }
    assert_eq!(tree.search(17), Some(RecordId::new(1017, 0)));
    assert_eq!(tree.scan_all().len(), 128);
}
