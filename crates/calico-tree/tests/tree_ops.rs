//! Tree behaviour over a real pager and the in-memory environment:
//! ordering, splits and rebalancing, overflow chains, cursors, and
//! bulk drops.

use std::collections::BTreeMap;
use std::sync::Arc;

use calico_env::MemEnv;
use calico_pager::{Pager, PagerOptions};
use calico_tree::{Cursor, Tree};
use calico_types::PageSize;

fn open_pager() -> Pager {
    let env = MemEnv::new();
    // Transactions here dirty many 512-byte pages at once; the cache
    // must hold the whole write set until commit.
    let options = PagerOptions {
        page_size: PageSize::new(512).unwrap(),
        cache_size: 4096,
        ..PagerOptions::default()
    };
    Pager::open(Arc::new(env), "test.db", &options).unwrap()
}

/// Start a write transaction with page 1 formatted.
fn begin(pager: &mut Pager) {
    pager.lock_reader().unwrap();
    pager.begin_writer().unwrap();
    if pager.page_count() == 0 {
        Tree::bootstrap_root(pager).unwrap();
    }
}

fn key(i: usize) -> Vec<u8> {
    format!("key{i:05}").into_bytes()
}

fn value(i: usize) -> Vec<u8> {
    format!("value{i:05}").into_bytes()
}

#[test]
fn put_get_round_trip() {
    let mut pager = open_pager();
    begin(&mut pager);
    let mut tree = Tree::create(&mut pager).unwrap();
    tree.put(&mut pager, b"a", b"1").unwrap();
    tree.put(&mut pager, b"b", b"22").unwrap();
    assert_eq!(tree.get(&mut pager, b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(tree.get(&mut pager, b"b").unwrap(), Some(b"22".to_vec()));
    assert_eq!(tree.get(&mut pager, b"c").unwrap(), None);
    pager.finish();
}

#[test]
fn overwrite_replaces_the_value() {
    let mut pager = open_pager();
    begin(&mut pager);
    let mut tree = Tree::create(&mut pager).unwrap();
    tree.put(&mut pager, b"k", b"first").unwrap();
    tree.put(&mut pager, b"k", b"second").unwrap();
    assert_eq!(tree.get(&mut pager, b"k").unwrap(), Some(b"second".to_vec()));
    tree.check(&mut pager).unwrap();
    pager.finish();
}

#[test]
fn empty_keys_are_rejected() {
    let mut pager = open_pager();
    begin(&mut pager);
    let mut tree = Tree::create(&mut pager).unwrap();
    assert!(
        tree.put(&mut pager, b"", b"v")
            .unwrap_err()
            .is_invalid_argument()
    );
    assert!(tree.get(&mut pager, b"").unwrap_err().is_invalid_argument());
    pager.finish();
}

#[test]
fn thousand_inserts_stay_ordered() {
    let mut pager = open_pager();
    begin(&mut pager);
    let mut tree = Tree::create(&mut pager).unwrap();
    // Interleave from both ends so splits see both edge patterns.
    for i in 0..500 {
        tree.put(&mut pager, &key(i), &value(i)).unwrap();
        tree.put(&mut pager, &key(999 - i), &value(999 - i)).unwrap();
    }
    tree.check(&mut pager).unwrap();
    for i in 0..1000 {
        assert_eq!(
            tree.get(&mut pager, &key(i)).unwrap(),
            Some(value(i)),
            "key {i}"
        );
    }
    pager.finish();
}

#[test]
fn erase_rebalances_and_preserves_the_rest() {
    let mut pager = open_pager();
    begin(&mut pager);
    let mut tree = Tree::create(&mut pager).unwrap();
    for i in 0..1000 {
        tree.put(&mut pager, &key(i), &value(i)).unwrap();
    }
    for i in (0..1000).step_by(2) {
        tree.erase(&mut pager, &key(i)).unwrap();
    }
    tree.check(&mut pager).unwrap();
    for i in 0..1000 {
        let got = tree.get(&mut pager, &key(i)).unwrap();
        if i % 2 == 0 {
            assert_eq!(got, None, "key {i} should be gone");
        } else {
            assert_eq!(got, Some(value(i)), "key {i} should remain");
        }
    }
    // Erasing a missing key succeeds silently.
    tree.erase(&mut pager, b"not-there").unwrap();
    pager.finish();
}

#[test]
fn erase_everything_leaves_an_empty_tree() {
    let mut pager = open_pager();
    begin(&mut pager);
    let mut tree = Tree::create(&mut pager).unwrap();
    for i in 0..300 {
        tree.put(&mut pager, &key(i), &value(i)).unwrap();
    }
    for i in 0..300 {
        tree.erase(&mut pager, &key(i)).unwrap();
    }
    tree.check(&mut pager).unwrap();
    let mut cursor = Cursor::new();
    cursor.seek_first(&mut pager, &tree).unwrap();
    assert!(!cursor.is_valid());
    pager.finish();
}

#[test]
fn large_values_spill_and_come_back() {
    let mut pager = open_pager();
    begin(&mut pager);
    let mut tree = Tree::create(&mut pager).unwrap();
    let big: Vec<u8> = (0..10_000_u32).map(|i| (i % 251) as u8).collect();
    tree.put(&mut pager, b"k", &big).unwrap();
    assert_eq!(tree.get(&mut pager, b"k").unwrap(), Some(big.clone()));
    tree.check(&mut pager).unwrap();

    // Erasing the record returns the whole chain to the freelist: a
    // 10_000-byte payload needs at least 20 pages at 508 bytes each.
    let free_before = pager.freelist_len();
    tree.erase(&mut pager, b"k").unwrap();
    assert!(
        pager.freelist_len() >= free_before + 20,
        "freelist grew by {}",
        pager.freelist_len() - free_before
    );
    pager.validate_freelist().unwrap();
    pager.finish();
}

#[test]
fn overwriting_a_spilled_value_reuses_and_trims_the_chain() {
    let mut pager = open_pager();
    begin(&mut pager);
    let mut tree = Tree::create(&mut pager).unwrap();
    let big = vec![7_u8; 5000];
    tree.put(&mut pager, b"k", &big).unwrap();
    let pages_before = pager.page_count();

    // A shorter spilled value must not grow the file: surplus chain
    // pages go to the freelist instead.
    let smaller = vec![9_u8; 2000];
    tree.put(&mut pager, b"k", &smaller).unwrap();
    assert_eq!(tree.get(&mut pager, b"k").unwrap(), Some(smaller));
    assert_eq!(pager.page_count(), pages_before);
    assert!(pager.freelist_len() > 0);
    pager.validate_freelist().unwrap();

    let inline = vec![1_u8; 10];
    tree.put(&mut pager, b"k", &inline).unwrap();
    assert_eq!(tree.get(&mut pager, b"k").unwrap(), Some(inline));
    tree.check(&mut pager).unwrap();
    pager.finish();
}

#[test]
fn long_keys_compare_through_their_chains() {
    let mut pager = open_pager();
    begin(&mut pager);
    let mut tree = Tree::create(&mut pager).unwrap();
    // Keys sharing a 600-byte prefix force comparisons into the
    // overflow chain.
    let prefix = vec![b'p'; 600];
    let mut keys = Vec::new();
    for i in 0..20 {
        let mut k = prefix.clone();
        k.extend_from_slice(format!("{i:03}").as_bytes());
        tree.put(&mut pager, &k, &value(i)).unwrap();
        keys.push(k);
    }
    tree.check(&mut pager).unwrap();
    for (i, k) in keys.iter().enumerate() {
        assert_eq!(tree.get(&mut pager, k).unwrap(), Some(value(i)));
    }
    let mut missing = prefix.clone();
    missing.extend_from_slice(b"xxx");
    assert_eq!(tree.get(&mut pager, &missing).unwrap(), None);
    pager.finish();
}

#[test]
fn matches_a_model_under_mixed_operations() {
    let mut pager = open_pager();
    begin(&mut pager);
    let mut tree = Tree::create(&mut pager).unwrap();
    let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();

    // Deterministic mixed workload with varying value sizes.
    let mut state = 0x2545_F491_4F6C_DD1D_u64;
    for step in 0..3000_usize {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        let k = key((state % 500) as usize);
        match state % 4 {
            0 => {
                tree.erase(&mut pager, &k).unwrap();
                model.remove(&k);
            }
            _ => {
                let len = (state % 700) as usize;
                let v = vec![(step % 256) as u8; len];
                tree.put(&mut pager, &k, &v).unwrap();
                model.insert(k, v);
            }
        }
    }
    tree.check(&mut pager).unwrap();
    pager.validate_freelist().unwrap();
    for (k, v) in &model {
        assert_eq!(tree.get(&mut pager, k).unwrap().as_ref(), Some(v));
    }

    // Full ordered scan agrees with the model.
    let mut cursor = Cursor::new();
    cursor.seek_first(&mut pager, &tree).unwrap();
    let mut scanned = Vec::new();
    while cursor.is_valid() {
        scanned.push(cursor.key().to_vec());
        cursor.next(&mut pager, &tree).unwrap();
    }
    let expected: Vec<Vec<u8>> = model.keys().cloned().collect();
    assert_eq!(scanned, expected);
    pager.finish();
}

#[test]
fn cursor_scans_ascending_and_descending() {
    let mut pager = open_pager();
    begin(&mut pager);
    let mut tree = Tree::create(&mut pager).unwrap();
    for i in 0..500 {
        tree.put(&mut pager, &key(i), &value(i)).unwrap();
    }

    let mut cursor = Cursor::new();
    cursor.seek_first(&mut pager, &tree).unwrap();
    let mut count = 0;
    let mut last: Option<Vec<u8>> = None;
    while cursor.is_valid() {
        let k = cursor.key().to_vec();
        if let Some(prev) = &last {
            assert!(*prev < k, "ascending order violated");
        }
        last = Some(k);
        count += 1;
        cursor.next(&mut pager, &tree).unwrap();
    }
    assert_eq!(count, 500);

    cursor.seek_last(&mut pager, &tree).unwrap();
    let mut count = 0;
    let mut last: Option<Vec<u8>> = None;
    while cursor.is_valid() {
        let k = cursor.key().to_vec();
        if let Some(prev) = &last {
            assert!(*prev > k, "descending order violated");
        }
        last = Some(k);
        count += 1;
        cursor.previous(&mut pager, &tree).unwrap();
    }
    assert_eq!(count, 500);
    pager.finish();
}

#[test]
fn cursor_seek_is_a_lower_bound() {
    let mut pager = open_pager();
    begin(&mut pager);
    let mut tree = Tree::create(&mut pager).unwrap();
    for i in (0..100).step_by(2) {
        tree.put(&mut pager, &key(i), &value(i)).unwrap();
    }
    let mut cursor = Cursor::new();
    assert!(cursor.seek(&mut pager, &tree, &key(10)).unwrap());
    assert_eq!(cursor.key(), key(10).as_slice());
    // Odd keys are absent; seek lands on the next even one.
    assert!(!cursor.seek(&mut pager, &tree, &key(11)).unwrap());
    assert!(cursor.is_valid());
    assert_eq!(cursor.key(), key(12).as_slice());
    // Past the end.
    assert!(!cursor.seek(&mut pager, &tree, &key(99)).unwrap());
    assert!(!cursor.is_valid());
    pager.finish();
}

#[test]
fn cursor_survives_mutation_through_its_anchor() {
    let mut pager = open_pager();
    begin(&mut pager);
    let mut tree = Tree::create(&mut pager).unwrap();
    for i in 0..200 {
        tree.put(&mut pager, &key(i), &value(i)).unwrap();
    }

    let mut cursor = Cursor::new();
    cursor.seek(&mut pager, &tree, &key(50)).unwrap();
    assert_eq!(cursor.key(), key(50).as_slice());

    // Heavy insertion shifts every position; the cursor re-anchors.
    for i in 200..400 {
        tree.put(&mut pager, &key(i), &value(i)).unwrap();
    }
    cursor.next(&mut pager, &tree).unwrap();
    assert_eq!(cursor.key(), key(51).as_slice());

    // Erasing the record under the cursor moves it to the successor.
    tree.erase(&mut pager, &key(51)).unwrap();
    assert!(cursor.refresh(&mut pager, &tree).unwrap());
    assert_eq!(cursor.key(), key(52).as_slice());

    // previous() from a vanished anchor lands on the nearest smaller
    // key.
    cursor.seek(&mut pager, &tree, &key(60)).unwrap();
    tree.erase(&mut pager, &key(60)).unwrap();
    cursor.previous(&mut pager, &tree).unwrap();
    assert_eq!(cursor.key(), key(59).as_slice());
    pager.finish();
}

#[test]
fn free_all_returns_every_page() {
    let mut pager = open_pager();
    begin(&mut pager);
    let mut tree = Tree::create(&mut pager).unwrap();
    for i in 0..400 {
        tree.put(&mut pager, &key(i), &vec![3_u8; 200]).unwrap();
    }
    let used = pager.page_count();
    let free_before = pager.freelist_len();
    tree.free_all(&mut pager).unwrap();
    // Everything the tree held is back on the freelist; only page 1,
    // the pointer maps, and previously free pages are not.
    assert!(pager.freelist_len() > free_before);
    assert_eq!(pager.page_count(), used);
    pager.validate_freelist().unwrap();
    pager.finish();
}

#[test]
fn changes_persist_across_commit_and_reopen_of_the_transaction() {
    let mut pager = open_pager();
    begin(&mut pager);
    let mut tree = Tree::create(&mut pager).unwrap();
    let root = tree.root;
    for i in 0..100 {
        tree.put(&mut pager, &key(i), &value(i)).unwrap();
    }
    pager.commit().unwrap();
    pager.finish();

    pager.lock_reader().unwrap();
    let tree = Tree::open(root);
    for i in 0..100 {
        assert_eq!(tree.get(&mut pager, &key(i)).unwrap(), Some(value(i)));
    }
    pager.finish();
}
