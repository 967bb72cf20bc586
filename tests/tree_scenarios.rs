//! Whole-tree scenarios: append/scan round trips, chunked reads, clean
//! close and reopen, crash recovery from mid-fill snapshots, eviction.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use stranddb::blockstore::{MemStore, SharedBlockStore};
use stranddb::tree::{check_extent, RepairStatus, ScanStatus, SeriesTree};
use stranddb::{LogicAddr, Timestamp, EMPTY_ADDR};

const SERIES: u64 = 42;

fn memstore_with_watch() -> (Arc<MemStore>, Arc<Mutex<LogicAddr>>) {
    let last = Arc::new(Mutex::new(EMPTY_ADDR));
    let sink = last.clone();
    let store = MemStore::with_callback(Box::new(move |addr| *sink.lock() = addr));
    (store, last)
}

/// Append `(i, i)` for `i` in `0..n`
fn fill_n(tree: &mut SeriesTree, n: i64) {
    for i in 0..n {
        tree.append(i, i as f64).unwrap();
    }
}

/// Append `(i, i)` until `nleafs` leaf commits happened; returns the number
/// of appended pairs
fn fill_until_leaves(tree: &mut SeriesTree, nleafs: usize) -> i64 {
    let mut commits = 0;
    let mut i = 0i64;
    loop {
        if tree.append(i, i as f64).unwrap() {
            commits += 1;
            if commits == nleafs {
                return i + 1;
            }
        }
        i += 1;
    }
}

/// Single-shot read of exactly `expected` pairs; checks the `(i, i)` ramp
/// in the requested direction
fn check_range(tree: &SeriesTree, begin: Timestamp, end: Timestamp) {
    let forward = begin < end;
    let outsz = if forward { end - begin } else { begin - end } as usize;

    let mut ts = vec![0i64; outsz];
    let mut xs = vec![-1f64; outsz];
    let (status, sz) = tree.search(begin, end).read(&mut ts, &mut xs).unwrap();

    assert_eq!(sz, outsz);
    assert_eq!(status, ScanStatus::Success);

    for i in 0..outsz {
        let expected = if forward {
            begin + i as i64
        } else {
            begin - i as i64
        };
        assert_eq!(ts[i], expected, "timestamp mismatch at {}", i);
        assert_eq!(xs[i], expected as f64, "value mismatch at {}", i);
    }
}

#[test]
fn scan_small_series() {
    let mut tree = SeriesTree::new(SERIES, Vec::new(), MemStore::new());
    fill_n(&mut tree, 100);
    check_range(&tree, 0, 100);
}

#[test]
fn scan_multi_level_series_both_directions() {
    let mut tree = SeriesTree::new(SERIES, Vec::new(), MemStore::new());
    fill_n(&mut tree, 200_000);

    check_range(&tree, 0, 200_000);
    check_range(&tree, 199_999, -1);
}

#[test]
fn scan_random_ranges() {
    let mut rng = StdRng::seed_from_u64(0xC0FFEE);

    for _ in 0..20 {
        let n = rng.gen_range(2..20_000i64);
        let mut tree = SeriesTree::new(SERIES, Vec::new(), MemStore::new());
        fill_n(&mut tree, n);

        let from = rng.gen_range(0..n);
        let to = rng.gen_range(0..n);
        if from != to {
            check_range(&tree, from, to);
        }
    }
}

/// Chunked reads concatenate to the single-shot result
fn check_chunked(n: i64, begin: Timestamp, end: Timestamp, chunk: usize) {
    let mut tree = SeriesTree::new(SERIES, Vec::new(), MemStore::new());
    fill_n(&mut tree, n);

    let forward = begin < end;
    let outsz = if forward { end - begin } else { begin - end } as usize;

    let mut it = tree.search(begin, end);
    let mut ts = vec![0i64; chunk];
    let mut xs = vec![0f64; chunk];

    let mut total = 0usize;
    let mut expected = begin;
    loop {
        let (status, sz) = it.read(&mut ts, &mut xs).unwrap();
        assert!(
            sz > 0 || status == ScanStatus::NoData,
            "empty chunk with status {:?}",
            status
        );
        total += sz;

        for i in 0..sz {
            assert_eq!(ts[i], expected);
            assert_eq!(xs[i], expected as f64);
            expected = if forward { ts[i] + 1 } else { ts[i] - 1 };
        }

        if status == ScanStatus::NoData {
            break;
        }
    }

    assert_eq!(total, outsz);
    assert_eq!(expected, end);
}

#[test]
fn chunked_scan_fixed() {
    check_chunked(2000, 0, 2000, 37);
    check_chunked(2000, 1999, -1, 37);
}

#[test]
fn chunked_scan_random() {
    let mut rng = StdRng::seed_from_u64(0xBADCAFE);

    for _ in 0..10 {
        let n = rng.gen_range(100..20_000i64);
        let from = rng.gen_range(0..n);
        let to = rng.gen_range(0..n);
        let chunk = rng.gen_range(1..n as usize);
        if from != to {
            check_chunked(n, from, to, chunk);
        }
    }
}

#[test]
fn close_seals_tree_and_reports_last_address() {
    let (store, last_written) = memstore_with_watch();
    let mut tree = SeriesTree::new(SERIES, Vec::new(), store);

    let mut snapshot = Vec::new();
    let mut commits = 0;
    let mut i = 0i64;
    while commits < 32 {
        if tree.append(i, i as f64).unwrap() {
            let roots = tree.roots();
            assert_ne!(roots, snapshot, "head list must change on every commit");
            snapshot = roots;

            // Every mid-fill snapshot is repairable, never clean
            assert_eq!(
                SeriesTree::repair_status(&snapshot),
                RepairStatus::Repair
            );
            commits += 1;
        }
        i += 1;
    }

    let roots = tree.close().unwrap();
    assert_eq!(SeriesTree::repair_status(&roots), RepairStatus::Ok);
    assert_eq!(*roots.last().unwrap(), *last_written.lock());
}

fn check_clean_reopen(nleafs: usize) {
    let (store, last_written) = memstore_with_watch();
    let shared: SharedBlockStore = store.clone();

    let mut tree = SeriesTree::new(SERIES, Vec::new(), store.clone());
    let nitems = fill_until_leaves(&mut tree, nleafs);

    let roots = tree.close().unwrap();
    assert_eq!(*roots.last().unwrap(), *last_written.lock());
    drop(tree);

    let mut reopened = SeriesTree::new(SERIES, roots, store);
    reopened.force_init().unwrap();

    for (level, extent) in reopened.extents().iter().enumerate() {
        check_extent(extent, &shared, level).unwrap();
    }

    // Everything committed before close is visible after reopen
    let mut ts = vec![0i64; nitems as usize];
    let mut xs = vec![0f64; nitems as usize];
    let (status, sz) = reopened
        .search(0, nitems)
        .read(&mut ts, &mut xs)
        .unwrap();
    assert_eq!(status, ScanStatus::Success);
    assert_eq!(sz, nitems as usize);
    for i in 0..nitems {
        assert_eq!(ts[i as usize], i);
        assert_eq!(xs[i as usize], i as f64);
    }
}

#[test]
fn reopen_after_close_one_leaf() {
    check_clean_reopen(1);
}

#[test]
fn reopen_after_close_two_leaves() {
    check_clean_reopen(2);
}

#[test]
fn reopen_after_close_full_subtree() {
    check_clean_reopen(64);
}

#[test]
fn reopen_after_close_overflowing_subtree() {
    check_clean_reopen(65);
}

#[test]
fn reopen_after_close_several_subtrees() {
    check_clean_reopen(197);
}

#[test]
fn reopen_after_close_and_keep_appending() {
    let store = MemStore::new();
    let mut tree = SeriesTree::new(SERIES, Vec::new(), store.clone());
    let nitems = fill_until_leaves(&mut tree, 3);
    let roots = tree.close().unwrap();
    drop(tree);

    let mut tree = SeriesTree::new(SERIES, roots, store.clone());
    tree.force_init().unwrap();
    for i in nitems..nitems + 10_000 {
        tree.append(i, i as f64).unwrap();
    }

    check_range(&tree, 0, nitems + 10_000);
    check_range(&tree, nitems + 9_999, -1);

    let shared: SharedBlockStore = store;
    for (level, extent) in tree.extents().iter().enumerate() {
        check_extent(extent, &shared, level).unwrap();
    }
}

fn check_crash_recovery(nleafs: usize) {
    let store = MemStore::new();
    let shared: SharedBlockStore = store.clone();

    let mut tree = SeriesTree::new(SERIES, Vec::new(), store.clone());
    let nitems = fill_until_leaves(&mut tree, nleafs);

    // Crash: drop the tree without close, keep only the last snapshot
    let snapshot = tree.roots();
    drop(tree);

    let mut recovered = SeriesTree::new(SERIES, snapshot, store);
    recovered.force_init().unwrap();

    for (level, extent) in recovered.extents().iter().enumerate() {
        check_extent(extent, &shared, level).unwrap();
    }

    let mut ts = vec![0i64; nitems as usize];
    let mut xs = vec![0f64; nitems as usize];
    let (status, sz) = recovered
        .search(0, nitems)
        .read(&mut ts, &mut xs)
        .unwrap();

    // The pair that opened the newest leaf was still buffered at crash
    // time, so the recovered data is a strict prefix
    assert!(sz < nitems as usize);
    assert!(status == ScanStatus::NoData || status == ScanStatus::Success);
    for i in 0..sz {
        assert_eq!(ts[i], i as i64, "gap or reorder at {}", i);
        assert_eq!(xs[i], i as f64);
    }
}

#[test]
fn crash_recovery_one_leaf() {
    check_crash_recovery(1);
}

#[test]
fn crash_recovery_partial_subtree() {
    check_crash_recovery(31);
}

#[test]
fn crash_recovery_wrapped_subtree() {
    check_crash_recovery(64);
}

#[test]
fn crash_recovery_overflowing_subtree() {
    check_crash_recovery(65);
}

#[test]
fn crash_recovery_nothing_committed() {
    let store = MemStore::new();
    let mut tree = SeriesTree::new(SERIES, Vec::new(), store.clone());
    fill_n(&mut tree, 10);

    let snapshot = tree.roots();
    drop(tree);

    let mut recovered = SeriesTree::new(SERIES, snapshot, store);
    recovered.force_init().unwrap();

    // All ten pairs were still in the open leaf builder
    let mut ts = [0i64; 10];
    let mut xs = [0f64; 10];
    let (status, sz) = recovered.search(0, 10).read(&mut ts, &mut xs).unwrap();
    assert_eq!(status, ScanStatus::NoData);
    assert_eq!(sz, 0);
}

#[test]
fn recovered_tree_accepts_appends() {
    let store = MemStore::new();
    let mut tree = SeriesTree::new(SERIES, Vec::new(), store.clone());
    let nitems = fill_until_leaves(&mut tree, 5);

    let snapshot = tree.roots();
    drop(tree);

    let mut recovered = SeriesTree::new(SERIES, snapshot, store);
    recovered.force_init().unwrap();

    let (ts, _) = recovered.search(0, nitems).collect_remaining().unwrap();
    let resume_from = ts.len() as i64;
    assert!(resume_from < nitems);

    for i in resume_from..resume_from + 50_000 {
        recovered.append(i, i as f64).unwrap();
    }
    check_range(&recovered, 0, resume_from + 50_000);
}

#[test]
fn evicted_block_fails_scans_but_not_appends() {
    let store = MemStore::new();
    let mut tree = SeriesTree::new(SERIES, Vec::new(), store.clone());
    let nitems = fill_until_leaves(&mut tree, 2);

    // The first block written is the oldest leaf
    assert!(store.evict(0));

    let mut ts = vec![0i64; nitems as usize];
    let mut xs = vec![0f64; nitems as usize];
    let err = tree
        .search(0, nitems)
        .read(&mut ts, &mut xs)
        .unwrap_err();
    assert!(err.is_corruption());

    // Appending only ever touches chain heads
    for i in nitems..nitems + 10_000 {
        tree.append(i, i as f64).unwrap();
    }
}

#[test]
fn pending_pairs_are_readable() {
    let mut tree = SeriesTree::new(SERIES, Vec::new(), MemStore::new());
    let nitems = fill_until_leaves(&mut tree, 1);

    // Exactly the pairs that did not make the committed leaf
    let pending = tree.read_all().unwrap();
    assert_eq!(pending, vec![(nitems - 1, (nitems - 1) as f64)]);
}
