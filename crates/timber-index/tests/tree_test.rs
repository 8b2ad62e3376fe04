//! End-to-end tests for the timed B+tree.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::Rng;
use tempfile::TempDir;
use timber_index::{
    CancelToken, Entry, Options, PageCache, SharedWriteBuffer, Tree, TreeError, TreeId,
    WriteBuffer,
};

fn tree_opts(page_size: usize) -> Options {
    let shared = SharedWriteBuffer::new(256 * page_size, page_size);
    let wb = WriteBuffer::new(shared, 16, 192).unwrap();
    let cache = Arc::new(PageCache::new(64, page_size));
    Options::new(wb, cache)
        .with_tree_id(TreeId::new(1))
        .with_file_size(1 << 20)
}

fn open_tree(dir: &TempDir, page_size: usize) -> Tree {
    Tree::open(dir.path(), tree_opts(page_size)).unwrap()
}

fn entry(key: &str, value: &str, ts: u64) -> Entry {
    Entry::new(key.as_bytes(), value.as_bytes(), ts)
}

/// Chops `delta` bytes off the end of the (single) tree-log file.
fn truncate_tree_log(dir: &Path, delta: u64) {
    let path = dir.join("tree").join("00000000.t");
    let file = OpenOptions::new().write(true).open(path).unwrap();
    let len = file.metadata().unwrap().len();
    file.set_len(len - delta).unwrap();
}

#[test]
fn test_empty_tree_lookup() {
    let dir = TempDir::new().unwrap();
    let tree = open_tree(&dir, 4096);

    assert!(matches!(tree.get(b"x"), Err(TreeError::KeyNotFound)));
    assert_eq!(tree.ts(), 0);
}

#[test]
fn test_insert_then_get() {
    let dir = TempDir::new().unwrap();
    let tree = open_tree(&dir, 4096);

    tree.insert(entry("x", "1", 1)).unwrap();

    let (value, ts, hc) = tree.get(b"x").unwrap();
    assert_eq!(value, b"1");
    assert_eq!(ts, 1);
    assert_eq!(hc, 0);
    assert_eq!(tree.ts(), 1);
}

#[test]
fn test_splits_keep_order() {
    let dir = TempDir::new().unwrap();
    let tree = open_tree(&dir, 256);

    for i in 0..16u64 {
        tree.insert(entry(&format!("k{i:02}"), "v", i + 1)).unwrap();
    }

    assert!(tree.splits() > 0, "16 keys must overflow a 256-byte leaf");
    assert_eq!(tree.depth(), 2, "root should be an inner page over leaves");

    let (value, ts, hc) = tree.get(b"k07").unwrap();
    assert_eq!(value, b"v");
    assert_eq!(ts, 8);
    assert_eq!(hc, 0);

    // A full scan sees every key exactly once, in order.
    let snap = tree.write_snapshot().unwrap();
    let mut iter = snap.iter();
    let mut seen = Vec::new();
    while let Some(e) = iter.next().unwrap() {
        seen.push(String::from_utf8(e.key).unwrap());
    }
    let expected: Vec<String> = (0..16).map(|i| format!("k{i:02}")).collect();
    assert_eq!(seen, expected);
}

#[test]
fn test_history_revisions() {
    let dir = TempDir::new().unwrap();
    let tree = open_tree(&dir, 4096);

    tree.insert(entry("a", "1", 1)).unwrap();
    tree.insert(entry("a", "2", 2)).unwrap();
    tree.insert(entry("a", "3", 3)).unwrap();

    let (value, ts, hc) = tree.get(b"a").unwrap();
    assert_eq!((value.as_slice(), ts, hc), (b"3".as_slice(), 3, 2));

    tree.flush().unwrap();

    assert_eq!(tree.get_revision(b"a", 1).unwrap(), (b"1".to_vec(), 1));
    assert_eq!(tree.get_revision(b"a", 2).unwrap(), (b"2".to_vec(), 2));
    assert_eq!(tree.get_revision(b"a", 3).unwrap(), (b"3".to_vec(), 3));
    assert!(matches!(
        tree.get_revision(b"a", 4),
        Err(TreeError::KeyRevisionNotFound)
    ));
    assert!(matches!(
        tree.get_revision(b"a", 0),
        Err(TreeError::IllegalArguments(_))
    ));
}

#[test]
fn test_get_between() {
    let dir = TempDir::new().unwrap();
    let tree = open_tree(&dir, 4096);

    tree.insert(entry("a", "1", 1)).unwrap();
    tree.insert(entry("a", "2", 2)).unwrap();
    tree.insert(entry("a", "3", 3)).unwrap();
    tree.flush().unwrap();

    let (value, ts, rev) = tree.get_between(b"a", 1, 2).unwrap();
    assert_eq!((value.as_slice(), ts, rev), (b"2".as_slice(), 2, 2));

    let (value, ts, rev) = tree.get_between(b"a", 1, 3).unwrap();
    assert_eq!((value.as_slice(), ts, rev), (b"3".as_slice(), 3, 3));

    let (value, ts, rev) = tree.get_between(b"a", 1, 1).unwrap();
    assert_eq!((value.as_slice(), ts, rev), (b"1".as_slice(), 1, 1));

    assert!(matches!(
        tree.get_between(b"a", 4, 5),
        Err(TreeError::KeyNotFound)
    ));
    assert!(matches!(
        tree.get_between(b"missing", 1, 3),
        Err(TreeError::KeyNotFound)
    ));
}

#[test]
fn test_history_listing() {
    let dir = TempDir::new().unwrap();
    let tree = open_tree(&dir, 4096);

    for ts in 1..=4u64 {
        tree.insert(entry("k", &format!("v{ts}"), ts)).unwrap();
    }
    tree.flush().unwrap();

    let (desc, total) = tree.history(b"k", 0, true, 10).unwrap();
    assert_eq!(total, 4);
    let desc_ts: Vec<u64> = desc.iter().map(|tv| tv.ts).collect();
    assert_eq!(desc_ts, vec![4, 3, 2, 1]);

    let (asc, _) = tree.history(b"k", 0, false, 10).unwrap();
    let asc_ts: Vec<u64> = asc.iter().map(|tv| tv.ts).collect();
    assert_eq!(asc_ts, vec![1, 2, 3, 4]);

    let (page, _) = tree.history(b"k", 1, true, 2).unwrap();
    let page_ts: Vec<u64> = page.iter().map(|tv| tv.ts).collect();
    assert_eq!(page_ts, vec![3, 2]);
    assert_eq!(page[0].value, b"v3");

    let (beyond, total) = tree.history(b"k", 10, true, 2).unwrap();
    assert!(beyond.is_empty());
    assert_eq!(total, 4);
}

#[test]
fn test_round_trip_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let tree = open_tree(&dir, 4096);
        for i in 0..100u64 {
            tree.insert(entry(&format!("key{i:03}"), &format!("value{i}"), i + 1))
                .unwrap();
        }
        tree.flush().unwrap();
        tree.close().unwrap();
    }

    let tree = open_tree(&dir, 4096);
    assert_eq!(tree.ts(), 100);
    for i in 0..100u64 {
        let (value, ts, hc) = tree.get(format!("key{i:03}").as_bytes()).unwrap();
        assert_eq!(value, format!("value{i}").as_bytes());
        assert_eq!(ts, i + 1);
        assert_eq!(hc, 0);
    }
}

#[test]
fn test_reopen_preserves_history() {
    let dir = TempDir::new().unwrap();
    {
        let tree = open_tree(&dir, 4096);
        tree.insert(entry("a", "1", 1)).unwrap();
        tree.insert(entry("a", "2", 2)).unwrap();
        tree.insert(entry("a", "3", 3)).unwrap();
        tree.flush().unwrap();
        tree.close().unwrap();
    }

    let tree = open_tree(&dir, 4096);
    let (value, ts, hc) = tree.get(b"a").unwrap();
    assert_eq!((value.as_slice(), ts, hc), (b"3".as_slice(), 3, 2));
    assert_eq!(tree.get_revision(b"a", 1).unwrap(), (b"1".to_vec(), 1));
    assert_eq!(tree.get_between(b"a", 1, 2).unwrap().1, 2);
}

#[test]
fn test_recovery_torn_commit_entry() {
    let dir = TempDir::new().unwrap();
    {
        let tree = open_tree(&dir, 256);
        for i in 0..8u64 {
            tree.insert(entry(&format!("k{i:02}"), "one", i + 1)).unwrap();
        }
        tree.flush_reset().unwrap();
        for i in 8..16u64 {
            tree.insert(entry(&format!("k{i:02}"), "two", i + 1)).unwrap();
        }
        tree.flush().unwrap();
        tree.close().unwrap();
    }

    // Tear the second batch's commit entry in half.
    truncate_tree_log(dir.path(), 20);

    let tree = open_tree(&dir, 256);
    assert_eq!(tree.ts(), 8);
    for i in 0..8u64 {
        let (value, ts, _) = tree.get(format!("k{i:02}").as_bytes()).unwrap();
        assert_eq!(value, b"one");
        assert_eq!(ts, i + 1);
    }
    for i in 8..16u64 {
        assert!(matches!(
            tree.get(format!("k{i:02}").as_bytes()),
            Err(TreeError::KeyNotFound)
        ));
    }

    // The recovered tree accepts new writes.
    tree.insert(entry("k99", "new", 50)).unwrap();
    tree.flush().unwrap();
    assert_eq!(tree.get(b"k99").unwrap().0, b"new");
}

#[test]
fn test_recovery_missing_commit_entry() {
    let dir = TempDir::new().unwrap();
    {
        let tree = open_tree(&dir, 256);
        tree.insert(entry("a", "first", 1)).unwrap();
        tree.flush_reset().unwrap();
        tree.insert(entry("b", "second", 2)).unwrap();
        tree.flush().unwrap();
        tree.close().unwrap();
    }

    // Drop exactly the second commit entry: the batch's pages survive
    // in the log but are unreachable.
    truncate_tree_log(dir.path(), 42);

    let tree = open_tree(&dir, 256);
    assert_eq!(tree.ts(), 1);
    assert_eq!(tree.get(b"a").unwrap().0, b"first");
    assert!(matches!(tree.get(b"b"), Err(TreeError::KeyNotFound)));
}

#[test]
fn test_recovery_torn_page() {
    let dir = TempDir::new().unwrap();
    {
        let tree = open_tree(&dir, 256);
        tree.insert(entry("a", "first", 1)).unwrap();
        tree.flush_reset().unwrap();
        tree.insert(entry("b", "second", 2)).unwrap();
        tree.flush().unwrap();
        tree.close().unwrap();
    }

    // Cut into the second batch's page data.
    truncate_tree_log(dir.path(), 42 + 100);

    let tree = open_tree(&dir, 256);
    assert_eq!(tree.ts(), 1);
    assert_eq!(tree.get(b"a").unwrap().0, b"first");
    assert!(matches!(tree.get(b"b"), Err(TreeError::KeyNotFound)));
}

#[test]
fn test_unflushed_batch_is_lost() {
    let dir = TempDir::new().unwrap();
    {
        let tree = open_tree(&dir, 4096);
        tree.insert(entry("gone", "1", 1)).unwrap();
        // No flush: the process dies here.
    }

    let tree = open_tree(&dir, 4096);
    assert!(matches!(tree.get(b"gone"), Err(TreeError::KeyNotFound)));
    assert_eq!(tree.ts(), 0);
}

#[test]
fn test_snapshot_isolation() {
    let dir = TempDir::new().unwrap();
    let tree = open_tree(&dir, 4096);

    tree.insert(entry("old", "1", 1)).unwrap();
    tree.flush().unwrap();

    let snap = tree.read_snapshot().unwrap();
    assert_eq!(snap.ts(), 1);

    tree.insert(entry("new", "2", 2)).unwrap();
    tree.flush().unwrap();

    // The snapshot still sees the world as of its anchor.
    assert_eq!(snap.get(b"old").unwrap().0, b"1");
    assert!(matches!(snap.get(b"new"), Err(TreeError::KeyNotFound)));

    // The tree itself sees the insert.
    assert_eq!(tree.get(b"new").unwrap().0, b"2");
    drop(snap);
}

#[test]
fn test_write_snapshot_blocks_writers() {
    let dir = TempDir::new().unwrap();
    let tree = open_tree(&dir, 4096);
    tree.insert(entry("k", "v", 1)).unwrap();

    let snap = tree.write_snapshot().unwrap();
    assert!(matches!(
        tree.insert(entry("k2", "v", 2)),
        Err(TreeError::TreeLocked)
    ));
    assert!(matches!(tree.advance(5, 0), Err(TreeError::TreeLocked)));
    assert_eq!(snap.get(b"k").unwrap().0, b"v");
    drop(snap);

    tree.insert(entry("k2", "v", 2)).unwrap();
}

#[test]
fn test_active_snapshots_block_close() {
    let dir = TempDir::new().unwrap();
    let tree = open_tree(&dir, 4096);
    tree.insert(entry("k", "v", 1)).unwrap();
    tree.flush().unwrap();

    let snap = tree.read_snapshot().unwrap();
    assert_eq!(tree.active_snapshots(), 1);
    assert!(matches!(tree.close(), Err(TreeError::ActiveSnapshots)));

    drop(snap);
    assert_eq!(tree.active_snapshots(), 0);
    tree.close().unwrap();
    assert!(matches!(tree.get(b"k"), Err(TreeError::AlreadyClosed)));
}

#[test]
fn test_max_active_snapshots() {
    let dir = TempDir::new().unwrap();
    let opts = tree_opts(4096).with_max_active_snapshots(2);
    let tree = Tree::open(dir.path(), opts).unwrap();

    tree.insert(entry("k", "v", 1)).unwrap();
    tree.flush().unwrap();

    let _s1 = tree.read_snapshot().unwrap();
    let _s2 = tree.read_snapshot().unwrap();
    assert!(matches!(
        tree.read_snapshot(),
        Err(TreeError::MaxActiveSnapshots)
    ));
}

#[test]
fn test_advance() {
    let dir = TempDir::new().unwrap();
    let tree = open_tree(&dir, 4096);

    tree.insert(entry("k", "v", 3)).unwrap();
    tree.advance(10, 7).unwrap();
    assert_eq!(tree.ts(), 10);
    assert_eq!(tree.indexed_entry_count(), 7);

    // No-op on equal, error on older.
    tree.advance(10, 9).unwrap();
    assert_eq!(tree.indexed_entry_count(), 7);
    assert!(matches!(
        tree.advance(9, 0),
        Err(TreeError::InvalidTimestamp(_))
    ));

    // Inserts continue from the advanced timestamp.
    assert!(matches!(
        tree.insert(entry("k2", "v", 9)),
        Err(TreeError::InvalidTimestamp(_))
    ));
    tree.insert(entry("k2", "v", 10)).unwrap();
}

#[test]
fn test_get_with_prefix() {
    let dir = TempDir::new().unwrap();
    let tree = open_tree(&dir, 4096);

    tree.insert(entry("app/1", "a", 1)).unwrap();
    tree.insert(entry("app/2", "b", 2)).unwrap();
    tree.insert(entry("base/1", "c", 3)).unwrap();

    let (key, value, _, _) = tree.get_with_prefix(b"app/", b"").unwrap();
    assert_eq!((key.as_slice(), value.as_slice()), (b"app/1".as_slice(), b"a".as_slice()));

    // "next after" form: skip an exact key.
    let (key, _, _, _) = tree.get_with_prefix(b"app/", b"app/1").unwrap();
    assert_eq!(key, b"app/2");

    assert!(matches!(
        tree.get_with_prefix(b"zzz/", b""),
        Err(TreeError::KeyNotFound)
    ));
}

#[test]
fn test_snapshot_at_ts() {
    let dir = TempDir::new().unwrap();
    let tree = open_tree(&dir, 4096);
    let cancel = CancelToken::new();

    tree.insert(entry("k", "v1", 5)).unwrap();

    // The persisted state is older than ts=5, so the call flushes.
    let snap = tree.snapshot_must_include_ts(&cancel, 5).unwrap();
    assert_eq!(snap.ts(), 5);
    assert_eq!(snap.get(b"k").unwrap().0, b"v1");
    drop(snap);

    // Beyond the root timestamp nothing can be promised.
    assert!(matches!(
        tree.snapshot_at_ts(&cancel, 99),
        Err(TreeError::StaleRootTimestamp { .. })
    ));

    // ts == 0 anchors at the latest persisted timestamp.
    let snap = tree.snapshot_at_ts(&cancel, 0).unwrap();
    assert_eq!(snap.ts(), 5);
    drop(snap);

    let cancelled = CancelToken::new();
    cancelled.cancel();
    assert!(matches!(
        tree.snapshot_at_ts(&cancelled, 5),
        Err(TreeError::Cancelled)
    ));
}

#[test]
fn test_insert_validation() {
    let dir = TempDir::new().unwrap();
    let tree = open_tree(&dir, 4096);

    assert!(matches!(
        tree.insert(entry("k", "v", 0)),
        Err(TreeError::InvalidTimestamp(_))
    ));
    assert!(matches!(
        tree.insert(Entry::new(Vec::new(), b"v".to_vec(), 1)),
        Err(TreeError::IllegalArguments(_))
    ));

    let oversized = vec![b'x'; 4096 / 2 + 1];
    assert!(matches!(
        tree.insert(Entry::new(b"k".to_vec(), oversized, 1)),
        Err(TreeError::MaxEntrySizeExceeded { .. })
    ));

    tree.insert(entry("k", "v", 5)).unwrap();
    assert!(matches!(
        tree.insert(entry("k2", "v", 4)),
        Err(TreeError::InvalidTimestamp(_))
    ));
}

#[test]
fn test_flush_reset_then_read_from_disk() {
    let dir = TempDir::new().unwrap();
    let tree = open_tree(&dir, 256);

    for i in 0..24u64 {
        tree.insert(entry(&format!("k{i:02}"), "v", i + 1)).unwrap();
    }
    tree.flush_reset().unwrap();

    // Every page now comes from the tree log through the page cache.
    for i in 0..24u64 {
        assert_eq!(tree.get(format!("k{i:02}").as_bytes()).unwrap().0, b"v");
    }

    // And the tree keeps accepting writes afterwards.
    tree.insert(entry("k00", "w", 40)).unwrap();
    let (value, ts, hc) = tree.get(b"k00").unwrap();
    assert_eq!((value.as_slice(), ts, hc), (b"w".as_slice(), 40, 1));
}

#[test]
fn test_replacements_across_flushes_extend_history() {
    let dir = TempDir::new().unwrap();
    let tree = open_tree(&dir, 4096);

    for ts in 1..=6u64 {
        tree.insert(entry("k", &format!("v{ts}"), ts)).unwrap();
        if ts % 2 == 0 {
            tree.flush_reset().unwrap();
        }
    }
    tree.flush().unwrap();

    let (value, ts, hc) = tree.get(b"k").unwrap();
    assert_eq!((value.as_slice(), ts, hc), (b"v6".as_slice(), 6, 5));
    for version in 1..=6u64 {
        let (value, ts) = tree.get_revision(b"k", version).unwrap();
        assert_eq!(value, format!("v{version}").as_bytes());
        assert_eq!(ts, version);
    }
}

#[test]
fn test_concurrent_reads_during_writes() {
    let dir = TempDir::new().unwrap();
    let tree = Arc::new(open_tree(&dir, 4096));

    const KEYS: u64 = 100;
    const WRITES: u64 = 2_000;

    for i in 0..KEYS {
        tree.insert(entry(&format!("k{i}"), "0", i + 1)).unwrap();
    }
    tree.flush().unwrap();

    let done = Arc::new(AtomicBool::new(false));

    std::thread::scope(|scope| {
        let mut readers = Vec::new();
        for _ in 0..8usize {
            let tree = Arc::clone(&tree);
            let done = Arc::clone(&done);
            readers.push(scope.spawn(move || {
                let mut rng = rand::thread_rng();
                let mut last_seen = vec![0u64; KEYS as usize];
                while !done.load(Ordering::Acquire) {
                    let i = rng.gen_range(0..KEYS) as usize;
                    let key = format!("k{i}");
                    let (_, ts, _) = tree.get(key.as_bytes()).unwrap();
                    assert!(
                        ts >= last_seen[i],
                        "timestamp of {key} went backward: {} -> {ts}",
                        last_seen[i]
                    );
                    last_seen[i] = ts;
                    // Leave the lock free often enough for the
                    // try-locking writer to make progress.
                    std::thread::sleep(std::time::Duration::from_micros(100));
                }
            }));
        }

        let writer_tree = Arc::clone(&tree);
        let writer_done = Arc::clone(&done);
        let writer = scope.spawn(move || {
            let mut ts = KEYS;
            for n in 0..WRITES {
                ts += 1;
                let key = format!("k{}", n % KEYS);
                let e = Entry::new(key.into_bytes(), ts.to_string().into_bytes(), ts);
                loop {
                    match writer_tree.insert(e.clone()) {
                        Ok(()) => break,
                        Err(TreeError::TreeLocked) => std::thread::yield_now(),
                        Err(err) => panic!("writer failed: {err}"),
                    }
                }
                if n % 500 == 0 {
                    let _ = writer_tree.try_flush();
                }
            }
            writer_done.store(true, Ordering::Release);
        });

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    });

    assert_eq!(tree.ts(), KEYS + WRITES);
    tree.flush().unwrap();
    tree.close().unwrap();
}
