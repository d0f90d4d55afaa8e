use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use ma_media_core::cache::{
    flush_on_shutdown, read_through, ByteRange, CachedSource, SpanCache, SpanKey,
};
use ma_media_core::config::{CacheConfig, DEFAULT_CACHE_BUDGET_BYTES};
use ma_media_core::source::MediaSource;
use ma_media_core::CacheError;

fn pattern(range: ByteRange) -> Vec<u8> {
    (range.start..range.end).map(|i| (i % 251) as u8).collect()
}

fn put(cache: &SpanCache, key: &SpanKey, start: u64, end: u64) {
    let range = ByteRange::new(start, end);
    cache.write(key, range, &pattern(range)).unwrap();
}

fn span_file(root: &Path, key: &SpanKey, start: u64) -> PathBuf {
    root.join("spans")
        .join(key.storage_name())
        .join(format!("{:020}.span", start))
}

/// Serves a deterministic byte pattern and records every fetch.
#[derive(Default)]
struct CountingSource {
    fetches: Mutex<Vec<ByteRange>>,
    fetched_bytes: AtomicU64,
}

impl CountingSource {
    fn fetches(&self) -> Vec<ByteRange> {
        self.fetches.lock().clone()
    }
}

#[async_trait]
impl MediaSource for CountingSource {
    async fn fetch_range(&self, range: ByteRange) -> anyhow::Result<Bytes> {
        self.fetches.lock().push(range);
        self.fetched_bytes.fetch_add(range.len(), Ordering::Relaxed);
        Ok(Bytes::from(pattern(range)))
    }
}

#[test]
fn test_lru_evicts_other_key() {
    let dir = tempfile::tempdir().unwrap();
    let cache = SpanCache::open(dir.path(), 100).unwrap();
    let a = SpanKey::new("https://cdn.example.com/a.mp3");
    let b = SpanKey::new("https://cdn.example.com/b.mp3");

    put(&cache, &a, 0, 60);
    let range = ByteRange::new(0, 60);
    let outcome = cache.write(&b, range, &pattern(range)).unwrap();

    assert_eq!(outcome.stored_bytes, 60);
    assert_eq!(outcome.evicted.len(), 1);
    assert_eq!(outcome.evicted[0].key, a);
    assert_eq!(cache.total_bytes(), 60);
    assert_eq!(cache.keys(), vec![b.clone()]);
    assert!(cache.spans(&a).is_empty());
    assert!(!span_file(dir.path(), &a, 0).exists());

    let plan = cache.read(&a, ByteRange::new(0, 60));
    assert!(plan.hits.is_empty());
    assert_eq!(plan.misses, vec![ByteRange::new(0, 60)]);
}

#[test]
fn test_read_refreshes_recency() {
    let dir = tempfile::tempdir().unwrap();
    let cache = SpanCache::open(dir.path(), 100).unwrap();
    let a = SpanKey::new("a");
    let b = SpanKey::new("b");
    let c = SpanKey::new("c");

    put(&cache, &a, 0, 40);
    put(&cache, &b, 0, 40);

    // Touch A so that B becomes the least recently used span.
    let plan = cache.read(&a, ByteRange::new(10, 20));
    assert_eq!(plan.hits.len(), 1);
    assert!(plan.is_complete());

    let range = ByteRange::new(0, 40);
    let outcome = cache.write(&c, range, &pattern(range)).unwrap();
    assert_eq!(outcome.evicted.len(), 1);
    assert_eq!(outcome.evicted[0].key, b);
    assert_eq!(cache.keys(), vec![a, c]);
    assert_eq!(cache.total_bytes(), 80);
}

#[test]
fn test_budget_and_disjointness_hold_over_many_writes() {
    let dir = tempfile::tempdir().unwrap();
    let cache = SpanCache::open(dir.path(), 1_000).unwrap();
    let keys: Vec<SpanKey> = (0..5).map(|i| SpanKey::new(format!("track-{}", i))).collect();

    for step in 0..60u64 {
        let key = &keys[(step % 5) as usize];
        let start = (step * 37) % 700;
        let end = start + 40 + (step * 13) % 200;
        put(&cache, key, start, end);

        if step % 4 == 0 {
            cache.read(&keys[((step + 2) % 5) as usize], ByteRange::new(0, 900));
        }

        assert!(cache.total_bytes() <= 1_000, "over budget at step {}", step);

        let mut sum = 0;
        for key in &keys {
            let spans = cache.spans(key);
            for pair in spans.windows(2) {
                assert!(pair[0].end() <= pair[1].start, "overlap in {}", key);
            }
            sum += spans.iter().map(|s| s.length).sum::<u64>();
        }
        assert_eq!(sum, cache.total_bytes());
    }
}

#[test]
fn test_write_never_evicts_inside_its_own_range() {
    let dir = tempfile::tempdir().unwrap();
    let cache = SpanCache::open(dir.path(), 100).unwrap();
    let a = SpanKey::new("a");
    let b = SpanKey::new("b");

    put(&cache, &a, 40, 60);
    put(&cache, &b, 0, 20);

    let range = ByteRange::new(0, 100);
    let outcome = cache.write(&a, range, &pattern(range)).unwrap();
    assert_eq!(outcome.stored_bytes, 80);
    assert_eq!(outcome.evicted.len(), 1);
    assert_eq!(outcome.evicted[0].key, b);

    let plan = cache.read(&a, range);
    assert!(plan.is_complete(), "hole left in {:?}", plan.misses);
    assert!(cache.spans(&b).is_empty());
    assert_eq!(cache.total_bytes(), 100);
}

#[test]
fn test_fully_cached_write_refreshes_recency() {
    let dir = tempfile::tempdir().unwrap();
    let cache = SpanCache::open(dir.path(), 100).unwrap();
    let a = SpanKey::new("a");
    let b = SpanKey::new("b");

    put(&cache, &a, 0, 40);
    put(&cache, &b, 0, 40);
    // Rewriting cached bytes of A makes B the oldest.
    let range = ByteRange::new(0, 40);
    assert_eq!(cache.write(&a, range, &pattern(range)).unwrap().stored_bytes, 0);

    let outcome = cache.write(&SpanKey::new("c"), range, &pattern(range)).unwrap();
    assert_eq!(outcome.evicted.len(), 1);
    assert_eq!(outcome.evicted[0].key, b);
}

#[test]
fn test_concurrent_access_keeps_accounting() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(SpanCache::open(dir.path(), 2_000).unwrap());
    let keys: Vec<SpanKey> = (0..4).map(|i| SpanKey::new(format!("shared-{}", i))).collect();

    let workers: Vec<_> = (0..6u64)
        .map(|worker| {
            let cache = cache.clone();
            let keys = keys.clone();
            std::thread::spawn(move || {
                for step in 0..80u64 {
                    let key = &keys[((worker + step) % 4) as usize];
                    let start = (worker * 131 + step * 53) % 1_500;
                    let range = ByteRange::new(start, start + 30 + (step * 17) % 250);
                    cache.write(key, range, &pattern(range)).unwrap();

                    let plan = cache.read(key, ByteRange::new(0, 1_800));
                    for span in plan.hits.iter().take(2) {
                        // Another thread may have evicted it in between.
                        let _ = cache.read_span(span).unwrap();
                    }
                    if step % 25 == worker {
                        cache.invalidate(key).unwrap();
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert!(cache.total_bytes() <= 2_000);
    let mut sum = 0;
    for key in &keys {
        let spans = cache.spans(key);
        for pair in spans.windows(2) {
            assert!(pair[0].end() <= pair[1].start, "overlap in {}", key);
        }
        for span in &spans {
            let data = cache.read_span(span).unwrap().unwrap();
            assert_eq!(&data[..], &pattern(span.range())[..]);
        }
        sum += spans.iter().map(|s| s.length).sum::<u64>();
    }
    assert_eq!(sum, cache.total_bytes());
}

#[test]
fn test_overlapping_write_stores_only_gaps() {
    let dir = tempfile::tempdir().unwrap();
    let cache = SpanCache::open(dir.path(), 1_000).unwrap();
    let key = SpanKey::new("movie");

    put(&cache, &key, 0, 50);
    let range = ByteRange::new(25, 100);
    let outcome = cache.write(&key, range, &pattern(range)).unwrap();
    assert_eq!(outcome.stored_bytes, 50);

    let spans = cache.spans(&key);
    let ranges: Vec<ByteRange> = spans.iter().map(|s| s.range()).collect();
    assert_eq!(ranges, vec![ByteRange::new(0, 50), ByteRange::new(50, 100)]);
    assert_eq!(cache.total_bytes(), 100);

    let data = cache.read_span(&spans[1]).unwrap().unwrap();
    assert_eq!(&data[..], &pattern(ByteRange::new(50, 100))[..]);

    // Fully cached range stores nothing.
    let again = ByteRange::new(10, 90);
    assert_eq!(cache.write(&key, again, &pattern(again)).unwrap().stored_bytes, 0);
}

#[test]
fn test_index_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let a = SpanKey::new("a");
    let b = SpanKey::new("b");

    let (spans_a, spans_b, total) = {
        let cache = SpanCache::open(dir.path(), 500).unwrap();
        put(&cache, &a, 0, 100);
        put(&cache, &a, 200, 260);
        put(&cache, &b, 10, 90);
        cache.read(&a, ByteRange::new(0, 10));
        let snapshot = (cache.spans(&a), cache.spans(&b), cache.total_bytes());
        cache.close().unwrap();
        snapshot
    };

    let cache = SpanCache::open(dir.path(), 500).unwrap();
    assert_eq!(cache.spans(&a), spans_a);
    assert_eq!(cache.spans(&b), spans_b);
    assert_eq!(cache.total_bytes(), total);
    assert_eq!(total, 240);

    let data = cache.read_span(&spans_a[1]).unwrap().unwrap();
    assert_eq!(&data[..], &pattern(ByteRange::new(200, 260))[..]);
}

#[test]
fn test_drop_flushes_recency() {
    let dir = tempfile::tempdir().unwrap();
    let a = SpanKey::new("a");
    let b = SpanKey::new("b");

    {
        let cache = SpanCache::open(dir.path(), 100).unwrap();
        put(&cache, &a, 0, 40);
        put(&cache, &b, 0, 40);
        cache.read(&a, ByteRange::new(0, 40));
    }

    let cache = SpanCache::open(dir.path(), 100).unwrap();
    let c = SpanKey::new("c");
    let range = ByteRange::new(0, 40);
    let outcome = cache.write(&c, range, &pattern(range)).unwrap();
    assert_eq!(outcome.evicted[0].key, b);
}

#[test]
fn test_invalidate_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let cache = SpanCache::open(dir.path(), 1_000).unwrap();
    let key = SpanKey::new("stale");
    let other = SpanKey::new("fresh");

    put(&cache, &key, 0, 30);
    put(&cache, &key, 100, 140);
    put(&cache, &other, 0, 10);

    assert_eq!(cache.invalidate(&key).unwrap(), 70);
    assert_eq!(cache.invalidate(&key).unwrap(), 0);
    assert!(cache.spans(&key).is_empty());
    assert_eq!(cache.total_bytes(), 10);
    assert!(!dir.path().join("spans").join(key.storage_name()).exists());
    assert_eq!(cache.invalidate(&SpanKey::new("never-seen")).unwrap(), 0);
}

#[test]
fn test_oversized_span_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let cache = SpanCache::open(dir.path(), 100).unwrap();
    let key = SpanKey::new("big");
    put(&cache, &key, 0, 50);

    let range = ByteRange::new(0, 101);
    let err = cache.write(&key, range, &pattern(range)).unwrap_err();
    assert!(matches!(
        err,
        CacheError::CapacityExceeded { length: 101, budget: 100 }
    ));
    assert_eq!(cache.total_bytes(), 50);

    // A span equal to the budget is fine and displaces everything else.
    let range = ByteRange::new(200, 300);
    let outcome = cache.write(&key, range, &pattern(range)).unwrap();
    assert_eq!(outcome.evicted.len(), 1);
    assert_eq!(cache.total_bytes(), 100);
}

#[test]
fn test_length_mismatch_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let cache = SpanCache::open(dir.path(), 100).unwrap();
    let err = cache
        .write(&SpanKey::new("k"), ByteRange::new(0, 10), &[0u8; 9])
        .unwrap_err();
    assert!(matches!(err, CacheError::LengthMismatch { expected: 10, actual: 9 }));
    assert_eq!(cache.total_bytes(), 0);
}

#[test]
fn test_write_failure_leaves_index_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let cache = SpanCache::open(dir.path(), 1_000).unwrap();
    let good = SpanKey::new("good");
    let bad = SpanKey::new("bad");
    put(&cache, &good, 0, 20);

    // A regular file where the key's span directory should go.
    fs::write(dir.path().join("spans").join(bad.storage_name()), b"x").unwrap();

    let range = ByteRange::new(0, 50);
    let err = cache.write(&bad, range, &pattern(range)).unwrap_err();
    assert!(matches!(err, CacheError::WriteFailed { start: 0, end: 50, .. }));
    assert!(cache.spans(&bad).is_empty());
    assert_eq!(cache.total_bytes(), 20);

    let plan = cache.read(&bad, range);
    assert_eq!(plan.misses, vec![range]);
    cache.close().unwrap();

    let cache = SpanCache::open(dir.path(), 1_000).unwrap();
    assert_eq!(cache.total_bytes(), 20);
    assert_eq!(cache.keys(), vec![good]);
}

#[test]
fn test_corrupt_index_rebuilds_empty() {
    let dir = tempfile::tempdir().unwrap();
    let key = SpanKey::new("k");
    {
        let cache = SpanCache::open(dir.path(), 1_000).unwrap();
        put(&cache, &key, 0, 100);
        cache.close().unwrap();
    }
    assert!(span_file(dir.path(), &key, 0).exists());

    fs::write(dir.path().join("index.json"), b"{\"version\": 1, \"keys\": [").unwrap();

    let cache = SpanCache::open(dir.path(), 1_000).unwrap();
    assert_eq!(cache.total_bytes(), 0);
    assert!(cache.keys().is_empty());
    assert!(!span_file(dir.path(), &key, 0).exists());

    // The rebuilt cache is usable.
    put(&cache, &key, 0, 10);
    assert_eq!(cache.total_bytes(), 10);
}

#[test]
fn test_misreported_total_rejected() {
    let dir = tempfile::tempdir().unwrap();
    {
        let cache = SpanCache::open(dir.path(), 1_000).unwrap();
        put(&cache, &SpanKey::new("k"), 0, 100);
        cache.close().unwrap();
    }

    let path = dir.path().join("index.json");
    let mut index: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
    index["total_bytes"] = serde_json::json!(40);
    fs::write(&path, serde_json::to_vec(&index).unwrap()).unwrap();

    let cache = SpanCache::open(dir.path(), 1_000).unwrap();
    assert_eq!(cache.total_bytes(), 0);
}

#[test]
fn test_missing_span_file_dropped_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let key = SpanKey::new("k");
    {
        let cache = SpanCache::open(dir.path(), 1_000).unwrap();
        put(&cache, &key, 0, 100);
        put(&cache, &key, 300, 350);
        cache.close().unwrap();
    }

    fs::remove_file(span_file(dir.path(), &key, 300)).unwrap();

    let cache = SpanCache::open(dir.path(), 1_000).unwrap();
    let ranges: Vec<ByteRange> = cache.spans(&key).iter().map(|s| s.range()).collect();
    assert_eq!(ranges, vec![ByteRange::new(0, 100)]);
    assert_eq!(cache.total_bytes(), 100);
}

#[test]
fn test_orphan_files_swept_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let key = SpanKey::new("k");
    {
        let cache = SpanCache::open(dir.path(), 1_000).unwrap();
        put(&cache, &key, 0, 10);
        cache.close().unwrap();
    }

    let orphan = span_file(dir.path(), &key, 500);
    fs::write(&orphan, [0u8; 5]).unwrap();
    let stray_dir = dir.path().join("spans").join("0123456789abcdef0123456789abcdef");
    fs::create_dir_all(&stray_dir).unwrap();
    fs::write(stray_dir.join(format!("{:020}.span", 0)), [0u8; 5]).unwrap();

    let cache = SpanCache::open(dir.path(), 1_000).unwrap();
    assert!(!orphan.exists());
    assert!(!stray_dir.exists());
    assert!(span_file(dir.path(), &key, 0).exists());
    assert_eq!(cache.total_bytes(), 10);
}

#[test]
fn test_reduced_budget_evicts_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let a = SpanKey::new("a");
    let b = SpanKey::new("b");
    {
        let cache = SpanCache::open(dir.path(), 100).unwrap();
        put(&cache, &a, 0, 40);
        put(&cache, &b, 0, 40);
        cache.close().unwrap();
    }

    let cache = SpanCache::open(dir.path(), 50).unwrap();
    assert_eq!(cache.byte_budget(), 50);
    assert_eq!(cache.total_bytes(), 40);
    assert_eq!(cache.keys(), vec![b]);
    assert!(!span_file(dir.path(), &a, 0).exists());
}

#[test]
fn test_open_unwritable_storage() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("not-a-dir");
    fs::write(&blocker, b"file").unwrap();

    let err = SpanCache::open(&blocker, 100).err().unwrap();
    assert!(matches!(err, CacheError::StorageUnavailable { .. }));
}

#[test]
fn test_stats_track_hits_and_evictions() {
    let dir = tempfile::tempdir().unwrap();
    let cache = SpanCache::open(dir.path(), 100).unwrap();
    let a = SpanKey::new("a");

    put(&cache, &a, 0, 60);
    cache.read(&a, ByteRange::new(30, 90));
    put(&cache, &SpanKey::new("b"), 0, 60);

    let stats = cache.stats();
    assert_eq!(stats.hit_bytes, 30);
    assert_eq!(stats.miss_bytes, 30);
    assert_eq!(stats.written_bytes, 120);
    assert_eq!(stats.evicted_spans, 1);
    assert_eq!(stats.evicted_bytes, 60);
    assert_eq!(stats.total_bytes, 60);
    assert_eq!(stats.key_count, 1);
    assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_read_through_fetches_only_gaps() {
    let dir = tempfile::tempdir().unwrap();
    let cache = SpanCache::open(dir.path(), 10_000).unwrap();
    let source = CountingSource::default();
    let key = SpanKey::from_address("HTTPS://Media.Example.com/song.mp3#t=10");

    let first = read_through(&cache, &source, &key, ByteRange::new(100, 300)).await.unwrap();
    assert_eq!(&first[..], &pattern(ByteRange::new(100, 300))[..]);
    assert_eq!(source.fetches(), vec![ByteRange::new(100, 300)]);

    let second = read_through(&cache, &source, &key, ByteRange::new(0, 400)).await.unwrap();
    assert_eq!(&second[..], &pattern(ByteRange::new(0, 400))[..]);
    assert_eq!(
        source.fetches()[1..],
        [ByteRange::new(0, 100), ByteRange::new(300, 400)]
    );

    let third = read_through(&cache, &source, &key, ByteRange::new(50, 350)).await.unwrap();
    assert_eq!(&third[..], &pattern(ByteRange::new(50, 350))[..]);
    assert_eq!(source.fetches().len(), 3);
    assert_eq!(source.fetched_bytes.load(Ordering::Relaxed), 400);
}

#[tokio::test]
async fn test_damaged_span_is_dropped_and_refetched() {
    let dir = tempfile::tempdir().unwrap();
    let cache = SpanCache::open(dir.path(), 1_000).unwrap();
    let source = CountingSource::default();
    let key = SpanKey::new("k");

    put(&cache, &key, 0, 50);
    fs::write(span_file(dir.path(), &key, 0), [0u8; 5]).unwrap();

    let span = cache.spans(&key)[0].clone();
    assert!(matches!(
        cache.read_span(&span),
        Err(CacheError::ReadFailed { start: 0, end: 50, .. })
    ));
    assert!(cache.spans(&key).is_empty());
    assert_eq!(cache.total_bytes(), 0);

    put(&cache, &key, 0, 50);
    fs::write(span_file(dir.path(), &key, 0), [0u8; 5]).unwrap();

    for _ in 0..2 {
        let data = read_through(&cache, &source, &key, ByteRange::new(0, 50)).await.unwrap();
        assert_eq!(&data[..], &pattern(ByteRange::new(0, 50))[..]);
    }
    // Refetched once, then served from the rewritten span.
    assert_eq!(source.fetches(), vec![ByteRange::new(0, 50)]);
    assert_eq!(cache.total_bytes(), 50);
}

#[tokio::test]
async fn test_cached_source_decorates_inner() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(SpanCache::open(dir.path(), 10_000).unwrap());
    let inner = Arc::new(CountingSource::default());
    let key = SpanKey::new("clip");
    let cached = CachedSource::new(inner.clone(), cache.clone(), key.clone());

    let data = cached.fetch_range(ByteRange::new(0, 64)).await.unwrap();
    assert_eq!(data.len(), 64);
    let again = cached.fetch_range(ByteRange::new(0, 64)).await.unwrap();
    assert_eq!(data, again);

    assert_eq!(inner.fetches().len(), 1);
    assert_eq!(cache.spans(&key).len(), 1);
}

#[tokio::test]
async fn test_open_from_config_with_shutdown_hook() {
    ma_media_core::logging::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let config: CacheConfig = serde_json::from_value(serde_json::json!({
        "storage_dir": dir.path(),
    }))
    .unwrap();
    assert_eq!(config.byte_budget, DEFAULT_CACHE_BUDGET_BYTES);

    let cache = Arc::new(SpanCache::with_config(&config).unwrap());
    assert_eq!(cache.storage_dir(), dir.path());
    let hook = flush_on_shutdown(&cache);

    put(&cache, &SpanKey::new("k"), 0, 10);
    cache.read(&SpanKey::new("k"), ByteRange::new(0, 10));
    cache.flush().unwrap();
    hook.abort();

    let cache = Arc::try_unwrap(cache).ok().unwrap();
    cache.close().unwrap();
    let reopened = SpanCache::with_config(&config).unwrap();
    assert_eq!(reopened.total_bytes(), 10);
}
