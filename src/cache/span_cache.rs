// Bounded persistent span cache: index, span files and eviction under one lock.

use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::disk::SpanFiles;
use super::index::CacheIndex;
use super::persist::{self, Loaded};
use super::span::{ByteRange, ReadPlan, Span, SpanKey};
use super::stats::{CacheStatsSnapshot, Occupancy, StatsCollector};
use crate::config::{CacheConfig, INDEX_FILE_NAME, SPANS_DIR_NAME};
use crate::error::CacheError;

struct State {
    index: CacheIndex,
    /// Recency changed since the last flush.
    dirty: bool,
    closed: bool,
}

/// What a successful [`SpanCache::write`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Bytes newly stored; parts of the span already cached are skipped.
    pub stored_bytes: u64,
    /// Spans evicted to make room, in eviction order.
    pub evicted: Vec<Span>,
}

pub struct SpanCache {
    root: PathBuf,
    index_path: PathBuf,
    files: SpanFiles,
    state: Mutex<State>,
    stats: StatsCollector,
}

impl SpanCache {
    /// Open the cache rooted at `storage_dir`, creating it if needed.
    ///
    /// A missing index starts an empty cache. A corrupt index is discarded
    /// together with every span file. Spans whose files are missing or have
    /// the wrong size are dropped, unreferenced files are deleted, and the
    /// cache is trimmed if `byte_budget` shrank since the last run.
    pub fn open(storage_dir: impl AsRef<Path>, byte_budget: u64) -> Result<Self, CacheError> {
        let root = storage_dir.as_ref().to_path_buf();
        let spans_dir = root.join(SPANS_DIR_NAME);
        let unavailable = |source: std::io::Error| CacheError::StorageUnavailable {
            path: root.clone(),
            source,
        };

        fs::create_dir_all(&spans_dir).map_err(unavailable)?;
        probe_writable(&root).map_err(unavailable)?;

        let index_path = root.join(INDEX_FILE_NAME);
        let files = SpanFiles::new(spans_dir);

        let mut needs_save = false;
        let mut index = match persist::load(&index_path, byte_budget) {
            Loaded::Index(index) => index,
            Loaded::Missing => CacheIndex::new(byte_budget),
            Loaded::Corrupt(reason) => {
                warn!("discarding corrupt cache index at {}: {}", index_path.display(), reason);
                files.reset().map_err(unavailable)?;
                needs_save = true;
                CacheIndex::new(byte_budget)
            }
        };

        for span in index.all_spans() {
            if files.stored_len(&span.key, span.start) != Some(span.length) {
                warn!(
                    "dropping span {} of {}: file missing or wrong size",
                    span.range(),
                    span.key
                );
                index.remove(&span.key, span.start);
                needs_save = true;
            }
        }

        let evicted = index.evict_to_budget(None);
        if !evicted.is_empty() {
            info!(
                "evicted {} spans to fit reduced budget of {} bytes",
                evicted.len(),
                byte_budget
            );
            needs_save = true;
        }

        let mut live: HashMap<String, HashSet<u64>> = HashMap::new();
        for span in index.all_spans() {
            live.entry(span.key.storage_name())
                .or_default()
                .insert(span.start);
        }
        if let Err(e) = files.sweep(&live) {
            warn!("failed to sweep orphaned span files: {}", e);
        }

        if needs_save {
            persist::save(&index_path, &index).map_err(unavailable)?;
        }

        info!(
            "span cache opened dir={} spans={} bytes={} budget={}",
            root.display(),
            index.span_count(),
            index.total_bytes(),
            byte_budget
        );

        Ok(Self {
            root,
            index_path,
            files,
            state: Mutex::new(State {
                index,
                dirty: false,
                closed: false,
            }),
            stats: StatsCollector::new(),
        })
    }

    /// Open the cache described by `config`.
    pub fn with_config(config: &CacheConfig) -> Result<Self, CacheError> {
        Self::open(&config.storage_dir, config.byte_budget)
    }

    pub fn storage_dir(&self) -> &Path {
        &self.root
    }

    /// Consult the index for `range` of `key`.
    ///
    /// Never touches span contents. Every span overlapping the range has
    /// its recency bumped.
    pub fn read(&self, key: &SpanKey, range: ByteRange) -> ReadPlan {
        let plan = {
            let mut state = self.state.lock();
            let plan = state.index.plan(key, range);
            if !plan.hits.is_empty() {
                state.dirty = true;
            }
            plan
        };

        let requested = range.len();
        self.stats
            .record_request(requested, requested - plan.missing_bytes());
        debug!(
            "read key={} range={} hits={} misses={}",
            key,
            range,
            plan.hits.len(),
            plan.misses.len()
        );
        plan
    }

    /// Bytes of a cached span, or `None` if it has been evicted or
    /// invalidated since it was returned by [`SpanCache::read`].
    ///
    /// A span whose file cannot be read back is dropped from the index and
    /// its file deleted before `ReadFailed` is returned, so the next read
    /// reports the range as a miss.
    pub fn read_span(&self, span: &Span) -> Result<Option<Bytes>, CacheError> {
        let mut state = self.state.lock();
        if !state.index.contains(span) {
            return Ok(None);
        }
        match self.files.read(&span.key, span.start, span.length) {
            Ok(data) => Ok(Some(data)),
            Err(source) => {
                warn!(
                    "dropping unreadable span key={} range={}: {}",
                    span.key,
                    span.range(),
                    source
                );
                state.index.remove(&span.key, span.start);
                if let Err(e) = self.files.remove(&span.key, span.start) {
                    warn!("failed to delete span {} of {}: {}", span.range(), span.key, e);
                }
                self.persist_locked(&mut state);
                Err(CacheError::ReadFailed {
                    key: span.key.to_string(),
                    start: span.start,
                    end: span.end(),
                    source,
                })
            }
        }
    }

    /// Insert fetched `bytes` covering `range` of `key`.
    ///
    /// Parts of the range already cached are skipped. If the insert pushes
    /// the total over budget, least-recently-used spans of any key are
    /// evicted. Every span inside `range`, old or new, becomes the most
    /// recent, so a write never evicts part of its own range.
    /// On a disk error every file written by this call is removed and the
    /// index is left as it was.
    pub fn write(
        &self,
        key: &SpanKey,
        range: ByteRange,
        bytes: &[u8],
    ) -> Result<WriteOutcome, CacheError> {
        if bytes.len() as u64 != range.len() {
            return Err(CacheError::LengthMismatch {
                expected: range.len(),
                actual: bytes.len() as u64,
            });
        }
        if range.is_empty() {
            return Ok(WriteOutcome::default());
        }

        let mut state = self.state.lock();
        let budget = state.index.budget();
        if range.len() > budget {
            return Err(CacheError::CapacityExceeded {
                length: range.len(),
                budget,
            });
        }

        let gaps = state.index.gaps(key, range);
        let mut written: Vec<ByteRange> = Vec::with_capacity(gaps.len());
        for gap in &gaps {
            let from = (gap.start - range.start) as usize;
            let to = (gap.end - range.start) as usize;
            if let Err(source) = self.files.write(key, gap.start, &bytes[from..to]) {
                for done in &written {
                    if let Err(e) = self.files.remove(key, done.start) {
                        warn!("failed to roll back span {} of {}: {}", done, key, e);
                    }
                }
                warn!("span write failed key={} range={}: {}", key, gap, source);
                return Err(CacheError::WriteFailed {
                    key: key.to_string(),
                    start: gap.start,
                    end: gap.end,
                    source,
                });
            }
            written.push(*gap);
        }

        let rank = state.index.insert(key, range, &written);
        if written.is_empty() {
            // Already cached: only recency changed.
            state.dirty = true;
            return Ok(WriteOutcome::default());
        }

        let evicted = state.index.evict_to_budget(Some(rank));
        for span in &evicted {
            if let Err(e) = self.files.remove(&span.key, span.start) {
                warn!("failed to delete evicted span {} of {}: {}", span.range(), span.key, e);
            }
        }

        let stored_bytes: u64 = written.iter().map(ByteRange::len).sum();
        let evicted_bytes: u64 = evicted.iter().map(|s| s.length).sum();
        self.stats.record_written(stored_bytes);
        if !evicted.is_empty() {
            self.stats.record_evicted(evicted.len() as u64, evicted_bytes);
            debug!(
                "evicted {} spans ({} bytes) for write key={}",
                evicted.len(),
                evicted_bytes,
                key
            );
        }

        self.persist_locked(&mut state);
        debug!(
            "write key={} range={} stored={} total={}",
            key,
            range,
            stored_bytes,
            state.index.total_bytes()
        );

        Ok(WriteOutcome {
            stored_bytes,
            evicted,
        })
    }

    /// Remove every span of `key`. Returns the number of bytes released;
    /// invalidating an unknown key is a no-op.
    pub fn invalidate(&self, key: &SpanKey) -> Result<u64, CacheError> {
        let mut state = self.state.lock();
        let removed = state.index.remove_key(key);
        if removed.is_empty() {
            return Ok(0);
        }
        if let Err(e) = self.files.remove_key(key) {
            warn!("failed to delete span files of {}: {}", key, e);
        }
        self.persist_locked(&mut state);

        let released: u64 = removed.iter().map(|s| s.length).sum();
        info!("invalidated key={} spans={} bytes={}", key, removed.len(), released);
        Ok(released)
    }

    /// Spans currently cached for `key`, in offset order.
    pub fn spans(&self, key: &SpanKey) -> Vec<Span> {
        self.state.lock().index.spans_for(key)
    }

    pub fn keys(&self) -> Vec<SpanKey> {
        let state = self.state.lock();
        let mut keys: Vec<SpanKey> = state.index.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn total_bytes(&self) -> u64 {
        self.state.lock().index.total_bytes()
    }

    pub fn byte_budget(&self) -> u64 {
        self.state.lock().index.budget()
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        let occupancy = {
            let state = self.state.lock();
            Occupancy {
                total_bytes: state.index.total_bytes(),
                byte_budget: state.index.budget(),
                span_count: state.index.span_count(),
                key_count: state.index.key_count(),
            }
        };
        self.stats.snapshot(occupancy)
    }

    /// Write the index to disk if anything changed since the last flush.
    pub fn flush(&self) -> Result<(), CacheError> {
        let mut state = self.state.lock();
        if !state.dirty {
            return Ok(());
        }
        persist::save(&self.index_path, &state.index).map_err(CacheError::Persist)?;
        state.dirty = false;
        Ok(())
    }

    /// Flush the index and release the cache.
    pub fn close(self) -> Result<(), CacheError> {
        self.flush()?;
        self.state.lock().closed = true;
        info!("span cache closed dir={}", self.root.display());
        Ok(())
    }

    /// Structural changes are persisted immediately; a failure leaves the
    /// state dirty so the next flush retries.
    fn persist_locked(&self, state: &mut State) {
        match persist::save(&self.index_path, &state.index) {
            Ok(()) => state.dirty = false,
            Err(e) => {
                warn!("failed to persist cache index: {}", e);
                state.dirty = true;
            }
        }
    }
}

impl Drop for SpanCache {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.closed || !state.dirty {
            return;
        }
        // Best-effort flush on scope exit.
        if let Err(e) = persist::save(&self.index_path, &state.index) {
            warn!("failed to flush cache index on drop: {}", e);
        }
    }
}

fn probe_writable(dir: &Path) -> std::io::Result<()> {
    let probe = dir.join(".write-probe");
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&probe)?;
    fs::remove_file(&probe)
}
