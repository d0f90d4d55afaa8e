// In-memory span index: per-key span maps plus a global recency ordering.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::span::{ByteRange, ReadPlan, Span, SpanKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    length: u64,
    rank: u64,
}

/// Ordering key for eviction: oldest rank first, then smallest span, then
/// key and offset so the order is total and deterministic.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct RecencyKey {
    rank: u64,
    length: u64,
    key: SpanKey,
    start: u64,
}

#[derive(Debug)]
pub(crate) struct CacheIndex {
    budget: u64,
    clock: u64,
    total_bytes: u64,
    spans: HashMap<SpanKey, BTreeMap<u64, Entry>>,
    recency: BTreeSet<RecencyKey>,
}

impl CacheIndex {
    pub fn new(budget: u64) -> Self {
        Self {
            budget,
            clock: 0,
            total_bytes: 0,
            spans: HashMap::new(),
            recency: BTreeSet::new(),
        }
    }

    /// Rebuild an index from persisted spans.
    ///
    /// Rejects zero-length or overlapping spans. The clock is raised past the
    /// highest stored rank so new touches always sort after old ones.
    pub fn restore(budget: u64, clock: u64, spans: Vec<Span>) -> Result<Self, String> {
        let mut index = Self::new(budget);
        let mut max_rank = 0;
        for span in spans {
            if span.length == 0 {
                return Err(format!("zero-length span at {} for {}", span.start, span.key));
            }
            if span.start.checked_add(span.length).is_none() {
                return Err(format!("span at {} for {} overflows", span.start, span.key));
            }
            if index.overlaps(&span.key, span.range()) {
                return Err(format!("overlapping span {} for {}", span.range(), span.key));
            }
            max_rank = max_rank.max(span.last_access);
            index.insert_at(span.key, span.start, span.length, span.last_access);
        }
        index.clock = clock.max(max_rank);
        Ok(index)
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn span_count(&self) -> usize {
        self.recency.len()
    }

    pub fn key_count(&self) -> usize {
        self.spans.len()
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Spans of `key` overlapping `range`, in offset order.
    fn overlapping(&self, key: &SpanKey, range: ByteRange) -> Vec<(u64, Entry)> {
        let Some(map) = self.spans.get(key) else {
            return Vec::new();
        };
        // Spans never overlap, so ends ascend with starts.
        let mut found: Vec<(u64, Entry)> = map
            .range(..range.end)
            .rev()
            .take_while(|(start, entry)| **start + entry.length > range.start)
            .map(|(start, entry)| (*start, *entry))
            .collect();
        found.reverse();
        found
    }

    fn overlaps(&self, key: &SpanKey, range: ByteRange) -> bool {
        !range.is_empty() && !self.overlapping(key, range).is_empty()
    }

    /// Sub-ranges of `range` not covered by spans of `key`.
    pub fn gaps(&self, key: &SpanKey, range: ByteRange) -> Vec<ByteRange> {
        if range.is_empty() {
            return Vec::new();
        }
        let mut gaps = Vec::new();
        let mut cursor = range.start;
        for (start, entry) in self.overlapping(key, range) {
            if start > cursor {
                gaps.push(ByteRange::new(cursor, start));
            }
            cursor = cursor.max(start + entry.length);
        }
        if cursor < range.end {
            gaps.push(ByteRange::new(cursor, range.end));
        }
        gaps
    }

    /// Look up `range` and bump the recency of every span it touches.
    ///
    /// All touched spans share one clock value, so a later eviction breaks
    /// the tie among them by size.
    pub fn plan(&mut self, key: &SpanKey, range: ByteRange) -> ReadPlan {
        if range.is_empty() {
            return ReadPlan::default();
        }
        let touched = self.overlapping(key, range);
        let misses = self.gaps(key, range);
        if touched.is_empty() {
            return ReadPlan { hits: Vec::new(), misses };
        }

        let rank = self.tick();
        let mut hits = Vec::with_capacity(touched.len());
        for (start, entry) in touched {
            self.set_rank(key, start, entry, rank);
            hits.push(Span {
                key: key.clone(),
                start,
                length: entry.length,
                last_access: rank,
            });
        }
        ReadPlan { hits, misses }
    }

    fn set_rank(&mut self, key: &SpanKey, start: u64, entry: Entry, rank: u64) {
        self.recency.remove(&RecencyKey {
            rank: entry.rank,
            length: entry.length,
            key: key.clone(),
            start,
        });
        self.recency.insert(RecencyKey {
            rank,
            length: entry.length,
            key: key.clone(),
            start,
        });
        if let Some(slot) = self.spans.get_mut(key).and_then(|map| map.get_mut(&start)) {
            slot.rank = rank;
        }
    }

    /// Record a write of `range` for `key` whose uncovered `pieces` are now
    /// stored.
    ///
    /// Spans already cached inside `range` and the new pieces all take the
    /// returned rank, so the whole written range is the most recent.
    /// `pieces` come from [`CacheIndex::gaps`] and cannot overlap existing
    /// spans.
    pub fn insert(&mut self, key: &SpanKey, range: ByteRange, pieces: &[ByteRange]) -> u64 {
        let rank = self.tick();
        for (start, entry) in self.overlapping(key, range) {
            self.set_rank(key, start, entry, rank);
        }
        for piece in pieces.iter().filter(|p| !p.is_empty()) {
            debug_assert!(!self.overlaps(key, *piece));
            self.insert_at(key.clone(), piece.start, piece.len(), rank);
        }
        rank
    }

    fn insert_at(&mut self, key: SpanKey, start: u64, length: u64, rank: u64) {
        self.recency.insert(RecencyKey {
            rank,
            length,
            key: key.clone(),
            start,
        });
        self.spans
            .entry(key)
            .or_default()
            .insert(start, Entry { length, rank });
        self.total_bytes += length;
    }

    pub fn remove(&mut self, key: &SpanKey, start: u64) -> Option<Span> {
        let map = self.spans.get_mut(key)?;
        let entry = map.remove(&start)?;
        if map.is_empty() {
            self.spans.remove(key);
        }
        self.recency.remove(&RecencyKey {
            rank: entry.rank,
            length: entry.length,
            key: key.clone(),
            start,
        });
        self.total_bytes -= entry.length;
        Some(Span {
            key: key.clone(),
            start,
            length: entry.length,
            last_access: entry.rank,
        })
    }

    /// Drop every span of `key`.
    pub fn remove_key(&mut self, key: &SpanKey) -> Vec<Span> {
        let starts: Vec<u64> = match self.spans.get(key) {
            Some(map) => map.keys().copied().collect(),
            None => return Vec::new(),
        };
        starts
            .into_iter()
            .filter_map(|start| self.remove(key, start))
            .collect()
    }

    /// Evict least-recently-used spans until the budget holds.
    ///
    /// Spans with rank `protect_rank` (the write in progress) are skipped.
    /// Returns the evicted spans in eviction order.
    pub fn evict_to_budget(&mut self, protect_rank: Option<u64>) -> Vec<Span> {
        if self.total_bytes <= self.budget {
            return Vec::new();
        }
        let mut excess = self.total_bytes - self.budget;
        let mut victims = Vec::new();
        for candidate in self.recency.iter() {
            if excess == 0 {
                break;
            }
            if Some(candidate.rank) == protect_rank {
                continue;
            }
            excess = excess.saturating_sub(candidate.length);
            victims.push((candidate.key.clone(), candidate.start));
        }
        victims
            .into_iter()
            .filter_map(|(key, start)| self.remove(&key, start))
            .collect()
    }

    /// Spans of `key` in offset order.
    pub fn spans_for(&self, key: &SpanKey) -> Vec<Span> {
        self.spans
            .get(key)
            .map(|map| {
                map.iter()
                    .map(|(start, entry)| Span {
                        key: key.clone(),
                        start: *start,
                        length: entry.length,
                        last_access: entry.rank,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn contains(&self, span: &Span) -> bool {
        self.spans
            .get(&span.key)
            .and_then(|map| map.get(&span.start))
            .is_some_and(|entry| entry.length == span.length)
    }

    pub fn keys(&self) -> impl Iterator<Item = &SpanKey> {
        self.spans.keys()
    }

    /// Every span, grouped by key in offset order.
    pub fn all_spans(&self) -> Vec<Span> {
        let mut keys: Vec<&SpanKey> = self.spans.keys().collect();
        keys.sort();
        keys.into_iter().flat_map(|key| self.spans_for(key)).collect()
    }
}
