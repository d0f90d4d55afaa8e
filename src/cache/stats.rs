// Cache statistics: hit/miss bytes, writes and evictions.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, PartialEq)]
pub struct CacheStatsSnapshot {
    pub total_bytes: u64,
    pub byte_budget: u64,
    pub span_count: usize,
    pub key_count: usize,
    pub hit_bytes: u64,
    pub miss_bytes: u64,
    pub written_bytes: u64,
    pub evicted_spans: u64,
    pub evicted_bytes: u64,
    pub hit_rate: f64,
}

/// Occupancy of the index at snapshot time.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Occupancy {
    pub total_bytes: u64,
    pub byte_budget: u64,
    pub span_count: usize,
    pub key_count: usize,
}

pub struct StatsCollector {
    requested_bytes: AtomicU64,
    hit_bytes: AtomicU64,
    written_bytes: AtomicU64,
    evicted_spans: AtomicU64,
    evicted_bytes: AtomicU64,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            requested_bytes: AtomicU64::new(0),
            hit_bytes: AtomicU64::new(0),
            written_bytes: AtomicU64::new(0),
            evicted_spans: AtomicU64::new(0),
            evicted_bytes: AtomicU64::new(0),
        }
    }

    /// Record a lookup: `total` bytes were requested, of which `cached` were already in cache.
    pub fn record_request(&self, total: u64, cached: u64) {
        self.requested_bytes.fetch_add(total, Ordering::Relaxed);
        self.hit_bytes.fetch_add(cached, Ordering::Relaxed);
    }

    pub fn record_written(&self, bytes: u64) {
        self.written_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_evicted(&self, spans: u64, bytes: u64) {
        self.evicted_spans.fetch_add(spans, Ordering::Relaxed);
        self.evicted_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, occupancy: Occupancy) -> CacheStatsSnapshot {
        let requested = self.requested_bytes.load(Ordering::Relaxed);
        let hit = self.hit_bytes.load(Ordering::Relaxed);
        let hit_rate = if requested > 0 {
            hit as f64 / requested as f64
        } else {
            0.0
        };

        CacheStatsSnapshot {
            total_bytes: occupancy.total_bytes,
            byte_budget: occupancy.byte_budget,
            span_count: occupancy.span_count,
            key_count: occupancy.key_count,
            hit_bytes: hit,
            miss_bytes: requested - hit,
            written_bytes: self.written_bytes.load(Ordering::Relaxed),
            evicted_spans: self.evicted_spans.load(Ordering::Relaxed),
            evicted_bytes: self.evicted_bytes.load(Ordering::Relaxed),
            hit_rate,
        }
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}
