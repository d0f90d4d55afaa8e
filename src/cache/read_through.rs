// Read-through access: serve cached spans, fetch only the gaps from the source.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, warn};

use super::span::{ByteRange, SpanKey};
use super::span_cache::SpanCache;
use crate::error::CacheError;
use crate::source::MediaSource;

/// Extra attempts for a failed gap fetch.
const FETCH_RETRIES: u32 = 2;

/// Return the bytes of `range`, filling cache misses from `source`.
///
/// Cached spans are copied first so that evictions caused by the writes
/// below cannot invalidate them mid-request. A span evicted concurrently is
/// refetched. Failing to store a fetched gap is logged and does not fail the
/// read; failing to fetch one does. A cached span that cannot be read back
/// is refetched as well.
pub async fn read_through(
    cache: &SpanCache,
    source: &dyn MediaSource,
    key: &SpanKey,
    range: ByteRange,
) -> Result<Bytes, CacheError> {
    if range.is_empty() {
        return Ok(Bytes::new());
    }

    let plan = cache.read(key, range);
    let mut out = vec![0u8; range.len() as usize];
    let mut to_fetch = plan.misses.clone();

    for span in &plan.hits {
        let Some(overlap) = span.range().intersect(&range) else {
            continue;
        };
        match cache.read_span(span) {
            Ok(Some(data)) => {
                let src = (overlap.start - span.start) as usize..(overlap.end - span.start) as usize;
                let dst = (overlap.start - range.start) as usize..(overlap.end - range.start) as usize;
                out[dst].copy_from_slice(&data[src]);
            }
            Ok(None) => {
                debug!("span {} of {} vanished before read, refetching", span.range(), key);
                to_fetch.push(overlap);
            }
            Err(CacheError::ReadFailed { .. }) => {
                // The damaged span is already out of the index.
                to_fetch.push(overlap);
            }
            Err(e) => return Err(e),
        }
    }

    for gap in to_fetch {
        let data = fetch_with_retry(source, gap).await?;
        let dst = (gap.start - range.start) as usize..(gap.end - range.start) as usize;
        out[dst].copy_from_slice(&data);

        if let Err(e) = cache.write(key, gap, &data) {
            warn!("could not cache {} of {}: {}", gap, key, e);
        }
    }

    Ok(Bytes::from(out))
}

async fn fetch_with_retry(source: &dyn MediaSource, gap: ByteRange) -> Result<Bytes, CacheError> {
    let mut attempt = 0;
    loop {
        let result = source.fetch_range(gap).await.and_then(|data| {
            if data.len() as u64 == gap.len() {
                Ok(data)
            } else {
                Err(anyhow!(
                    "source returned {} bytes for {} ({} expected)",
                    data.len(),
                    gap,
                    gap.len()
                ))
            }
        });

        match result {
            Ok(data) => return Ok(data),
            Err(e) if attempt < FETCH_RETRIES => {
                warn!("fetch {} failed (attempt {}): {:#}", gap, attempt, e);
                tokio::time::sleep(Duration::from_millis(500 * (attempt as u64 + 1))).await;
                attempt += 1;
            }
            Err(e) => {
                warn!("fetch {} failed after {} retries: {:#}", gap, FETCH_RETRIES, e);
                return Err(CacheError::Source(e));
            }
        }
    }
}

/// Decorator that routes a source's reads through a shared [`SpanCache`].
pub struct CachedSource {
    inner: Arc<dyn MediaSource>,
    cache: Arc<SpanCache>,
    key: SpanKey,
}

impl CachedSource {
    pub fn new(inner: Arc<dyn MediaSource>, cache: Arc<SpanCache>, key: SpanKey) -> Self {
        Self { inner, cache, key }
    }

    pub fn key(&self) -> &SpanKey {
        &self.key
    }
}

#[async_trait]
impl MediaSource for CachedSource {
    async fn fetch_range(&self, range: ByteRange) -> anyhow::Result<Bytes> {
        Ok(read_through(&self.cache, self.inner.as_ref(), &self.key, range).await?)
    }
}
