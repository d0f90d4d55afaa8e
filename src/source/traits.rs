use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

use crate::cache::ByteRange;

/// Remote byte source a playback engine reads from.
///
/// Transport is supplied by the host; the cache only asks for ranges it
/// does not already hold.
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Fetch exactly the bytes `[range.start, range.end)`.
    async fn fetch_range(&self, range: ByteRange) -> Result<Bytes>;
}
