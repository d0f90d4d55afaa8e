// Span vocabulary: resource keys, byte ranges, cached spans and read plans.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Stable identity of a remotely-addressed resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpanKey(String);

impl SpanKey {
    /// Use `key` verbatim.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Derive a key from a resource address.
    ///
    /// Surrounding whitespace and any `#fragment` are dropped, and the scheme
    /// and host of `scheme://host/...` addresses are lowercased, so spellings
    /// of the same resource share cached spans.
    pub fn from_address(address: &str) -> Self {
        let trimmed = address.trim();
        let without_fragment = match trimmed.find('#') {
            Some(idx) => &trimmed[..idx],
            None => trimmed,
        };

        let canonical = match without_fragment.find("://") {
            Some(idx) => {
                let scheme = &without_fragment[..idx];
                let rest = &without_fragment[idx + 3..];
                let host_end = rest.find(|c: char| c == '/' || c == '?').unwrap_or(rest.len());
                let (host, tail) = rest.split_at(host_end);
                format!(
                    "{}://{}{}",
                    scheme.to_ascii_lowercase(),
                    host.to_ascii_lowercase(),
                    tail
                )
            }
            None => without_fragment.to_string(),
        };

        Self(canonical)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Directory name used for this key's span files.
    pub fn storage_name(&self) -> String {
        let digest = Sha256::digest(self.0.as_bytes());
        hex::encode(&digest[..16])
    }
}

impl fmt::Display for SpanKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Half-open byte range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Range of `length` bytes beginning at `start`.
    pub fn at(start: u64, length: u64) -> Self {
        Self {
            start,
            end: start.saturating_add(length),
        }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn intersect(&self, other: &ByteRange) -> Option<ByteRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        if start < end {
            Some(ByteRange { start, end })
        } else {
            None
        }
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// A contiguous cached byte range of one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Span {
    pub key: SpanKey,
    pub start: u64,
    pub length: u64,
    /// Logical clock value of the last insert or read touching this span.
    pub last_access: u64,
}

impl Span {
    pub fn end(&self) -> u64 {
        self.start + self.length
    }

    pub fn range(&self) -> ByteRange {
        ByteRange::at(self.start, self.length)
    }
}

/// Result of consulting the index for a requested range.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadPlan {
    /// Cached spans overlapping the request, in offset order.
    pub hits: Vec<Span>,
    /// Sub-ranges of the request not covered by any span, in offset order.
    pub misses: Vec<ByteRange>,
}

impl ReadPlan {
    /// True when the whole request is served from cache.
    pub fn is_complete(&self) -> bool {
        self.misses.is_empty()
    }

    pub fn missing_bytes(&self) -> u64 {
        self.misses.iter().map(ByteRange::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_from_address_canonicalizes() {
        let a = SpanKey::from_address("  HTTPS://Media.Example.COM/Audio/Track.mp3#t=10 ");
        let b = SpanKey::from_address("https://media.example.com/Audio/Track.mp3");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "https://media.example.com/Audio/Track.mp3");
    }

    #[test]
    fn test_key_from_address_keeps_path_case_and_query() {
        let key = SpanKey::from_address("http://HOST?Token=AbC");
        assert_eq!(key.as_str(), "http://host?Token=AbC");

        let local = SpanKey::from_address("/sdcard/Music/Song.wav");
        assert_eq!(local.as_str(), "/sdcard/Music/Song.wav");
    }

    #[test]
    fn test_storage_name_is_stable_hex() {
        let key = SpanKey::new("a");
        let name = key.storage_name();
        assert_eq!(name.len(), 32);
        assert_eq!(name, SpanKey::new("a").storage_name());
        assert_ne!(name, SpanKey::new("b").storage_name());
    }

    #[test]
    fn test_range_intersect() {
        let r = ByteRange::new(10, 20);
        assert_eq!(r.intersect(&ByteRange::new(15, 30)), Some(ByteRange::new(15, 20)));
        assert_eq!(r.intersect(&ByteRange::new(20, 30)), None);
        assert_eq!(ByteRange::at(5, 0).len(), 0);
        assert!(ByteRange::new(7, 3).is_empty());
    }
}
