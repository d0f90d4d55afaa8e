// Persisted index format.
//
// The index is a JSON document written atomically (temp file + rename).
// Unknown fields are ignored so newer writers stay readable; anything that
// fails validation is treated as corrupt and the cache starts empty.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::index::CacheIndex;
use super::span::{Span, SpanKey};
use crate::config::INDEX_FORMAT_VERSION;

#[derive(Debug, Serialize, Deserialize)]
struct SpanRecord {
    offset: u64,
    length: u64,
    last_access_rank: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    clock: u64,
    total_bytes: u64,
    keys: BTreeMap<String, Vec<SpanRecord>>,
}

/// Outcome of reading the index file.
#[derive(Debug)]
pub(crate) enum Loaded {
    /// No index file exists yet.
    Missing,
    Index(CacheIndex),
    /// The file exists but cannot be trusted.
    Corrupt(String),
}

pub(crate) fn load(path: &Path, budget: u64) -> Loaded {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Loaded::Missing,
        Err(e) => return Loaded::Corrupt(format!("unreadable index: {}", e)),
    };

    let file: IndexFile = match serde_json::from_slice(&raw) {
        Ok(file) => file,
        Err(e) => return Loaded::Corrupt(format!("malformed index: {}", e)),
    };

    match decode(file, budget) {
        Ok(index) => Loaded::Index(index),
        Err(reason) => Loaded::Corrupt(reason),
    }
}

fn decode(file: IndexFile, budget: u64) -> Result<CacheIndex, String> {
    if file.version == 0 || file.version > INDEX_FORMAT_VERSION {
        return Err(format!("unsupported index version {}", file.version));
    }

    let mut spans = Vec::new();
    let mut sum: u64 = 0;
    for (key, records) in file.keys {
        let key = SpanKey::new(key);
        for record in records {
            sum = sum
                .checked_add(record.length)
                .ok_or_else(|| "total size overflows".to_string())?;
            spans.push(Span {
                key: key.clone(),
                start: record.offset,
                length: record.length,
                last_access: record.last_access_rank,
            });
        }
    }

    if sum != file.total_bytes {
        return Err(format!(
            "recorded total {} does not match span sum {}",
            file.total_bytes, sum
        ));
    }

    CacheIndex::restore(budget, file.clock, spans)
}

pub(crate) fn save(path: &Path, index: &CacheIndex) -> io::Result<()> {
    let mut keys: BTreeMap<String, Vec<SpanRecord>> = BTreeMap::new();
    for span in index.all_spans() {
        keys.entry(span.key.as_str().to_string())
            .or_default()
            .push(SpanRecord {
                offset: span.start,
                length: span.length,
                last_access_rank: span.last_access,
            });
    }

    let file = IndexFile {
        version: INDEX_FORMAT_VERSION,
        clock: index.clock(),
        total_bytes: index.total_bytes(),
        keys,
    };
    let encoded = serde_json::to_vec_pretty(&file).map_err(io::Error::other)?;

    let tmp_path = path.with_extension("json.tmp");
    let result: io::Result<()> = (|| {
        let mut out = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        out.write_all(&encoded)?;
        out.sync_all()?;
        fs::rename(&tmp_path, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}
