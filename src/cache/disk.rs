// On-disk span files: one directory per key, one file per span.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use memmap2::Mmap;
use tracing::{debug, warn};

use super::span::SpanKey;

const SPAN_EXT: &str = "span";
const TMP_EXT: &str = "tmp";

pub(crate) struct SpanFiles {
    spans_dir: PathBuf,
}

impl SpanFiles {
    pub fn new(spans_dir: PathBuf) -> Self {
        Self { spans_dir }
    }

    pub fn key_dir(&self, key: &SpanKey) -> PathBuf {
        self.spans_dir.join(key.storage_name())
    }

    fn span_path(&self, key: &SpanKey, start: u64) -> PathBuf {
        self.key_dir(key).join(format!("{:020}.{}", start, SPAN_EXT))
    }

    /// Store `data` as the span of `key` starting at `start`.
    ///
    /// Bytes land in a temp file first and are renamed into place, so a
    /// failed write never leaves a truncated span file behind.
    pub fn write(&self, key: &SpanKey, start: u64, data: &[u8]) -> io::Result<()> {
        let dir = self.key_dir(key);
        fs::create_dir_all(&dir)?;

        let final_path = self.span_path(key, start);
        let tmp_path = final_path.with_extension(TMP_EXT);

        let result: io::Result<()> = (|| {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            file.write_all(data)?;
            file.sync_data()?;
            fs::rename(&tmp_path, &final_path)
        })();

        if result.is_err() {
            let _ = fs::remove_file(&tmp_path);
        }
        result
    }

    /// Read a whole span file, checking it still holds `length` bytes.
    pub fn read(&self, key: &SpanKey, start: u64, length: u64) -> io::Result<Bytes> {
        let file = File::open(self.span_path(key, start))?;
        let actual = file.metadata()?.len();
        if actual != length {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("span file holds {} bytes, expected {}", actual, length),
            ));
        }

        // SAFETY: span files are only ever replaced by rename, never
        // modified in place, so the mapping cannot change under us.
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Bytes::copy_from_slice(&mmap[..]))
    }

    /// Size of the stored span file, if present.
    pub fn stored_len(&self, key: &SpanKey, start: u64) -> Option<u64> {
        fs::metadata(self.span_path(key, start))
            .ok()
            .filter(|m| m.is_file())
            .map(|m| m.len())
    }

    pub fn remove(&self, key: &SpanKey, start: u64) -> io::Result<()> {
        ignore_missing(fs::remove_file(self.span_path(key, start)))?;
        // Drop the key directory once its last span is gone.
        let dir = self.key_dir(key);
        if fs::read_dir(&dir).map(|mut it| it.next().is_none()).unwrap_or(false) {
            let _ = fs::remove_dir(&dir);
        }
        Ok(())
    }

    pub fn remove_key(&self, key: &SpanKey) -> io::Result<()> {
        ignore_missing(fs::remove_dir_all(self.key_dir(key)))
    }

    /// Delete everything and recreate an empty spans directory.
    pub fn reset(&self) -> io::Result<()> {
        ignore_missing(fs::remove_dir_all(&self.spans_dir))?;
        fs::create_dir_all(&self.spans_dir)
    }

    /// Remove span files and directories not listed in `live`.
    ///
    /// `live` maps key directory names to the span offsets they should hold.
    /// Returns the number of entries removed.
    pub fn sweep(&self, live: &HashMap<String, HashSet<u64>>) -> io::Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.spans_dir)? {
            let entry = entry?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();

            let Some(starts) = live.get(&name).filter(|_| path.is_dir()) else {
                debug!("removing orphaned cache entry {}", path.display());
                remove_any(&path)?;
                removed += 1;
                continue;
            };

            for file in fs::read_dir(&path)? {
                let file = file?;
                let file_path = file.path();
                if parse_span_start(&file_path).is_some_and(|start| starts.contains(&start)) {
                    continue;
                }
                debug!("removing orphaned span file {}", file_path.display());
                remove_any(&file_path)?;
                removed += 1;
            }
        }
        if removed > 0 {
            warn!("swept {} orphaned span entries", removed);
        }
        Ok(removed)
    }
}

fn parse_span_start(path: &Path) -> Option<u64> {
    if path.extension()? != SPAN_EXT {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

fn remove_any(path: &Path) -> io::Result<()> {
    if path.is_dir() {
        ignore_missing(fs::remove_dir_all(path))
    } else {
        ignore_missing(fs::remove_file(path))
    }
}

fn ignore_missing(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
