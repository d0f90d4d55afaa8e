use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Default byte budget for the span cache (100 MB).
pub const DEFAULT_CACHE_BUDGET_BYTES: u64 = 100 * 1024 * 1024;

/// File name of the persisted index inside the cache directory.
pub const INDEX_FILE_NAME: &str = "index.json";

/// Sub-directory holding one directory of span files per key.
pub const SPANS_DIR_NAME: &str = "spans";

/// Current on-disk index format version.
pub const INDEX_FORMAT_VERSION: u32 = 1;

/// Progress feedback interval used by recordings unless overridden.
pub const DEFAULT_RECORD_PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Progress feedback interval used by playback unless overridden.
pub const DEFAULT_PLAY_PROGRESS_INTERVAL: Duration = Duration::from_millis(1000);

/// Smallest progress interval accepted by the parameter constructors.
pub const MIN_PROGRESS_INTERVAL: Duration = Duration::from_millis(10);

/// Default capture sample rate in Hz.
pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;

/// Bits per recorded PCM sample.
pub const RECORDER_BITS_PER_SAMPLE: u64 = 16;

/// Top-level configuration for the span cache.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory holding the index and span files.
    pub storage_dir: PathBuf,
    /// Upper bound on the sum of all cached span lengths.
    pub byte_budget: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::new(),
            byte_budget: DEFAULT_CACHE_BUDGET_BYTES,
        }
    }
}
