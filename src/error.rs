// Error taxonomy for the span cache and the session state machine.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::session::SessionMode;

/// Errors returned synchronously by [`crate::cache::SpanCache`] operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The storage directory cannot be created or written.
    #[error("cache storage unavailable at {path}: {source}")]
    StorageUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A single span is larger than the whole byte budget.
    #[error("span of {length} bytes exceeds cache budget of {budget} bytes")]
    CapacityExceeded { length: u64, budget: u64 },

    /// Writing span bytes to disk failed; the index was left untouched.
    #[error("failed to write span [{start}, {end}) for {key}: {source}")]
    WriteFailed {
        key: String,
        start: u64,
        end: u64,
        #[source]
        source: std::io::Error,
    },

    /// Reading a cached span back from disk failed.
    #[error("failed to read cached span [{start}, {end}) for {key}: {source}")]
    ReadFailed {
        key: String,
        start: u64,
        end: u64,
        #[source]
        source: std::io::Error,
    },

    /// The supplied byte count does not match the span length.
    #[error("span length {expected} does not match {actual} supplied bytes")]
    LengthMismatch { expected: u64, actual: u64 },

    /// Persisting the index failed.
    #[error("failed to persist cache index: {0}")]
    Persist(#[source] std::io::Error),

    /// A media source failed while filling a gap during read-through.
    #[error("media source fetch failed: {0:#}")]
    Source(#[source] anyhow::Error),
}

/// Errors raised while validating session parameters.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParamsError {
    #[error("channel count must be 1 or 2, got {0}")]
    ChannelCount(u16),

    #[error("sample rate must be > 0")]
    SampleRate,

    #[error("bitrate must be > 0")]
    Bitrate,

    #[error("output path must not be empty")]
    EmptyOutput,

    #[error("playback source must not be empty")]
    EmptySource,

    #[error("progress interval {0:?} is below the minimum")]
    ProgressInterval(std::time::Duration),
}

/// Session lifecycle errors.
///
/// `AlreadyActive` and `InvalidStateTransition` are returned to the caller of
/// the command. `EngineFailure` is only ever delivered through the observer.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("a session is already active (mode {0:?})")]
    AlreadyActive(SessionMode),

    #[error("cannot {op} while {mode:?}")]
    InvalidStateTransition { op: &'static str, mode: SessionMode },

    #[error("engine failure: {0:#}")]
    EngineFailure(Arc<anyhow::Error>),
}

impl SessionError {
    pub(crate) fn engine(err: anyhow::Error) -> Self {
        SessionError::EngineFailure(Arc::new(err))
    }
}
