// Engine seam: the external capture/playback capability a session drives.

use std::time::Duration;

use anyhow::Result;

use super::controller::EngineSink;
use super::params::{MediaTarget, SessionParams};

/// Opaque handle to one running engine activity.
///
/// Not `Clone`: the session owns it exclusively and gives it back to the
/// engine on stop.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct EngineHandle(u64);

impl EngineHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Capture or playback backend.
///
/// Control calls are made while the session's state lock is held, so they
/// must return promptly and must not call back into the session. Engines
/// report asynchronous conditions (levels, completion, failure) through the
/// [`EngineSink`] received in [`Engine::start`], from their own threads.
pub trait Engine: Send + Sync {
    /// Begin capturing or playing.
    fn start(&self, sink: EngineSink, params: &SessionParams) -> Result<EngineHandle>;

    /// Suspend byte production.
    fn pause(&self, handle: &EngineHandle) -> Result<()>;

    fn resume(&self, handle: &EngineHandle) -> Result<()>;

    /// Move the playback position. Only called while playing.
    fn seek(&self, handle: &EngineHandle, position: Duration) -> Result<()>;

    /// Release the activity and return the final output descriptor.
    fn stop(&self, handle: EngineHandle) -> Result<MediaTarget>;
}

/// Mean absolute sample level of little-endian PCM16 `frames`, scaled the
/// way the recorder meter expects (sum over `len / 16`).
pub fn pcm16_amplitude(frames: &[u8]) -> i64 {
    let sum: i64 = frames
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]).unsigned_abs() as i64)
        .sum();
    let divisor = (frames.len() / 16).max(1) as i64;
    sum / divisor
}
