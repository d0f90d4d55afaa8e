//! LRU span cache for streamed media and the recording/playback session
//! state machine that drives an external capture or playback engine.

pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod session;
pub mod source;

pub use error::{CacheError, ParamsError, SessionError};
