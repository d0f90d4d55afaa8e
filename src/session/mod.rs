// Recording/playback session lifecycle.

pub mod controller;
pub mod engine;
pub mod observer;
pub mod params;
pub mod player;
pub mod recorder;

pub use controller::{EngineSink, SessionController};
pub use engine::{pcm16_amplitude, Engine, EngineHandle};
pub use observer::{ChannelObserver, SessionEvent, SessionObserver};
pub use params::{MediaTarget, PlayParams, RecordParams, SessionParams};
pub use player::Player;
pub use recorder::Recorder;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionMode {
    Idle,
    Recording,
    RecordingPaused,
    Playing,
    PlayingPaused,
}

impl SessionMode {
    /// Producing bytes and progress ticks.
    pub fn is_running(self) -> bool {
        matches!(self, SessionMode::Recording | SessionMode::Playing)
    }

    pub fn is_paused(self) -> bool {
        matches!(self, SessionMode::RecordingPaused | SessionMode::PlayingPaused)
    }

    pub fn is_idle(self) -> bool {
        self == SessionMode::Idle
    }

    /// Mode entered by pausing, if pausing is allowed.
    pub fn paused(self) -> Option<SessionMode> {
        match self {
            SessionMode::Recording => Some(SessionMode::RecordingPaused),
            SessionMode::Playing => Some(SessionMode::PlayingPaused),
            _ => None,
        }
    }

    /// Mode entered by resuming, if resuming is allowed.
    pub fn resumed(self) -> Option<SessionMode> {
        match self {
            SessionMode::RecordingPaused => Some(SessionMode::Recording),
            SessionMode::PlayingPaused => Some(SessionMode::Playing),
            _ => None,
        }
    }
}
