use std::sync::Arc;
use std::time::Duration;

use super::controller::SessionController;
use super::engine::Engine;
use super::observer::SessionObserver;
use super::params::PlayParams;
use super::SessionMode;
use crate::error::SessionError;

/// Session owner that only plays.
pub struct Player {
    controller: SessionController,
}

impl Player {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self {
            controller: SessionController::new(engine),
        }
    }

    pub fn set_observer(&self, observer: Arc<dyn SessionObserver>) {
        self.controller.set_observer(observer);
    }

    pub fn play(&self, params: PlayParams) -> Result<(), SessionError> {
        self.controller.start(params)
    }

    pub fn pause(&self) -> Result<(), SessionError> {
        self.controller.pause()
    }

    pub fn resume(&self) -> Result<(), SessionError> {
        self.controller.resume()
    }

    pub fn seek(&self, position: Duration) -> Result<(), SessionError> {
        self.controller.seek(position)
    }

    pub fn stop(&self) -> Result<(), SessionError> {
        self.controller.stop()
    }

    pub fn is_playing(&self) -> bool {
        self.controller.mode() == SessionMode::Playing
    }

    pub fn is_paused(&self) -> bool {
        self.controller.mode() == SessionMode::PlayingPaused
    }

    /// Playback position last reported by the engine; zero when idle.
    pub fn position(&self) -> Duration {
        self.controller
            .level()
            .map(|ms| Duration::from_millis(ms.max(0) as u64))
            .unwrap_or_default()
    }

    /// Length of the current media, once the engine has reported it.
    pub fn duration(&self) -> Option<Duration> {
        self.controller.duration()
    }

    pub fn mode(&self) -> SessionMode {
        self.controller.mode()
    }
}
