use std::sync::Arc;
use std::time::Duration;

use super::controller::SessionController;
use super::engine::Engine;
use super::observer::SessionObserver;
use super::params::RecordParams;
use super::SessionMode;
use crate::error::SessionError;

/// Session owner that only records.
pub struct Recorder {
    controller: SessionController,
}

impl Recorder {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self {
            controller: SessionController::new(engine),
        }
    }

    pub fn set_observer(&self, observer: Arc<dyn SessionObserver>) {
        self.controller.set_observer(observer);
    }

    pub fn start(&self, params: RecordParams) -> Result<(), SessionError> {
        self.controller.start(params)
    }

    pub fn pause(&self) -> Result<(), SessionError> {
        self.controller.pause()
    }

    pub fn resume(&self) -> Result<(), SessionError> {
        self.controller.resume()
    }

    pub fn stop(&self) -> Result<(), SessionError> {
        self.controller.stop()
    }

    /// True while a recording exists, paused or not.
    pub fn is_recording(&self) -> bool {
        matches!(
            self.controller.mode(),
            SessionMode::Recording | SessionMode::RecordingPaused
        )
    }

    pub fn is_paused(&self) -> bool {
        self.controller.mode() == SessionMode::RecordingPaused
    }

    pub fn mode(&self) -> SessionMode {
        self.controller.mode()
    }

    pub fn elapsed(&self) -> Duration {
        self.controller.elapsed()
    }
}
