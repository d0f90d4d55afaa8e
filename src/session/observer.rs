// Observer interface and a channel-backed adapter for async consumers.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use super::params::MediaTarget;
use crate::error::SessionError;

/// Receives the lifecycle and progress events of one session owner.
///
/// Callbacks run on the session's serialized context, in event order, with
/// the state lock held: they must not call back into the session. Use
/// [`ChannelObserver`] to hand events to another task instead.
pub trait SessionObserver: Send + Sync {
    fn on_start(&self, _output: &MediaTarget) {}
    fn on_pause(&self) {}
    fn on_resume(&self) {}
    /// `level` is the input amplitude while recording and the position in
    /// milliseconds while playing.
    fn on_progress(&self, _elapsed_ms: u64, _level: i64) {}
    fn on_seek(&self, _position: Duration) {}
    fn on_stop(&self, _output: &MediaTarget) {}
    fn on_error(&self, _cause: &SessionError) {}
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Started(MediaTarget),
    Paused,
    Resumed,
    Progress { elapsed_ms: u64, level: i64 },
    Seeked(Duration),
    Stopped(MediaTarget),
    Error(SessionError),
}

impl SessionEvent {
    pub fn is_progress(&self) -> bool {
        matches!(self, SessionEvent::Progress { .. })
    }
}

/// Forwards every callback into an unbounded single-consumer channel.
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }

    fn send(&self, event: SessionEvent) {
        // Receiver dropped: nobody is listening any more.
        let _ = self.tx.send(event);
    }
}

impl SessionObserver for ChannelObserver {
    fn on_start(&self, output: &MediaTarget) {
        self.send(SessionEvent::Started(output.clone()));
    }

    fn on_pause(&self) {
        self.send(SessionEvent::Paused);
    }

    fn on_resume(&self) {
        self.send(SessionEvent::Resumed);
    }

    fn on_progress(&self, elapsed_ms: u64, level: i64) {
        self.send(SessionEvent::Progress { elapsed_ms, level });
    }

    fn on_seek(&self, position: Duration) {
        self.send(SessionEvent::Seeked(position));
    }

    fn on_stop(&self, output: &MediaTarget) {
        self.send(SessionEvent::Stopped(output.clone()));
    }

    fn on_error(&self, cause: &SessionError) {
        self.send(SessionEvent::Error(cause.clone()));
    }
}
