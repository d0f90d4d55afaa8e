// Session state machine: serializes transitions and orders observer events.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::engine::{pcm16_amplitude, Engine, EngineHandle};
use super::observer::SessionObserver;
use super::params::{MediaTarget, SessionParams};
use super::SessionMode;
use crate::error::SessionError;

struct Active {
    handle: EngineHandle,
    target: MediaTarget,
    interval: Duration,
    /// Running time banked before the last pause.
    accumulated: Duration,
    /// Set while not paused.
    running_since: Option<Instant>,
    ticker: Option<CancellationToken>,
    level: Arc<AtomicI64>,
    /// Zero until the engine reports a duration.
    duration_ms: Arc<AtomicU64>,
}

impl Active {
    fn elapsed(&self) -> Duration {
        match self.running_since {
            Some(since) => self.accumulated + since.elapsed(),
            None => self.accumulated,
        }
    }

    fn halt_ticker(&mut self) {
        if let Some(token) = self.ticker.take() {
            token.cancel();
        }
    }
}

struct Inner {
    mode: SessionMode,
    /// Incremented on every start; stale sinks and tickers compare against it.
    generation: u64,
    active: Option<Active>,
    observer: Option<Arc<dyn SessionObserver>>,
}

impl Inner {
    fn emit(&self, f: impl FnOnce(&dyn SessionObserver)) {
        if let Some(observer) = &self.observer {
            f(observer.as_ref());
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation == generation && self.active.is_some()
    }
}

pub(crate) struct Shared {
    engine: Arc<dyn Engine>,
    inner: Mutex<Inner>,
}

impl Shared {
    /// Emit one progress tick. Returns false once the ticker should exit.
    ///
    /// Blocks on the state lock, which commands hold across engine calls;
    /// those are required to return promptly.
    fn tick(&self, generation: u64, cancelled: &CancellationToken) -> bool {
        let inner = self.inner.lock();
        // Tokens are cancelled under this lock, so a ticker that raced a
        // pause/resume pair sees its own cancellation here.
        if cancelled.is_cancelled()
            || !inner.is_current(generation)
            || !inner.mode.is_running()
        {
            return false;
        }
        let Some(active) = inner.active.as_ref() else {
            return false;
        };
        let elapsed_ms = active.elapsed().as_millis() as u64;
        let level = active.level.load(Ordering::Relaxed);
        inner.emit(|o| o.on_progress(elapsed_ms, level));
        true
    }

    /// Stop path shared by `stop()` and engine-driven completion.
    fn stop_locked(&self, inner: &mut Inner) {
        let Some(mut active) = inner.active.take() else {
            return;
        };
        active.halt_ticker();
        inner.mode = SessionMode::Idle;
        let elapsed = active.elapsed();

        match self.engine.stop(active.handle) {
            Ok(output) => {
                info!(
                    "session stopped output={} elapsed_ms={}",
                    output,
                    elapsed.as_millis()
                );
                inner.emit(|o| o.on_stop(&output));
            }
            Err(e) => {
                warn!("engine stop failed: {:#}", e);
                let cause = SessionError::engine(e);
                inner.emit(|o| o.on_error(&cause));
            }
        }
    }

    /// Failure path: force Idle, release the handle, report exactly one error.
    fn fail_locked(&self, inner: &mut Inner, cause: anyhow::Error) {
        let Some(mut active) = inner.active.take() else {
            return;
        };
        active.halt_ticker();
        inner.mode = SessionMode::Idle;
        warn!("session failed target={}: {:#}", active.target, cause);

        if let Err(e) = self.engine.stop(active.handle) {
            debug!("engine release after failure also failed: {:#}", e);
        }
        let cause = SessionError::engine(cause);
        inner.emit(|o| o.on_error(&cause));
    }
}

/// Callback handle given to the engine at start.
///
/// Every method is safe to call from any thread at any time; calls made
/// after the session ended (or a newer one started) are ignored.
#[derive(Clone)]
pub struct EngineSink {
    shared: Weak<Shared>,
    generation: u64,
    level: Arc<AtomicI64>,
    duration_ms: Arc<AtomicU64>,
    runtime: Handle,
}

impl EngineSink {
    /// Report the current level: amplitude while recording, position in
    /// milliseconds while playing.
    pub fn report_level(&self, level: i64) {
        self.level.store(level, Ordering::Relaxed);
    }

    /// Report the total length of the media being played.
    pub fn report_duration(&self, duration: Duration) {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self.duration_ms.store(millis, Ordering::Relaxed);
    }

    /// Feed captured little-endian PCM16 frames; updates the amplitude level.
    pub fn on_pcm16_frames(&self, frames: &[u8]) {
        self.report_level(pcm16_amplitude(frames));
    }

    /// The engine ended the session by itself (end of stream, max duration).
    /// Runs the regular stop path, so the observer sees `on_stop`.
    pub fn finished(&self) {
        let shared = self.shared.clone();
        let generation = self.generation;
        self.runtime.spawn(async move {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            let mut inner = shared.inner.lock();
            if inner.is_current(generation) {
                debug!("engine finished session generation={}", generation);
                shared.stop_locked(&mut inner);
            }
        });
    }

    /// The engine hit an unrecoverable error.
    pub fn failed(&self, cause: anyhow::Error) {
        let shared = self.shared.clone();
        let generation = self.generation;
        self.runtime.spawn(async move {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            let mut inner = shared.inner.lock();
            if inner.is_current(generation) {
                shared.fail_locked(&mut inner, cause);
            }
        });
    }

    /// Whether the session this sink belongs to is still running.
    pub fn is_current(&self) -> bool {
        self.shared.upgrade().is_some_and(|shared| {
            let inner = shared.inner.lock();
            inner.is_current(self.generation)
        })
    }
}

/// Drives one engine through the recording/playback lifecycle.
///
/// Every command runs under one lock, so concurrent callers observe a
/// consistent state and losers of a race get `AlreadyActive` or
/// `InvalidStateTransition`. Engine failures are reported through the
/// observer and never returned from a command. Must be used from within a
/// tokio runtime: progress ticks and engine callbacks run as tasks on it.
pub struct SessionController {
    shared: Arc<Shared>,
}

impl SessionController {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self {
            shared: Arc::new(Shared {
                engine,
                inner: Mutex::new(Inner {
                    mode: SessionMode::Idle,
                    generation: 0,
                    active: None,
                    observer: None,
                }),
            }),
        }
    }

    /// Register the observer, replacing (and silently detaching) any previous one.
    pub fn set_observer(&self, observer: Arc<dyn SessionObserver>) {
        self.shared.inner.lock().observer = Some(observer);
    }

    pub fn clear_observer(&self) {
        self.shared.inner.lock().observer = None;
    }

    pub fn mode(&self) -> SessionMode {
        self.shared.inner.lock().mode
    }

    /// Running time of the current session, excluding paused periods.
    pub fn elapsed(&self) -> Duration {
        self.shared
            .inner
            .lock()
            .active
            .as_ref()
            .map(Active::elapsed)
            .unwrap_or_default()
    }

    /// Last level reported by the engine, while a session exists.
    pub fn level(&self) -> Option<i64> {
        self.shared
            .inner
            .lock()
            .active
            .as_ref()
            .map(|active| active.level.load(Ordering::Relaxed))
    }

    /// Media length reported by the engine, if any.
    pub fn duration(&self) -> Option<Duration> {
        let inner = self.shared.inner.lock();
        let millis = inner.active.as_ref()?.duration_ms.load(Ordering::Relaxed);
        (millis > 0).then(|| Duration::from_millis(millis))
    }

    /// Start a recording or playback session.
    ///
    /// Fails with `AlreadyActive` if a session is running. If the engine
    /// cannot start, the observer gets `on_error` and the mode stays Idle.
    pub fn start(&self, params: impl Into<SessionParams>) -> Result<(), SessionError> {
        let params = params.into();
        let mut inner = self.shared.inner.lock();
        if inner.mode != SessionMode::Idle {
            return Err(SessionError::AlreadyActive(inner.mode));
        }

        inner.generation += 1;
        let generation = inner.generation;
        let level = Arc::new(AtomicI64::new(0));
        let duration_ms = Arc::new(AtomicU64::new(0));
        let sink = EngineSink {
            shared: Arc::downgrade(&self.shared),
            generation,
            level: level.clone(),
            duration_ms: duration_ms.clone(),
            runtime: Handle::current(),
        };

        let target = params.target();
        let handle = match self.shared.engine.start(sink, &params) {
            Ok(handle) => handle,
            Err(e) => {
                warn!("engine start failed target={}: {:#}", target, e);
                let cause = SessionError::engine(e);
                inner.emit(|o| o.on_error(&cause));
                return Ok(());
            }
        };

        let interval = params.progress_interval();
        inner.mode = params.active_mode();
        inner.active = Some(Active {
            handle,
            target: target.clone(),
            interval,
            accumulated: Duration::ZERO,
            running_since: Some(Instant::now()),
            ticker: Some(spawn_ticker(&self.shared, generation, interval)),
            level,
            duration_ms,
        });

        info!(
            "session started mode={:?} target={} interval_ms={}",
            inner.mode,
            target,
            interval.as_millis()
        );
        inner.emit(|o| o.on_start(&target));
        Ok(())
    }

    /// Suspend the running session. No progress ticks are emitted while paused.
    pub fn pause(&self) -> Result<(), SessionError> {
        let mut inner = self.shared.inner.lock();
        let mode = inner.mode;
        let Some(next) = mode.paused() else {
            return Err(SessionError::InvalidStateTransition { op: "pause", mode });
        };
        let Some(active) = inner.active.as_mut() else {
            return Err(SessionError::InvalidStateTransition { op: "pause", mode });
        };

        if let Err(e) = self.shared.engine.pause(&active.handle) {
            self.shared.fail_locked(&mut inner, e);
            return Ok(());
        }

        active.halt_ticker();
        if let Some(since) = active.running_since.take() {
            active.accumulated += since.elapsed();
        }
        debug!("session paused elapsed_ms={}", active.accumulated.as_millis());
        inner.mode = next;
        inner.emit(|o| o.on_pause());
        Ok(())
    }

    /// Continue a paused session.
    pub fn resume(&self) -> Result<(), SessionError> {
        let mut inner = self.shared.inner.lock();
        let mode = inner.mode;
        let Some(next) = mode.resumed() else {
            return Err(SessionError::InvalidStateTransition { op: "resume", mode });
        };
        let generation = inner.generation;
        let Some(active) = inner.active.as_mut() else {
            return Err(SessionError::InvalidStateTransition { op: "resume", mode });
        };

        if let Err(e) = self.shared.engine.resume(&active.handle) {
            self.shared.fail_locked(&mut inner, e);
            return Ok(());
        }

        active.running_since = Some(Instant::now());
        active.ticker = Some(spawn_ticker(&self.shared, generation, active.interval));
        debug!("session resumed elapsed_ms={}", active.accumulated.as_millis());
        inner.mode = next;
        inner.emit(|o| o.on_resume());
        Ok(())
    }

    /// End the session from any non-Idle mode.
    ///
    /// Returns without waiting for in-flight engine work; no event for this
    /// session is emitted after `on_stop`.
    pub fn stop(&self) -> Result<(), SessionError> {
        let mut inner = self.shared.inner.lock();
        if inner.mode == SessionMode::Idle {
            return Err(SessionError::InvalidStateTransition {
                op: "stop",
                mode: SessionMode::Idle,
            });
        }
        self.shared.stop_locked(&mut inner);
        Ok(())
    }

    /// Move the playback position. Only valid while playing.
    pub fn seek(&self, position: Duration) -> Result<(), SessionError> {
        let mut inner = self.shared.inner.lock();
        let mode = inner.mode;
        if mode != SessionMode::Playing {
            return Err(SessionError::InvalidStateTransition { op: "seek", mode });
        }
        let Some(active) = inner.active.as_ref() else {
            return Err(SessionError::InvalidStateTransition { op: "seek", mode });
        };

        if let Err(e) = self.shared.engine.seek(&active.handle, position) {
            self.shared.fail_locked(&mut inner, e);
            return Ok(());
        }
        inner.emit(|o| o.on_seek(position));
        Ok(())
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        // Release the engine without notifying; the owner is going away.
        let mut inner = self.shared.inner.lock();
        inner.observer = None;
        if let Some(mut active) = inner.active.take() {
            active.halt_ticker();
            inner.mode = SessionMode::Idle;
            if let Err(e) = self.shared.engine.stop(active.handle) {
                warn!("engine release on drop failed: {:#}", e);
            }
        }
    }
}

fn spawn_ticker(shared: &Arc<Shared>, generation: u64, interval: Duration) -> CancellationToken {
    let token = CancellationToken::new();
    let cancelled = token.clone();
    let shared = Arc::downgrade(shared);

    tokio::spawn(async move {
        let mut ticks = tokio::time::interval_at(Instant::now() + interval, interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancelled.cancelled() => break,
                _ = ticks.tick() => {
                    let Some(shared) = shared.upgrade() else { break };
                    if !shared.tick(generation, &cancelled) {
                        break;
                    }
                }
            }
        }
    });

    token
}
