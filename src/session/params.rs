// Immutable, validated parameter bundles for starting a session.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::{
    DEFAULT_PLAY_PROGRESS_INTERVAL, DEFAULT_RECORD_PROGRESS_INTERVAL, MIN_PROGRESS_INTERVAL,
    RECORDER_BITS_PER_SAMPLE,
};
use crate::error::ParamsError;

use super::SessionMode;

/// Where a session reads from or writes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaTarget {
    File(PathBuf),
    Url(String),
    /// Asset bundled with the host application, addressed by name.
    Asset(String),
}

impl fmt::Display for MediaTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaTarget::File(path) => write!(f, "file:{}", path.display()),
            MediaTarget::Url(url) => write!(f, "{}", url),
            MediaTarget::Asset(name) => write!(f, "asset:{}", name),
        }
    }
}

fn check_interval(interval: Duration) -> Result<Duration, ParamsError> {
    if interval < MIN_PROGRESS_INTERVAL {
        return Err(ParamsError::ProgressInterval(interval));
    }
    Ok(interval)
}

/// Parameters of a recording session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordParams {
    output: PathBuf,
    channel_count: u16,
    sample_rate: u32,
    bitrate: u32,
    max_duration: Option<Duration>,
    progress_interval: Duration,
}

impl RecordParams {
    /// Validate a recording request.
    ///
    /// A zero `max_duration` means unlimited, like `None`.
    pub fn new(
        output: impl Into<PathBuf>,
        channel_count: u16,
        sample_rate: u32,
        bitrate: u32,
        max_duration: Option<Duration>,
    ) -> Result<Self, ParamsError> {
        let output = output.into();
        if output.as_os_str().is_empty() {
            return Err(ParamsError::EmptyOutput);
        }
        if !(1..=2).contains(&channel_count) {
            return Err(ParamsError::ChannelCount(channel_count));
        }
        if sample_rate == 0 {
            return Err(ParamsError::SampleRate);
        }
        if bitrate == 0 {
            return Err(ParamsError::Bitrate);
        }

        Ok(Self {
            output,
            channel_count,
            sample_rate,
            bitrate,
            max_duration: max_duration.filter(|d| !d.is_zero()),
            progress_interval: DEFAULT_RECORD_PROGRESS_INTERVAL,
        })
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Result<Self, ParamsError> {
        self.progress_interval = check_interval(interval)?;
        Ok(self)
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    pub fn channel_count(&self) -> u16 {
        self.channel_count
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn bitrate(&self) -> u32 {
        self.bitrate
    }

    pub fn max_duration(&self) -> Option<Duration> {
        self.max_duration
    }

    pub fn progress_interval(&self) -> Duration {
        self.progress_interval
    }

    /// PCM16 byte count an engine may capture before `max_duration` is hit.
    pub fn max_pcm_bytes(&self) -> Option<u64> {
        self.max_duration.map(|d| {
            let millis = u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
            (self.sample_rate as u64 * self.channel_count as u64 * RECORDER_BITS_PER_SAMPLE)
                .saturating_mul(millis)
                / 8000
        })
    }
}

/// Parameters of a playback session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayParams {
    source: MediaTarget,
    looping: bool,
    progress_interval: Duration,
}

impl PlayParams {
    fn new(source: MediaTarget) -> Self {
        Self {
            source,
            looping: false,
            progress_interval: DEFAULT_PLAY_PROGRESS_INTERVAL,
        }
    }

    /// Play a local file.
    pub fn file(path: impl Into<PathBuf>) -> Result<Self, ParamsError> {
        let path = path.into();
        if path.as_os_str().is_empty() {
            return Err(ParamsError::EmptySource);
        }
        Ok(Self::new(MediaTarget::File(path)))
    }

    /// Play a remote resource.
    pub fn url(url: impl Into<String>) -> Result<Self, ParamsError> {
        let url = url.into();
        if url.trim().is_empty() {
            return Err(ParamsError::EmptySource);
        }
        Ok(Self::new(MediaTarget::Url(url)))
    }

    /// Play an asset bundled with the application.
    pub fn asset(name: impl Into<String>) -> Result<Self, ParamsError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ParamsError::EmptySource);
        }
        Ok(Self::new(MediaTarget::Asset(name)))
    }

    pub fn with_looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Result<Self, ParamsError> {
        self.progress_interval = check_interval(interval)?;
        Ok(self)
    }

    pub fn source(&self) -> &MediaTarget {
        &self.source
    }

    pub fn looping(&self) -> bool {
        self.looping
    }

    pub fn progress_interval(&self) -> Duration {
        self.progress_interval
    }
}

/// Either kind of session request, as handed to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionParams {
    Record(RecordParams),
    Play(PlayParams),
}

impl SessionParams {
    pub fn target(&self) -> MediaTarget {
        match self {
            SessionParams::Record(p) => MediaTarget::File(p.output.clone()),
            SessionParams::Play(p) => p.source.clone(),
        }
    }

    pub fn progress_interval(&self) -> Duration {
        match self {
            SessionParams::Record(p) => p.progress_interval,
            SessionParams::Play(p) => p.progress_interval,
        }
    }

    /// Mode a successful start enters.
    pub(crate) fn active_mode(&self) -> SessionMode {
        match self {
            SessionParams::Record(_) => SessionMode::Recording,
            SessionParams::Play(_) => SessionMode::Playing,
        }
    }
}

impl From<RecordParams> for SessionParams {
    fn from(params: RecordParams) -> Self {
        SessionParams::Record(params)
    }
}

impl From<PlayParams> for SessionParams {
    fn from(params: PlayParams) -> Self {
        SessionParams::Play(params)
    }
}
