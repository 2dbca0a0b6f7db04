use std::fmt;
use thiserror::Error;

/// Reason a transcoder exited before finishing its playlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The process exited on its own (crash or early EOF on input).
    FfmpegExit,
    /// The playlist-readiness watchdog gave up.
    StartupTimeout,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::FfmpegExit => write!(f, "ffmpeg_exit"),
            ExitReason::StartupTimeout => write!(f, "startup_timeout"),
        }
    }
}

/// A single validation failure in the configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Unified error type for the HLS streaming core.
///
/// Consolidates job lifecycle, transcoder, data source, cache, and
/// configuration errors so that callers (the HTTP layer) can branch on a
/// single enum. A job's error is set exactly once and is sticky; see
/// [`crate::job::Job`].
#[derive(Error, Debug, Clone)]
pub enum HlsError {
    // === Input / data source errors ===
    /// The stream use case failed or returned no reader.
    #[error("stream input unavailable for torrent {torrent_id} file {file_index}: {reason}")]
    InputUnavailable {
        torrent_id: String,
        file_index: usize,
        reason: String,
    },

    /// Subtitle burning was requested but no seekable on-disk source exists.
    /// Distinguishable so the caller can retry without subtitles.
    #[error("subtitle source unavailable for track {subtitle_track}")]
    SubtitleSourceUnavailable { subtitle_track: i32 },

    /// The ring buffer source produced no data for the stall window.
    #[error("stream stalled for {stalled_secs}s, treating as end of input")]
    StallTimeout { stalled_secs: u64 },

    // === Transcoder errors ===
    /// FFmpeg could not be spawned.
    #[error("failed to start transcoder: {0}")]
    TranscoderStartFailure(String),

    /// No playlist appeared within the startup window.
    #[error("transcoder produced no playlist within {timeout_secs}s")]
    TranscoderStartupTimeout { timeout_secs: u64 },

    /// FFmpeg exited before writing ENDLIST and the restart budget is spent.
    #[error("transcoder exited prematurely: {stderr_tail}")]
    TranscoderPrematureExit { stderr_tail: String },

    /// FFmpeg exited non-zero with no playlist at all.
    #[error("transcoder failed (exit {exit_code:?}): {stderr_tail}")]
    TranscoderRuntimeFailure {
        exit_code: Option<i32>,
        stderr_tail: String,
    },

    // === Probe errors ===
    /// ffprobe failed after all retries.
    #[error("media probe failed for {path}: {reason}")]
    ProbeFailure { path: String, reason: String },

    // === Cache errors ===
    /// Segment or codec cache I/O failed. Never fails the owning job.
    #[error("cache I/O error: {0}")]
    CacheIo(String),

    // === Job lifecycle errors ===
    /// The job was cancelled (stop, purge, or replacement by a hard seek).
    #[error("job cancelled")]
    Cancelled,

    /// No job exists for the requested key.
    #[error("no job for torrent {torrent_id} file {file_index}")]
    JobNotFound {
        torrent_id: String,
        file_index: usize,
    },

    // === Validation errors ===
    /// Bad seek target, file index, or track selector.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Configuration failed validation.
    #[error("validation error: {}", .0.iter().map(|i| i.to_string()).collect::<Vec<_>>().join("; "))]
    Validation(Vec<ValidationIssue>),

    /// Failed to read a config file.
    #[error("failed to read config file: {0}")]
    ConfigRead(String),

    /// Failed to parse a config file.
    #[error("failed to parse config file: {0}")]
    ConfigParse(String),

    // === Generic I/O ===
    #[error("I/O error: {0}")]
    Io(String),

    /// Serialization failure (codec cache persistence, probe output).
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl HlsError {
    /// Whether the caller may transparently retry the operation.
    ///
    /// The HTTP layer maps transient errors to 503 + `Retry-After` and
    /// everything else to a hard failure.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            HlsError::InputUnavailable { .. } | HlsError::StallTimeout { .. }
        )
    }

    /// Whether this is the distinguishable subtitle failure, which the
    /// caller handles by retrying once without subtitle burn.
    pub fn is_subtitle_failure(&self) -> bool {
        matches!(self, HlsError::SubtitleSourceUnavailable { .. })
    }

    /// Cancellation is an expected outcome, not a failure; telemetry
    /// skips it when counting job failures.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, HlsError::Cancelled)
    }
}

// === Conversion implementations ===

impl From<std::io::Error> for HlsError {
    fn from(err: std::io::Error) -> Self {
        HlsError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for HlsError {
    fn from(err: serde_json::Error) -> Self {
        HlsError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for HlsError {
    fn from(err: toml::de::Error) -> Self {
        HlsError::ConfigParse(err.to_string())
    }
}

/// Result type alias for operations that can fail with [`HlsError`].
pub type HlsResult<T> = Result<T, HlsError>;
