//! The transcoding job: one FFmpeg session (live or completed) for one
//! `(torrent, file, audio, subtitle)` key.

use crate::error::HlsError;
use crate::job::playlist::RewriteMemo;
use crate::job::state::{PlaybackState, StateCell};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Identity of a job. Requests with equal keys share a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobKey {
    pub torrent_id: String,
    pub file_index: usize,
    pub audio_track: i32,
    /// `-1` means no subtitle burn; values ≥ 0 select an embedded stream.
    pub subtitle_track: i32,
}

impl JobKey {
    pub fn new(torrent_id: &str, file_index: usize, audio_track: i32, subtitle_track: i32) -> Self {
        Self {
            torrent_id: torrent_id.to_string(),
            file_index,
            audio_track,
            subtitle_track,
        }
    }

    /// `a{audio}-s{sub}` selector used in directory names and cache keys.
    pub fn track_key(&self) -> String {
        format!("a{}-s{}", self.audio_track, self.subtitle_track)
    }

    pub fn burns_subtitles(&self) -> bool {
        self.subtitle_track >= 0
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.torrent_id,
            self.file_index,
            self.track_key()
        )
    }
}

/// One rung of the adaptive bitrate ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct VariantInfo {
    pub index: usize,
    pub height: u32,
}

impl VariantInfo {
    /// Directory / cache name for this rung (`v0`, `v1`, …).
    pub fn name(&self) -> String {
        format!("v{}", self.index)
    }
}

/// A live or completed transcoding session.
///
/// Shared ownership: the manager map, the transcoder driver, the
/// harvester, and any number of waiting HTTP requests all hold an `Arc`.
/// `ready` fires exactly once across every lifecycle path; the error is
/// sticky once set.
pub struct Job {
    pub key: JobKey,
    /// Absolute working directory with playlist(s) and segments.
    pub dir: PathBuf,
    /// Timeline offset FFmpeg was invoked at (0 for initial play).
    pub seek_seconds: f64,
    /// Cancellation root for all of this job's background work.
    pub cancel: CancellationToken,
    /// Encoded-time position reported by FFmpeg, microseconds. Zero means
    /// "no progress information yet", not "no progress". Shared with the
    /// driver's progress-parsing task.
    pub progress_micros: Arc<AtomicU64>,
    /// Auto-restarts applied to this job lineage.
    pub restart_count: AtomicU32,

    state: StateCell,
    /// Output layout; settled by the launch task once the encoding mode
    /// is known, always before the first playlist appears.
    shape: Mutex<JobShape>,
    ready_tx: watch::Sender<bool>,
    ready_fired: AtomicBool,
    err: Mutex<Option<HlsError>>,
    created_at: Instant,
    pub(crate) rewrite_memo: Mutex<Option<RewriteMemo>>,
}

/// Output layout of a job: top-level playlist and quality ladder.
#[derive(Debug, Clone)]
pub struct JobShape {
    /// `master.m3u8` (multi-variant) or `index.m3u8`.
    pub playlist: PathBuf,
    pub multi_variant: bool,
    pub variants: Vec<VariantInfo>,
}

impl Job {
    pub fn new(key: JobKey, dir: PathBuf, seek_seconds: f64, cancel: CancellationToken) -> Self {
        let (ready_tx, _) = watch::channel(false);
        let shape = JobShape {
            playlist: dir.join("index.m3u8"),
            multi_variant: false,
            variants: Vec::new(),
        };
        Self {
            key,
            dir,
            seek_seconds,
            cancel,
            progress_micros: Arc::new(AtomicU64::new(0)),
            restart_count: AtomicU32::new(0),
            state: StateCell::new(PlaybackState::Starting),
            shape: Mutex::new(shape),
            ready_tx,
            ready_fired: AtomicBool::new(false),
            err: Mutex::new(None),
            created_at: Instant::now(),
            rewrite_memo: Mutex::new(None),
        }
    }

    /// Construct a job for an already-finished playlist found on disk.
    pub fn completed(
        key: JobKey,
        dir: PathBuf,
        playlist: PathBuf,
        multi_variant: bool,
        variants: Vec<VariantInfo>,
    ) -> Self {
        let job = Self::new(key, dir, 0.0, CancellationToken::new());
        job.set_shape(playlist, multi_variant, variants);
        job.state.transition(PlaybackState::Buffering);
        job.state.transition(PlaybackState::Playing);
        job.state.transition(PlaybackState::Completed);
        job.mark_ready();
        job
    }

    /// Settle the output layout. Called once the encoding mode is known.
    pub fn set_shape(&self, playlist: PathBuf, multi_variant: bool, variants: Vec<VariantInfo>) {
        let mut shape = self.shape.lock().unwrap();
        shape.playlist = playlist;
        shape.multi_variant = multi_variant;
        shape.variants = variants;
    }

    /// Top-level playlist path.
    pub fn playlist(&self) -> PathBuf {
        self.shape.lock().unwrap().playlist.clone()
    }

    pub fn multi_variant(&self) -> bool {
        self.shape.lock().unwrap().multi_variant
    }

    pub fn variants(&self) -> Vec<VariantInfo> {
        self.shape.lock().unwrap().variants.clone()
    }

    pub fn state(&self) -> PlaybackState {
        self.state.current()
    }

    pub fn state_cell(&self) -> &StateCell {
        &self.state
    }

    pub fn generation(&self) -> u64 {
        self.state.generation()
    }

    /// Sticky terminal error, if any.
    pub fn error(&self) -> Option<HlsError> {
        self.err.lock().unwrap().clone()
    }

    /// Fire the ready signal. Idempotent; only the first call wins.
    pub fn mark_ready(&self) {
        if !self.ready_fired.swap(true, Ordering::AcqRel) {
            let _ = self.ready_tx.send(true);
            debug!(job_op = "ready", key = %self.key);
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready_fired.load(Ordering::Acquire)
    }

    /// Wait until the ready signal fires or `timeout` elapses.
    ///
    /// Returns the job's sticky error if it became ready by failing.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), HlsError> {
        let mut rx = self.ready_tx.subscribe();
        if !self.is_ready() {
            match tokio::time::timeout(timeout, rx.wait_for(|ready| *ready)).await {
                Ok(Ok(_)) => {}
                Ok(Err(_)) | Err(_) => {
                    return Err(HlsError::TranscoderStartupTimeout {
                        timeout_secs: timeout.as_secs(),
                    });
                }
            }
        }
        match self.error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Record the terminal error (first writer wins), move to Error, and
    /// release waiters.
    pub fn fail(&self, err: HlsError) {
        {
            let mut slot = self.err.lock().unwrap();
            if slot.is_none() {
                *slot = Some(err);
            }
        }
        self.state.transition(PlaybackState::Error);
        self.mark_ready();
    }

    /// Move to Completed and release waiters.
    pub fn complete(&self) {
        self.state.transition(PlaybackState::Completed);
        self.mark_ready();
    }

    /// First playlist observed on disk: Starting → Buffering → Playing.
    ///
    /// `generation` is the job generation captured when the transcoder
    /// launched; a sighting reported by a superseded run is rejected and
    /// moves nothing. Returns whether the job reached Playing.
    pub fn mark_playing(&self, generation: u64) -> bool {
        self.state.advance_to_playing(generation)
    }

    /// A seek or restart replaced this job: regress to Seeking so callers
    /// holding the old handle observe the regression, then bump the
    /// generation so in-flight callbacks from the superseded transcoder
    /// are no longer authoritative.
    pub fn mark_superseded(&self) {
        self.state.transition(PlaybackState::Seeking);
        self.state.bump_generation();
    }

    /// Encoded timeline position: invocation offset plus FFmpeg progress.
    pub fn encoded_position_secs(&self) -> f64 {
        self.seek_seconds + self.progress_micros.load(Ordering::Acquire) as f64 / 1_000_000.0
    }

    /// Whether FFmpeg has reported any progress yet.
    pub fn has_progress(&self) -> bool {
        self.progress_micros.load(Ordering::Acquire) > 0
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::new(
            JobKey::new("t1", 0, 0, -1),
            PathBuf::from("/hls/t1/0/a0-s-1-p00000000"),
            0.0,
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_track_key() {
        assert_eq!(JobKey::new("t", 0, 0, -1).track_key(), "a0-s-1");
        assert_eq!(JobKey::new("t", 0, 2, 3).track_key(), "a2-s3");
        assert!(!JobKey::new("t", 0, 0, -1).burns_subtitles());
        assert!(JobKey::new("t", 0, 0, 0).burns_subtitles());
    }

    #[tokio::test]
    async fn test_ready_fires_exactly_once() {
        let job = Arc::new(job());

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let job = Arc::clone(&job);
                tokio::spawn(async move { job.wait_ready(Duration::from_secs(5)).await })
            })
            .collect();

        job.mark_ready();
        job.mark_ready();
        job.mark_ready();

        for waiter in waiters {
            waiter.await.unwrap().unwrap();
        }
        assert!(job.is_ready());
    }

    #[tokio::test]
    async fn test_wait_ready_after_fire_returns_immediately() {
        let job = job();
        job.mark_ready();
        job.wait_ready(Duration::from_millis(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_ready_timeout() {
        let job = job();
        let err = job.wait_ready(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, HlsError::TranscoderStartupTimeout { .. }));
    }

    #[tokio::test]
    async fn test_fail_is_sticky_and_fires_ready() {
        let job = job();
        job.fail(HlsError::TranscoderStartFailure("first".to_string()));
        job.fail(HlsError::Cancelled);

        assert_eq!(job.state(), PlaybackState::Error);
        let err = job.wait_ready(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, HlsError::TranscoderStartFailure(_)));
        // The first error sticks.
        assert!(matches!(
            job.error(),
            Some(HlsError::TranscoderStartFailure(_))
        ));
    }

    #[tokio::test]
    async fn test_completed_constructor() {
        let job = Job::completed(
            JobKey::new("t1", 0, 0, -1),
            PathBuf::from("/hls/dir"),
            PathBuf::from("/hls/dir/index.m3u8"),
            false,
            Vec::new(),
        );
        assert_eq!(job.state(), PlaybackState::Completed);
        assert!(job.playlist().ends_with("index.m3u8"));
        assert!(!job.multi_variant());
        job.wait_ready(Duration::from_millis(1)).await.unwrap();
    }

    #[test]
    fn test_encoded_position() {
        let job = Job::new(
            JobKey::new("t1", 0, 0, -1),
            PathBuf::from("/d"),
            100.0,
            CancellationToken::new(),
        );
        assert!(!job.has_progress());
        assert_eq!(job.encoded_position_secs(), 100.0);

        job.progress_micros.store(60_000_000, Ordering::Release);
        assert!(job.has_progress());
        assert_eq!(job.encoded_position_secs(), 160.0);
    }

    #[test]
    fn test_mark_playing() {
        let job = job();
        assert!(job.mark_playing(job.generation()));
        assert_eq!(job.state(), PlaybackState::Playing);
    }

    #[test]
    fn test_mark_superseded_regresses_and_bumps_generation() {
        let job = job();
        assert!(job.mark_playing(0));
        assert_eq!(job.generation(), 0);

        job.mark_superseded();
        assert_eq!(job.state(), PlaybackState::Seeking);
        assert_eq!(job.generation(), 1);
    }

    #[test]
    fn test_stale_playlist_sighting_rejected_after_supersede() {
        let job = job();
        assert!(job.mark_playing(0));
        job.mark_superseded();

        // The old transcoder's watchdog reports with its launch-time
        // generation; the superseded job must not move.
        assert!(!job.mark_playing(0));
        assert_eq!(job.state(), PlaybackState::Seeking);

        // Work carrying the current generation is still accepted.
        assert!(job.mark_playing(job.generation()));
        assert_eq!(job.state(), PlaybackState::Playing);
    }

    #[test]
    fn test_supersede_before_first_playlist_only_bumps() {
        let job = job();
        // Starting cannot regress to Seeking, but the generation still
        // advances so the old run's callbacks are invalidated.
        job.mark_superseded();
        assert_eq!(job.state(), PlaybackState::Starting);
        assert_eq!(job.generation(), 1);
        assert!(!job.mark_playing(0));
        assert_eq!(job.state(), PlaybackState::Starting);
    }

    #[test]
    fn test_variant_name() {
        let v = VariantInfo {
            index: 1,
            height: 720,
        };
        assert_eq!(v.name(), "v1");
    }
}
