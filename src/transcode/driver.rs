//! FFmpeg process supervision for one job.
//!
//! The driver owns the child process: it wires stdin to the pipe source,
//! parses progress from stdout, keeps a bounded stderr tail for error
//! reports, watches for the first playlist file, and classifies every
//! exit path. The child is bound to the job's cancellation token and is
//! reaped on every path out of [`run_transcoder`].

use crate::error::{ExitReason, HlsError};
use crate::job::job::Job;
use crate::job::playlist::playlist_file_has_endlist;
use crate::metrics::Metrics;
use crate::source::DataSource;
use crate::transcode::progress::{spawn_progress_task, ProgressStream};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, error, trace, warn};

/// Playlist-readiness poll cadence.
const WATCHDOG_TICK: Duration = Duration::from_millis(500);

/// Lines of stderr retained for error messages.
const STDERR_TAIL_LINES: usize = 64;

/// Everything the driver needs to launch one transcoder.
pub struct DriverParams {
    pub ffmpeg_path: PathBuf,
    pub args: Vec<String>,
    /// Top-level playlist the watchdog waits for.
    pub playlist: PathBuf,
    pub source: DataSource,
    pub startup_timeout: Duration,
}

/// How a transcoder run ended.
#[derive(Debug)]
pub enum TranscoderOutcome {
    /// The job context was cancelled (stop or seek replacement).
    Cancelled,
    /// FFmpeg finished and closed the playlist with ENDLIST.
    Completed,
    /// FFmpeg exited early but left a usable playlist; the manager may
    /// auto-restart. The job is not failed yet.
    PrematureExit {
        reason: ExitReason,
        stderr_tail: String,
    },
    /// Terminal failure; the job error is already set.
    Failed(HlsError),
}

/// Bounded collector for the child's stderr.
#[derive(Clone, Default)]
struct StderrTail {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl StderrTail {
    fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap();
        if lines.len() == STDERR_TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    fn render(&self) -> String {
        let lines = self.lines.lock().unwrap();
        lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

/// Launch FFmpeg and supervise it until it exits or the job is cancelled.
pub async fn run_transcoder(
    params: DriverParams,
    job: Arc<Job>,
    metrics: Arc<Metrics>,
) -> TranscoderOutcome {
    let DriverParams {
        ffmpeg_path,
        args,
        playlist,
        source,
        startup_timeout,
    } = params;

    trace!(driver_op = "spawn", key = %job.key, ffmpeg = %ffmpeg_path.display());
    let mut command = tokio::process::Command::new(&ffmpeg_path);
    command
        .args(&args)
        .stdin(if source.ring().is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            source.close();
            let err = HlsError::TranscoderStartFailure(e.to_string());
            error!(driver_op = "spawn_failed", key = %job.key, error = %e);
            job.fail(err.clone());
            metrics.jobs.record_failed();
            return TranscoderOutcome::Failed(err);
        }
    };

    // Feed the pipe source into stdin; dropping stdin on source EOF lets
    // FFmpeg finish the final segment cleanly.
    if let (Some(ring), Some(mut stdin)) = (source.ring().cloned(), child.stdin.take()) {
        let cancel = job.cancel.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                match ring.read(&mut buf, &cancel).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if stdin.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            let _ = stdin.shutdown().await;
        });
    }

    if let Some(stdout) = child.stdout.take() {
        spawn_progress_task(
            ProgressStream::from_stdout(stdout),
            Arc::clone(&job.progress_micros),
        );
    }

    let stderr_tail = StderrTail::default();
    if let Some(stderr) = child.stderr.take() {
        let tail = stderr_tail.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tail.push(line);
            }
        });
    }

    // Watchdog and reaper in one select loop: poll for the first playlist
    // while waiting on the child and the cancel token. The generation is
    // captured at launch so a sighting reported after this run has been
    // superseded by a seek is rejected instead of moving the job.
    let generation = job.generation();
    let started = Instant::now();
    let mut ticker = tokio::time::interval(WATCHDOG_TICK);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut playlist_seen = false;

    loop {
        tokio::select! {
            _ = job.cancel.cancelled() => {
                debug!(driver_op = "cancelled", key = %job.key);
                let _ = child.kill().await;
                source.close();
                return TranscoderOutcome::Cancelled;
            }
            status = child.wait() => {
                source.close();
                let code = status.ok().and_then(|s| s.code());
                return classify_exit(&job, &playlist, code, &stderr_tail, &metrics);
            }
            _ = ticker.tick(), if !playlist_seen => {
                if playlist.exists() {
                    playlist_seen = true;
                    if job.mark_playing(generation) {
                        debug!(
                            driver_op = "first_playlist",
                            key = %job.key,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                        );
                        metrics.jobs.record_ttff(job.age());
                        job.mark_ready();
                    } else {
                        debug!(
                            driver_op = "stale_playlist_sighting",
                            key = %job.key,
                            generation,
                        );
                    }
                } else if started.elapsed() >= startup_timeout {
                    warn!(
                        driver_op = "startup_timeout",
                        key = %job.key,
                        timeout_secs = startup_timeout.as_secs(),
                    );
                    let _ = child.kill().await;
                    source.close();
                    let err = HlsError::TranscoderStartupTimeout {
                        timeout_secs: startup_timeout.as_secs(),
                    };
                    job.fail(err.clone());
                    job.cancel.cancel();
                    metrics.jobs.record_failed();
                    return TranscoderOutcome::Failed(err);
                }
            }
        }
    }
}

/// Apply the exit-semantics table once the child has been reaped.
fn classify_exit(
    job: &Arc<Job>,
    playlist: &PathBuf,
    exit_code: Option<i32>,
    stderr_tail: &StderrTail,
    metrics: &Arc<Metrics>,
) -> TranscoderOutcome {
    if playlist.exists() {
        let endlist_playlist = if job.multi_variant() {
            job.dir.join("v0").join("index.m3u8")
        } else {
            playlist.clone()
        };
        if playlist_file_has_endlist(&endlist_playlist) {
            debug!(driver_op = "completed", key = %job.key);
            job.complete();
            metrics.jobs.record_completed();
            return TranscoderOutcome::Completed;
        }
        let tail = stderr_tail.render();
        warn!(
            driver_op = "premature_exit",
            key = %job.key,
            exit_code = ?exit_code,
        );
        return TranscoderOutcome::PrematureExit {
            reason: ExitReason::FfmpegExit,
            stderr_tail: tail,
        };
    }

    let err = HlsError::TranscoderRuntimeFailure {
        exit_code,
        stderr_tail: stderr_tail.render(),
    };
    error!(driver_op = "runtime_failure", key = %job.key, exit_code = ?exit_code);
    job.fail(err.clone());
    metrics.jobs.record_failed();
    TranscoderOutcome::Failed(err)
}
