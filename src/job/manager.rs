//! Job lifecycle coordination.
//!
//! The manager owns the key→job map and everything that mutates it:
//! ensure, seek routing (soft versus hard), stop, compare-and-delete
//! cleanup, purge, and the one-shot auto-restart after a premature
//! transcoder exit. The map lock guards only the map and is never held
//! across subprocess or slow file I/O; launch work runs in spawned tasks
//! and synchronizes with callers through each job's `ready` signal.

use crate::cache::segment::SegmentKey;
use crate::cache::SegmentCache;
use crate::config::{Config, EncodingProfile};
use crate::engine::{PiecePriority, PieceScheduler, StreamProvider};
use crate::error::{ExitReason, HlsError, HlsResult};
use crate::job::job::{Job, JobKey};
use crate::job::playlist::{completed_playlist, parse_media_playlist};
use crate::metrics::{HealthSnapshot, Metrics};
use crate::probe::MediaProbe;
use crate::source::{seek_boost_range, select_data_source, DataSource};
use crate::transcode::{
    build_args, choose_mode, playlist_path, run_transcoder, DriverParams, SubtitleBurn,
    TranscodeSpec, TranscoderOutcome,
};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Two hard seeks inside this window are logged as a seek storm.
const ANTI_STORM_WINDOW: Duration = Duration::from_millis(150);

/// Approximate wall-clock cost of a transcoder restart; a gap ahead of
/// the encoder smaller than this is cheaper to wait out than to restart.
const ESTIMATED_RESTART_COST_SECS: f64 = 12.0;

/// How long the deferred cleanup waits for a replacement job's ready
/// before freeing the old job's resources anyway.
const HARD_SEEK_CLEANUP_WAIT: Duration = Duration::from_secs(8);

/// Grace between cancelling the old transcoder and removing its
/// directory, so the kill has landed before the files go away.
const CLEANUP_KILL_GRACE: Duration = Duration::from_millis(250);

/// Harvester cadence for sweeping finished segments into the cache.
const HARVEST_TICK: Duration = Duration::from_secs(2);

/// How long the pipe source pre-buffers before FFmpeg starts.
const PREBUFFER_TIMEOUT: Duration = Duration::from_secs(10);

/// Budget for the piece-priority boost call around a seek target.
const PRIORITY_BOOST_TIMEOUT: Duration = Duration::from_secs(2);

/// Suggested wait for playlist readiness per HTTP request.
pub const PLAYLIST_READY_WAIT: Duration = Duration::from_secs(90);

/// Suggested wait for seek completion per HTTP request; after this the
/// client polls.
pub const SEEK_READY_WAIT: Duration = Duration::from_secs(5);

/// How a seek request was routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekMode {
    /// Target is inside or near already-produced content; no restart.
    Soft,
    /// The job was replaced by a fresh transcoder at the target.
    Hard,
}

/// The HLS job manager.
pub struct JobManager {
    config: Config,
    /// Runtime-mutable encoding settings; changes take effect on the next
    /// ensure/hard seek via the profile hash in the directory name.
    settings: RwLock<EncodingProfile>,
    jobs: RwLock<HashMap<JobKey, Arc<Job>>>,
    streams: Arc<dyn StreamProvider>,
    scheduler: Arc<dyn PieceScheduler>,
    probe: Arc<MediaProbe>,
    segments: Arc<SegmentCache>,
    metrics: Arc<Metrics>,
    last_hard_seek: Mutex<HashMap<JobKey, Instant>>,
    root_cancel: CancellationToken,
}

impl JobManager {
    /// Build the manager and its caches. The segment cache is rebuilt
    /// from disk so completed work survives a process restart.
    pub fn new(
        config: Config,
        streams: Arc<dyn StreamProvider>,
        scheduler: Arc<dyn PieceScheduler>,
    ) -> Arc<Self> {
        let metrics = Arc::new(Metrics::new());
        let probe = Arc::new(MediaProbe::new(
            config.transcoder.ffprobe_path.clone(),
            config.paths.hls_base_dir.join("codec_cache.json"),
            config.cache.codec_cache_entries,
        ));
        let segments = Arc::new(SegmentCache::new(
            config.paths.segment_cache_dir.clone(),
            config.cache.max_bytes,
            Duration::from_secs(config.cache.max_age_secs),
            Arc::clone(&metrics.cache),
        ));
        if let Err(e) = segments.rebuild() {
            warn!(job_op = "cache_rebuild_failed", error = %e);
        }

        Arc::new(Self {
            settings: RwLock::new(config.encoding.clone()),
            config,
            jobs: RwLock::new(HashMap::new()),
            streams,
            scheduler,
            probe,
            segments,
            metrics,
            last_hard_seek: Mutex::new(HashMap::new()),
            root_cancel: CancellationToken::new(),
        })
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn segment_cache(&self) -> &Arc<SegmentCache> {
        &self.segments
    }

    pub fn media_probe(&self) -> &Arc<MediaProbe> {
        &self.probe
    }

    /// Current encoding settings.
    pub fn encoding_profile(&self) -> EncodingProfile {
        self.settings.read().unwrap().clone()
    }

    /// Replace the encoding settings. Existing jobs keep running with the
    /// old profile; new job directories pick up the new hash.
    pub fn set_encoding_profile(&self, profile: EncodingProfile) {
        info!(
            job_op = "settings_update",
            preset = %profile.preset,
            crf = profile.crf,
            profile_hash = %profile.profile_hash(),
        );
        *self.settings.write().unwrap() = profile;
    }

    pub fn health_snapshot(&self) -> HealthSnapshot {
        self.metrics.snapshot(self.segments.total_size())
    }

    /// Canonical job directory for a key under the current profile.
    fn job_dir(&self, key: &JobKey, profile: &EncodingProfile) -> PathBuf {
        self.config
            .paths
            .hls_base_dir
            .join(&key.torrent_id)
            .join(key.file_index.to_string())
            .join(format!("{}-p{}", key.track_key(), profile.profile_hash()))
    }

    /// Get or create the job for `key`.
    ///
    /// Fast path returns the existing job. The slow path reuses a
    /// finished playlist from a previous run as a Completed job, or
    /// creates a fresh directory and launches a transcoder. Callers
    /// synchronize on the job's `ready` signal.
    pub fn ensure_job(self: &Arc<Self>, key: JobKey) -> HlsResult<Arc<Job>> {
        if let Some(job) = self.jobs.read().unwrap().get(&key) {
            return Ok(Arc::clone(job));
        }

        let profile = self.encoding_profile();
        let dir = self.job_dir(&key, &profile);

        let mut jobs = self.jobs.write().unwrap();
        if let Some(job) = jobs.get(&key) {
            return Ok(Arc::clone(job));
        }

        // A closed playlist from an earlier run serves as-is.
        if let Some((playlist, multi_variant)) = completed_playlist(&dir) {
            info!(job_op = "reuse_completed", key = %key, dir = %dir.display());
            let variants = discover_variants(&dir);
            let job = Arc::new(Job::completed(
                key.clone(),
                dir,
                playlist,
                multi_variant,
                variants,
            ));
            jobs.insert(key, Arc::clone(&job));
            self.metrics.jobs.job_registered();
            return Ok(job);
        }

        // Anything else in the directory is stale output from an
        // interrupted run.
        if dir.exists() {
            let _ = std::fs::remove_dir_all(&dir);
        }
        std::fs::create_dir_all(&dir).map_err(|e| HlsError::Io(e.to_string()))?;

        let job = Arc::new(Job::new(
            key.clone(),
            dir,
            0.0,
            self.root_cancel.child_token(),
        ));
        jobs.insert(key.clone(), Arc::clone(&job));
        drop(jobs);

        info!(job_op = "ensure_new", key = %key, dir = %job.dir.display());
        self.metrics.jobs.record_started();
        self.metrics.jobs.job_registered();
        self.spawn_launch(Arc::clone(&job));
        Ok(job)
    }

    /// Route a seek request: continue in place when the target is inside
    /// (or near) produced content, otherwise replace the job with a fresh
    /// transcoder at the target.
    pub fn seek_job(self: &Arc<Self>, key: JobKey, target_sec: f64) -> HlsResult<(Arc<Job>, SeekMode)> {
        self.metrics.seeks.record_request();
        if !target_sec.is_finite() || target_sec < 0.0 {
            return Err(HlsError::InvalidInput(format!(
                "seek target {target_sec} out of range"
            )));
        }

        // No current job: a seek is just an ensure at the target offset.
        let Some(current) = self.jobs.read().unwrap().get(&key).map(Arc::clone) else {
            let job = self.start_seek_replacement(key, target_sec, None)?;
            self.metrics.seeks.record_hard();
            return Ok((job, SeekMode::Hard));
        };

        // Decide the mode against a lock-free snapshot; re-validate after
        // taking the write lock.
        if self.is_soft_seek(&current, target_sec) {
            self.metrics.seeks.record_soft();
            debug!(job_op = "seek_soft", key = %key, target_sec);
            return Ok((current, SeekMode::Soft));
        }

        self.metrics.seeks.record_hard();
        self.anti_storm_check(&key);
        let job = self.start_seek_replacement(key, target_sec, Some(current))?;
        Ok((job, SeekMode::Hard))
    }

    /// Soft-seek decision per the produced-content window.
    ///
    /// `progress_micros == 0` means FFmpeg has not reported yet, not that
    /// the encoder is stuck at the start; in that case only the
    /// 2×segment-duration band applies.
    fn is_soft_seek(&self, job: &Arc<Job>, target_sec: f64) -> bool {
        if job.state() == crate::job::state::PlaybackState::Completed {
            return true;
        }
        if job.error().is_some() {
            return false;
        }

        let segment_duration = self.encoding_profile().segment_duration_secs as f64;
        if (target_sec - job.seek_seconds).abs() < 2.0 * segment_duration {
            return true;
        }
        if job.has_progress() {
            let encoded_until = job.encoded_position_secs();
            if target_sec >= job.seek_seconds && target_sec <= encoded_until {
                return true;
            }
            if target_sec > encoded_until
                && target_sec - encoded_until < ESTIMATED_RESTART_COST_SECS
            {
                return true;
            }
        }
        false
    }

    /// Log (never throttle) rapid consecutive hard seeks on one key.
    fn anti_storm_check(&self, key: &JobKey) {
        let mut last = self.last_hard_seek.lock().unwrap();
        let now = Instant::now();
        if let Some(previous) = last.insert(key.clone(), now) {
            if now.duration_since(previous) < ANTI_STORM_WINDOW {
                self.metrics.seeks.record_storm();
                debug!(
                    job_op = "seek_storm",
                    key = %key,
                    since_last_ms = now.duration_since(previous).as_millis() as u64,
                );
            }
        }
    }

    /// Register a replacement job at `target_sec` and schedule the old
    /// job's deferred teardown.
    fn start_seek_replacement(
        self: &Arc<Self>,
        key: JobKey,
        target_sec: f64,
        old: Option<Arc<Job>>,
    ) -> HlsResult<Arc<Job>> {
        let profile = self.encoding_profile();
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let dir = if target_sec > 0.0 {
            let base = self.job_dir(&key, &profile);
            PathBuf::from(format!("{}-seek-{}", base.display(), nanos))
        } else {
            self.job_dir(&key, &profile)
        };

        let mut jobs = self.jobs.write().unwrap();
        // Re-validate under the lock: another seek may have won the race.
        if let (Some(expected), Some(entry)) = (&old, jobs.get(&key)) {
            if !Arc::ptr_eq(expected, entry) {
                return Ok(Arc::clone(entry));
            }
        }

        if dir.exists() {
            let _ = std::fs::remove_dir_all(&dir);
        }
        std::fs::create_dir_all(&dir).map_err(|e| HlsError::Io(e.to_string()))?;

        let job = Arc::new(Job::new(
            key.clone(),
            dir,
            target_sec,
            self.root_cancel.child_token(),
        ));
        let previous = jobs.insert(key.clone(), Arc::clone(&job));
        drop(jobs);

        info!(
            job_op = "seek_hard",
            key = %key,
            target_sec,
            dir = %job.dir.display(),
        );
        self.metrics.jobs.record_started();
        if previous.is_none() {
            self.metrics.jobs.job_registered();
        }

        if let Some(old_job) = previous {
            // Callers still holding the old handle observe the regression
            // to Seeking before the cancel lands, and the generation bump
            // invalidates the old transcoder's in-flight callbacks.
            old_job.mark_superseded();
            self.spawn_deferred_cleanup(old_job, Arc::clone(&job));
        }
        self.spawn_launch(Arc::clone(&job));
        Ok(job)
    }

    /// Tear down a replaced job only after its successor is serving (or
    /// the wait cap expires): cancel the old transcoder, give the kill a
    /// moment to land, then remove the old directory.
    fn spawn_deferred_cleanup(self: &Arc<Self>, old: Arc<Job>, new: Arc<Job>) {
        tokio::spawn(async move {
            let _ = new.wait_ready(HARD_SEEK_CLEANUP_WAIT).await;
            old.cancel.cancel();
            old.mark_ready();
            tokio::time::sleep(CLEANUP_KILL_GRACE).await;
            if old.dir != new.dir {
                if let Err(e) = tokio::fs::remove_dir_all(&old.dir).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(
                            job_op = "old_dir_remove_failed",
                            dir = %old.dir.display(),
                            error = %e,
                        );
                    }
                }
            }
            debug!(job_op = "old_job_cleaned", key = %old.key);
        });
    }

    /// Remove the job for `key` from the map and cancel it.
    pub fn stop_job(&self, key: &JobKey) -> Option<Arc<Job>> {
        let removed = self.jobs.write().unwrap().remove(key);
        if let Some(job) = &removed {
            info!(job_op = "stop", key = %key);
            job.cancel.cancel();
            job.mark_ready();
            self.metrics.jobs.job_unregistered();
        }
        removed
    }

    /// Compare-and-delete: remove the map entry only if it still points
    /// at `job`. Protects against racing with a seek replacement.
    pub fn cleanup_job(&self, key: &JobKey, job: &Arc<Job>) -> bool {
        let mut jobs = self.jobs.write().unwrap();
        match jobs.get(key) {
            Some(entry) if Arc::ptr_eq(entry, job) => {
                jobs.remove(key);
                drop(jobs);
                job.cancel.cancel();
                self.metrics.jobs.job_unregistered();
                debug!(job_op = "cleanup", key = %key);
                true
            }
            _ => false,
        }
    }

    /// Stop every job of a torrent, purge its cached segments, and remove
    /// its working directories in the background.
    pub fn purge_torrent(self: &Arc<Self>, torrent_id: &str) -> usize {
        let removed: Vec<Arc<Job>> = {
            let mut jobs = self.jobs.write().unwrap();
            let keys: Vec<JobKey> = jobs
                .keys()
                .filter(|k| k.torrent_id == torrent_id)
                .cloned()
                .collect();
            keys.iter().filter_map(|k| jobs.remove(k)).collect()
        };
        for job in &removed {
            job.cancel.cancel();
            job.mark_ready();
            self.metrics.jobs.job_unregistered();
        }
        self.segments.purge_torrent(torrent_id);

        let dir = self.config.paths.hls_base_dir.join(torrent_id);
        tokio::spawn(async move {
            let _ = tokio::fs::remove_dir_all(&dir).await;
        });

        info!(job_op = "purge", torrent_id, jobs_stopped = removed.len());
        removed.len()
    }

    /// Cancel everything and flush the codec cache to disk.
    pub async fn shutdown(&self) {
        info!(job_op = "shutdown");
        self.root_cancel.cancel();
        let jobs: Vec<Arc<Job>> = {
            let mut map = self.jobs.write().unwrap();
            map.drain().map(|(_, job)| job).collect()
        };
        for job in jobs {
            job.cancel.cancel();
            job.mark_ready();
            self.metrics.jobs.job_unregistered();
        }
        self.probe.flush().await;
        self.metrics.log_summary();
    }

    // === Launch path ===

    fn spawn_launch(self: &Arc<Self>, job: Arc<Job>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.launch_job(job).await;
        });
    }

    /// Open the stream, pick the data source, assemble arguments, and
    /// supervise the transcoder to completion. Runs as a background task;
    /// every failure path fires the job's ready signal via `fail`.
    async fn launch_job(self: Arc<Self>, job: Arc<Job>) {
        let key = job.key.clone();
        let handle = match self
            .streams
            .open_stream(&key.torrent_id, key.file_index)
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                warn!(job_op = "stream_unavailable", key = %key, error = %e);
                job.fail(match e {
                    err @ HlsError::InputUnavailable { .. } => err,
                    other => HlsError::InputUnavailable {
                        torrent_id: key.torrent_id.clone(),
                        file_index: key.file_index,
                        reason: other.to_string(),
                    },
                });
                self.metrics.jobs.record_failed();
                return;
            }
        };
        let file = handle.file.clone();
        let data_dir = self.config.paths.data_dir.clone();

        // Probe the on-disk file when possible; fall back to any cached
        // result (the file may have been probed before it left disk).
        let abs_path = file.absolute_path(&data_dir);
        let probe = if abs_path.exists() {
            self.probe.probe(&abs_path).await.ok()
        } else {
            self.probe.cached(&abs_path)
        };

        let subtitle = if key.burns_subtitles() {
            match crate::source::selector::resolve_subtitle_source(
                &file,
                &data_dir,
                key.subtitle_track,
            )
            .await
            {
                Ok(source) => source.map(|source| SubtitleBurn {
                    source,
                    stream_index: key.subtitle_track,
                }),
                Err(e) => {
                    warn!(job_op = "subtitle_unavailable", key = %key);
                    job.fail(e);
                    self.metrics.jobs.record_failed();
                    return;
                }
            }
        } else {
            None
        };

        let source = match select_data_source(
            handle,
            job.seek_seconds,
            &data_dir,
            &self.config.buffer,
            &job.cancel,
        )
        .await
        {
            Ok(source) => source,
            Err(e) => {
                let err = match e {
                    HlsError::InputUnavailable { reason, .. } => HlsError::InputUnavailable {
                        torrent_id: key.torrent_id.clone(),
                        file_index: key.file_index,
                        reason,
                    },
                    other => other,
                };
                warn!(job_op = "source_unavailable", key = %key, error = %err);
                job.fail(err);
                self.metrics.jobs.record_failed();
                return;
            }
        };

        // Bias the piece picker toward the seek target before FFmpeg
        // starts pulling.
        if job.seek_seconds > 0.0 {
            let duration = probe.map(|p| p.info.duration_secs).unwrap_or(0.0);
            if let Some(range) = seek_boost_range(job.seek_seconds, duration, file.length) {
                let boost = tokio::time::timeout(
                    PRIORITY_BOOST_TIMEOUT,
                    self.scheduler.set_piece_priority(
                        &key.torrent_id,
                        key.file_index,
                        range,
                        PiecePriority::Now,
                    ),
                )
                .await;
                match boost {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!(job_op = "boost_failed", key = %key, error = %e),
                    Err(_) => debug!(job_op = "boost_timeout", key = %key),
                }
            }
        }

        let profile = self.encoding_profile();
        let local_file = matches!(
            source,
            DataSource::DirectFile { .. } | DataSource::PartialFile { .. }
        );
        let mode = choose_mode(local_file, subtitle.is_some(), probe.as_ref());
        let multi_variant = mode.is_multi_variant();
        let playlist = playlist_path(&job.dir, multi_variant);
        job.set_shape(playlist.clone(), multi_variant, mode.variants().to_vec());

        if let Some(ring) = source.ring() {
            let _ = ring
                .prebuffer(
                    self.config.buffer.prebuffer_bytes,
                    PREBUFFER_TIMEOUT,
                    &job.cancel,
                )
                .await;
        }
        if job.cancel.is_cancelled() {
            source.close();
            job.mark_ready();
            return;
        }

        let args = build_args(&TranscodeSpec {
            input_spec: source.input_spec(),
            seekable: source.is_seekable(),
            http: source.is_http(),
            seek_seconds: job.seek_seconds,
            audio_track: key.audio_track,
            subtitle,
            mode: &mode,
            profile: &profile,
            job_dir: &job.dir,
        });

        // The harvester stops itself on cancellation or once the job goes
        // terminal, after a final sweep for the tail segments.
        self.spawn_harvester(Arc::clone(&job));
        let outcome = run_transcoder(
            DriverParams {
                ffmpeg_path: self.config.transcoder.ffmpeg_path.clone(),
                args,
                playlist,
                source,
                startup_timeout: Duration::from_secs(self.config.transcoder.startup_timeout_secs),
            },
            Arc::clone(&job),
            Arc::clone(&self.metrics),
        )
        .await;

        match outcome {
            TranscoderOutcome::Completed | TranscoderOutcome::Cancelled => {}
            TranscoderOutcome::Failed(_) => {}
            TranscoderOutcome::PrematureExit {
                reason,
                stderr_tail,
            } => {
                self.auto_restart(job, reason, stderr_tail);
            }
        }
    }

    /// One auto-restart per original job: register a successor with the
    /// same directory and a fresh ready signal, then relaunch. A second
    /// premature exit is terminal.
    fn auto_restart(self: &Arc<Self>, old: Arc<Job>, reason: ExitReason, stderr_tail: String) {
        if old.cancel.is_cancelled() {
            return;
        }
        let restarts = old.restart_count.load(std::sync::atomic::Ordering::Acquire);
        if restarts >= 1 {
            warn!(job_op = "restart_budget_spent", key = %old.key);
            old.fail(HlsError::TranscoderPrematureExit { stderr_tail });
            self.metrics.jobs.record_failed();
            return;
        }

        let successor = {
            let mut jobs = self.jobs.write().unwrap();
            match jobs.get(&old.key) {
                Some(entry) if Arc::ptr_eq(entry, &old) => {
                    let successor = Arc::new(Job::new(
                        old.key.clone(),
                        old.dir.clone(),
                        old.seek_seconds,
                        self.root_cancel.child_token(),
                    ));
                    successor
                        .restart_count
                        .store(restarts + 1, std::sync::atomic::Ordering::Release);
                    jobs.insert(old.key.clone(), Arc::clone(&successor));
                    successor
                }
                // A seek or stop already replaced the job; nothing to do.
                _ => return,
            }
        };

        self.metrics.jobs.record_auto_restart(&reason);
        // Same observable sequence as a hard seek: the superseded job
        // regresses to Seeking (observers fire) and its generation moves
        // past any callback the dead transcoder still has in flight.
        old.mark_superseded();
        old.cancel.cancel();
        old.mark_ready();
        info!(job_op = "auto_restart", key = %successor.key, reason = %reason);
        self.spawn_launch(successor);
    }

    // === Segment harvesting ===

    /// Sweep finished segments from the job directory into the segment
    /// cache every couple of seconds. Segment timing comes from the
    /// playlist's EXTINF entries anchored at the job's seek offset.
    fn spawn_harvester(self: &Arc<Self>, job: Arc<Job>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HARVEST_TICK);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut stored: HashSet<PathBuf> = HashSet::new();
            loop {
                tokio::select! {
                    _ = job.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        manager.harvest_once(&job, &mut stored);
                        if job.state().is_terminal() {
                            // One final sweep caught the tail; done.
                            break;
                        }
                    }
                }
            }
        })
    }

    fn harvest_once(&self, job: &Arc<Job>, stored: &mut HashSet<PathBuf>) {
        let playlists: Vec<(String, PathBuf)> = if job.multi_variant() {
            job.variants()
                .iter()
                .map(|v| (v.name(), job.dir.join(v.name()).join("index.m3u8")))
                .collect()
        } else {
            vec![(String::new(), job.dir.join("index.m3u8"))]
        };

        for (variant, playlist) in playlists {
            let Ok(content) = std::fs::read_to_string(&playlist) else {
                continue;
            };
            let base_dir = playlist.parent().unwrap_or(&job.dir).to_path_buf();
            let mut entries = parse_media_playlist(&content, job.seek_seconds);
            // The last listed segment may still be mid-write unless the
            // playlist is closed.
            if !crate::job::playlist::has_endlist(&content) {
                entries.pop();
            }
            for entry in entries {
                let seg_path = base_dir.join(&entry.uri);
                if stored.contains(&seg_path) || !seg_path.exists() {
                    continue;
                }
                let cache_key = SegmentKey::new(
                    &job.key.torrent_id,
                    job.key.file_index,
                    job.key.audio_track,
                    job.key.subtitle_track,
                    &variant,
                );
                match self
                    .segments
                    .store(cache_key, entry.start_sec, entry.end_sec(), &seg_path)
                {
                    Ok(_) => {
                        stored.insert(seg_path);
                    }
                    Err(e) => {
                        // Cache trouble never fails the job.
                        debug!(job_op = "harvest_store_failed", key = %job.key, error = %e);
                    }
                }
            }
        }
    }
}

/// Enumerate `v{i}` variant directories of a finished multi-variant job.
fn discover_variants(dir: &PathBuf) -> Vec<crate::job::job::VariantInfo> {
    let mut indices: Vec<usize> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .filter_map(|e| {
                    e.file_name()
                        .to_str()
                        .and_then(|name| name.strip_prefix('v').and_then(|i| i.parse().ok()))
                })
                .collect()
        })
        .unwrap_or_default();
    indices.sort_unstable();
    indices
        .into_iter()
        .map(|index| crate::job::job::VariantInfo { index, height: 0 })
        .collect()
}
