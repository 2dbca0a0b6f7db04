//! ffprobe integration and the persisted codec/resolution cache.
//!
//! Probing a partially-downloaded file is slow and occasionally fails, so
//! results are memoized by absolute path and persisted to JSON. Writes are
//! debounced: many updates coalesce into one atomic file write.

use crate::error::{HlsError, HlsResult};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, trace, warn};

/// Attempts per probe before giving up.
const PROBE_ATTEMPTS: u32 = 3;

/// Delay between probe attempts.
const PROBE_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Debounce window for cache persistence.
const SAVE_DEBOUNCE: Duration = Duration::from_secs(5);

/// Codec flags driving the stream-copy decision.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CodecFlags {
    pub is_h264: bool,
    pub is_aac_audio: bool,
}

/// Resolution, framerate, and duration of the probed file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct MediaInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub duration_secs: f64,
}

/// Combined probe result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeResult {
    pub flags: CodecFlags,
    pub info: MediaInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedEntry<T> {
    #[serde(flatten)]
    value: T,
    last_access: u64,
}

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// On-disk shape of the cache file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedCache {
    #[serde(default)]
    codecs: std::collections::HashMap<String, CachedEntry<CodecFlags>>,
    #[serde(default)]
    media: std::collections::HashMap<String, CachedEntry<MediaInfo>>,
}

// === ffprobe JSON shapes (the fields we read) ===

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

/// Parse `avg_frame_rate` values like `24000/1001`.
fn parse_frame_rate(raw: &str) -> Option<f64> {
    let (num, den) = raw.split_once('/')?;
    let num: f64 = num.parse().ok()?;
    let den: f64 = den.parse().ok()?;
    if den <= 0.0 {
        return None;
    }
    Some(num / den)
}

fn parse_probe_output(json: &str) -> HlsResult<ProbeResult> {
    let output: FfprobeOutput = serde_json::from_str(json)?;

    let video = output
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| HlsError::ProbeFailure {
            path: String::new(),
            reason: "no video stream".to_string(),
        })?;
    let audio = output
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("audio"));

    let flags = CodecFlags {
        is_h264: video.codec_name.as_deref() == Some("h264"),
        is_aac_audio: audio.and_then(|a| a.codec_name.as_deref()) == Some("aac"),
    };
    let info = MediaInfo {
        width: video.width.unwrap_or(0),
        height: video.height.unwrap_or(0),
        fps: video
            .avg_frame_rate
            .as_deref()
            .and_then(parse_frame_rate)
            .unwrap_or(0.0),
        duration_secs: output
            .format
            .and_then(|f| f.duration)
            .and_then(|d| d.parse().ok())
            .unwrap_or(0.0),
    };
    Ok(ProbeResult { flags, info })
}

/// Path-keyed probe cache with debounced JSON persistence.
pub struct MediaProbe {
    ffprobe_path: PathBuf,
    cache_path: PathBuf,
    codecs: DashMap<PathBuf, CachedEntry<CodecFlags>>,
    media: DashMap<PathBuf, CachedEntry<MediaInfo>>,
    max_entries: usize,
    save_pending: AtomicBool,
}

impl MediaProbe {
    /// Create the cache, loading any persisted entries from `cache_path`.
    pub fn new(ffprobe_path: PathBuf, cache_path: PathBuf, max_entries: usize) -> Self {
        let probe = Self {
            ffprobe_path,
            cache_path,
            codecs: DashMap::new(),
            media: DashMap::new(),
            max_entries,
            save_pending: AtomicBool::new(false),
        };
        probe.load();
        probe
    }

    fn load(&self) {
        let Ok(content) = std::fs::read_to_string(&self.cache_path) else {
            return;
        };
        match serde_json::from_str::<PersistedCache>(&content) {
            Ok(persisted) => {
                for (path, entry) in persisted.codecs {
                    self.codecs.insert(PathBuf::from(path), entry);
                }
                for (path, entry) in persisted.media {
                    self.media.insert(PathBuf::from(path), entry);
                }
                debug!(
                    probe_op = "cache_loaded",
                    codecs = self.codecs.len(),
                    media = self.media.len()
                );
            }
            Err(e) => warn!(probe_op = "cache_load_failed", error = %e),
        }
    }

    /// Cached result for `path`, refreshing its access time.
    pub fn cached(&self, path: &Path) -> Option<ProbeResult> {
        let flags = {
            let mut entry = self.codecs.get_mut(path)?;
            entry.last_access = now_epoch();
            entry.value
        };
        let info = {
            let mut entry = self.media.get_mut(path)?;
            entry.last_access = now_epoch();
            entry.value
        };
        trace!(probe_op = "cache_hit", path = %path.display());
        Some(ProbeResult { flags, info })
    }

    /// Probe `path`, consulting the cache first. Retries transient ffprobe
    /// failures (common on files still assembling their moov atom).
    pub async fn probe(self: &Arc<Self>, path: &Path) -> HlsResult<ProbeResult> {
        if let Some(result) = self.cached(path) {
            return Ok(result);
        }

        let mut last_err = String::new();
        for attempt in 1..=PROBE_ATTEMPTS {
            match self.run_ffprobe(path).await {
                Ok(result) => {
                    self.insert(path.to_path_buf(), result);
                    return Ok(result);
                }
                Err(e) => {
                    last_err = e.to_string();
                    if attempt < PROBE_ATTEMPTS {
                        debug!(
                            probe_op = "retry",
                            path = %path.display(),
                            attempt,
                            error = %last_err
                        );
                        tokio::time::sleep(PROBE_RETRY_DELAY).await;
                    }
                }
            }
        }
        Err(HlsError::ProbeFailure {
            path: path.display().to_string(),
            reason: last_err,
        })
    }

    async fn run_ffprobe(&self, path: &Path) -> HlsResult<ProbeResult> {
        let output = tokio::process::Command::new(&self.ffprobe_path)
            .args(["-v", "quiet", "-print_format", "json", "-show_streams", "-show_format"])
            .arg(path)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| HlsError::ProbeFailure {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(HlsError::ProbeFailure {
                path: path.display().to_string(),
                reason: format!("ffprobe exited with {:?}", output.status.code()),
            });
        }
        let json = String::from_utf8_lossy(&output.stdout);
        parse_probe_output(&json).map_err(|e| match e {
            HlsError::ProbeFailure { reason, .. } => HlsError::ProbeFailure {
                path: path.display().to_string(),
                reason,
            },
            other => other,
        })
    }

    fn insert(self: &Arc<Self>, path: PathBuf, result: ProbeResult) {
        let now = now_epoch();
        self.codecs.insert(
            path.clone(),
            CachedEntry {
                value: result.flags,
                last_access: now,
            },
        );
        self.media.insert(
            path,
            CachedEntry {
                value: result.info,
                last_access: now,
            },
        );
        self.evict_over_cap();
        self.schedule_save();
    }

    /// Drop least-recently-accessed entries once the codec map exceeds its
    /// cap; the media map shadows the same key set.
    fn evict_over_cap(&self) {
        while self.codecs.len() > self.max_entries {
            let oldest = self
                .codecs
                .iter()
                .min_by_key(|e| e.value().last_access)
                .map(|e| e.key().clone());
            match oldest {
                Some(key) => {
                    self.codecs.remove(&key);
                    self.media.remove(&key);
                    trace!(probe_op = "evicted", path = %key.display());
                }
                None => break,
            }
        }
    }

    /// Arm the single debounce timer; further updates within the window
    /// piggyback on the pending write.
    fn schedule_save(self: &Arc<Self>) {
        if self.save_pending.swap(true, Ordering::AcqRel) {
            return;
        }
        let probe = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(SAVE_DEBOUNCE).await;
            probe.save_pending.store(false, Ordering::Release);
            if let Err(e) = probe.save().await {
                warn!(probe_op = "cache_save_failed", error = %e);
            }
        });
    }

    /// Persist the cache now: serialize a snapshot, write to a temp file,
    /// rename into place.
    pub async fn save(&self) -> HlsResult<()> {
        let mut persisted = PersistedCache::default();
        for entry in self.codecs.iter() {
            persisted.codecs.insert(
                entry.key().to_string_lossy().into_owned(),
                entry.value().clone(),
            );
        }
        for entry in self.media.iter() {
            persisted.media.insert(
                entry.key().to_string_lossy().into_owned(),
                entry.value().clone(),
            );
        }
        let json = serde_json::to_vec_pretty(&persisted)?;

        if let Some(parent) = self.cache_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.cache_path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &self.cache_path).await?;
        debug!(
            probe_op = "cache_saved",
            entries = self.codecs.len(),
            path = %self.cache_path.display()
        );
        Ok(())
    }

    /// Flush any pending state to disk. Called on shutdown.
    pub async fn flush(&self) {
        self.save_pending.store(false, Ordering::Release);
        if let Err(e) = self.save().await {
            warn!(probe_op = "cache_flush_failed", error = %e);
        }
    }

    pub fn len(&self) -> usize {
        self.codecs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codecs.is_empty()
    }
}
