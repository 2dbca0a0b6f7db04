//! Picks how FFmpeg ingests the torrent bytes.
//!
//! Direct file unlocks FFmpeg's seekable-input fast path, the pipe keeps
//! incomplete files safe to read, HTTP covers the completed-but-off-disk
//! case (memory storage), and partial-direct bootstraps playback on a
//! growing file with zero buffering latency.

use crate::config::BufferConfig;
use crate::engine::{StreamFile, StreamHandle};
use crate::error::{HlsError, HlsResult};
use crate::source::ring_buffer::{spawn_producer, RingBuffer};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Minimum on-disk size before a growing file is handed to FFmpeg directly.
pub const PARTIAL_DIRECT_MIN_BYTES: u64 = 10 * 1024 * 1024;

/// Completeness ratio at which a file is treated as complete for seeking.
pub const QUASI_COMPLETE_RATIO: f64 = 0.95;

/// Half-width of the piece-priority boost window around a seek target.
pub const BOOST_WINDOW_BYTES: u64 = 8 * 1024 * 1024;

/// The selected transcoder input.
pub enum DataSource {
    /// Fully (or quasi-fully) downloaded file on disk.
    DirectFile { path: PathBuf },
    /// Growing on-disk file, read from byte 0 while the download continues.
    PartialFile { path: PathBuf },
    /// Engine byte-range endpoint; FFmpeg fetches it itself.
    Http { url: String },
    /// Ring buffer fed by the torrent reader, wired to FFmpeg's stdin.
    Pipe { ring: Arc<RingBuffer> },
}

impl DataSource {
    /// The `-i` argument handed to FFmpeg.
    pub fn input_spec(&self) -> String {
        match self {
            DataSource::DirectFile { path } | DataSource::PartialFile { path } => {
                path.to_string_lossy().into_owned()
            }
            DataSource::Http { url } => url.clone(),
            DataSource::Pipe { .. } => "pipe:0".to_string(),
        }
    }

    /// Whether FFmpeg can seek this input. Drives the probe-window sizing
    /// and forbids `-ss` tricks that only work on seekable inputs.
    pub fn is_seekable(&self) -> bool {
        !matches!(self, DataSource::Pipe { .. })
    }

    pub fn is_http(&self) -> bool {
        matches!(self, DataSource::Http { .. })
    }

    pub fn ring(&self) -> Option<&Arc<RingBuffer>> {
        match self {
            DataSource::Pipe { ring } => Some(ring),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DataSource::DirectFile { .. } => "direct",
            DataSource::PartialFile { .. } => "partial_direct",
            DataSource::Http { .. } => "http",
            DataSource::Pipe { .. } => "pipe",
        }
    }

    /// Release the source. The pipe ring is closed exactly once here; the
    /// producer task observes the close (or the job cancel) and exits.
    pub fn close(&self) {
        if let DataSource::Pipe { ring } = self {
            ring.close();
        }
    }
}

/// Physical size of `path` on disk, or `None` when it does not exist.
async fn physical_size(path: &Path) -> Option<u64> {
    tokio::fs::metadata(path).await.ok().map(|m| m.len())
}

/// Apply the decision table: first match wins.
///
/// Consumes the stream handle; for pipe sources the reader is switched to
/// responsive mode and moved into a producer task bound to `cancel`.
pub async fn select_data_source(
    handle: StreamHandle,
    seek_seconds: f64,
    data_dir: &Path,
    buffer: &BufferConfig,
    cancel: &CancellationToken,
) -> HlsResult<DataSource> {
    let file = &handle.file;
    let abs = file.absolute_path(data_dir);
    let on_disk = physical_size(&abs).await;
    let completeness = file.completeness();

    let source = if file.is_complete() && on_disk.is_some() {
        DataSource::DirectFile { path: abs }
    } else if file.completeness() >= QUASI_COMPLETE_RATIO && on_disk.is_some() && seek_seconds > 0.0
    {
        // Quasi-complete counts as complete for seek convenience.
        DataSource::DirectFile { path: abs }
    } else if seek_seconds == 0.0
        && on_disk.is_some_and(|size| size >= PARTIAL_DIRECT_MIN_BYTES && size < file.length)
    {
        DataSource::PartialFile { path: abs }
    } else if seek_seconds > 0.0 && file.is_complete() && on_disk.is_none() {
        match handle.range_url.clone() {
            Some(url) => DataSource::Http { url },
            None => pipe_source(handle, buffer, cancel)?,
        }
    } else {
        pipe_source(handle, buffer, cancel)?
    };

    debug!(
        source_op = "selected",
        kind = source.kind(),
        seek_seconds,
        completeness,
    );
    Ok(source)
}

fn pipe_source(
    handle: StreamHandle,
    buffer: &BufferConfig,
    cancel: &CancellationToken,
) -> HlsResult<DataSource> {
    let mut reader = handle.reader.ok_or_else(|| HlsError::InputUnavailable {
        torrent_id: String::new(),
        file_index: 0,
        reason: "stream reader unavailable".to_string(),
    })?;
    reader.set_responsive();

    let ring = Arc::new(RingBuffer::new(buffer.ring_capacity_bytes));
    spawn_producer(
        Arc::clone(&ring),
        reader,
        Duration::from_secs(buffer.max_stall_secs),
        cancel.clone(),
    );
    Ok(DataSource::Pipe { ring })
}

/// Resolve the on-disk file FFmpeg rewinds through to locate the subtitle
/// stream. Burning requires a seekable source; a pipe cannot provide one.
pub async fn resolve_subtitle_source(
    file: &StreamFile,
    data_dir: &Path,
    subtitle_track: i32,
) -> HlsResult<Option<PathBuf>> {
    if subtitle_track < 0 {
        return Ok(None);
    }
    let abs = file.absolute_path(data_dir);
    if physical_size(&abs).await.is_some() {
        Ok(Some(abs))
    } else {
        Err(HlsError::SubtitleSourceUnavailable { subtitle_track })
    }
}

/// Linear byte-offset estimate for a timeline position.
///
/// Returns -1 when duration, length, or the target is non-positive;
/// clamps at `length` otherwise.
pub fn estimate_byte_offset(target_sec: f64, duration_sec: f64, length: u64) -> i64 {
    if target_sec <= 0.0 || duration_sec <= 0.0 || length == 0 {
        return -1;
    }
    let estimated = (target_sec / duration_sec * length as f64) as i64;
    estimated.min(length as i64)
}

/// Piece-priority boost window centred on the estimated seek offset.
pub fn seek_boost_range(target_sec: f64, duration_sec: f64, length: u64) -> Option<Range<u64>> {
    let offset = estimate_byte_offset(target_sec, duration_sec, length);
    if offset < 0 {
        return None;
    }
    let offset = offset as u64;
    let start = offset.saturating_sub(BOOST_WINDOW_BYTES);
    let end = offset.saturating_add(BOOST_WINDOW_BYTES).min(length);
    Some(start..end)
}
