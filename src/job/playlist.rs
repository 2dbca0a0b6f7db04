//! Playlist rewriting and m3u8 inspection.
//!
//! Served playlists get their segment URIs suffixed with the original
//! track selection so segment requests route back to the same job key.
//! Rewritten bytes are memoized briefly because players poll the manifest
//! aggressively during live (event) playback.

use crate::error::{HlsError, HlsResult};
use crate::job::job::Job;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tracing::trace;

/// How long a rewritten playlist stays valid without a re-read.
pub const REWRITE_MEMO_TTL: Duration = Duration::from_millis(500);

/// Memoized rewrite of the last served playlist.
pub(crate) struct RewriteMemo {
    path: PathBuf,
    audio_track: i32,
    subtitle_track: i32,
    mtime: Option<SystemTime>,
    rendered_at: Instant,
    bytes: Bytes,
}

/// Append the track-selection query to one URI line.
fn rewrite_line(line: &str, query: &str) -> String {
    // Strip a previous rewrite so the operation is idempotent.
    let base = match line.split_once('?') {
        Some((base, rest)) if rest.starts_with("audioTrack=") => base,
        _ => line,
    };
    format!("{base}{query}")
}

/// Suffix every non-comment, non-blank line with
/// `?audioTrack=<n>[&subtitleTrack=<n>]`.
pub fn rewrite_playlist(content: &str, audio_track: i32, subtitle_track: i32) -> String {
    let query = if subtitle_track >= 0 {
        format!("?audioTrack={audio_track}&subtitleTrack={subtitle_track}")
    } else {
        format!("?audioTrack={audio_track}")
    };

    let mut out = String::with_capacity(content.len() + 64);
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            out.push_str(line);
        } else {
            out.push_str(&rewrite_line(trimmed, &query));
        }
        out.push('\n');
    }
    out
}

/// Read `playlist_path` and rewrite it, memoizing the result on the job.
///
/// The memo is keyed by `(path, audio, subtitle)` and invalidated after
/// [`REWRITE_MEMO_TTL`] or when the playlist mtime changes. Returns
/// shared bytes so the poll-heavy serving path clones cheaply.
pub fn rewritten_playlist(
    job: &Job,
    playlist_path: &Path,
    audio_track: i32,
    subtitle_track: i32,
) -> HlsResult<Bytes> {
    let mtime = std::fs::metadata(playlist_path)
        .and_then(|m| m.modified())
        .ok();

    {
        let memo = job.rewrite_memo.lock().unwrap();
        if let Some(memo) = memo.as_ref() {
            if memo.path == playlist_path
                && memo.audio_track == audio_track
                && memo.subtitle_track == subtitle_track
                && memo.rendered_at.elapsed() < REWRITE_MEMO_TTL
                && memo.mtime == mtime
            {
                trace!(playlist_op = "memo_hit", path = %playlist_path.display());
                return Ok(memo.bytes.clone());
            }
        }
    }

    let content = std::fs::read_to_string(playlist_path)
        .map_err(|e| HlsError::Io(format!("{}: {e}", playlist_path.display())))?;
    let rewritten = Bytes::from(rewrite_playlist(&content, audio_track, subtitle_track));

    *job.rewrite_memo.lock().unwrap() = Some(RewriteMemo {
        path: playlist_path.to_path_buf(),
        audio_track,
        subtitle_track,
        mtime,
        rendered_at: Instant::now(),
        bytes: rewritten.clone(),
    });
    Ok(rewritten)
}

/// One entry of a media playlist with its absolute timeline position.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaylistEntry {
    pub uri: String,
    pub start_sec: f64,
    pub duration_sec: f64,
}

impl PlaylistEntry {
    pub fn end_sec(&self) -> f64 {
        self.start_sec + self.duration_sec
    }
}

/// Parse a media playlist, accumulating `#EXTINF` durations into absolute
/// start times. `base_sec` anchors the timeline (the job's seek offset).
pub fn parse_media_playlist(content: &str, base_sec: f64) -> Vec<PlaylistEntry> {
    let mut entries = Vec::new();
    let mut cursor = base_sec;
    let mut pending: Option<f64> = None;

    for line in content.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("#EXTINF:") {
            pending = rest
                .split(',')
                .next()
                .and_then(|d| d.trim().parse::<f64>().ok());
        } else if !line.is_empty() && !line.starts_with('#') {
            if let Some(duration) = pending.take() {
                entries.push(PlaylistEntry {
                    uri: line.to_string(),
                    start_sec: cursor,
                    duration_sec: duration,
                });
                cursor += duration;
            }
        }
    }
    entries
}

pub fn has_endlist(content: &str) -> bool {
    content.lines().any(|l| l.trim() == "#EXT-X-ENDLIST")
}

/// Whether the playlist file on disk is closed with ENDLIST.
pub fn playlist_file_has_endlist(path: &Path) -> bool {
    std::fs::read_to_string(path)
        .map(|c| has_endlist(&c))
        .unwrap_or(false)
}

/// Inspect a job directory for a finished transcode.
///
/// Returns the top-level playlist and whether it is multi-variant. For a
/// multi-variant tree the master playlist itself never carries ENDLIST;
/// the variants finish together under one muxer, so `v0` stands in.
pub fn completed_playlist(dir: &Path) -> Option<(PathBuf, bool)> {
    let master = dir.join("master.m3u8");
    if master.exists() {
        if playlist_file_has_endlist(&dir.join("v0").join("index.m3u8")) {
            return Some((master, true));
        }
        return None;
    }
    let index = dir.join("index.m3u8");
    if playlist_file_has_endlist(&index) {
        return Some((index, false));
    }
    None
}
