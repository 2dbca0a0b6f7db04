//! Shared fixtures for integration tests: a scripted ffmpeg/ffprobe
//! stand-in, a file-backed stream provider, and a recording piece
//! scheduler.

#![allow(dead_code)]

use async_trait::async_trait;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, ReadBuf};
use torrent_hls::engine::{
    PiecePriority, PieceScheduler, StreamFile, StreamHandle, StreamProvider, StreamReader,
};
use torrent_hls::error::{HlsError, HlsResult};
use torrent_hls::Config;

/// Write an executable shell script standing in for ffmpeg. The driver
/// passes the output playlist as the final argument, which is all the
/// stand-in needs to fake a transcode.
#[cfg(unix)]
pub fn mock_ffmpeg(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    let script = format!(
        "#!/bin/sh\nfor last; do :; done\ndir=$(dirname \"$last\")\nmkdir -p \"$dir\"\n{body}\n"
    );
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// ffmpeg stand-in: three segments, a playlist, a pause, then ENDLIST.
/// Also emits progress on stdout the way `-progress pipe:1` does.
#[cfg(unix)]
pub fn happy_ffmpeg(dir: &Path) -> PathBuf {
    mock_ffmpeg(
        dir,
        "ffmpeg-happy.sh",
        r#"for i in 0 1 2; do printf 'ts' > "$dir/seg-0000$i.ts"; done
printf '#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:4\n#EXT-X-PLAYLIST-TYPE:EVENT\n#EXTINF:4.000000,\nseg-00000.ts\n#EXTINF:4.000000,\nseg-00001.ts\n#EXTINF:4.000000,\nseg-00002.ts\n' > "$last"
printf 'out_time_us=12000000\nspeed=3.0x\nprogress=continue\n'
sleep 3
printf '#EXT-X-ENDLIST\n' >> "$last"
printf 'out_time_us=12000000\nspeed=3.0x\nprogress=end\n'
exit 0"#,
    )
}

/// ffmpeg stand-in that dies without ENDLIST on its first run and
/// finishes cleanly on the second (the job directory persists across an
/// auto-restart, so a marker file tells the runs apart).
#[cfg(unix)]
pub fn crash_once_ffmpeg(dir: &Path) -> PathBuf {
    mock_ffmpeg(
        dir,
        "ffmpeg-crash-once.sh",
        r#"printf '#EXTM3U\n#EXTINF:4.000000,\nseg-00000.ts\n' > "$last"
printf 'ts' > "$dir/seg-00000.ts"
if [ ! -f "$dir/.crashed" ]; then
    touch "$dir/.crashed"
    echo 'segment muxer choked' >&2
    exit 1
fi
printf '#EXT-X-ENDLIST\n' >> "$last"
exit 0"#,
    )
}

/// ffmpeg stand-in that writes a playlist and then encodes forever.
#[cfg(unix)]
pub fn hanging_ffmpeg(dir: &Path) -> PathBuf {
    mock_ffmpeg(
        dir,
        "ffmpeg-hang.sh",
        r#"printf '#EXTM3U\n#EXTINF:4.000000,\nseg-00000.ts\n' > "$last"
printf 'ts' > "$dir/seg-00000.ts"
printf 'out_time_us=60000000\nspeed=1.0x\nprogress=continue\n'
sleep 600"#,
    )
}

/// ffprobe stand-in reporting an H.264/AAC 480p file, one hour long.
/// 480p keeps scripted runs single-variant; the adaptive ladder is
/// exercised by the argument-builder unit tests.
#[cfg(unix)]
pub fn mock_ffprobe(dir: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("ffprobe.sh");
    let json = r#"{"streams":[{"codec_type":"video","codec_name":"h264","width":854,"height":480,"avg_frame_rate":"24/1"},{"codec_type":"audio","codec_name":"aac"}],"format":{"duration":"3600.0"}}"#;
    std::fs::write(&path, format!("#!/bin/sh\nprintf '%s' '{json}'\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Test configuration rooted under a temp directory.
pub fn test_config(root: &Path, ffmpeg: PathBuf, ffprobe: PathBuf) -> Config {
    let mut config = Config::default();
    config.paths.hls_base_dir = root.join("hls");
    config.paths.segment_cache_dir = root.join("segments");
    config.paths.data_dir = root.join("data");
    config.transcoder.ffmpeg_path = ffmpeg;
    config.transcoder.ffprobe_path = ffprobe;
    config.transcoder.startup_timeout_secs = 10;
    config.buffer.ring_capacity_bytes = 1024 * 1024;
    config.buffer.prebuffer_bytes = 16;
    config
}

/// Reader over a real file, standing in for the torrent reader.
pub struct FileReader {
    file: tokio::fs::File,
}

impl AsyncRead for FileReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.file).poll_read(cx, buf)
    }
}

impl StreamReader for FileReader {
    fn set_responsive(&mut self) {}
}

/// Stream provider backed by one file under the data directory.
pub struct FileStreamProvider {
    pub data_dir: PathBuf,
    pub relative_path: PathBuf,
    pub length: u64,
    pub bytes_completed: u64,
    pub range_url: Option<String>,
}

impl FileStreamProvider {
    /// Provider for a fully downloaded on-disk file.
    pub fn complete(data_dir: &Path, relative_path: &str) -> Self {
        let length = std::fs::metadata(data_dir.join(relative_path))
            .map(|m| m.len())
            .unwrap_or(0);
        Self {
            data_dir: data_dir.to_path_buf(),
            relative_path: PathBuf::from(relative_path),
            length,
            bytes_completed: length,
            range_url: None,
        }
    }

    /// Provider for a partially downloaded file (pipe source territory).
    pub fn partial(data_dir: &Path, relative_path: &str, length: u64, completed: u64) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            relative_path: PathBuf::from(relative_path),
            length,
            bytes_completed: completed,
            range_url: None,
        }
    }
}

#[async_trait]
impl StreamProvider for FileStreamProvider {
    async fn open_stream(&self, torrent_id: &str, file_index: usize) -> HlsResult<StreamHandle> {
        let path = self.data_dir.join(&self.relative_path);
        let reader: Option<Box<dyn StreamReader>> = match tokio::fs::File::open(&path).await {
            Ok(file) => Some(Box::new(FileReader { file })),
            Err(_) if self.range_url.is_some() => None,
            Err(e) => {
                return Err(HlsError::InputUnavailable {
                    torrent_id: torrent_id.to_string(),
                    file_index,
                    reason: e.to_string(),
                })
            }
        };
        Ok(StreamHandle {
            reader,
            file: StreamFile {
                path: self.relative_path.clone(),
                length: self.length,
                bytes_completed: self.bytes_completed,
            },
            range_url: self.range_url.clone(),
        })
    }
}

/// One observed piece-priority call.
#[derive(Debug, Clone)]
pub struct BoostCall {
    pub torrent_id: String,
    pub file_index: usize,
    pub byte_range: Range<u64>,
    pub priority: PiecePriority,
}

/// Scheduler that records every boost call.
#[derive(Default)]
pub struct RecordingScheduler {
    pub calls: Mutex<Vec<BoostCall>>,
}

impl RecordingScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<BoostCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl PieceScheduler for RecordingScheduler {
    async fn set_piece_priority(
        &self,
        torrent_id: &str,
        file_index: usize,
        byte_range: Range<u64>,
        priority: PiecePriority,
    ) -> HlsResult<()> {
        self.calls.lock().unwrap().push(BoostCall {
            torrent_id: torrent_id.to_string(),
            file_index,
            byte_range,
            priority,
        });
        Ok(())
    }
}

/// Poll `predicate` until it holds or `timeout` elapses.
pub async fn wait_until<F: FnMut() -> bool>(mut predicate: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    predicate()
}
