//! Background MKV→MP4 remux cache.
//!
//! Browsers play H.264 MKVs directly once the streams are re-wrapped in a
//! faststart MP4, skipping HLS transcoding entirely. Remuxing is a pure
//! codec copy (audio re-encoded only when it is not AAC), serialized per
//! `(torrent, file)`: concurrent callers share one run and one completion
//! signal.

use crate::error::{HlsError, HlsResult};
use crate::probe::CodecFlags;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Status of a remux slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemuxState {
    Running,
    Done,
    Failed,
}

struct RemuxTask {
    state_rx: watch::Receiver<RemuxState>,
}

/// Per-file serialized remux runner.
pub struct RemuxCache {
    ffmpeg_path: PathBuf,
    /// Output root: `{hls_base_dir}/remux`.
    out_dir: PathBuf,
    tasks: Mutex<HashMap<(String, usize), RemuxTask>>,
}

impl RemuxCache {
    pub fn new(ffmpeg_path: PathBuf, hls_base_dir: &Path) -> Self {
        Self {
            ffmpeg_path,
            out_dir: hls_base_dir.join("remux"),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Output path for a `(torrent, file)` pair.
    pub fn output_path(&self, torrent_id: &str, file_index: usize) -> PathBuf {
        self.out_dir.join(torrent_id).join(format!("{file_index}.mp4"))
    }

    /// Whether this file is remuxable for direct playback: MKV container
    /// with H.264 video.
    pub fn eligible(source: &Path, flags: &CodecFlags) -> bool {
        let is_mkv = source
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("mkv"));
        is_mkv && flags.is_h264
    }

    /// Return the output path and a readiness flag, starting a background
    /// remux when none exists. At most one remux runs per `(id, file)`;
    /// callers that find one in flight can await [`RemuxCache::wait`].
    pub fn check_remux(
        self: &Arc<Self>,
        torrent_id: &str,
        file_index: usize,
        source: &Path,
        flags: &CodecFlags,
    ) -> HlsResult<(PathBuf, bool)> {
        let output = self.output_path(torrent_id, file_index);
        if output.exists() {
            return Ok((output, true));
        }
        if !Self::eligible(source, flags) {
            return Err(HlsError::InvalidInput(format!(
                "{} is not remuxable",
                source.display()
            )));
        }

        let key = (torrent_id.to_string(), file_index);
        let mut tasks = self.tasks.lock().unwrap();
        match tasks.get(&key).map(|task| *task.state_rx.borrow()) {
            Some(RemuxState::Running) => return Ok((output, false)),
            Some(RemuxState::Done) => return Ok((output, true)),
            // A failed run vacates the slot; this check starts over.
            Some(RemuxState::Failed) => {
                tasks.remove(&key);
            }
            None => {}
        }

        let (state_tx, state_rx) = watch::channel(RemuxState::Running);
        tasks.insert(key.clone(), RemuxTask { state_rx });
        drop(tasks);

        let cache = Arc::clone(self);
        let source = source.to_path_buf();
        let copy_audio = flags.is_aac_audio;
        let out = output.clone();
        tokio::spawn(async move {
            let state = match cache.run_remux(&source, &out, copy_audio).await {
                Ok(()) => {
                    info!(remux_op = "done", output = %out.display());
                    RemuxState::Done
                }
                Err(e) => {
                    warn!(remux_op = "failed", output = %out.display(), error = %e);
                    let _ = tokio::fs::remove_file(&out).await;
                    RemuxState::Failed
                }
            };
            let _ = state_tx.send(state);
            // Finished runs are answered by the output file itself; the
            // failed slot stays visible until a later check retries it.
            if state == RemuxState::Done {
                cache.tasks.lock().unwrap().remove(&key);
            }
        });

        Ok((output, false))
    }

    /// Wait until the in-flight remux for `(id, file)` settles. Returns
    /// `true` when the output is ready.
    pub async fn wait(&self, torrent_id: &str, file_index: usize) -> bool {
        let rx = {
            let tasks = self.tasks.lock().unwrap();
            tasks
                .get(&(torrent_id.to_string(), file_index))
                .map(|t| t.state_rx.clone())
        };
        match rx {
            Some(mut rx) => {
                let settled = rx
                    .wait_for(|state| *state != RemuxState::Running)
                    .await
                    .map(|state| *state == RemuxState::Done)
                    .unwrap_or(false);
                settled || self.output_path(torrent_id, file_index).exists()
            }
            None => self.output_path(torrent_id, file_index).exists(),
        }
    }

    async fn run_remux(&self, source: &Path, output: &Path, copy_audio: bool) -> HlsResult<()> {
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-y".into(),
            "-i".into(),
            source.to_string_lossy().into_owned(),
            "-map".into(),
            "0:v:0".into(),
            "-map".into(),
            "0:a:0?".into(),
            "-c:v".into(),
            "copy".into(),
        ];
        if copy_audio {
            args.extend(["-c:a".into(), "copy".into()]);
        } else {
            args.extend(["-c:a".into(), "aac".into()]);
        }
        args.extend([
            "-movflags".into(),
            "+faststart".into(),
            output.to_string_lossy().into_owned(),
        ]);

        debug!(remux_op = "spawn", source = %source.display());
        let status = tokio::process::Command::new(&self.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| HlsError::TranscoderStartFailure(e.to_string()))?;

        if status.success() {
            Ok(())
        } else {
            Err(HlsError::TranscoderRuntimeFailure {
                exit_code: status.code(),
                stderr_tail: String::new(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn flags(h264: bool, aac: bool) -> CodecFlags {
        CodecFlags {
            is_h264: h264,
            is_aac_audio: aac,
        }
    }

    #[cfg(unix)]
    fn mock_ffmpeg(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("mock-ffmpeg.sh");
        let script = format!("#!/bin/sh\nfor last; do :; done\n{body}\n");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_eligibility() {
        assert!(RemuxCache::eligible(
            Path::new("/data/movie.mkv"),
            &flags(true, true)
        ));
        assert!(RemuxCache::eligible(
            Path::new("/data/MOVIE.MKV"),
            &flags(true, false)
        ));
        // HEVC inside MKV cannot be copied for browsers.
        assert!(!RemuxCache::eligible(
            Path::new("/data/movie.mkv"),
            &flags(false, true)
        ));
        // Already MP4.
        assert!(!RemuxCache::eligible(
            Path::new("/data/movie.mp4"),
            &flags(true, true)
        ));
    }

    #[test]
    fn test_output_layout() {
        let cache = RemuxCache::new(PathBuf::from("ffmpeg"), Path::new("/var/hls"));
        assert_eq!(
            cache.output_path("abc", 2),
            PathBuf::from("/var/hls/remux/abc/2.mp4")
        );
    }

    #[tokio::test]
    async fn test_ineligible_source_rejected() {
        let tmp = TempDir::new().unwrap();
        let cache = Arc::new(RemuxCache::new(PathBuf::from("ffmpeg"), tmp.path()));
        let result = cache.check_remux("t1", 0, Path::new("/data/movie.avi"), &flags(true, true));
        assert!(matches!(result, Err(HlsError::InvalidInput(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_remux_runs_once_and_completes() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("movie.mkv");
        std::fs::write(&source, b"fake mkv").unwrap();
        // The stand-in writes its last argument (the output file).
        let ffmpeg = mock_ffmpeg(tmp.path(), "printf 'mp4' > \"$last\"");
        let cache = Arc::new(RemuxCache::new(ffmpeg, tmp.path()));

        let (path, ready) = cache
            .check_remux("t1", 0, &source, &flags(true, true))
            .unwrap();
        assert!(!ready);

        // Concurrent checker shares the same in-flight run.
        let (second_path, _) = cache
            .check_remux("t1", 0, &source, &flags(true, true))
            .unwrap();
        assert_eq!(path, second_path);

        assert!(cache.wait("t1", 0).await);
        assert!(path.exists());

        // A later check finds the file directly.
        let (_, ready) = cache
            .check_remux("t1", 0, &source, &flags(true, true))
            .unwrap();
        assert!(ready);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_remux_failure_reported() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("movie.mkv");
        std::fs::write(&source, b"fake mkv").unwrap();
        let ffmpeg = mock_ffmpeg(tmp.path(), "exit 1");
        let cache = Arc::new(RemuxCache::new(ffmpeg, tmp.path()));

        let (path, ready) = cache
            .check_remux("t1", 0, &source, &flags(true, true))
            .unwrap();
        assert!(!ready);
        assert!(!cache.wait("t1", 0).await);
        assert!(!path.exists());
    }
}
