//! Parser for FFmpeg's `-progress pipe:1` stdout protocol.
//!
//! FFmpeg emits blocks of `key=value` lines terminated by a `progress=`
//! line. Only the encoded-time position and speed are of interest; the
//! position feeds the soft-seek decision, so it is published atomically.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::ChildStdout;
use tracing::{debug, trace};

/// One complete progress block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    /// Encoded position in the output timeline.
    pub out_time: Duration,
    /// Encode speed relative to realtime (`1.0` = realtime).
    pub speed: f32,
}

/// Incremental reader of the progress stream.
pub struct ProgressStream<R> {
    lines: Lines<BufReader<R>>,
    out_time_us: Option<u64>,
    speed: Option<f32>,
}

impl ProgressStream<ChildStdout> {
    pub fn from_stdout(stdout: ChildStdout) -> Self {
        Self::new(stdout)
    }
}

impl<R: tokio::io::AsyncRead + Unpin> ProgressStream<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
            out_time_us: None,
            speed: None,
        }
    }

    /// Yield the next complete progress block, or `None` at EOF.
    ///
    /// Cancellation safe: state accumulates across partial reads.
    pub async fn next_progress(&mut self) -> Option<Progress> {
        while let Ok(Some(line)) = self.lines.next_line().await {
            if let Some((key, value)) = line.trim().split_once('=') {
                self.accept(key, value);
                // The "progress" key closes a block (value: continue|end).
                if key == "progress" {
                    if let Some(out_time_us) = self.out_time_us.take() {
                        let speed = self.speed.take().unwrap_or(0.0);
                        return Some(Progress {
                            out_time: Duration::from_micros(out_time_us),
                            speed,
                        });
                    }
                    self.speed = None;
                }
            }
        }
        None
    }

    fn accept(&mut self, key: &str, value: &str) {
        match key {
            // Despite the name, out_time_ms is also microseconds; FFmpeg
            // has emitted both spellings for years.
            "out_time_us" | "out_time_ms" => match value.trim().parse() {
                Ok(v) => self.out_time_us = Some(v),
                Err(_) if value == "N/A" => self.out_time_us = Some(0),
                Err(_) => trace!(progress_op = "bad_value", key, value),
            },
            // speed looks like `10.3x`, sometimes padded.
            "speed" => {
                let trimmed = value.trim().trim_end_matches('x');
                match trimmed.trim().parse() {
                    Ok(v) => self.speed = Some(v),
                    Err(_) if value.trim() == "N/A" => self.speed = Some(0.0),
                    Err(_) => trace!(progress_op = "bad_value", key, value),
                }
            }
            _ => {}
        }
    }
}

/// Drain the progress stream into `progress_micros` until EOF.
pub fn spawn_progress_task<R>(
    mut stream: ProgressStream<R>,
    progress_micros: Arc<AtomicU64>,
) -> tokio::task::JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(progress) = stream.next_progress().await {
            progress_micros.store(progress.out_time.as_micros() as u64, Ordering::Release);
            trace!(
                progress_op = "tick",
                out_time_secs = progress.out_time.as_secs_f64(),
                speed = progress.speed,
            );
        }
        debug!(progress_op = "eof");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "bitrate=5234.1kbits/s\n\
total_size=2456901632\n\
out_time_us=3755250000\n\
out_time_ms=3755250000\n\
out_time=01:02:35.250000\n\
dup_frames=0\n\
drop_frames=0\n\
speed=28.6x\n\
progress=continue\n\
out_time_us=3759250000\n\
speed= 29.1x\n\
progress=end\n";

    #[tokio::test]
    async fn test_parses_blocks() {
        let mut stream = ProgressStream::new(SAMPLE.as_bytes());

        let first = stream.next_progress().await.unwrap();
        assert_eq!(first.out_time, Duration::from_micros(3_755_250_000));
        assert!((first.speed - 28.6).abs() < 0.001);

        let second = stream.next_progress().await.unwrap();
        assert_eq!(second.out_time, Duration::from_micros(3_759_250_000));
        assert!((second.speed - 29.1).abs() < 0.001);

        assert!(stream.next_progress().await.is_none());
    }

    #[tokio::test]
    async fn test_not_available_values() {
        let raw = "out_time_us=N/A\nspeed=N/A\nprogress=continue\n";
        let mut stream = ProgressStream::new(raw.as_bytes());
        let progress = stream.next_progress().await.unwrap();
        assert_eq!(progress.out_time, Duration::ZERO);
        assert_eq!(progress.speed, 0.0);
    }

    #[tokio::test]
    async fn test_incomplete_block_skipped() {
        // A block with no out_time at all yields nothing.
        let raw = "speed=1.0x\nprogress=continue\n";
        let mut stream = ProgressStream::new(raw.as_bytes());
        assert!(stream.next_progress().await.is_none());
    }

    #[tokio::test]
    async fn test_spawn_updates_atomic() {
        let progress_micros = Arc::new(AtomicU64::new(0));
        let stream = ProgressStream::new(SAMPLE.as_bytes());
        spawn_progress_task(stream, Arc::clone(&progress_micros))
            .await
            .unwrap();
        assert_eq!(
            progress_micros.load(Ordering::Acquire),
            3_759_250_000u64
        );
    }
}
