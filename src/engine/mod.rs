//! Interfaces to the external torrent engine.
//!
//! The streaming core never talks to the torrent session layer directly;
//! it sees two narrow traits: [`StreamProvider`] (the stream use case,
//! yielding a reader plus file completeness info) and [`PieceScheduler`]
//! (priority biasing of the piece picker toward the playback window).

use crate::error::HlsResult;
use async_trait::async_trait;
use std::ops::Range;
use std::path::{Path, PathBuf};
use tokio::io::AsyncRead;

/// Descriptor for the file being streamed, as reported by the engine.
#[derive(Debug, Clone)]
pub struct StreamFile {
    /// Path relative to the engine's data directory.
    pub path: PathBuf,
    /// Declared length in bytes.
    pub length: u64,
    /// Bytes the engine has verified on disk or in memory.
    pub bytes_completed: u64,
}

impl StreamFile {
    /// Whether every byte of the file has been downloaded.
    pub fn is_complete(&self) -> bool {
        self.bytes_completed >= self.length
    }

    /// Download completeness in [0, 1]. Zero-length files count as complete.
    pub fn completeness(&self) -> f64 {
        if self.length == 0 {
            return 1.0;
        }
        (self.bytes_completed as f64 / self.length as f64).min(1.0)
    }

    /// Absolute on-disk location under the engine's data directory.
    pub fn absolute_path(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(&self.path)
    }
}

/// Byte reader over a (possibly incomplete) torrent file.
///
/// Complete files support random access; incomplete files read forward
/// only, blocking until pieces arrive. `set_responsive` switches the
/// reader to non-blocking EOF semantics: a read over a missing piece
/// returns `Ok(0)` instead of waiting, which the ring buffer turns into
/// backoff-and-retry. Only pipe data sources request this.
pub trait StreamReader: AsyncRead + Send + Unpin {
    fn set_responsive(&mut self);
}

/// Result of asking the engine to open a stream for one file.
pub struct StreamHandle {
    /// Byte reader; `None` means the engine could not produce one.
    pub reader: Option<Box<dyn StreamReader>>,
    pub file: StreamFile,
    /// Engine byte-range HTTP endpoint for this file, when the engine
    /// serves one. Used for the completed-but-off-disk data source.
    pub range_url: Option<String>,
}

/// The stream torrent use case.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StreamProvider: Send + Sync {
    /// Open a stream over `(torrent_id, file_index)`.
    async fn open_stream(&self, torrent_id: &str, file_index: usize) -> HlsResult<StreamHandle>;
}

/// Priority level for a piece range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PiecePriority {
    Normal,
    High,
    /// Download-before-everything, used for the seek target pre-boost.
    Now,
}

/// Piece-picker bias interface of the torrent engine.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PieceScheduler: Send + Sync {
    /// Raise the priority of the pieces covering `byte_range`.
    async fn set_piece_priority(
        &self,
        torrent_id: &str,
        file_index: usize,
        byte_range: Range<u64>,
        priority: PiecePriority,
    ) -> HlsResult<()>;
}

/// No-op scheduler for deployments without piece priority support.
pub struct NullScheduler;

#[async_trait]
impl PieceScheduler for NullScheduler {
    async fn set_piece_priority(
        &self,
        _torrent_id: &str,
        _file_index: usize,
        _byte_range: Range<u64>,
        _priority: PiecePriority,
    ) -> HlsResult<()> {
        Ok(())
    }
}
