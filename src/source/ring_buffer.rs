//! Bounded ring buffer between a torrent reader and FFmpeg's stdin.
//!
//! A background producer task pulls fixed-size chunks from the upstream
//! reader and copies them into the ring; the consumer side feeds the
//! transcoder. The producer never overwrites unread data: when the ring is
//! full it waits for the consumer to drain. Transient EOF from a
//! responsive torrent reader (pieces not yet downloaded) is retried with
//! exponential backoff until the stall window expires, after which the
//! stall becomes a terminal EOF for the consumer.

use crate::error::HlsError;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Chunk size for producer reads from the torrent reader.
const PRODUCER_CHUNK: usize = 256 * 1024;

/// Initial producer backoff after a transient EOF.
const BACKOFF_MIN: Duration = Duration::from_millis(10);

/// Backoff cap.
const BACKOFF_MAX: Duration = Duration::from_millis(200);

/// How often a blocked consumer wakes to log a stall warning.
const STALL_LOG_INTERVAL: Duration = Duration::from_secs(30);

struct RingState {
    buf: Box<[u8]>,
    /// Index of the first unread byte.
    start: usize,
    /// Number of unread bytes.
    len: usize,
    /// Terminal EOF: the source is done (or stalled out). Reads drain the
    /// remaining bytes and then return 0.
    source_eof: bool,
    /// Sticky terminal error from the source.
    error: Option<HlsError>,
}

impl RingState {
    fn space(&self) -> usize {
        self.buf.len() - self.len
    }

    /// Copy up to `out.len()` buffered bytes out, advancing the cursor.
    fn pop(&mut self, out: &mut [u8]) -> usize {
        let n = self.len.min(out.len());
        let cap = self.buf.len();
        let first = (cap - self.start).min(n);
        out[..first].copy_from_slice(&self.buf[self.start..self.start + first]);
        if first < n {
            out[first..n].copy_from_slice(&self.buf[..n - first]);
        }
        self.start = (self.start + n) % cap;
        self.len -= n;
        n
    }

    /// Copy up to `space()` bytes in, returning how many were taken.
    fn push(&mut self, data: &[u8]) -> usize {
        let n = self.space().min(data.len());
        let cap = self.buf.len();
        let end = (self.start + self.len) % cap;
        let first = (cap - end).min(n);
        self.buf[end..end + first].copy_from_slice(&data[..first]);
        if first < n {
            self.buf[..n - first].copy_from_slice(&data[first..n]);
        }
        self.len += n;
        n
    }
}

/// The shared ring. Single producer, consumers serialized by the state
/// lock; waiters re-check state after every wakeup.
pub struct RingBuffer {
    state: Mutex<RingState>,
    readable: Notify,
    writable: Notify,
    closed: AtomicBool,
    capacity: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(RingState {
                buf: vec![0u8; capacity].into_boxed_slice(),
                start: 0,
                len: 0,
                source_eof: false,
                error: None,
            }),
            readable: Notify::new(),
            writable: Notify::new(),
            closed: AtomicBool::new(false),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.state.lock().unwrap().len
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the ring. Idempotent; a blocked read unblocks with a
    /// closed-pipe error, a blocked producer gives up.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.readable.notify_waiters();
            self.writable.notify_waiters();
            trace!(buffer_op = "close");
        }
    }

    /// Reset cursors and the sticky error without closing the source.
    /// Used on soft seek: the transcoder keeps its stdin, the producer
    /// keeps its reader, and buffered bytes are discarded.
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.start = 0;
        state.len = 0;
        state.source_eof = false;
        state.error = None;
        drop(state);
        self.writable.notify_one();
        debug!(buffer_op = "clear");
    }

    /// Read buffered bytes, waiting until data is available, the source
    /// terminally ends (returns 0), the ring is closed, or `cancel` fires.
    pub async fn read(&self, out: &mut [u8], cancel: &CancellationToken) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        let mut waited = Duration::ZERO;
        loop {
            let notified = self.readable.notified();
            {
                let mut state = self.state.lock().unwrap();
                if state.len > 0 {
                    let n = state.pop(out);
                    drop(state);
                    self.writable.notify_one();
                    return Ok(n);
                }
                if let Some(err) = &state.error {
                    return Err(io::Error::other(err.to_string()));
                }
                if state.source_eof {
                    return Ok(0);
                }
            }
            if self.is_closed() {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "ring buffer closed",
                ));
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(io::Error::new(io::ErrorKind::Interrupted, "read cancelled"));
                }
                _ = notified => {}
                _ = tokio::time::sleep(STALL_LOG_INTERVAL) => {
                    waited += STALL_LOG_INTERVAL;
                    warn!(
                        buffer_op = "consumer_stall",
                        waited_secs = waited.as_secs(),
                        "no data from torrent reader"
                    );
                }
            }
        }
    }

    /// Best-effort wait until at least `min_bytes` are buffered.
    ///
    /// Returns `Ok(())` on reaching the threshold, on terminal source
    /// error or EOF, and on timeout; only cancellation is an error.
    pub async fn prebuffer(
        &self,
        min_bytes: usize,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), HlsError> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.readable.notified();
            {
                let state = self.state.lock().unwrap();
                if state.len >= min_bytes || state.source_eof || state.error.is_some() {
                    return Ok(());
                }
            }
            if self.is_closed() {
                return Ok(());
            }
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(d) if !d.is_zero() => d,
                _ => {
                    debug!(buffer_op = "prebuffer_timeout", min_bytes);
                    return Ok(());
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => return Err(HlsError::Cancelled),
                _ = notified => {}
                _ = tokio::time::sleep(remaining) => {
                    debug!(buffer_op = "prebuffer_timeout", min_bytes);
                    return Ok(());
                }
            }
        }
    }

    /// Copy `data` into the ring, waiting for space as needed. Never
    /// overwrites unread bytes. Returns `false` if the ring closed or the
    /// producer was cancelled mid-write.
    async fn write_all(&self, mut data: &[u8], cancel: &CancellationToken) -> bool {
        while !data.is_empty() {
            let notified = self.writable.notified();
            {
                let mut state = self.state.lock().unwrap();
                let n = state.push(data);
                if n > 0 {
                    data = &data[n..];
                    drop(state);
                    self.readable.notify_one();
                    continue;
                }
            }
            if self.is_closed() {
                return false;
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = notified => {}
            }
        }
        true
    }

    fn set_source_eof(&self) {
        self.state.lock().unwrap().source_eof = true;
        self.readable.notify_waiters();
    }

    fn set_error(&self, err: HlsError) {
        let mut state = self.state.lock().unwrap();
        if state.error.is_none() {
            state.error = Some(err);
        }
        drop(state);
        self.readable.notify_waiters();
    }
}

/// Spawn the producer task: pull chunks from `reader` into `ring` until
/// terminal EOF, error, close, or cancellation.
///
/// `max_stall` bounds how long transient EOFs are retried before the
/// source is declared done.
pub fn spawn_producer(
    ring: Arc<RingBuffer>,
    mut reader: Box<dyn crate::engine::StreamReader>,
    max_stall: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut chunk = vec![0u8; PRODUCER_CHUNK];
        let mut backoff = BACKOFF_MIN;
        let mut stall_since: Option<Instant> = None;
        let mut total: u64 = 0;

        loop {
            if ring.is_closed() || cancel.is_cancelled() {
                break;
            }
            let read = tokio::select! {
                _ = cancel.cancelled() => break,
                r = reader.read(&mut chunk) => r,
            };
            match read {
                Ok(0) => {
                    // Responsive readers report missing pieces as EOF;
                    // retry with backoff until the stall window expires.
                    let since = *stall_since.get_or_insert_with(Instant::now);
                    if since.elapsed() >= max_stall {
                        warn!(
                            buffer_op = "stall_timeout",
                            stalled_secs = since.elapsed().as_secs(),
                            total_bytes = total,
                            "source stalled out, ending stream"
                        );
                        ring.set_source_eof();
                        break;
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                }
                Ok(n) => {
                    stall_since = None;
                    backoff = BACKOFF_MIN;
                    total += n as u64;
                    if !ring.write_all(&chunk[..n], &cancel).await {
                        break;
                    }
                }
                Err(e) => {
                    debug!(buffer_op = "source_error", error = %e, total_bytes = total);
                    ring.set_error(HlsError::Io(e.to_string()));
                    break;
                }
            }
        }
        trace!(buffer_op = "producer_done", total_bytes = total);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::StreamReader;
    use std::collections::VecDeque;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, ReadBuf};

    /// Scripted reader: yields `Item::Data` chunks and `Item::Eof` markers
    /// in order, then terminal EOF forever.
    enum Item {
        Data(Vec<u8>),
        Eof,
    }

    struct ScriptedReader {
        items: VecDeque<Item>,
    }

    impl ScriptedReader {
        fn new(items: Vec<Item>) -> Self {
            Self {
                items: items.into(),
            }
        }
    }

    impl AsyncRead for ScriptedReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            match self.items.pop_front() {
                Some(Item::Data(data)) => {
                    buf.put_slice(&data);
                    Poll::Ready(Ok(()))
                }
                Some(Item::Eof) | None => Poll::Ready(Ok(())),
            }
        }
    }

    impl StreamReader for ScriptedReader {
        fn set_responsive(&mut self) {}
    }

    #[tokio::test]
    async fn test_write_then_read_roundtrip() {
        let ring = RingBuffer::new(1024);
        let cancel = CancellationToken::new();

        assert!(ring.write_all(b"hello world", &cancel).await);
        let mut out = [0u8; 32];
        let n = ring.read(&mut out, &cancel).await.unwrap();
        assert_eq!(&out[..n], b"hello world");
    }

    #[tokio::test]
    async fn test_wraparound() {
        let ring = RingBuffer::new(8);
        let cancel = CancellationToken::new();
        let mut out = [0u8; 8];

        assert!(ring.write_all(b"abcde", &cancel).await);
        let n = ring.read(&mut out, &cancel).await.unwrap();
        assert_eq!(&out[..n], b"abcde");

        // Next write wraps around the 8-byte buffer.
        assert!(ring.write_all(b"fghij", &cancel).await);
        let n = ring.read(&mut out, &cancel).await.unwrap();
        assert_eq!(&out[..n], b"fghij");
    }

    #[tokio::test]
    async fn test_full_ring_blocks_producer_without_overwrite() {
        let ring = Arc::new(RingBuffer::new(4));
        let cancel = CancellationToken::new();

        assert!(ring.write_all(b"abcd", &cancel).await);

        // A fifth byte must wait for the consumer; it must not clobber.
        let writer = {
            let ring = Arc::clone(&ring);
            let cancel = cancel.clone();
            tokio::spawn(async move { ring.write_all(b"e", &cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!writer.is_finished(), "producer should block on full ring");

        let mut out = [0u8; 4];
        let n = ring.read(&mut out, &cancel).await.unwrap();
        assert_eq!(&out[..n], b"abcd");

        assert!(writer.await.unwrap());
        let n = ring.read(&mut out, &cancel).await.unwrap();
        assert_eq!(&out[..n], b"e");
    }

    #[tokio::test]
    async fn test_close_unblocks_read() {
        let ring = Arc::new(RingBuffer::new(64));
        let cancel = CancellationToken::new();

        let reader = {
            let ring = Arc::clone(&ring);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut out = [0u8; 8];
                ring.read(&mut out, &cancel).await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        ring.close();

        let err = reader.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_cancel_unblocks_read() {
        let ring = Arc::new(RingBuffer::new(64));
        let cancel = CancellationToken::new();

        let reader = {
            let ring = Arc::clone(&ring);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut out = [0u8; 8];
                ring.read(&mut out, &cancel).await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let err = reader.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
    }

    #[tokio::test]
    async fn test_clear_resets_state() {
        let ring = RingBuffer::new(64);
        let cancel = CancellationToken::new();

        assert!(ring.write_all(b"stale", &cancel).await);
        ring.set_error(HlsError::Io("boom".to_string()));
        ring.clear();

        assert_eq!(ring.buffered(), 0);
        assert!(ring.write_all(b"fresh", &cancel).await);
        let mut out = [0u8; 8];
        let n = ring.read(&mut out, &cancel).await.unwrap();
        assert_eq!(&out[..n], b"fresh");
    }

    #[tokio::test]
    async fn test_prebuffer_returns_on_threshold() {
        let ring = Arc::new(RingBuffer::new(64));
        let cancel = CancellationToken::new();

        let waiter = {
            let ring = Arc::clone(&ring);
            let cancel = cancel.clone();
            tokio::spawn(
                async move { ring.prebuffer(4, Duration::from_secs(5), &cancel).await },
            )
        };

        assert!(ring.write_all(b"abcd", &cancel).await);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_prebuffer_timeout_is_ok() {
        let ring = RingBuffer::new(64);
        let cancel = CancellationToken::new();
        // Nothing arrives; prebuffer is best-effort and succeeds anyway.
        ring.prebuffer(1024, Duration::from_millis(30), &cancel)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_prebuffer_cancel_is_error() {
        let ring = Arc::new(RingBuffer::new(64));
        let cancel = CancellationToken::new();
        let waiter = {
            let ring = Arc::clone(&ring);
            let cancel = cancel.clone();
            tokio::spawn(
                async move { ring.prebuffer(1024, Duration::from_secs(10), &cancel).await },
            )
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        assert!(matches!(waiter.await.unwrap(), Err(HlsError::Cancelled)));
    }

    #[tokio::test]
    async fn test_producer_feeds_ring_and_signals_eof() {
        let ring = Arc::new(RingBuffer::new(1024));
        let cancel = CancellationToken::new();
        let reader = ScriptedReader::new(vec![
            Item::Data(b"first".to_vec()),
            Item::Data(b"second".to_vec()),
        ]);

        // An exhausted script returns EOF immediately, so the producer
        // enters backoff; the short stall window turns it terminal fast.
        let handle = spawn_producer(
            Arc::clone(&ring),
            Box::new(reader),
            Duration::from_millis(100),
            cancel.clone(),
        );

        let mut collected = Vec::new();
        let mut out = [0u8; 64];
        loop {
            let n = ring.read(&mut out, &cancel).await.unwrap();
            if n == 0 {
                break;
            }
            collected.extend_from_slice(&out[..n]);
        }
        assert_eq!(collected, b"firstsecond");
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_readers_drain_everything() {
        let ring = Arc::new(RingBuffer::new(256));
        let cancel = CancellationToken::new();

        let readers: Vec<_> = (0..3)
            .map(|_| {
                let ring = Arc::clone(&ring);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let mut collected = 0usize;
                    let mut out = [0u8; 32];
                    loop {
                        match ring.read(&mut out, &cancel).await {
                            Ok(0) => return collected,
                            Ok(n) => collected += n,
                            Err(e) => panic!("reader failed: {e}"),
                        }
                    }
                })
            })
            .collect();

        let writer = {
            let ring = Arc::clone(&ring);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                for chunk in [&b"abcdefgh"[..]; 64] {
                    assert!(ring.write_all(chunk, &cancel).await);
                }
                ring.set_source_eof();
            })
        };
        writer.await.unwrap();

        let totals = futures::future::join_all(readers).await;
        let drained: usize = totals.into_iter().map(|r| r.unwrap()).sum();
        assert_eq!(drained, 8 * 64);
    }

    #[tokio::test]
    async fn test_transient_eof_retried_before_data() {
        let ring = Arc::new(RingBuffer::new(1024));
        let cancel = CancellationToken::new();
        let reader = ScriptedReader::new(vec![
            Item::Eof,
            Item::Eof,
            Item::Data(b"late".to_vec()),
        ]);

        spawn_producer(
            Arc::clone(&ring),
            Box::new(reader),
            Duration::from_secs(5),
            cancel.clone(),
        );

        let mut out = [0u8; 16];
        let n = ring.read(&mut out, &cancel).await.unwrap();
        assert_eq!(&out[..n], b"late");
        cancel.cancel();
    }
}
