use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Macro to generate simple operation recording methods.
///
/// Generates methods that increment a counter field and optionally emit a
/// trace log with the operation name.
macro_rules! record_op {
    ($method:ident, $field:ident, $op_name:expr) => {
        pub fn $method(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
            trace!(job_op = $op_name);
        }
    };
    ($method:ident, $field:ident) => {
        pub fn $method(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

/// Metrics for transcoding job lifecycle.
#[derive(Debug, Default)]
pub struct JobMetrics {
    /// Jobs created (initial plays and hard-seek replacements)
    pub started_count: AtomicU64,
    /// Jobs that reached Completed
    pub completed_count: AtomicU64,
    /// Jobs that ended in a terminal error (cancellations excluded)
    pub failed_count: AtomicU64,
    /// Automatic transcoder restarts after premature exit
    pub auto_restart_count: AtomicU64,
    /// Restarts attributed to ffmpeg exiting on its own
    pub restart_ffmpeg_exit: AtomicU64,
    /// Restarts attributed to startup timeouts
    pub restart_startup_timeout: AtomicU64,
    /// Currently registered jobs (gauge)
    pub active_jobs: AtomicI64,
    /// Total time-to-first-frame across jobs (nanoseconds)
    pub ttff_total_ns: AtomicU64,
    /// Number of TTFF observations
    pub ttff_count: AtomicU64,
}

impl JobMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    record_op!(record_started, started_count, "job_started");
    record_op!(record_completed, completed_count, "job_completed");
    record_op!(record_failed, failed_count);

    /// Record an auto-restart with its reason label.
    pub fn record_auto_restart(&self, reason: &crate::error::ExitReason) {
        self.auto_restart_count.fetch_add(1, Ordering::Relaxed);
        match reason {
            crate::error::ExitReason::FfmpegExit => {
                self.restart_ffmpeg_exit.fetch_add(1, Ordering::Relaxed);
            }
            crate::error::ExitReason::StartupTimeout => {
                self.restart_startup_timeout.fetch_add(1, Ordering::Relaxed);
            }
        }
        warn!(job_op = "auto_restart", reason = %reason);
    }

    pub fn job_registered(&self) {
        self.active_jobs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_unregistered(&self) {
        self.active_jobs.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record time from job creation to first playlist on disk.
    pub fn record_ttff(&self, elapsed: Duration) {
        self.ttff_total_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        self.ttff_count.fetch_add(1, Ordering::Relaxed);
        debug!(job_op = "first_playlist", ttff_ms = elapsed.as_millis() as u64);
    }

    /// Average time-to-first-frame in milliseconds.
    ///
    /// Uses the atomic snapshot pattern to read a consistent (count, total)
    /// pair under concurrent updates.
    pub fn avg_ttff_ms(&self) -> f64 {
        loop {
            let count = self.ttff_count.load(Ordering::Relaxed);
            if count == 0 {
                return 0.0;
            }
            let total_ns = self.ttff_total_ns.load(Ordering::Relaxed);
            let new_count = self.ttff_count.load(Ordering::Relaxed);
            if new_count == count {
                return (total_ns as f64 / count as f64) / 1_000_000.0;
            }
        }
    }
}

/// Metrics for seek routing.
#[derive(Debug, Default)]
pub struct SeekMetrics {
    pub request_count: AtomicU64,
    pub soft_count: AtomicU64,
    pub hard_count: AtomicU64,
    /// Hard seeks landing inside the anti-storm window
    pub storm_count: AtomicU64,
}

impl SeekMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    record_op!(record_request, request_count, "seek_requested");
    record_op!(record_soft, soft_count, "seek_soft");
    record_op!(record_hard, hard_count, "seek_hard");
    record_op!(record_storm, storm_count);
}

/// Metrics for the segment cache.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    pub hit_count: AtomicU64,
    pub miss_count: AtomicU64,
    pub store_count: AtomicU64,
    pub eviction_count: AtomicU64,
    pub io_error_count: AtomicU64,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    record_op!(record_hit, hit_count);
    record_op!(record_miss, miss_count);
    record_op!(record_store, store_count);
    record_op!(record_eviction, eviction_count);
    record_op!(record_io_error, io_error_count);

    /// Hit rate as a percentage, using the atomic snapshot pattern.
    pub fn hit_rate(&self) -> f64 {
        loop {
            let hits = self.hit_count.load(Ordering::Relaxed);
            let misses = self.miss_count.load(Ordering::Relaxed);
            let total = hits + misses;
            if total == 0 {
                return 100.0;
            }
            let new_hits = self.hit_count.load(Ordering::Relaxed);
            if new_hits == hits {
                return (hits as f64 / total as f64) * 100.0;
            }
        }
    }
}

/// Point-in-time view of core health, handed to external observers.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthSnapshot {
    pub active_jobs: i64,
    pub jobs_started: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub auto_restarts: u64,
    pub seeks_total: u64,
    pub seeks_soft: u64,
    pub seeks_hard: u64,
    pub cache_hit_rate_pct: f64,
    pub cache_bytes: u64,
    pub avg_ttff_ms: f64,
    pub uptime_secs: u64,
}

/// Combined metrics for the streaming core.
pub struct Metrics {
    pub jobs: Arc<JobMetrics>,
    pub seeks: Arc<SeekMetrics>,
    pub cache: Arc<CacheMetrics>,
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            jobs: Arc::new(JobMetrics::new()),
            seeks: Arc::new(SeekMetrics::new()),
            cache: Arc::new(CacheMetrics::new()),
            start_time: Instant::now(),
        }
    }

    /// Build a [`HealthSnapshot`]; `cache_bytes` is supplied by the segment
    /// cache because its byte counter lives under the cache lock.
    pub fn snapshot(&self, cache_bytes: u64) -> HealthSnapshot {
        HealthSnapshot {
            active_jobs: self.jobs.active_jobs.load(Ordering::Relaxed),
            jobs_started: self.jobs.started_count.load(Ordering::Relaxed),
            jobs_completed: self.jobs.completed_count.load(Ordering::Relaxed),
            jobs_failed: self.jobs.failed_count.load(Ordering::Relaxed),
            auto_restarts: self.jobs.auto_restart_count.load(Ordering::Relaxed),
            seeks_total: self.seeks.request_count.load(Ordering::Relaxed),
            seeks_soft: self.seeks.soft_count.load(Ordering::Relaxed),
            seeks_hard: self.seeks.hard_count.load(Ordering::Relaxed),
            cache_hit_rate_pct: self.cache.hit_rate(),
            cache_bytes,
            avg_ttff_ms: self.jobs.avg_ttff_ms(),
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log a complete metrics summary.
    pub fn log_summary(&self) {
        info!(
            operation = "hls_metrics_summary",
            active_jobs = self.jobs.active_jobs.load(Ordering::Relaxed),
            started = self.jobs.started_count.load(Ordering::Relaxed),
            completed = self.jobs.completed_count.load(Ordering::Relaxed),
            failed = self.jobs.failed_count.load(Ordering::Relaxed),
            auto_restarts = self.jobs.auto_restart_count.load(Ordering::Relaxed),
            seeks = self.seeks.request_count.load(Ordering::Relaxed),
            soft = self.seeks.soft_count.load(Ordering::Relaxed),
            hard = self.seeks.hard_count.load(Ordering::Relaxed),
            cache_hit_rate_pct = self.cache.hit_rate(),
            avg_ttff_ms = self.jobs.avg_ttff_ms(),
            uptime_secs = self.start_time.elapsed().as_secs(),
        );
    }

    /// Create a periodic logging background task.
    ///
    /// Logs a summary at the given interval until the stop flag is set.
    pub fn spawn_periodic_logging(
        self: &Arc<Self>,
        interval_secs: u64,
        stop: Arc<std::sync::atomic::AtomicBool>,
    ) -> tokio::task::JoinHandle<()> {
        let metrics = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));

            loop {
                ticker.tick().await;

                if stop.load(Ordering::Relaxed) {
                    break;
                }

                metrics.log_summary();
            }
        })
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
