//! # torrent-hls
//!
//! The streaming core of a torrent engine: turns a partially-downloaded
//! media file, whose bytes arrive out of order over BitTorrent, into a
//! continuously viewable HLS playback session with responsive seeking,
//! adaptive bitrate, subtitle burning, and segment caching.
//!
//! ## Overview
//!
//! This crate coordinates a long-running FFmpeg transcoder against a
//! non-deterministic byte source (the torrent reader). It translates seek
//! requests into either cheap in-place continuations or full transcoder
//! restarts, preserves transcoded output across restarts via a
//! content-addressed segment cache, and survives transcoder crashes with
//! automatic recovery, all while many clients concurrently request
//! playlists and segments that may not exist yet.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       HTTP layer (external)                  │
//! │   playlist / segment requests, track selection, retries      │
//! └──────────────────────────────────────────────────────────────┘
//!                                │
//!                                ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         JobManager                           │
//! │  ensure / seek routing / stop / purge / auto-restart         │
//! │  ┌────────────┐  ┌─────────────┐  ┌──────────────────┐       │
//! │  │ Transcoder │  │ DataSource  │  │  Segment cache   │       │
//! │  │ driver     │  │ selector    │  │  (LRU + TTL)     │       │
//! │  └────────────┘  └─────────────┘  └──────────────────┘       │
//! └──────────────────────────────────────────────────────────────┘
//!                                │
//!                        StreamProvider /
//!                        PieceScheduler traits
//!                                │
//!                                ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                  torrent engine (external)                   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`job`] - Job lifecycle, seek routing, playback state machine, and playlist serving
//! - [`transcode`] - FFmpeg argument assembly, progress parsing, process supervision
//! - [`source`] - Ring buffered reader and data source selection
//! - [`cache`] - Time-indexed persistent segment cache with min-heap eviction
//! - [`probe`] - ffprobe integration and the persisted codec/resolution cache
//! - [`remux`] - Background MKV→MP4 codec-copy for direct browser playback
//! - [`engine`] - Traits implemented by the torrent engine
//! - [`config`] - Configuration management
//! - [`metrics`] - Health counters and snapshots
//!
//! ## Blocking behavior
//!
//! Callers of [`JobManager::ensure_job`] and [`JobManager::seek_job`] never
//! block on transcoding: both return a [`Job`] handle immediately, and
//! callers synchronize on [`Job::wait_ready`], which fires exactly once
//! per job, whether the playlist appeared or the job terminally failed.
//!
//! ## Thread safety
//!
//! The manager map, segment cache, and probe cache use short critical
//! sections under `RwLock`/`DashMap`; slow filesystem work (segment
//! copies, eviction deletes, directory removal) always happens outside
//! any lock. FFmpeg progress is published through an atomic so the seek
//! path reads it lock-free.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use torrent_hls::{Config, JobKey, JobManager};
//!
//! # async fn run(streams: Arc<dyn torrent_hls::engine::StreamProvider>,
//! #              scheduler: Arc<dyn torrent_hls::engine::PieceScheduler>) {
//! let manager = JobManager::new(Config::load().unwrap(), streams, scheduler);
//! let job = manager.ensure_job(JobKey::new("torrent-hash", 0, 0, -1)).unwrap();
//! job.wait_ready(torrent_hls::job::PLAYLIST_READY_WAIT).await.unwrap();
//! let playlist = job.playlist();
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod job;
pub mod metrics;
pub mod probe;
pub mod remux;
pub mod source;
pub mod transcode;

/// Configuration re-exports.
///
/// See [`config`] for file locations and environment overrides.
pub use config::{Config, EncodingProfile};

/// Unified error type and result alias.
pub use error::{HlsError, HlsResult};

/// The job manager and its request-facing types.
///
/// This is the crate's primary entry point: the HTTP layer holds one
/// [`JobManager`] and routes playlist, segment, and seek requests
/// through it.
pub use job::{Job, JobKey, JobManager, PlaybackState, SeekMode};

/// Health snapshot handed to external observers.
pub use metrics::{HealthSnapshot, Metrics};

/// Background MKV→MP4 remux cache.
pub use remux::RemuxCache;
