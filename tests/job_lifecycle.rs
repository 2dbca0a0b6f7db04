//! End-to-end job lifecycle against a scripted transcoder.

#![cfg(unix)]

mod common;

use common::*;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use torrent_hls::cache::segment::SegmentKey;
use torrent_hls::{JobKey, JobManager, PlaybackState};

fn write_media(data_dir: &std::path::Path, name: &str, bytes: usize) {
    std::fs::create_dir_all(data_dir).unwrap();
    std::fs::write(data_dir.join(name), vec![0x42u8; bytes]).unwrap();
}

#[tokio::test]
async fn test_initial_play_incomplete_file_uses_pipe() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path(), happy_ffmpeg(tmp.path()), mock_ffprobe(tmp.path()));
    write_media(&config.paths.data_dir, "movie.mkv", 4096);

    // 4 KiB of a claimed 100 MiB: far too little for partial-direct.
    let streams = Arc::new(FileStreamProvider::partial(
        &config.paths.data_dir,
        "movie.mkv",
        100 * 1024 * 1024,
        4096,
    ));
    let manager = JobManager::new(config, streams, RecordingScheduler::new());

    let key = JobKey::new("t1", 0, 0, -1);
    let job = manager.ensure_job(key.clone()).unwrap();
    job.wait_ready(Duration::from_secs(10)).await.unwrap();

    assert_eq!(job.state(), PlaybackState::Playing);
    assert!(job.playlist().exists());
    assert!(!job.multi_variant());

    // Same key returns the same instance.
    let again = manager.ensure_job(key).unwrap();
    assert!(Arc::ptr_eq(&job, &again));

    manager.shutdown().await;
}

#[tokio::test]
async fn test_complete_file_plays_and_finishes() -> anyhow::Result<()> {
    let tmp = TempDir::new()?;
    let config = test_config(tmp.path(), happy_ffmpeg(tmp.path()), mock_ffprobe(tmp.path()));
    write_media(&config.paths.data_dir, "movie.mkv", 8192);

    let streams = Arc::new(FileStreamProvider::complete(
        &config.paths.data_dir,
        "movie.mkv",
    ));
    let manager = JobManager::new(config, streams, RecordingScheduler::new());

    let job = manager.ensure_job(JobKey::new("t1", 0, 0, -1))?;
    job.wait_ready(Duration::from_secs(10)).await?;

    let done = {
        let job = Arc::clone(&job);
        wait_until(
            move || job.state() == PlaybackState::Completed,
            Duration::from_secs(10),
        )
        .await
    };
    assert!(done, "job should complete once ENDLIST lands");

    manager.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_crash_restart_registers_successor() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(
        tmp.path(),
        crash_once_ffmpeg(tmp.path()),
        mock_ffprobe(tmp.path()),
    );
    write_media(&config.paths.data_dir, "movie.mkv", 8192);

    let streams = Arc::new(FileStreamProvider::complete(
        &config.paths.data_dir,
        "movie.mkv",
    ));
    let manager = JobManager::new(config, streams, RecordingScheduler::new());

    let key = JobKey::new("t1", 0, 0, -1);
    let original = manager.ensure_job(key.clone()).unwrap();

    // The first run dies without ENDLIST; one auto-restart finishes it.
    let manager_probe = Arc::clone(&manager);
    let key_probe = key.clone();
    let original_probe = Arc::clone(&original);
    let replaced = wait_until(
        move || {
            manager_probe
                .ensure_job(key_probe.clone())
                .map(|job| {
                    !Arc::ptr_eq(&job, &original_probe)
                        && job.state() == PlaybackState::Completed
                })
                .unwrap_or(false)
        },
        Duration::from_secs(15),
    )
    .await;
    assert!(replaced, "successor job should complete under the same key");

    let metrics = manager.metrics();
    assert_eq!(metrics.jobs.auto_restart_count.load(Ordering::Relaxed), 1);
    assert_eq!(metrics.jobs.restart_ffmpeg_exit.load(Ordering::Relaxed), 1);

    let successor = manager.ensure_job(key).unwrap();
    assert_eq!(successor.restart_count.load(Ordering::Relaxed), 1);
    assert_eq!(successor.dir, original.dir);

    // The superseded original advanced its generation, so any callback
    // still in flight from the crashed transcoder is rejected.
    assert!(original.generation() >= 1);
    assert!(!original.mark_playing(0));

    manager.shutdown().await;
}

#[tokio::test]
async fn test_profile_change_moves_job_directory() -> anyhow::Result<()> {
    let tmp = TempDir::new()?;
    let config = test_config(tmp.path(), happy_ffmpeg(tmp.path()), mock_ffprobe(tmp.path()));
    write_media(&config.paths.data_dir, "movie.mkv", 8192);

    let streams = Arc::new(FileStreamProvider::complete(
        &config.paths.data_dir,
        "movie.mkv",
    ));
    let manager = JobManager::new(config, streams, RecordingScheduler::new());

    let key = JobKey::new("t1", 0, 0, -1);
    let first = manager.ensure_job(key.clone())?;
    let first_dir = first.dir.clone();
    manager.stop_job(&key);

    let mut profile = manager.encoding_profile();
    profile.crf = 28;
    manager.set_encoding_profile(profile);

    let second = manager.ensure_job(key)?;
    assert_ne!(first_dir, second.dir);
    // Only the profile-hash component differs.
    assert_eq!(first_dir.parent(), second.dir.parent());
    let name_a = first_dir.file_name().unwrap().to_string_lossy().into_owned();
    let name_b = second.dir.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name_a.starts_with("a0-s-1-p"));
    assert!(name_b.starts_with("a0-s-1-p"));
    assert_ne!(name_a, name_b);

    manager.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_completed_playlist_reused_across_restart_with_cached_segments() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path(), happy_ffmpeg(tmp.path()), mock_ffprobe(tmp.path()));
    write_media(&config.paths.data_dir, "movie.mkv", 8192);
    let key = JobKey::new("t1", 0, 0, -1);

    // First process lifetime: run the job to completion and let the
    // harvester sweep segments into the cache.
    {
        let streams = Arc::new(FileStreamProvider::complete(
            &config.paths.data_dir,
            "movie.mkv",
        ));
        let manager = JobManager::new(config.clone(), streams, RecordingScheduler::new());
        let job = manager.ensure_job(key.clone()).unwrap();
        job.wait_ready(Duration::from_secs(10)).await.unwrap();

        let segments = Arc::clone(manager.segment_cache());
        let harvested = wait_until(
            move || {
                segments
                    .lookup(&SegmentKey::new("t1", 0, 0, -1, ""), 9.0)
                    .is_some()
            },
            Duration::from_secs(15),
        )
        .await;
        assert!(harvested, "segments should reach the cache");
        manager.shutdown().await;
    }

    // Second process lifetime: the finished playlist is reused without
    // starting a transcoder, and the cache rebuilds from disk.
    {
        let streams = Arc::new(FileStreamProvider::complete(
            &config.paths.data_dir,
            "movie.mkv",
        ));
        let manager = JobManager::new(config, streams, RecordingScheduler::new());

        let job = manager.ensure_job(key).unwrap();
        assert_eq!(job.state(), PlaybackState::Completed);
        job.wait_ready(Duration::from_millis(100)).await.unwrap();
        assert_eq!(
            manager.metrics().jobs.started_count.load(Ordering::Relaxed),
            0,
            "no transcoder may start for a finished playlist"
        );

        let cached = manager
            .segment_cache()
            .lookup(&SegmentKey::new("t1", 0, 0, -1, ""), 5.0);
        assert!(cached.is_some(), "cache must rebuild from a cold scan");
        manager.shutdown().await;
    }
}

#[tokio::test]
async fn test_stream_failure_is_terminal_and_counted() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path(), happy_ffmpeg(tmp.path()), mock_ffprobe(tmp.path()));
    // No media file at all: the provider errors out.

    let streams = Arc::new(FileStreamProvider::partial(
        &config.paths.data_dir,
        "missing.mkv",
        1024,
        0,
    ));
    let manager = JobManager::new(config, streams, RecordingScheduler::new());

    let job = manager.ensure_job(JobKey::new("t1", 0, 0, -1)).unwrap();
    let err = job.wait_ready(Duration::from_secs(5)).await.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(job.state(), PlaybackState::Error);
    assert_eq!(
        manager.metrics().jobs.failed_count.load(Ordering::Relaxed),
        1
    );

    manager.shutdown().await;
}
