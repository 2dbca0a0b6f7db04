//! Time-indexed persistent store of transcoded segments.
//!
//! Segments written by live jobs are harvested into this cache so that a
//! later job at the same profile can serve them without re-transcoding.
//! Entries outlive jobs; they leave only through LRU/TTL eviction,
//! `purge_torrent`, or deletion of the underlying file.
//!
//! Locking: a single `RwLock` guards the index, the eviction heap, and the
//! byte counter. Slow filesystem work (copying segments in, deleting
//! evicted files) always happens outside the lock; eviction collects its
//! victims under the lock and removes the files after releasing it.

pub mod eviction;
pub mod segment;

use crate::error::{HlsError, HlsResult};
use crate::metrics::CacheMetrics;
use eviction::{EvictionHeap, HeapEntry};
use segment::{parse_segment_filename, segment_filename, CachedSegment, SegmentKey};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, trace, warn};

/// Maximum gap between segments still considered contiguous.
const RANGE_GAP_TOLERANCE: f64 = 0.5;

/// Delay before the single retry of a failed purge directory removal.
const PURGE_RETRY_DELAY: Duration = Duration::from_millis(500);

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

struct CacheState {
    index: HashMap<SegmentKey, Vec<CachedSegment>>,
    heap: EvictionHeap,
    total_bytes: u64,
    max_bytes: u64,
    max_age: Duration,
}

impl CacheState {
    /// Remove one entry's bookkeeping (index, heap, byte counter).
    /// The caller deletes the file outside the lock.
    fn forget(&mut self, entry: &HeapEntry) {
        if let Some(list) = self.index.get_mut(&entry.key) {
            list.retain(|s| s.path != entry.path);
            if list.is_empty() {
                self.index.remove(&entry.key);
            }
        }
        self.total_bytes = self.total_bytes.saturating_sub(entry.size);
    }

    /// Pop victims while over budget or past the age limit.
    fn collect_victims(&mut self) -> Vec<PathBuf> {
        let cutoff = now_epoch().saturating_sub(self.max_age.as_secs());
        let mut victims = Vec::new();
        while let Some(oldest) = self.heap.peek() {
            let over_budget = self.total_bytes > self.max_bytes;
            let expired = oldest.mtime < cutoff;
            if !over_budget && !expired {
                break;
            }
            let entry = self.heap.pop().expect("peeked entry pops");
            self.forget(&entry);
            victims.push(entry.path);
        }
        victims
    }
}

/// The segment cache.
pub struct SegmentCache {
    base_dir: PathBuf,
    state: RwLock<CacheState>,
    metrics: Arc<CacheMetrics>,
}

impl SegmentCache {
    pub fn new(
        base_dir: PathBuf,
        max_bytes: u64,
        max_age: Duration,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        Self {
            base_dir,
            state: RwLock::new(CacheState {
                index: HashMap::new(),
                heap: EvictionHeap::new(),
                total_bytes: 0,
                max_bytes,
                max_age,
            }),
            metrics,
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Total bytes across all indexed segments.
    pub fn total_size(&self) -> u64 {
        self.state.read().unwrap().total_bytes
    }

    pub fn len(&self) -> usize {
        self.state.read().unwrap().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().unwrap().heap.is_empty()
    }

    pub fn set_max_bytes(&self, max_bytes: u64) {
        self.state.write().unwrap().max_bytes = max_bytes;
        self.evict();
    }

    pub fn set_max_age(&self, max_age: Duration) {
        self.state.write().unwrap().max_age = max_age;
        self.evict();
    }

    /// Copy `src_path` into the cache and index it.
    ///
    /// Exact `(start, end)` duplicates refresh the file in place without a
    /// second index entry. Overflow triggers eviction; victim files are
    /// deleted after the lock is released.
    pub fn store(
        &self,
        key: SegmentKey,
        start_sec: f64,
        end_sec: f64,
        src_path: &Path,
    ) -> HlsResult<CachedSegment> {
        if end_sec <= start_sec {
            return Err(HlsError::InvalidInput(format!(
                "segment range {start_sec}..{end_sec} is empty"
            )));
        }

        let dest_dir = self.base_dir.join(key.relative_dir());
        std::fs::create_dir_all(&dest_dir).map_err(|e| HlsError::CacheIo(e.to_string()))?;
        let dest = dest_dir.join(segment_filename(start_sec, end_sec));
        // Copy, never move: the live job still owns its working directory.
        let size = std::fs::copy(src_path, &dest).map_err(|e| {
            self.metrics.record_io_error();
            HlsError::CacheIo(e.to_string())
        })?;

        let segment = CachedSegment {
            start_sec,
            end_sec,
            path: dest.clone(),
            size_bytes: size,
        };

        let victims = {
            let mut state = self.state.write().unwrap();
            let list = state.index.entry(key.clone()).or_default();
            let duplicate = list
                .iter()
                .any(|s| s.start_sec == start_sec && s.end_sec == end_sec);
            if duplicate {
                trace!(cache_op = "store_duplicate", start_sec, end_sec);
                Vec::new()
            } else {
                let pos = list.partition_point(|s| s.start_sec < start_sec);
                list.insert(pos, segment.clone());
                state
                    .heap
                    .push(HeapEntry::new(now_epoch(), dest, size, key, start_sec));
                state.total_bytes += size;
                self.metrics.record_store();
                if state.total_bytes > state.max_bytes {
                    state.collect_victims()
                } else {
                    Vec::new()
                }
            }
        };

        self.remove_files(victims);
        Ok(segment)
    }

    /// Segment covering `time_sec`, if one is indexed.
    pub fn lookup(&self, key: &SegmentKey, time_sec: f64) -> Option<CachedSegment> {
        let state = self.state.read().unwrap();
        let found = state.index.get(key).and_then(|list| {
            // First segment whose end is past the query, then confirm it
            // actually covers it.
            let i = list.partition_point(|s| s.end_sec <= time_sec);
            list.get(i).filter(|s| s.covers(time_sec)).cloned()
        });
        drop(state);
        match &found {
            Some(_) => self.metrics.record_hit(),
            None => self.metrics.record_miss(),
        }
        found
    }

    /// The segment covering `from_sec` plus every subsequent contiguous
    /// segment (gaps up to half a second are bridged).
    pub fn lookup_range(&self, key: &SegmentKey, from_sec: f64) -> Vec<CachedSegment> {
        let state = self.state.read().unwrap();
        let Some(list) = state.index.get(key) else {
            drop(state);
            self.metrics.record_miss();
            return Vec::new();
        };
        let i = list.partition_point(|s| s.end_sec <= from_sec);
        let mut run: Vec<CachedSegment> = Vec::new();
        for segment in &list[i.min(list.len())..] {
            match run.last() {
                None => {
                    if !segment.covers(from_sec) {
                        break;
                    }
                    run.push(segment.clone());
                }
                Some(prev) if segment.start_sec - prev.end_sec <= RANGE_GAP_TOLERANCE => {
                    run.push(segment.clone());
                }
                Some(_) => break,
            }
        }
        drop(state);
        if run.is_empty() {
            self.metrics.record_miss();
        } else {
            self.metrics.record_hit();
        }
        run
    }

    /// Evict anything over the byte budget or past the age limit.
    pub fn evict(&self) {
        let victims = self.state.write().unwrap().collect_victims();
        self.remove_files(victims);
    }

    /// Drop every entry for `torrent_id` and delete its directory tree in
    /// the background (one retry). Returns the number of entries removed.
    pub fn purge_torrent(self: &Arc<Self>, torrent_id: &str) -> usize {
        let removed = {
            let mut state = self.state.write().unwrap();
            let keys: Vec<SegmentKey> = state
                .index
                .keys()
                .filter(|k| k.torrent_id == torrent_id)
                .cloned()
                .collect();
            let mut removed = 0;
            for key in keys {
                if let Some(list) = state.index.remove(&key) {
                    for segment in list {
                        if let Some(entry) = state.heap.remove_path(&segment.path) {
                            state.total_bytes = state.total_bytes.saturating_sub(entry.size);
                        }
                        removed += 1;
                    }
                }
            }
            removed
        };

        let dir = self.base_dir.join(torrent_id);
        tokio::spawn(async move {
            if let Err(first) = tokio::fs::remove_dir_all(&dir).await {
                if first.kind() == std::io::ErrorKind::NotFound {
                    return;
                }
                tokio::time::sleep(PURGE_RETRY_DELAY).await;
                if let Err(second) = tokio::fs::remove_dir_all(&dir).await {
                    if second.kind() != std::io::ErrorKind::NotFound {
                        warn!(
                            cache_op = "purge_failed",
                            dir = %dir.display(),
                            error = %second
                        );
                    }
                }
            }
        });

        debug!(cache_op = "purge", torrent_id, removed);
        removed
    }

    /// Rebuild the in-memory index from a cold directory scan.
    ///
    /// Walks `{base}/{torrent}/{file}/{track[-variant]}/t*.ts`, parsing
    /// time ranges out of filenames. Malformed names and unreadable
    /// entries are skipped. The heap is bulk-built in O(n).
    pub fn rebuild(&self) -> HlsResult<()> {
        let mut index: HashMap<SegmentKey, Vec<CachedSegment>> = HashMap::new();
        let mut entries: Vec<HeapEntry> = Vec::new();
        let mut total_bytes = 0u64;

        for (key, dir) in self.scan_track_dirs()? {
            let Ok(read_dir) = std::fs::read_dir(&dir) else {
                continue;
            };
            for file in read_dir.flatten() {
                let name = file.file_name();
                let Some(name) = name.to_str() else { continue };
                let Some((start_sec, end_sec)) = parse_segment_filename(name) else {
                    continue;
                };
                let Ok(meta) = file.metadata() else { continue };
                let mtime = meta
                    .modified()
                    .ok()
                    .and_then(|m| m.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                let path = file.path();
                index.entry(key.clone()).or_default().push(CachedSegment {
                    start_sec,
                    end_sec,
                    path: path.clone(),
                    size_bytes: meta.len(),
                });
                entries.push(HeapEntry::new(
                    mtime,
                    path,
                    meta.len(),
                    key.clone(),
                    start_sec,
                ));
                total_bytes += meta.len();
            }
        }

        for list in index.values_mut() {
            list.sort_by(|a, b| a.start_sec.total_cmp(&b.start_sec));
        }

        let count = entries.len();
        let mut state = self.state.write().unwrap();
        state.index = index;
        state.heap = EvictionHeap::build(entries);
        state.total_bytes = total_bytes;
        drop(state);

        debug!(cache_op = "rebuild", segments = count, total_bytes);
        Ok(())
    }

    /// Enumerate `(key, dir)` pairs for every track directory on disk.
    fn scan_track_dirs(&self) -> HlsResult<Vec<(SegmentKey, PathBuf)>> {
        let mut found = Vec::new();
        let Ok(torrents) = std::fs::read_dir(&self.base_dir) else {
            return Ok(found);
        };
        for torrent in torrents.flatten() {
            let Some(torrent_id) = torrent.file_name().to_str().map(String::from) else {
                continue;
            };
            let Ok(files) = std::fs::read_dir(torrent.path()) else {
                continue;
            };
            for file in files.flatten() {
                let Some(file_index) = file
                    .file_name()
                    .to_str()
                    .and_then(|s| s.parse::<usize>().ok())
                else {
                    continue;
                };
                let Ok(tracks) = std::fs::read_dir(file.path()) else {
                    continue;
                };
                for track in tracks.flatten() {
                    let Some(name) = track.file_name().to_str().map(String::from) else {
                        continue;
                    };
                    let Some(key) = parse_track_dir(&torrent_id, file_index, &name) else {
                        continue;
                    };
                    found.push((key, track.path()));
                }
            }
        }
        Ok(found)
    }

    fn remove_files(&self, victims: Vec<PathBuf>) {
        for path in victims {
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    self.metrics.record_eviction();
                    trace!(cache_op = "evicted", path = %path.display());
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    self.metrics.record_eviction();
                }
                Err(e) => {
                    self.metrics.record_io_error();
                    warn!(cache_op = "evict_remove_failed", path = %path.display(), error = %e);
                }
            }
        }
    }

    /// Sum of indexed sizes; test hook for the byte-counter invariant.
    #[cfg(test)]
    fn recount_bytes(&self) -> u64 {
        let state = self.state.read().unwrap();
        state
            .index
            .values()
            .flat_map(|list| list.iter())
            .map(|s| s.size_bytes)
            .sum()
    }
}

/// Parse a track directory name (`a0-s-1` or `a0-s-1-v2`) into a key.
fn parse_track_dir(torrent_id: &str, file_index: usize, name: &str) -> Option<SegmentKey> {
    if !name.starts_with('a') || !name.contains("-s") {
        return None;
    }
    let (track_key, variant) = match name.rfind("-v") {
        Some(pos) if name[pos + 2..].chars().all(|c| c.is_ascii_digit())
            && !name[pos + 2..].is_empty() =>
        {
            (&name[..pos], &name[pos + 1..])
        }
        _ => (name, ""),
    };
    Some(SegmentKey {
        torrent_id: torrent_id.to_string(),
        file_index,
        track_key: track_key.to_string(),
        variant: variant.to_string(),
    })
}
