//! Configuration management: defaults, config files, and environment overrides.

use crate::error::{HlsError, ValidationIssue};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the HLS streaming core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub encoding: EncodingProfile,
    #[serde(default)]
    pub transcoder: TranscoderConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Filesystem roots used by jobs, caches, and remuxing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root for job working directories, remux output, and the codec cache JSON.
    pub hls_base_dir: PathBuf,
    /// Root for the persistent segment cache.
    pub segment_cache_dir: PathBuf,
    /// Directory where the torrent engine materializes downloaded files.
    pub data_dir: PathBuf,
}

/// Encoding parameters shared by every transcoding job.
///
/// Changing any field changes [`EncodingProfile::profile_hash`] and with it
/// the job directory path, so stale output from an older profile is never
/// served for a new one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodingProfile {
    pub preset: String,
    pub crf: u32,
    pub audio_bitrate_kbps: u32,
    pub segment_duration_secs: u32,
}

/// External tool locations and supervision windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscoderConfig {
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    /// Seconds the watchdog waits for the first playlist file.
    pub startup_timeout_secs: u64,
}

/// Segment and codec cache limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_bytes: u64,
    pub max_age_secs: u64,
    pub codec_cache_entries: usize,
}

/// Ring buffer sizing for pipe data sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub ring_capacity_bytes: usize,
    pub prebuffer_bytes: usize,
    /// Seconds of continuous source starvation before terminal EOF.
    pub max_stall_secs: u64,
}

/// Logging output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub metrics_interval_secs: u64,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            hls_base_dir: PathBuf::from("/var/lib/torrent-hls/jobs"),
            segment_cache_dir: PathBuf::from("/var/lib/torrent-hls/segments"),
            data_dir: PathBuf::from("/var/lib/torrent-hls/data"),
        }
    }
}

impl Default for EncodingProfile {
    fn default() -> Self {
        Self {
            preset: "veryfast".to_string(),
            crf: 23,
            audio_bitrate_kbps: 128,
            segment_duration_secs: 4,
        }
    }
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
            startup_timeout_secs: 120,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: 4 * 1024 * 1024 * 1024,
            max_age_secs: 6 * 3600,
            codec_cache_entries: 512,
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            ring_capacity_bytes: 16 * 1024 * 1024,
            prebuffer_bytes: 2 * 1024 * 1024,
            max_stall_secs: 180,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            metrics_interval_secs: 60,
        }
    }
}

impl EncodingProfile {
    /// First 8 hex characters of a SHA-256 over the canonical field string.
    ///
    /// Stable across process restarts so completed job directories survive
    /// a daemon restart, and sensitive to every profile field.
    pub fn profile_hash(&self) -> String {
        let canonical = format!(
            "{}|{}|{}|{}",
            self.preset, self.crf, self.audio_bitrate_kbps, self.segment_duration_secs
        );
        let digest = Sha256::digest(canonical.as_bytes());
        digest[..4].iter().map(|b| format!("{:02x}", b)).collect()
    }

    pub fn segment_duration(&self) -> Duration {
        Duration::from_secs(self.segment_duration_secs as u64)
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_file(path: &PathBuf) -> Result<Self, HlsError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| HlsError::ConfigRead(e.to_string()))?;

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase());
        match ext.as_deref() {
            Some("json") => {
                serde_json::from_str(&content).map_err(|e| HlsError::ConfigParse(e.to_string()))
            }
            _ => toml::from_str(&content).map_err(|e| HlsError::ConfigParse(e.to_string())),
        }
    }

    pub fn from_default_locations() -> Result<Self, HlsError> {
        let config_dirs = [
            dirs::config_dir().map(|d| d.join("torrent-hls/config.toml")),
            Some(PathBuf::from("/etc/torrent-hls/config.toml")),
            Some(PathBuf::from("./torrent-hls.toml")),
        ];

        for path in config_dirs.iter().flatten() {
            if path.exists() {
                tracing::info!("Loading config from: {}", path.display());
                return Self::from_file(path);
            }
        }

        Ok(Self::default())
    }

    pub fn merge_from_env(mut self) -> Result<Self, HlsError> {
        if let Ok(val) = std::env::var("TORRENT_HLS_BASE_DIR") {
            self.paths.hls_base_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("TORRENT_HLS_SEGMENT_CACHE_DIR") {
            self.paths.segment_cache_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("TORRENT_HLS_DATA_DIR") {
            self.paths.data_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("TORRENT_HLS_FFMPEG") {
            self.transcoder.ffmpeg_path = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("TORRENT_HLS_FFPROBE") {
            self.transcoder.ffprobe_path = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("TORRENT_HLS_PRESET") {
            self.encoding.preset = val;
        }
        if let Ok(val) = std::env::var("TORRENT_HLS_CRF") {
            self.encoding.crf = val
                .parse()
                .map_err(|_| HlsError::InvalidInput("TORRENT_HLS_CRF has invalid format".into()))?;
        }
        if let Ok(val) = std::env::var("TORRENT_HLS_CACHE_MAX_BYTES") {
            self.cache.max_bytes = val.parse().map_err(|_| {
                HlsError::InvalidInput("TORRENT_HLS_CACHE_MAX_BYTES has invalid format".into())
            })?;
        }
        if let Ok(val) = std::env::var("TORRENT_HLS_LOG_LEVEL") {
            self.logging.level = val;
        }

        Ok(self)
    }

    pub fn load() -> Result<Self, HlsError> {
        Self::from_default_locations()?.merge_from_env()
    }

    pub fn validate(&self) -> Result<(), HlsError> {
        let mut issues = Vec::new();

        if !self.paths.hls_base_dir.is_absolute() {
            issues.push(ValidationIssue {
                field: "paths.hls_base_dir".to_string(),
                message: "must be an absolute path".to_string(),
            });
        }
        if !self.paths.segment_cache_dir.is_absolute() {
            issues.push(ValidationIssue {
                field: "paths.segment_cache_dir".to_string(),
                message: "must be an absolute path".to_string(),
            });
        }

        let valid_presets = [
            "ultrafast", "superfast", "veryfast", "faster", "fast", "medium", "slow", "slower",
            "veryslow",
        ];
        if !valid_presets.contains(&self.encoding.preset.as_str()) {
            issues.push(ValidationIssue {
                field: "encoding.preset".to_string(),
                message: format!(
                    "invalid preset '{}'. Valid presets: {}",
                    self.encoding.preset,
                    valid_presets.join(", ")
                ),
            });
        }
        if self.encoding.crf > 51 {
            issues.push(ValidationIssue {
                field: "encoding.crf".to_string(),
                message: "must be between 0 and 51".to_string(),
            });
        }
        if self.encoding.segment_duration_secs == 0 {
            issues.push(ValidationIssue {
                field: "encoding.segment_duration_secs".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        if self.buffer.ring_capacity_bytes < 1024 * 1024 {
            issues.push(ValidationIssue {
                field: "buffer.ring_capacity_bytes".to_string(),
                message: "must be at least 1 MiB".to_string(),
            });
        }

        let valid_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            issues.push(ValidationIssue {
                field: "logging.level".to_string(),
                message: format!(
                    "Invalid log level '{}'. Valid levels: {}",
                    self.logging.level,
                    valid_levels.join(", ")
                ),
            });
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(HlsError::Validation(issues))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.encoding.preset, "veryfast");
        assert_eq!(config.encoding.crf, 23);
        assert_eq!(config.encoding.segment_duration_secs, 4);
        assert_eq!(config.transcoder.startup_timeout_secs, 120);
        assert_eq!(config.buffer.max_stall_secs, 180);
        assert!(config.validate().is_ok());
    }

    fn parse_config_content(content: &str, ext: &str) -> Config {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(content.as_bytes()).unwrap();
        let mut path = temp_file.path().to_path_buf();
        path.set_extension(ext);
        std::fs::rename(temp_file.path(), &path).unwrap();
        Config::from_file(&path).unwrap()
    }

    #[test]
    fn test_toml_config_parsing() {
        let c = parse_config_content(
            r#"[paths]
hls_base_dir = "/srv/hls"

[encoding]
preset = "fast"
crf = 28

[cache]
max_bytes = 1073741824

[buffer]
ring_capacity_bytes = 8388608"#,
            "toml",
        );
        assert_eq!(c.paths.hls_base_dir, PathBuf::from("/srv/hls"));
        assert_eq!(c.encoding.preset, "fast");
        assert_eq!(c.encoding.crf, 28);
        assert_eq!(c.cache.max_bytes, 1073741824);
        assert_eq!(c.buffer.ring_capacity_bytes, 8388608);
        // Unspecified sections keep their defaults.
        assert_eq!(c.encoding.audio_bitrate_kbps, 128);
    }

    #[test]
    fn test_json_config_parsing() {
        let c = parse_config_content(
            r#"{"encoding": {"preset": "medium", "crf": 20}, "cache": {"max_age_secs": 7200}}"#,
            "json",
        );
        assert_eq!(c.encoding.preset, "medium");
        assert_eq!(c.encoding.crf, 20);
        assert_eq!(c.cache.max_age_secs, 7200);
    }

    #[test]
    fn test_validate_bad_preset() {
        let mut config = Config::default();
        config.encoding.preset = "warpspeed".to_string();
        let result = config.validate();
        assert!(matches!(result, Err(HlsError::Validation(_))));
    }

    #[test]
    fn test_validate_crf_range() {
        let mut config = Config::default();
        config.encoding.crf = 52;
        assert!(config.validate().is_err());
        config.encoding.crf = 51;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_relative_base_dir() {
        let mut config = Config::default();
        config.paths.hls_base_dir = PathBuf::from("relative/path");
        assert!(config.validate().is_err());
    }

    #[rstest::rstest]
    #[case("error", true)]
    #[case("warn", true)]
    #[case("info", true)]
    #[case("debug", true)]
    #[case("trace", true)]
    #[case("loud", false)]
    #[case("INFO", false)]
    fn test_validate_log_level(#[case] level: &str, #[case] should_pass: bool) {
        let mut config = Config::default();
        config.logging.level = level.to_string();
        let result = config.validate();
        if should_pass {
            assert!(result.is_ok(), "Level {} should be valid", level);
        } else {
            assert!(result.is_err(), "Level {} should be invalid", level);
        }
    }

    #[test]
    fn test_profile_hash_is_eight_hex_chars() {
        let profile = EncodingProfile::default();
        let hash = profile.profile_hash();
        assert_eq!(hash.len(), 8);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[rstest::rstest]
    #[case::preset(|p: &mut EncodingProfile| p.preset = "medium".to_string())]
    #[case::crf(|p: &mut EncodingProfile| p.crf = 28)]
    #[case::audio(|p: &mut EncodingProfile| p.audio_bitrate_kbps = 192)]
    #[case::segdur(|p: &mut EncodingProfile| p.segment_duration_secs = 6)]
    fn test_profile_hash_changes_with_any_field(#[case] mutate: fn(&mut EncodingProfile)) {
        let base = EncodingProfile::default();
        let mut changed = base.clone();
        mutate(&mut changed);
        assert_ne!(base.profile_hash(), changed.profile_hash());
    }

    #[test]
    fn test_profile_hash_stable() {
        let a = EncodingProfile::default();
        let b = EncodingProfile::default();
        assert_eq!(a.profile_hash(), b.profile_hash());
    }
}
