//! Process configuration.
//!
//! Everything is read from environment variables (optionally loaded from a
//! `.env` file by `main`). [`AppConfig::from_lookup`] takes the lookup as a
//! closure so parsing can be tested without touching the real environment.

mod presets;

pub use presets::*;

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const GIB: u64 = 1024 * 1024 * 1024;
pub const MIB: u64 = 1024 * 1024;

/// Upper bound on concurrent ranges for one acquisition.
pub const MAX_PARALLEL_CHUNKS: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub temp_dir: PathBuf,
    pub max_download_bytes: u64,
    pub max_upload_bytes: u64,
    pub parallel_chunks: usize,
    pub min_parallel_bytes: u64,
    pub progress_interval: Duration,
    pub torrent_poll_interval: Duration,
    pub tools: ToolPaths,
    pub admin_id: Option<String>,
    pub default_preset: String,
    pub default_crf: u8,
    pub log: LogSettings,
}

/// Locations of the external binaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolPaths {
    pub ffmpeg: String,
    pub ffprobe: String,
    pub ytdlp: String,
    pub aria2c: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".to_string(),
            ffprobe: "ffprobe".to_string(),
            ytdlp: "yt-dlp".to_string(),
            aria2c: "aria2c".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    /// Directory for rolling log files; console only when unset.
    pub dir: Option<PathBuf>,
    pub retention_days: i64,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            dir: None,
            retention_days: 7,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            temp_dir: std::env::temp_dir().join("vidforge"),
            max_download_bytes: 2 * GIB,
            max_upload_bytes: 2 * GIB,
            parallel_chunks: 8,
            min_parallel_bytes: 4 * MIB,
            progress_interval: Duration::from_secs(3),
            torrent_poll_interval: Duration::from_secs(2),
            tools: ToolPaths::default(),
            admin_id: None,
            default_preset: "fast".to_string(),
            default_crf: 23,
            log: LogSettings::default(),
        }
    }
}

impl AppConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary key lookup; unset or blank keys keep defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(dir) = get("TEMP_DIR") {
            config.temp_dir = PathBuf::from(dir);
        }
        if let Some(v) = get("MAX_DOWNLOAD_BYTES") {
            config.max_download_bytes = parse_num("MAX_DOWNLOAD_BYTES", &v)?;
        }
        if let Some(v) = get("MAX_UPLOAD_BYTES") {
            config.max_upload_bytes = parse_num("MAX_UPLOAD_BYTES", &v)?;
        }
        if let Some(v) = get("PARALLEL_CHUNKS") {
            let n: usize = parse_num("PARALLEL_CHUNKS", &v)?;
            config.parallel_chunks = n.clamp(1, MAX_PARALLEL_CHUNKS);
        }
        if let Some(v) = get("MIN_PARALLEL_BYTES") {
            config.min_parallel_bytes = parse_num("MIN_PARALLEL_BYTES", &v)?;
        }
        if let Some(v) = get("PROGRESS_INTERVAL_MS") {
            config.progress_interval =
                Duration::from_millis(parse_num("PROGRESS_INTERVAL_MS", &v)?);
        }
        if let Some(v) = get("TORRENT_POLL_MS") {
            let ms: u64 = parse_num("TORRENT_POLL_MS", &v)?;
            config.torrent_poll_interval = Duration::from_millis(ms.max(100));
        }
        if let Some(v) = get("FFMPEG_PATH") {
            config.tools.ffmpeg = v;
        }
        if let Some(v) = get("FFPROBE_PATH") {
            config.tools.ffprobe = v;
        }
        if let Some(v) = get("YTDLP_PATH") {
            config.tools.ytdlp = v;
        }
        if let Some(v) = get("ARIA2C_PATH") {
            config.tools.aria2c = v;
        }
        config.admin_id = get("ADMIN_ID").map(|v| v.trim().to_string());
        if let Some(v) = get("DEFAULT_PRESET") {
            if !X264_PRESETS.contains(&v.as_str()) {
                return Err(Error::config(format!("DEFAULT_PRESET: unknown preset '{v}'")));
            }
            config.default_preset = v;
        }
        if let Some(v) = get("DEFAULT_CRF") {
            let crf: u8 = parse_num("DEFAULT_CRF", &v)?;
            if crf > 51 {
                return Err(Error::config("DEFAULT_CRF must be between 0 and 51"));
            }
            config.default_crf = crf;
        }
        if let Some(dir) = get("LOG_DIR") {
            config.log.dir = Some(PathBuf::from(dir));
        }
        if let Some(v) = get("LOG_RETENTION_DAYS") {
            config.log.retention_days = parse_num("LOG_RETENTION_DAYS", &v)?;
        }

        Ok(config)
    }

    pub fn is_admin(&self, user: &str) -> bool {
        self.admin_id.as_deref() == Some(user)
    }
}

fn parse_num<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .replace('_', "")
        .parse()
        .map_err(|_| Error::config(format!("{key}: '{value}' is not a valid number")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.max_download_bytes, 2 * GIB);
        assert_eq!(config.parallel_chunks, 8);
        assert_eq!(config.progress_interval, Duration::from_secs(3));
        assert_eq!(config.tools.ffmpeg, "ffmpeg");
        assert!(config.admin_id.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = AppConfig::from_lookup(lookup(&[
            ("TEMP_DIR", "/data/tmp"),
            ("MAX_DOWNLOAD_BYTES", "1_000_000"),
            ("PARALLEL_CHUNKS", "64"),
            ("ADMIN_ID", " 42 "),
            ("FFMPEG_PATH", "/opt/ffmpeg/bin/ffmpeg"),
            ("DEFAULT_PRESET", "ultrafast"),
        ]))
        .unwrap();
        assert_eq!(config.temp_dir, PathBuf::from("/data/tmp"));
        assert_eq!(config.max_download_bytes, 1_000_000);
        assert_eq!(config.parallel_chunks, MAX_PARALLEL_CHUNKS);
        assert!(config.is_admin("42"));
        assert_eq!(config.tools.ffmpeg, "/opt/ffmpeg/bin/ffmpeg");
        assert_eq!(config.default_preset, "ultrafast");
    }

    #[test]
    fn test_invalid_values() {
        let err = AppConfig::from_lookup(lookup(&[("MAX_UPLOAD_BYTES", "lots")])).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        let err = AppConfig::from_lookup(lookup(&[("DEFAULT_CRF", "70")])).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        let err = AppConfig::from_lookup(lookup(&[("DEFAULT_PRESET", "warp")])).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
