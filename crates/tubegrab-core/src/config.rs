//! Engine configuration management.
//!
//! Handles loading, saving, and validating the settings that tune the
//! download pipeline: retry budget, progress cadence, transcoding, network
//! timeouts and session concurrency.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, ErrorContext, Result};

// =============================================================================
// Constants
// =============================================================================

/// Default MP3 bitrate in kbps.
pub const DEFAULT_MP3_BITRATE_KBPS: u32 = 192;

/// Default number of download attempts (first try included).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 4;

/// Default minimum time between progress events.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Default byte delta that forces a progress event regardless of time.
pub const DEFAULT_PROGRESS_BYTE_THRESHOLD: u64 = 1024 * 1024;

/// Default number of sessions allowed to run at once.
pub const DEFAULT_MAX_CONCURRENT_SESSIONS: usize = 3;

const MAX_ALLOWED_ATTEMPTS: u32 = 20;
const MAX_ALLOWED_CONCURRENT_SESSIONS: usize = 32;

// =============================================================================
// Retry
// =============================================================================

/// Retry policy for transient network failures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub initial_backoff_ms: u64,
    /// Factor applied to the delay after each retry.
    pub multiplier: f64,
    /// Upper bound on a single delay, in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff_ms: 500,
            multiplier: 2.0,
            max_backoff_ms: 30_000,
        }
    }
}

impl RetryConfig {
    /// A policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay to wait before retry number `retry` (1-based).
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let raw = self.initial_backoff_ms as f64 * self.multiplier.powi(exponent);
        let capped = raw.min(self.max_backoff_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 || self.max_attempts > MAX_ALLOWED_ATTEMPTS {
            return Err(Error::Configuration(format!(
                "retry.max_attempts must be between 1 and {MAX_ALLOWED_ATTEMPTS}"
            )));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(Error::Configuration(
                "retry.multiplier must be a finite number >= 1.0".to_string(),
            ));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(Error::Configuration(
                "retry.max_backoff_ms must not be below retry.initial_backoff_ms".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Progress
// =============================================================================

/// Progress reporting cadence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProgressConfig {
    /// Minimum time between two progress events, in milliseconds.
    pub min_interval_ms: u64,
    /// Bytes transferred since the last event that force a new one.
    pub byte_threshold: u64,
    /// Events buffered per subscriber before the oldest are dropped.
    pub channel_capacity: usize,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 100,
            byte_threshold: DEFAULT_PROGRESS_BYTE_THRESHOLD,
            channel_capacity: 64,
        }
    }
}

impl ProgressConfig {
    /// Minimum interval as a `Duration`.
    #[must_use]
    pub const fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }
}

// =============================================================================
// Transcoding
// =============================================================================

/// Settings for MP3 post-processing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TranscodeConfig {
    /// Target MP3 bitrate in kbps.
    pub mp3_bitrate_kbps: u32,
    /// Explicit path to the ffmpeg binary, checked before any other location.
    pub ffmpeg_path: Option<PathBuf>,
    /// Kill the transcoder after this many seconds.
    pub timeout_secs: u64,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            mp3_bitrate_kbps: DEFAULT_MP3_BITRATE_KBPS,
            ffmpeg_path: None,
            timeout_secs: 600,
        }
    }
}

// =============================================================================
// Network
// =============================================================================

/// HTTP transport settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Connection timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Maximum silence between two body chunks, in seconds.
    pub read_timeout_secs: u64,
    /// User agent sent with every request.
    pub user_agent: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 15,
            read_timeout_secs: 30,
            user_agent: format!("tubegrab/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Complete engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Directory used when a request does not name one.
    #[serde(default = "default_download_directory")]
    pub download_directory: PathBuf,
    /// Maximum sessions downloading at the same time.
    #[serde(default = "default_max_concurrent_sessions")]
    pub max_concurrent_sessions: usize,
    /// Retry policy.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Progress cadence.
    #[serde(default)]
    pub progress: ProgressConfig,
    /// Post-processing settings.
    #[serde(default)]
    pub transcode: TranscodeConfig,
    /// Transport settings.
    #[serde(default)]
    pub network: NetworkConfig,
}

const fn default_max_concurrent_sessions() -> usize {
    DEFAULT_MAX_CONCURRENT_SESSIONS
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            download_directory: default_download_directory(),
            max_concurrent_sessions: DEFAULT_MAX_CONCURRENT_SESSIONS,
            retry: RetryConfig::default(),
            progress: ProgressConfig::default(),
            transcode: TranscodeConfig::default(),
            network: NetworkConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from the platform config directory, or defaults if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        let path = config_file_path();
        if !path.exists() {
            debug!("Config file not found at {}, using defaults", path.display());
            let config = Self::default();
            if let Err(e) = config.save_to(&path) {
                warn!("Failed to save default config: {}", e);
            }
            return Ok(config);
        }
        Self::load_from(&path)
    }

    /// Load and validate configuration from `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or fails validation.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).disk_context(path)?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| Error::Configuration(format!("Failed to parse config file: {e}")))?;
        config.validate()?;

        info!("Loaded config from {}", path.display());
        debug!(
            "Download directory: {}, max sessions: {}",
            config.download_directory.display(),
            config.max_concurrent_sessions
        );
        Ok(config)
    }

    /// Save configuration to `path`, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            fs::create_dir_all(parent).disk_context(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).disk_context(path)?;

        info!("Saved config to {}", path.display());
        Ok(())
    }

    /// Get the path of the platform config file.
    #[must_use]
    pub fn config_file_path() -> PathBuf {
        config_file_path()
    }

    /// Check that every setting is usable.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_sessions == 0
            || self.max_concurrent_sessions > MAX_ALLOWED_CONCURRENT_SESSIONS
        {
            return Err(Error::Configuration(format!(
                "max_concurrent_sessions must be between 1 and {MAX_ALLOWED_CONCURRENT_SESSIONS}"
            )));
        }
        self.retry.validate()?;
        if self.progress.channel_capacity == 0 {
            return Err(Error::Configuration(
                "progress.channel_capacity must be at least 1".to_string(),
            ));
        }
        if !(32..=320).contains(&self.transcode.mp3_bitrate_kbps) {
            return Err(Error::Configuration(
                "transcode.mp3_bitrate_kbps must be between 32 and 320".to_string(),
            ));
        }
        if self.transcode.timeout_secs == 0 {
            return Err(Error::Configuration(
                "transcode.timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.network.connect_timeout_secs == 0 || self.network.read_timeout_secs == 0 {
            return Err(Error::Configuration(
                "network timeouts must be at least 1 second".to_string(),
            ));
        }
        Ok(())
    }
}

/// Get the default download directory.
#[must_use]
pub fn default_download_directory() -> PathBuf {
    dirs::download_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tubegrab")
}

fn config_file_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| dirs::data_local_dir().unwrap_or_else(|| PathBuf::from(".")))
        .join("tubegrab")
        .join("config.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.transcode.mp3_bitrate_kbps, 192);
        assert_eq!(config.max_concurrent_sessions, DEFAULT_MAX_CONCURRENT_SESSIONS);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let retry = RetryConfig {
            max_attempts: 5,
            initial_backoff_ms: 100,
            multiplier: 2.0,
            max_backoff_ms: 350,
        };
        assert_eq!(retry.backoff_for(1), Duration::from_millis(100));
        assert_eq!(retry.backoff_for(2), Duration::from_millis(200));
        assert_eq!(retry.backoff_for(3), Duration::from_millis(350));
        assert_eq!(retry.backoff_for(10), Duration::from_millis(350));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = EngineConfig::default();
        config.max_concurrent_sessions = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.retry.multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.transcode.mp3_bitrate_kbps = 1000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().join("nested").join("config.json");

        let mut config = EngineConfig::default();
        config.download_directory = temp_dir.path().join("downloads");
        config.transcode.mp3_bitrate_kbps = 256;
        config.save_to(&path).expect("Failed to save");

        let loaded = EngineConfig::load_from(&path).expect("Failed to load");
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().join("config.json");
        fs::write(&path, r#"{"transcode": {"mp3_bitrate_kbps": 128}}"#).expect("write");

        let loaded = EngineConfig::load_from(&path).expect("Failed to load");
        assert_eq!(loaded.transcode.mp3_bitrate_kbps, 128);
        assert_eq!(loaded.transcode.timeout_secs, 600);
        assert_eq!(loaded.retry, RetryConfig::default());
        assert_eq!(loaded.max_concurrent_sessions, DEFAULT_MAX_CONCURRENT_SESSIONS);
    }

    #[test]
    fn test_invalid_file_is_configuration_error() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().join("config.json");
        fs::write(&path, "not json").expect("write");

        let err = EngineConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_default_download_directory() {
        let dir = default_download_directory();
        assert!(dir.to_string_lossy().contains("tubegrab"));
    }
}
