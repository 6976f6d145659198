//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/mmp/config.toml`. Every field is
//! optional; a missing file yields the defaults.
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/mmp/` (~/.config/mmp/)
//! - Data: `$XDG_DATA_HOME/mmp/` (~/.local/share/mmp/)
//! - State/Logs: `$XDG_STATE_HOME/mmp/` (~/.local/state/mmp/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Library version reported as `$lib_version` on every message.
pub const LIB_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Ingestion endpoint and flush policy
    #[serde(default)]
    pub api: ApiConfig,

    /// Tracking defaults
    #[serde(default)]
    pub tracking: TrackingConfig,

    /// Device description attached to people profiles
    #[serde(default)]
    pub device: DeviceConfig,

    /// Optional integrations available to this process
    #[serde(default)]
    pub capabilities: Capabilities,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Override for the database location (defaults to the XDG data dir)
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

/// Remote API configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    /// Base URL of the ingestion API
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Seconds between periodic flushes
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,

    /// Records per request, and the queue depth that triggers a flush
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Per-token ceiling on queued records; oldest are evicted beyond it
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// HTTP request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// First backoff delay after a transient failure
    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: u64,

    /// Upper bound for the backoff delay
    #[serde(default = "default_backoff_max")]
    pub backoff_max_secs: u64,

    /// Minimum seconds between decide refreshes
    #[serde(default = "default_decide_interval")]
    pub decide_interval_secs: u64,

    /// Never poll the decide endpoint
    #[serde(default)]
    pub disable_decide: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            flush_interval_secs: default_flush_interval(),
            batch_size: default_batch_size(),
            max_queue_size: default_max_queue_size(),
            timeout_secs: default_timeout(),
            backoff_base_secs: default_backoff_base(),
            backoff_max_secs: default_backoff_max(),
            decide_interval_secs: default_decide_interval(),
            disable_decide: false,
        }
    }
}

fn default_base_url() -> String {
    "https://api.mmp.com".to_string()
}

fn default_flush_interval() -> u64 {
    60
}

fn default_batch_size() -> usize {
    50
}

fn default_max_queue_size() -> usize {
    1000
}

fn default_timeout() -> u64 {
    30
}

fn default_backoff_base() -> u64 {
    60
}

fn default_backoff_max() -> u64 {
    600
}

fn default_decide_interval() -> u64 {
    3600
}

impl ApiConfig {
    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.base_url.trim().is_empty() {
            return Err(Error::Config("api.base_url must not be empty".to_string()));
        }
        if self.batch_size == 0 || self.batch_size > 2000 {
            return Err(Error::Config(
                "api.batch_size must be between 1 and 2000".to_string(),
            ));
        }
        if self.max_queue_size == 0 {
            return Err(Error::Config(
                "api.max_queue_size must be at least 1".to_string(),
            ));
        }
        if self.flush_interval_secs == 0 {
            return Err(Error::Config(
                "api.flush_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.backoff_base_secs > self.backoff_max_secs {
            return Err(Error::Config(
                "api.backoff_base_secs must not exceed api.backoff_max_secs".to_string(),
            ));
        }
        Ok(())
    }

    /// Base URL without a trailing slash
    pub fn endpoint_base(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn decide_interval(&self) -> Duration {
        Duration::from_secs(self.decide_interval_secs)
    }
}

/// Tracking defaults applied to every tracker
#[derive(Debug, Deserialize, Clone)]
pub struct TrackingConfig {
    /// New tokens start opted out unless a stored flag says otherwise
    #[serde(default)]
    pub opt_out_default: bool,

    /// Track `$ae_*` automatic events (decide may override)
    #[serde(default = "default_true")]
    pub track_automatic_events: bool,

    /// Show notifications even if their campaign was already seen
    #[serde(default)]
    pub test_mode: bool,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            opt_out_default: false,
            track_automatic_events: true,
            test_mode: false,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Host application description
#[derive(Debug, Deserialize, Clone)]
pub struct DeviceConfig {
    #[serde(default = "default_os")]
    pub os: String,
    #[serde(default = "default_unknown")]
    pub os_version: String,
    pub app_version: Option<String>,
    pub app_version_code: Option<String>,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            os: default_os(),
            os_version: default_unknown(),
            app_version: None,
            app_version_code: None,
            manufacturer: None,
            model: None,
        }
    }
}

fn default_os() -> String {
    std::env::consts::OS.to_string()
}

fn default_unknown() -> String {
    "UNKNOWN".to_string()
}

/// Optional integrations the host declares as present.
///
/// Replaces runtime probing for optional libraries: the host states up front
/// what it ships with.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Capabilities {
    /// Host can receive push registration tokens
    #[serde(default)]
    pub push_notifications: bool,

    /// Host can render in-app notifications fetched from decide
    #[serde(default)]
    pub in_app_notifications: bool,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.api.validate()?;
        Ok(config)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/mmp/config.toml` (~/.config/mmp/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("mmp").join("config.toml")
    }

    /// Returns the data directory path (for the SQLite database)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("mmp")
    }

    /// Returns the state directory path (for logs)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("mmp")
    }

    /// Returns the database file path, honoring `database_path`
    ///
    /// `$XDG_DATA_HOME/mmp/mmp.db` (~/.local/share/mmp/mmp.db)
    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("mmp.db"))
    }

    /// Returns the log file path
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("mmp.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.api.base_url, "https://api.mmp.com");
        assert_eq!(config.api.batch_size, 50);
        assert_eq!(config.api.flush_interval_secs, 60);
        assert!(!config.tracking.opt_out_default);
        assert!(config.tracking.track_automatic_events);
        assert!(config.api.validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[api]
base_url = "http://localhost:9000/"
batch_size = 10
max_queue_size = 3

[tracking]
opt_out_default = true

[capabilities]
push_notifications = true

[logging]
level = "debug"
"#;
        let config: Config = toml::from_str(toml).unwrap();

        assert_eq!(config.api.endpoint_base(), "http://localhost:9000");
        assert_eq!(config.api.batch_size, 10);
        assert_eq!(config.api.max_queue_size, 3);
        // Unspecified fields keep their defaults
        assert_eq!(config.api.timeout_secs, 30);
        assert!(config.tracking.opt_out_default);
        assert!(config.capabilities.push_notifications);
        assert!(!config.capabilities.in_app_notifications);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_device_os_default_matches_partial_table() {
        let config: Config = toml::from_str("[device]\napp_version = \"2.0\"\n").unwrap();
        assert_eq!(config.device.os, DeviceConfig::default().os);
        assert_eq!(config.device.os, std::env::consts::OS);
        assert_eq!(config.device.app_version.as_deref(), Some("2.0"));
    }

    #[test]
    fn test_api_config_validation() {
        let config = ApiConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ApiConfig {
            base_url: "  ".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ApiConfig {
            backoff_base_secs: 900,
            backoff_max_secs: 600,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[api]\nbatch_size = 5000\n").unwrap();
        assert!(Config::load_from(&path).is_err());

        std::fs::write(&path, "[api]\nbatch_size = 5\n").unwrap();
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.api.batch_size, 5);
    }

    #[test]
    fn test_database_path_override() {
        let config = Config {
            database_path: Some(PathBuf::from("/tmp/custom.db")),
            ..Default::default()
        };
        assert_eq!(config.database_path(), PathBuf::from("/tmp/custom.db"));
        assert!(Config::default().database_path().ends_with("mmp.db"));
    }
}
