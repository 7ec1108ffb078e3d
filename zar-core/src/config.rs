//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/zar/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/zar/` (~/.config/zar/)
//! - Data: `$XDG_DATA_HOME/zar/` (~/.local/share/zar/)
//! - State/Logs: `$XDG_STATE_HOME/zar/` (~/.local/state/zar/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

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
    /// Backend API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Number pool renewal policy
    #[serde(default)]
    pub pool: PoolPolicy,

    /// Identity expiry policy
    #[serde(default)]
    pub identity: IdentityPolicy,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Backend API configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    /// Base URL of the zar API (e.g., `https://example.com/api/v2`)
    pub base_url: Option<String>,

    /// HTTP request timeout in seconds
    #[serde(default = "default_api_timeout")]
    pub timeout_secs: u64,

    /// Attempts made for a page event before giving up
    #[serde(default = "default_page_max_tries")]
    pub page_max_tries: u32,

    /// Pause between page event attempts
    #[serde(default = "default_page_retry_delay")]
    pub page_retry_delay_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_secs: default_api_timeout(),
            page_max_tries: default_page_max_tries(),
            page_retry_delay_ms: default_page_retry_delay(),
        }
    }
}

impl ApiConfig {
    /// Returns the base URL without a trailing slash.
    pub fn base_url(&self) -> Result<String> {
        self.base_url
            .as_deref()
            .map(|url| url.trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty())
            .ok_or_else(|| Error::Config("api.base_url is required".to_string()))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn page_retry_delay(&self) -> Duration {
        Duration::from_millis(self.page_retry_delay_ms)
    }
}

fn default_api_timeout() -> u64 {
    10
}

fn default_page_max_tries() -> u32 {
    3
}

fn default_page_retry_delay() -> u64 {
    1000
}

/// Which failures count toward the renewal circuit breaker
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailureScope {
    /// One counter shared by every pool; tripping stops all pools
    #[default]
    Global,
    /// One counter per pool; tripping stops only that pool
    PerPool,
}

/// Number pool renewal policy
#[derive(Debug, Deserialize, Clone)]
pub struct PoolPolicy {
    /// Period between scheduled renewals
    #[serde(default = "default_renewal_interval")]
    pub renewal_interval_ms: u64,

    /// Renewals closer together than this are skipped
    #[serde(default = "default_min_renewal_gap")]
    pub min_renewal_gap_ms: u64,

    /// Consecutive failures before the circuit breaker trips
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,

    /// Scope of the failure counter
    #[serde(default)]
    pub failure_scope: FailureScope,
}

impl Default for PoolPolicy {
    fn default() -> Self {
        Self {
            renewal_interval_ms: default_renewal_interval(),
            min_renewal_gap_ms: default_min_renewal_gap(),
            max_failures: default_max_failures(),
            failure_scope: FailureScope::default(),
        }
    }
}

impl PoolPolicy {
    pub fn renewal_interval(&self) -> Duration {
        Duration::from_millis(self.renewal_interval_ms)
    }

    pub fn min_renewal_gap(&self) -> Duration {
        Duration::from_millis(self.min_renewal_gap_ms)
    }

    /// Validate the policy, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.renewal_interval_ms == 0 {
            return Err(Error::Config(
                "pool.renewal_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_failures == 0 {
            return Err(Error::Config(
                "pool.max_failures must be greater than zero".to_string(),
            ));
        }
        if self.renewal_interval_ms < self.min_renewal_gap_ms {
            return Err(Error::Config(
                "pool.renewal_interval_ms must not be shorter than pool.min_renewal_gap_ms"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

fn default_renewal_interval() -> u64 {
    30 * 1000
}

fn default_min_renewal_gap() -> u64 {
    10 * 1000
}

fn default_max_failures() -> u32 {
    3
}

/// Identity expiry policy
///
/// TTLs are measured from the last access of a record. An absent key takes
/// the default TTL; `0` means the identifier never expires on its own.
#[derive(Debug, Deserialize, Clone)]
pub struct IdentityPolicy {
    #[serde(default = "default_vid_ttl")]
    pub vid_ttl_secs: Option<u64>,

    #[serde(default = "default_sid_ttl")]
    pub sid_ttl_secs: Option<u64>,

    #[serde(default = "default_cid_ttl")]
    pub cid_ttl_secs: Option<u64>,
}

impl Default for IdentityPolicy {
    fn default() -> Self {
        Self {
            vid_ttl_secs: default_vid_ttl(),
            sid_ttl_secs: default_sid_ttl(),
            cid_ttl_secs: default_cid_ttl(),
        }
    }
}

impl IdentityPolicy {
    /// Policy with no expiry for any kind
    pub fn no_expiry() -> Self {
        Self {
            vid_ttl_secs: None,
            sid_ttl_secs: None,
            cid_ttl_secs: None,
        }
    }
}

fn default_vid_ttl() -> Option<u64> {
    Some(30 * 60)
}

fn default_sid_ttl() -> Option<u64> {
    Some(7 * 24 * 60 * 60)
}

fn default_cid_ttl() -> Option<u64> {
    Some(2 * 365 * 24 * 60 * 60)
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
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate every section that carries constraints
    pub fn validate(&self) -> Result<()> {
        self.pool.validate()?;
        if self.api.page_max_tries == 0 {
            return Err(Error::Config(
                "api.page_max_tries must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/zar/config.toml` (~/.config/zar/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("zar").join("config.toml")
    }

    /// Returns the data directory path (for the identity database)
    ///
    /// `$XDG_DATA_HOME/zar/` (~/.local/share/zar/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("zar")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/zar/` (~/.local/state/zar/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("zar")
    }

    /// Returns the identity database file path
    ///
    /// `$XDG_DATA_HOME/zar/identity.db` (~/.local/share/zar/identity.db)
    pub fn identity_db_path() -> PathBuf {
        Self::data_dir().join("identity.db")
    }
}
