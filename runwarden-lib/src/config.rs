//! Layered runwarden configuration: storage, baseline locking, flush cadence,
//! alert limits and logging.
//!
//! Sources, highest precedence first:
//! 1. Command-line flags (applied by the binary)
//! 2. Environment variables (`RUNWARDEN_AGENT_*`, nested keys split on `__`)
//! 3. User configuration file (~/.config/runwarden/config.toml)
//! 4. System configuration file (/etc/runwarden/config.toml)
//! 5. Embedded defaults
//!
//! Configuration is read once at process start and handed to the composition
//! root; nothing in the crate reads it lazily.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::models::{LockMode, MAX_PROCESS_VIOLATIONS_PER_ALERT};
use crate::rate_limiter::RateLimitConfig;

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration format: {0}")]
    InvalidFormat(#[from] Box<figment::Error>),

    #[error("IO error reading configuration: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration validation failed: {message}")]
    ValidationError { message: String },
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::InvalidFormat(Box::new(err))
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Config {
    /// Persistence configuration
    pub database: DatabaseConfig,
    /// Process baseline configuration
    pub baseline: BaselineConfig,
    /// Indicator flush pipeline configuration
    pub pipeline: PipelineConfig,
    /// Alert store and reconciliation configuration
    pub alerts: AlertsConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DatabaseConfig {
    /// Database file path; in-memory storage is used when unset
    pub path: Option<PathBuf>,
    /// Reject every write with a permission error
    pub read_only: bool,
}

/// Process baseline configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BaselineConfig {
    /// How long after creation a baseline locks itself, in seconds
    pub auto_lock_duration_secs: u64,
    /// Lock mode consulted when deciding whether activity is alert-worthy
    pub violation_lock_mode: LockMode,
}

/// Indicator flush pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Minimum spacing between rate-limited immediate flushes, in milliseconds
    pub flush_rate_limit_interval_ms: u64,
    /// Immediate flushes admitted in a burst
    pub flush_burst: usize,
    /// Periodic flush cadence, in milliseconds
    pub periodic_flush_interval_ms: u64,
}

/// Alert store and reconciliation configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AlertsConfig {
    /// Cap on process references kept per alert
    pub max_process_violations_per_alert: usize,
    /// Cap on alerts returned by one paginated list call
    pub max_alerts_per_list: usize,
    /// Concurrent tasks used by batched alert writes
    pub fan_out_concurrency: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (json, human)
    pub format: String,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            auto_lock_duration_secs: 3600,
            violation_lock_mode: LockMode::UserLocked,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            flush_rate_limit_interval_ms: 10_000,
            flush_burst: 5,
            periodic_flush_interval_ms: 60_000,
        }
    }
}

impl Default for AlertsConfig {
    /// Creates the default `AlertsConfig`.
    ///
    /// # Examples
    ///
    /// ```
    /// use runwarden_lib::config::AlertsConfig;
    /// let cfg = AlertsConfig::default();
    /// assert_eq!(cfg.max_process_violations_per_alert, 40);
    /// assert_eq!(cfg.max_alerts_per_list, 1000);
    /// ```
    fn default() -> Self {
        Self {
            max_process_violations_per_alert: MAX_PROCESS_VIOLATIONS_PER_ALERT,
            max_alerts_per_list: 1000,
            fan_out_concurrency: 16,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: "human".to_owned(),
        }
    }
}

impl BaselineConfig {
    pub fn auto_lock_duration(&self) -> Duration {
        Duration::from_secs(self.auto_lock_duration_secs)
    }
}

impl PipelineConfig {
    pub fn periodic_flush_interval(&self) -> Duration {
        Duration::from_millis(self.periodic_flush_interval_ms)
    }

    pub fn rate_limit(&self) -> RateLimitConfig {
        RateLimitConfig::every(
            Duration::from_millis(self.flush_rate_limit_interval_ms),
            self.flush_burst,
        )
    }
}

/// Configuration loader with hierarchical override support.
pub struct ConfigLoader {
    component: String,
}

impl ConfigLoader {
    /// Create a new configuration loader for the specified component.
    pub fn new(component: &str) -> Self {
        Self {
            component: component.to_owned(),
        }
    }

    /// Load configuration with hierarchical overrides using figment.
    pub fn load(&self) -> Result<Config, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        let system_config_path = "/etc/runwarden/config.toml";
        if std::path::Path::new(system_config_path).exists() {
            figment = figment.merge(Toml::file(system_config_path));
        }

        let user_config_path = Self::user_config_path();
        if user_config_path.exists() {
            figment = figment.merge(Toml::file(&user_config_path));
        }

        let config = figment.merge(self.env_provider()).extract()?;
        Self::validate_config(&config)?;
        Ok(config)
    }

    /// Environment variables with component prefix.
    fn env_provider(&self) -> Env {
        Env::prefixed(&format!(
            "{}_",
            self.component.replace('-', "_").to_uppercase()
        ))
        .split("__")
    }

    /// Load configuration from one explicit TOML file layered over the
    /// defaults, with environment overrides applied on top.
    pub fn load_file(&self, path: &std::path::Path) -> Result<Config, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        let config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(self.env_provider())
            .extract()?;
        Self::validate_config(&config)?;
        Ok(config)
    }

    /// Get the user configuration file path using platform-aware directory lookup.
    fn user_config_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            return config_dir.join("runwarden").join("config.toml");
        }

        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join(".config")
                .join("runwarden")
                .join("config.toml");
        }

        PathBuf::from("/tmp")
            .join(".config")
            .join("runwarden")
            .join("config.toml")
    }

    /// Validate the final configuration.
    pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
        let checks = [
            (
                config.pipeline.flush_burst == 0,
                "pipeline.flush_burst must be greater than 0",
            ),
            (
                config.pipeline.periodic_flush_interval_ms == 0,
                "pipeline.periodic_flush_interval_ms must be greater than 0",
            ),
            (
                config.alerts.max_process_violations_per_alert == 0,
                "alerts.max_process_violations_per_alert must be greater than 0",
            ),
            (
                config.alerts.max_alerts_per_list == 0,
                "alerts.max_alerts_per_list must be greater than 0",
            ),
            (
                config.alerts.fan_out_concurrency == 0,
                "alerts.fan_out_concurrency must be greater than 0",
            ),
        ];

        if let Some((_, message)) = checks.iter().find(|(failed, _)| *failed) {
            return Err(ConfigError::ValidationError {
                message: (*message).to_owned(),
            });
        }

        if !matches!(config.logging.format.as_str(), "json" | "human") {
            return Err(ConfigError::ValidationError {
                message: format!(
                    "logging.format must be 'json' or 'human', got '{}'",
                    config.logging.format
                ),
            });
        }

        Ok(())
    }
}
