//! Configuration module for rostersync.
//!
//! Provides typed configuration structs that map to the YAML configuration file,
//! with loading, validation, defaults, and a builder pattern for programmatic use.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for rostersync.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sync: SyncConfig,
    pub storage: StorageConfig,
    pub notification: NotificationConfig,
    pub logging: LoggingConfig,
}

/// Synchronization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Contact the remote membership service during bootstrap.
    pub auto_sync: bool,
    /// Automatic bootstrap restarts before a recoverable fault becomes terminal.
    pub max_recovery_attempts: u32,
    /// Seconds between address-book refreshes after sign-in.
    pub refresh_interval_secs: u64,
}

/// Durable storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the SQLite database holding the roster documents.
    pub database: PathBuf,
}

/// Event and notification-channel buffers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Capacity of the roster event broadcast channel.
    pub event_capacity: usize,
    /// Capacity of the inbound server reply queue.
    pub reply_buffer: usize,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
    /// Optional log file; stderr when absent.
    pub file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Config::load()
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/rostersync/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("rostersync")
            .join("config.yaml")
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            auto_sync: true,
            max_recovery_attempts: 3,
            refresh_interval_secs: 300,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("~/.local/share"))
            .join("rostersync");
        Self {
            database: data_dir.join("roster.db"),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            event_capacity: 256,
            reply_buffer: 64,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Config::validate()
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"sync.refresh_interval_secs"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Upper bound for `sync.max_recovery_attempts`.
const MAX_RECOVERY_ATTEMPTS: u32 = 10;

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        // --- sync ---
        if self.sync.max_recovery_attempts == 0
            || self.sync.max_recovery_attempts > MAX_RECOVERY_ATTEMPTS
        {
            errors.push(ValidationError {
                field: "sync.max_recovery_attempts".into(),
                message: format!("must be in range 1..={MAX_RECOVERY_ATTEMPTS}"),
            });
        }
        if self.sync.refresh_interval_secs == 0 {
            errors.push(ValidationError {
                field: "sync.refresh_interval_secs".into(),
                message: "must be greater than 0".into(),
            });
        }

        // --- storage ---
        if self.storage.database.as_os_str().is_empty() {
            errors.push(ValidationError {
                field: "storage.database".into(),
                message: "must not be empty".into(),
            });
        }

        // --- notification ---
        if self.notification.event_capacity == 0 {
            errors.push(ValidationError {
                field: "notification.event_capacity".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.notification.reply_buffer == 0 {
            errors.push(ValidationError {
                field: "notification.reply_buffer".into(),
                message: "must be greater than 0".into(),
            });
        }

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError {
                field: "logging.level".into(),
                message: format!(
                    "invalid level '{}'; valid options: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            });
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// ConfigBuilder
// ---------------------------------------------------------------------------

/// Builder for constructing a [`Config`] programmatically.
///
/// Starts from [`Config::default`] and allows selective overrides.
///
/// # Example
///
/// ```rust,no_run
/// use rostersync_core::config::ConfigBuilder;
///
/// let config = ConfigBuilder::new()
///     .sync_auto_sync(false)
///     .sync_max_recovery_attempts(2)
///     .logging_level("debug")
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder initialised with [`Config::default`] values.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    // --- sync ---

    pub fn sync_auto_sync(mut self, enabled: bool) -> Self {
        self.config.sync.auto_sync = enabled;
        self
    }

    pub fn sync_max_recovery_attempts(mut self, attempts: u32) -> Self {
        self.config.sync.max_recovery_attempts = attempts;
        self
    }

    pub fn sync_refresh_interval_secs(mut self, seconds: u64) -> Self {
        self.config.sync.refresh_interval_secs = seconds;
        self
    }

    // --- storage ---

    pub fn storage_database(mut self, path: PathBuf) -> Self {
        self.config.storage.database = path;
        self
    }

    // --- notification ---

    pub fn notification_event_capacity(mut self, capacity: usize) -> Self {
        self.config.notification.event_capacity = capacity;
        self
    }

    pub fn notification_reply_buffer(mut self, capacity: usize) -> Self {
        self.config.notification.reply_buffer = capacity;
        self
    }

    // --- logging ---

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn logging_file(mut self, file: PathBuf) -> Self {
        self.config.logging.file = Some(file);
        self
    }

    // --- build ---

    /// Consume the builder and return the finished [`Config`].
    pub fn build(self) -> Config {
        self.config
    }

    /// Build and validate in one step. Returns `Err` with the list of
    /// validation errors if the configuration is invalid.
    pub fn build_validated(self) -> Result<Config, Vec<ValidationError>> {
        let config = self.build();
        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(errors)
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
