// crates/backfill-config/src/config.rs
// ============================================================================
// Module: Backfill Configuration
// Description: backfill.toml model, loading guards, and validation.
// Purpose: Turn operator configuration into validated runtime settings.
// Dependencies: backfill-core, backfill-store-sqlite, serde, thiserror, toml
// ============================================================================

//! ## Overview
//! [`BackfillConfig::load`] resolves the config path (explicit argument, then
//! `BACKFILL_CONFIG`, then `./backfill.toml`), enforces path, size, and UTF-8
//! limits, parses TOML, and validates every section. Any violation fails
//! closed with [`ConfigError`]; nothing is defaulted around a bad value.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::env;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use backfill_core::runtime::BatchOptimizerConfig;
use backfill_core::runtime::FailurePolicy;
use backfill_core::runtime::FileEventSink;
use backfill_core::runtime::MigrationEventSink;
use backfill_core::runtime::NoopEventSink;
use backfill_core::runtime::RunnerConfig;
use backfill_core::runtime::StaticToggle;
use backfill_core::runtime::StderrEventSink;
use backfill_core::runtime::WorkerConfig;
use backfill_store_sqlite::SqliteStoreConfig;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default config filename.
pub const DEFAULT_CONFIG_NAME: &str = "backfill.toml";
/// Environment variable override for the config path.
pub const CONFIG_ENV_VAR: &str = "BACKFILL_CONFIG";
/// Maximum allowed config file size in bytes.
pub const MAX_CONFIG_FILE_SIZE: usize = 1024 * 1024;
/// Maximum total path length for config-related paths.
const MAX_TOTAL_PATH_LENGTH: usize = 4096;
/// Maximum length of a single path component.
const MAX_PATH_COMPONENT_LENGTH: usize = 255;
/// Maximum worker name length.
const MAX_WORKER_NAME_LENGTH: usize = 255;
/// Default worker cadence in seconds.
const DEFAULT_CADENCE_SECS: u64 = 60;
/// Default retry limit.
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error.
    #[error("config io error: {0}")]
    Io(String),
    /// Parse error.
    #[error("config parse error: {0}")]
    Parse(String),
    /// Invalid configuration.
    #[error("config invalid: {0}")]
    Invalid(String),
}

// ============================================================================
// SECTION: Root
// ============================================================================

/// Root of `backfill.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackfillConfig {
    /// Migration store and lease database.
    pub store: SqliteStoreConfig,
    /// Database holding the tables being migrated.
    #[serde(default)]
    pub target: Option<TargetConfig>,
    /// Worker settings.
    #[serde(default)]
    pub worker: WorkerSection,
    /// Batch retry settings.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Batch-size optimizer settings.
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    /// Event logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl BackfillConfig {
    /// Loads configuration from disk.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file cannot be read or parsed, or
    /// when validation fails.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let resolved = resolve_path(path)?;
        validate_path(&resolved, "config")?;
        let bytes = fs::read(&resolved).map_err(|err| ConfigError::Io(err.to_string()))?;
        if bytes.len() > MAX_CONFIG_FILE_SIZE {
            return Err(ConfigError::Invalid("config file exceeds size limit".to_string()));
        }
        let content = std::str::from_utf8(&bytes)
            .map_err(|_| ConfigError::Invalid("config file must be utf-8".to_string()))?;
        Self::from_toml(content)
    }

    /// Parses and validates configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when parsing or validation fails.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(content).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates every section.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_path(&self.store.path, "store")?;
        if self.store.busy_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "store busy_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if let Some(target) = &self.target {
            validate_path(&target.path, "target")?;
        }
        self.worker.validate()?;
        self.optimizer.validate()?;
        self.logging.validate()
    }

    /// Builds the worker tuning described by this configuration.
    #[must_use]
    pub fn worker_config(&self) -> WorkerConfig {
        let defaults = WorkerConfig::default();
        WorkerConfig {
            name: self.worker.name.clone(),
            tracking_database: self.worker.tracking_database.clone(),
            feature_flag: defaults.feature_flag,
            minimum_lease_timeout: Duration::from_secs(self.worker.minimum_lease_timeout_secs),
            lease_timeout_multiplier: self.worker.lease_timeout_multiplier,
            interval_variance: Duration::from_secs(self.worker.interval_variance_secs),
            runner: self.runner_config(),
        }
    }

    /// Builds the runner tuning described by this configuration.
    #[must_use]
    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            failure_policy: self.retry.failure_policy(),
            optimizer: self.optimizer.enabled.then_some(self.optimizer.tuning),
        }
    }

    /// Returns the feature toggle answering the scheduled-execution flag.
    #[must_use]
    pub const fn feature_toggle(&self) -> StaticToggle {
        StaticToggle(self.worker.enabled)
    }

    /// Returns the delay between ticks of the cadence loop.
    #[must_use]
    pub const fn cadence(&self) -> Duration {
        Duration::from_secs(self.worker.cadence_secs)
    }

    /// Opens the configured event sink.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] when the log file cannot be opened.
    pub fn event_sink(&self) -> Result<Arc<dyn MigrationEventSink>, ConfigError> {
        let sink: Arc<dyn MigrationEventSink> = match self.logging.sink {
            LogSink::Stderr => Arc::new(StderrEventSink),
            LogSink::None => Arc::new(NoopEventSink),
            LogSink::File => {
                let path = self.logging.path.as_ref().ok_or_else(|| {
                    ConfigError::Invalid("logging sink file requires path".to_string())
                })?;
                Arc::new(FileEventSink::new(path).map_err(|err| ConfigError::Io(err.to_string()))?)
            }
        };
        Ok(sink)
    }
}

// ============================================================================
// SECTION: Sections
// ============================================================================

/// Target database configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    /// Path of the `SQLite` database holding target tables.
    pub path: PathBuf,
}

/// Worker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct WorkerSection {
    /// Worker name; also the lease key.
    pub name: String,
    /// Tracking database label used in logs.
    pub tracking_database: String,
    /// Whether scheduled execution is enabled.
    pub enabled: bool,
    /// Lease timeout floor in seconds.
    pub minimum_lease_timeout_secs: u64,
    /// Multiplier applied to a migration interval for the lease timeout.
    pub lease_timeout_multiplier: u32,
    /// Maximum interval jitter in seconds.
    pub interval_variance_secs: u64,
    /// Seconds between ticks of `worker run`.
    pub cadence_secs: u64,
}

impl Default for WorkerSection {
    fn default() -> Self {
        let defaults = WorkerConfig::default();
        Self {
            name: defaults.name,
            tracking_database: defaults.tracking_database,
            enabled: true,
            minimum_lease_timeout_secs: defaults.minimum_lease_timeout.as_secs(),
            lease_timeout_multiplier: defaults.lease_timeout_multiplier,
            interval_variance_secs: defaults.interval_variance.as_secs(),
            cadence_secs: DEFAULT_CADENCE_SECS,
        }
    }
}

impl WorkerSection {
    /// Validates worker settings.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("worker name must be non-empty".to_string()));
        }
        if self.name.len() > MAX_WORKER_NAME_LENGTH {
            return Err(ConfigError::Invalid("worker name exceeds max length".to_string()));
        }
        if self.tracking_database.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "worker tracking_database must be non-empty".to_string(),
            ));
        }
        if self.minimum_lease_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "worker minimum_lease_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.lease_timeout_multiplier == 0 {
            return Err(ConfigError::Invalid(
                "worker lease_timeout_multiplier must be greater than zero".to_string(),
            ));
        }
        if self.cadence_secs == 0 {
            return Err(ConfigError::Invalid(
                "worker cadence_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Retry configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Attempts before a migration is marked failed; omitted or 0 is unlimited.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: Some(DEFAULT_MAX_ATTEMPTS),
        }
    }
}

impl RetryConfig {
    /// Returns the runner failure policy.
    #[must_use]
    pub const fn failure_policy(&self) -> FailurePolicy {
        match self.max_attempts {
            Some(0) | None => FailurePolicy::unlimited(),
            Some(max) => FailurePolicy {
                max_attempts: Some(max),
            },
        }
    }
}

/// Batch-size optimizer configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Whether batch sizes are tuned after successful batches.
    #[serde(default)]
    pub enabled: bool,
    /// Optimizer tuning.
    #[serde(flatten)]
    pub tuning: BatchOptimizerConfig,
}

impl OptimizerConfig {
    /// Validates optimizer tuning.
    fn validate(&self) -> Result<(), ConfigError> {
        self.tuning.validate().map_err(|err| ConfigError::Invalid(format!("optimizer {err}")))
    }
}

/// Event sink selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSink {
    /// JSON lines on stderr.
    #[default]
    Stderr,
    /// JSON lines appended to `path`.
    File,
    /// Discard events.
    None,
}

/// Logging configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Sink receiving migration events.
    #[serde(default)]
    pub sink: LogSink,
    /// Log file path for the file sink.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl LoggingConfig {
    /// Validates logging settings.
    fn validate(&self) -> Result<(), ConfigError> {
        match (&self.sink, &self.path) {
            (LogSink::File, None) => {
                Err(ConfigError::Invalid("logging sink file requires path".to_string()))
            }
            (LogSink::File, Some(path)) => validate_path(path, "logging"),
            (LogSink::Stderr | LogSink::None, Some(_)) => Err(ConfigError::Invalid(
                "logging path is only valid with sink file".to_string(),
            )),
            (LogSink::Stderr | LogSink::None, None) => Ok(()),
        }
    }
}

// ============================================================================
// SECTION: Paths
// ============================================================================

/// Resolves the config path from explicit input or environment.
fn resolve_path(path: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = path {
        return Ok(path.to_path_buf());
    }
    if let Ok(env_path) = env::var(CONFIG_ENV_VAR) {
        if env_path.len() > MAX_TOTAL_PATH_LENGTH {
            return Err(ConfigError::Invalid("config path exceeds max length".to_string()));
        }
        return Ok(PathBuf::from(env_path));
    }
    Ok(PathBuf::from(DEFAULT_CONFIG_NAME))
}

/// Validates path length and components for `label`.
fn validate_path(path: &Path, label: &str) -> Result<(), ConfigError> {
    if path.as_os_str().is_empty() {
        return Err(ConfigError::Invalid(format!("{label} path must not be empty")));
    }
    let text = path.to_string_lossy();
    if text.len() > MAX_TOTAL_PATH_LENGTH {
        return Err(ConfigError::Invalid(format!("{label} path exceeds max length")));
    }
    for component in path.components() {
        let value = component.as_os_str().to_string_lossy();
        if value.len() > MAX_PATH_COMPONENT_LENGTH {
            return Err(ConfigError::Invalid(format!("{label} path component too long")));
        }
    }
    Ok(())
}
