// crates/replica-judge-config/src/config.rs
// ============================================================================
// Module: Replica Judge Configuration
// Description: Configuration loading and validation for the evaluator.
// Purpose: Provide strict, fail-closed config parsing with hard limits.
// Dependencies: replica-judge-core, replica-judge-store-sqlite, serde, toml
// ============================================================================

//! ## Overview
//! Configuration is loaded from a TOML file with strict size and path limits.
//! Missing or invalid configuration fails closed; unknown keys are rejected
//! so a misspelled knob never silently falls back to its default.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::env;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use replica_judge_core::DeficitPolicy;
use replica_judge_core::EvaluatorConfig;
use replica_judge_core::RetryPolicy;
use replica_judge_core::WorkerId;
use replica_judge_store_sqlite::SqliteStoreConfig;
use replica_judge_store_sqlite::SqliteStoreMode;
use replica_judge_store_sqlite::SqliteSyncMode;
use serde::Deserialize;
use thiserror::Error;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default configuration filename when no path is specified.
const DEFAULT_CONFIG_NAME: &str = "replica-judge.toml";
/// Environment variable used to override the config path.
pub const CONFIG_ENV_VAR: &str = "REPLICA_JUDGE_CONFIG";
/// Maximum configuration file size in bytes.
pub const MAX_CONFIG_FILE_SIZE: usize = 1024 * 1024;
/// Maximum length of a single path component.
const MAX_PATH_COMPONENT_LENGTH: usize = 255;
/// Maximum total path length.
const MAX_TOTAL_PATH_LENGTH: usize = 4096;
/// Upper bound for the per-pass identifier limit.
pub const MAX_DID_LIMIT: usize = 100_000;
/// Upper bound for the per-pass sweep limit.
pub const MAX_SWEEP_LIMIT: usize = 10_000;
/// Upper bound for transient retries.
const MAX_RETRIES: u32 = 10;
/// Upper bound for the loop poll interval.
const MAX_POLL_INTERVAL_MS: u64 = 3_600_000;
/// Lower bound for the claim lease.
const MIN_CLAIM_LEASE_MS: u64 = 1_000;
/// Maximum worker label length.
const MAX_WORKER_LENGTH: usize = 128;
/// Default worker label.
const DEFAULT_WORKER: &str = "judge";

// ============================================================================
// SECTION: Config Model
// ============================================================================

/// Top-level Replica Judge configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JudgeConfig {
    /// Evaluator tuning.
    #[serde(default)]
    pub evaluator: EvaluatorSection,
    /// Backlog, rule, and lock persistence.
    #[serde(default)]
    pub store: StoreConfig,
    /// Collaborator snapshot.
    #[serde(default)]
    pub inventory: InventoryConfig,
    /// Structured event output.
    #[serde(default)]
    pub events: EventsConfig,
}

impl JudgeConfig {
    /// Loads configuration from disk using the default resolution rules.
    ///
    /// Resolution order: `path`, then [`CONFIG_ENV_VAR`], then
    /// `replica-judge.toml` in the working directory.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when loading or validation fails.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let resolved = resolve_path(path)?;
        validate_path(&resolved)?;
        let bytes = fs::read(&resolved).map_err(|err| ConfigError::Io(err.to_string()))?;
        if bytes.len() > MAX_CONFIG_FILE_SIZE {
            return Err(ConfigError::Invalid("config file exceeds size limit".to_string()));
        }
        let content = std::str::from_utf8(&bytes)
            .map_err(|_| ConfigError::Invalid("config file must be utf-8".to_string()))?;
        Self::from_toml(content)
    }

    /// Parses and validates configuration text.
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

    /// Validates the configuration for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.evaluator.validate()?;
        self.store.validate()?;
        self.inventory.validate()?;
        self.events.validate()
    }
}

/// `[evaluator]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EvaluatorSection {
    /// Maximum distinct identifiers claimed per pass.
    #[serde(default = "default_did_limit")]
    pub did_limit: usize,
    /// Maximum `INJECT`/`STUCK` rules re-evaluated per pass.
    #[serde(default = "default_sweep_limit")]
    pub sweep_limit: usize,
    /// Sleep between passes in loop mode.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Bounded retries for transient contention.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Initial retry backoff, doubled per attempt.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Backoff ceiling.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Age after which claims are reclaimable by any worker.
    #[serde(default = "default_claim_lease_ms")]
    pub claim_lease_ms: u64,
    /// Behavior when fewer resources qualify than a unit needs.
    #[serde(default)]
    pub deficit_policy: DeficitPolicy,
    /// Optional deterministic selection seed.
    #[serde(default)]
    pub selection_seed: Option<u64>,
    /// Optional worker label.
    #[serde(default)]
    pub worker: Option<String>,
}

impl Default for EvaluatorSection {
    fn default() -> Self {
        Self {
            did_limit: default_did_limit(),
            sweep_limit: default_sweep_limit(),
            poll_interval_ms: default_poll_interval_ms(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            claim_lease_ms: default_claim_lease_ms(),
            deficit_policy: DeficitPolicy::default(),
            selection_seed: None,
            worker: None,
        }
    }
}

impl EvaluatorSection {
    /// Validates evaluator tuning bounds.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.did_limit == 0 || self.did_limit > MAX_DID_LIMIT {
            return Err(ConfigError::Invalid(format!(
                "evaluator.did_limit must be between 1 and {MAX_DID_LIMIT}"
            )));
        }
        if self.sweep_limit == 0 || self.sweep_limit > MAX_SWEEP_LIMIT {
            return Err(ConfigError::Invalid(format!(
                "evaluator.sweep_limit must be between 1 and {MAX_SWEEP_LIMIT}"
            )));
        }
        if self.poll_interval_ms > MAX_POLL_INTERVAL_MS {
            return Err(ConfigError::Invalid(
                "evaluator.poll_interval_ms exceeds one hour".to_string(),
            ));
        }
        if self.max_retries > MAX_RETRIES {
            return Err(ConfigError::Invalid(format!(
                "evaluator.max_retries must be at most {MAX_RETRIES}"
            )));
        }
        if self.retry_backoff_ms == 0 || self.retry_backoff_ms > self.max_backoff_ms {
            return Err(ConfigError::Invalid(
                "evaluator.retry_backoff_ms must be positive and at most max_backoff_ms"
                    .to_string(),
            ));
        }
        if self.claim_lease_ms < MIN_CLAIM_LEASE_MS {
            return Err(ConfigError::Invalid(format!(
                "evaluator.claim_lease_ms must be at least {MIN_CLAIM_LEASE_MS}"
            )));
        }
        if let Some(worker) = &self.worker {
            let trimmed = worker.trim();
            if trimmed.is_empty() || trimmed.len() > MAX_WORKER_LENGTH {
                return Err(ConfigError::Invalid(format!(
                    "evaluator.worker must be 1..={MAX_WORKER_LENGTH} characters"
                )));
            }
        }
        Ok(())
    }

    /// Converts the section into evaluator configuration.
    #[must_use]
    pub fn to_evaluator_config(&self) -> EvaluatorConfig {
        EvaluatorConfig {
            did_limit: self.did_limit,
            sweep_limit: self.sweep_limit,
            retry: RetryPolicy {
                max_retries: self.max_retries,
                initial_backoff: Duration::from_millis(self.retry_backoff_ms),
                max_backoff: Duration::from_millis(self.max_backoff_ms),
            },
            claim_lease: Duration::from_millis(self.claim_lease_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            deficit_policy: self.deficit_policy,
            selection_seed: self.selection_seed,
            worker: WorkerId::new(self.worker.as_deref().map_or(DEFAULT_WORKER, str::trim)),
        }
    }
}

/// `[store]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// Store backend type.
    #[serde(rename = "type", default)]
    pub store_type: StoreType,
    /// `SQLite` database path when using the sqlite backend.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Busy timeout in milliseconds.
    #[serde(default = "default_store_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// `SQLite` journal mode.
    #[serde(default)]
    pub journal_mode: SqliteStoreMode,
    /// `SQLite` synchronous mode.
    #[serde(default)]
    pub sync_mode: SqliteSyncMode,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            store_type: StoreType::default(),
            path: None,
            busy_timeout_ms: default_store_busy_timeout_ms(),
            journal_mode: SqliteStoreMode::default(),
            sync_mode: SqliteSyncMode::default(),
        }
    }
}

impl StoreConfig {
    /// Validates store configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        match self.store_type {
            StoreType::Memory => {
                if self.path.is_some() {
                    return Err(ConfigError::Invalid("memory store must not set path".to_string()));
                }
                Ok(())
            }
            StoreType::Sqlite => {
                let path = self
                    .path
                    .as_ref()
                    .ok_or_else(|| ConfigError::Invalid("sqlite store requires path".to_string()))?;
                validate_path_string("store.path", &path.to_string_lossy())
            }
        }
    }

    /// Returns the `SQLite` store configuration, if the sqlite backend is
    /// selected.
    #[must_use]
    pub fn sqlite_config(&self) -> Option<SqliteStoreConfig> {
        match self.store_type {
            StoreType::Memory => None,
            StoreType::Sqlite => self.path.as_ref().map(|path| SqliteStoreConfig {
                path: path.clone(),
                busy_timeout_ms: self.busy_timeout_ms,
                journal_mode: self.journal_mode,
                sync_mode: self.sync_mode,
            }),
        }
    }
}

/// Store backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreType {
    /// Process-local in-memory store; state is lost on exit.
    #[default]
    Memory,
    /// `SQLite`-backed durable store shared by workers.
    Sqlite,
}

/// `[inventory]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InventoryConfig {
    /// JSON snapshot of identifiers, replicas, resources, and quotas.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl InventoryConfig {
    /// Validates the snapshot path when set.
    fn validate(&self) -> Result<(), ConfigError> {
        match &self.path {
            Some(path) => validate_path_string("inventory.path", &path.to_string_lossy()),
            None => Ok(()),
        }
    }
}

/// `[events]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventsConfig {
    /// Event sink selection.
    #[serde(default)]
    pub sink: EventSinkKind,
    /// Output file for the file sink.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl EventsConfig {
    /// Validates sink and path consistency.
    fn validate(&self) -> Result<(), ConfigError> {
        match (self.sink, &self.path) {
            (EventSinkKind::File, Some(path)) => {
                validate_path_string("events.path", &path.to_string_lossy())
            }
            (EventSinkKind::File, None) => {
                Err(ConfigError::Invalid("file event sink requires events.path".to_string()))
            }
            (_, Some(_)) => Err(ConfigError::Invalid(
                "events.path is only valid with the file sink".to_string(),
            )),
            (_, None) => Ok(()),
        }
    }
}

/// Event sink selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EventSinkKind {
    /// Discard events.
    None,
    /// JSON lines on stderr.
    #[default]
    Stderr,
    /// JSON lines appended to `events.path`.
    File,
}

// ============================================================================
// SECTION: Defaults
// ============================================================================

/// Default per-pass identifier bound.
const fn default_did_limit() -> usize {
    1000
}

/// Default per-pass sweep bound.
const fn default_sweep_limit() -> usize {
    100
}

/// Default loop poll interval.
const fn default_poll_interval_ms() -> u64 {
    10_000
}

/// Default transient retry count.
const fn default_max_retries() -> u32 {
    3
}

/// Default initial retry backoff.
const fn default_retry_backoff_ms() -> u64 {
    50
}

/// Default retry backoff ceiling.
const fn default_max_backoff_ms() -> u64 {
    2_000
}

/// Default claim lease.
const fn default_claim_lease_ms() -> u64 {
    600_000
}

/// Default `SQLite` busy timeout.
const fn default_store_busy_timeout_ms() -> u64 {
    5_000
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Configuration loading or validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O failure while reading configuration.
    #[error("config io error: {0}")]
    Io(String),
    /// TOML parsing error.
    #[error("config parse error: {0}")]
    Parse(String),
    /// Invalid configuration data.
    #[error("invalid config: {0}")]
    Invalid(String),
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Resolves the config path from CLI or environment defaults.
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

/// Validates the resolved path against security limits.
fn validate_path(path: &Path) -> Result<(), ConfigError> {
    let text = path.to_string_lossy();
    if text.len() > MAX_TOTAL_PATH_LENGTH {
        return Err(ConfigError::Invalid("config path exceeds max length".to_string()));
    }
    for component in path.components() {
        let value = component.as_os_str().to_string_lossy();
        if value.len() > MAX_PATH_COMPONENT_LENGTH {
            return Err(ConfigError::Invalid("config path component too long".to_string()));
        }
    }
    Ok(())
}

/// Validates a path string against length constraints.
fn validate_path_string(field: &str, value: &str) -> Result<(), ConfigError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::Invalid(format!("{field} must be non-empty")));
    }
    if trimmed.len() > MAX_TOTAL_PATH_LENGTH {
        return Err(ConfigError::Invalid(format!("{field} exceeds max length")));
    }
    for component in Path::new(trimmed).components() {
        if component.as_os_str().to_string_lossy().len() > MAX_PATH_COMPONENT_LENGTH {
            return Err(ConfigError::Invalid(format!("{field} path component too long")));
        }
    }
    Ok(())
}
