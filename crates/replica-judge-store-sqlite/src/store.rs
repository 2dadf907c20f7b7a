// crates/replica-judge-store-sqlite/src/store.rs
// ============================================================================
// Module: SQLite Judge Store
// Description: Change backlog, rule store, and lock store backed by SQLite WAL.
// Purpose: Persist evaluator state so multiple workers can share it.
// Dependencies: replica-judge-core, rusqlite, serde, serde_json, thiserror
// ============================================================================

//! ## Overview
//! One database holds the backlog, rules with their roots, file locks,
//! dataset locks, and the account counter updates recorded with each lock
//! batch. Claims and batches run in immediate transactions; a busy database
//! surfaces as contention so callers back off and retry.
//! Security posture: database contents are untrusted and decoded fail-closed.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeSet;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use replica_judge_core::AccountCounterDelta;
use replica_judge_core::AccountId;
use replica_judge_core::BacklogAction;
use replica_judge_core::BacklogEntry;
use replica_judge_core::BacklogError;
use replica_judge_core::ChangeBacklog;
use replica_judge_core::ClaimRequest;
use replica_judge_core::DatasetLock;
use replica_judge_core::DidKey;
use replica_judge_core::LockBatch;
use replica_judge_core::LockBatchOutcome;
use replica_judge_core::LockCounters;
use replica_judge_core::LockState;
use replica_judge_core::LockStore;
use replica_judge_core::ReplicaLock;
use replica_judge_core::RseId;
use replica_judge_core::Rule;
use replica_judge_core::RuleClaim;
use replica_judge_core::RuleId;
use replica_judge_core::RuleSpec;
use replica_judge_core::RuleState;
use replica_judge_core::RuleStateUpdate;
use replica_judge_core::RuleStore;
use replica_judge_core::StoreError;
use replica_judge_core::StuckReason;
use replica_judge_core::Timestamp;
use rusqlite::Connection;
use rusqlite::ErrorCode;
use rusqlite::OpenFlags;
use rusqlite::OptionalExtension;
use rusqlite::TransactionBehavior;
use rusqlite::params;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// `SQLite` schema version for the store.
const SCHEMA_VERSION: i64 = 1;
/// Default busy timeout (ms).
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
/// Maximum length of a single path component.
const MAX_PATH_COMPONENT_LENGTH: usize = 255;
/// Maximum total path length.
const MAX_TOTAL_PATH_LENGTH: usize = 4096;
/// Maximum serialized rule request size accepted by the store.
pub const MAX_SPEC_BYTES: usize = 256 * 1024;

/// Columns read for every rule row, in [`RuleRow`] order.
const RULE_COLUMNS: &str = "rule_id, spec_json, state, error_json, locks_ok_cnt, \
                            locks_replicating_cnt, locks_stuck_cnt, created_at, expires_at";
/// Columns read for every file lock row, in [`LockRow`] order.
const LOCK_COLUMNS: &str = "scope, name, rse_id, rule_id, account, state, bytes, created_at";
/// Columns read for every dataset lock row, in [`DatasetLockRow`] order.
const DATASET_LOCK_COLUMNS: &str =
    "scope, name, rse_id, rule_id, account, state, length, bytes, updated_at";

// ============================================================================
// SECTION: Config
// ============================================================================

/// `SQLite` journal mode configuration.
///
/// # Invariants
/// - Values map 1:1 to `SQLite` `journal_mode` pragma settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SqliteStoreMode {
    /// WAL journal mode (recommended).
    #[default]
    Wal,
    /// Delete journal mode (legacy).
    Delete,
}

impl SqliteStoreMode {
    /// Returns the `SQLite` pragma value.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Wal => "wal",
            Self::Delete => "delete",
        }
    }
}

/// `SQLite` sync mode configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SqliteSyncMode {
    /// Full synchronous mode (safest).
    #[default]
    Full,
    /// Normal synchronous mode (balanced).
    Normal,
}

impl SqliteSyncMode {
    /// Returns the `SQLite` pragma value.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Normal => "normal",
        }
    }
}

/// Configuration for the `SQLite` judge store.
///
/// # Invariants
/// - `path` must resolve to a file path (not a directory).
/// - `busy_timeout_ms` is interpreted as milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqliteStoreConfig {
    /// Path to the `SQLite` database file.
    pub path: PathBuf,
    /// Busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// `SQLite` journal mode.
    #[serde(default)]
    pub journal_mode: SqliteStoreMode,
    /// `SQLite` sync mode.
    #[serde(default)]
    pub sync_mode: SqliteSyncMode,
}

impl SqliteStoreConfig {
    /// Creates a configuration with default pragmas for `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            journal_mode: SqliteStoreMode::default(),
            sync_mode: SqliteSyncMode::default(),
        }
    }
}

/// Returns the default busy timeout for `SQLite` connections.
const fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// `SQLite` store errors.
///
/// # Invariants
/// - Error messages avoid embedding rule request payloads.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SqliteStoreError {
    /// Store I/O error.
    #[error("sqlite store io error: {0}")]
    Io(String),
    /// `SQLite` engine error.
    #[error("sqlite store db error: {0}")]
    Db(String),
    /// Database write lock held by another connection.
    #[error("sqlite store busy: {0}")]
    Busy(String),
    /// Stored row failed to decode.
    #[error("sqlite store corruption: {0}")]
    Corrupt(String),
    /// Store schema version mismatch.
    #[error("sqlite store version mismatch: {0}")]
    VersionMismatch(String),
    /// Invalid input or configuration.
    #[error("sqlite store invalid data: {0}")]
    Invalid(String),
    /// Referenced row does not exist.
    #[error("sqlite store record not found: {0}")]
    NotFound(String),
    /// Payload exceeded the size limit.
    #[error("sqlite store payload too large: {actual_bytes} bytes (max {max_bytes})")]
    TooLarge {
        /// Maximum allowed bytes.
        max_bytes: usize,
        /// Actual payload size in bytes.
        actual_bytes: usize,
    },
}

impl From<SqliteStoreError> for StoreError {
    fn from(error: SqliteStoreError) -> Self {
        match error {
            SqliteStoreError::Io(message) => Self::Io(message),
            SqliteStoreError::Db(message) => Self::Store(message),
            SqliteStoreError::Busy(message) => Self::Contention(message),
            SqliteStoreError::Corrupt(message) => Self::Corrupt(message),
            SqliteStoreError::VersionMismatch(message) => Self::VersionMismatch(message),
            SqliteStoreError::Invalid(message) => Self::Invalid(message),
            SqliteStoreError::NotFound(message) => Self::NotFound(message),
            SqliteStoreError::TooLarge {
                max_bytes,
                actual_bytes,
            } => Self::Invalid(format!(
                "spec_json exceeds size limit: {actual_bytes} bytes (max {max_bytes})"
            )),
        }
    }
}

impl From<SqliteStoreError> for BacklogError {
    fn from(error: SqliteStoreError) -> Self {
        match error {
            SqliteStoreError::Busy(message) => Self::Contention(message),
            other => Self::Store(other.to_string()),
        }
    }
}

/// Maps a rusqlite error, classifying lock contention as busy.
fn db_error(err: rusqlite::Error) -> SqliteStoreError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(failure.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
        {
            SqliteStoreError::Busy(err.to_string())
        }
        _ => SqliteStoreError::Db(err.to_string()),
    }
}

// ============================================================================
// SECTION: Store
// ============================================================================

/// `SQLite`-backed judge store.
///
/// # Invariants
/// - Connection access within one process is serialized through a mutex.
/// - Claims and lock batches hold the database write lock for their whole
///   transaction.
#[derive(Clone)]
pub struct SqliteJudgeStore {
    /// Shared connection guarded by a mutex.
    connection: Arc<Mutex<Connection>>,
}

impl SqliteJudgeStore {
    /// Opens or creates the store described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteStoreError`] when the path is invalid, the database
    /// cannot be opened, or the schema version is unsupported.
    pub fn open(config: &SqliteStoreConfig) -> Result<Self, SqliteStoreError> {
        validate_store_path(&config.path)?;
        ensure_parent_dir(&config.path)?;
        let mut connection = open_connection(config)?;
        initialize_schema(&mut connection)?;
        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
        })
    }

    /// Runs `op` with exclusive access to the connection.
    fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> Result<T, SqliteStoreError>,
    ) -> Result<T, SqliteStoreError> {
        let mut guard = self
            .connection
            .lock()
            .map_err(|_| SqliteStoreError::Db("connection mutex poisoned".to_string()))?;
        op(&mut guard)
    }

    /// Returns every account counter delta recorded with a lock batch, oldest
    /// first.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteStoreError`] when the table cannot be read.
    pub fn counter_updates(&self) -> Result<Vec<AccountCounterDelta>, SqliteStoreError> {
        self.with_connection(|connection| {
            let mut stmt = connection
                .prepare_cached(
                    "SELECT account, rse_id, files, bytes FROM account_counter_updates ORDER BY id",
                )
                .map_err(db_error)?;
            let rows = stmt
                .query_map(params![], |row| {
                    Ok(AccountCounterDelta {
                        account: AccountId::new(row.get::<_, String>(0)?),
                        rse_id: RseId::new(row.get::<_, String>(1)?),
                        files: row.get(2)?,
                        bytes: row.get(3)?,
                    })
                })
                .map_err(db_error)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(db_error)
        })
    }

    /// Returns the net bytes charged to `account` at `rse_id` by committed
    /// lock batches.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteStoreError`] when the table cannot be read.
    pub fn account_usage(
        &self,
        account: &AccountId,
        rse_id: &RseId,
    ) -> Result<i64, SqliteStoreError> {
        self.with_connection(|connection| {
            connection
                .query_row(
                    "SELECT COALESCE(SUM(bytes), 0) FROM account_counter_updates
                     WHERE account = ?1 AND rse_id = ?2",
                    params![account.as_str(), rse_id.as_str()],
                    |row| row.get(0),
                )
                .map_err(db_error)
        })
    }

    /// Returns the number of stored file locks.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteStoreError`] when the table cannot be read.
    pub fn lock_count(&self) -> Result<u64, SqliteStoreError> {
        self.with_connection(|connection| {
            let count: i64 = connection
                .query_row("SELECT COUNT(1) FROM replica_locks", params![], |row| row.get(0))
                .map_err(db_error)?;
            u64::try_from(count)
                .map_err(|_| SqliteStoreError::Corrupt("negative count".to_string()))
        })
    }
}

// ============================================================================
// SECTION: Change Backlog
// ============================================================================

impl ChangeBacklog for SqliteJudgeStore {
    fn enqueue(
        &self,
        did: &DidKey,
        action: BacklogAction,
        now: Timestamp,
    ) -> Result<bool, BacklogError> {
        let now = millis(now)?;
        let inserted = self.with_connection(|connection| {
            connection
                .execute(
                    "INSERT INTO backlog (scope, name, action, enqueued_at)
                     SELECT ?1, ?2, ?3, ?4
                     WHERE NOT EXISTS (
                         SELECT 1 FROM backlog
                         WHERE scope = ?1 AND name = ?2 AND action = ?3 AND claimed_at IS NULL
                     )",
                    params![did.scope.as_str(), did.name, action.as_str(), now],
                )
                .map_err(db_error)
        })?;
        Ok(inserted == 1)
    }

    fn drain(&self, request: &ClaimRequest) -> Result<Vec<BacklogEntry>, BacklogError> {
        let now = millis(request.now)?;
        let stale_before = millis(request.now.saturating_sub(request.lease))?;
        let limit = i64::try_from(request.limit).unwrap_or(i64::MAX);
        let claimed = self.with_connection(|connection| {
            let tx = connection
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(db_error)?;
            let dids: Vec<(String, String)> = {
                let mut stmt = tx
                    .prepare_cached(
                        "SELECT scope, name FROM backlog
                         WHERE claimed_at IS NULL OR claimed_at <= ?1
                         GROUP BY scope, name
                         ORDER BY MIN(id)
                         LIMIT ?2",
                    )
                    .map_err(db_error)?;
                let rows = stmt
                    .query_map(params![stale_before, limit], |row| Ok((row.get(0)?, row.get(1)?)))
                    .map_err(db_error)?;
                rows.collect::<Result<_, _>>().map_err(db_error)?
            };

            let mut claimed = Vec::new();
            for (scope, name) in dids {
                let rows: Vec<(i64, String, i64)> = {
                    let mut stmt = tx
                        .prepare_cached(
                            "SELECT id, action, enqueued_at FROM backlog
                             WHERE scope = ?1 AND name = ?2
                               AND (claimed_at IS NULL OR claimed_at <= ?3)
                             ORDER BY id",
                        )
                        .map_err(db_error)?;
                    let rows = stmt
                        .query_map(params![scope, name, stale_before], |row| {
                            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                        })
                        .map_err(db_error)?;
                    rows.collect::<Result<_, _>>().map_err(db_error)?
                };
                for (id, action, enqueued_at) in rows {
                    tx.execute(
                        "UPDATE backlog SET claimed_by = ?1, claimed_at = ?2 WHERE id = ?3",
                        params![request.worker.as_str(), now, id],
                    )
                    .map_err(db_error)?;
                    claimed.push(BacklogEntry {
                        id: u64::try_from(id).map_err(|_| {
                            SqliteStoreError::Corrupt("negative backlog id".to_string())
                        })?,
                        did: DidKey::new(scope.as_str(), name.as_str()),
                        action: BacklogAction::parse(&action).ok_or_else(|| {
                            SqliteStoreError::Corrupt(format!("unknown backlog action {action}"))
                        })?,
                        enqueued_at: timestamp(enqueued_at)?,
                    });
                }
            }
            tx.commit().map_err(db_error)?;
            Ok(claimed)
        })?;
        Ok(claimed)
    }

    fn acknowledge(&self, ids: &[u64]) -> Result<(), BacklogError> {
        self.update_ids(ids, "DELETE FROM backlog WHERE id = ?1").map_err(BacklogError::from)
    }

    fn restore(&self, ids: &[u64]) -> Result<(), BacklogError> {
        self.update_ids(
            ids,
            "UPDATE backlog SET claimed_by = NULL, claimed_at = NULL WHERE id = ?1",
        )
        .map_err(BacklogError::from)
    }

    fn pending_count(&self) -> Result<u64, BacklogError> {
        let count = self.with_connection(|connection| {
            let count: i64 = connection
                .query_row(
                    "SELECT COUNT(1) FROM backlog WHERE claimed_at IS NULL",
                    params![],
                    |row| row.get(0),
                )
                .map_err(db_error)?;
            u64::try_from(count)
                .map_err(|_| SqliteStoreError::Corrupt("negative count".to_string()))
        })?;
        Ok(count)
    }
}

impl SqliteJudgeStore {
    /// Runs a single-id statement for every id in one transaction.
    fn update_ids(&self, ids: &[u64], sql: &str) -> Result<(), SqliteStoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        self.with_connection(|connection| {
            let tx = connection
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(db_error)?;
            {
                let mut stmt = tx.prepare_cached(sql).map_err(db_error)?;
                for id in ids {
                    stmt.execute(params![to_i64(*id, "backlog id")?]).map_err(db_error)?;
                }
            }
            tx.commit().map_err(db_error)
        })
    }
}

// ============================================================================
// SECTION: Rule Store
// ============================================================================

/// Raw rule row prior to decoding.
struct RuleRow {
    /// Rule identifier.
    rule_id: i64,
    /// Serialized request.
    spec_json: Vec<u8>,
    /// State label.
    state: String,
    /// Serialized stuck reason.
    error_json: Option<String>,
    /// OK lock count.
    ok: i64,
    /// Replicating lock count.
    replicating: i64,
    /// Stuck lock count.
    stuck: i64,
    /// Creation time.
    created_at: i64,
    /// Expiry time.
    expires_at: Option<i64>,
}

impl RuleRow {
    /// Reads a row selected with [`RULE_COLUMNS`].
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            rule_id: row.get(0)?,
            spec_json: row.get(1)?,
            state: row.get(2)?,
            error_json: row.get(3)?,
            ok: row.get(4)?,
            replicating: row.get(5)?,
            stuck: row.get(6)?,
            created_at: row.get(7)?,
            expires_at: row.get(8)?,
        })
    }

    /// Decodes the row into a rule, failing closed on malformed data.
    fn decode(self) -> Result<Rule, SqliteStoreError> {
        let rule_id = u64::try_from(self.rule_id)
            .ok()
            .and_then(RuleId::from_raw)
            .ok_or_else(|| SqliteStoreError::Corrupt(format!("invalid rule id {}", self.rule_id)))?;
        let spec: RuleSpec = serde_json::from_slice(&self.spec_json).map_err(|err| {
            SqliteStoreError::Corrupt(format!("rule {rule_id} spec_json: {err}"))
        })?;
        let state = RuleState::parse(&self.state).ok_or_else(|| {
            SqliteStoreError::Corrupt(format!("rule {rule_id} state {}", self.state))
        })?;
        let error = self
            .error_json
            .map(|raw| serde_json::from_str::<StuckReason>(&raw))
            .transpose()
            .map_err(|err| SqliteStoreError::Corrupt(format!("rule {rule_id} error_json: {err}")))?;
        Ok(Rule {
            rule_id,
            spec,
            state,
            error,
            counters: LockCounters {
                ok: count(self.ok)?,
                replicating: count(self.replicating)?,
                stuck: count(self.stuck)?,
            },
            created_at: timestamp(self.created_at)?,
            expires_at: self.expires_at.map(timestamp).transpose()?,
        })
    }
}

/// Loads rules matching `sql` with `params`.
fn query_rules(
    connection: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Rule>, SqliteStoreError> {
    let mut stmt = connection.prepare_cached(sql).map_err(db_error)?;
    let rows = stmt.query_map(params, RuleRow::read).map_err(db_error)?;
    let raw: Vec<RuleRow> = rows.collect::<Result<_, _>>().map_err(db_error)?;
    raw.into_iter().map(RuleRow::decode).collect()
}

impl RuleStore for SqliteJudgeStore {
    fn create_rule(&self, spec: &RuleSpec, now: Timestamp) -> Result<RuleId, StoreError> {
        let spec_json =
            serde_json::to_vec(spec).map_err(|err| SqliteStoreError::Invalid(err.to_string()))?;
        if spec_json.len() > MAX_SPEC_BYTES {
            return Err(SqliteStoreError::TooLarge {
                max_bytes: MAX_SPEC_BYTES,
                actual_bytes: spec_json.len(),
            }
            .into());
        }
        let created_at = millis(now)?;
        let expires_at = spec
            .lifetime_secs
            .map(|secs| millis(now.saturating_add(Duration::from_secs(secs))))
            .transpose()?;
        let rule_id = self.with_connection(|connection| {
            let tx = connection
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(db_error)?;
            tx.execute(
                "INSERT INTO rules (spec_json, state, error_json, locks_ok_cnt, \
                 locks_replicating_cnt, locks_stuck_cnt, locked, created_at, updated_at, \
                 expires_at)
                 VALUES (?1, ?2, NULL, 0, 0, 0, ?3, ?4, ?4, ?5)",
                params![spec_json, RuleState::Inject.as_str(), spec.locked, created_at, expires_at],
            )
            .map_err(db_error)?;
            let raw_id = tx.last_insert_rowid();
            for root in &spec.roots {
                tx.execute(
                    "INSERT INTO rule_roots (rule_id, scope, name) VALUES (?1, ?2, ?3)",
                    params![raw_id, root.scope.as_str(), root.name],
                )
                .map_err(db_error)?;
            }
            tx.commit().map_err(db_error)?;
            u64::try_from(raw_id)
                .ok()
                .and_then(RuleId::from_raw)
                .ok_or_else(|| SqliteStoreError::Corrupt(format!("invalid rule id {raw_id}")))
        })?;
        Ok(rule_id)
    }

    fn get_rule(&self, rule_id: RuleId) -> Result<Option<Rule>, StoreError> {
        let id = rule_param(rule_id)?;
        let rules = self.with_connection(|connection| {
            query_rules(
                connection,
                &format!("SELECT {RULE_COLUMNS} FROM rules WHERE rule_id = ?1"),
                params![id],
            )
        })?;
        Ok(rules.into_iter().next())
    }

    fn rules_for_roots(&self, roots: &[DidKey]) -> Result<Vec<Rule>, StoreError> {
        let rules = self.with_connection(|connection| {
            let mut ids = BTreeSet::new();
            {
                let mut stmt = connection
                    .prepare_cached("SELECT rule_id FROM rule_roots WHERE scope = ?1 AND name = ?2")
                    .map_err(db_error)?;
                for root in roots {
                    let rows = stmt
                        .query_map(params![root.scope.as_str(), root.name], |row| {
                            row.get::<_, i64>(0)
                        })
                        .map_err(db_error)?;
                    for id in rows {
                        ids.insert(id.map_err(db_error)?);
                    }
                }
            }
            let sql = format!("SELECT {RULE_COLUMNS} FROM rules WHERE rule_id = ?1");
            let mut rules = Vec::with_capacity(ids.len());
            for id in ids {
                rules.extend(query_rules(connection, &sql, params![id])?);
            }
            Ok(rules)
        })?;
        Ok(rules)
    }

    fn rules_in_states(
        &self,
        states: &[RuleState],
        after: Option<RuleId>,
        limit: usize,
    ) -> Result<Vec<Rule>, StoreError> {
        if states.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let labels = states
            .iter()
            .map(|state| format!("'{}'", state.as_str()))
            .collect::<Vec<_>>()
            .join(",");
        let after = after.map(rule_param).transpose()?.unwrap_or(0);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rules = self.with_connection(|connection| {
            query_rules(
                connection,
                &format!(
                    "SELECT {RULE_COLUMNS} FROM rules
                     WHERE rule_id > ?1 AND state IN ({labels})
                     ORDER BY rule_id LIMIT ?2"
                ),
                params![after, limit],
            )
        })?;
        Ok(rules)
    }

    fn update_rule_state(
        &self,
        rule_id: RuleId,
        update: &RuleStateUpdate,
        now: Timestamp,
    ) -> Result<(), StoreError> {
        let id = rule_param(rule_id)?;
        let error_json = update
            .error
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|err| SqliteStoreError::Invalid(err.to_string()))?;
        let counters = [
            to_i64(update.counters.ok, "lock counter")?,
            to_i64(update.counters.replicating, "lock counter")?,
            to_i64(update.counters.stuck, "lock counter")?,
        ];
        let updated_at = millis(now)?;
        let changed = self.with_connection(|connection| {
            connection
                .execute(
                    "UPDATE rules SET state = ?1, error_json = ?2, locks_ok_cnt = ?3, \
                     locks_replicating_cnt = ?4, locks_stuck_cnt = ?5, updated_at = ?6
                     WHERE rule_id = ?7",
                    params![
                        update.state.as_str(),
                        error_json,
                        counters[0],
                        counters[1],
                        counters[2],
                        updated_at,
                        id
                    ],
                )
                .map_err(db_error)
        })?;
        if changed == 0 {
            return Err(SqliteStoreError::NotFound(format!("rule {rule_id}")).into());
        }
        Ok(())
    }

    fn expired_rules(&self, now: Timestamp, limit: usize) -> Result<Vec<Rule>, StoreError> {
        let now = millis(now)?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rules = self.with_connection(|connection| {
            query_rules(
                connection,
                &format!(
                    "SELECT {RULE_COLUMNS} FROM rules
                     WHERE expires_at IS NOT NULL AND expires_at <= ?1 AND locked = 0
                     ORDER BY rule_id LIMIT ?2"
                ),
                params![now, limit],
            )
        })?;
        Ok(rules)
    }

    fn claim_rule(&self, rule_id: RuleId, claim: &RuleClaim) -> Result<bool, StoreError> {
        let id = rule_param(rule_id)?;
        let now = millis(claim.now)?;
        let stale_before = millis(claim.now.saturating_sub(claim.lease))?;
        let changed = self.with_connection(|connection| {
            connection
                .execute(
                    "UPDATE rules SET claimed_by = ?1, claimed_at = ?2
                     WHERE rule_id = ?3 AND (claimed_at IS NULL OR claimed_at <= ?4)",
                    params![claim.worker.as_str(), now, id, stale_before],
                )
                .map_err(db_error)
        })?;
        Ok(changed == 1)
    }

    fn release_rule(&self, rule_id: RuleId, claim: &RuleClaim) -> Result<(), StoreError> {
        let id = rule_param(rule_id)?;
        let claimed_at = millis(claim.now)?;
        self.with_connection(|connection| {
            connection
                .execute(
                    "UPDATE rules SET claimed_by = NULL, claimed_at = NULL
                     WHERE rule_id = ?1 AND claimed_by = ?2 AND claimed_at = ?3",
                    params![id, claim.worker.as_str(), claimed_at],
                )
                .map_err(db_error)
        })?;
        Ok(())
    }

    fn delete_rule(&self, rule_id: RuleId) -> Result<(), StoreError> {
        let id = rule_param(rule_id)?;
        self.with_connection(|connection| {
            let tx = connection
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(db_error)?;
            tx.execute("DELETE FROM rule_roots WHERE rule_id = ?1", params![id])
                .map_err(db_error)?;
            tx.execute("DELETE FROM rules WHERE rule_id = ?1", params![id]).map_err(db_error)?;
            tx.commit().map_err(db_error)
        })?;
        Ok(())
    }
}

// ============================================================================
// SECTION: Lock Store
// ============================================================================

/// Raw file lock row prior to decoding.
struct LockRow {
    /// Identifier scope.
    scope: String,
    /// Identifier name.
    name: String,
    /// Resource identifier.
    rse_id: String,
    /// Owning rule.
    rule_id: i64,
    /// Charged account.
    account: String,
    /// State label.
    state: String,
    /// File size.
    bytes: i64,
    /// Creation time.
    created_at: i64,
}

impl LockRow {
    /// Reads a row selected with [`LOCK_COLUMNS`].
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            scope: row.get(0)?,
            name: row.get(1)?,
            rse_id: row.get(2)?,
            rule_id: row.get(3)?,
            account: row.get(4)?,
            state: row.get(5)?,
            bytes: row.get(6)?,
            created_at: row.get(7)?,
        })
    }

    /// Decodes the row into a file lock.
    fn decode(self) -> Result<ReplicaLock, SqliteStoreError> {
        Ok(ReplicaLock {
            did: DidKey::new(self.scope, self.name),
            rse_id: RseId::new(self.rse_id),
            rule_id: rule_from_raw(self.rule_id)?,
            account: AccountId::new(self.account),
            state: lock_state(&self.state)?,
            bytes: count(self.bytes)?,
            created_at: timestamp(self.created_at)?,
        })
    }
}

/// Raw dataset lock row prior to decoding.
struct DatasetLockRow {
    /// Dataset scope.
    scope: String,
    /// Dataset name.
    name: String,
    /// Resource identifier.
    rse_id: String,
    /// Owning rule.
    rule_id: i64,
    /// Charged account.
    account: String,
    /// State label.
    state: String,
    /// Locked member count.
    length: i64,
    /// Locked member bytes.
    bytes: i64,
    /// Last recomputation time.
    updated_at: i64,
}

impl DatasetLockRow {
    /// Reads a row selected with [`DATASET_LOCK_COLUMNS`].
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            scope: row.get(0)?,
            name: row.get(1)?,
            rse_id: row.get(2)?,
            rule_id: row.get(3)?,
            account: row.get(4)?,
            state: row.get(5)?,
            length: row.get(6)?,
            bytes: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    /// Decodes the row into a dataset lock.
    fn decode(self) -> Result<DatasetLock, SqliteStoreError> {
        Ok(DatasetLock {
            dataset: DidKey::new(self.scope, self.name),
            rse_id: RseId::new(self.rse_id),
            rule_id: rule_from_raw(self.rule_id)?,
            account: AccountId::new(self.account),
            state: lock_state(&self.state)?,
            length: count(self.length)?,
            bytes: count(self.bytes)?,
            updated_at: timestamp(self.updated_at)?,
        })
    }
}

impl SqliteJudgeStore {
    /// Loads file locks matching `filter` with `params`.
    fn query_locks(
        &self,
        filter: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<ReplicaLock>, SqliteStoreError> {
        self.with_connection(|connection| {
            let sql = format!("SELECT {LOCK_COLUMNS} FROM replica_locks WHERE {filter}");
            let mut stmt = connection.prepare_cached(&sql).map_err(db_error)?;
            let rows = stmt.query_map(params, LockRow::read).map_err(db_error)?;
            let raw: Vec<LockRow> = rows.collect::<Result<_, _>>().map_err(db_error)?;
            raw.into_iter().map(LockRow::decode).collect()
        })
    }

    /// Loads dataset locks matching `filter` with `params`.
    fn query_dataset_locks(
        &self,
        filter: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<DatasetLock>, SqliteStoreError> {
        self.with_connection(|connection| {
            let sql = format!("SELECT {DATASET_LOCK_COLUMNS} FROM dataset_locks WHERE {filter}");
            let mut stmt = connection.prepare_cached(&sql).map_err(db_error)?;
            let rows = stmt.query_map(params, DatasetLockRow::read).map_err(db_error)?;
            let raw: Vec<DatasetLockRow> = rows.collect::<Result<_, _>>().map_err(db_error)?;
            raw.into_iter().map(DatasetLockRow::decode).collect()
        })
    }
}

impl LockStore for SqliteJudgeStore {
    fn file_locks(&self, did: &DidKey) -> Result<Vec<ReplicaLock>, StoreError> {
        Ok(self.query_locks(
            "scope = ?1 AND name = ?2 ORDER BY rse_id, rule_id",
            params![did.scope.as_str(), did.name],
        )?)
    }

    fn dataset_locks(&self, dataset: &DidKey) -> Result<Vec<DatasetLock>, StoreError> {
        Ok(self.query_dataset_locks(
            "scope = ?1 AND name = ?2 ORDER BY rse_id, rule_id",
            params![dataset.scope.as_str(), dataset.name],
        )?)
    }

    fn rule_locks(&self, rule_id: RuleId) -> Result<Vec<ReplicaLock>, StoreError> {
        let id = rule_param(rule_id)?;
        Ok(self.query_locks("rule_id = ?1 ORDER BY scope, name, rse_id", params![id])?)
    }

    fn rule_dataset_locks(&self, rule_id: RuleId) -> Result<Vec<DatasetLock>, StoreError> {
        let id = rule_param(rule_id)?;
        Ok(self.query_dataset_locks("rule_id = ?1 ORDER BY scope, name, rse_id", params![id])?)
    }

    fn apply(&self, batch: &LockBatch) -> Result<LockBatchOutcome, StoreError> {
        let outcome = self.with_connection(|connection| {
            let tx = connection
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(db_error)?;
            let mut outcome = LockBatchOutcome::default();

            for key in &batch.remove {
                let rule_id = rule_param(key.rule_id)?;
                let existing: Option<(String, i64)> = tx
                    .query_row(
                        "SELECT account, bytes FROM replica_locks
                         WHERE scope = ?1 AND name = ?2 AND rse_id = ?3 AND rule_id = ?4",
                        params![key.did.scope.as_str(), key.did.name, key.rse_id.as_str(), rule_id],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()
                    .map_err(db_error)?;
                let Some((account, bytes)) = existing else {
                    continue;
                };
                tx.execute(
                    "DELETE FROM replica_locks
                     WHERE scope = ?1 AND name = ?2 AND rse_id = ?3 AND rule_id = ?4",
                    params![key.did.scope.as_str(), key.did.name, key.rse_id.as_str(), rule_id],
                )
                .map_err(db_error)?;
                outcome.removed += 1;
                outcome.record(&AccountId::new(account), &key.rse_id, count(bytes)?, -1);
            }

            for lock in &batch.create {
                let inserted = tx
                    .execute(
                        "INSERT OR IGNORE INTO replica_locks (scope, name, rse_id, rule_id, \
                         account, state, bytes, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                        params![
                            lock.did.scope.as_str(),
                            lock.did.name,
                            lock.rse_id.as_str(),
                            rule_param(lock.rule_id)?,
                            lock.account.as_str(),
                            lock.state.as_str(),
                            to_i64(lock.bytes, "lock bytes")?,
                            millis(lock.created_at)?
                        ],
                    )
                    .map_err(db_error)?;
                if inserted == 1 {
                    outcome.created += 1;
                    outcome.record(&lock.account, &lock.rse_id, lock.bytes, 1);
                }
            }

            for key in &batch.dataset_removals {
                tx.execute(
                    "DELETE FROM dataset_locks
                     WHERE scope = ?1 AND name = ?2 AND rse_id = ?3 AND rule_id = ?4",
                    params![
                        key.dataset.scope.as_str(),
                        key.dataset.name,
                        key.rse_id.as_str(),
                        rule_param(key.rule_id)?
                    ],
                )
                .map_err(db_error)?;
            }

            for lock in &batch.dataset_upserts {
                tx.execute(
                    "INSERT INTO dataset_locks (scope, name, rse_id, rule_id, account, state, \
                     length, bytes, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                     ON CONFLICT(scope, name, rse_id, rule_id) DO UPDATE SET
                         account = excluded.account,
                         state = excluded.state,
                         length = excluded.length,
                         bytes = excluded.bytes,
                         updated_at = excluded.updated_at",
                    params![
                        lock.dataset.scope.as_str(),
                        lock.dataset.name,
                        lock.rse_id.as_str(),
                        rule_param(lock.rule_id)?,
                        lock.account.as_str(),
                        lock.state.as_str(),
                        to_i64(lock.length, "dataset length")?,
                        to_i64(lock.bytes, "dataset bytes")?,
                        millis(lock.updated_at)?
                    ],
                )
                .map_err(db_error)?;
            }

            for delta in &outcome.counters {
                tx.execute(
                    "INSERT INTO account_counter_updates (account, rse_id, files, bytes)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        delta.account.as_str(),
                        delta.rse_id.as_str(),
                        delta.files,
                        delta.bytes
                    ],
                )
                .map_err(db_error)?;
            }

            tx.commit().map_err(db_error)?;
            Ok(outcome)
        })?;
        Ok(outcome)
    }
}

// ============================================================================
// SECTION: Conversions
// ============================================================================

/// Converts a timestamp into a stored integer.
fn millis(timestamp: Timestamp) -> Result<i64, SqliteStoreError> {
    i64::try_from(timestamp.as_millis())
        .map_err(|_| SqliteStoreError::Invalid("timestamp out of range".to_string()))
}

/// Converts a stored integer into a timestamp.
fn timestamp(raw: i64) -> Result<Timestamp, SqliteStoreError> {
    u64::try_from(raw)
        .map(Timestamp::from_millis)
        .map_err(|_| SqliteStoreError::Corrupt(format!("negative timestamp {raw}")))
}

/// Converts an unsigned value into a stored integer.
fn to_i64(value: u64, what: &str) -> Result<i64, SqliteStoreError> {
    i64::try_from(value).map_err(|_| SqliteStoreError::Invalid(format!("{what} out of range")))
}

/// Converts a stored integer into a non-negative count.
fn count(raw: i64) -> Result<u64, SqliteStoreError> {
    u64::try_from(raw).map_err(|_| SqliteStoreError::Corrupt(format!("negative count {raw}")))
}

/// Converts a rule identifier into a stored integer.
fn rule_param(rule_id: RuleId) -> Result<i64, SqliteStoreError> {
    to_i64(rule_id.get(), "rule id")
}

/// Converts a stored integer into a rule identifier.
fn rule_from_raw(raw: i64) -> Result<RuleId, SqliteStoreError> {
    u64::try_from(raw)
        .ok()
        .and_then(RuleId::from_raw)
        .ok_or_else(|| SqliteStoreError::Corrupt(format!("invalid rule id {raw}")))
}

/// Parses a stored lock state label.
fn lock_state(label: &str) -> Result<LockState, SqliteStoreError> {
    LockState::parse(label)
        .ok_or_else(|| SqliteStoreError::Corrupt(format!("unknown lock state {label}")))
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Ensures the parent directory for the store exists.
fn ensure_parent_dir(path: &Path) -> Result<(), SqliteStoreError> {
    let Some(parent) = path.parent() else {
        return Err(SqliteStoreError::Io("store path missing parent directory".to_string()));
    };
    std::fs::create_dir_all(parent).map_err(|err| SqliteStoreError::Io(err.to_string()))
}

/// Validates store paths for safety limits.
fn validate_store_path(path: &Path) -> Result<(), SqliteStoreError> {
    if path.as_os_str().is_empty() {
        return Err(SqliteStoreError::Invalid("store path must not be empty".to_string()));
    }
    if path.display().to_string().len() > MAX_TOTAL_PATH_LENGTH {
        return Err(SqliteStoreError::Invalid("store path exceeds length limit".to_string()));
    }
    if path.components().any(|component| component.as_os_str().len() > MAX_PATH_COMPONENT_LENGTH)
    {
        return Err(SqliteStoreError::Invalid(
            "store path contains an overlong component".to_string(),
        ));
    }
    if path.is_dir() {
        return Err(SqliteStoreError::Invalid(
            "store path must be a file, not a directory".to_string(),
        ));
    }
    Ok(())
}

/// Opens an `SQLite` connection with durable defaults.
fn open_connection(config: &SqliteStoreConfig) -> Result<Connection, SqliteStoreError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
    let connection = Connection::open_with_flags(&config.path, flags).map_err(db_error)?;
    connection.busy_timeout(Duration::from_millis(config.busy_timeout_ms)).map_err(db_error)?;
    connection
        .execute_batch(&format!(
            "PRAGMA foreign_keys = ON;
             PRAGMA journal_mode = {};
             PRAGMA synchronous = {};",
            config.journal_mode.pragma_value(),
            config.sync_mode.pragma_value()
        ))
        .map_err(db_error)?;
    Ok(connection)
}

/// Initializes the `SQLite` schema or validates the existing version.
fn initialize_schema(connection: &mut Connection) -> Result<(), SqliteStoreError> {
    let tx =
        connection.transaction_with_behavior(TransactionBehavior::Immediate).map_err(db_error)?;
    tx.execute_batch("CREATE TABLE IF NOT EXISTS store_meta (version INTEGER NOT NULL);")
        .map_err(db_error)?;
    let version: Option<i64> = tx
        .query_row("SELECT version FROM store_meta LIMIT 1", params![], |row| row.get(0))
        .optional()
        .map_err(db_error)?;
    match version {
        None => {
            tx.execute("INSERT INTO store_meta (version) VALUES (?1)", params![SCHEMA_VERSION])
                .map_err(db_error)?;
            tx.execute_batch(
                "CREATE TABLE IF NOT EXISTS backlog (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    scope TEXT NOT NULL,
                    name TEXT NOT NULL,
                    action TEXT NOT NULL,
                    enqueued_at INTEGER NOT NULL,
                    claimed_by TEXT,
                    claimed_at INTEGER
                );
                CREATE INDEX IF NOT EXISTS idx_backlog_did ON backlog (scope, name);
                CREATE INDEX IF NOT EXISTS idx_backlog_claimed_at ON backlog (claimed_at);
                CREATE TABLE IF NOT EXISTS rules (
                    rule_id INTEGER PRIMARY KEY AUTOINCREMENT,
                    spec_json BLOB NOT NULL,
                    state TEXT NOT NULL,
                    error_json TEXT,
                    locks_ok_cnt INTEGER NOT NULL,
                    locks_replicating_cnt INTEGER NOT NULL,
                    locks_stuck_cnt INTEGER NOT NULL,
                    locked INTEGER NOT NULL,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    expires_at INTEGER,
                    claimed_by TEXT,
                    claimed_at INTEGER
                );
                CREATE INDEX IF NOT EXISTS idx_rules_state ON rules (state, rule_id);
                CREATE INDEX IF NOT EXISTS idx_rules_expires_at ON rules (expires_at);
                CREATE TABLE IF NOT EXISTS rule_roots (
                    rule_id INTEGER NOT NULL,
                    scope TEXT NOT NULL,
                    name TEXT NOT NULL,
                    PRIMARY KEY (rule_id, scope, name),
                    FOREIGN KEY (rule_id) REFERENCES rules(rule_id) ON DELETE CASCADE
                );
                CREATE INDEX IF NOT EXISTS idx_rule_roots_did ON rule_roots (scope, name);
                CREATE TABLE IF NOT EXISTS replica_locks (
                    scope TEXT NOT NULL,
                    name TEXT NOT NULL,
                    rse_id TEXT NOT NULL,
                    rule_id INTEGER NOT NULL,
                    account TEXT NOT NULL,
                    state TEXT NOT NULL,
                    bytes INTEGER NOT NULL,
                    created_at INTEGER NOT NULL,
                    PRIMARY KEY (scope, name, rse_id, rule_id)
                );
                CREATE INDEX IF NOT EXISTS idx_replica_locks_rule ON replica_locks (rule_id);
                CREATE TABLE IF NOT EXISTS dataset_locks (
                    scope TEXT NOT NULL,
                    name TEXT NOT NULL,
                    rse_id TEXT NOT NULL,
                    rule_id INTEGER NOT NULL,
                    account TEXT NOT NULL,
                    state TEXT NOT NULL,
                    length INTEGER NOT NULL,
                    bytes INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    PRIMARY KEY (scope, name, rse_id, rule_id)
                );
                CREATE INDEX IF NOT EXISTS idx_dataset_locks_rule ON dataset_locks (rule_id);
                CREATE TABLE IF NOT EXISTS account_counter_updates (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    account TEXT NOT NULL,
                    rse_id TEXT NOT NULL,
                    files INTEGER NOT NULL,
                    bytes INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_account_counter_updates_account
                    ON account_counter_updates (account, rse_id);",
            )
            .map_err(db_error)?;
        }
        Some(value) if value == SCHEMA_VERSION => {}
        Some(value) => {
            return Err(SqliteStoreError::VersionMismatch(format!(
                "unsupported schema version: {value}"
            )));
        }
    }
    tx.commit().map_err(db_error)
}
