// crates/backfill-store-sqlite/src/store.rs
// ============================================================================
// Module: SQLite Migration Store
// Description: Durable MigrationStore backed by SQLite.
// Purpose: Persist migrations and job records shared by every worker process.
// Dependencies: backfill-core, rusqlite, serde, serde_json, thiserror
// ============================================================================

//! ## Overview
//! This module implements a durable [`MigrationStore`] using `SQLite`. The
//! one-active-migration-per-job-class rule is enforced by a partial unique
//! index, so concurrent operators and workers in different processes cannot
//! violate it. Status changes are compare-and-set inside a transaction.
//! Stored rows are untrusted on load: unknown status codes, negative sizes,
//! and malformed arguments fail closed as corruption.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use backfill_core::JobId;
use backfill_core::JobRecord;
use backfill_core::JobStatus;
use backfill_core::MigrationId;
use backfill_core::MigrationRecord;
use backfill_core::MigrationStatus;
use backfill_core::MigrationStore;
use backfill_core::NewJob;
use backfill_core::NewMigration;
use backfill_core::StoreError;
use backfill_core::Timestamp;
use rusqlite::Connection;
use rusqlite::ErrorCode;
use rusqlite::OpenFlags;
use rusqlite::OptionalExtension;
use rusqlite::params;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
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
/// Maximum serialized size of a migration's job arguments.
pub const MAX_JOB_ARGUMENTS_BYTES: usize = 64 * 1024;

/// Columns selected for migration rows, in [`map_migration_row`] order.
const MIGRATION_COLUMNS: &str = "id, job_class_name, table_name, column_name, job_arguments, \
                                 min_value, max_value, batch_size, sub_batch_size, \
                                 interval_seconds, status, last_job_started_at, created_at";
/// Columns selected for job rows, in [`map_job_row`] order.
const JOB_COLUMNS: &str = "id, migration_id, min_value, max_value, batch_size, sub_batch_size, \
                           status, attempts, affected_rows, last_error, started_at, finished_at";

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
///
/// # Invariants
/// - Values map 1:1 to `SQLite` `synchronous` pragma settings.
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

/// Configuration for the `SQLite` migration store.
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
    /// Returns a configuration for `path` with default tuning.
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
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SqliteStoreError {
    /// Store I/O error.
    #[error("sqlite store io error: {0}")]
    Io(String),
    /// `SQLite` engine error.
    #[error("sqlite store db error: {0}")]
    Db(String),
    /// Stored data failed validation on load.
    #[error("sqlite store corruption: {0}")]
    Corrupt(String),
    /// Store schema version mismatch.
    #[error("sqlite store version mismatch: {0}")]
    VersionMismatch(String),
    /// Invalid input data.
    #[error("sqlite store invalid data: {0}")]
    Invalid(String),
    /// Write rejected by a uniqueness or compare-and-set check.
    #[error("sqlite store conflict: {0}")]
    Conflict(String),
    /// Referenced row does not exist.
    #[error("sqlite store row not found: {0}")]
    NotFound(String),
    /// Payload exceeded configured size limits.
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
            SqliteStoreError::Corrupt(message) => Self::Corrupt(message),
            SqliteStoreError::VersionMismatch(message) => Self::VersionMismatch(message),
            SqliteStoreError::Invalid(message) => Self::Invalid(message),
            SqliteStoreError::Conflict(message) => Self::Conflict(message),
            SqliteStoreError::NotFound(message) => Self::NotFound(message),
            SqliteStoreError::TooLarge {
                max_bytes,
                actual_bytes,
            } => Self::Invalid(format!(
                "job_arguments exceeds size limit: {actual_bytes} bytes (max {max_bytes})"
            )),
        }
    }
}

/// Maps engine errors, classifying constraint violations as conflicts.
fn map_db_error(err: &rusqlite::Error) -> SqliteStoreError {
    match err.sqlite_error_code() {
        Some(ErrorCode::ConstraintViolation) => SqliteStoreError::Conflict(err.to_string()),
        _ => SqliteStoreError::Db(err.to_string()),
    }
}

// ============================================================================
// SECTION: Store
// ============================================================================

/// `SQLite`-backed migration store.
///
/// # Invariants
/// - `SQLite` connection access is serialized through a mutex.
/// - At most one migration per job class has status `active`.
#[derive(Clone)]
pub struct SqliteMigrationStore {
    /// Shared connection guarded by a mutex.
    connection: Arc<Mutex<Connection>>,
}

impl SqliteMigrationStore {
    /// Opens (and if needed creates) an `SQLite`-backed migration store.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteStoreError`] when the path is unsafe, the database
    /// cannot be opened, or the schema version is unsupported.
    pub fn open(config: &SqliteStoreConfig) -> Result<Self, SqliteStoreError> {
        let connection = open_store_connection(config)?;
        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
        })
    }

    /// Verifies the store can execute a simple SQL statement.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteStoreError`] if the mutex is poisoned or the query fails.
    pub fn readiness(&self) -> Result<(), SqliteStoreError> {
        self.with_connection(|connection| {
            connection.execute_batch("SELECT 1").map_err(|err| map_db_error(&err))
        })
    }

    /// Returns the shared connection for collaborators on the same database.
    pub(crate) fn shared_connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.connection)
    }

    /// Runs `f` with exclusive access to the connection.
    fn with_connection<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, SqliteStoreError>,
    ) -> Result<T, SqliteStoreError> {
        let mut guard = self
            .connection
            .lock()
            .map_err(|_| SqliteStoreError::Db("sqlite mutex poisoned".to_string()))?;
        f(&mut guard)
    }
}

impl MigrationStore for SqliteMigrationStore {
    fn create_migration(
        &self,
        migration: NewMigration,
        created_at: Timestamp,
    ) -> Result<MigrationRecord, StoreError> {
        migration.validate().map_err(|err| SqliteStoreError::Invalid(err.to_string()))?;
        let arguments = encode_arguments(&migration.job_arguments)?;
        let batch_size = to_sql_int("batch_size", migration.batch_size)?;
        let sub_batch_size = to_sql_int("sub_batch_size", migration.sub_batch_size)?;
        let interval = to_sql_int("interval_secs", migration.interval_secs)?;
        let raw_id = self.with_connection(|connection| {
            connection
                .execute(
                    "INSERT INTO migrations (job_class_name, table_name, column_name, \
                     job_arguments, min_value, max_value, batch_size, sub_batch_size, \
                     interval_seconds, status, last_job_started_at, created_at) VALUES (?1, ?2, \
                     ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, NULL, ?11)",
                    params![
                        migration.job_class_name.as_str(),
                        migration.table_name,
                        migration.column_name,
                        arguments,
                        migration.min_value,
                        migration.max_value,
                        batch_size,
                        sub_batch_size,
                        interval,
                        migration.status.code(),
                        created_at.as_unix_millis(),
                    ],
                )
                .map_err(|err| match map_db_error(&err) {
                    SqliteStoreError::Conflict(_) => SqliteStoreError::Conflict(format!(
                        "an active or finalizing migration already exists for {}",
                        migration.job_class_name
                    )),
                    other => other,
                })?;
            Ok(connection.last_insert_rowid())
        })?;
        let id = migration_id_from_sql(raw_id)?;
        Ok(migration.into_record(id, created_at))
    }

    fn migration(&self, id: MigrationId) -> Result<Option<MigrationRecord>, StoreError> {
        self.with_connection(|connection| query_migration(connection, id)).map_err(StoreError::from)
    }

    fn list_migrations(&self) -> Result<Vec<MigrationRecord>, StoreError> {
        self.with_connection(|connection| {
            let mut stmt = connection
                .prepare(&format!("SELECT {MIGRATION_COLUMNS} FROM migrations ORDER BY id"))
                .map_err(|err| map_db_error(&err))?;
            let rows = stmt
                .query_map(params![], map_migration_row)
                .map_err(|err| map_db_error(&err))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|err| map_db_error(&err))?;
            rows.into_iter().map(MigrationRow::into_record).collect()
        })
        .map_err(StoreError::from)
    }

    fn active_migration(&self) -> Result<Option<MigrationRecord>, StoreError> {
        self.with_connection(|connection| {
            connection
                .query_row(
                    &format!(
                        "SELECT {MIGRATION_COLUMNS} FROM migrations WHERE status = ?1 ORDER BY id \
                         LIMIT 1"
                    ),
                    params![MigrationStatus::Active.code()],
                    map_migration_row,
                )
                .optional()
                .map_err(|err| map_db_error(&err))?
                .map(MigrationRow::into_record)
                .transpose()
        })
        .map_err(StoreError::from)
    }

    fn update_status(
        &self,
        id: MigrationId,
        from: MigrationStatus,
        to: MigrationStatus,
    ) -> Result<MigrationRecord, StoreError> {
        self.with_connection(|connection| {
            let tx = connection.transaction().map_err(|err| map_db_error(&err))?;
            let current: Option<i64> = tx
                .query_row(
                    "SELECT status FROM migrations WHERE id = ?1",
                    params![id_to_sql(id.get())?],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|err| map_db_error(&err))?;
            let Some(current) = current else {
                return Err(SqliteStoreError::NotFound(format!("migration {id}")));
            };
            let current = parse_migration_status(current)?;
            if current != from {
                return Err(SqliteStoreError::Conflict(format!(
                    "migration {id} is {current}, expected {from}"
                )));
            }
            tx.execute(
                "UPDATE migrations SET status = ?1 WHERE id = ?2",
                params![to.code(), id_to_sql(id.get())?],
            )
            .map_err(|err| match map_db_error(&err) {
                SqliteStoreError::Conflict(_) => SqliteStoreError::Conflict(format!(
                    "another migration of the same job class is already active or finalizing ({id})"
                )),
                other => other,
            })?;
            let record = query_migration(&tx, id)?
                .ok_or_else(|| SqliteStoreError::NotFound(format!("migration {id}")))?;
            tx.commit().map_err(|err| map_db_error(&err))?;
            Ok(record)
        })
        .map_err(StoreError::from)
    }

    fn set_last_job_started_at(&self, id: MigrationId, at: Timestamp) -> Result<(), StoreError> {
        self.with_connection(|connection| {
            let changed = connection
                .execute(
                    "UPDATE migrations SET last_job_started_at = ?1 WHERE id = ?2",
                    params![at.as_unix_millis(), id_to_sql(id.get())?],
                )
                .map_err(|err| map_db_error(&err))?;
            require_changed(changed, || format!("migration {id}"))
        })
        .map_err(StoreError::from)
    }

    fn set_batch_size(&self, id: MigrationId, batch_size: u64) -> Result<(), StoreError> {
        if batch_size == 0 {
            return Err(StoreError::Invalid("batch_size must be greater than zero".to_string()));
        }
        let batch_size = to_sql_int("batch_size", batch_size)?;
        self.with_connection(|connection| {
            let changed = connection
                .execute(
                    "UPDATE migrations SET batch_size = ?1 WHERE id = ?2",
                    params![batch_size, id_to_sql(id.get())?],
                )
                .map_err(|err| map_db_error(&err))?;
            require_changed(changed, || format!("migration {id}"))
        })
        .map_err(StoreError::from)
    }

    fn delete_migration(&self, id: MigrationId) -> Result<bool, StoreError> {
        self.with_connection(|connection| {
            let changed = connection
                .execute("DELETE FROM migrations WHERE id = ?1", params![id_to_sql(id.get())?])
                .map_err(|err| map_db_error(&err))?;
            Ok(changed > 0)
        })
        .map_err(StoreError::from)
    }

    fn progress_cursor(&self, id: MigrationId) -> Result<Option<i64>, StoreError> {
        self.with_connection(|connection| {
            connection
                .query_row(
                    "SELECT MAX(max_value) FROM jobs WHERE migration_id = ?1 AND status = ?2",
                    params![id_to_sql(id.get())?, JobStatus::Succeeded.code()],
                    |row| row.get::<_, Option<i64>>(0),
                )
                .map_err(|err| map_db_error(&err))
        })
        .map_err(StoreError::from)
    }

    fn unfinished_job_starting_at(
        &self,
        id: MigrationId,
        start: i64,
    ) -> Result<Option<JobRecord>, StoreError> {
        self.with_connection(|connection| {
            connection
                .query_row(
                    &format!(
                        "SELECT {JOB_COLUMNS} FROM jobs WHERE migration_id = ?1 AND min_value = ?2 \
                         AND status <> ?3 ORDER BY id LIMIT 1"
                    ),
                    params![id_to_sql(id.get())?, start, JobStatus::Succeeded.code()],
                    map_job_row,
                )
                .optional()
                .map_err(|err| map_db_error(&err))?
                .map(JobRow::into_record)
                .transpose()
        })
        .map_err(StoreError::from)
    }

    fn create_job(&self, job: NewJob) -> Result<JobRecord, StoreError> {
        let batch_size = to_sql_int("batch_size", job.batch_size)?;
        let sub_batch_size = to_sql_int("sub_batch_size", job.sub_batch_size)?;
        let migration_id = id_to_sql(job.migration_id.get())?;
        let raw_id = self.with_connection(|connection| {
            let tx = connection.transaction().map_err(|err| map_db_error(&err))?;
            let exists: Option<i64> = tx
                .query_row("SELECT id FROM migrations WHERE id = ?1", params![migration_id], |row| {
                    row.get(0)
                })
                .optional()
                .map_err(|err| map_db_error(&err))?;
            if exists.is_none() {
                return Err(SqliteStoreError::NotFound(format!("migration {}", job.migration_id)));
            }
            let attempts = i64::from(job.status == JobStatus::Running);
            tx.execute(
                "INSERT INTO jobs (migration_id, min_value, max_value, batch_size, \
                 sub_batch_size, status, attempts, affected_rows, last_error, started_at, \
                 finished_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, NULL, ?8, NULL)",
                params![
                    migration_id,
                    job.range.start(),
                    job.range.end(),
                    batch_size,
                    sub_batch_size,
                    job.status.code(),
                    attempts,
                    job.started_at.map(Timestamp::as_unix_millis),
                ],
            )
            .map_err(|err| map_db_error(&err))?;
            let raw_id = tx.last_insert_rowid();
            tx.commit().map_err(|err| map_db_error(&err))?;
            Ok(raw_id)
        })?;
        let id = job_id_from_sql(raw_id)?;
        Ok(job.into_record(id))
    }

    fn save_job(&self, job: &JobRecord) -> Result<(), StoreError> {
        let affected_rows = to_sql_int("affected_rows", job.affected_rows)?;
        let batch_size = to_sql_int("batch_size", job.batch_size)?;
        let sub_batch_size = to_sql_int("sub_batch_size", job.sub_batch_size)?;
        self.with_connection(|connection| {
            let changed = connection
                .execute(
                    "UPDATE jobs SET batch_size = ?1, sub_batch_size = ?2, status = ?3, attempts \
                     = ?4, affected_rows = ?5, last_error = ?6, started_at = ?7, finished_at = \
                     ?8 WHERE id = ?9 AND migration_id = ?10",
                    params![
                        batch_size,
                        sub_batch_size,
                        job.status.code(),
                        i64::from(job.attempts),
                        affected_rows,
                        job.last_error,
                        job.started_at.map(Timestamp::as_unix_millis),
                        job.finished_at.map(Timestamp::as_unix_millis),
                        id_to_sql(job.id.get())?,
                        id_to_sql(job.migration_id.get())?,
                    ],
                )
                .map_err(|err| map_db_error(&err))?;
            require_changed(changed, || format!("job {}", job.id))
        })
        .map_err(StoreError::from)
    }

    fn jobs(&self, id: MigrationId) -> Result<Vec<JobRecord>, StoreError> {
        self.with_connection(|connection| {
            query_jobs(
                connection,
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE migration_id = ?1 ORDER BY min_value, \
                     id"
                ),
                id,
                None,
            )
        })
        .map_err(StoreError::from)
    }

    fn recent_succeeded_jobs(
        &self,
        id: MigrationId,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_connection(|connection| {
            query_jobs(
                connection,
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE migration_id = ?1 AND status = {} \
                     ORDER BY finished_at DESC, id DESC LIMIT ?2",
                    JobStatus::Succeeded.code()
                ),
                id,
                Some(limit),
            )
        })
        .map_err(StoreError::from)
    }

    fn reset_failed_jobs(&self, id: MigrationId) -> Result<u64, StoreError> {
        self.with_connection(|connection| {
            let changed = connection
                .execute(
                    "UPDATE jobs SET attempts = 0 WHERE migration_id = ?1 AND status = ?2",
                    params![id_to_sql(id.get())?, JobStatus::Failed.code()],
                )
                .map_err(|err| map_db_error(&err))?;
            Ok(u64::try_from(changed).unwrap_or(u64::MAX))
        })
        .map_err(StoreError::from)
    }
}

// ============================================================================
// SECTION: Row Mapping
// ============================================================================

/// Raw migration row as stored.
struct MigrationRow {
    /// Row identifier.
    id: i64,
    /// Job class name.
    job_class_name: String,
    /// Target table.
    table_name: String,
    /// Key column.
    column_name: String,
    /// JSON-encoded job arguments.
    job_arguments: String,
    /// First key.
    min_value: i64,
    /// Last key.
    max_value: i64,
    /// Keys per batch.
    batch_size: i64,
    /// Keys per sub-batch.
    sub_batch_size: i64,
    /// Interval in seconds.
    interval_seconds: i64,
    /// Status code.
    status: i64,
    /// Last batch start (unix millis).
    last_job_started_at: Option<i64>,
    /// Creation time (unix millis).
    created_at: i64,
}

/// Maps a `SELECT {MIGRATION_COLUMNS}` row.
fn map_migration_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MigrationRow> {
    Ok(MigrationRow {
        id: row.get(0)?,
        job_class_name: row.get(1)?,
        table_name: row.get(2)?,
        column_name: row.get(3)?,
        job_arguments: row.get(4)?,
        min_value: row.get(5)?,
        max_value: row.get(6)?,
        batch_size: row.get(7)?,
        sub_batch_size: row.get(8)?,
        interval_seconds: row.get(9)?,
        status: row.get(10)?,
        last_job_started_at: row.get(11)?,
        created_at: row.get(12)?,
    })
}

impl MigrationRow {
    /// Validates the row and converts it to a record.
    fn into_record(self) -> Result<MigrationRecord, SqliteStoreError> {
        let job_arguments: Vec<Value> = serde_json::from_str(&self.job_arguments)
            .map_err(|err| SqliteStoreError::Corrupt(format!("job_arguments: {err}")))?;
        if self.min_value > self.max_value {
            return Err(SqliteStoreError::Corrupt(format!(
                "migration {} has min_value > max_value",
                self.id
            )));
        }
        Ok(MigrationRecord {
            id: migration_id_from_sql(self.id)?,
            job_class_name: self.job_class_name.into(),
            table_name: self.table_name,
            column_name: self.column_name,
            job_arguments,
            min_value: self.min_value,
            max_value: self.max_value,
            batch_size: from_sql_int("batch_size", self.batch_size)?,
            sub_batch_size: from_sql_int("sub_batch_size", self.sub_batch_size)?,
            interval_secs: from_sql_int("interval_seconds", self.interval_seconds)?,
            status: parse_migration_status(self.status)?,
            last_job_started_at: self.last_job_started_at.map(Timestamp::from_unix_millis),
            created_at: Timestamp::from_unix_millis(self.created_at),
        })
    }
}

/// Raw job row as stored.
struct JobRow {
    /// Row identifier.
    id: i64,
    /// Owning migration.
    migration_id: i64,
    /// First key.
    min_value: i64,
    /// Last key.
    max_value: i64,
    /// Keys per batch.
    batch_size: i64,
    /// Keys per sub-batch.
    sub_batch_size: i64,
    /// Status code.
    status: i64,
    /// Attempt count.
    attempts: i64,
    /// Affected row count.
    affected_rows: i64,
    /// Last failure message.
    last_error: Option<String>,
    /// Latest attempt start (unix millis).
    started_at: Option<i64>,
    /// Latest attempt end (unix millis).
    finished_at: Option<i64>,
}

/// Maps a `SELECT {JOB_COLUMNS}` row.
fn map_job_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRow> {
    Ok(JobRow {
        id: row.get(0)?,
        migration_id: row.get(1)?,
        min_value: row.get(2)?,
        max_value: row.get(3)?,
        batch_size: row.get(4)?,
        sub_batch_size: row.get(5)?,
        status: row.get(6)?,
        attempts: row.get(7)?,
        affected_rows: row.get(8)?,
        last_error: row.get(9)?,
        started_at: row.get(10)?,
        finished_at: row.get(11)?,
    })
}

impl JobRow {
    /// Validates the row and converts it to a record.
    fn into_record(self) -> Result<JobRecord, SqliteStoreError> {
        if self.min_value > self.max_value {
            return Err(SqliteStoreError::Corrupt(format!(
                "job {} has min_value > max_value",
                self.id
            )));
        }
        let status = JobStatus::from_code(self.status).ok_or_else(|| {
            SqliteStoreError::Corrupt(format!("unknown job status code: {}", self.status))
        })?;
        let attempts = u32::try_from(self.attempts)
            .map_err(|_| SqliteStoreError::Corrupt(format!("job {} attempts out of range", self.id)))?;
        Ok(JobRecord {
            id: job_id_from_sql(self.id)?,
            migration_id: migration_id_from_sql(self.migration_id)?,
            min_value: self.min_value,
            max_value: self.max_value,
            batch_size: from_sql_int("batch_size", self.batch_size)?,
            sub_batch_size: from_sql_int("sub_batch_size", self.sub_batch_size)?,
            status,
            attempts,
            affected_rows: from_sql_int("affected_rows", self.affected_rows)?,
            last_error: self.last_error,
            started_at: self.started_at.map(Timestamp::from_unix_millis),
            finished_at: self.finished_at.map(Timestamp::from_unix_millis),
        })
    }
}

/// Loads one migration by id.
fn query_migration(
    connection: &Connection,
    id: MigrationId,
) -> Result<Option<MigrationRecord>, SqliteStoreError> {
    connection
        .query_row(
            &format!("SELECT {MIGRATION_COLUMNS} FROM migrations WHERE id = ?1"),
            params![id_to_sql(id.get())?],
            map_migration_row,
        )
        .optional()
        .map_err(|err| map_db_error(&err))?
        .map(MigrationRow::into_record)
        .transpose()
}

/// Runs a job query bound to a migration id and an optional limit.
fn query_jobs(
    connection: &Connection,
    sql: &str,
    id: MigrationId,
    limit: Option<i64>,
) -> Result<Vec<JobRecord>, SqliteStoreError> {
    let mut stmt = connection.prepare(sql).map_err(|err| map_db_error(&err))?;
    let migration_id = id_to_sql(id.get())?;
    let rows = match limit {
        Some(limit) => stmt.query_map(params![migration_id, limit], map_job_row),
        None => stmt.query_map(params![migration_id], map_job_row),
    }
    .map_err(|err| map_db_error(&err))?
    .collect::<Result<Vec<_>, _>>()
    .map_err(|err| map_db_error(&err))?;
    rows.into_iter().map(JobRow::into_record).collect()
}

// ============================================================================
// SECTION: Conversions
// ============================================================================

/// Parses a stored migration status code.
fn parse_migration_status(code: i64) -> Result<MigrationStatus, SqliteStoreError> {
    MigrationStatus::from_code(code)
        .ok_or_else(|| SqliteStoreError::Corrupt(format!("unknown migration status code: {code}")))
}

/// Converts an identifier to an `SQLite` integer.
fn id_to_sql(raw: u64) -> Result<i64, SqliteStoreError> {
    i64::try_from(raw).map_err(|_| SqliteStoreError::Invalid(format!("identifier out of range: {raw}")))
}

/// Converts a stored row id to a migration id.
fn migration_id_from_sql(raw: i64) -> Result<MigrationId, SqliteStoreError> {
    u64::try_from(raw)
        .ok()
        .and_then(MigrationId::from_raw)
        .ok_or_else(|| SqliteStoreError::Corrupt(format!("invalid migration id: {raw}")))
}

/// Converts a stored row id to a job id.
fn job_id_from_sql(raw: i64) -> Result<JobId, SqliteStoreError> {
    u64::try_from(raw)
        .ok()
        .and_then(JobId::from_raw)
        .ok_or_else(|| SqliteStoreError::Corrupt(format!("invalid job id: {raw}")))
}

/// Converts an unsigned value to an `SQLite` integer.
fn to_sql_int(field: &str, value: u64) -> Result<i64, SqliteStoreError> {
    i64::try_from(value)
        .map_err(|_| SqliteStoreError::Invalid(format!("{field} out of range: {value}")))
}

/// Converts a stored integer to an unsigned value.
fn from_sql_int(field: &str, value: i64) -> Result<u64, SqliteStoreError> {
    u64::try_from(value)
        .map_err(|_| SqliteStoreError::Corrupt(format!("{field} is negative: {value}")))
}

/// Serializes job arguments with a size limit.
fn encode_arguments(arguments: &[Value]) -> Result<String, SqliteStoreError> {
    let encoded = serde_json::to_string(arguments)
        .map_err(|err| SqliteStoreError::Invalid(format!("job_arguments: {err}")))?;
    if encoded.len() > MAX_JOB_ARGUMENTS_BYTES {
        return Err(SqliteStoreError::TooLarge {
            max_bytes: MAX_JOB_ARGUMENTS_BYTES,
            actual_bytes: encoded.len(),
        });
    }
    Ok(encoded)
}

/// Maps "no row changed" to `NotFound`.
fn require_changed(
    changed: usize,
    describe: impl FnOnce() -> String,
) -> Result<(), SqliteStoreError> {
    if changed == 0 {
        return Err(SqliteStoreError::NotFound(describe()));
    }
    Ok(())
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Validates the path, opens a connection, and initializes the schema.
pub(crate) fn open_store_connection(
    config: &SqliteStoreConfig,
) -> Result<Connection, SqliteStoreError> {
    validate_store_path(&config.path)?;
    ensure_parent_dir(&config.path)?;
    let mut connection = open_connection(config)?;
    initialize_schema(&mut connection)?;
    Ok(connection)
}

/// Ensures the parent directory for the store exists.
fn ensure_parent_dir(path: &Path) -> Result<(), SqliteStoreError> {
    let Some(parent) = path.parent() else {
        return Err(SqliteStoreError::Io("store path missing parent directory".to_string()));
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }
    std::fs::create_dir_all(parent).map_err(|err| SqliteStoreError::Io(err.to_string()))
}

/// Validates store paths for safety limits.
pub(crate) fn validate_store_path(path: &Path) -> Result<(), SqliteStoreError> {
    if path.as_os_str().is_empty() {
        return Err(SqliteStoreError::Invalid("store path must not be empty".to_string()));
    }
    let path_string = path.display().to_string();
    if path_string.len() > MAX_TOTAL_PATH_LENGTH {
        return Err(SqliteStoreError::Invalid("store path exceeds length limit".to_string()));
    }
    for component in path.components() {
        let name = component.as_os_str().to_string_lossy();
        if name.len() > MAX_PATH_COMPONENT_LENGTH {
            return Err(SqliteStoreError::Invalid(
                "store path contains an overlong component".to_string(),
            ));
        }
    }
    if path.exists() && path.is_dir() {
        return Err(SqliteStoreError::Invalid(
            "store path must be a file, not a directory".to_string(),
        ));
    }
    Ok(())
}

/// Opens an `SQLite` connection with secure defaults.
pub(crate) fn open_connection(config: &SqliteStoreConfig) -> Result<Connection, SqliteStoreError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
    let connection = Connection::open_with_flags(&config.path, flags)
        .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
    apply_pragmas(&connection, config)?;
    Ok(connection)
}

/// Applies `SQLite` pragmas required for durability.
fn apply_pragmas(
    connection: &Connection,
    config: &SqliteStoreConfig,
) -> Result<(), SqliteStoreError> {
    connection
        .execute_batch("PRAGMA foreign_keys = ON;")
        .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
    connection
        .execute_batch(&format!("PRAGMA journal_mode = {};", config.journal_mode.pragma_value()))
        .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
    connection
        .execute_batch(&format!("PRAGMA synchronous = {};", config.sync_mode.pragma_value()))
        .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
    connection
        .busy_timeout(Duration::from_millis(config.busy_timeout_ms))
        .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
    Ok(())
}

/// Initializes the `SQLite` schema or validates the existing version.
fn initialize_schema(connection: &mut Connection) -> Result<(), SqliteStoreError> {
    let tx = connection.transaction().map_err(|err| SqliteStoreError::Db(err.to_string()))?;
    tx.execute_batch("CREATE TABLE IF NOT EXISTS store_meta (version INTEGER NOT NULL);")
        .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
    let version: Option<i64> = tx
        .query_row("SELECT version FROM store_meta LIMIT 1", params![], |row| row.get(0))
        .optional()
        .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
    match version {
        None => {
            tx.execute("INSERT INTO store_meta (version) VALUES (?1)", params![SCHEMA_VERSION])
                .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
            tx.execute_batch(
                "CREATE TABLE IF NOT EXISTS migrations (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    job_class_name TEXT NOT NULL,
                    table_name TEXT NOT NULL,
                    column_name TEXT NOT NULL,
                    job_arguments TEXT NOT NULL,
                    min_value INTEGER NOT NULL,
                    max_value INTEGER NOT NULL,
                    batch_size INTEGER NOT NULL CHECK (batch_size > 0),
                    sub_batch_size INTEGER NOT NULL CHECK (sub_batch_size > 0),
                    interval_seconds INTEGER NOT NULL,
                    status INTEGER NOT NULL,
                    last_job_started_at INTEGER,
                    created_at INTEGER NOT NULL
                );
                CREATE UNIQUE INDEX IF NOT EXISTS idx_migrations_one_in_flight
                    ON migrations (job_class_name) WHERE status IN (1, 5);
                CREATE INDEX IF NOT EXISTS idx_migrations_status
                    ON migrations (status, id);
                CREATE TABLE IF NOT EXISTS jobs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    migration_id INTEGER NOT NULL,
                    min_value INTEGER NOT NULL,
                    max_value INTEGER NOT NULL,
                    batch_size INTEGER NOT NULL,
                    sub_batch_size INTEGER NOT NULL,
                    status INTEGER NOT NULL,
                    attempts INTEGER NOT NULL,
                    affected_rows INTEGER NOT NULL,
                    last_error TEXT,
                    started_at INTEGER,
                    finished_at INTEGER,
                    FOREIGN KEY (migration_id) REFERENCES migrations(id) ON DELETE CASCADE
                );
                CREATE INDEX IF NOT EXISTS idx_jobs_migration_range
                    ON jobs (migration_id, min_value);
                CREATE INDEX IF NOT EXISTS idx_jobs_migration_status
                    ON jobs (migration_id, status, max_value);
                CREATE TABLE IF NOT EXISTS leases (
                    lease_key TEXT PRIMARY KEY,
                    token TEXT NOT NULL,
                    expires_at INTEGER NOT NULL
                );",
            )
            .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
        }
        Some(value) if value == SCHEMA_VERSION => {}
        Some(value) => {
            return Err(SqliteStoreError::VersionMismatch(format!(
                "unsupported schema version: {value}"
            )));
        }
    }
    tx.commit().map_err(|err| SqliteStoreError::Db(err.to_string()))?;
    Ok(())
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_arguments_are_rejected() {
        let big = vec![Value::String("x".repeat(MAX_JOB_ARGUMENTS_BYTES))];
        assert!(matches!(encode_arguments(&big), Err(SqliteStoreError::TooLarge { .. })));
        assert_eq!(encode_arguments(&[]).ok().as_deref(), Some("[]"));
    }

    #[test]
    fn negative_sizes_are_corruption() {
        assert!(matches!(from_sql_int("batch_size", -1), Err(SqliteStoreError::Corrupt(_))));
        assert_eq!(from_sql_int("batch_size", 7), Ok(7));
    }
}
