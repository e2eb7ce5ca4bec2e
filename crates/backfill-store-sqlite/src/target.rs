// crates/backfill-store-sqlite/src/target.rs
// ============================================================================
// Module: SQLite Target Tables
// Description: Built-in units of work that mutate rows in SQLite tables.
// Purpose: Let operators run column backfills without writing Rust code.
// Dependencies: backfill-core, rusqlite, serde_json
// ============================================================================

//! ## Overview
//! [`SqliteTarget`] is a connection to the database holding the tables being
//! migrated. [`register_builtin_jobs`] adds the `UpdateColumn` job class to a
//! registry. Each sub-batch runs one `UPDATE` bounded by the migration's key
//! column, so re-running a range is idempotent.
//!
//! `UpdateColumn` arguments are `[set_column, value]` or
//! `[set_column, value, where_column, where_value]`. Identifiers must be plain
//! SQL identifiers and are always quoted; values are bound as parameters.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;

use backfill_core::is_plain_identifier;
use backfill_core::runtime::BatchedMigrationJob;
use backfill_core::runtime::JobError;
use backfill_core::runtime::MigrationRegistry;
use backfill_core::runtime::SubBatch;
use rusqlite::Connection;
use rusqlite::params_from_iter;
use rusqlite::types::Value as SqlValue;
use serde_json::Value;

use crate::store::SqliteMigrationStore;
use crate::store::SqliteStoreConfig;
use crate::store::SqliteStoreError;
use crate::store::open_connection;
use crate::store::validate_store_path;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Job class name of the built-in column update.
pub const UPDATE_COLUMN_JOB_CLASS: &str = "UpdateColumn";

// ============================================================================
// SECTION: Target
// ============================================================================

/// Connection to the database whose tables are migrated.
#[derive(Clone)]
pub struct SqliteTarget {
    /// Shared connection guarded by a mutex.
    connection: Arc<Mutex<Connection>>,
}

impl SqliteTarget {
    /// Opens the target database at `path` with default pragmas.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteStoreError`] when the path is unsafe or the database
    /// cannot be opened.
    pub fn open(path: &Path) -> Result<Self, SqliteStoreError> {
        validate_store_path(path)?;
        let connection = open_connection(&SqliteStoreConfig::new(path))?;
        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
        })
    }

    /// Targets tables living in the migration store database itself.
    #[must_use]
    pub fn from_store(store: &SqliteMigrationStore) -> Self {
        Self {
            connection: store.shared_connection(),
        }
    }

    /// Runs `f` with exclusive access to the target connection.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteStoreError::Db`] when the mutex is poisoned, or any
    /// error produced by `f`.
    pub fn with_connection<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, SqliteStoreError>,
    ) -> Result<T, SqliteStoreError> {
        let guard = self
            .connection
            .lock()
            .map_err(|_| SqliteStoreError::Db("sqlite mutex poisoned".to_string()))?;
        f(&guard)
    }
}

/// Registers the built-in `SQLite` job classes against `target`.
pub fn register_builtin_jobs(registry: &mut MigrationRegistry, target: &SqliteTarget) {
    let connection = Arc::clone(&target.connection);
    registry.register(UPDATE_COLUMN_JOB_CLASS, move |arguments| {
        let job = UpdateColumnJob::from_arguments(Arc::clone(&connection), arguments)?;
        Ok(Box::new(job) as Box<dyn BatchedMigrationJob>)
    });
}

// ============================================================================
// SECTION: UpdateColumn
// ============================================================================

/// Sets one column to a constant for every row in the sub-batch.
struct UpdateColumnJob {
    /// Target connection.
    connection: Arc<Mutex<Connection>>,
    /// Quoted column to assign.
    set_column: String,
    /// Value assigned.
    value: SqlValue,
    /// Optional quoted equality filter.
    filter: Option<(String, SqlValue)>,
}

impl UpdateColumnJob {
    /// Parses `[set_column, value]` or `[set_column, value, where_column, where_value]`.
    fn from_arguments(
        connection: Arc<Mutex<Connection>>,
        arguments: &[Value],
    ) -> Result<Self, String> {
        let (set_column, value, filter) = match arguments {
            [set_column, value] => (set_column, value, None),
            [set_column, value, where_column, where_value] => {
                (set_column, value, Some((where_column, where_value)))
            }
            _ => {
                return Err(format!(
                    "expected [set_column, value] or [set_column, value, where_column, \
                     where_value], got {} arguments",
                    arguments.len()
                ));
            }
        };
        let filter = match filter {
            Some((column, value)) => Some((column_argument(column)?, sql_value(value)?)),
            None => None,
        };
        Ok(Self {
            connection,
            set_column: column_argument(set_column)?,
            value: sql_value(value)?,
            filter,
        })
    }
}

impl BatchedMigrationJob for UpdateColumnJob {
    fn execute(&self, sub_batch: &SubBatch<'_>) -> Result<u64, JobError> {
        let table = quote_table(sub_batch.table_name)
            .ok_or_else(|| JobError::Execution(format!("invalid table: {}", sub_batch.table_name)))?;
        let key = quote_identifier(sub_batch.column_name).ok_or_else(|| {
            JobError::Execution(format!("invalid key column: {}", sub_batch.column_name))
        })?;
        let mut sql =
            format!("UPDATE {table} SET {} = ?1 WHERE {key} BETWEEN ?2 AND ?3", self.set_column);
        let mut bound = vec![
            self.value.clone(),
            SqlValue::Integer(sub_batch.range.start()),
            SqlValue::Integer(sub_batch.range.end()),
        ];
        if let Some((column, value)) = &self.filter {
            sql.push_str(&format!(" AND {column} = ?4"));
            bound.push(value.clone());
        }
        let connection = self
            .connection
            .lock()
            .map_err(|_| JobError::Execution("sqlite mutex poisoned".to_string()))?;
        let changed = connection
            .execute(&sql, params_from_iter(bound))
            .map_err(|err| JobError::Execution(err.to_string()))?;
        Ok(u64::try_from(changed).unwrap_or(u64::MAX))
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Parses and quotes a column-name argument.
fn column_argument(value: &Value) -> Result<String, String> {
    value
        .as_str()
        .and_then(quote_identifier)
        .ok_or_else(|| format!("column arguments must be plain identifiers, got {value}"))
}

/// Converts a JSON scalar to a bindable `SQLite` value.
fn sql_value(value: &Value) -> Result<SqlValue, String> {
    match value {
        Value::Null => Ok(SqlValue::Null),
        Value::Bool(flag) => Ok(SqlValue::Integer(i64::from(*flag))),
        Value::Number(number) => number
            .as_i64()
            .map(SqlValue::Integer)
            .or_else(|| number.as_f64().map(SqlValue::Real))
            .ok_or_else(|| format!("unsupported number: {number}")),
        Value::String(text) => Ok(SqlValue::Text(text.clone())),
        Value::Array(_) | Value::Object(_) => Err(format!("values must be scalars, got {value}")),
    }
}

/// Quotes a plain identifier.
fn quote_identifier(name: &str) -> Option<String> {
    is_plain_identifier(name).then(|| format!("\"{name}\""))
}

/// Quotes a table name, optionally schema-qualified.
fn quote_table(name: &str) -> Option<String> {
    match name.split_once('.') {
        Some((schema, table)) => Some(format!("{}.{}", quote_identifier(schema)?, quote_identifier(table)?)),
        None => quote_identifier(name),
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
