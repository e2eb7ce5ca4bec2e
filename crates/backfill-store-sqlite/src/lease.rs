// crates/backfill-store-sqlite/src/lease.rs
// ============================================================================
// Module: SQLite Lease Provider
// Description: Cross-process exclusive leases stored in SQLite.
// Purpose: Give every worker process one shared, expiring lock per lease key.
// Dependencies: backfill-core, rusqlite
// ============================================================================

//! ## Overview
//! Leases live in the `leases` table of the migration store database. Taking
//! a lease is a single upsert that only overwrites an expired row, so two
//! processes racing for the same key cannot both succeed. Releasing requires
//! the owner token.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use backfill_core::LeaseError;
use backfill_core::LeaseProvider;
use backfill_core::LeaseToken;
use backfill_core::Timestamp;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rusqlite::params;

use crate::store::SqliteMigrationStore;
use crate::store::SqliteStoreConfig;
use crate::store::SqliteStoreError;
use crate::store::open_store_connection;

// ============================================================================
// SECTION: Provider
// ============================================================================

/// `SQLite`-backed lease provider.
///
/// # Invariants
/// - At most one unexpired row exists per lease key.
/// - A lease row is only replaced once its `expires_at` has passed.
#[derive(Clone)]
pub struct SqliteLeaseProvider {
    /// Shared connection guarded by a mutex.
    connection: Arc<Mutex<Connection>>,
}

impl SqliteLeaseProvider {
    /// Opens a lease provider on its own connection to the store database.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteStoreError`] when the database cannot be opened.
    pub fn open(config: &SqliteStoreConfig) -> Result<Self, SqliteStoreError> {
        let connection = open_store_connection(config)?;
        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
        })
    }

    /// Shares the connection of an already open store.
    #[must_use]
    pub fn from_store(store: &SqliteMigrationStore) -> Self {
        Self {
            connection: store.shared_connection(),
        }
    }

    /// Returns the token currently holding `key`, if unexpired at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError`] when the lease table cannot be read.
    pub fn holder(&self, key: &str, now: Timestamp) -> Result<Option<LeaseToken>, LeaseError> {
        self.with_connection(|connection| {
            connection
                .query_row(
                    "SELECT token FROM leases WHERE lease_key = ?1 AND expires_at > ?2",
                    params![key, now.as_unix_millis()],
                    |row| row.get::<_, String>(0),
                )
                .optional()
                .map(|token| token.map(LeaseToken::new))
                .map_err(backend_error)
        })
    }

    /// Runs `f` with exclusive access to the connection.
    fn with_connection<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, LeaseError>,
    ) -> Result<T, LeaseError> {
        let guard = self
            .connection
            .lock()
            .map_err(|_| LeaseError::Backend("sqlite mutex poisoned".to_string()))?;
        f(&guard)
    }
}

impl LeaseProvider for SqliteLeaseProvider {
    fn try_obtain(
        &self,
        key: &str,
        ttl: Duration,
        now: Timestamp,
    ) -> Result<Option<LeaseToken>, LeaseError> {
        let token = LeaseToken::generate();
        let expires_at = now.saturating_add(ttl).as_unix_millis();
        self.with_connection(|connection| {
            let changed = connection
                .execute(
                    "INSERT INTO leases (lease_key, token, expires_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(lease_key) DO UPDATE SET
                        token = excluded.token,
                        expires_at = excluded.expires_at
                     WHERE leases.expires_at <= ?4",
                    params![key, token.as_str(), expires_at, now.as_unix_millis()],
                )
                .map_err(backend_error)?;
            Ok((changed == 1).then_some(token))
        })
    }

    fn cancel(&self, key: &str, token: &LeaseToken) -> Result<bool, LeaseError> {
        self.with_connection(|connection| {
            let changed = connection
                .execute(
                    "DELETE FROM leases WHERE lease_key = ?1 AND token = ?2",
                    params![key, token.as_str()],
                )
                .map_err(backend_error)?;
            Ok(changed > 0)
        })
    }
}

/// Maps engine errors to lease backend errors.
#[allow(clippy::needless_pass_by_value, reason = "Used directly as a map_err adapter.")]
fn backend_error(err: rusqlite::Error) -> LeaseError {
    LeaseError::Backend(err.to_string())
}
