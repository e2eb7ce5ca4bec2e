// crates/backfill-core/src/interfaces/mod.rs
// ============================================================================
// Module: Backfill Interfaces
// Description: Backend-agnostic interfaces for storage, leasing, and time.
// Purpose: Define the contract surfaces the migration runtime depends on.
// Dependencies: crate::core, rand, thiserror
// ============================================================================

//! ## Overview
//! Interfaces define how the migration runtime integrates with its
//! collaborators without embedding backend-specific details:
//!
//! - [`MigrationStore`] persists migrations and their jobs and enforces the
//!   one-active-migration-per-job-class invariant.
//! - [`LeaseProvider`] hands out named, time-bounded exclusive leases.
//! - [`Clock`], [`FeatureToggle`], and [`IntervalJitter`] are injected so the
//!   worker can be driven deterministically in tests.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::core::JobRecord;
use crate::core::MigrationId;
use crate::core::MigrationRecord;
use crate::core::MigrationStatus;
use crate::core::NewJob;
use crate::core::NewMigration;
use crate::core::Timestamp;

// ============================================================================
// SECTION: Migration Store
// ============================================================================

/// Migration store errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Store I/O error.
    #[error("store io error: {0}")]
    Io(String),
    /// Store backend error.
    #[error("store error: {0}")]
    Store(String),
    /// Stored data is corrupt.
    #[error("store corruption: {0}")]
    Corrupt(String),
    /// Store schema version mismatch.
    #[error("store version mismatch: {0}")]
    VersionMismatch(String),
    /// Invalid input or stored data.
    #[error("invalid store data: {0}")]
    Invalid(String),
    /// Write conflicts with current state (uniqueness or compare-and-set).
    #[error("store conflict: {0}")]
    Conflict(String),
    /// Referenced record does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

/// Persistence for migrations and their job records.
///
/// Implementations must reject any write that would leave two migrations of
/// the same job class `active` at once.
pub trait MigrationStore {
    /// Persists a new migration and returns the stored record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] when an active migration for the same
    /// job class exists and the new one is created active.
    fn create_migration(
        &self,
        migration: NewMigration,
        created_at: Timestamp,
    ) -> Result<MigrationRecord, StoreError>;

    /// Loads a migration by identifier.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store cannot be read.
    fn migration(&self, id: MigrationId) -> Result<Option<MigrationRecord>, StoreError>;

    /// Lists every migration ordered by identifier.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store cannot be read.
    fn list_migrations(&self) -> Result<Vec<MigrationRecord>, StoreError>;

    /// Returns the oldest `active` migration, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store cannot be read.
    fn active_migration(&self) -> Result<Option<MigrationRecord>, StoreError>;

    /// Moves a migration from `from` to `to` atomically.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for unknown migrations and
    /// [`StoreError::Conflict`] when the current status is not `from` or the
    /// transition would violate active uniqueness.
    fn update_status(
        &self,
        id: MigrationId,
        from: MigrationStatus,
        to: MigrationStatus,
    ) -> Result<MigrationRecord, StoreError>;

    /// Records when the most recent batch of a migration started.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the migration is missing or the write fails.
    fn set_last_job_started_at(&self, id: MigrationId, at: Timestamp) -> Result<(), StoreError>;

    /// Updates the batch size used for future batches.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the migration is missing or the write fails.
    fn set_batch_size(&self, id: MigrationId, batch_size: u64) -> Result<(), StoreError>;

    /// Deletes a migration and all of its jobs. Returns false when absent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the write fails.
    fn delete_migration(&self, id: MigrationId) -> Result<bool, StoreError>;

    /// Returns the highest `max_value` covered by a succeeded job.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store cannot be read.
    fn progress_cursor(&self, id: MigrationId) -> Result<Option<i64>, StoreError>;

    /// Returns a non-succeeded job whose range starts at `start`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store cannot be read.
    fn unfinished_job_starting_at(
        &self,
        id: MigrationId,
        start: i64,
    ) -> Result<Option<JobRecord>, StoreError>;

    /// Persists a new job record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when the migration does not exist.
    fn create_job(&self, job: NewJob) -> Result<JobRecord, StoreError>;

    /// Overwrites a job record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when the job does not exist.
    fn save_job(&self, job: &JobRecord) -> Result<(), StoreError>;

    /// Lists the jobs of a migration ordered by `min_value`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store cannot be read.
    fn jobs(&self, id: MigrationId) -> Result<Vec<JobRecord>, StoreError>;

    /// Returns up to `limit` succeeded jobs, most recently finished first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store cannot be read.
    fn recent_succeeded_jobs(
        &self,
        id: MigrationId,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StoreError>;

    /// Resets the attempt counter of every failed job. Returns the number reset.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the write fails.
    fn reset_failed_jobs(&self, id: MigrationId) -> Result<u64, StoreError>;
}

// ============================================================================
// SECTION: Leases
// ============================================================================

/// Lease backend errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LeaseError {
    /// Lease backend reported an error.
    #[error("lease backend error: {0}")]
    Backend(String),
}

/// Opaque proof of lease ownership.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseToken(String);

impl LeaseToken {
    /// Wraps an existing token value.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Generates a fresh random token.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("{:032x}", rand::random::<u128>()))
    }

    /// Returns the token as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Named, time-bounded exclusive leases shared by every worker process.
pub trait LeaseProvider {
    /// Attempts to take the lease `key` for `ttl` without waiting.
    ///
    /// Returns `None` when another holder has an unexpired lease. Expired
    /// leases may be taken over.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError`] when the backend cannot be reached.
    fn try_obtain(
        &self,
        key: &str,
        ttl: Duration,
        now: Timestamp,
    ) -> Result<Option<LeaseToken>, LeaseError>;

    /// Releases the lease if `token` still owns it. Returns true when released.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError`] when the backend cannot be reached.
    fn cancel(&self, key: &str, token: &LeaseToken) -> Result<bool, LeaseError>;
}

// ============================================================================
// SECTION: Time, Toggles, Jitter
// ============================================================================

/// Source of the current time.
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> Timestamp;
}

/// Runtime feature toggles.
pub trait FeatureToggle: Send + Sync {
    /// Returns true when `flag` is enabled.
    fn is_enabled(&self, flag: &str) -> bool;
}

/// Source of interval variance.
pub trait IntervalJitter: Send + Sync {
    /// Returns a duration within `[0, max]`.
    fn sample(&self, max: Duration) -> Duration;
}
