// crates/backfill-core/src/runtime/admin.rs
// ============================================================================
// Module: Backfill Operator Actions
// Description: Create, pause, resume, retry, delete, and inspect migrations.
// Purpose: Apply validated lifecycle transitions on behalf of operators.
// Dependencies: crate::core, crate::interfaces, serde, thiserror
// ============================================================================

//! ## Overview
//! Operator actions never execute batches; they only move migrations through
//! the status machine and report progress. Every transition is checked
//! against [`MigrationStatus::can_transition_to`] and applied with a
//! compare-and-set so concurrent operators cannot clobber each other.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Serialize;
use thiserror::Error;

use crate::core::JobStatus;
use crate::core::MigrationError;
use crate::core::MigrationId;
use crate::core::MigrationRecord;
use crate::core::MigrationStatus;
use crate::core::NewMigration;
use crate::interfaces::Clock;
use crate::interfaces::MigrationStore;
use crate::interfaces::StoreError;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Operator action errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdminError {
    /// Store access failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The definition or transition is invalid.
    #[error(transparent)]
    Migration(#[from] MigrationError),
    /// The migration does not exist.
    #[error("migration {0} not found")]
    NotFound(MigrationId),
}

// ============================================================================
// SECTION: Progress
// ============================================================================

/// Progress report for one migration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationProgress {
    /// Migration identifier.
    pub migration_id: MigrationId,
    /// Current status.
    pub status: MigrationStatus,
    /// Keys in the migration range.
    pub total_keys: u64,
    /// Keys covered by succeeded jobs.
    pub covered_keys: u64,
    /// Covered share of the range, in percent with two decimals.
    pub percent_complete: f64,
    /// Highest key covered by a succeeded job.
    pub cursor: Option<i64>,
    /// Jobs recorded but not started.
    pub jobs_pending: u64,
    /// Jobs running (or interrupted).
    pub jobs_running: u64,
    /// Jobs that succeeded.
    pub jobs_succeeded: u64,
    /// Jobs whose latest attempt failed.
    pub jobs_failed: u64,
}

/// Returns `covered / total` as a percentage rounded down to two decimals.
fn percent(covered: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let basis_points = u128::from(covered) * 10_000 / u128::from(total);
    f64::from(u32::try_from(basis_points).unwrap_or(10_000)) / 100.0
}

// ============================================================================
// SECTION: Operator Actions
// ============================================================================

/// Lifecycle operations over a migration store.
pub struct MigrationAdmin<'a, S: MigrationStore> {
    /// Migration persistence.
    store: &'a S,
    /// Creation timestamp source.
    clock: &'a dyn Clock,
}

impl<'a, S: MigrationStore> MigrationAdmin<'a, S> {
    /// Creates operator actions over `store`.
    #[must_use]
    pub const fn new(store: &'a S, clock: &'a dyn Clock) -> Self {
        Self {
            store,
            clock,
        }
    }

    /// Validates and persists a new migration.
    ///
    /// # Errors
    ///
    /// Returns [`AdminError::Migration`] for invalid definitions and
    /// [`AdminError::Store`] when an active migration of the same job class
    /// already exists.
    pub fn create(&self, migration: NewMigration) -> Result<MigrationRecord, AdminError> {
        migration.validate()?;
        Ok(self.store.create_migration(migration, self.clock.now())?)
    }

    /// Loads a migration that must exist.
    ///
    /// # Errors
    ///
    /// Returns [`AdminError::NotFound`] for unknown migrations.
    pub fn show(&self, id: MigrationId) -> Result<MigrationRecord, AdminError> {
        self.store.migration(id)?.ok_or(AdminError::NotFound(id))
    }

    /// Lists every migration.
    ///
    /// # Errors
    ///
    /// Returns [`AdminError::Store`] when the store cannot be read.
    pub fn list(&self) -> Result<Vec<MigrationRecord>, AdminError> {
        Ok(self.store.list_migrations()?)
    }

    /// Stops the worker from picking up an active migration.
    ///
    /// # Errors
    ///
    /// Returns [`AdminError::Migration`] unless the migration is `active`.
    pub fn pause(&self, id: MigrationId) -> Result<MigrationRecord, AdminError> {
        self.transition(id, MigrationStatus::Paused)
    }

    /// Makes a paused migration eligible for the worker again.
    ///
    /// # Errors
    ///
    /// Returns [`AdminError::Migration`] unless the migration is `paused`, and
    /// [`AdminError::Store`] when another migration of the class is active.
    pub fn resume(&self, id: MigrationId) -> Result<MigrationRecord, AdminError> {
        let current = self.show(id)?;
        if current.status != MigrationStatus::Paused {
            return Err(MigrationError::IllegalTransition {
                from: current.status,
                to: MigrationStatus::Active,
            }
            .into());
        }
        self.transition(id, MigrationStatus::Active)
    }

    /// Reactivates a failed migration and resets its failed jobs' attempts.
    ///
    /// # Errors
    ///
    /// Returns [`AdminError::Migration`] unless the migration is `failed`.
    pub fn retry(&self, id: MigrationId) -> Result<MigrationRecord, AdminError> {
        let current = self.show(id)?;
        if current.status != MigrationStatus::Failed {
            return Err(MigrationError::IllegalTransition {
                from: current.status,
                to: MigrationStatus::Active,
            }
            .into());
        }
        self.store.reset_failed_jobs(id)?;
        Ok(self.store.update_status(id, MigrationStatus::Failed, MigrationStatus::Active)?)
    }

    /// Deletes a migration and its jobs. Returns false when it did not exist.
    ///
    /// # Errors
    ///
    /// Returns [`AdminError::Store`] when the delete fails.
    pub fn delete(&self, id: MigrationId) -> Result<bool, AdminError> {
        Ok(self.store.delete_migration(id)?)
    }

    /// Reports covered keys and job counts.
    ///
    /// # Errors
    ///
    /// Returns [`AdminError::NotFound`] for unknown migrations.
    pub fn progress(&self, id: MigrationId) -> Result<MigrationProgress, AdminError> {
        let migration = self.show(id)?;
        let jobs = self.store.jobs(id)?;
        let total_keys = migration.key_range().map_or(0, |range| range.len());
        let mut progress = MigrationProgress {
            migration_id: id,
            status: migration.status,
            total_keys,
            covered_keys: 0,
            percent_complete: 0.0,
            cursor: self.store.progress_cursor(id)?,
            jobs_pending: 0,
            jobs_running: 0,
            jobs_succeeded: 0,
            jobs_failed: 0,
        };
        for job in &jobs {
            match job.status {
                JobStatus::Pending => progress.jobs_pending += 1,
                JobStatus::Running => progress.jobs_running += 1,
                JobStatus::Failed => progress.jobs_failed += 1,
                JobStatus::Succeeded => {
                    progress.jobs_succeeded += 1;
                    let keys = job.range().map_or(0, |range| range.len());
                    progress.covered_keys = progress.covered_keys.saturating_add(keys);
                }
            }
        }
        progress.percent_complete = percent(progress.covered_keys, total_keys);
        Ok(progress)
    }

    /// Applies a validated compare-and-set transition.
    fn transition(
        &self,
        id: MigrationId,
        to: MigrationStatus,
    ) -> Result<MigrationRecord, AdminError> {
        let current = self.show(id)?;
        if !current.status.can_transition_to(to) {
            return Err(MigrationError::IllegalTransition {
                from: current.status,
                to,
            }
            .into());
        }
        Ok(self.store.update_status(id, current.status, to)?)
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::percent;

    #[test]
    fn percent_rounds_down_to_two_decimals() {
        assert!((percent(1, 3) - 33.33).abs() < f64::EPSILON * 100.0);
        assert!((percent(50, 50) - 100.0).abs() < f64::EPSILON);
        assert!(percent(0, 0).abs() < f64::EPSILON);
    }
}
