// crates/backfill-core/src/runtime/store.rs
// ============================================================================
// Module: Backfill In-Memory Store
// Description: In-memory migration store for tests, demos, and embedding.
// Purpose: Provide a deterministic MigrationStore without external deps.
// Dependencies: crate::core, crate::interfaces
// ============================================================================

//! ## Overview
//! This module provides a simple in-memory implementation of
//! [`MigrationStore`]. Clones share state, so several workers in one process
//! can observe the same migrations. It is not durable across restarts.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use crate::core::JobClassName;
use crate::core::JobId;
use crate::core::JobRecord;
use crate::core::JobStatus;
use crate::core::MigrationId;
use crate::core::MigrationRecord;
use crate::core::MigrationStatus;
use crate::core::NewJob;
use crate::core::NewMigration;
use crate::core::Timestamp;
use crate::interfaces::MigrationStore;
use crate::interfaces::StoreError;

// ============================================================================
// SECTION: In-Memory Store
// ============================================================================

/// Mutable store contents.
#[derive(Debug, Default)]
struct StoreState {
    /// Last assigned migration id.
    last_migration_id: u64,
    /// Last assigned job id.
    last_job_id: u64,
    /// Migrations keyed by id.
    migrations: BTreeMap<MigrationId, MigrationRecord>,
    /// Jobs keyed by id.
    jobs: BTreeMap<JobId, JobRecord>,
}

impl StoreState {
    /// Returns true when another migration of `job_class` is active or finalizing.
    fn has_in_flight(&self, job_class: &JobClassName, except: Option<MigrationId>) -> bool {
        self.migrations.values().any(|migration| {
            migration.status.is_in_flight()
                && &migration.job_class_name == job_class
                && Some(migration.id) != except
        })
    }

    /// Returns a mutable migration or `NotFound`.
    fn migration_mut(&mut self, id: MigrationId) -> Result<&mut MigrationRecord, StoreError> {
        self.migrations
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("migration {id}")))
    }

    /// Iterates the jobs of one migration.
    fn jobs_of(&self, id: MigrationId) -> impl Iterator<Item = &JobRecord> {
        self.jobs.values().filter(move |job| job.migration_id == id)
    }
}

/// In-memory migration store.
#[derive(Debug, Default, Clone)]
pub struct InMemoryMigrationStore {
    /// Store contents protected by a mutex.
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryMigrationStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks the store state.
    fn lock(&self) -> Result<MutexGuard<'_, StoreState>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Store("migration store mutex poisoned".to_string()))
    }
}

impl MigrationStore for InMemoryMigrationStore {
    fn create_migration(
        &self,
        migration: NewMigration,
        created_at: Timestamp,
    ) -> Result<MigrationRecord, StoreError> {
        migration.validate().map_err(|err| StoreError::Invalid(err.to_string()))?;
        let mut state = self.lock()?;
        if migration.status.is_in_flight()
            && state.has_in_flight(&migration.job_class_name, None)
        {
            return Err(StoreError::Conflict(format!(
                "an active or finalizing migration already exists for {}",
                migration.job_class_name
            )));
        }
        let next = state.last_migration_id + 1;
        let id = MigrationId::from_raw(next)
            .ok_or_else(|| StoreError::Corrupt("migration id overflow".to_string()))?;
        state.last_migration_id = next;
        let record = migration.into_record(id, created_at);
        state.migrations.insert(id, record.clone());
        Ok(record)
    }

    fn migration(&self, id: MigrationId) -> Result<Option<MigrationRecord>, StoreError> {
        Ok(self.lock()?.migrations.get(&id).cloned())
    }

    fn list_migrations(&self) -> Result<Vec<MigrationRecord>, StoreError> {
        Ok(self.lock()?.migrations.values().cloned().collect())
    }

    fn active_migration(&self) -> Result<Option<MigrationRecord>, StoreError> {
        Ok(self
            .lock()?
            .migrations
            .values()
            .find(|migration| migration.status == MigrationStatus::Active)
            .cloned())
    }

    fn update_status(
        &self,
        id: MigrationId,
        from: MigrationStatus,
        to: MigrationStatus,
    ) -> Result<MigrationRecord, StoreError> {
        let mut state = self.lock()?;
        let (current, job_class) = {
            let migration = state.migration_mut(id)?;
            (migration.status, migration.job_class_name.clone())
        };
        if current != from {
            return Err(StoreError::Conflict(format!(
                "migration {id} is {current}, expected {from}"
            )));
        }
        if to.is_in_flight() && state.has_in_flight(&job_class, Some(id)) {
            return Err(StoreError::Conflict(format!(
                "an active or finalizing migration already exists for {job_class}"
            )));
        }
        let migration = state.migration_mut(id)?;
        migration.status = to;
        Ok(migration.clone())
    }

    fn set_last_job_started_at(&self, id: MigrationId, at: Timestamp) -> Result<(), StoreError> {
        self.lock()?.migration_mut(id)?.last_job_started_at = Some(at);
        Ok(())
    }

    fn set_batch_size(&self, id: MigrationId, batch_size: u64) -> Result<(), StoreError> {
        if batch_size == 0 {
            return Err(StoreError::Invalid("batch_size must be greater than zero".to_string()));
        }
        self.lock()?.migration_mut(id)?.batch_size = batch_size;
        Ok(())
    }

    fn delete_migration(&self, id: MigrationId) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        let removed = state.migrations.remove(&id).is_some();
        state.jobs.retain(|_, job| job.migration_id != id);
        Ok(removed)
    }

    fn progress_cursor(&self, id: MigrationId) -> Result<Option<i64>, StoreError> {
        Ok(self
            .lock()?
            .jobs_of(id)
            .filter(|job| job.status == JobStatus::Succeeded)
            .map(|job| job.max_value)
            .max())
    }

    fn unfinished_job_starting_at(
        &self,
        id: MigrationId,
        start: i64,
    ) -> Result<Option<JobRecord>, StoreError> {
        Ok(self
            .lock()?
            .jobs_of(id)
            .find(|job| job.min_value == start && job.status.is_unfinished())
            .cloned())
    }

    fn create_job(&self, job: NewJob) -> Result<JobRecord, StoreError> {
        let mut state = self.lock()?;
        if !state.migrations.contains_key(&job.migration_id) {
            return Err(StoreError::NotFound(format!("migration {}", job.migration_id)));
        }
        let next = state.last_job_id + 1;
        let id =
            JobId::from_raw(next).ok_or_else(|| StoreError::Corrupt("job id overflow".to_string()))?;
        state.last_job_id = next;
        let record = job.into_record(id);
        state.jobs.insert(id, record.clone());
        Ok(record)
    }

    fn save_job(&self, job: &JobRecord) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let stored =
            state.jobs.get_mut(&job.id).ok_or_else(|| StoreError::NotFound(format!("job {}", job.id)))?;
        if stored.migration_id != job.migration_id {
            return Err(StoreError::Invalid(format!("job {} changed migration", job.id)));
        }
        *stored = job.clone();
        Ok(())
    }

    fn jobs(&self, id: MigrationId) -> Result<Vec<JobRecord>, StoreError> {
        let state = self.lock()?;
        let mut jobs: Vec<JobRecord> = state.jobs_of(id).cloned().collect();
        jobs.sort_by_key(|job| (job.min_value, job.id));
        Ok(jobs)
    }

    fn recent_succeeded_jobs(
        &self,
        id: MigrationId,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let state = self.lock()?;
        let mut jobs: Vec<JobRecord> =
            state.jobs_of(id).filter(|job| job.status == JobStatus::Succeeded).cloned().collect();
        jobs.sort_by(|left, right| {
            right.finished_at.cmp(&left.finished_at).then_with(|| right.id.cmp(&left.id))
        });
        jobs.truncate(limit);
        Ok(jobs)
    }

    fn reset_failed_jobs(&self, id: MigrationId) -> Result<u64, StoreError> {
        let mut state = self.lock()?;
        let mut reset = 0;
        for job in state.jobs.values_mut() {
            if job.migration_id == id && job.status == JobStatus::Failed {
                job.attempts = 0;
                reset += 1;
            }
        }
        Ok(reset)
    }
}
