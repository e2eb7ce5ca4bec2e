// crates/backfill-core/src/runtime/runner.rs
// ============================================================================
// Module: Backfill Migration Runner
// Description: Executes one batch of a migration and records its outcome.
// Purpose: Advance migrations range by range with durable job bookkeeping.
// Dependencies: crate::core, crate::interfaces, crate::runtime, thiserror
// ============================================================================

//! ## Overview
//! The runner turns "run the next batch" into job records. The progress
//! cursor is derived from succeeded jobs, so a batch that failed or was left
//! `running` by a crash is re-attempted over exactly the same range before
//! any new range is chosen. The unit of work is resolved before any job is
//! written; an unknown job class leaves no trace in the store.
//!
//! Callers must hold the worker lease; the runner itself takes no locks.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Serialize;
use thiserror::Error;

use crate::core::JobId;
use crate::core::JobRecord;
use crate::core::JobStatus;
use crate::core::KeyRange;
use crate::core::MigrationError;
use crate::core::MigrationId;
use crate::core::MigrationRecord;
use crate::core::MigrationStatus;
use crate::core::NewJob;
use crate::core::SubBatches;
use crate::interfaces::Clock;
use crate::interfaces::MigrationStore;
use crate::interfaces::StoreError;
use crate::runtime::events::EventScope;
use crate::runtime::events::MigrationEvent;
use crate::runtime::events::MigrationEventKind;
use crate::runtime::events::MigrationEventSink;
use crate::runtime::optimizer::BatchOptimizerConfig;
use crate::runtime::optimizer::optimize_batch_size;
use crate::runtime::registry::JobError;
use crate::runtime::registry::MigrationRegistry;
use crate::runtime::registry::RegistryError;
use crate::runtime::registry::SubBatch;

// ============================================================================
// SECTION: Configuration
// ============================================================================

/// Default attempts allowed per batch before the migration fails.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// How many failed attempts of one batch a migration tolerates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FailurePolicy {
    /// Attempts allowed per batch; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self {
            max_attempts: Some(DEFAULT_MAX_ATTEMPTS),
        }
    }
}

impl FailurePolicy {
    /// Policy that never fails the migration.
    #[must_use]
    pub const fn unlimited() -> Self {
        Self {
            max_attempts: None,
        }
    }

    /// Returns true when a job with `attempts` failed attempts must stop the migration.
    #[must_use]
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

/// Runner tuning.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunnerConfig {
    /// Batch failure handling.
    pub failure_policy: FailurePolicy,
    /// Adaptive batch sizing; disabled when `None`.
    pub optimizer: Option<BatchOptimizerConfig>,
}

// ============================================================================
// SECTION: Outcomes and Errors
// ============================================================================

/// Result of a successful runner invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "job", rename_all = "snake_case")]
pub enum RunOutcome {
    /// The range was exhausted and the migration is now `finished`.
    Finished,
    /// One batch completed.
    BatchSucceeded(JobRecord),
}

/// Runner errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunnerError {
    /// Store access failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The job class could not be resolved.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// A sub-batch failed; the job is recorded as failed.
    #[error("batch {range} (job {job_id}) failed: {source}")]
    BatchExecution {
        /// Failed job.
        job_id: JobId,
        /// Range of the failed batch.
        range: KeyRange,
        /// Unit-of-work failure.
        source: JobError,
    },
    /// The migration definition or transition is invalid.
    #[error(transparent)]
    Migration(#[from] MigrationError),
}

// ============================================================================
// SECTION: Runner
// ============================================================================

/// Executes batches of a migration against a store.
pub struct MigrationRunner<'a, S: MigrationStore> {
    /// Migration and job persistence.
    store: &'a S,
    /// Unit-of-work lookup.
    registry: &'a MigrationRegistry,
    /// Time source for job timestamps.
    clock: &'a dyn Clock,
    /// Event destination.
    events: &'a dyn MigrationEventSink,
    /// Worker identity attached to events.
    scope: &'a EventScope,
    /// Failure and optimizer tuning.
    config: &'a RunnerConfig,
}

impl<'a, S: MigrationStore> MigrationRunner<'a, S> {
    /// Creates a runner over the given collaborators.
    #[must_use]
    pub const fn new(
        store: &'a S,
        registry: &'a MigrationRegistry,
        clock: &'a dyn Clock,
        events: &'a dyn MigrationEventSink,
        scope: &'a EventScope,
        config: &'a RunnerConfig,
    ) -> Self {
        Self {
            store,
            registry,
            clock,
            events,
            scope,
            config,
        }
    }

    /// Runs the next batch of `migration`, or marks it finished when none remains.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::Registry`] before any write when the job class
    /// cannot be resolved, [`RunnerError::BatchExecution`] after recording a
    /// failed job, and [`RunnerError::Store`] when persistence fails.
    pub fn run_migration_job(&self, migration: &MigrationRecord) -> Result<RunOutcome, RunnerError> {
        let batcher = migration.batcher().ok_or_else(|| {
            MigrationError::Invalid(format!(
                "migration {} has min_value > max_value",
                migration.id
            ))
        })?;
        let cursor = self.store.progress_cursor(migration.id)?;
        let Some(start) = batcher.next_start(cursor) else {
            self.finish(migration)?;
            return Ok(RunOutcome::Finished);
        };
        let existing = self.store.unfinished_job_starting_at(migration.id, start)?;
        let range = match &existing {
            Some(job) => job.range(),
            None => batcher.batch_starting_at(start),
        }
        .ok_or_else(|| StoreError::Corrupt(format!("no valid batch starts at {start}")))?;

        let unit_of_work =
            self.registry.resolve(&migration.job_class_name, &migration.job_arguments)?;

        let started_at = self.clock.now();
        let mut job = if let Some(mut job) = existing {
            job.status = JobStatus::Running;
            job.attempts = job.attempts.saturating_add(1);
            job.affected_rows = 0;
            job.last_error = None;
            job.started_at = Some(started_at);
            job.finished_at = None;
            self.store.save_job(&job)?;
            job
        } else {
            self.store.create_job(NewJob {
                migration_id: migration.id,
                range,
                batch_size: migration.batch_size,
                sub_batch_size: migration.sub_batch_size,
                status: JobStatus::Running,
                started_at: Some(started_at),
            })?
        };
        self.store.set_last_job_started_at(migration.id, started_at)?;
        self.emit(
            self.event(MigrationEventKind::BatchStarted, migration).with_job(&job),
        );

        let mut affected_rows = 0_u64;
        for sub_range in SubBatches::new(range, job.sub_batch_size) {
            let sub_batch = SubBatch {
                table_name: &migration.table_name,
                column_name: &migration.column_name,
                range: sub_range,
                job_arguments: &migration.job_arguments,
            };
            match unit_of_work.execute(&sub_batch) {
                Ok(rows) => affected_rows = affected_rows.saturating_add(rows),
                Err(source) => {
                    job.affected_rows = affected_rows;
                    return Err(self.fail_batch(migration, job, range, source));
                }
            }
        }

        job.status = JobStatus::Succeeded;
        job.affected_rows = affected_rows;
        job.finished_at = Some(self.clock.now());
        self.store.save_job(&job)?;
        self.emit(self.event(MigrationEventKind::BatchSucceeded, migration).with_job(&job));
        self.optimize(migration)?;
        Ok(RunOutcome::BatchSucceeded(job))
    }

    /// Runs every remaining batch of `migration` ignoring the interval.
    ///
    /// The migration moves to `finalizing` for the duration and ends
    /// `finished`. A batch failure returns it to `active` before the error is
    /// propagated. A migration left `finalizing` by an interrupted run resumes
    /// from its progress cursor. Finalizing a finished migration is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::Migration`] when the migration cannot be
    /// finalized from its current status, and any batch or store error.
    pub fn finalize(&self, migration: &MigrationRecord) -> Result<MigrationRecord, RunnerError> {
        if migration.status == MigrationStatus::Finished {
            return Ok(migration.clone());
        }
        if !migration.status.can_transition_to(MigrationStatus::Finalizing) {
            return Err(MigrationError::IllegalTransition {
                from: migration.status,
                to: MigrationStatus::Finalizing,
            }
            .into());
        }
        // An interrupted finalize left the status behind; pick up from the cursor.
        let finalizing = if migration.status == MigrationStatus::Finalizing {
            migration.clone()
        } else {
            self.store.update_status(migration.id, migration.status, MigrationStatus::Finalizing)?
        };
        self.emit(self.event(MigrationEventKind::FinalizeStarted, &finalizing));
        loop {
            let current = self.reload(finalizing.id)?;
            match self.run_migration_job(&current) {
                Ok(RunOutcome::Finished) => return self.reload(finalizing.id),
                Ok(RunOutcome::BatchSucceeded(_)) => {}
                Err(err) => {
                    self.store.update_status(
                        finalizing.id,
                        MigrationStatus::Finalizing,
                        MigrationStatus::Active,
                    )?;
                    return Err(err);
                }
            }
        }
    }

    /// Marks the migration finished.
    fn finish(&self, migration: &MigrationRecord) -> Result<(), RunnerError> {
        let finished =
            self.store.update_status(migration.id, migration.status, MigrationStatus::Finished)?;
        self.emit(self.event(MigrationEventKind::MigrationFinished, &finished));
        Ok(())
    }

    /// Records a failed batch and applies the failure policy.
    fn fail_batch(
        &self,
        migration: &MigrationRecord,
        mut job: JobRecord,
        range: KeyRange,
        source: JobError,
    ) -> RunnerError {
        job.status = JobStatus::Failed;
        job.last_error = Some(source.to_string());
        job.finished_at = Some(self.clock.now());
        if let Err(err) = self.store.save_job(&job) {
            return err.into();
        }
        self.emit(
            self.event(MigrationEventKind::BatchFailed, migration)
                .with_job(&job)
                .with_message(source.to_string()),
        );
        if migration.status == MigrationStatus::Active
            && self.config.failure_policy.is_exhausted(job.attempts)
        {
            match self.store.update_status(
                migration.id,
                MigrationStatus::Active,
                MigrationStatus::Failed,
            ) {
                Ok(failed) => self.emit(
                    self.event(MigrationEventKind::MigrationFailed, &failed)
                        .with_job(&job)
                        .with_message(format!("batch {range} failed {} times", job.attempts)),
                ),
                Err(err) => return err.into(),
            }
        }
        RunnerError::BatchExecution {
            job_id: job.id,
            range,
            source,
        }
    }

    /// Applies the batch optimizer after a successful batch.
    fn optimize(&self, migration: &MigrationRecord) -> Result<(), RunnerError> {
        let Some(optimizer) = &self.config.optimizer else {
            return Ok(());
        };
        let current = self.reload(migration.id)?;
        let recent = self.store.recent_succeeded_jobs(current.id, optimizer.sample_size)?;
        if let Some(batch_size) = optimize_batch_size(optimizer, &current, &recent) {
            self.store.set_batch_size(current.id, batch_size)?;
            self.emit(
                self.event(MigrationEventKind::BatchSizeOptimized, &current)
                    .with_message(format!("batch size {} -> {batch_size}", current.batch_size)),
            );
        }
        Ok(())
    }

    /// Loads a migration that must exist.
    fn reload(&self, id: MigrationId) -> Result<MigrationRecord, RunnerError> {
        self.store
            .migration(id)?
            .ok_or_else(|| StoreError::NotFound(format!("migration {id}")).into())
    }

    /// Builds an event for `migration` at the current time.
    fn event(&self, kind: MigrationEventKind, migration: &MigrationRecord) -> MigrationEvent {
        MigrationEvent::new(kind, self.scope, self.clock.now()).with_migration(migration)
    }

    /// Sends an event to the sink.
    fn emit(&self, event: MigrationEvent) {
        self.events.record(&event);
    }
}
