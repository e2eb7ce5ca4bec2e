// crates/backfill-core/src/runtime/worker.rs
// ============================================================================
// Module: Backfill Migration Worker
// Description: Periodic, lease-guarded entry point that runs one batch.
// Purpose: Decide whether this tick may run a batch and delegate to the runner.
// Dependencies: crate::core, crate::interfaces, crate::runtime, thiserror
// ============================================================================

//! ## Overview
//! A scheduler calls [`BatchedMigrationWorker::perform`] on a fixed cadence
//! from any number of processes. Each call walks a fixed decision ladder and
//! runs at most one batch:
//!
//! 1. skip when the tracking store is not configured;
//! 2. skip when the scheduling toggle is off;
//! 3. pick the oldest `active` migration;
//! 4. take the worker lease without waiting;
//! 5. re-check the migration under the lease;
//! 6. skip when the migration interval (relaxed by jitter) has not elapsed;
//! 7. run one batch.
//!
//! The lease is held by a [`LeaseGuard`] and released on every exit path.
//! Skips are [`WorkerOutcome`] values, never errors.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::core::MigrationId;
use crate::core::MigrationRecord;
use crate::interfaces::Clock;
use crate::interfaces::FeatureToggle;
use crate::interfaces::IntervalJitter;
use crate::interfaces::LeaseError;
use crate::interfaces::LeaseProvider;
use crate::interfaces::MigrationStore;
use crate::interfaces::StoreError;
use crate::runtime::clock::RandomJitter;
use crate::runtime::clock::StaticToggle;
use crate::runtime::clock::SystemClock;
use crate::runtime::events::EventScope;
use crate::runtime::events::MigrationEvent;
use crate::runtime::events::MigrationEventKind;
use crate::runtime::events::MigrationEventSink;
use crate::runtime::events::StderrEventSink;
use crate::runtime::lease::LeaseGuard;
use crate::runtime::lease::lease_timeout;
use crate::runtime::registry::MigrationRegistry;
use crate::runtime::runner::MigrationRunner;
use crate::runtime::runner::RunOutcome;
use crate::runtime::runner::RunnerConfig;
use crate::runtime::runner::RunnerError;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Floor applied to the worker lease timeout.
pub const MINIMUM_LEASE_TIMEOUT: Duration = Duration::from_secs(10 * 60);
/// Maximum jitter subtracted from a migration interval.
pub const INTERVAL_VARIANCE: Duration = Duration::from_secs(5);
/// Default lease timeout multiplier applied to the migration interval.
pub const DEFAULT_LEASE_TIMEOUT_MULTIPLIER: u32 = 3;
/// Default worker name, also used as the lease key.
pub const DEFAULT_WORKER_NAME: &str = "batched_background_migration_worker";
/// Default tracking database label.
pub const DEFAULT_TRACKING_DATABASE: &str = "main";
/// Toggle that enables scheduled execution.
pub const EXECUTE_ON_SCHEDULE_FLAG: &str = "execute_batched_migrations_on_schedule";

// ============================================================================
// SECTION: Configuration
// ============================================================================

/// Worker tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    /// Worker name; also the lease key shared by every worker process.
    pub name: String,
    /// Label of the tracking database, used in logs.
    pub tracking_database: String,
    /// Feature toggle consulted on every tick.
    pub feature_flag: String,
    /// Floor for the lease timeout.
    pub minimum_lease_timeout: Duration,
    /// Multiplier applied to the migration interval for the lease timeout.
    pub lease_timeout_multiplier: u32,
    /// Maximum jitter subtracted from the interval.
    pub interval_variance: Duration,
    /// Runner tuning.
    pub runner: RunnerConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_WORKER_NAME.to_string(),
            tracking_database: DEFAULT_TRACKING_DATABASE.to_string(),
            feature_flag: EXECUTE_ON_SCHEDULE_FLAG.to_string(),
            minimum_lease_timeout: MINIMUM_LEASE_TIMEOUT,
            lease_timeout_multiplier: DEFAULT_LEASE_TIMEOUT_MULTIPLIER,
            interval_variance: INTERVAL_VARIANCE,
            runner: RunnerConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Returns the lease timeout for a migration with `interval`.
    #[must_use]
    pub fn lease_timeout(&self, interval: Duration) -> Duration {
        lease_timeout(interval, self.lease_timeout_multiplier, self.minimum_lease_timeout)
    }
}

// ============================================================================
// SECTION: Outcomes and Errors
// ============================================================================

/// What one worker tick did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "run", rename_all = "snake_case")]
pub enum WorkerOutcome {
    /// No tracking store is configured for this worker.
    TrackingTargetUnavailable,
    /// Scheduled execution is toggled off.
    Disabled,
    /// No migration is `active`.
    NoActiveMigration,
    /// Another worker holds the lease.
    LeaseNotAcquired,
    /// The migration changed status before the lease was taken.
    MigrationNotActive,
    /// The migration ran too recently.
    IntervalNotElapsed,
    /// The runner was invoked.
    Ran(RunOutcome),
}

impl WorkerOutcome {
    /// Returns a stable label for the outcome.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::TrackingTargetUnavailable => "tracking_target_unavailable",
            Self::Disabled => "disabled",
            Self::NoActiveMigration => "no_active_migration",
            Self::LeaseNotAcquired => "lease_not_acquired",
            Self::MigrationNotActive => "migration_not_active",
            Self::IntervalNotElapsed => "interval_not_elapsed",
            Self::Ran(RunOutcome::Finished) => "finished",
            Self::Ran(RunOutcome::BatchSucceeded(_)) => "batch_succeeded",
        }
    }
}

/// Worker errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkerError {
    /// Store access failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Lease backend failed.
    #[error(transparent)]
    Lease(#[from] LeaseError),
    /// The runner failed.
    #[error(transparent)]
    Runner(#[from] RunnerError),
    /// No tracking store is configured.
    #[error("tracking database {0} is not configured")]
    TrackingTargetUnavailable(String),
    /// The requested migration does not exist.
    #[error("migration {0} not found")]
    MigrationNotFound(MigrationId),
    /// Another worker holds the lease.
    #[error("lease {0} is held by another worker")]
    LeaseUnavailable(String),
}

// ============================================================================
// SECTION: Worker
// ============================================================================

/// Lease-guarded batched migration worker.
pub struct BatchedMigrationWorker<S, L> {
    /// Worker tuning.
    config: WorkerConfig,
    /// Worker identity attached to events.
    scope: EventScope,
    /// Tracking store; `None` when the tracking database is not configured.
    store: Option<S>,
    /// Cluster-wide lease provider.
    leases: L,
    /// Unit-of-work lookup.
    registry: Arc<MigrationRegistry>,
    /// Time source.
    clock: Arc<dyn Clock>,
    /// Feature toggles.
    toggles: Arc<dyn FeatureToggle>,
    /// Interval jitter source.
    jitter: Arc<dyn IntervalJitter>,
    /// Event destination.
    events: Arc<dyn MigrationEventSink>,
}

impl<S: MigrationStore, L: LeaseProvider> BatchedMigrationWorker<S, L> {
    /// Creates a worker with the system clock, random jitter, an always-on
    /// toggle, and stderr logging.
    #[must_use]
    pub fn new(
        config: WorkerConfig,
        store: Option<S>,
        leases: L,
        registry: Arc<MigrationRegistry>,
    ) -> Self {
        let scope = EventScope::new(config.name.clone(), config.tracking_database.clone());
        Self {
            config,
            scope,
            store,
            leases,
            registry,
            clock: Arc::new(SystemClock),
            toggles: Arc::new(StaticToggle(true)),
            jitter: Arc::new(RandomJitter),
            events: Arc::new(StderrEventSink),
        }
    }

    /// Replaces the time source.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the feature toggles.
    #[must_use]
    pub fn with_toggles(mut self, toggles: Arc<dyn FeatureToggle>) -> Self {
        self.toggles = toggles;
        self
    }

    /// Replaces the jitter source.
    #[must_use]
    pub fn with_jitter(mut self, jitter: Arc<dyn IntervalJitter>) -> Self {
        self.jitter = jitter;
        self
    }

    /// Replaces the event sink.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn MigrationEventSink>) -> Self {
        self.events = events;
        self
    }

    /// Returns the worker configuration.
    #[must_use]
    pub const fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Runs at most one batch of the oldest active migration.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError`] when the store or lease backend fails or the
    /// batch fails. The lease is released before returning.
    pub fn perform(&self) -> Result<WorkerOutcome, WorkerError> {
        let Some(store) = &self.store else {
            self.emit(
                self.event(MigrationEventKind::WorkerSkipped)
                    .with_message("skipping migration execution"),
            );
            return Ok(WorkerOutcome::TrackingTargetUnavailable);
        };
        if !self.toggles.is_enabled(&self.config.feature_flag) {
            self.emit(
                self.event(MigrationEventKind::WorkerSkipped)
                    .with_message(format!("{} is disabled", self.config.feature_flag)),
            );
            return Ok(WorkerOutcome::Disabled);
        }
        let Some(candidate) = store.active_migration()? else {
            return Ok(WorkerOutcome::NoActiveMigration);
        };
        let Some(_guard) = self.obtain_lease(&candidate)? else {
            self.emit(self.event(MigrationEventKind::LeaseNotAcquired).with_migration(&candidate));
            return Ok(WorkerOutcome::LeaseNotAcquired);
        };

        let Some(migration) = store.migration(candidate.id)?.filter(MigrationRecord::is_active)
        else {
            return Ok(WorkerOutcome::MigrationNotActive);
        };
        let jitter = self.jitter.sample(self.config.interval_variance);
        if !migration.interval_elapsed(self.clock.now(), jitter) {
            return Ok(WorkerOutcome::IntervalNotElapsed);
        }
        let outcome = self.runner(store).run_migration_job(&migration)?;
        Ok(WorkerOutcome::Ran(outcome))
    }

    /// Runs every remaining batch of a migration while holding the lease.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::LeaseUnavailable`] when another worker holds the
    /// lease, [`WorkerError::MigrationNotFound`] for unknown migrations, and
    /// any runner error.
    pub fn finalize(&self, id: MigrationId) -> Result<MigrationRecord, WorkerError> {
        let Some(store) = &self.store else {
            return Err(WorkerError::TrackingTargetUnavailable(
                self.config.tracking_database.clone(),
            ));
        };
        let migration = store.migration(id)?.ok_or(WorkerError::MigrationNotFound(id))?;
        let Some(_guard) = self.obtain_lease(&migration)? else {
            return Err(WorkerError::LeaseUnavailable(self.config.name.clone()));
        };
        let current = store.migration(id)?.ok_or(WorkerError::MigrationNotFound(id))?;
        Ok(self.runner(store).finalize(&current)?)
    }

    /// Tries to take the worker lease sized for `migration`.
    fn obtain_lease(
        &self,
        migration: &MigrationRecord,
    ) -> Result<Option<LeaseGuard<'_, L>>, WorkerError> {
        let ttl = self.config.lease_timeout(migration.interval());
        Ok(LeaseGuard::obtain(
            &self.leases,
            &self.config.name,
            ttl,
            self.clock.as_ref(),
            self.events.as_ref(),
            &self.scope,
        )?)
    }

    /// Builds a runner bound to `store`.
    fn runner<'a>(&'a self, store: &'a S) -> MigrationRunner<'a, S> {
        MigrationRunner::new(
            store,
            &self.registry,
            self.clock.as_ref(),
            self.events.as_ref(),
            &self.scope,
            &self.config.runner,
        )
    }

    /// Builds a worker-scoped event at the current time.
    fn event(&self, kind: MigrationEventKind) -> MigrationEvent {
        MigrationEvent::new(kind, &self.scope, self.clock.now())
    }

    /// Sends an event to the sink.
    fn emit(&self, event: MigrationEvent) {
        self.events.record(&event);
    }
}
