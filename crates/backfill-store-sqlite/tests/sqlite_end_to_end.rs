// crates/backfill-store-sqlite/tests/sqlite_end_to_end.rs
// ============================================================================
// Module: SQLite End-To-End Tests
// Description: Worker ticks against SQLite store, leases, and target tables.
// Purpose: Validate that a migration over a real table finishes with every
//          eligible row updated exactly once and nothing outside the range.
// ============================================================================

//! ## Overview
//! Drives [`BatchedMigrationWorker`] with the `SQLite` backends and the
//! built-in `UpdateColumn` job class.

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    reason = "Test-only assertions and helpers are permitted."
)]

use std::sync::Arc;
use std::time::Duration;

use backfill_core::Clock;
use backfill_core::JobStatus;
use backfill_core::MigrationStatus;
use backfill_core::MigrationStore;
use backfill_core::NewMigration;
use backfill_core::Timestamp;
use backfill_core::runtime::BatchedMigrationWorker;
use backfill_core::runtime::FixedJitter;
use backfill_core::runtime::InMemoryEventSink;
use backfill_core::runtime::ManualClock;
use backfill_core::runtime::MigrationEventKind;
use backfill_core::runtime::MigrationRegistry;
use backfill_core::runtime::RegistryError;
use backfill_core::runtime::RunOutcome;
use backfill_core::runtime::RunnerError;
use backfill_core::runtime::WorkerConfig;
use backfill_core::runtime::WorkerError;
use backfill_core::runtime::WorkerOutcome;
use backfill_store_sqlite::SqliteLeaseProvider;
use backfill_store_sqlite::SqliteMigrationStore;
use backfill_store_sqlite::SqliteStoreConfig;
use backfill_store_sqlite::SqliteStoreError;
use backfill_store_sqlite::SqliteTarget;
use backfill_store_sqlite::UPDATE_COLUMN_JOB_CLASS;
use backfill_store_sqlite::register_builtin_jobs;
use proptest::prelude::*;
use rusqlite::params;
use serde_json::Value;
use serde_json::json;
use tempfile::TempDir;

// ============================================================================
// SECTION: Fixtures
// ============================================================================

struct Fixture {
    _dir: TempDir,
    store: SqliteMigrationStore,
    target: SqliteTarget,
    clock: ManualClock,
    events: InMemoryEventSink,
}

impl Fixture {
    /// Opens a store and seeds `events` with ids `1..=rows`.
    fn new(rows: i64, excluded: Option<i64>) -> Self {
        let dir = TempDir::new().unwrap();
        let store =
            SqliteMigrationStore::open(&SqliteStoreConfig::new(dir.path().join("backfill.db")))
                .unwrap();
        let target = SqliteTarget::from_store(&store);
        target
            .with_connection(|connection| {
                connection
                    .execute_batch(
                        "CREATE TABLE events (id INTEGER PRIMARY KEY, status INTEGER NOT NULL, \
                         some_column INTEGER NOT NULL);",
                    )
                    .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
                for id in 1 ..= rows {
                    let status = i64::from(Some(id) != excluded);
                    connection
                        .execute(
                            "INSERT INTO events (id, status, some_column) VALUES (?1, ?2, ?3)",
                            params![id, status, id],
                        )
                        .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
                }
                Ok(())
            })
            .unwrap();
        Self {
            _dir: dir,
            store,
            target,
            clock: ManualClock::new(Timestamp::from_unix_millis(1_700_000_000_000)),
            events: InMemoryEventSink::new(),
        }
    }

    fn worker(&self) -> BatchedMigrationWorker<SqliteMigrationStore, SqliteLeaseProvider> {
        let mut registry = MigrationRegistry::new();
        register_builtin_jobs(&mut registry, &self.target);
        BatchedMigrationWorker::new(
            WorkerConfig::default(),
            Some(self.store.clone()),
            SqliteLeaseProvider::from_store(&self.store),
            Arc::new(registry),
        )
        .with_clock(Arc::new(self.clock.clone()))
        .with_jitter(Arc::new(FixedJitter))
        .with_events(Arc::new(self.events.clone()))
    }

    fn some_column(&self, id: i64) -> i64 {
        self.target
            .with_connection(|connection| {
                connection
                    .query_row("SELECT some_column FROM events WHERE id = ?1", params![id], |row| {
                        row.get(0)
                    })
                    .map_err(|err| SqliteStoreError::Db(err.to_string()))
            })
            .unwrap()
    }

    fn unmigrated(&self) -> i64 {
        self.target
            .with_connection(|connection| {
                connection
                    .query_row(
                        "SELECT COUNT(*) FROM events WHERE status = 1 AND some_column <> 0",
                        params![],
                        |row| row.get(0),
                    )
                    .map_err(|err| SqliteStoreError::Db(err.to_string()))
            })
            .unwrap()
    }
}

fn update_column(max_value: i64, batch_size: u64, sub_batch_size: u64) -> NewMigration {
    NewMigration {
        job_class_name: UPDATE_COLUMN_JOB_CLASS.into(),
        table_name: "events".to_string(),
        column_name: "id".to_string(),
        job_arguments: vec![json!("some_column"), json!(0), json!("status"), json!(1)],
        min_value: 1,
        max_value,
        batch_size,
        sub_batch_size,
        interval_secs: 300,
        status: MigrationStatus::Active,
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[test]
fn migration_over_sqlite_table_completes_in_eleven_ticks() {
    let fixture = Fixture::new(51, Some(45));
    let migration =
        fixture.store.create_migration(update_column(50, 5, 2), fixture.clock.now()).unwrap();
    let worker = fixture.worker();

    let mut outcomes = Vec::new();
    for _ in 0 .. 11 {
        outcomes.push(worker.perform().unwrap());
        fixture.clock.advance(Duration::from_secs(305));
    }
    assert_eq!(outcomes.last(), Some(&WorkerOutcome::Ran(RunOutcome::Finished)));

    let finished = fixture.store.migration(migration.id).unwrap().unwrap();
    assert_eq!(finished.status, MigrationStatus::Finished);
    let jobs = fixture.store.jobs(migration.id).unwrap();
    assert_eq!(jobs.len(), 10);
    for (index, job) in (0_i64 ..).zip(&jobs) {
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!((job.min_value, job.max_value), (index * 5 + 1, index * 5 + 5));
    }
    assert_eq!(jobs.iter().map(|job| job.affected_rows).sum::<u64>(), 49);

    assert_eq!(fixture.unmigrated(), 1);
    assert_eq!(fixture.some_column(51), 51);
    assert_eq!(fixture.some_column(45), 45);
    assert_eq!(fixture.events.kinds().last(), Some(&MigrationEventKind::MigrationFinished));
}

#[test]
fn ticks_inside_the_interval_do_nothing() {
    let fixture = Fixture::new(20, None);
    let migration =
        fixture.store.create_migration(update_column(20, 5, 5), fixture.clock.now()).unwrap();
    let worker = fixture.worker();

    assert!(matches!(worker.perform().unwrap(), WorkerOutcome::Ran(RunOutcome::BatchSucceeded(_))));
    assert_eq!(worker.perform().unwrap(), WorkerOutcome::IntervalNotElapsed);
    fixture.clock.advance(Duration::from_secs(60));
    assert_eq!(worker.perform().unwrap(), WorkerOutcome::IntervalNotElapsed);
    assert_eq!(fixture.store.jobs(migration.id).unwrap().len(), 1);
}

#[test]
fn malformed_arguments_surface_without_recording_a_job() {
    let fixture = Fixture::new(10, None);
    let mut definition = update_column(10, 5, 5);
    definition.job_arguments = vec![json!("some column; --"), Value::Null];
    let migration = fixture.store.create_migration(definition, fixture.clock.now()).unwrap();

    let err = fixture.worker().perform().unwrap_err();
    assert!(matches!(
        err,
        WorkerError::Runner(RunnerError::Registry(RegistryError::InvalidArguments { .. }))
    ));
    assert!(fixture.store.jobs(migration.id).unwrap().is_empty());
    assert_eq!(fixture.unmigrated(), 10);
}

#[test]
fn missing_target_table_fails_the_batch_and_retries_the_range() {
    let fixture = Fixture::new(10, None);
    let mut definition = update_column(10, 5, 5);
    definition.table_name = "missing_table".to_string();
    let migration = fixture.store.create_migration(definition, fixture.clock.now()).unwrap();
    let worker = fixture.worker();

    assert!(matches!(worker.perform(), Err(WorkerError::Runner(RunnerError::BatchExecution { .. }))));
    fixture.clock.advance(Duration::from_secs(305));
    assert!(worker.perform().is_err());

    let jobs = fixture.store.jobs(migration.id).unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!((jobs[0].min_value, jobs[0].max_value), (1, 5));
    assert_eq!(jobs[0].status, JobStatus::Failed);
    assert_eq!(jobs[0].attempts, 2);
    assert!(jobs[0].last_error.is_some());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn finished_migration_covers_range_exactly_once(
        max_value in 1_i64 .. 40,
        batch_size in 1_u64 .. 12,
        sub_batch_size in 1_u64 .. 12,
    ) {
        prop_assume!(sub_batch_size <= batch_size);
        let fixture = Fixture::new(max_value + 1, None);
        let migration = fixture
            .store
            .create_migration(update_column(max_value, batch_size, sub_batch_size), fixture.clock.now())
            .unwrap();
        let worker = fixture.worker();

        let mut outcome = worker.perform().unwrap();
        while outcome != WorkerOutcome::Ran(RunOutcome::Finished) {
            fixture.clock.advance(Duration::from_secs(305));
            outcome = worker.perform().unwrap();
        }

        let jobs = fixture.store.jobs(migration.id).unwrap();
        let mut expected_start = 1;
        for job in &jobs {
            prop_assert_eq!(job.status, JobStatus::Succeeded);
            prop_assert_eq!(job.min_value, expected_start);
            expected_start = job.max_value + 1;
        }
        prop_assert_eq!(expected_start, max_value + 1);
        prop_assert_eq!(fixture.unmigrated(), 1);
        prop_assert_eq!(fixture.some_column(max_value + 1), max_value + 1);
    }
}
