// crates/backfill-core/tests/admin.rs
// ============================================================================
// Module: Operator Action Tests
// Description: Lifecycle transitions, validation, and progress reporting.
// ============================================================================
//! ## Overview
//! Validates operator actions against the in-memory store, including the
//! one-active-migration-per-job-class rule.

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
    reason = "Test-only output and panic-based assertions are permitted."
)]

use backfill_core::JobStatus;
use backfill_core::MigrationError;
use backfill_core::MigrationStatus;
use backfill_core::MigrationStore;
use backfill_core::NewMigration;
use backfill_core::StoreError;
use backfill_core::Timestamp;
use backfill_core::runtime::AdminError;
use backfill_core::runtime::EventScope;
use backfill_core::runtime::FailurePolicy;
use backfill_core::runtime::InMemoryMigrationStore;
use backfill_core::runtime::JobError;
use backfill_core::runtime::ManualClock;
use backfill_core::runtime::MigrationAdmin;
use backfill_core::runtime::MigrationRegistry;
use backfill_core::runtime::MigrationRunner;
use backfill_core::runtime::NoopEventSink;
use backfill_core::runtime::RunnerConfig;

fn definition(job_class: &str, status: MigrationStatus) -> NewMigration {
    NewMigration {
        job_class_name: job_class.into(),
        table_name: "public.events".to_string(),
        column_name: "id".to_string(),
        job_arguments: Vec::new(),
        min_value: 1,
        max_value: 100,
        batch_size: 10,
        sub_batch_size: 5,
        interval_secs: 60,
        status,
    }
}

#[test]
fn pause_and_resume_round_the_status_machine() {
    let store = InMemoryMigrationStore::new();
    let clock = ManualClock::new(Timestamp::EPOCH);
    let admin = MigrationAdmin::new(&store, &clock);
    let migration = admin.create(definition("Backfill", MigrationStatus::Active)).unwrap();

    assert_eq!(admin.pause(migration.id).unwrap().status, MigrationStatus::Paused);
    assert_eq!(
        admin.pause(migration.id).unwrap_err(),
        AdminError::Migration(MigrationError::IllegalTransition {
            from: MigrationStatus::Paused,
            to: MigrationStatus::Paused,
        })
    );
    assert_eq!(admin.resume(migration.id).unwrap().status, MigrationStatus::Active);
    assert!(matches!(admin.resume(migration.id), Err(AdminError::Migration(_))));
}

#[test]
fn second_active_migration_of_a_class_is_rejected() {
    let store = InMemoryMigrationStore::new();
    let clock = ManualClock::new(Timestamp::EPOCH);
    let admin = MigrationAdmin::new(&store, &clock);
    admin.create(definition("Backfill", MigrationStatus::Active)).unwrap();

    assert!(matches!(
        admin.create(definition("Backfill", MigrationStatus::Active)),
        Err(AdminError::Store(StoreError::Conflict(_)))
    ));
    let paused = admin.create(definition("Backfill", MigrationStatus::Paused)).unwrap();
    assert!(matches!(admin.resume(paused.id), Err(AdminError::Store(StoreError::Conflict(_)))));
    admin.create(definition("OtherBackfill", MigrationStatus::Active)).unwrap();
    assert_eq!(admin.list().unwrap().len(), 3);
}

#[test]
fn invalid_definitions_are_rejected() {
    let store = InMemoryMigrationStore::new();
    let clock = ManualClock::new(Timestamp::EPOCH);
    let admin = MigrationAdmin::new(&store, &clock);

    let mut inverted = definition("Backfill", MigrationStatus::Active);
    inverted.min_value = 10;
    inverted.max_value = 1;
    assert!(matches!(admin.create(inverted), Err(AdminError::Migration(MigrationError::Invalid(_)))));

    let mut oversized = definition("Backfill", MigrationStatus::Active);
    oversized.sub_batch_size = 11;
    assert!(matches!(admin.create(oversized), Err(AdminError::Migration(_))));

    let mut unnamed = definition("", MigrationStatus::Active);
    unnamed.table_name = "events".to_string();
    assert!(matches!(admin.create(unnamed), Err(AdminError::Migration(_))));

    let mut finished = definition("Backfill", MigrationStatus::Finished);
    finished.table_name = "events".to_string();
    assert!(matches!(admin.create(finished), Err(AdminError::Migration(_))));
    assert!(admin.list().unwrap().is_empty());
}

#[test]
fn retry_reactivates_a_failed_migration_and_resets_attempts() {
    let store = InMemoryMigrationStore::new();
    let clock = ManualClock::new(Timestamp::EPOCH);
    let admin = MigrationAdmin::new(&store, &clock);
    let migration = admin.create(definition("Backfill", MigrationStatus::Active)).unwrap();

    let mut registry = MigrationRegistry::new();
    registry.register_fn("Backfill", |_| Err(JobError::Execution("boom".to_string())));
    let config = RunnerConfig {
        failure_policy: FailurePolicy {
            max_attempts: Some(1),
        },
        optimizer: None,
    };
    let scope = EventScope::new("worker", "main");
    let runner = MigrationRunner::new(&store, &registry, &clock, &NoopEventSink, &scope, &config);
    assert!(runner.run_migration_job(&migration).is_err());
    assert_eq!(admin.show(migration.id).unwrap().status, MigrationStatus::Failed);
    assert!(matches!(admin.pause(migration.id), Err(AdminError::Migration(_))));

    let retried = admin.retry(migration.id).unwrap();
    assert_eq!(retried.status, MigrationStatus::Active);
    let jobs = store.jobs(migration.id).unwrap();
    assert_eq!(jobs[0].status, JobStatus::Failed);
    assert_eq!(jobs[0].attempts, 0);
    assert!(matches!(admin.retry(migration.id), Err(AdminError::Migration(_))));
}

#[test]
fn progress_reports_covered_keys_and_job_counts() {
    let store = InMemoryMigrationStore::new();
    let clock = ManualClock::new(Timestamp::EPOCH);
    let admin = MigrationAdmin::new(&store, &clock);
    let migration = admin.create(definition("Backfill", MigrationStatus::Active)).unwrap();

    let mut registry = MigrationRegistry::new();
    registry.register_fn("Backfill", |sub_batch| Ok(sub_batch.range.len()));
    let config = RunnerConfig::default();
    let scope = EventScope::new("worker", "main");
    let runner = MigrationRunner::new(&store, &registry, &clock, &NoopEventSink, &scope, &config);
    for _ in 0 .. 3 {
        runner.run_migration_job(&migration).unwrap();
    }

    let progress = admin.progress(migration.id).unwrap();
    assert_eq!(progress.total_keys, 100);
    assert_eq!(progress.covered_keys, 30);
    assert_eq!(progress.cursor, Some(30));
    assert_eq!(progress.jobs_succeeded, 3);
    assert_eq!(progress.jobs_failed, 0);
    assert!((progress.percent_complete - 30.0).abs() < f64::EPSILON);
}

#[test]
fn delete_cascades_to_jobs() {
    let store = InMemoryMigrationStore::new();
    let clock = ManualClock::new(Timestamp::EPOCH);
    let admin = MigrationAdmin::new(&store, &clock);
    let migration = admin.create(definition("Backfill", MigrationStatus::Active)).unwrap();
    let mut registry = MigrationRegistry::new();
    registry.register_fn("Backfill", |sub_batch| Ok(sub_batch.range.len()));
    let config = RunnerConfig::default();
    let scope = EventScope::new("worker", "main");
    let runner = MigrationRunner::new(&store, &registry, &clock, &NoopEventSink, &scope, &config);
    runner.run_migration_job(&migration).unwrap();

    assert!(admin.delete(migration.id).unwrap());
    assert!(!admin.delete(migration.id).unwrap());
    assert!(store.jobs(migration.id).unwrap().is_empty());
    assert!(matches!(admin.show(migration.id), Err(AdminError::NotFound(_))));
}
