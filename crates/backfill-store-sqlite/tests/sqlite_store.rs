// crates/backfill-store-sqlite/tests/sqlite_store.rs
// ============================================================================
// Module: SQLite Migration Store Tests
// Description: Persistence, uniqueness, compare-and-set, and integrity checks.
// Purpose: Validate path safety, schema versioning, active uniqueness,
//          job bookkeeping, and fail-closed loading of corrupt rows.
// ============================================================================

//! ## Overview
//! Integration tests for [`SqliteMigrationStore`] against real database files.

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

use std::path::Path;
use std::sync::Arc;
use std::thread;

use backfill_core::JobStatus;
use backfill_core::KeyRange;
use backfill_core::MigrationId;
use backfill_core::MigrationStatus;
use backfill_core::MigrationStore;
use backfill_core::NewJob;
use backfill_core::NewMigration;
use backfill_core::StoreError;
use backfill_core::Timestamp;
use backfill_store_sqlite::MAX_JOB_ARGUMENTS_BYTES;
use backfill_store_sqlite::SqliteMigrationStore;
use backfill_store_sqlite::SqliteStoreConfig;
use backfill_store_sqlite::SqliteStoreError;
use backfill_store_sqlite::SqliteStoreMode;
use backfill_store_sqlite::SqliteSyncMode;
use rusqlite::Connection;
use rusqlite::params;
use serde_json::json;
use tempfile::TempDir;

// ============================================================================
// SECTION: Helpers
// ============================================================================

fn config_for_path(path: &Path) -> SqliteStoreConfig {
    SqliteStoreConfig {
        path: path.to_path_buf(),
        busy_timeout_ms: 1_000,
        journal_mode: SqliteStoreMode::Wal,
        sync_mode: SqliteSyncMode::Normal,
    }
}

fn open_store(dir: &TempDir) -> SqliteMigrationStore {
    SqliteMigrationStore::open(&config_for_path(&dir.path().join("backfill.db"))).unwrap()
}

fn definition(job_class: &str, status: MigrationStatus) -> NewMigration {
    NewMigration {
        job_class_name: job_class.into(),
        table_name: "events".to_string(),
        column_name: "id".to_string(),
        job_arguments: vec![json!("some_column"), json!(0)],
        min_value: 1,
        max_value: 50,
        batch_size: 5,
        sub_batch_size: 2,
        interval_secs: 300,
        status,
    }
}

fn running_job(migration_id: MigrationId, start: i64, end: i64, at: Timestamp) -> NewJob {
    NewJob {
        migration_id,
        range: KeyRange::new(start, end).unwrap(),
        batch_size: 5,
        sub_batch_size: 2,
        status: JobStatus::Running,
        started_at: Some(at),
    }
}

// ============================================================================
// SECTION: Path Safety and Schema
// ============================================================================

#[test]
fn directory_paths_are_rejected() {
    let dir = TempDir::new().unwrap();
    let result = SqliteMigrationStore::open(&config_for_path(dir.path()));
    assert!(matches!(result, Err(SqliteStoreError::Invalid(_))));
}

#[test]
fn overlong_path_components_are_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("x".repeat(300));
    let result = SqliteMigrationStore::open(&config_for_path(&path));
    assert!(matches!(result, Err(SqliteStoreError::Invalid(_))));
}

#[test]
fn parent_directories_are_created() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("state").join("backfill.db");
    let store = SqliteMigrationStore::open(&config_for_path(&path)).unwrap();
    store.readiness().unwrap();
    assert!(path.exists());
}

#[test]
fn unsupported_schema_version_fails_closed() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("backfill.db");
    drop(SqliteMigrationStore::open(&config_for_path(&path)).unwrap());
    let connection = Connection::open(&path).unwrap();
    connection.execute("UPDATE store_meta SET version = 99", params![]).unwrap();
    drop(connection);

    let result = SqliteMigrationStore::open(&config_for_path(&path));
    assert!(matches!(result, Err(SqliteStoreError::VersionMismatch(_))));
}

#[test]
fn records_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let created = {
        let store = open_store(&dir);
        store.create_migration(definition("Backfill", MigrationStatus::Active), Timestamp::EPOCH).unwrap()
    };
    let store = open_store(&dir);
    assert_eq!(store.migration(created.id).unwrap(), Some(created.clone()));
    assert_eq!(store.active_migration().unwrap(), Some(created));
}

// ============================================================================
// SECTION: Migrations
// ============================================================================

#[test]
fn second_active_migration_of_a_class_conflicts() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    store.create_migration(definition("Backfill", MigrationStatus::Active), Timestamp::EPOCH).unwrap();

    let duplicate = store.create_migration(definition("Backfill", MigrationStatus::Active), Timestamp::EPOCH);
    assert!(matches!(duplicate, Err(StoreError::Conflict(_))));

    let paused = store
        .create_migration(definition("Backfill", MigrationStatus::Paused), Timestamp::EPOCH)
        .unwrap();
    let resumed = store.update_status(paused.id, MigrationStatus::Paused, MigrationStatus::Active);
    assert!(matches!(resumed, Err(StoreError::Conflict(_))));
    assert_eq!(store.migration(paused.id).unwrap().unwrap().status, MigrationStatus::Paused);

    store.create_migration(definition("Other", MigrationStatus::Active), Timestamp::EPOCH).unwrap();
    assert_eq!(store.list_migrations().unwrap().len(), 3);
}

#[test]
fn finalizing_migration_blocks_siblings_of_its_class() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let finalizing = store
        .create_migration(definition("Backfill", MigrationStatus::Active), Timestamp::EPOCH)
        .unwrap();
    store
        .update_status(finalizing.id, MigrationStatus::Active, MigrationStatus::Finalizing)
        .unwrap();
    let sibling = store
        .create_migration(definition("Backfill", MigrationStatus::Paused), Timestamp::EPOCH)
        .unwrap();

    let resumed = store.update_status(sibling.id, MigrationStatus::Paused, MigrationStatus::Active);
    assert!(matches!(resumed, Err(StoreError::Conflict(_))));
    let created = store.create_migration(definition("Backfill", MigrationStatus::Active), Timestamp::EPOCH);
    assert!(matches!(created, Err(StoreError::Conflict(_))));

    let reverted = store
        .update_status(finalizing.id, MigrationStatus::Finalizing, MigrationStatus::Active)
        .unwrap();
    assert_eq!(reverted.status, MigrationStatus::Active);
}

#[test]
fn active_migration_returns_oldest_active() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    store.create_migration(definition("First", MigrationStatus::Paused), Timestamp::EPOCH).unwrap();
    let second = store
        .create_migration(definition("Second", MigrationStatus::Active), Timestamp::EPOCH)
        .unwrap();
    store.create_migration(definition("Third", MigrationStatus::Active), Timestamp::EPOCH).unwrap();
    assert_eq!(store.active_migration().unwrap().unwrap().id, second.id);
}

#[test]
fn update_status_is_compare_and_set() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let migration = store
        .create_migration(definition("Backfill", MigrationStatus::Active), Timestamp::EPOCH)
        .unwrap();

    let paused = store.update_status(migration.id, MigrationStatus::Active, MigrationStatus::Paused).unwrap();
    assert_eq!(paused.status, MigrationStatus::Paused);
    let stale = store.update_status(migration.id, MigrationStatus::Active, MigrationStatus::Finished);
    assert!(matches!(stale, Err(StoreError::Conflict(_))));

    let missing = MigrationId::from_raw(999).unwrap();
    let result = store.update_status(missing, MigrationStatus::Active, MigrationStatus::Paused);
    assert!(matches!(result, Err(StoreError::NotFound(_))));
}

#[test]
fn invalid_and_oversized_definitions_are_rejected() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let mut inverted = definition("Backfill", MigrationStatus::Active);
    inverted.min_value = 60;
    assert!(matches!(store.create_migration(inverted, Timestamp::EPOCH), Err(StoreError::Invalid(_))));

    let mut oversized = definition("Backfill", MigrationStatus::Active);
    oversized.job_arguments = vec![json!("x".repeat(MAX_JOB_ARGUMENTS_BYTES))];
    assert!(matches!(store.create_migration(oversized, Timestamp::EPOCH), Err(StoreError::Invalid(_))));
    assert!(store.list_migrations().unwrap().is_empty());
}

#[test]
fn batch_size_and_start_time_updates_persist() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let migration = store
        .create_migration(definition("Backfill", MigrationStatus::Active), Timestamp::EPOCH)
        .unwrap();
    let at = Timestamp::from_unix_millis(1_700_000_000_000);

    store.set_batch_size(migration.id, 12).unwrap();
    store.set_last_job_started_at(migration.id, at).unwrap();
    let loaded = store.migration(migration.id).unwrap().unwrap();
    assert_eq!(loaded.batch_size, 12);
    assert_eq!(loaded.last_job_started_at, Some(at));
    assert!(matches!(store.set_batch_size(migration.id, 0), Err(StoreError::Invalid(_))));
}

// ============================================================================
// SECTION: Jobs
// ============================================================================

#[test]
fn cursor_tracks_highest_succeeded_job() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let migration = store
        .create_migration(definition("Backfill", MigrationStatus::Active), Timestamp::EPOCH)
        .unwrap();
    assert_eq!(store.progress_cursor(migration.id).unwrap(), None);

    let at = Timestamp::from_unix_millis(1_000);
    let mut first = store.create_job(running_job(migration.id, 1, 5, at)).unwrap();
    assert_eq!(first.attempts, 1);
    first.status = JobStatus::Succeeded;
    first.affected_rows = 5;
    first.finished_at = Some(Timestamp::from_unix_millis(2_000));
    store.save_job(&first).unwrap();

    let mut second = store.create_job(running_job(migration.id, 6, 10, at)).unwrap();
    second.status = JobStatus::Failed;
    second.last_error = Some("boom".to_string());
    store.save_job(&second).unwrap();

    assert_eq!(store.progress_cursor(migration.id).unwrap(), Some(5));
    assert_eq!(store.unfinished_job_starting_at(migration.id, 6).unwrap(), Some(second.clone()));
    assert_eq!(store.unfinished_job_starting_at(migration.id, 1).unwrap(), None);
    assert_eq!(store.jobs(migration.id).unwrap(), vec![first.clone(), second]);
    assert_eq!(store.recent_succeeded_jobs(migration.id, 20).unwrap(), vec![first]);

    assert_eq!(store.reset_failed_jobs(migration.id).unwrap(), 1);
    let reset = store.unfinished_job_starting_at(migration.id, 6).unwrap().unwrap();
    assert_eq!(reset.attempts, 0);
    assert_eq!(reset.status, JobStatus::Failed);
}

#[test]
fn recent_succeeded_jobs_are_newest_first_and_limited() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let migration = store
        .create_migration(definition("Backfill", MigrationStatus::Active), Timestamp::EPOCH)
        .unwrap();
    for index in 0 .. 4_i64 {
        let start = index * 5 + 1;
        let mut job = store
            .create_job(running_job(migration.id, start, start + 4, Timestamp::EPOCH))
            .unwrap();
        job.status = JobStatus::Succeeded;
        job.finished_at = Some(Timestamp::from_unix_millis(index * 1_000));
        store.save_job(&job).unwrap();
    }
    let recent = store.recent_succeeded_jobs(migration.id, 2).unwrap();
    let starts: Vec<i64> = recent.iter().map(|job| job.min_value).collect();
    assert_eq!(starts, vec![16, 11]);
}

#[test]
fn jobs_require_an_existing_migration() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let missing = MigrationId::from_raw(7).unwrap();
    let result = store.create_job(running_job(missing, 1, 5, Timestamp::EPOCH));
    assert!(matches!(result, Err(StoreError::NotFound(_))));
}

#[test]
fn delete_cascades_to_jobs() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let migration = store
        .create_migration(definition("Backfill", MigrationStatus::Active), Timestamp::EPOCH)
        .unwrap();
    let job = store.create_job(running_job(migration.id, 1, 5, Timestamp::EPOCH)).unwrap();

    assert!(store.delete_migration(migration.id).unwrap());
    assert!(!store.delete_migration(migration.id).unwrap());
    assert!(store.jobs(migration.id).unwrap().is_empty());
    assert!(matches!(store.save_job(&job), Err(StoreError::NotFound(_))));
}

// ============================================================================
// SECTION: Integrity
// ============================================================================

#[test]
fn corrupt_status_codes_fail_closed() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("backfill.db");
    let store = SqliteMigrationStore::open(&config_for_path(&path)).unwrap();
    let migration = store
        .create_migration(definition("Backfill", MigrationStatus::Paused), Timestamp::EPOCH)
        .unwrap();

    let connection = Connection::open(&path).unwrap();
    connection.execute("UPDATE migrations SET status = 42", params![]).unwrap();
    drop(connection);

    assert!(matches!(store.migration(migration.id), Err(StoreError::Corrupt(_))));
}

#[test]
fn corrupt_job_arguments_fail_closed() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("backfill.db");
    let store = SqliteMigrationStore::open(&config_for_path(&path)).unwrap();
    store.create_migration(definition("Backfill", MigrationStatus::Paused), Timestamp::EPOCH).unwrap();

    let connection = Connection::open(&path).unwrap();
    connection.execute("UPDATE migrations SET job_arguments = '{not json'", params![]).unwrap();
    drop(connection);

    assert!(matches!(store.list_migrations(), Err(StoreError::Corrupt(_))));
}

#[test]
fn concurrent_job_writes_are_serialized() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(open_store(&dir));
    let migration = store
        .create_migration(definition("Backfill", MigrationStatus::Active), Timestamp::EPOCH)
        .unwrap();

    let mut handles = Vec::new();
    for index in 0 .. 8_i64 {
        let store = Arc::clone(&store);
        handles.push(thread::spawn(move || {
            let start = index * 5 + 1;
            store.create_job(running_job(migration.id, start, start + 4, Timestamp::EPOCH)).unwrap()
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(store.jobs(migration.id).unwrap().len(), 8);
}
