// crates/backfill-store-sqlite/src/lib.rs
// ============================================================================
// Module: Backfill SQLite Store
// Description: SQLite persistence, leases, and target tables for backfills.
// Purpose: Provide the durable backends shared by every worker process.
// Dependencies: backfill-core, rusqlite
// ============================================================================

//! ## Overview
//! This crate provides the `SQLite` implementations of the backfill engine's
//! storage seams: a [`SqliteMigrationStore`] for migrations and job records,
//! a [`SqliteLeaseProvider`] for cluster-wide exclusive leases, and a
//! [`SqliteTarget`] whose built-in job classes mutate rows in `SQLite` tables.

pub mod lease;
pub mod store;
pub mod target;

pub use lease::SqliteLeaseProvider;
pub use store::MAX_JOB_ARGUMENTS_BYTES;
pub use store::SqliteMigrationStore;
pub use store::SqliteStoreConfig;
pub use store::SqliteStoreError;
pub use store::SqliteStoreMode;
pub use store::SqliteSyncMode;
pub use target::SqliteTarget;
pub use target::UPDATE_COLUMN_JOB_CLASS;
pub use target::register_builtin_jobs;
