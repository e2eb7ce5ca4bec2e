// crates/backfill-core/src/core/mod.rs
// ============================================================================
// Module: Backfill Core Types
// Description: Canonical migration, job, range, and time types.
// Purpose: Provide stable, serializable records shared by stores and runtime.
// Dependencies: serde, serde_json, time
// ============================================================================

//! ## Overview
//! Core types describe what a batched migration is and how its progress is
//! recorded. They carry no I/O; stores persist them and the runtime mutates
//! them while holding the worker lease.

// ============================================================================
// SECTION: Submodules
// ============================================================================

pub mod identifiers;
pub mod job;
pub mod migration;
pub mod range;
pub mod time;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use identifiers::JobClassName;
pub use identifiers::JobId;
pub use identifiers::MigrationId;
pub use job::JobRecord;
pub use job::JobStatus;
pub use job::NewJob;
pub use migration::MigrationError;
pub use migration::MigrationRecord;
pub use migration::MigrationStatus;
pub use migration::NewMigration;
pub use migration::is_plain_identifier;
pub use range::KeyRange;
pub use range::RangeBatcher;
pub use range::SubBatches;
pub use self::time::Timestamp;
