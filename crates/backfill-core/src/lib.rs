// crates/backfill-core/src/lib.rs
// ============================================================================
// Module: Backfill Core
// Description: Batched background migration engine.
// Purpose: Walk large tables in bounded, throttled, resumable batches.
// Dependencies: rand, serde, serde_json, thiserror, time
// ============================================================================

//! ## Overview
//! Backfill runs long data migrations as a sequence of small key-range
//! batches. A periodic worker takes a cluster-wide lease, picks the single
//! active migration, respects its throttling interval, and executes exactly
//! one batch through a registered unit of work. Progress is recorded as job
//! records so a crash or failure resumes at the same range.
//!
//! - [`core`] holds the records and the range batcher.
//! - [`interfaces`] defines the store, lease, clock, toggle, and jitter seams.
//! - [`runtime`] holds the worker, runner, registry, and in-memory backends.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod core;
pub mod interfaces;
pub mod runtime;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use crate::core::JobClassName;
pub use crate::core::JobId;
pub use crate::core::JobRecord;
pub use crate::core::JobStatus;
pub use crate::core::KeyRange;
pub use crate::core::MigrationError;
pub use crate::core::MigrationId;
pub use crate::core::MigrationRecord;
pub use crate::core::MigrationStatus;
pub use crate::core::NewJob;
pub use crate::core::NewMigration;
pub use crate::core::RangeBatcher;
pub use crate::core::SubBatches;
pub use crate::core::Timestamp;
pub use crate::core::is_plain_identifier;
pub use crate::interfaces::Clock;
pub use crate::interfaces::FeatureToggle;
pub use crate::interfaces::IntervalJitter;
pub use crate::interfaces::LeaseError;
pub use crate::interfaces::LeaseProvider;
pub use crate::interfaces::LeaseToken;
pub use crate::interfaces::MigrationStore;
pub use crate::interfaces::StoreError;
