// crates/backfill-core/src/runtime/mod.rs
// ============================================================================
// Module: Backfill Runtime
// Description: Worker, runner, registry, and stock collaborators.
// Purpose: Execute batched migrations under a cluster-wide lease.
// Dependencies: crate::core, crate::interfaces
// ============================================================================

//! ## Overview
//! The runtime drives migrations forward one batch per worker tick. The
//! [`BatchedMigrationWorker`] decides whether a tick may run, the
//! [`MigrationRunner`] executes and records one batch, and the
//! [`MigrationRegistry`] supplies the unit of work. In-memory stores and
//! leases are provided for tests and single-process embedding.

// ============================================================================
// SECTION: Submodules
// ============================================================================

pub mod admin;
pub mod clock;
pub mod events;
pub mod lease;
pub mod optimizer;
pub mod registry;
pub mod runner;
pub mod store;
pub mod worker;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use admin::AdminError;
pub use admin::MigrationAdmin;
pub use admin::MigrationProgress;
pub use clock::FixedJitter;
pub use clock::ManualClock;
pub use clock::RandomJitter;
pub use clock::StaticToggle;
pub use clock::SystemClock;
pub use events::EventScope;
pub use events::FileEventSink;
pub use events::InMemoryEventSink;
pub use events::MigrationEvent;
pub use events::MigrationEventKind;
pub use events::MigrationEventSink;
pub use events::NoopEventSink;
pub use events::StderrEventSink;
pub use lease::InMemoryLeaseProvider;
pub use lease::LeaseGuard;
pub use lease::lease_timeout;
pub use optimizer::BatchOptimizerConfig;
pub use optimizer::optimize_batch_size;
pub use registry::BatchedMigrationJob;
pub use registry::JobConstructor;
pub use registry::JobError;
pub use registry::MigrationRegistry;
pub use registry::RegistryError;
pub use registry::SubBatch;
pub use runner::FailurePolicy;
pub use runner::MigrationRunner;
pub use runner::RunOutcome;
pub use runner::RunnerConfig;
pub use runner::RunnerError;
pub use store::InMemoryMigrationStore;
pub use worker::BatchedMigrationWorker;
pub use worker::INTERVAL_VARIANCE;
pub use worker::MINIMUM_LEASE_TIMEOUT;
pub use worker::WorkerConfig;
pub use worker::WorkerError;
pub use worker::WorkerOutcome;
