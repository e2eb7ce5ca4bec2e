// crates/backfill-core/src/runtime/registry.rs
// ============================================================================
// Module: Backfill Migration Registry
// Description: Maps job class names to pluggable batch units of work.
// Purpose: Resolve the row mutation a migration performs at run time.
// Dependencies: crate::core, serde_json, thiserror
// ============================================================================

//! ## Overview
//! Migration authors register a constructor under a job class name. When the
//! runner executes a batch it resolves the migration's class and arguments to
//! a [`BatchedMigrationJob`] and calls it once per sub-batch. Resolution of an
//! unregistered class fails with [`RegistryError::UnknownMigration`]; that is
//! fatal for the migration and is surfaced rather than retried.
//!
//! Units of work must be idempotent over a range: a batch interrupted by a
//! crash is re-run over the same keys.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::core::JobClassName;
use crate::core::KeyRange;

// ============================================================================
// SECTION: Types
// ============================================================================

/// The slice of a batch handed to a unit of work.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubBatch<'a> {
    /// Table being migrated.
    pub table_name: &'a str,
    /// Key column the range applies to.
    pub column_name: &'a str,
    /// Keys to mutate (inclusive).
    pub range: KeyRange,
    /// Extra arguments recorded on the migration.
    pub job_arguments: &'a [Value],
}

/// Unit-of-work failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// The mutation failed.
    #[error("{0}")]
    Execution(String),
}

/// Registry resolution errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// No constructor is registered for the job class.
    #[error("unknown migration job class: {0}")]
    UnknownMigration(JobClassName),
    /// The constructor rejected the migration's arguments.
    #[error("invalid arguments for {job_class}: {message}")]
    InvalidArguments {
        /// Job class being resolved.
        job_class: JobClassName,
        /// Rejection reason.
        message: String,
    },
}

/// Row mutation executed for each sub-batch of a migration.
pub trait BatchedMigrationJob {
    /// Mutates the rows of `sub_batch` and returns the affected row count.
    ///
    /// # Errors
    ///
    /// Returns [`JobError`] when the mutation fails; the batch is recorded as
    /// failed and retried on a later tick.
    fn execute(&self, sub_batch: &SubBatch<'_>) -> Result<u64, JobError>;
}

/// Builds a unit of work from a migration's job arguments.
pub type JobConstructor =
    Arc<dyn Fn(&[Value]) -> Result<Box<dyn BatchedMigrationJob>, String> + Send + Sync>;

/// Adapts a shared closure into a unit of work.
struct FnJob<F> {
    /// Closure invoked per sub-batch.
    body: Arc<F>,
}

impl<F> BatchedMigrationJob for FnJob<F>
where
    F: Fn(&SubBatch<'_>) -> Result<u64, JobError>,
{
    fn execute(&self, sub_batch: &SubBatch<'_>) -> Result<u64, JobError> {
        (self.body)(sub_batch)
    }
}

// ============================================================================
// SECTION: Registry
// ============================================================================

/// Job class name to unit-of-work constructor mapping.
#[derive(Clone, Default)]
pub struct MigrationRegistry {
    /// Registered constructors keyed by job class name.
    constructors: BTreeMap<JobClassName, JobConstructor>,
}

impl MigrationRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `constructor` under `job_class`, replacing any previous entry.
    pub fn register<F>(&mut self, job_class: impl Into<JobClassName>, constructor: F)
    where
        F: Fn(&[Value]) -> Result<Box<dyn BatchedMigrationJob>, String> + Send + Sync + 'static,
    {
        self.constructors.insert(job_class.into(), Arc::new(constructor));
    }

    /// Registers a closure that ignores constructor arguments and runs per sub-batch.
    pub fn register_fn<F>(&mut self, job_class: impl Into<JobClassName>, body: F)
    where
        F: Fn(&SubBatch<'_>) -> Result<u64, JobError> + Send + Sync + 'static,
    {
        let body = Arc::new(body);
        self.register(job_class, move |_arguments| {
            Ok(Box::new(FnJob {
                body: Arc::clone(&body),
            }) as Box<dyn BatchedMigrationJob>)
        });
    }

    /// Returns true when `job_class` is registered.
    #[must_use]
    pub fn contains(&self, job_class: &JobClassName) -> bool {
        self.constructors.contains_key(job_class)
    }

    /// Returns the registered job class names in order.
    #[must_use]
    pub fn job_classes(&self) -> Vec<JobClassName> {
        self.constructors.keys().cloned().collect()
    }

    /// Resolves a job class and its arguments to a unit of work.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownMigration`] for unregistered classes and
    /// [`RegistryError::InvalidArguments`] when the constructor rejects the
    /// arguments.
    pub fn resolve(
        &self,
        job_class: &JobClassName,
        job_arguments: &[Value],
    ) -> Result<Box<dyn BatchedMigrationJob>, RegistryError> {
        let constructor = self
            .constructors
            .get(job_class)
            .ok_or_else(|| RegistryError::UnknownMigration(job_class.clone()))?;
        constructor(job_arguments).map_err(|message| RegistryError::InvalidArguments {
            job_class: job_class.clone(),
            message,
        })
    }
}
