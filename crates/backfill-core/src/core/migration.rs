// crates/backfill-core/src/core/migration.rs
// ============================================================================
// Module: Backfill Migration Records
// Description: Persistent migration description and lifecycle status machine.
// Purpose: Define what a batched migration is and which transitions are legal.
// Dependencies: serde, serde_json, thiserror
// ============================================================================

//! ## Overview
//! A [`MigrationRecord`] names the job class to run, the table and key column
//! it walks, the inclusive key range, and the batch tuning. Its
//! [`MigrationStatus`] follows a small state machine:
//!
//! - `paused -> active` and `active -> paused` (operator)
//! - `active -> finished` (range exhausted)
//! - `active -> failed` (failure policy tripped) and `failed -> active` (retry)
//! - `paused | active -> finalizing -> finished | active` (operator finalize)
//!
//! `finished` is terminal. At most one migration per job class may be
//! `active`; stores enforce that at the data layer.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::core::identifiers::JobClassName;
use crate::core::identifiers::MigrationId;
use crate::core::range::KeyRange;
use crate::core::range::RangeBatcher;
use crate::core::time::Timestamp;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Maximum length of a table or column identifier.
pub const MAX_IDENTIFIER_LENGTH: usize = 128;
/// Maximum length of a job class name.
pub const MAX_JOB_CLASS_NAME_LENGTH: usize = 255;
/// Maximum number of extra job arguments.
pub const MAX_JOB_ARGUMENTS: usize = 32;

// ============================================================================
// SECTION: Status
// ============================================================================

/// Lifecycle status of a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    /// Created or stopped by an operator; the worker ignores it.
    Paused,
    /// Eligible for scheduled batch execution.
    Active,
    /// Every key in the range has been covered by a succeeded job.
    Finished,
    /// Stopped after repeated batch failures.
    Failed,
    /// Being driven to completion synchronously by an operator.
    Finalizing,
}

impl MigrationStatus {
    /// Returns the stable integer code for the status.
    #[must_use]
    pub const fn code(self) -> i64 {
        match self {
            Self::Paused => 0,
            Self::Active => 1,
            Self::Finished => 3,
            Self::Failed => 4,
            Self::Finalizing => 5,
        }
    }

    /// Parses an integer status code.
    #[must_use]
    pub const fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Paused),
            1 => Some(Self::Active),
            3 => Some(Self::Finished),
            4 => Some(Self::Failed),
            5 => Some(Self::Finalizing),
            _ => None,
        }
    }

    /// Returns the snake_case label used in storage and output.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Paused => "paused",
            Self::Active => "active",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Finalizing => "finalizing",
        }
    }

    /// Parses a snake_case label.
    #[must_use]
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "paused" => Some(Self::Paused),
            "active" => Some(Self::Active),
            "finished" => Some(Self::Finished),
            "failed" => Some(Self::Failed),
            "finalizing" => Some(Self::Finalizing),
            _ => None,
        }
    }

    /// Returns true when no further transitions are possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finished)
    }

    /// Returns true when the worker or a finalize run may execute batches.
    ///
    /// At most one migration per job class is in flight at a time.
    #[must_use]
    pub const fn is_in_flight(self) -> bool {
        matches!(self, Self::Active | Self::Finalizing)
    }

    /// Returns true when `self -> next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Paused, Self::Active | Self::Finalizing)
                | (Self::Active, Self::Paused | Self::Finished | Self::Failed | Self::Finalizing)
                | (Self::Failed, Self::Active)
                | (Self::Finalizing, Self::Finished | Self::Active | Self::Finalizing | Self::Paused)
        )
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Migration definition and lifecycle errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MigrationError {
    /// Migration definition failed validation.
    #[error("invalid migration: {0}")]
    Invalid(String),
    /// Requested status transition is not allowed.
    #[error("illegal status transition from {from} to {to}")]
    IllegalTransition {
        /// Current status.
        from: MigrationStatus,
        /// Requested status.
        to: MigrationStatus,
    },
}

// ============================================================================
// SECTION: Records
// ============================================================================

/// Persistent description of one batched migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRecord {
    /// Store-assigned identifier.
    pub id: MigrationId,
    /// Registry key of the unit of work.
    pub job_class_name: JobClassName,
    /// Table being migrated.
    pub table_name: String,
    /// Ordered key column walked by the batcher.
    pub column_name: String,
    /// Extra arguments passed to the unit of work.
    pub job_arguments: Vec<Value>,
    /// First key of the range (inclusive).
    pub min_value: i64,
    /// Last key of the range (inclusive).
    pub max_value: i64,
    /// Keys per batch.
    pub batch_size: u64,
    /// Keys per sub-batch mutation call.
    pub sub_batch_size: u64,
    /// Minimum seconds between batch executions.
    pub interval_secs: u64,
    /// Lifecycle status.
    pub status: MigrationStatus,
    /// When the most recent batch started.
    pub last_job_started_at: Option<Timestamp>,
    /// When the migration was created.
    pub created_at: Timestamp,
}

impl MigrationRecord {
    /// Returns the throttling interval.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Returns true when the migration is `active`.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == MigrationStatus::Active
    }

    /// Returns the full key range of the migration.
    #[must_use]
    pub fn key_range(&self) -> Option<KeyRange> {
        KeyRange::new(self.min_value, self.max_value)
    }

    /// Returns a batcher over this migration's range and tuning.
    #[must_use]
    pub fn batcher(&self) -> Option<RangeBatcher> {
        self.key_range()
            .map(|bounds| RangeBatcher::new(bounds, self.batch_size, self.sub_batch_size))
    }

    /// Returns true when enough time has passed since the last batch started.
    ///
    /// `variance` relaxes the interval so that many migrations do not lock
    /// step with a scheduler cadence. A migration that never ran is always
    /// elapsed.
    #[must_use]
    pub fn interval_elapsed(&self, now: Timestamp, variance: Duration) -> bool {
        let Some(last_started) = self.last_job_started_at else {
            return true;
        };
        let required = self.interval().saturating_sub(variance);
        now.duration_since(last_started) >= required
    }
}

/// Operator input used to create a migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMigration {
    /// Registry key of the unit of work.
    pub job_class_name: JobClassName,
    /// Table being migrated.
    pub table_name: String,
    /// Ordered key column walked by the batcher.
    pub column_name: String,
    /// Extra arguments passed to the unit of work.
    #[serde(default)]
    pub job_arguments: Vec<Value>,
    /// First key of the range (inclusive).
    pub min_value: i64,
    /// Last key of the range (inclusive).
    pub max_value: i64,
    /// Keys per batch.
    pub batch_size: u64,
    /// Keys per sub-batch mutation call.
    pub sub_batch_size: u64,
    /// Minimum seconds between batch executions.
    pub interval_secs: u64,
    /// Initial status (`active` or `paused`).
    pub status: MigrationStatus,
}

impl NewMigration {
    /// Validates the migration definition.
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError::Invalid`] when bounds, sizes, identifiers, or
    /// the initial status are not acceptable.
    pub fn validate(&self) -> Result<(), MigrationError> {
        let class = self.job_class_name.as_str();
        if class.trim().is_empty() {
            return Err(MigrationError::Invalid("job_class_name must be non-empty".to_string()));
        }
        if class.len() > MAX_JOB_CLASS_NAME_LENGTH {
            return Err(MigrationError::Invalid("job_class_name exceeds max length".to_string()));
        }
        validate_identifier("table_name", &self.table_name, true)?;
        validate_identifier("column_name", &self.column_name, false)?;
        if self.job_arguments.len() > MAX_JOB_ARGUMENTS {
            return Err(MigrationError::Invalid(format!(
                "job_arguments exceeds {MAX_JOB_ARGUMENTS} entries"
            )));
        }
        if self.min_value > self.max_value {
            return Err(MigrationError::Invalid(format!(
                "min_value {} exceeds max_value {}",
                self.min_value, self.max_value
            )));
        }
        if self.batch_size == 0 {
            return Err(MigrationError::Invalid("batch_size must be greater than zero".to_string()));
        }
        if self.sub_batch_size == 0 {
            return Err(MigrationError::Invalid(
                "sub_batch_size must be greater than zero".to_string(),
            ));
        }
        if self.sub_batch_size > self.batch_size {
            return Err(MigrationError::Invalid(
                "sub_batch_size must not exceed batch_size".to_string(),
            ));
        }
        if !matches!(self.status, MigrationStatus::Active | MigrationStatus::Paused) {
            return Err(MigrationError::Invalid(format!(
                "migrations must be created active or paused, not {}",
                self.status
            )));
        }
        Ok(())
    }

    /// Builds the stored record once the store has assigned an identifier.
    #[must_use]
    pub fn into_record(self, id: MigrationId, created_at: Timestamp) -> MigrationRecord {
        MigrationRecord {
            id,
            job_class_name: self.job_class_name,
            table_name: self.table_name,
            column_name: self.column_name,
            job_arguments: self.job_arguments,
            min_value: self.min_value,
            max_value: self.max_value,
            batch_size: self.batch_size,
            sub_batch_size: self.sub_batch_size,
            interval_secs: self.interval_secs,
            status: self.status,
            last_job_started_at: None,
            created_at,
        }
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Validates an SQL identifier (optionally schema-qualified).
fn validate_identifier(field: &str, value: &str, allow_qualified: bool) -> Result<(), MigrationError> {
    if value.is_empty() {
        return Err(MigrationError::Invalid(format!("{field} must be non-empty")));
    }
    if value.len() > MAX_IDENTIFIER_LENGTH {
        return Err(MigrationError::Invalid(format!("{field} exceeds max length")));
    }
    let mut parts = value.split('.');
    let parts_ok = parts.by_ref().take(2).all(is_plain_identifier);
    let qualified = value.contains('.');
    if !parts_ok || parts.next().is_some() || (qualified && !allow_qualified) {
        return Err(MigrationError::Invalid(format!("{field} is not a valid identifier: {value}")));
    }
    Ok(())
}

/// Returns true for `[A-Za-z_][A-Za-z0-9_]*`.
#[must_use]
pub fn is_plain_identifier(part: &str) -> bool {
    let mut chars = part.chars();
    chars.next().is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
        && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

// ============================================================================
// SECTION: Tests
// ============================================================================
