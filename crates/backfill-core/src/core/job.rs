// crates/backfill-core/src/core/job.rs
// ============================================================================
// Module: Backfill Job Records
// Description: Per-batch execution records owned by a migration.
// Purpose: Track the range, outcome, attempts, and timing of every batch.
// Dependencies: serde
// ============================================================================

//! ## Overview
//! Each batch a migration executes is recorded as a [`JobRecord`]. The
//! succeeded jobs of a migration form its progress cursor; a job that is not
//! succeeded blocks the cursor and is re-attempted over the exact same range.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::core::identifiers::JobId;
use crate::core::identifiers::MigrationId;
use crate::core::range::KeyRange;
use crate::core::time::Timestamp;

// ============================================================================
// SECTION: Status
// ============================================================================

/// Execution status of a batch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Recorded but not started.
    Pending,
    /// Currently executing (or interrupted by a crash).
    Running,
    /// Every sub-batch completed.
    Succeeded,
    /// A sub-batch failed; the range will be retried.
    Failed,
}

impl JobStatus {
    /// Returns the stable integer code for the status.
    #[must_use]
    pub const fn code(self) -> i64 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Failed => 2,
            Self::Succeeded => 3,
        }
    }

    /// Parses an integer status code.
    #[must_use]
    pub const fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Pending),
            1 => Some(Self::Running),
            2 => Some(Self::Failed),
            3 => Some(Self::Succeeded),
            _ => None,
        }
    }

    /// Returns the snake_case label used in storage and output.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    /// Parses a snake_case label.
    #[must_use]
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Returns true when the job still has to (re)run.
    #[must_use]
    pub const fn is_unfinished(self) -> bool {
        !matches!(self, Self::Succeeded)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ============================================================================
// SECTION: Records
// ============================================================================

/// Persistent record of one batch execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Store-assigned identifier.
    pub id: JobId,
    /// Owning migration.
    pub migration_id: MigrationId,
    /// First key of the batch (inclusive).
    pub min_value: i64,
    /// Last key of the batch (inclusive).
    pub max_value: i64,
    /// Batch size in effect when the job was created.
    pub batch_size: u64,
    /// Sub-batch size in effect when the job was created.
    pub sub_batch_size: u64,
    /// Execution status.
    pub status: JobStatus,
    /// Number of times this range has been attempted.
    pub attempts: u32,
    /// Rows reported as affected by the unit of work.
    pub affected_rows: u64,
    /// Last failure message, if any.
    pub last_error: Option<String>,
    /// When the latest attempt started.
    pub started_at: Option<Timestamp>,
    /// When the latest attempt finished.
    pub finished_at: Option<Timestamp>,
}

impl JobRecord {
    /// Returns the batch range.
    #[must_use]
    pub const fn range(&self) -> Option<KeyRange> {
        KeyRange::new(self.min_value, self.max_value)
    }

    /// Returns the duration of the latest attempt when both ends are recorded.
    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        match (self.started_at, self.finished_at) {
            (Some(started), Some(finished)) => Some(finished.duration_since(started)),
            _ => None,
        }
    }
}

/// Input used to create a job record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    /// Owning migration.
    pub migration_id: MigrationId,
    /// Batch range.
    pub range: KeyRange,
    /// Batch size in effect.
    pub batch_size: u64,
    /// Sub-batch size in effect.
    pub sub_batch_size: u64,
    /// Initial status.
    pub status: JobStatus,
    /// Start time of the first attempt.
    pub started_at: Option<Timestamp>,
}

impl NewJob {
    /// Builds the stored record once the store has assigned an identifier.
    #[must_use]
    pub fn into_record(self, id: JobId) -> JobRecord {
        JobRecord {
            id,
            migration_id: self.migration_id,
            min_value: self.range.start(),
            max_value: self.range.end(),
            batch_size: self.batch_size,
            sub_batch_size: self.sub_batch_size,
            status: self.status,
            attempts: u32::from(self.status == JobStatus::Running),
            affected_rows: 0,
            last_error: None,
            started_at: self.started_at,
            finished_at: None,
        }
    }
}
