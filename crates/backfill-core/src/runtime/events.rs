// crates/backfill-core/src/runtime/events.rs
// ============================================================================
// Module: Backfill Migration Events
// Description: Structured log events for worker ticks and batch execution.
// Purpose: Emit JSON-line logs without hard dependencies on a logging stack.
// Dependencies: crate::core, serde, serde_json
// ============================================================================

//! ## Overview
//! Every decision the worker makes and every batch the runner executes is
//! reported as a [`MigrationEvent`] carrying the worker name, the tracking
//! database, the migration identity, and timing context. Sinks route events
//! to stderr, an append-only file, memory (tests), or nowhere. Sink failures
//! are swallowed; logging never fails a tick.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs::OpenOptions;
use std::io;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

use crate::core::JobClassName;
use crate::core::JobId;
use crate::core::JobRecord;
use crate::core::KeyRange;
use crate::core::MigrationId;
use crate::core::MigrationRecord;
use crate::core::Timestamp;

// ============================================================================
// SECTION: Types
// ============================================================================

/// Event kinds emitted by the worker and runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationEventKind {
    /// The worker returned without running a batch.
    WorkerSkipped,
    /// Another process holds the worker lease.
    LeaseNotAcquired,
    /// Releasing the worker lease failed; it will expire on its own.
    LeaseReleaseFailed,
    /// A batch started.
    BatchStarted,
    /// A batch completed every sub-batch.
    BatchSucceeded,
    /// A sub-batch failed.
    BatchFailed,
    /// The migration covered its whole range.
    MigrationFinished,
    /// The failure policy stopped the migration.
    MigrationFailed,
    /// The optimizer changed the batch size.
    BatchSizeOptimized,
    /// An operator started synchronous finalization.
    FinalizeStarted,
}

impl MigrationEventKind {
    /// Returns the stable event label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::WorkerSkipped => "worker_skipped",
            Self::LeaseNotAcquired => "lease_not_acquired",
            Self::LeaseReleaseFailed => "lease_release_failed",
            Self::BatchStarted => "batch_started",
            Self::BatchSucceeded => "batch_succeeded",
            Self::BatchFailed => "batch_failed",
            Self::MigrationFinished => "migration_finished",
            Self::MigrationFailed => "migration_failed",
            Self::BatchSizeOptimized => "batch_size_optimized",
            Self::FinalizeStarted => "finalize_started",
        }
    }
}

/// Worker identity attached to every event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventScope {
    /// Worker name (also its lease key).
    pub worker: String,
    /// Tracking database label.
    pub database: String,
}

impl EventScope {
    /// Creates a scope for the given worker and tracking database.
    #[must_use]
    pub fn new(worker: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            worker: worker.into(),
            database: database.into(),
        }
    }
}

/// Structured migration log event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationEvent {
    /// Event kind.
    pub event: MigrationEventKind,
    /// Event timestamp (milliseconds since epoch).
    pub timestamp_ms: i64,
    /// Worker name.
    pub worker: String,
    /// Tracking database label.
    pub database: String,
    /// Migration identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub migration_id: Option<MigrationId>,
    /// Job class of the migration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_class_name: Option<JobClassName>,
    /// Target table.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table_name: Option<String>,
    /// Job identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    /// First key of the batch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_value: Option<i64>,
    /// Last key of the batch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_value: Option<i64>,
    /// Attempt number of the job.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    /// Rows affected by the batch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affected_rows: Option<u64>,
    /// Batch duration in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Free-form detail (skip reason, error text, size change).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl MigrationEvent {
    /// Creates an event with only the scope populated.
    #[must_use]
    pub fn new(event: MigrationEventKind, scope: &EventScope, at: Timestamp) -> Self {
        Self {
            event,
            timestamp_ms: at.as_unix_millis(),
            worker: scope.worker.clone(),
            database: scope.database.clone(),
            migration_id: None,
            job_class_name: None,
            table_name: None,
            job_id: None,
            min_value: None,
            max_value: None,
            attempts: None,
            affected_rows: None,
            duration_ms: None,
            message: None,
        }
    }

    /// Attaches migration identity.
    #[must_use]
    pub fn with_migration(mut self, migration: &MigrationRecord) -> Self {
        self.migration_id = Some(migration.id);
        self.job_class_name = Some(migration.job_class_name.clone());
        self.table_name = Some(migration.table_name.clone());
        self
    }

    /// Attaches job identity, range, attempts, and outcome counters.
    #[must_use]
    pub fn with_job(mut self, job: &JobRecord) -> Self {
        self.job_id = Some(job.id);
        self.min_value = Some(job.min_value);
        self.max_value = Some(job.max_value);
        self.attempts = Some(job.attempts);
        self.affected_rows = Some(job.affected_rows);
        self.duration_ms = job.duration().map(duration_millis);
        self
    }

    /// Attaches a key range without a job.
    #[must_use]
    pub const fn with_range(mut self, range: KeyRange) -> Self {
        self.min_value = Some(range.start());
        self.max_value = Some(range.end());
        self
    }

    /// Attaches a free-form message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Converts a duration to whole milliseconds, saturating.
fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// ============================================================================
// SECTION: Trait
// ============================================================================

/// Destination for migration events.
pub trait MigrationEventSink: Send + Sync {
    /// Records an event.
    fn record(&self, event: &MigrationEvent);
}

// ============================================================================
// SECTION: Sinks
// ============================================================================

/// Event sink that logs JSON lines to stderr.
pub struct StderrEventSink;

impl MigrationEventSink for StderrEventSink {
    fn record(&self, event: &MigrationEvent) {
        if let Ok(payload) = serde_json::to_string(event) {
            let _ = writeln!(std::io::stderr(), "{payload}");
        }
    }
}

/// Event sink that appends JSON lines to a file.
pub struct FileEventSink {
    /// File handle used for append-only logging.
    file: Mutex<std::fs::File>,
}

impl FileEventSink {
    /// Opens the log file in append mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn new(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl MigrationEventSink for FileEventSink {
    fn record(&self, event: &MigrationEvent) {
        if let Ok(payload) = serde_json::to_string(event)
            && let Ok(mut file) = self.file.lock()
        {
            let _ = writeln!(file, "{payload}");
            let _ = file.flush();
        }
    }
}

/// No-op event sink.
pub struct NoopEventSink;

impl MigrationEventSink for NoopEventSink {
    fn record(&self, _event: &MigrationEvent) {}
}

/// Event sink that keeps events in memory; clones share the buffer.
#[derive(Debug, Default, Clone)]
pub struct InMemoryEventSink {
    /// Recorded events in arrival order.
    events: Arc<Mutex<Vec<MigrationEvent>>>,
}

impl InMemoryEventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of recorded events.
    #[must_use]
    pub fn events(&self) -> Vec<MigrationEvent> {
        self.events.lock().map(|events| events.clone()).unwrap_or_default()
    }

    /// Returns the kinds of recorded events in order.
    #[must_use]
    pub fn kinds(&self) -> Vec<MigrationEventKind> {
        self.events().into_iter().map(|event| event.event).collect()
    }
}

impl MigrationEventSink for InMemoryEventSink {
    fn record(&self, event: &MigrationEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_without_empty_fields() {
        let scope = EventScope::new("batched_background_migration_worker", "main");
        let event =
            MigrationEvent::new(MigrationEventKind::WorkerSkipped, &scope, Timestamp::EPOCH)
                .with_message("skipping migration execution");
        let payload = serde_json::to_value(&event).unwrap_or_default();
        assert_eq!(payload["event"], "worker_skipped");
        assert_eq!(payload["database"], "main");
        assert!(payload.get("job_id").is_none());
    }

    #[test]
    fn file_sink_appends_json_lines() {
        let Ok(dir) = tempfile::tempdir() else {
            return;
        };
        let path = dir.path().join("events.jsonl");
        let Ok(sink) = FileEventSink::new(&path) else {
            return;
        };
        let scope = EventScope::new("worker", "main");
        sink.record(&MigrationEvent::new(MigrationEventKind::BatchStarted, &scope, Timestamp::EPOCH));
        sink.record(&MigrationEvent::new(MigrationEventKind::BatchFailed, &scope, Timestamp::EPOCH));
        let contents = std::fs::read_to_string(&path).unwrap_or_default();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.contains("\"batch_failed\""));
    }
}
