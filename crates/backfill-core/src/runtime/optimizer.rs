// crates/backfill-core/src/runtime/optimizer.rs
// ============================================================================
// Module: Backfill Batch Optimizer
// Description: Adaptive batch sizing from recent job timings.
// Purpose: Keep batch durations close to the migration interval.
// Dependencies: crate::core, serde
// ============================================================================

//! ## Overview
//! Time efficiency is the mean duration of recent succeeded jobs divided by
//! the migration interval. When it falls outside the target band the batch
//! size is scaled by `target_high / efficiency`, capped at `max_multiplier`
//! and clamped to the configured bounds. The result never drops below the
//! migration's sub-batch size.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::core::JobRecord;
use crate::core::MigrationRecord;

// ============================================================================
// SECTION: Configuration
// ============================================================================

/// Default lower bound of the efficiency band.
pub const DEFAULT_TARGET_EFFICIENCY_LOW: f64 = 0.90;
/// Default upper bound of the efficiency band.
pub const DEFAULT_TARGET_EFFICIENCY_HIGH: f64 = 0.95;
/// Default smallest batch size the optimizer will choose.
pub const DEFAULT_MIN_BATCH_SIZE: u64 = 1_000;
/// Default largest batch size the optimizer will choose.
pub const DEFAULT_MAX_BATCH_SIZE: u64 = 2_000_000;
/// Default cap on the per-step growth factor.
pub const DEFAULT_MAX_MULTIPLIER: f64 = 1.2;
/// Default number of recent jobs sampled.
pub const DEFAULT_SAMPLE_SIZE: usize = 20;

/// Batch optimizer tuning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchOptimizerConfig {
    /// Lower bound of the acceptable efficiency band.
    pub target_efficiency_low: f64,
    /// Upper bound of the acceptable efficiency band.
    pub target_efficiency_high: f64,
    /// Smallest batch size allowed.
    pub min_batch_size: u64,
    /// Largest batch size allowed.
    pub max_batch_size: u64,
    /// Cap on the scaling factor applied in one step.
    pub max_multiplier: f64,
    /// Succeeded jobs required before the optimizer acts.
    pub sample_size: usize,
}

impl Default for BatchOptimizerConfig {
    fn default() -> Self {
        Self {
            target_efficiency_low: DEFAULT_TARGET_EFFICIENCY_LOW,
            target_efficiency_high: DEFAULT_TARGET_EFFICIENCY_HIGH,
            min_batch_size: DEFAULT_MIN_BATCH_SIZE,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_multiplier: DEFAULT_MAX_MULTIPLIER,
            sample_size: DEFAULT_SAMPLE_SIZE,
        }
    }
}

impl BatchOptimizerConfig {
    /// Checks that the tuning is internally consistent.
    ///
    /// # Errors
    ///
    /// Returns a description of the first inconsistent setting.
    pub fn validate(&self) -> Result<(), String> {
        let band_ok = self.target_efficiency_low > 0.0
            && self.target_efficiency_low <= self.target_efficiency_high
            && self.target_efficiency_high.is_finite();
        if !band_ok {
            return Err("target efficiency band must satisfy 0 < low <= high".to_string());
        }
        if !(self.max_multiplier.is_finite() && self.max_multiplier >= 1.0) {
            return Err("max_multiplier must be at least 1.0".to_string());
        }
        if self.min_batch_size == 0 || self.min_batch_size > self.max_batch_size {
            return Err("batch size bounds must satisfy 0 < min <= max".to_string());
        }
        if self.sample_size == 0 {
            return Err("sample_size must be greater than zero".to_string());
        }
        Ok(())
    }
}

// ============================================================================
// SECTION: Optimization
// ============================================================================

/// Returns mean job duration divided by `interval`, or `None` without samples.
#[must_use]
pub fn time_efficiency(jobs: &[JobRecord], interval: Duration) -> Option<f64> {
    if interval.is_zero() {
        return None;
    }
    let durations: Vec<Duration> = jobs.iter().filter_map(JobRecord::duration).collect();
    if durations.is_empty() {
        return None;
    }
    let total: f64 = durations.iter().map(Duration::as_secs_f64).sum();
    let samples = f64::from(u32::try_from(durations.len()).unwrap_or(u32::MAX));
    Some(total / samples / interval.as_secs_f64())
}

/// Computes a new batch size for `migration`, or `None` when it should stay.
///
/// `recent` holds the most recently succeeded jobs; fewer than
/// `config.sample_size` of them leaves the size unchanged.
#[must_use]
pub fn optimize_batch_size(
    config: &BatchOptimizerConfig,
    migration: &MigrationRecord,
    recent: &[JobRecord],
) -> Option<u64> {
    if recent.len() < config.sample_size {
        return None;
    }
    let efficiency = time_efficiency(recent, migration.interval())?;
    if efficiency <= 0.0 {
        return None;
    }
    if (config.target_efficiency_low..=config.target_efficiency_high).contains(&efficiency) {
        return None;
    }
    let multiplier = (config.target_efficiency_high / efficiency).min(config.max_multiplier);
    let floor = config.min_batch_size.max(migration.sub_batch_size);
    let ceiling = config.max_batch_size.max(floor);
    let proposed = scale(migration.batch_size, multiplier).clamp(floor, ceiling);
    (proposed != migration.batch_size).then_some(proposed)
}

/// Multiplies `size` by `factor`, rounding down and saturating.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    reason = "Batch sizes are far below f64 precision limits and the product is clamped."
)]
fn scale(size: u64, factor: f64) -> u64 {
    let scaled = (size as f64 * factor).floor();
    if scaled <= 0.0 {
        0
    } else if scaled >= u64::MAX as f64 {
        u64::MAX
    } else {
        scaled as u64
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;
    use crate::core::JobId;
    use crate::core::JobStatus;
    use crate::core::MigrationId;
    use crate::core::MigrationStatus;
    use crate::core::Timestamp;

    fn migration(batch_size: u64, interval_secs: u64) -> MigrationRecord {
        MigrationRecord {
            id: MigrationId::from_raw(1).unwrap_or_else(|| unreachable!()),
            job_class_name: "Backfill".into(),
            table_name: "events".to_string(),
            column_name: "id".to_string(),
            job_arguments: Vec::<Value>::new(),
            min_value: 1,
            max_value: 10_000_000,
            batch_size,
            sub_batch_size: 100,
            interval_secs,
            status: MigrationStatus::Active,
            last_job_started_at: None,
            created_at: Timestamp::EPOCH,
        }
    }

    fn job_taking(seconds: i64, id: u64) -> JobRecord {
        JobRecord {
            id: JobId::from_raw(id).unwrap_or_else(|| unreachable!()),
            migration_id: MigrationId::from_raw(1).unwrap_or_else(|| unreachable!()),
            min_value: 1,
            max_value: 10,
            batch_size: 10,
            sub_batch_size: 5,
            status: JobStatus::Succeeded,
            attempts: 1,
            affected_rows: 10,
            last_error: None,
            started_at: Some(Timestamp::EPOCH),
            finished_at: Some(Timestamp::from_unix_millis(seconds * 1_000)),
        }
    }

    fn config(sample_size: usize) -> BatchOptimizerConfig {
        BatchOptimizerConfig {
            sample_size,
            ..BatchOptimizerConfig::default()
        }
    }

    #[test]
    fn fast_jobs_grow_the_batch_by_at_most_the_cap() {
        let jobs = vec![job_taking(10, 1), job_taking(10, 2)];
        let next = optimize_batch_size(&config(2), &migration(10_000, 120), &jobs);
        assert_eq!(next, Some(12_000));
    }

    #[test]
    fn slow_jobs_shrink_the_batch() {
        let jobs = vec![job_taking(240, 1), job_taking(240, 2)];
        let next = optimize_batch_size(&config(2), &migration(10_000, 120), &jobs);
        assert_eq!(next, Some(4_750));
    }

    #[test]
    fn efficient_jobs_keep_the_batch() {
        let jobs = vec![job_taking(111, 1)];
        assert_eq!(optimize_batch_size(&config(1), &migration(10_000, 120), &jobs), None);
    }

    #[test]
    fn too_few_samples_keep_the_batch() {
        let jobs = vec![job_taking(1, 1)];
        assert_eq!(optimize_batch_size(&config(2), &migration(10_000, 120), &jobs), None);
    }

    #[test]
    fn batch_never_drops_below_bounds() {
        let jobs = vec![job_taking(12_000, 1)];
        let next = optimize_batch_size(&config(1), &migration(1_200, 120), &jobs);
        assert_eq!(next, Some(DEFAULT_MIN_BATCH_SIZE));
    }

    #[test]
    fn invalid_tuning_is_rejected() {
        let mut tuning = BatchOptimizerConfig::default();
        assert!(tuning.validate().is_ok());
        tuning.target_efficiency_low = 0.99;
        assert!(tuning.validate().is_err());
    }
}
