// crates/backfill-config/src/lib.rs
// ============================================================================
// Module: Backfill Config
// Description: Configuration model for the backfill worker and CLI.
// Purpose: Load and validate backfill.toml.
// Dependencies: backfill-core, backfill-store-sqlite, serde, toml
// ============================================================================

//! ## Overview
//! Canonical configuration for the backfill engine. See [`BackfillConfig`].

pub mod config;

pub use config::BackfillConfig;
pub use config::CONFIG_ENV_VAR;
pub use config::ConfigError;
pub use config::DEFAULT_CONFIG_NAME;
pub use config::LogSink;
pub use config::LoggingConfig;
pub use config::MAX_CONFIG_FILE_SIZE;
pub use config::OptimizerConfig;
pub use config::RetryConfig;
pub use config::TargetConfig;
pub use config::WorkerSection;
