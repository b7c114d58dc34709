//! # Configuration Modules
//!
//! Loading and validation of the ingestion configuration, plus the
//! [`ConfigurationError`] taxonomy shared by everything that consumes it.

/// Ingestion configuration schema, defaults, and validation.
pub mod config_ingest;

pub use config_ingest::{
    default_bindings, BrokerConfig, ConfigurationError, IngestConfig, ModeConfig, ModeKind,
    ReconnectConfig, RetentionConfig,
};
