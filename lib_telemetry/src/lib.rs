//! # lib_telemetry
//!
//! Device telemetry ingestion and state aggregation.
//!
//! Field devices publish scalar readings and actuator flags on a
//! publish/subscribe bus. This crate subscribes to those channels, decodes each
//! payload into a typed field update, folds the updates into a single
//! latest-value [`DeviceState`], and appends a timestamped [`Snapshot`] to a
//! retention-bounded history every time the primary field (temperature by
//! default) changes. Consumers read the state and history through a
//! [`ConsumerView`] without ever blocking ingestion for long.
//!
//! ## Layout
//! - **`configs`**: JSON configuration, defaults, validation.
//! - **`core`**: decoder, state store, consumer view.
//! - **`ingestors`**: bus traits, MQTT client, backoff, ingestion loop.
//! - **`loggers`**: `tracing` subscriber setup (feature `loggers`).
//!
//! ## Example
//! ```no_run
//! use std::sync::Arc;
//! use lib_telemetry::{ConsumerView, DeviceStateStore, IngestConfig, IngestionLoop, MqttConnector};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> Result<(), lib_telemetry::ConfigurationError> {
//! let config = IngestConfig::default();
//! config.validate()?;
//! let retention = config.retention_policy()?;
//! let store = Arc::new(DeviceStateStore::new(config.primary_field, retention));
//! let view = ConsumerView::new(Arc::clone(&store));
//! let ingestion = IngestionLoop::new(
//!     MqttConnector::new(),
//!     Arc::new(config.decoder()?),
//!     store,
//!     config.ingestion_settings(),
//! );
//! let shutdown = CancellationToken::new();
//! tokio::spawn(async move { ingestion.run(shutdown).await });
//! println!("{:?}", view.current_state());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

pub mod configs;
pub mod core;
pub mod ingestors;
#[cfg(feature = "loggers")]
pub mod loggers;

pub use configs::{ConfigurationError, IngestConfig, ModeKind};
pub use self::core::{
    ChannelBinding, ChannelDecoder, ConsumerView, DecodeError, DeviceState, DeviceStateStore,
    FieldName, FieldUpdate, FieldValue, HistoryCursor, PayloadKind, RetentionPolicy, Snapshot,
};
pub use ingestors::{
    ingest_message, Backoff, BackoffPolicy, BrokerEndpoint, BusConnector, BusMessage, BusSession,
    ConnectionError, Disposition, IngestionLoop, IngestionMode, IngestionSettings, LinkState,
    PollReport,
};
#[cfg(feature = "mqtt")]
pub use ingestors::{MqttConnector, MqttSession};
#[cfg(feature = "loggers")]
pub use loggers::{setup_logging, LogOptions, LoggingGuard};
