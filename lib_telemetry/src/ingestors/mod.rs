//! # Data Ingestors Module
//!
//! The "front door" for device telemetry entering the engine. It owns
//! everything that touches the publish/subscribe bus: the connector
//! abstraction, the MQTT implementation, reconnect backoff, and the ingestion
//! loop that routes raw events through the decoder into the state store.
//!
//! ## Contained Modules:
//! - **`bus`**: `BusConnector` / `BusSession` traits and the `ConnectionError`
//!   taxonomy.
//! - **`mqtt_bus`**: `rumqttc`-backed implementation of the bus traits
//!   (behind the `mqtt` feature).
//! - **`backoff`**: Exponential, capped reconnect delays.
//! - **`ingestion_loop`**: Persistent and poll-mode ingestion over any bus.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Bus connector and session traits.
pub mod bus;
/// MQTT implementation of the bus traits.
#[cfg(feature = "mqtt")]
pub mod mqtt_bus;
/// Reconnect backoff policy.
pub mod backoff;
/// The ingestion loop.
pub mod ingestion_loop;

// --- Public API Re-exports ---
pub use backoff::{Backoff, BackoffPolicy};
pub use bus::{BrokerEndpoint, BusConnector, BusMessage, BusSession, ConnectionError};
pub use ingestion_loop::{
    ingest_message, Disposition, IngestionLoop, IngestionMode, IngestionSettings, LinkState,
    PollReport,
};
#[cfg(feature = "mqtt")]
pub use mqtt_bus::{MqttConnector, MqttSession};
