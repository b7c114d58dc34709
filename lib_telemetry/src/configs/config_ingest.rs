//! # Ingestion Configuration
//!
//! Serializable description of one ingestion deployment: broker endpoint,
//! channel bindings, primary trigger field, operating mode, reconnect backoff,
//! history retention, and queue sizing.
//!
//! The JSON form uses camelCase keys. Every section has defaults, so a file
//! only needs to mention what differs from the stock ESP32 deployment:
//!
//! ```json
//! {
//!   "broker": { "host": "10.0.0.12" },
//!   "mode": { "kind": "poll", "pollWindowMs": 400, "pollIntervalMs": 1000 },
//!   "retention": { "maxSnapshots": 5000, "maxAgeSecs": 3600 }
//! }
//! ```
//!
//! Validation runs before ingestion starts. Any [`ConfigurationError`] is fatal
//! at startup.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::decoder::{ChannelBinding, ChannelDecoder, FieldName};
use crate::core::state_store::RetentionPolicy;
use crate::ingestors::backoff::BackoffPolicy;
use crate::ingestors::bus::BrokerEndpoint;
use crate::ingestors::ingestion_loop::{IngestionMode, IngestionSettings};

/// Errors detected while loading or validating the ingestion configuration.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// No channel bindings were configured.
    #[error("no channel bindings configured")]
    NoBindings,

    /// A binding has a blank channel name.
    #[error("binding for field {0} has an empty channel name")]
    EmptyChannel(FieldName),

    /// The same channel is bound twice.
    #[error("channel {0} is bound more than once")]
    DuplicateChannel(String),

    /// A field name in the configuration is not one of the tracked fields.
    #[error("unknown field name: {0}")]
    UnknownField(String),

    /// The primary trigger field has no channel, so no snapshot would ever be taken.
    #[error("primary field {0} is not bound to any channel")]
    PrimaryFieldUnbound(FieldName),

    /// Retention has neither a count nor an age bound.
    #[error("retention must set maxSnapshots and/or maxAgeSecs to a non-zero value")]
    UnboundedRetention,

    /// A scalar setting is out of range.
    #[error("invalid setting {name}: {reason}")]
    InvalidSetting {
        /// Offending key.
        name: &'static str,
        /// Why it was rejected.
        reason: String,
    },

    /// The configuration file could not be read.
    #[error("I/O error occurred: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid JSON for this schema.
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}

fn invalid(name: &'static str, reason: impl Into<String>) -> ConfigurationError {
    ConfigurationError::InvalidSetting {
        name,
        reason: reason.into(),
    }
}

/// Broker connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrokerConfig {
    /// Broker host name or address.
    pub host: String,
    /// Broker TCP port.
    pub port: u16,
    /// MQTT client identifier.
    pub client_id: String,
    /// Keep-alive interval in seconds.
    pub keep_alive_secs: u64,
    /// Connect handshake timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Outgoing request queue capacity of the MQTT client. Must be at least
    /// the number of bound channels.
    pub request_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "telemetry-dashboard".to_string(),
            keep_alive_secs: 60,
            connect_timeout_ms: 5_000,
            request_capacity: 32,
        }
    }
}

/// Which connection strategy to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum ModeKind {
    /// Long-lived connection with reconnect backoff.
    #[default]
    Persistent,
    /// Short connect / collect / disconnect cycle per refresh tick.
    Poll,
}

/// Operating mode settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModeConfig {
    /// Persistent or poll.
    pub kind: ModeKind,
    /// Poll mode: how long each tick collects messages.
    pub poll_window_ms: u64,
    /// Poll mode: time between ticks.
    pub poll_interval_ms: u64,
}

impl Default for ModeConfig {
    fn default() -> Self {
        Self {
            kind: ModeKind::Persistent,
            poll_window_ms: 400,
            poll_interval_ms: 1_000,
        }
    }
}

/// Reconnect backoff settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectConfig {
    /// First retry delay in milliseconds.
    pub base_delay_ms: u64,
    /// Largest retry delay in milliseconds.
    pub max_delay_ms: u64,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
        }
    }
}

/// History retention settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetentionConfig {
    /// Keep at most this many snapshots.
    pub max_snapshots: Option<usize>,
    /// Drop snapshots older than this many seconds.
    pub max_age_secs: Option<u64>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_snapshots: Some(10_000),
            max_age_secs: None,
        }
    }
}

/// # Ingest Config
///
/// Root of the configuration tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IngestConfig {
    /// Broker connection settings.
    pub broker: BrokerConfig,
    /// Channel to field routing.
    pub channels: Vec<ChannelBinding>,
    /// Field whose updates append history snapshots.
    pub primary_field: FieldName,
    /// Operating mode.
    pub mode: ModeConfig,
    /// Reconnect backoff.
    pub reconnect: ReconnectConfig,
    /// History retention.
    pub retention: RetentionConfig,
    /// Capacity of the queue between the bus session and the state writer.
    pub queue_capacity: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            channels: default_bindings(),
            primary_field: FieldName::Temperature,
            mode: ModeConfig::default(),
            reconnect: ReconnectConfig::default(),
            retention: RetentionConfig::default(),
            queue_capacity: 256,
        }
    }
}

/// The six channels published by the ESP32 firmware.
pub fn default_bindings() -> Vec<ChannelBinding> {
    vec![
        ChannelBinding::new("esp32/sensors/temperature", FieldName::Temperature),
        ChannelBinding::new("esp32/sensors/luminosity", FieldName::Luminosity),
        ChannelBinding::new("esp32/state/motor", FieldName::MotorActive),
        ChannelBinding::new("esp32/state/servo", FieldName::ServoActive),
        ChannelBinding::new("esp32/state/buzzer", FieldName::BuzzerActive),
        ChannelBinding::new("esp32/state/alarm", FieldName::AlarmDisabled),
    ]
}

impl IngestConfig {
    /// Reads and validates a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let text = fs::read_to_string(path)?;
        let config: IngestConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every invariant the engine relies on.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.channels.is_empty() {
            return Err(ConfigurationError::NoBindings);
        }
        let mut seen = HashSet::new();
        for binding in &self.channels {
            if binding.channel.trim().is_empty() {
                return Err(ConfigurationError::EmptyChannel(binding.field));
            }
            if !seen.insert(binding.channel.as_str()) {
                return Err(ConfigurationError::DuplicateChannel(binding.channel.clone()));
            }
        }
        if !self.channels.iter().any(|b| b.field == self.primary_field) {
            return Err(ConfigurationError::PrimaryFieldUnbound(self.primary_field));
        }

        if self.broker.host.trim().is_empty() {
            return Err(invalid("broker.host", "must not be empty"));
        }
        if self.broker.port == 0 {
            return Err(invalid("broker.port", "must be non-zero"));
        }
        if self.broker.connect_timeout_ms == 0 {
            return Err(invalid("broker.connectTimeoutMs", "must be non-zero"));
        }
        if self.broker.request_capacity < self.channels.len() {
            return Err(invalid(
                "broker.requestCapacity",
                format!("must be at least the number of bound channels ({})", self.channels.len()),
            ));
        }

        if self.mode.kind == ModeKind::Poll {
            if self.mode.poll_window_ms == 0 {
                return Err(invalid("mode.pollWindowMs", "must be non-zero"));
            }
            if self.mode.poll_interval_ms < self.mode.poll_window_ms {
                return Err(invalid("mode.pollIntervalMs", "must be at least pollWindowMs"));
            }
        }

        if self.reconnect.base_delay_ms == 0 {
            return Err(invalid("reconnect.baseDelayMs", "must be non-zero"));
        }
        if self.reconnect.max_delay_ms < self.reconnect.base_delay_ms {
            return Err(invalid("reconnect.maxDelayMs", "must be at least baseDelayMs"));
        }
        if !(self.reconnect.multiplier.is_finite() && self.reconnect.multiplier > 1.0) {
            return Err(invalid("reconnect.multiplier", "must be a finite number greater than 1"));
        }

        self.retention_policy()?;

        if self.queue_capacity == 0 {
            return Err(invalid("queueCapacity", "must be non-zero"));
        }
        Ok(())
    }

    /// Builds the channel decoder from the configured bindings.
    pub fn decoder(&self) -> Result<ChannelDecoder, ConfigurationError> {
        ChannelDecoder::new(self.channels.iter().cloned())
    }

    /// Retention policy for the state store. A zero bound counts as unset.
    pub fn retention_policy(&self) -> Result<RetentionPolicy, ConfigurationError> {
        RetentionPolicy::new(
            self.retention.max_snapshots.filter(|n| *n > 0),
            self.retention.max_age_secs.filter(|s| *s > 0).map(Duration::from_secs),
        )
    }

    /// Broker endpoint for the bus connector.
    pub fn endpoint(&self) -> BrokerEndpoint {
        BrokerEndpoint {
            host: self.broker.host.clone(),
            port: self.broker.port,
            client_id: self.broker.client_id.clone(),
            connect_timeout: Duration::from_millis(self.broker.connect_timeout_ms),
            keep_alive: Duration::from_secs(self.broker.keep_alive_secs),
            request_capacity: self.broker.request_capacity,
        }
    }

    /// Settings for the ingestion loop.
    pub fn ingestion_settings(&self) -> IngestionSettings {
        let mode = match self.mode.kind {
            ModeKind::Persistent => IngestionMode::Persistent,
            ModeKind::Poll => IngestionMode::Poll {
                window: Duration::from_millis(self.mode.poll_window_ms),
                interval: Duration::from_millis(self.mode.poll_interval_ms),
            },
        };
        IngestionSettings {
            endpoint: self.endpoint(),
            mode,
            backoff: BackoffPolicy {
                base_delay: Duration::from_millis(self.reconnect.base_delay_ms),
                max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
                multiplier: self.reconnect.multiplier,
            },
            queue_capacity: self.queue_capacity,
        }
    }
}
