//! # Channel Decoder
//!
//! Maps a bus channel name to a typed device field and turns the raw payload
//! bytes published on that channel into a [`FieldValue`].
//!
//! ## Key Design Principles:
//! - **Static Routing Table**: Bindings are registered once at startup and are
//!   never mutated afterwards, so the decoder can be shared behind an `Arc`
//!   without any locking.
//! - **Unknown Channels Are Not Errors**: Devices publish on more topics than we
//!   track. A channel without a binding decodes to `Ok(None)` and the event is
//!   dropped silently.
//! - **Fail-Safe Booleans**: Actuator channels publish `"1"` for active. Any
//!   other payload, including garbage, reads as `false`.
//! - **Pure**: Decoding never touches shared state. The caller decides what to
//!   do with the resulting [`FieldUpdate`].

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::configs::ConfigurationError;

/// # Field Name
///
/// The closed set of device fields the engine tracks. Each field has a fixed
/// value kind, see [`FieldName::kind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldName {
    /// Ambient temperature in degrees Celsius.
    Temperature,
    /// Ambient luminosity in percent.
    Luminosity,
    /// Whether the fan motor is running.
    MotorActive,
    /// Whether the servo is engaged.
    ServoActive,
    /// Whether the buzzer is sounding.
    BuzzerActive,
    /// Whether the alarm has been disarmed on the device.
    AlarmDisabled,
}

impl FieldName {
    /// Every tracked field, in display order.
    pub const ALL: [FieldName; 6] = [
        FieldName::Temperature,
        FieldName::Luminosity,
        FieldName::MotorActive,
        FieldName::ServoActive,
        FieldName::BuzzerActive,
        FieldName::AlarmDisabled,
    ];

    /// The value kind carried by this field.
    pub fn kind(self) -> PayloadKind {
        match self {
            FieldName::Temperature | FieldName::Luminosity => PayloadKind::Numeric,
            FieldName::MotorActive
            | FieldName::ServoActive
            | FieldName::BuzzerActive
            | FieldName::AlarmDisabled => PayloadKind::Boolean,
        }
    }

    /// The camelCase name used in configuration files and JSON output.
    pub fn as_str(self) -> &'static str {
        match self {
            FieldName::Temperature => "temperature",
            FieldName::Luminosity => "luminosity",
            FieldName::MotorActive => "motorActive",
            FieldName::ServoActive => "servoActive",
            FieldName::BuzzerActive => "buzzerActive",
            FieldName::AlarmDisabled => "alarmDisabled",
        }
    }
}

impl fmt::Display for FieldName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldName {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FieldName::ALL
            .into_iter()
            .find(|field| field.as_str() == s)
            .ok_or_else(|| ConfigurationError::UnknownField(s.to_string()))
    }
}

/// How a payload is interpreted for a given field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    /// UTF-8 base-10 floating-point literal.
    Numeric,
    /// `"1"` is `true`, anything else is `false`.
    Boolean,
}

impl PayloadKind {
    /// Decodes `payload` according to this kind.
    ///
    /// `channel` is only used to build a meaningful [`DecodeError`].
    pub fn decode(self, channel: &str, payload: &[u8]) -> Result<FieldValue, DecodeError> {
        match self {
            PayloadKind::Numeric => decode_numeric(channel, payload).map(FieldValue::Number),
            PayloadKind::Boolean => Ok(FieldValue::Flag(payload == b"1")),
        }
    }
}

/// A decoded field value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Value of a numeric sensor field.
    Number(f64),
    /// Value of a boolean actuator field.
    Flag(bool),
}

impl FieldValue {
    /// Returns the numeric value, if this is a numeric field value.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number(v) => Some(*v),
            FieldValue::Flag(_) => None,
        }
    }

    /// Returns the flag, if this is a boolean field value.
    pub fn as_flag(&self) -> Option<bool> {
        match self {
            FieldValue::Flag(v) => Some(*v),
            FieldValue::Number(_) => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Number(v) => write!(f, "{}", v),
            FieldValue::Flag(v) => write!(f, "{}", v),
        }
    }
}

/// A single decoded event, ready to be recorded in the state store.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldUpdate {
    /// The field the event targets.
    pub field: FieldName,
    /// The decoded value.
    pub value: FieldValue,
}

/// Raised when a numeric channel carries a payload that is not a number.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot decode payload {payload:?} on channel {channel}")]
pub struct DecodeError {
    /// The channel the payload arrived on.
    pub channel: String,
    /// The raw payload, lossily converted to text for logging.
    pub payload: String,
}

impl DecodeError {
    fn new(channel: &str, payload: &[u8]) -> Self {
        Self {
            channel: channel.to_string(),
            payload: String::from_utf8_lossy(payload).into_owned(),
        }
    }
}

fn decode_numeric(channel: &str, payload: &[u8]) -> Result<f64, DecodeError> {
    let text = std::str::from_utf8(payload).map_err(|_| DecodeError::new(channel, payload))?;
    match text.trim().parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(DecodeError::new(channel, payload)),
    }
}

/// # Channel Binding
///
/// Routes one bus channel to one device field. The decode function is implied
/// by the field's [`PayloadKind`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelBinding {
    /// Bus channel (MQTT topic) name.
    pub channel: String,
    /// Field updated by messages on `channel`.
    pub field: FieldName,
}

impl ChannelBinding {
    /// Creates a binding for `channel` targeting `field`.
    pub fn new(channel: impl Into<String>, field: FieldName) -> Self {
        Self {
            channel: channel.into(),
            field,
        }
    }

    /// The decoder applied to payloads on this channel.
    pub fn kind(&self) -> PayloadKind {
        self.field.kind()
    }
}

/// # Channel Decoder
///
/// Immutable routing table from channel name to [`ChannelBinding`].
#[derive(Debug, Clone)]
pub struct ChannelDecoder {
    bindings: HashMap<String, ChannelBinding>,
    // Subscription order follows registration order.
    channels: Vec<String>,
}

impl ChannelDecoder {
    /// Builds a decoder from static bindings.
    ///
    /// Fails with [`ConfigurationError`] if the list is empty, a channel name is
    /// blank, or a channel is bound more than once.
    pub fn new(
        bindings: impl IntoIterator<Item = ChannelBinding>,
    ) -> Result<Self, ConfigurationError> {
        let mut table = HashMap::new();
        let mut channels = Vec::new();

        for binding in bindings {
            if binding.channel.trim().is_empty() {
                return Err(ConfigurationError::EmptyChannel(binding.field));
            }
            if table.contains_key(&binding.channel) {
                return Err(ConfigurationError::DuplicateChannel(binding.channel));
            }
            channels.push(binding.channel.clone());
            table.insert(binding.channel.clone(), binding);
        }

        if table.is_empty() {
            return Err(ConfigurationError::NoBindings);
        }

        Ok(Self {
            bindings: table,
            channels,
        })
    }

    /// Channels to subscribe to, in registration order.
    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    /// Looks up the binding registered for `channel`.
    pub fn binding(&self, channel: &str) -> Option<&ChannelBinding> {
        self.bindings.get(channel)
    }

    /// Whether some channel is bound to `field`.
    pub fn binds_field(&self, field: FieldName) -> bool {
        self.bindings.values().any(|b| b.field == field)
    }

    /// Decodes one raw bus event.
    ///
    /// Returns `Ok(None)` for channels outside the tracked set.
    pub fn decode(
        &self,
        channel: &str,
        payload: &[u8],
    ) -> Result<Option<FieldUpdate>, DecodeError> {
        let Some(binding) = self.bindings.get(channel) else {
            return Ok(None);
        };
        let value = binding.kind().decode(channel, payload)?;
        Ok(Some(FieldUpdate {
            field: binding.field,
            value,
        }))
    }
}
