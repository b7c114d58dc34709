//! # Message Bus Abstraction
//!
//! The ingestion loop talks to the publish/subscribe bus only through the two
//! traits in this module. The production implementation lives in
//! [`mqtt_bus`](crate::ingestors::mqtt_bus); tests drive the loop with an
//! in-memory implementation.
//!
//! A [`BusConnector`] opens sessions. A [`BusSession`] is one live connection:
//! subscribe to channels, await the next delivered message, disconnect.
//!
//! Subscribing covers every bound channel in one call and resolves only once
//! the broker has accepted (or rejected) all of them.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

/// Where and how to reach the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    /// Broker host name or address.
    pub host: String,
    /// Broker TCP port.
    pub port: u16,
    /// Client identifier presented to the broker.
    pub client_id: String,
    /// Upper bound on the connect handshake.
    pub connect_timeout: Duration,
    /// Keep-alive interval negotiated with the broker.
    pub keep_alive: Duration,
    /// Capacity of the client's outgoing request queue.
    pub request_capacity: usize,
}

impl Default for BrokerEndpoint {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "telemetry-dashboard".to_string(),
            connect_timeout: Duration::from_secs(5),
            keep_alive: Duration::from_secs(60),
            request_capacity: 32,
        }
    }
}

/// One message delivered by the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    /// Channel the message was published on.
    pub channel: String,
    /// Raw payload bytes.
    pub payload: Bytes,
}

impl BusMessage {
    /// Builds a message from anything convertible to a channel name and bytes.
    pub fn new(channel: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }
}

/// Bus unreachable, refused, timed out, or dropped mid-session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// The connect handshake did not complete within the configured timeout.
    #[error("connection to {host}:{port} timed out after {timeout:?}")]
    Timeout {
        /// Broker host.
        host: String,
        /// Broker port.
        port: u16,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// The broker could not be reached or refused the connection.
    #[error("connection to {host}:{port} failed: {reason}")]
    Refused {
        /// Broker host.
        host: String,
        /// Broker port.
        port: u16,
        /// Transport or protocol detail.
        reason: String,
    },

    /// A subscription request could not be issued or the broker rejected it.
    #[error("subscribe to {channel} failed: {reason}")]
    Subscribe {
        /// Channel that failed.
        channel: String,
        /// Transport or protocol detail.
        reason: String,
    },

    /// An established connection was lost.
    #[error("connection lost: {0}")]
    Dropped(String),
}

/// Opens sessions against a broker.
pub trait BusConnector: Send + Sync + 'static {
    /// The session type produced by [`connect`](Self::connect).
    type Session: BusSession;

    /// Establishes a connection, honouring `endpoint.connect_timeout`.
    fn connect(
        &self,
        endpoint: &BrokerEndpoint,
    ) -> impl Future<Output = Result<Self::Session, ConnectionError>> + Send;
}

/// A single live connection to the bus.
pub trait BusSession: Send + 'static {
    /// Requests delivery of messages published on every channel in `channels`.
    ///
    /// Resolves once the broker has acknowledged the request. A channel the
    /// broker refuses is reported as [`ConnectionError::Subscribe`].
    fn subscribe(
        &mut self,
        channels: &[String],
    ) -> impl Future<Output = Result<(), ConnectionError>> + Send;

    /// Waits for the next delivered message.
    ///
    /// `Ok(None)` means the broker closed the session cleanly.
    fn next_message(
        &mut self,
    ) -> impl Future<Output = Result<Option<BusMessage>, ConnectionError>> + Send;

    /// Closes the connection. Best effort; errors are swallowed.
    fn disconnect(self) -> impl Future<Output = ()> + Send;
}
