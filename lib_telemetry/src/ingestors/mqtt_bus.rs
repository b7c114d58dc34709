//! # MQTT Bus Client
//!
//! [`BusConnector`] implementation over `rumqttc`. Devices publish with QoS 0
//! and so do we subscribe: a missed reading is superseded by the next one.
//!
//! `rumqttc` splits a connection into an `AsyncClient` (request handle) and an
//! `EventLoop` that must be polled to make progress. The session owns both and
//! polls the event loop itself, so it is never driven from two places at once.
//!
//! All channels go out in a single SUBSCRIBE, which occupies one slot of the
//! client's request queue however many channels are bound. Requests are
//! enqueued with the non-blocking `try_*` calls because nothing else polls the
//! event loop while the session is waiting on the queue.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::collections::VecDeque;
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS, SubscribeFilter,
    SubscribeReasonCode,
};
use tracing::{debug, trace, warn};

use crate::ingestors::bus::{
    BrokerEndpoint, BusConnector, BusMessage, BusSession, ConnectionError,
};

/// Opens MQTT sessions with a clean session and QoS 0 subscriptions.
#[derive(Debug, Clone, Default)]
pub struct MqttConnector;

/// A connected MQTT session.
pub struct MqttSession {
    client: AsyncClient,
    eventloop: EventLoop,
    // Publishes that arrived while waiting for the SUBACK.
    pending: VecDeque<BusMessage>,
}

impl MqttConnector {
    /// Creates a connector.
    pub fn new() -> Self {
        Self
    }
}

impl BusConnector for MqttConnector {
    type Session = MqttSession;

    async fn connect(&self, endpoint: &BrokerEndpoint) -> Result<MqttSession, ConnectionError> {
        let mut options = MqttOptions::new(&endpoint.client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(endpoint.keep_alive);
        options.set_clean_session(true);

        let (client, mut eventloop) = AsyncClient::new(options, endpoint.request_capacity.max(1));

        // The first polls drive the TCP connect and the CONNECT/CONNACK exchange.
        let handshake = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        return if ack.code == ConnectReturnCode::Success {
                            Ok(())
                        } else {
                            Err(ConnectionError::Refused {
                                host: endpoint.host.clone(),
                                port: endpoint.port,
                                reason: format!("broker returned {:?}", ack.code),
                            })
                        };
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        return Err(ConnectionError::Refused {
                            host: endpoint.host.clone(),
                            port: endpoint.port,
                            reason: e.to_string(),
                        })
                    }
                }
            }
        };

        let outcome = tokio::time::timeout(endpoint.connect_timeout, handshake).await;
        match outcome {
            Ok(Ok(())) => {
                debug!(host = %endpoint.host, port = endpoint.port, "MQTT connection acknowledged");
                Ok(MqttSession {
                    client,
                    eventloop,
                    pending: VecDeque::new(),
                })
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ConnectionError::Timeout {
                host: endpoint.host.clone(),
                port: endpoint.port,
                timeout: endpoint.connect_timeout,
            }),
        }
    }
}

/// Maps SUBACK return codes back onto the channels, in request order.
fn check_suback(channels: &[String], codes: &[SubscribeReasonCode]) -> Result<(), ConnectionError> {
    for (index, channel) in channels.iter().enumerate() {
        match codes.get(index) {
            Some(SubscribeReasonCode::Success(qos)) => {
                trace!(channel = %channel, ?qos, "subscription granted");
            }
            Some(SubscribeReasonCode::Failure) => {
                return Err(ConnectionError::Subscribe {
                    channel: channel.clone(),
                    reason: "broker rejected the subscription".to_string(),
                });
            }
            None => {
                return Err(ConnectionError::Subscribe {
                    channel: channel.clone(),
                    reason: format!(
                        "SUBACK carried {} code(s) for {} channel(s)",
                        codes.len(),
                        channels.len()
                    ),
                });
            }
        }
    }
    Ok(())
}

impl BusSession for MqttSession {
    async fn subscribe(&mut self, channels: &[String]) -> Result<(), ConnectionError> {
        if channels.is_empty() {
            return Ok(());
        }
        let filters = channels
            .iter()
            .map(|channel| SubscribeFilter::new(channel.clone(), QoS::AtMostOnce));
        self.client
            .try_subscribe_many(filters)
            .map_err(|e| ConnectionError::Subscribe {
                channel: channels.join(","),
                reason: e.to_string(),
            })?;

        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    check_suback(channels, &ack.return_codes)?;
                    debug!(pkid = ack.pkid, channels = channels.len(), "subscription acknowledged");
                    return Ok(());
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    self.pending.push_back(BusMessage::new(publish.topic, publish.payload));
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    return Err(ConnectionError::Dropped(
                        "broker sent DISCONNECT before acknowledging the subscription".to_string(),
                    ));
                }
                Ok(event) => {
                    trace!(?event, "MQTT event");
                }
                Err(e) => return Err(ConnectionError::Dropped(e.to_string())),
            }
        }
    }

    async fn next_message(&mut self) -> Result<Option<BusMessage>, ConnectionError> {
        if let Some(message) = self.pending.pop_front() {
            return Ok(Some(message));
        }
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    return Ok(Some(BusMessage::new(publish.topic, publish.payload)));
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    warn!(pkid = ack.pkid, "unexpected SUBACK outside the subscribe phase");
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    debug!("broker sent DISCONNECT");
                    return Ok(None);
                }
                Ok(event) => {
                    trace!(?event, "MQTT event");
                }
                Err(e) => return Err(ConnectionError::Dropped(e.to_string())),
            }
        }
    }

    async fn disconnect(mut self) {
        if self.client.try_disconnect().is_ok() {
            // Give the event loop a moment to flush the DISCONNECT packet.
            let _ = tokio::time::timeout(Duration::from_millis(100), self.eventloop.poll()).await;
        }
    }
}
