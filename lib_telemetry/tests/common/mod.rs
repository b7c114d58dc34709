//! Scripted in-memory bus for driving the ingestion loop without a broker.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lib_telemetry::{BrokerEndpoint, BusConnector, BusMessage, BusSession, ConnectionError};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// What a scripted session delivers next.
#[derive(Debug)]
pub enum SessionEvent {
    /// Deliver immediately.
    Message(BusMessage),
    /// Deliver after a delay, measured from the moment it is awaited.
    Delayed(Duration, BusMessage),
    /// The connection drops.
    Drop,
    /// The broker closes the session cleanly.
    Close,
}

/// Handle the test keeps to feed an accepted session.
pub type SessionFeed = mpsc::UnboundedSender<SessionEvent>;

/// How an accepted session answers the subscribe request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeReply {
    /// Every channel is granted.
    Grant,
    /// The broker never acknowledges.
    Stall,
    /// The broker refuses the first channel.
    Reject,
}

enum Plan {
    Accept(mpsc::UnboundedReceiver<SessionEvent>, SubscribeReply),
    Refuse,
}

#[derive(Default)]
struct Script {
    plans: VecDeque<Plan>,
    connect_attempts: Vec<Instant>,
    subscriptions: Vec<Vec<String>>,
    disconnects: usize,
}

/// Connector whose outcomes are queued up front. Once the queue is empty,
/// every further connect is refused.
#[derive(Clone, Default)]
pub struct ScriptedConnector {
    script: Arc<Mutex<Script>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a successful connect and returns the feed for that session.
    pub fn accept(&self) -> SessionFeed {
        self.accept_with(SubscribeReply::Grant)
    }

    /// Queues a successful connect whose subscribe is answered with `reply`.
    pub fn accept_with(&self, reply: SubscribeReply) -> SessionFeed {
        let (tx, rx) = mpsc::unbounded_channel();
        self.script.lock().unwrap().plans.push_back(Plan::Accept(rx, reply));
        tx
    }

    /// Queues a refused connect.
    pub fn refuse(&self) {
        self.script.lock().unwrap().plans.push_back(Plan::Refuse);
    }

    /// Times of every connect attempt.
    pub fn connect_attempts(&self) -> Vec<Instant> {
        self.script.lock().unwrap().connect_attempts.clone()
    }

    /// Channels subscribed by each accepted session, in accept order.
    pub fn subscriptions(&self) -> Vec<Vec<String>> {
        self.script.lock().unwrap().subscriptions.clone()
    }

    pub fn disconnects(&self) -> usize {
        self.script.lock().unwrap().disconnects
    }
}

impl BusConnector for ScriptedConnector {
    type Session = ScriptedSession;

    async fn connect(&self, endpoint: &BrokerEndpoint) -> Result<ScriptedSession, ConnectionError> {
        let mut script = self.script.lock().unwrap();
        script.connect_attempts.push(Instant::now());
        match script.plans.pop_front() {
            Some(Plan::Accept(events, reply)) => {
                let slot = script.subscriptions.len();
                script.subscriptions.push(Vec::new());
                Ok(ScriptedSession {
                    events,
                    reply,
                    slot,
                    script: Arc::clone(&self.script),
                })
            }
            Some(Plan::Refuse) | None => Err(ConnectionError::Refused {
                host: endpoint.host.clone(),
                port: endpoint.port,
                reason: "connection refused".to_string(),
            }),
        }
    }
}

pub struct ScriptedSession {
    events: mpsc::UnboundedReceiver<SessionEvent>,
    reply: SubscribeReply,
    slot: usize,
    script: Arc<Mutex<Script>>,
}

impl BusSession for ScriptedSession {
    async fn subscribe(&mut self, channels: &[String]) -> Result<(), ConnectionError> {
        self.script.lock().unwrap().subscriptions[self.slot].extend_from_slice(channels);
        match self.reply {
            SubscribeReply::Grant => Ok(()),
            SubscribeReply::Stall => std::future::pending().await,
            SubscribeReply::Reject => Err(ConnectionError::Subscribe {
                channel: channels.first().cloned().unwrap_or_default(),
                reason: "scripted rejection".to_string(),
            }),
        }
    }

    async fn next_message(&mut self) -> Result<Option<BusMessage>, ConnectionError> {
        match self.events.recv().await {
            Some(SessionEvent::Message(message)) => Ok(Some(message)),
            Some(SessionEvent::Delayed(delay, message)) => {
                tokio::time::sleep(delay).await;
                Ok(Some(message))
            }
            Some(SessionEvent::Drop) => Err(ConnectionError::Dropped("scripted drop".to_string())),
            Some(SessionEvent::Close) => Ok(None),
            // Feed dropped by the test: the session just goes quiet.
            None => std::future::pending().await,
        }
    }

    async fn disconnect(self) {
        self.script.lock().unwrap().disconnects += 1;
    }
}

pub fn message(channel: &str, payload: &str) -> SessionEvent {
    SessionEvent::Message(BusMessage::new(channel.to_string(), payload.to_string()))
}

/// Polls `condition` until it holds or `limit` elapses.
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
