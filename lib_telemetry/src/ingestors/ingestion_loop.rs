//! # Ingestion Loop
//!
//! Owns the bus connection lifecycle and feeds decoded events into the
//! [`DeviceStateStore`]. One type, two operating modes:
//!
//! - **Persistent**: a long-lived session whose messages are pushed through a
//!   bounded queue to a single writer task. Lost or refused connections are
//!   retried with exponential backoff and every channel is re-subscribed on
//!   reconnect.
//! - **Poll**: on each tick, connect, subscribe, collect whatever arrives
//!   within a short window, apply it, disconnect. Nothing is buffered across
//!   ticks; a failed tick simply yields no data.
//!
//! ## Link State Machine (persistent mode)
//!
//! ```text
//! Disconnected -> Connecting -> Subscribed -> Receiving <-> (messages)
//!      ^               |             |            |
//!      +---- error ----+-------------+------------+
//! any state --(shutdown)--> Terminated
//! ```
//!
//! The current state is published on a `tokio::sync::watch` channel.
//!
//! ## Failure Policy
//! Connection failures and malformed payloads are logged and contained here.
//! Neither ever reaches the store or the consumer, and neither ends the loop.
//! Only the shutdown token does.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::core::decoder::ChannelDecoder;
use crate::core::state_store::DeviceStateStore;
use crate::ingestors::backoff::{Backoff, BackoffPolicy};
use crate::ingestors::bus::{
    BrokerEndpoint, BusConnector, BusMessage, BusSession, ConnectionError,
};

/// Connection strategy of an [`IngestionLoop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestionMode {
    /// One long-lived connection with reconnect backoff.
    Persistent,
    /// Short-lived connect / collect / disconnect cycles.
    Poll {
        /// How long each tick waits for messages.
        window: Duration,
        /// Time between the starts of consecutive ticks.
        interval: Duration,
    },
}

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LinkState {
    /// No connection; a retry may be pending.
    Disconnected,
    /// Connect handshake in progress.
    Connecting,
    /// Connected and subscribed, no message seen yet on this session.
    Subscribed,
    /// Messages are flowing.
    Receiving,
    /// The loop has exited.
    Terminated,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Subscribed => "subscribed",
            LinkState::Receiving => "receiving",
            LinkState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Everything the loop needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct IngestionSettings {
    /// Broker to connect to.
    pub endpoint: BrokerEndpoint,
    /// Persistent or poll mode.
    pub mode: IngestionMode,
    /// Reconnect policy for persistent mode.
    pub backoff: BackoffPolicy,
    /// Capacity of the queue between the bus session and the writer.
    pub queue_capacity: usize,
}

impl Default for IngestionSettings {
    fn default() -> Self {
        Self {
            endpoint: BrokerEndpoint::default(),
            mode: IngestionMode::Persistent,
            backoff: BackoffPolicy::default(),
            queue_capacity: 256,
        }
    }
}

/// What happened to one bus message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Decoded and recorded in the store.
    Applied,
    /// Channel is not tracked.
    Ignored,
    /// Payload failed to decode.
    Rejected,
}

/// Outcome of a single poll-mode tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    /// Messages delivered during the window.
    pub received: usize,
    /// Messages recorded in the store.
    pub applied: usize,
    /// Messages on untracked channels.
    pub ignored: usize,
    /// Messages with malformed payloads.
    pub rejected: usize,
    /// Connection problem that cut the tick short, if any.
    pub error: Option<ConnectionError>,
}

impl PollReport {
    fn count(&mut self, disposition: Disposition) {
        self.received += 1;
        match disposition {
            Disposition::Applied => self.applied += 1,
            Disposition::Ignored => self.ignored += 1,
            Disposition::Rejected => self.rejected += 1,
        }
    }
}

/// Decodes one message and records it. Shared by both modes.
pub fn ingest_message(
    decoder: &ChannelDecoder,
    store: &DeviceStateStore,
    message: &BusMessage,
) -> Disposition {
    match decoder.decode(&message.channel, &message.payload) {
        Ok(Some(update)) => {
            let snapshot = store.record(update);
            debug!(
                channel = %message.channel,
                field = %update.field,
                value = %update.value,
                snapshot = ?snapshot,
                "field updated"
            );
            Disposition::Applied
        }
        Ok(None) => {
            trace!(channel = %message.channel, "ignoring untracked channel");
            Disposition::Ignored
        }
        Err(e) => {
            warn!(channel = %e.channel, payload = %e.payload, "dropping malformed payload");
            Disposition::Rejected
        }
    }
}

enum SessionEnd {
    Shutdown,
    Lost(ConnectionError),
}

/// # Ingestion Loop
///
/// Generic over the bus implementation so the same logic runs against MQTT in
/// production and an in-memory bus in tests.
pub struct IngestionLoop<C: BusConnector> {
    connector: C,
    decoder: Arc<ChannelDecoder>,
    store: Arc<DeviceStateStore>,
    settings: IngestionSettings,
    link: watch::Sender<LinkState>,
}

impl<C: BusConnector> IngestionLoop<C> {
    /// Wires the loop to its collaborators. Nothing connects until
    /// [`run`](Self::run) or [`poll_once`](Self::poll_once) is called.
    pub fn new(
        connector: C,
        decoder: Arc<ChannelDecoder>,
        store: Arc<DeviceStateStore>,
        settings: IngestionSettings,
    ) -> Self {
        let (link, _) = watch::channel(LinkState::Disconnected);
        Self {
            connector,
            decoder,
            store,
            settings,
            link,
        }
    }

    /// Subscribes to link state changes.
    pub fn link_state(&self) -> watch::Receiver<LinkState> {
        self.link.subscribe()
    }

    /// The settings this loop was built with.
    pub fn settings(&self) -> &IngestionSettings {
        &self.settings
    }

    fn set_link(&self, state: LinkState) {
        self.link.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    /// Runs in the configured mode until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        match self.settings.mode {
            IngestionMode::Persistent => self.run_persistent(shutdown).await,
            IngestionMode::Poll { window, interval } => {
                self.run_polling(window, interval, shutdown).await
            }
        }
    }

    /// Persistent mode: keep one session alive, reconnecting with backoff.
    pub async fn run_persistent(&self, shutdown: CancellationToken) {
        let (tx, rx) = mpsc::channel(self.settings.queue_capacity.max(1));
        let writer = tokio::spawn(drain_queue(
            Arc::clone(&self.decoder),
            Arc::clone(&self.store),
            rx,
            shutdown.clone(),
        ));
        let mut backoff = Backoff::new(self.settings.backoff);

        info!(
            host = %self.settings.endpoint.host,
            port = self.settings.endpoint.port,
            channels = self.decoder.channels().len(),
            "starting persistent ingestion"
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.run_session(&tx, &shutdown, &mut backoff).await {
                SessionEnd::Shutdown => break,
                SessionEnd::Lost(e) => {
                    self.set_link(LinkState::Disconnected);
                    let delay = backoff.next_delay();
                    warn!(
                        error = %e,
                        attempt = backoff.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        "bus connection unavailable, scheduling retry"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        drop(tx);
        if let Err(e) = writer.await {
            error!(error = %e, "ingestion writer task failed");
        }
        self.set_link(LinkState::Terminated);
        info!("persistent ingestion stopped");
    }

    #[instrument(
        name = "ingestion_session",
        skip_all,
        fields(host = %self.settings.endpoint.host, port = self.settings.endpoint.port)
    )]
    async fn run_session(
        &self,
        tx: &mpsc::Sender<BusMessage>,
        shutdown: &CancellationToken,
        backoff: &mut Backoff,
    ) -> SessionEnd {
        let mut session = match self.open_session(shutdown).await {
            Ok(Some(session)) => session,
            Ok(None) => return SessionEnd::Shutdown,
            Err(e) => return SessionEnd::Lost(e),
        };

        self.set_link(LinkState::Subscribed);
        backoff.reset();
        info!(channels = self.decoder.channels().len(), "subscribed to bus channels");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    debug!("shutdown signal received, closing bus session");
                    session.disconnect().await;
                    return SessionEnd::Shutdown;
                }
                next = session.next_message() => match next {
                    Ok(Some(message)) => {
                        self.set_link(LinkState::Receiving);
                        if tx.send(message).await.is_err() {
                            // Writer is gone, which only happens on shutdown.
                            session.disconnect().await;
                            return SessionEnd::Shutdown;
                        }
                    }
                    Ok(None) => {
                        let closed = ConnectionError::Dropped("closed by broker".to_string());
                        return SessionEnd::Lost(closed);
                    }
                    Err(e) => return SessionEnd::Lost(e),
                },
            }
        }
    }

    /// Connects and subscribes to every bound channel.
    ///
    /// The connect and the subscribe phase are each bounded by the endpoint's
    /// connect timeout. `Ok(None)` means shutdown was requested first; a
    /// session that was already open is disconnected before returning.
    async fn open_session(
        &self,
        shutdown: &CancellationToken,
    ) -> Result<Option<C::Session>, ConnectionError> {
        let endpoint = &self.settings.endpoint;
        self.set_link(LinkState::Connecting);

        let timeout = endpoint.connect_timeout;
        let connect = tokio::time::timeout(timeout, self.connector.connect(endpoint));
        let mut session = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Ok(None),
            connected = connect => match connected {
                Ok(connected) => connected?,
                Err(_) => return Err(self.handshake_timeout()),
            },
        };

        let channels = self.decoder.channels();
        let subscribed = tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            outcome = tokio::time::timeout(timeout, session.subscribe(channels)) => Some(outcome),
        };

        match subscribed {
            Some(Ok(Ok(()))) => {
                debug!(channels = channels.len(), "subscribed");
                Ok(Some(session))
            }
            Some(Ok(Err(e))) => {
                session.disconnect().await;
                Err(e)
            }
            Some(Err(_)) => {
                session.disconnect().await;
                Err(self.handshake_timeout())
            }
            None => {
                debug!("shutdown during subscribe, closing bus session");
                session.disconnect().await;
                Ok(None)
            }
        }
    }

    fn handshake_timeout(&self) -> ConnectionError {
        let endpoint = &self.settings.endpoint;
        ConnectionError::Timeout {
            host: endpoint.host.clone(),
            port: endpoint.port,
            timeout: endpoint.connect_timeout,
        }
    }

    /// Poll mode driver: one [`poll_until`](Self::poll_until) per `interval`.
    pub async fn run_polling(
        &self,
        window: Duration,
        interval: Duration,
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            host = %self.settings.endpoint.host,
            window_ms = window.as_millis() as u64,
            interval_ms = interval.as_millis() as u64,
            "starting poll-mode ingestion"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let report = self.poll_until(window, &shutdown).await;
            debug!(
                received = report.received,
                applied = report.applied,
                rejected = report.rejected,
                "poll tick finished"
            );
        }

        self.set_link(LinkState::Terminated);
        info!("poll-mode ingestion stopped");
    }

    /// One poll-mode tick: connect, subscribe, collect for `window`, apply in
    /// arrival order, disconnect.
    ///
    /// Messages arriving after the window are lost for this tick. Connection
    /// failures are logged and reported, never raised.
    pub async fn poll_once(&self, window: Duration) -> PollReport {
        self.poll_until(window, &CancellationToken::new()).await
    }

    /// [`poll_once`](Self::poll_once) that also ends early on `shutdown`.
    /// Whatever was collected so far stays applied and the session is
    /// disconnected before returning.
    #[instrument(
        name = "ingestion_poll",
        skip_all,
        fields(host = %self.settings.endpoint.host, port = self.settings.endpoint.port)
    )]
    pub async fn poll_until(&self, window: Duration, shutdown: &CancellationToken) -> PollReport {
        let mut report = PollReport::default();

        let mut session = match self.open_session(shutdown).await {
            Ok(Some(session)) => session,
            Ok(None) => {
                self.set_link(LinkState::Disconnected);
                return report;
            }
            Err(e) => {
                warn!(error = %e, "poll tick skipped, no data this round");
                self.set_link(LinkState::Disconnected);
                report.error = Some(e);
                return report;
            }
        };
        self.set_link(LinkState::Subscribed);

        let deadline = Instant::now() + window;
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    debug!("shutdown during poll window");
                    break;
                }
                next = tokio::time::timeout_at(deadline, session.next_message()) => next,
            };
            match next {
                Err(_) => break,
                Ok(Ok(Some(message))) => {
                    self.set_link(LinkState::Receiving);
                    report.count(ingest_message(&self.decoder, &self.store, &message));
                }
                Ok(Ok(None)) => break,
                Ok(Err(e)) => {
                    warn!(error = %e, "bus connection lost during poll window");
                    report.error = Some(e);
                    break;
                }
            }
        }

        session.disconnect().await;
        self.set_link(LinkState::Disconnected);
        report
    }
}

/// The single writer of persistent mode. Applies queued messages in FIFO order
/// and stops starting new ones once shutdown is requested.
async fn drain_queue(
    decoder: Arc<ChannelDecoder>,
    store: Arc<DeviceStateStore>,
    mut rx: mpsc::Receiver<BusMessage>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            message = rx.recv() => match message {
                Some(message) => {
                    ingest_message(&decoder, &store, &message);
                }
                None => break,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::decoder::{ChannelBinding, FieldName};
    use crate::core::state_store::RetentionPolicy;

    #[test]
    fn test_ingest_message_dispositions() {
        let binding = ChannelBinding::new("t", FieldName::Temperature);
        let decoder = ChannelDecoder::new([binding]).unwrap();
        let store = DeviceStateStore::new(FieldName::Temperature, RetentionPolicy::default());
        let ingest = |channel: &str, payload: &str| {
            let message = BusMessage::new(channel.to_string(), payload.to_string());
            ingest_message(&decoder, &store, &message)
        };

        assert_eq!(ingest("t", "21.0"), Disposition::Applied);
        assert_eq!(ingest("t", "warm"), Disposition::Rejected);
        assert_eq!(ingest("x", "1"), Disposition::Ignored);

        assert_eq!(store.read().number(FieldName::Temperature), Some(21.0));
        assert_eq!(store.history_len(), 1);
    }

    #[test]
    fn test_poll_report_counts() {
        let mut report = PollReport::default();
        report.count(Disposition::Applied);
        report.count(Disposition::Ignored);
        report.count(Disposition::Rejected);
        report.count(Disposition::Applied);
        let counts = (report.received, report.applied, report.ignored, report.rejected);
        assert_eq!(counts, (4, 2, 1, 1));
    }

    #[test]
    fn test_link_state_display() {
        assert_eq!(LinkState::Receiving.to_string(), "receiving");
        assert_eq!(serde_json::to_string(&LinkState::Terminated).unwrap(), "\"terminated\"");
    }
}
