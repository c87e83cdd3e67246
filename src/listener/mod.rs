//! # Subscription Loop
//!
//! Keeps a LISTEN subscription alive and turns every notification into a
//! published event, one at a time and in delivery order.
//!
//! ```text
//! Disconnected -> Connecting -> Listening -> (connection lost) -> Connecting
//!                     |                                              |
//!                     +-- failures > ceiling --> Fatal <-------------+
//! ```
//!
//! Failures of a single notification (bad JSON, missing fields, rejected
//! publish) are logged and skipped; they never touch the connection. Only
//! exhausting the reconnect policy, or a connect error that no retry can fix
//! (an invalid channel), ends the loop with an error. A shutdown
//! signal ends it cleanly. Either way the notification stream is closed first
//! and the publisher second.
//!
//! ## Delivery limitations
//!
//! - NOTIFY is fire-and-forget. Notifications raised while no connection is
//!   listening (between a drop and the next successful LISTEN) are lost. An
//!   at-least-once guarantee needs an outbox table on the database side.
//! - Publishing is at-most-once. A failed publish is logged and the event is
//!   dropped; there is no local retry queue.
//! - Publishing is inline, so bus backpressure stalls notification intake.

pub mod postgres;

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::config::AppConfig;
use crate::error::{ListenerError, Result};
use crate::events::{EventTranslator, NotificationRecord, TranslationError};
use crate::producer::{EventPublisher, MessageId};
use crate::resilience::ReconnectPolicy;

pub use postgres::PgNotificationSource;

/// One notification as delivered by the database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub channel: String,
    pub payload: String,
}

impl Notification {
    pub fn new(channel: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }
}

/// Opens listening connections
#[async_trait]
pub trait NotificationSource: Send + Sync {
    /// Open a connection and LISTEN on `channel`.
    ///
    /// Returns only once the LISTEN command has been acknowledged.
    async fn connect(&self, channel: &str) -> Result<Box<dyn NotificationStream>>;
}

/// An open, listening connection
#[async_trait]
pub trait NotificationStream: Send {
    /// Wait for the next notification.
    ///
    /// Blocks indefinitely while the channel is idle. A dropped connection is
    /// reported as [`ListenerError::ConnectionLost`].
    async fn next_notification(&mut self) -> Result<Notification>;

    async fn close(&mut self) -> Result<()>;
}

/// Loop lifecycle state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ListenerState {
    #[default]
    Disconnected,
    Connecting,
    Listening,
    /// Reconnect attempts exhausted
    Fatal,
    /// Stopped on request
    Stopped,
}

/// Counters for the running loop
#[derive(Debug, Clone, Default)]
pub struct ListenerStats {
    pub state: ListenerState,
    pub connected: bool,
    pub notifications_received: u64,
    pub events_published: u64,
    pub parse_errors: u64,
    pub translation_errors: u64,
    pub publish_errors: u64,
    pub connection_errors: u64,
    /// Successful connections after the first one
    pub reconnects: u64,
    pub consecutive_failures: u32,
    pub last_event_at: Option<SystemTime>,
    pub last_error_at: Option<SystemTime>,
}

/// Why a notification produced no event
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    InvalidPayload { message: String },
    Translation(TranslationError),
    PublishFailed { message: String },
}

/// Result of handling a single notification
#[derive(Debug, Clone, PartialEq)]
pub enum NotificationOutcome {
    Published(MessageId),
    Skipped(SkipReason),
}

/// Channel, envelope attributes and reconnect policy for one loop
#[derive(Debug, Clone, PartialEq)]
pub struct LoopSettings {
    pub channel: String,
    pub event_type: String,
    pub source: String,
    pub reconnect: ReconnectPolicy,
}

impl LoopSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            channel: config.database.channel.clone(),
            event_type: config.event_type(),
            source: config.event_source(),
            reconnect: config.retry.reconnect.clone(),
        }
    }
}

enum ListenExit {
    Shutdown,
    ConnectionLost(ListenerError),
}

/// Subscription loop for one channel
pub struct SubscriptionLoop {
    source: Arc<dyn NotificationSource>,
    publisher: Arc<dyn EventPublisher>,
    translator: EventTranslator,
    settings: LoopSettings,
    shutdown: Option<watch::Receiver<bool>>,
    stats: Arc<RwLock<ListenerStats>>,
}

impl SubscriptionLoop {
    pub fn new(
        source: Arc<dyn NotificationSource>,
        publisher: Arc<dyn EventPublisher>,
        settings: LoopSettings,
    ) -> Self {
        let translator = EventTranslator::new(&settings.event_type, &settings.source);
        Self {
            source,
            publisher,
            translator,
            settings,
            shutdown: None,
            stats: Arc::new(RwLock::new(ListenerStats::default())),
        }
    }

    /// Stop the loop once `shutdown` turns `true`
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn settings(&self) -> &LoopSettings {
        &self.settings
    }

    pub fn stats(&self) -> ListenerStats {
        self.stats.read().clone()
    }

    pub fn state(&self) -> ListenerState {
        self.stats.read().state
    }

    /// Shared handle to the live counters, readable while `run` is in progress
    pub fn stats_handle(&self) -> Arc<RwLock<ListenerStats>> {
        Arc::clone(&self.stats)
    }

    /// Run until shutdown or until reconnects are exhausted.
    ///
    /// Returns `Ok(())` on shutdown and [`ListenerError::ReconnectExhausted`] once
    /// the failure count passes the policy ceiling. A connect error that
    /// [`is_fatal`](ListenerError::is_fatal) is returned as is, without backoff.
    /// The publisher is closed before returning in every case.
    #[instrument(skip(self), fields(channel = %self.settings.channel))]
    pub async fn run(mut self) -> Result<()> {
        let mut shutdown = self.shutdown.take();
        let result = self.run_until_exit(&mut shutdown).await;

        self.publisher.close().await;

        let final_state = if result.is_ok() {
            ListenerState::Stopped
        } else {
            ListenerState::Fatal
        };
        self.set_state(final_state);

        match &result {
            Ok(()) => info!(channel = %self.settings.channel, "Subscription loop stopped"),
            Err(e) => error!(channel = %self.settings.channel, error = %e, "Subscription loop failed"),
        }

        result
    }

    async fn run_until_exit(&self, shutdown: &mut Option<watch::Receiver<bool>>) -> Result<()> {
        let channel = self.settings.channel.as_str();
        let policy = &self.settings.reconnect;
        let mut failures: u32 = 0;
        let mut connected_before = false;

        loop {
            if is_shutdown_requested(shutdown) {
                return Ok(());
            }

            self.set_state(ListenerState::Connecting);
            debug!(channel, attempt = failures + 1, "Connecting listener");

            let connected = tokio::select! {
                connected = self.source.connect(channel) => connected,
                _ = wait_for_shutdown(shutdown) => return Ok(()),
            };

            match connected {
                Ok(mut stream) => {
                    failures = 0;
                    {
                        let mut stats = self.stats.write();
                        stats.state = ListenerState::Listening;
                        stats.connected = true;
                        stats.consecutive_failures = 0;
                        if connected_before {
                            stats.reconnects += 1;
                        }
                    }
                    connected_before = true;
                    info!(channel, "Listening for notifications");

                    let exit = self.listen(stream.as_mut(), shutdown).await;

                    if let Err(e) = stream.close().await {
                        warn!(channel, error = %e, "Failed to close listen connection");
                    }
                    {
                        let mut stats = self.stats.write();
                        stats.connected = false;
                        stats.state = ListenerState::Disconnected;
                    }

                    match exit {
                        ListenExit::Shutdown => return Ok(()),
                        ListenExit::ConnectionLost(e) => {
                            warn!(channel, error = %e, "Listen connection lost, reconnecting");
                            self.record_connection_error();
                            continue;
                        }
                    }
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    self.record_connection_error();
                    self.stats.write().consecutive_failures = failures;

                    if e.is_fatal() {
                        error!(channel, error = %e, "Listener cannot connect, not retrying");
                        self.set_state(ListenerState::Fatal);
                        return Err(e);
                    }

                    if !policy.should_retry(failures) {
                        error!(
                            channel,
                            failures,
                            max_failures = policy.max_failures,
                            error = %e,
                            "Reconnect attempts exhausted"
                        );
                        self.set_state(ListenerState::Fatal);
                        return Err(ListenerError::ReconnectExhausted {
                            channel: channel.to_string(),
                            failures,
                        });
                    }

                    let delay = policy.delay_for_failure(failures);
                    warn!(
                        channel,
                        failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Listener connect failed, backing off"
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = wait_for_shutdown(shutdown) => return Ok(()),
                    }
                }
            }
        }
    }

    async fn listen(
        &self,
        stream: &mut dyn NotificationStream,
        shutdown: &mut Option<watch::Receiver<bool>>,
    ) -> ListenExit {
        loop {
            let next = tokio::select! {
                next = stream.next_notification() => next,
                _ = wait_for_shutdown(shutdown) => return ListenExit::Shutdown,
            };

            match next {
                Ok(notification) => {
                    self.handle_notification(&notification).await;
                }
                Err(e) => return ListenExit::ConnectionLost(e),
            }
        }
    }

    /// Decode, translate and publish one notification.
    ///
    /// Never fails: every problem is logged, counted and reported as
    /// [`NotificationOutcome::Skipped`].
    pub async fn handle_notification(&self, notification: &Notification) -> NotificationOutcome {
        {
            let mut stats = self.stats.write();
            stats.notifications_received += 1;
            stats.last_event_at = Some(SystemTime::now());
        }

        debug!(
            channel = %notification.channel,
            payload = %notification.payload,
            "Received notification"
        );

        let record = match NotificationRecord::parse(&notification.payload) {
            Ok(record) => record,
            Err(e) => {
                warn!(
                    channel = %notification.channel,
                    payload = %notification.payload,
                    error = %e,
                    "Skipping unparseable notification"
                );
                self.record_error(|stats| stats.parse_errors += 1);
                return NotificationOutcome::Skipped(SkipReason::InvalidPayload {
                    message: e.to_string(),
                });
            }
        };

        let envelope = match self.translator.translate(&record) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    channel = %notification.channel,
                    payload = %notification.payload,
                    error = %e,
                    "Skipping notification that cannot be translated"
                );
                self.record_error(|stats| stats.translation_errors += 1);
                return NotificationOutcome::Skipped(SkipReason::Translation(e));
            }
        };

        match self.publisher.publish(&envelope).await {
            Ok(message_id) => {
                self.stats.write().events_published += 1;
                info!(
                    message_id = %message_id,
                    subject = envelope.subject(),
                    correlation_id = envelope.correlation_id(),
                    "Published event"
                );
                NotificationOutcome::Published(message_id)
            }
            Err(e) => {
                error!(
                    subject = envelope.subject(),
                    correlation_id = envelope.correlation_id(),
                    error = %e,
                    "Publish failed, dropping event"
                );
                self.record_error(|stats| stats.publish_errors += 1);
                NotificationOutcome::Skipped(SkipReason::PublishFailed {
                    message: e.to_string(),
                })
            }
        }
    }

    fn set_state(&self, state: ListenerState) {
        self.stats.write().state = state;
    }

    fn record_connection_error(&self) {
        self.record_error(|stats| stats.connection_errors += 1);
    }

    fn record_error(&self, update: impl FnOnce(&mut ListenerStats)) {
        let mut stats = self.stats.write();
        update(&mut stats);
        stats.last_error_at = Some(SystemTime::now());
    }
}

fn is_shutdown_requested(shutdown: &Option<watch::Receiver<bool>>) -> bool {
    shutdown.as_ref().is_some_and(|rx| *rx.borrow())
}

/// Resolves once shutdown is requested; never resolves without a receiver or
/// after the sender is gone.
async fn wait_for_shutdown(shutdown: &mut Option<watch::Receiver<bool>>) {
    match shutdown {
        Some(rx) => {
            if rx.wait_for(|stop| *stop).await.is_err() {
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending::<()>().await,
    }
}
