//! Hand-written test doubles for the bus and the notification source.

#![allow(dead_code)]

pub mod strategies;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use pg_listener::config::{BusConfig, TopicPath};
use pg_listener::error::{ListenerError, Result};
use pg_listener::events::{BinaryMessage, EventEnvelope};
use pg_listener::listener::{LoopSettings, Notification, NotificationSource, NotificationStream};
use pg_listener::producer::{BusConnector, BusProducer, EventPublisher, MessageBus, MessageId};
use pg_listener::resilience::ReconnectPolicy;

pub const CHANNEL: &str = "essence_events";

pub fn loop_settings(reconnect: ReconnectPolicy) -> LoopSettings {
    LoopSettings {
        channel: CHANNEL.to_string(),
        event_type: "mam.essence".to_string(),
        source: "pg-listener-test".to_string(),
        reconnect,
    }
}

pub fn bus_config() -> BusConfig {
    BusConfig {
        namespace: "mam".to_string(),
        topic: "essence".to_string(),
        producer_name: "pg-listener-test".to_string(),
        ..BusConfig::default()
    }
}

/// Poll `condition` on the (possibly paused) tokio clock
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(3600);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ---------------------------------------------------------------------------
// Notification source
// ---------------------------------------------------------------------------

/// What the scripted stream does on each `next_notification` call
#[derive(Debug, Clone)]
pub enum StreamStep {
    Deliver(String),
    Lose,
}

impl StreamStep {
    pub fn json(value: Value) -> Self {
        Self::Deliver(value.to_string())
    }
}

/// What the scripted source does on each `connect` call
#[derive(Debug, Clone)]
pub enum ConnectStep {
    Fail(String),
    /// Fail with a configuration error
    Reject(String),
    Connect(Vec<StreamStep>),
}

/// Source that replays a fixed script of connection outcomes.
///
/// Once a stream runs out of steps it idles forever, like a quiet channel.
/// Once the connect script runs out every further connect fails.
#[derive(Default)]
pub struct ScriptedSource {
    script: Mutex<VecDeque<ConnectStep>>,
    connect_times: Mutex<Vec<Instant>>,
    streams_closed: Arc<AtomicU32>,
}

impl ScriptedSource {
    pub fn new(script: Vec<ConnectStep>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Self::default()
        }
    }

    pub fn connect_attempts(&self) -> usize {
        self.connect_times.lock().len()
    }

    pub fn connect_times(&self) -> Vec<Instant> {
        self.connect_times.lock().clone()
    }

    /// Gaps between consecutive connect attempts
    pub fn connect_gaps(&self) -> Vec<Duration> {
        self.connect_times()
            .windows(2)
            .map(|pair| pair[1] - pair[0])
            .collect()
    }

    pub fn streams_closed(&self) -> u32 {
        self.streams_closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationSource for ScriptedSource {
    async fn connect(&self, channel: &str) -> Result<Box<dyn NotificationStream>> {
        self.connect_times.lock().push(Instant::now());

        let step = self.script.lock().pop_front();
        match step {
            Some(ConnectStep::Connect(steps)) => Ok(Box::new(ScriptedStream {
                channel: channel.to_string(),
                steps: steps.into(),
                closed: Arc::clone(&self.streams_closed),
            })),
            Some(ConnectStep::Fail(message)) => {
                Err(ListenerError::database_connect(channel, message))
            }
            Some(ConnectStep::Reject(message)) => Err(ListenerError::config(message)),
            None => Err(ListenerError::database_connect(channel, "script exhausted")),
        }
    }
}

pub struct ScriptedStream {
    channel: String,
    steps: VecDeque<StreamStep>,
    closed: Arc<AtomicU32>,
}

#[async_trait]
impl NotificationStream for ScriptedStream {
    async fn next_notification(&mut self) -> Result<Notification> {
        match self.steps.pop_front() {
            Some(StreamStep::Deliver(payload)) => Ok(Notification::new(&self.channel, payload)),
            Some(StreamStep::Lose) => Err(ListenerError::ConnectionLost {
                channel: self.channel.clone(),
            }),
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

/// Publisher that records envelopes; subjects listed in `failing` are rejected
#[derive(Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<EventEnvelope>>,
    failing: HashSet<String>,
    attempts: AtomicU32,
    closed: AtomicBool,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_for<I, S>(subjects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            failing: subjects.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn published(&self) -> Vec<EventEnvelope> {
        self.published.lock().clone()
    }

    pub fn published_count(&self) -> usize {
        self.published.lock().len()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<MessageId> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.contains(envelope.subject()) {
            return Err(ListenerError::publish("broker rejected message"));
        }

        let mut published = self.published.lock();
        published.push(envelope.clone());
        Ok(MessageId(format!("TEST:{}", published.len())))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

/// Shared observations of the mock bus
#[derive(Default)]
pub struct BusProbe {
    pub connect_attempts: AtomicU32,
    pub producer_attempts: AtomicU32,
    pub sent: Mutex<Vec<BinaryMessage>>,
    pub client_closed: AtomicU32,
    pub producer_closed: AtomicU32,
    pub connect_times: Mutex<Vec<Instant>>,
}

impl BusProbe {
    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn producer_attempts(&self) -> u32 {
        self.producer_attempts.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<BinaryMessage> {
        self.sent.lock().clone()
    }

    pub fn client_closed(&self) -> u32 {
        self.client_closed.load(Ordering::SeqCst)
    }

    pub fn producer_closed(&self) -> u32 {
        self.producer_closed.load(Ordering::SeqCst)
    }
}

/// Connector whose first `connect_failures` connects and first
/// `producer_failures` producer creations fail
pub struct FlakyConnector {
    pub probe: Arc<BusProbe>,
    connect_failures: u32,
    producer_failures: u32,
    fail_sends: bool,
    fail_close: bool,
}

impl FlakyConnector {
    pub fn new(connect_failures: u32, producer_failures: u32) -> Self {
        Self {
            probe: Arc::new(BusProbe::default()),
            connect_failures,
            producer_failures,
            fail_sends: false,
            fail_close: false,
        }
    }

    pub fn reliable() -> Self {
        Self::new(0, 0)
    }

    pub fn with_failing_sends(mut self) -> Self {
        self.fail_sends = true;
        self
    }

    pub fn with_failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }
}

#[async_trait]
impl BusConnector for FlakyConnector {
    async fn connect(&self, _config: &BusConfig) -> Result<Arc<dyn MessageBus>> {
        let attempt = self.probe.connect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        self.probe.connect_times.lock().push(Instant::now());

        if attempt <= self.connect_failures {
            return Err(ListenerError::bus_connect("connection refused"));
        }

        Ok(Arc::new(MockBus {
            probe: Arc::clone(&self.probe),
            producer_failures: self.producer_failures,
            fail_sends: self.fail_sends,
            fail_close: self.fail_close,
        }))
    }
}

struct MockBus {
    probe: Arc<BusProbe>,
    producer_failures: u32,
    fail_sends: bool,
    fail_close: bool,
}

#[async_trait]
impl MessageBus for MockBus {
    async fn create_producer(
        &self,
        topic: &TopicPath,
        producer_name: &str,
    ) -> Result<Arc<dyn BusProducer>> {
        let attempt = self.probe.producer_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.producer_failures {
            return Err(ListenerError::bus_connect("topic not ready"));
        }

        Ok(Arc::new(MockProducer {
            probe: Arc::clone(&self.probe),
            stream: topic.default_stream_name(),
            name: producer_name.to_string(),
            fail_sends: self.fail_sends,
            fail_close: self.fail_close,
        }))
    }

    async fn close(&self) -> Result<()> {
        self.probe.client_closed.fetch_add(1, Ordering::SeqCst);
        if self.fail_close {
            return Err(ListenerError::bus_connect("flush timed out"));
        }
        Ok(())
    }
}

struct MockProducer {
    probe: Arc<BusProbe>,
    stream: String,
    name: String,
    fail_sends: bool,
    fail_close: bool,
}

#[async_trait]
impl BusProducer for MockProducer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, message: BinaryMessage) -> Result<MessageId> {
        if self.fail_sends {
            return Err(ListenerError::publish("no responders"));
        }
        let mut sent = self.probe.sent.lock();
        sent.push(message);
        Ok(MessageId(format!("{}:{}", self.stream, sent.len())))
    }

    async fn close(&self) -> Result<()> {
        self.probe.producer_closed.fetch_add(1, Ordering::SeqCst);
        if self.fail_close {
            return Err(ListenerError::publish("producer already gone"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Log capture
// ---------------------------------------------------------------------------

/// Layer that records the level and message of every event
#[derive(Clone, Default)]
pub struct LogCapture {
    events: Arc<Mutex<Vec<(Level, String)>>>,
}

impl LogCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of events at `level` whose message equals `message`
    pub fn count(&self, level: Level, message: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|(l, m)| *l == level && m == message)
            .count()
    }
}

struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{value:?}");
        }
    }
}

impl<S: Subscriber> Layer<S> for LogCapture {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor(String::new());
        event.record(&mut visitor);
        self.events
            .lock()
            .push((*event.metadata().level(), visitor.0));
    }
}
