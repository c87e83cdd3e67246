//! # Producer Gateway
//!
//! Owns the message-bus client and the topic producer. Connection establishment
//! (client connect and producer creation) runs under a bounded [`RetryPolicy`];
//! running out of attempts is fatal. Publishing is a single attempt: a failed
//! publish is returned to the caller, which decides whether to drop it.
//!
//! The bus itself sits behind three traits so the gateway works against any
//! backend; [`nats`] provides the JetStream implementation.

pub mod nats;

use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::config::{BusConfig, TopicPath};
use crate::error::{ListenerError, Result};
use crate::events::envelope::{headers, BinaryMessage, EventEnvelope};
use crate::resilience::RetryPolicy;

pub use nats::NatsConnector;

/// Opaque identifier assigned by the bus to a published message
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId(pub String);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opens client connections to a message bus
#[async_trait]
pub trait BusConnector: Send + Sync {
    /// Single connection attempt; retries are the caller's concern
    async fn connect(&self, config: &BusConfig) -> Result<Arc<dyn MessageBus>>;
}

/// Connected message-bus client
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn create_producer(
        &self,
        topic: &TopicPath,
        producer_name: &str,
    ) -> Result<Arc<dyn BusProducer>>;

    async fn close(&self) -> Result<()>;
}

/// Producer bound to one topic
#[async_trait]
pub trait BusProducer: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, message: BinaryMessage) -> Result<MessageId>;

    async fn close(&self) -> Result<()>;
}

/// Capability used by the subscription loop to publish events
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<MessageId>;

    /// Best-effort release; failures are logged, never returned
    async fn close(&self);
}

/// Message-bus client plus topic producer
pub struct ProducerGateway {
    client: Arc<dyn MessageBus>,
    producer: Arc<dyn BusProducer>,
    topic: TopicPath,
    closed: AtomicBool,
}

impl fmt::Debug for ProducerGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProducerGateway")
            .field("topic", &self.topic)
            .field("producer", &self.producer.name())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl ProducerGateway {
    /// Connect to the bus and create the topic producer, each under `policy`
    #[instrument(skip(connector, config, policy), fields(url = %config.service_url, topic = %config.topic_path()))]
    pub async fn connect(
        connector: &dyn BusConnector,
        config: &BusConfig,
        policy: &RetryPolicy,
    ) -> Result<Self> {
        let topic = config.topic_path();
        let client = Self::connect_client(connector, config, policy).await?;

        let producer =
            match Self::create_producer(&client, &topic, &config.producer_name, policy).await {
                Ok(producer) => producer,
                Err(e) => {
                    if let Err(close_error) = client.close().await {
                        warn!(error = %close_error, "Failed to close bus client after producer failure");
                    }
                    return Err(e);
                }
            };

        info!(
            topic = %topic,
            producer = %producer.name(),
            "Producer gateway ready"
        );

        Ok(Self {
            client,
            producer,
            topic,
            closed: AtomicBool::new(false),
        })
    }

    /// Open a bus client, retrying transient failures
    pub async fn connect_client(
        connector: &dyn BusConnector,
        config: &BusConfig,
        policy: &RetryPolicy,
    ) -> Result<Arc<dyn MessageBus>> {
        policy
            .retry("message bus connect", move |attempt| {
                debug!(attempt, url = %config.service_url, "Connecting to message bus");
                connector.connect(config)
            })
            .await
    }

    /// Create the named producer for `topic`, retrying transient failures
    pub async fn create_producer(
        client: &Arc<dyn MessageBus>,
        topic: &TopicPath,
        producer_name: &str,
        policy: &RetryPolicy,
    ) -> Result<Arc<dyn BusProducer>> {
        policy
            .retry("create producer", move |attempt| {
                debug!(attempt, topic = %topic, producer = producer_name, "Creating producer");
                client.create_producer(topic, producer_name)
            })
            .await
    }

    pub fn topic(&self) -> &TopicPath {
        &self.topic
    }

    pub fn producer_name(&self) -> &str {
        self.producer.name()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl EventPublisher for ProducerGateway {
    #[instrument(skip(self, envelope), fields(subject = %envelope.subject(), topic = %self.topic))]
    async fn publish(&self, envelope: &EventEnvelope) -> Result<MessageId> {
        if self.is_closed() {
            return Err(ListenerError::publish("producer gateway is closed"));
        }

        let message = envelope
            .to_message()?
            .with_header(headers::PRODUCER, self.producer.name());

        let message_id = self.producer.send(message).await.map_err(|e| match e {
            ListenerError::Publish { .. } => e,
            other => ListenerError::publish(other),
        })?;

        debug!(
            message_id = %message_id,
            correlation_id = envelope.correlation_id(),
            "Event published"
        );
        Ok(message_id)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Err(e) = self.producer.close().await {
            warn!(error = %e, producer = %self.producer.name(), "Failed to close producer");
        }
        if let Err(e) = self.client.close().await {
            warn!(error = %e, "Failed to close message bus client");
        }

        info!(topic = %self.topic, "Producer gateway closed");
    }
}
