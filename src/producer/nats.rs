//! NATS JetStream backend for the producer gateway.
//!
//! The topic maps to the subject `<namespace>.<topic>`, persisted by a durable
//! file-backed stream that is created on first use. Message ids are
//! `<stream>:<sequence>` taken from the publish acknowledgement.

use async_nats::header::HeaderMap;
use async_nats::jetstream::{
    self,
    stream::{Config as StreamConfig, RetentionPolicy, StorageType},
    Context as JetStreamContext,
};
use async_nats::{Client, ConnectOptions};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use super::{BusConnector, BusProducer, MessageBus, MessageId};
use crate::config::{BusConfig, TopicPath};
use crate::error::{ListenerError, Result};
use crate::events::envelope::BinaryMessage;

/// Opens JetStream-enabled NATS connections
#[derive(Debug, Clone, Copy, Default)]
pub struct NatsConnector;

#[async_trait]
impl BusConnector for NatsConnector {
    async fn connect(&self, config: &BusConfig) -> Result<Arc<dyn MessageBus>> {
        let connect_options = ConnectOptions::default()
            .connection_timeout(config.connection_timeout())
            .name(&config.producer_name);

        let connect_options = match &config.credentials_file {
            Some(creds_file) => connect_options
                .credentials_file(creds_file)
                .await
                .map_err(ListenerError::bus_connect)?,
            None => connect_options,
        };

        let client =
            async_nats::connect_with_options(config.service_url.as_str(), connect_options)
                .await
                .map_err(ListenerError::bus_connect)?;

        info!(url = %config.service_url, "Connected to NATS");

        Ok(Arc::new(NatsBus::new(client, config.stream_name())))
    }
}

/// Connected NATS client with its JetStream context
pub struct NatsBus {
    client: Client,
    jetstream: JetStreamContext,
    stream_name: String,
}

impl NatsBus {
    pub fn new(client: Client, stream_name: impl Into<String>) -> Self {
        let jetstream = jetstream::new(client.clone());
        Self {
            client,
            jetstream,
            stream_name: stream_name.into(),
        }
    }

    async fn ensure_stream(&self, subject: &str) -> Result<()> {
        if self.jetstream.get_stream(&self.stream_name).await.is_ok() {
            debug!(stream = %self.stream_name, "Stream already exists");
            return Ok(());
        }

        info!(stream = %self.stream_name, subject, "Creating stream");

        let stream_config = StreamConfig {
            name: self.stream_name.clone(),
            subjects: vec![subject.to_string()],
            retention: RetentionPolicy::Limits,
            storage: StorageType::File,
            ..Default::default()
        };

        self.jetstream
            .create_stream(stream_config)
            .await
            .map_err(ListenerError::bus_connect)?;

        Ok(())
    }
}

#[async_trait]
impl MessageBus for NatsBus {
    async fn create_producer(
        &self,
        topic: &TopicPath,
        producer_name: &str,
    ) -> Result<Arc<dyn BusProducer>> {
        let subject = topic.subject();
        self.ensure_stream(&subject).await?;

        Ok(Arc::new(NatsProducer {
            client: self.client.clone(),
            jetstream: self.jetstream.clone(),
            subject,
            name: producer_name.to_string(),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.client
            .flush()
            .await
            .map_err(ListenerError::bus_connect)
    }
}

/// Publishes to one JetStream subject and waits for the storage ack
pub struct NatsProducer {
    client: Client,
    jetstream: JetStreamContext,
    subject: String,
    name: String,
}

#[async_trait]
impl BusProducer for NatsProducer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, message: BinaryMessage) -> Result<MessageId> {
        let mut headers = HeaderMap::new();
        for (name, value) in &message.headers {
            headers.insert(name.as_str(), value.as_str());
        }

        let ack = self
            .jetstream
            .publish_with_headers(self.subject.clone(), headers, message.body.into())
            .await
            .map_err(ListenerError::publish)?
            .await
            .map_err(ListenerError::publish)?;

        if ack.duplicate {
            debug!(stream = %ack.stream, sequence = ack.sequence, "Broker reported duplicate");
        }

        Ok(MessageId(format!("{}:{}", ack.stream, ack.sequence)))
    }

    async fn close(&self) -> Result<()> {
        self.client.flush().await.map_err(ListenerError::publish)
    }
}
