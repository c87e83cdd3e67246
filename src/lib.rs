#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, JetStream in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # pg-listener
//!
//! Bridges a PostgreSQL `LISTEN/NOTIFY` channel to a durable message-bus topic.
//!
//! ## Overview
//!
//! Every notification on the configured channel is decoded as JSON, translated
//! into a canonical [`EventEnvelope`](events::EventEnvelope) and published to a
//! NATS JetStream subject. The listen connection survives transient outages
//! through a bounded reconnect policy; exhausting it is fatal so a process
//! supervisor can restart the service.
//!
//! ## Module Organization
//!
//! - [`events`] - Envelope, wire encoding and notification translation
//! - [`producer`] - Producer gateway and the NATS JetStream backend
//! - [`listener`] - Subscription loop and the Postgres notification source
//! - [`emitter`] - `pg_notify` emitter for injecting notifications
//! - [`resilience`] - Retry and reconnect policies
//! - [`config`] - Layered configuration
//! - [`logging`] - Structured console logging
//! - [`error`] - Structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pg_listener::config::ConfigLoader;
//! use pg_listener::listener::{LoopSettings, PgNotificationSource, SubscriptionLoop};
//! use pg_listener::producer::{NatsConnector, ProducerGateway};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConfigLoader::new().load()?;
//!
//! let gateway =
//!     ProducerGateway::connect(&NatsConnector, &config.bus, &config.retry.bus_connect).await?;
//! let source = PgNotificationSource::from_config(&config.database)?;
//!
//! SubscriptionLoop::new(
//!     Arc::new(source),
//!     Arc::new(gateway),
//!     LoopSettings::from_config(&config),
//! )
//! .run()
//! .await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod emitter;
pub mod error;
pub mod events;
pub mod listener;
pub mod logging;
pub mod producer;
pub mod resilience;

pub use config::{AppConfig, ConfigLoader};
pub use emitter::PgNotifyEmitter;
pub use error::{ListenerError, Result};
pub use events::{EventEnvelope, EventTranslator, NotificationRecord, TranslationError};
pub use listener::{
    ListenerState, ListenerStats, LoopSettings, Notification, NotificationOutcome,
    PgNotificationSource, SkipReason, SubscriptionLoop,
};
pub use producer::{EventPublisher, MessageId, NatsConnector, ProducerGateway};
pub use resilience::{ReconnectPolicy, RetryPolicy};
