//! Tests against live services.
//!
//! Run with `cargo test -- --ignored` and `DATABASE_URL` / `NATS_URL` set.

mod common;

use common::*;
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use pg_listener::config::BusConfig;
use pg_listener::emitter::{PgNotifyEmitter, DEFAULT_MAX_PAYLOAD_SIZE};
use pg_listener::error::ListenerError;
use pg_listener::events::EventEnvelope;
use pg_listener::listener::{NotificationSource, PgNotificationSource, SubscriptionLoop};
use pg_listener::producer::{EventPublisher, NatsConnector, ProducerGateway};
use pg_listener::resilience::{ReconnectPolicy, RetryPolicy};

fn database_url() -> String {
    std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for integration tests")
}

fn nats_bus_config() -> BusConfig {
    BusConfig {
        service_url: std::env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".into()),
        namespace: "pglistener".to_string(),
        topic: format!("it_{}", uuid::Uuid::new_v4().simple()),
        producer_name: "pg-listener-it".to_string(),
        ..BusConfig::default()
    }
}

fn unique_channel() -> String {
    format!("pg_listener_it_{}", uuid::Uuid::new_v4().simple())
}

#[tokio::test]
#[ignore = "requires a PostgreSQL instance at DATABASE_URL"]
async fn test_listen_receives_emitted_notification() {
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&database_url())
        .await
        .unwrap();
    let channel = unique_channel();

    let source = PgNotificationSource::new(pool.clone());
    let mut stream = source.connect(&channel).await.unwrap();

    let emitter = PgNotifyEmitter::new(pool.clone(), DEFAULT_MAX_PAYLOAD_SIZE);
    emitter
        .emit(&channel, &json!({"data": {"essence_id": 42}}))
        .await
        .unwrap();

    let notification = tokio::time::timeout(Duration::from_secs(5), stream.next_notification())
        .await
        .expect("notification not delivered")
        .unwrap();

    assert_eq!(notification.channel, channel);
    assert_eq!(notification.payload, r#"{"data":{"essence_id":42}}"#);

    stream.close().await.unwrap();
    assert!(emitter.is_healthy().await);
}

async fn listening_backends(pool: &sqlx::PgPool, channel: &str) -> i64 {
    sqlx::query_scalar(
        "SELECT count(*) FROM pg_stat_activity \
         WHERE query LIKE '%' || $1 || '%' AND pid <> pg_backend_pid()",
    )
    .bind(channel)
    .fetch_one(pool)
    .await
    .unwrap()
}

#[tokio::test]
#[ignore = "requires a PostgreSQL instance at DATABASE_URL"]
async fn test_terminated_backend_ends_stream_without_relisten() {
    let admin = PgPoolOptions::new()
        .max_connections(1)
        .connect(&database_url())
        .await
        .unwrap();
    let listen_pool = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(2))
        .connect(&database_url())
        .await
        .unwrap();
    let channel = unique_channel();

    let source = PgNotificationSource::new(listen_pool);
    let mut stream = source.connect(&channel).await.unwrap();
    assert_eq!(listening_backends(&admin, &channel).await, 1);

    sqlx::query(
        "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
         WHERE query LIKE '%' || $1 || '%' AND pid <> pg_backend_pid()",
    )
    .bind(&channel)
    .execute(&admin)
    .await
    .unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), stream.next_notification())
        .await
        .expect("connection loss not reported");
    assert!(matches!(result, Err(ListenerError::ConnectionLost { .. })));

    // the driver must not have opened a replacement LISTEN connection
    assert_eq!(listening_backends(&admin, &channel).await, 0);
    stream.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a PostgreSQL instance at DATABASE_URL"]
async fn test_loop_publishes_from_postgres() {
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&database_url())
        .await
        .unwrap();
    let channel = unique_channel();
    let publisher = Arc::new(RecordingPublisher::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut settings = loop_settings(ReconnectPolicy::default());
    settings.channel = channel.clone();
    let subscription = SubscriptionLoop::new(
        Arc::new(PgNotificationSource::new(pool.clone())),
        publisher.clone(),
        settings,
    )
    .with_shutdown(shutdown_rx);
    let stats = subscription.stats_handle();
    let handle = tokio::spawn(subscription.run());

    wait_until(|| stats.read().connected).await;

    let emitter = PgNotifyEmitter::new(pool, DEFAULT_MAX_PAYLOAD_SIZE);
    emitter
        .emit(&channel, &json!({"data": "broken"}))
        .await
        .unwrap();
    emitter
        .emit(
            &channel,
            &json!({"data": {"essence_name": "tape-001", "correlation_id": "abc-1"}}),
        )
        .await
        .unwrap();

    tokio::time::timeout(
        Duration::from_secs(5),
        wait_until(|| publisher.published_count() == 1),
    )
    .await
    .expect("event not published");

    assert_eq!(publisher.published()[0].subject(), "tape-001");
    assert_eq!(stats.read().translation_errors, 1);

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
#[ignore = "requires a NATS server with JetStream at NATS_URL"]
async fn test_nats_publish_returns_stream_sequence() {
    let config = nats_bus_config();
    let gateway = ProducerGateway::connect(&NatsConnector, &config, &RetryPolicy::default())
        .await
        .unwrap();

    let envelope = EventEnvelope::new(
        config.subject(),
        "pg-listener-it",
        "tape-001",
        Some("abc-1".to_string()),
        json!({"other": "x"}).as_object().cloned().unwrap(),
    );

    let first = gateway.publish(&envelope).await.unwrap();
    let second = gateway.publish(&envelope).await.unwrap();

    let stream = config.stream_name();
    assert_eq!(first.to_string(), format!("{stream}:1"));
    assert_eq!(second.to_string(), format!("{stream}:2"));

    gateway.close().await;
}
