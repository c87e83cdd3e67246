//! PostgreSQL LISTEN source built on `sqlx::PgListener`.
//!
//! Each [`NotificationSource::connect`] call takes a fresh connection from a
//! dedicated pool and issues LISTEN on it. One call is one bounded attempt: the
//! pool gives up after `database.acquire_timeout_secs`. The driver's eager
//! reconnect is switched off, so the first `try_recv` that reports a lost
//! connection ends the stream with [`ListenerError::ConnectionLost`] and the
//! subscription loop owns every reconnect.

use async_trait::async_trait;
use sqlx::postgres::{PgListener, PgPool, PgPoolOptions};
use tracing::{debug, info, instrument, warn};

use super::{Notification, NotificationSource, NotificationStream};
use crate::config::{is_valid_channel_name, DatabaseConfig};
use crate::error::{ListenerError, Result};

/// Opens LISTEN connections against a Postgres pool
#[derive(Clone)]
pub struct PgNotificationSource {
    pool: PgPool,
}

impl std::fmt::Debug for PgNotificationSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgNotificationSource")
            .field("pool", &"PgPool")
            .finish()
    }
}

impl PgNotificationSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Source with a lazily connected single-connection pool.
    ///
    /// No connection is opened until the first `connect` call.
    pub fn from_config(config: &DatabaseConfig) -> Result<Self> {
        let options = config.connect_options()?;
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(config.acquire_timeout())
            .connect_lazy_with(options);
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl NotificationSource for PgNotificationSource {
    #[instrument(skip(self))]
    async fn connect(&self, channel: &str) -> Result<Box<dyn NotificationStream>> {
        if !is_valid_channel_name(channel)? {
            return Err(ListenerError::config(format!(
                "'{channel}' is not a valid channel name"
            )));
        }

        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| ListenerError::database_connect(channel, e))?;
        listener.eager_reconnect(false);

        listener
            .listen(channel)
            .await
            .map_err(|e| ListenerError::database_connect(channel, e))?;

        info!(channel, "LISTEN acknowledged");

        Ok(Box::new(PgNotificationStream {
            listener: Some(listener),
            channel: channel.to_string(),
            lost: false,
        }))
    }
}

/// One listening connection
pub struct PgNotificationStream {
    listener: Option<PgListener>,
    channel: String,
    lost: bool,
}

#[async_trait]
impl NotificationStream for PgNotificationStream {
    async fn next_notification(&mut self) -> Result<Notification> {
        let listener = self.listener.as_mut().ok_or(ListenerError::NotConnected)?;

        match listener.try_recv().await {
            Ok(Some(notification)) => Ok(Notification::new(
                notification.channel(),
                notification.payload(),
            )),
            Ok(None) => {
                self.lost = true;
                Err(ListenerError::ConnectionLost {
                    channel: self.channel.clone(),
                })
            }
            Err(e) => {
                self.lost = true;
                warn!(channel = %self.channel, error = %e, "Listen connection failed");
                Err(ListenerError::ConnectionLost {
                    channel: self.channel.clone(),
                })
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        let Some(mut listener) = self.listener.take() else {
            return Ok(());
        };

        // unlisten on a dead connection would make the driver reconnect
        if !self.lost {
            listener.unlisten_all().await?;
        }
        drop(listener);

        debug!(channel = %self.channel, "Listen connection closed");
        Ok(())
    }
}
