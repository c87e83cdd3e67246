//! NOTIFY emitter.
//!
//! Sends JSON payloads to a channel with `pg_notify`. Used by the `emit`
//! subcommand to inject test events and by the database-backed tests.

use serde_json::Value;
use sqlx::PgPool;
use tracing::{debug, error, instrument, warn};

use crate::config::is_valid_channel_name;
use crate::error::{ListenerError, Result};

/// Postgres rejects NOTIFY payloads of this many bytes or more
pub const NOTIFY_PAYLOAD_LIMIT: usize = 8000;

/// Default payload ceiling, kept under the hard limit
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 7800;

/// Database-backed emitter using `pg_notify`
pub struct PgNotifyEmitter {
    pool: PgPool,
    max_payload_size: usize,
}

impl std::fmt::Debug for PgNotifyEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgNotifyEmitter")
            .field("max_payload_size", &self.max_payload_size)
            .field("pool", &"PgPool")
            .finish()
    }
}

impl PgNotifyEmitter {
    /// `max_payload_size` is capped just below [`NOTIFY_PAYLOAD_LIMIT`]
    pub fn new(pool: PgPool, max_payload_size: usize) -> Self {
        Self {
            pool,
            max_payload_size: max_payload_size.min(NOTIFY_PAYLOAD_LIMIT - 1),
        }
    }

    pub fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }

    /// Send `payload` as a notification on `channel`
    #[instrument(skip(self, payload), fields(channel = %channel))]
    pub async fn emit(&self, channel: &str, payload: &Value) -> Result<()> {
        if !is_valid_channel_name(channel)? {
            return Err(ListenerError::config(format!(
                "'{channel}' is not a valid channel name"
            )));
        }

        let payload = encode_payload(payload, self.max_payload_size)?;

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(&payload)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to send notification to channel {}: {}", channel, e);
                ListenerError::Database(e)
            })?;

        debug!(bytes = payload.len(), "Notification sent");
        Ok(())
    }

    /// Whether a connection can be acquired
    pub async fn is_healthy(&self) -> bool {
        match self.pool.acquire().await {
            Ok(_) => true,
            Err(e) => {
                warn!("Emitter health check failed: {}", e);
                false
            }
        }
    }
}

/// Serialize `payload`, rejecting anything larger than `limit` bytes
pub fn encode_payload(payload: &Value, limit: usize) -> Result<String> {
    let encoded = serde_json::to_string(payload)?;
    if encoded.len() > limit {
        return Err(ListenerError::PayloadTooLarge {
            size: encoded.len(),
            limit,
        });
    }
    Ok(encoded)
}
