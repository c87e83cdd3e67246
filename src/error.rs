//! Error types for pg-listener

use thiserror::Error;

/// Result type for pg-listener operations
pub type Result<T> = std::result::Result<T, ListenerError>;

/// Errors that can occur while bridging notifications to the message bus
#[derive(Error, Debug)]
pub enum ListenerError {
    /// Database driver errors outside of connection establishment
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration source could not be read or deserialized
    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    /// Invalid configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Opening the listen connection or issuing LISTEN failed
    #[error("Failed to connect listener on channel {channel}: {message}")]
    DatabaseConnect { channel: String, message: String },

    /// The listen connection dropped while waiting for notifications
    #[error("Listen connection lost on channel {channel}")]
    ConnectionLost { channel: String },

    /// A single attempt to reach the message bus failed
    #[error("Message bus connection error: {message}")]
    BusConnect { message: String },

    /// Bounded connection retries were used up
    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    ConnectionExhausted {
        operation: String,
        attempts: u32,
        last_error: String,
    },

    /// Consecutive listen reconnect failures exceeded the ceiling
    #[error("Reconnect to channel {channel} abandoned after {failures} consecutive failures")]
    ReconnectExhausted { channel: String, failures: u32 },

    /// The bus rejected or could not send a message
    #[error("Publish error: {message}")]
    Publish { message: String },

    /// Envelope could not be converted to or from its wire form
    #[error("Encoding error: {message}")]
    Encoding { message: String },

    /// A notification payload was not a structured object
    #[error("Invalid notification payload: {message}")]
    InvalidPayload { message: String },

    /// Notification payload exceeds the NOTIFY size limit
    #[error("Payload size {size} exceeds limit {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    /// Operation requires an open connection
    #[error("Listener is not connected to database")]
    NotConnected,
}

impl ListenerError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a listen connection error
    pub fn database_connect<C: Into<String>, S: ToString>(channel: C, error: S) -> Self {
        Self::DatabaseConnect {
            channel: channel.into(),
            message: error.to_string(),
        }
    }

    /// Create a bus connection error
    pub fn bus_connect<S: ToString>(error: S) -> Self {
        Self::BusConnect {
            message: error.to_string(),
        }
    }

    /// Create a publish error
    pub fn publish<S: ToString>(error: S) -> Self {
        Self::Publish {
            message: error.to_string(),
        }
    }

    /// Create an encoding error
    pub fn encoding<S: Into<String>>(message: S) -> Self {
        Self::Encoding {
            message: message.into(),
        }
    }

    /// Create an invalid payload error
    pub fn invalid_payload<S: Into<String>>(message: S) -> Self {
        Self::InvalidPayload {
            message: message.into(),
        }
    }

    /// Errors that must stop the process so a supervisor can restart it
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConnectionExhausted { .. }
                | Self::ReconnectExhausted { .. }
                | Self::Configuration { .. }
                | Self::ConfigSource(_)
        )
    }
}
