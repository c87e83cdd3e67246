//! # Configuration
//!
//! The configuration record handed to every component at construction. Nothing
//! reads configuration from global state; the binary loads one [`AppConfig`]
//! through [`ConfigLoader`] and passes the relevant sections down.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use pg_listener::config::ConfigLoader;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConfigLoader::new()
//!     .load_unvalidated()?
//!     .with_channel_override(Some("essence_events".to_string()));
//! config.validate()?;
//!
//! println!("listening on {}", config.database.channel);
//! println!("publishing to {}", config.bus.subject());
//! # Ok(())
//! # }
//! ```

pub mod loader;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnectOptions;
use std::time::Duration;

use crate::error::{ListenerError, Result};
use crate::resilience::{ReconnectPolicy, RetryPolicy};

pub use loader::ConfigLoader;

/// Postgres identifiers are truncated past 63 bytes
const CHANNEL_NAME_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_$.\-]{0,62}$";
const SUBJECT_TOKEN_PATTERN: &str = r"^[A-Za-z0-9_\-]+$";

/// Top-level configuration record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub bus: BusConfig,
    pub event: EventConfig,
    pub retry: RetryConfig,
    pub logging: LoggingConfig,
}

/// Database holding the notification channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
    /// Channel passed to LISTEN
    pub channel: String,
    /// Full connection URL; takes precedence over the discrete fields
    pub url: Option<String>,
    /// Upper bound on one connection attempt, including the driver's own retries
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            name: String::new(),
            user: String::new(),
            password: String::new(),
            channel: String::new(),
            url: None,
            acquire_timeout_secs: 5,
        }
    }
}

impl DatabaseConfig {
    /// Connection options for the listen connection
    pub fn connect_options(&self) -> Result<PgConnectOptions> {
        if let Some(ref url) = self.url {
            return url
                .parse::<PgConnectOptions>()
                .map_err(|e| ListenerError::config(format!("invalid database url: {e}")));
        }

        Ok(PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.name)
            .username(&self.user)
            .password(&self.password)
            .application_name(env!("CARGO_PKG_NAME")))
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

/// Message bus service and topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub service_url: String,
    pub namespace: String,
    pub topic: String,
    /// Stable producer name, also used as the bus client name
    pub producer_name: String,
    /// Durable stream backing the topic; derived from namespace/topic when absent
    pub stream: Option<String>,
    pub credentials_file: Option<String>,
    pub connection_timeout_secs: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            service_url: "nats://localhost:4222".to_string(),
            namespace: String::new(),
            topic: String::new(),
            producer_name: env!("CARGO_PKG_NAME").to_string(),
            stream: None,
            credentials_file: None,
            connection_timeout_secs: 5,
        }
    }
}

impl BusConfig {
    pub fn topic_path(&self) -> TopicPath {
        TopicPath::new(&self.namespace, &self.topic)
    }

    /// Subject messages are published on
    pub fn subject(&self) -> String {
        self.topic_path().subject()
    }

    pub fn stream_name(&self) -> String {
        self.stream
            .clone()
            .unwrap_or_else(|| self.topic_path().default_stream_name())
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }
}

/// Logical topic address built from namespace and topic names
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPath {
    pub namespace: String,
    pub topic: String,
}

impl TopicPath {
    pub fn new(namespace: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            topic: topic.into(),
        }
    }

    pub fn subject(&self) -> String {
        format!("{}.{}", self.namespace, self.topic)
    }

    pub fn default_stream_name(&self) -> String {
        format!("{}_{}", self.namespace, self.topic)
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect()
    }
}

impl std::fmt::Display for TopicPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.topic)
    }
}

/// Fixed envelope attributes for this process
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    /// Defaults to the bus subject
    pub event_type: Option<String>,
    /// Defaults to the producer name
    pub source: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub bus_connect: RetryPolicy,
    pub reconnect: ReconnectPolicy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive; `RUST_LOG` wins when set
    pub level: Option<String>,
    pub format: LogFormat,
}

impl AppConfig {
    /// Apply the command-line channel override, if any
    pub fn with_channel_override(mut self, channel: Option<String>) -> Self {
        if let Some(channel) = channel.filter(|c| !c.trim().is_empty()) {
            self.database.channel = channel;
        }
        self
    }

    pub fn event_type(&self) -> String {
        self.event
            .event_type
            .clone()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| self.bus.subject())
    }

    pub fn event_source(&self) -> String {
        self.event
            .source
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| self.bus.producer_name.clone())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_none() {
            require("database.host", &self.database.host)?;
            require("database.name", &self.database.name)?;
            require("database.user", &self.database.user)?;
        }
        self.database.connect_options()?;
        if self.database.acquire_timeout_secs == 0 {
            return Err(ListenerError::config(
                "database.acquire_timeout_secs must be greater than zero",
            ));
        }

        require("database.channel", &self.database.channel)?;
        if !is_valid_channel_name(&self.database.channel)? {
            return Err(ListenerError::config(format!(
                "database.channel '{}' is not a valid channel name",
                self.database.channel
            )));
        }

        require("bus.service_url", &self.bus.service_url)?;
        require("bus.producer_name", &self.bus.producer_name)?;
        let token = compile(SUBJECT_TOKEN_PATTERN)?;
        for (field, value) in [
            ("bus.namespace", &self.bus.namespace),
            ("bus.topic", &self.bus.topic),
        ] {
            require(field, value)?;
            if !token.is_match(value) {
                return Err(ListenerError::config(format!(
                    "{field} '{value}' may only contain letters, digits, '_' and '-'"
                )));
            }
        }

        self.retry.bus_connect.validate()?;
        self.retry.reconnect.validate()?;

        Ok(())
    }
}

/// Whether `channel` can be used with LISTEN/NOTIFY
pub fn is_valid_channel_name(channel: &str) -> Result<bool> {
    Ok(compile(CHANNEL_NAME_PATTERN)?.is_match(channel))
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| ListenerError::config(format!("invalid pattern: {e}")))
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(ListenerError::config(format!("{field} must not be empty")));
    }
    Ok(())
}

/// Current deployment environment
pub fn detect_environment() -> String {
    std::env::var("PG_LISTENER_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
        .to_lowercase()
}
