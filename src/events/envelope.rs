//! # Event envelope and wire encoding
//!
//! [`EventEnvelope`] is the canonical shape every notification is turned into
//! before publishing. On the wire it uses a binary-mode layout: envelope
//! attributes travel as message headers, `data` is the JSON message body.
//!
//! ```rust
//! use pg_listener::events::EventEnvelope;
//! use serde_json::json;
//!
//! let data = json!({"other": "x"}).as_object().cloned().unwrap();
//! let envelope = EventEnvelope::new(
//!     "mam.essence",
//!     "pg-listener",
//!     "tape-001",
//!     Some("abc-1".to_string()),
//!     data,
//! );
//!
//! let message = envelope.to_message().unwrap();
//! assert_eq!(message.header("ce-subject"), Some("tape-001"));
//!
//! let decoded = EventEnvelope::from_message(&message).unwrap();
//! assert_eq!(decoded, envelope);
//! ```

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::{ListenerError, Result};

/// Header names used by the binary-mode encoding
pub mod headers {
    pub const SPEC_VERSION: &str = "ce-specversion";
    pub const TYPE: &str = "ce-type";
    pub const SOURCE: &str = "ce-source";
    pub const SUBJECT: &str = "ce-subject";
    pub const CORRELATION_ID: &str = "ce-correlationid";
    pub const TIME: &str = "ce-time";
    pub const PRODUCER: &str = "ce-producer";
    pub const CONTENT_TYPE: &str = "content-type";
}

pub const SPEC_VERSION: &str = "1.0";
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Canonical event built from one notification. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    event_type: String,
    source: String,
    subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,
    data: Map<String, Value>,
    time: DateTime<Utc>,
}

impl EventEnvelope {
    /// Create an envelope stamped with the current time
    pub fn new(
        event_type: impl Into<String>,
        source: impl Into<String>,
        subject: impl Into<String>,
        correlation_id: Option<String>,
        data: Map<String, Value>,
    ) -> Self {
        Self::with_time(event_type, source, subject, correlation_id, data, Utc::now())
    }

    pub fn with_time(
        event_type: impl Into<String>,
        source: impl Into<String>,
        subject: impl Into<String>,
        correlation_id: Option<String>,
        data: Map<String, Value>,
        time: DateTime<Utc>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            source: source.into(),
            subject: subject.into(),
            correlation_id,
            data,
            time,
        }
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    /// Encode into the binary-mode wire layout
    pub fn to_message(&self) -> Result<BinaryMessage> {
        if self.event_type.is_empty() || self.source.is_empty() || self.subject.is_empty() {
            return Err(ListenerError::encoding(
                "type, source and subject must be non-empty",
            ));
        }

        let mut attributes = BTreeMap::new();
        attributes.insert(headers::SPEC_VERSION.to_string(), SPEC_VERSION.to_string());
        attributes.insert(headers::TYPE.to_string(), self.event_type.clone());
        attributes.insert(headers::SOURCE.to_string(), self.source.clone());
        attributes.insert(headers::SUBJECT.to_string(), self.subject.clone());
        if let Some(ref correlation_id) = self.correlation_id {
            attributes.insert(headers::CORRELATION_ID.to_string(), correlation_id.clone());
        }
        attributes.insert(
            headers::TIME.to_string(),
            self.time.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        );
        attributes.insert(
            headers::CONTENT_TYPE.to_string(),
            JSON_CONTENT_TYPE.to_string(),
        );

        let body = serde_json::to_vec(&self.data)?;

        Ok(BinaryMessage {
            headers: attributes,
            body,
            event_time: self.time,
        })
    }

    /// Decode an envelope from its binary-mode wire layout
    pub fn from_message(message: &BinaryMessage) -> Result<Self> {
        let required = |name: &str| {
            message
                .header(name)
                .map(str::to_string)
                .ok_or_else(|| ListenerError::encoding(format!("missing header {name}")))
        };

        let time = match message.header(headers::TIME) {
            Some(raw) => DateTime::parse_from_rfc3339(raw)
                .map_err(|e| ListenerError::encoding(format!("invalid {}: {e}", headers::TIME)))?
                .with_timezone(&Utc),
            None => message.event_time,
        };

        let data: Map<String, Value> = serde_json::from_slice(&message.body)?;

        Ok(Self {
            event_type: required(headers::TYPE)?,
            source: required(headers::SOURCE)?,
            subject: required(headers::SUBJECT)?,
            correlation_id: message.header(headers::CORRELATION_ID).map(str::to_string),
            data,
            time,
        })
    }
}

/// Transport-neutral message: key/value metadata, JSON body, event timestamp
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryMessage {
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    pub event_time: DateTime<Utc>,
}

impl BinaryMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Headers and body with the timestamp left out.
    ///
    /// Two translations of the same record have equal fingerprints.
    pub fn fingerprint(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.body.len() + 128);
        for (name, value) in self.headers.iter().filter(|(k, _)| *k != headers::TIME) {
            bytes.extend_from_slice(name.as_bytes());
            bytes.push(b'=');
            bytes.extend_from_slice(value.as_bytes());
            bytes.push(b'\n');
        }
        bytes.extend_from_slice(&self.body);
        bytes
    }
}
