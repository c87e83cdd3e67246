//! # Notification translation
//!
//! Pure functions turning a decoded notification into an [`EventEnvelope`].
//!
//! A notification record is a JSON object of the form:
//!
//! ```json
//! {"essence_name": "tape-001", "data": {"essence_id": 42, "correlation_id": "abc-1", "...": "..."}}
//! ```
//!
//! - `data` is required and must be an object.
//! - The subject is `essence_name` when present (top level first, then inside
//!   `data`), otherwise the string form of `data.essence_id`. An explicit name
//!   always wins over the derived id.
//! - `data.correlation_id` is lifted onto the envelope and removed from `data`.
//!   A name taken from `data.essence_name` is lifted the same way.
//!
//! Failures are returned as [`TranslationError`] values; nothing here retries,
//! blocks or touches the network.

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

use crate::error::{ListenerError, Result};
use crate::events::envelope::EventEnvelope;

pub const DATA_FIELD: &str = "data";
pub const ESSENCE_NAME_FIELD: &str = "essence_name";
pub const ESSENCE_ID_FIELD: &str = "essence_id";
pub const CORRELATION_ID_FIELD: &str = "correlation_id";

/// Expected, recoverable reasons a record cannot become an event
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TranslationError {
    #[error("notification has no `data` field")]
    MissingData,

    #[error("notification `data` is not an object")]
    DataNotAnObject,

    #[error("notification has neither `essence_name` nor `data.essence_id`")]
    MissingSubject,
}

/// Result of translating a single notification
pub type TranslationResult<T> = std::result::Result<T, TranslationError>;

/// Decoded notification payload
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationRecord {
    fields: Map<String, Value>,
}

impl NotificationRecord {
    /// Parse raw NOTIFY text. Invalid JSON or a non-object payload is an error.
    pub fn parse(raw_text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw_text)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(fields) => Ok(Self { fields }),
            other => Err(ListenerError::invalid_payload(format!(
                "expected a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }
}

impl From<Map<String, Value>> for NotificationRecord {
    fn from(fields: Map<String, Value>) -> Self {
        Self { fields }
    }
}

/// The record's `data` mapping
pub fn get_data(record: &NotificationRecord) -> TranslationResult<&Map<String, Value>> {
    match record.fields.get(DATA_FIELD) {
        None | Some(Value::Null) => Err(TranslationError::MissingData),
        Some(Value::Object(data)) => Ok(data),
        Some(_) => Err(TranslationError::DataNotAnObject),
    }
}

/// Where the subject of a record was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubjectOrigin {
    Name,
    DataName,
    DataId,
}

fn locate_subject(record: &NotificationRecord) -> TranslationResult<(String, SubjectOrigin)> {
    if let Some(name) = record.fields.get(ESSENCE_NAME_FIELD).and_then(non_empty_text) {
        return Ok((name, SubjectOrigin::Name));
    }

    let data = get_data(record).ok();
    let field = |key: &str| data.and_then(|d| d.get(key)).and_then(non_empty_text);

    if let Some(name) = field(ESSENCE_NAME_FIELD) {
        return Ok((name, SubjectOrigin::DataName));
    }

    field(ESSENCE_ID_FIELD)
        .map(|id| (id, SubjectOrigin::DataId))
        .ok_or(TranslationError::MissingSubject)
}

/// The event subject: `essence_name`, else `data.essence_id` as a string
pub fn get_subject(record: &NotificationRecord) -> TranslationResult<String> {
    locate_subject(record).map(|(subject, _)| subject)
}

/// Build the envelope for `record`, stamped with the current time
pub fn build_envelope(
    record: &NotificationRecord,
    event_type: &str,
    source: &str,
) -> TranslationResult<EventEnvelope> {
    let mut data = get_data(record)?.clone();
    let (subject, origin) = locate_subject(record)?;

    if origin == SubjectOrigin::DataName {
        data.remove(ESSENCE_NAME_FIELD);
    }

    let correlation_id = data
        .remove(CORRELATION_ID_FIELD)
        .as_ref()
        .and_then(non_empty_text);

    if correlation_id.is_none() {
        warn!(
            subject = %subject,
            event_type = event_type,
            "Notification carries no correlation_id"
        );
    }

    Ok(EventEnvelope::new(event_type, source, subject, correlation_id, data))
}

/// Translator bound to the process-wide event type and source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTranslator {
    event_type: String,
    source: String,
}

impl EventTranslator {
    pub fn new(event_type: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            source: source.into(),
        }
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn translate(&self, record: &NotificationRecord) -> TranslationResult<EventEnvelope> {
        build_envelope(record, &self.event_type, &self.source)
    }
}

/// String form of a scalar JSON value; `None` for null and empty strings
fn non_empty_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::Null => return None,
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    (!text.is_empty()).then_some(text)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
