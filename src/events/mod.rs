//! # Events
//!
//! The canonical event envelope, its wire encoding and the translation from
//! database notification payloads.

pub mod envelope;
pub mod translator;

pub use envelope::{BinaryMessage, EventEnvelope};
pub use translator::{
    build_envelope, get_data, get_subject, EventTranslator, NotificationRecord, TranslationError,
    TranslationResult,
};
