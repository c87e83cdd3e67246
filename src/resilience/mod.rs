//! # Resilience Module
//!
//! Backoff policies applied to connection establishment. Both policies are plain
//! values carried in configuration so they can be tuned per deployment and
//! exercised in isolation.

pub mod retry;

pub use retry::{ReconnectPolicy, RetryPolicy};
