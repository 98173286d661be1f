//! Backoff policy and failure classification.

pub mod classify;
pub mod policy;

pub use classify::{classify, classify_http_status, classify_transport_error, retry_after};
pub use policy::{BackoffPolicy, ErrorKind, RetryDecision};
