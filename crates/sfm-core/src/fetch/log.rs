//! Request/response tracing sink.

use std::time::Duration;

use super::FetchId;

/// One request/response pair, as seen by a single attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeRecord {
    pub fetch: FetchId,
    pub comment: Option<String>,
    pub method: String,
    pub url: String,
    pub status: Option<u16>,
    pub duration: Duration,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub error: Option<String>,
}

/// Observational sink for exchange records. Nothing in the fetch path depends on it.
pub trait FetchLogger: Send + Sync {
    fn record(&self, record: &ExchangeRecord);
}

/// Emits each record as a structured `tracing` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl FetchLogger for TracingLogger {
    fn record(&self, r: &ExchangeRecord) {
        let comment = r.comment.as_deref().unwrap_or("");
        match (&r.error, r.status) {
            (None, Some(status)) => tracing::info!(
                fetch = %r.fetch,
                comment,
                method = %r.method,
                url = %r.url,
                status,
                duration_ms = r.duration.as_millis() as u64,
                sent = r.bytes_sent,
                received = r.bytes_received,
                "exchange complete"
            ),
            (error, status) => tracing::warn!(
                fetch = %r.fetch,
                comment,
                method = %r.method,
                url = %r.url,
                status = status.unwrap_or(0),
                duration_ms = r.duration.as_millis() as u64,
                sent = r.bytes_sent,
                received = r.bytes_received,
                error = error.as_deref().unwrap_or("incomplete response"),
                "exchange failed"
            ),
        }
    }
}
