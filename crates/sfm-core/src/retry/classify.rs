//! Classify HTTP statuses, transport errors and fetch errors into retry kinds.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{FetchError, TransportError};
use crate::request::Headers;
use crate::retry::policy::ErrorKind;

/// Classify a non-acceptable HTTP status (challenges excluded) for retry decisions.
pub fn classify_http_status(status: u16, headers: &Headers) -> ErrorKind {
    match status {
        408 => ErrorKind::TransientNetwork,
        429 => ErrorKind::RateLimited {
            retry_after: retry_after(headers),
        },
        503 => match retry_after(headers) {
            Some(hint) => ErrorKind::RateLimited {
                retry_after: Some(hint),
            },
            None => ErrorKind::TransientNetwork,
        },
        500..=599 => ErrorKind::TransientNetwork,
        _ => ErrorKind::Permanent,
    }
}

pub fn classify_transport_error(e: &TransportError) -> ErrorKind {
    match e {
        TransportError::Timeout | TransportError::Connection(_) => ErrorKind::TransientNetwork,
        TransportError::SessionInvalidated => ErrorKind::SessionInvalidated,
        TransportError::Cancelled => ErrorKind::Cancelled,
        TransportError::InvalidRequest(_) | TransportError::Body(_) | TransportError::Other(_) => {
            ErrorKind::Permanent
        }
    }
}

/// Classify a fetch error into an ErrorKind.
pub fn classify(e: &FetchError) -> ErrorKind {
    match e {
        FetchError::Transport(te) => classify_transport_error(te),
        FetchError::Status {
            status, headers, ..
        } => classify_http_status(*status, headers),
        FetchError::Cancelled | FetchError::ServiceStopped => ErrorKind::Cancelled,
        FetchError::UploadOffsetMismatch { .. } => ErrorKind::TransientNetwork,
        FetchError::RetriesExhausted { last, .. } => classify(last),
        FetchError::ChallengeUnresolved { .. }
        | FetchError::RedirectLimit { .. }
        | FetchError::RedirectLoop { .. }
        | FetchError::RedirectRefused { .. }
        | FetchError::Authorization(_)
        | FetchError::InsecureRequest { .. }
        | FetchError::InvalidRequest(_)
        | FetchError::Body(_)
        | FetchError::UploadProtocol(_)
        | FetchError::UploadReconciliation(_) => ErrorKind::Permanent,
    }
}

/// Server-suggested wait from `Retry-After` (delta-seconds or HTTP-date) or
/// `X-RateLimit-Reset-After` (seconds, possibly fractional).
pub fn retry_after(headers: &Headers) -> Option<Duration> {
    retry_after_at(headers, Utc::now())
}

pub(crate) fn retry_after_at(headers: &Headers, now: DateTime<Utc>) -> Option<Duration> {
    if let Some(v) = headers.get("Retry-After") {
        if let Some(d) = parse_retry_after(v, now) {
            return Some(d);
        }
    }
    headers
        .get("X-RateLimit-Reset-After")
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|s| s.is_finite() && *s >= 0.0)
        .map(Duration::from_secs_f64)
}

fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}
