//! Error types reported by transports and surfaced to fetch callers.

use thiserror::Error;

use crate::request::Headers;
use crate::retry::{self, ErrorKind};

/// Failure reported by a transport for a single exchange.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("session invalidated")]
    SessionInvalidated,
    #[error("exchange cancelled")]
    Cancelled,
    #[error("request rejected by transport: {0}")]
    InvalidRequest(String),
    #[error("request body could not be read: {0}")]
    Body(String),
    #[error("{0}")]
    Other(String),
}

/// Terminal outcome of a fetch or upload that did not succeed.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    /// Response status outside the acceptable set. The response data is kept.
    #[error("HTTP status {status}")]
    Status {
        status: u16,
        headers: Headers,
        body: Vec<u8>,
    },

    #[error("fetch cancelled")]
    Cancelled,

    #[error("fetch service stopped")]
    ServiceStopped,

    #[error("HTTP {status} challenge could not be answered")]
    ChallengeUnresolved { status: u16 },

    #[error("more than {limit} redirects")]
    RedirectLimit { limit: usize },

    #[error("redirect loop at {url}")]
    RedirectLoop { url: String },

    #[error("HTTP {status} redirect would turn {method} into GET for {location}; not approved")]
    RedirectRefused {
        status: u16,
        method: String,
        location: String,
    },

    /// The authorizer refused to sign the request.
    #[error("authorization failed: {0}")]
    Authorization(String),

    #[error("insecure request refused: {url}")]
    InsecureRequest { url: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Request body or download destination failed locally.
    #[error("body: {0}")]
    Body(String),

    /// The server acknowledged a different number of bytes than the client expected.
    #[error("upload offset mismatch: server has {server} bytes, client sent {sent}")]
    UploadOffsetMismatch { server: u64, sent: u64 },

    #[error("upload protocol violation: {0}")]
    UploadProtocol(String),

    /// The status query could not establish where to continue an upload.
    #[error("upload reconciliation failed: {0}")]
    UploadReconciliation(Box<FetchError>),

    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<FetchError> },
}

impl FetchError {
    /// Taxonomy bucket used by the backoff policy.
    pub fn kind(&self) -> ErrorKind {
        retry::classify(self)
    }

    /// The underlying failure, looking through `RetriesExhausted`.
    pub fn root(&self) -> &FetchError {
        match self {
            FetchError::RetriesExhausted { last, .. } => last.root(),
            other => other,
        }
    }

    /// HTTP status of a rejected response, if that is what failed.
    pub fn status(&self) -> Option<u16> {
        match self.root() {
            FetchError::Status { status, .. } => Some(*status),
            FetchError::ChallengeUnresolved { status } => Some(*status),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, FetchError::Cancelled)
    }
}
