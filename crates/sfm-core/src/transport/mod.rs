//! Transport capability: what the fetch layer needs from an HTTP stack.
//!
//! A [`Transport`] creates one [`Session`] per host. A session opens
//! [`Exchange`]s, each of which yields upload progress, exactly one response
//! head, then body chunks, or a terminal [`TransportError`]. Sessions can be
//! invalidated (connectivity change, certificate change); in-flight exchanges
//! on an invalidated session fail with `TransportError::SessionInvalidated`.

pub mod libcurl;
pub mod scripted;

use std::fmt;
use std::io::{self, Read};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::error::TransportError;
use crate::host::HostKey;
use crate::request::Headers;

pub use libcurl::{CurlOptions, CurlTransport};
pub use scripted::{Gate, RecordedRequest, ScriptedReply, ScriptedResponse, ScriptedTransport};

/// Body bytes for one attempt, already opened.
pub enum OutgoingBody {
    Empty,
    Bytes(Arc<[u8]>),
    Reader {
        reader: Box<dyn Read + Send>,
        len: Option<u64>,
    },
}

impl OutgoingBody {
    pub fn len(&self) -> Option<u64> {
        match self {
            OutgoingBody::Empty => Some(0),
            OutgoingBody::Bytes(b) => Some(b.len() as u64),
            OutgoingBody::Reader { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, OutgoingBody::Empty)
    }

    pub fn into_reader(self) -> (Box<dyn Read + Send>, Option<u64>) {
        match self {
            OutgoingBody::Empty => (Box::new(io::empty()), Some(0)),
            OutgoingBody::Bytes(b) => {
                let len = b.len() as u64;
                (Box::new(io::Cursor::new(b)), Some(len))
            }
            OutgoingBody::Reader { reader, len } => (reader, len),
        }
    }

    /// Drain the body into memory.
    pub fn read_all(self) -> io::Result<Vec<u8>> {
        match self {
            OutgoingBody::Empty => Ok(Vec::new()),
            OutgoingBody::Bytes(b) => Ok(b.to_vec()),
            OutgoingBody::Reader { mut reader, len } => {
                let mut buf = Vec::with_capacity(len.unwrap_or(0) as usize);
                reader.read_to_end(&mut buf)?;
                Ok(buf)
            }
        }
    }
}

impl fmt::Debug for OutgoingBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutgoingBody::Empty => f.write_str("Empty"),
            OutgoingBody::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            OutgoingBody::Reader { len, .. } => write!(f, "Reader(len={len:?})"),
        }
    }
}

/// A request as handed to a session for one attempt.
#[derive(Debug)]
pub struct OutgoingRequest {
    pub method: String,
    pub url: Url,
    pub headers: Headers,
    pub body: OutgoingBody,
    pub timeout: Option<Duration>,
}

/// Status line and headers of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Headers,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeEvent {
    /// Request body progress.
    Sent { sent: u64, total: Option<u64> },
    Head(ResponseHead),
    Chunk(Vec<u8>),
}

/// One open request/response exchange.
#[async_trait]
pub trait Exchange: Send {
    /// Next event, or `Ok(None)` once the response body is complete.
    async fn next_event(&mut self) -> Result<Option<ExchangeEvent>, TransportError>;

    /// Abort the exchange. Dropping an exchange aborts it as well.
    fn cancel(&mut self);
}

/// Per-host connection state shared by every fetch to that host.
pub trait Session: Send + Sync {
    fn open(&self, request: OutgoingRequest) -> Result<Box<dyn Exchange>, TransportError>;

    fn is_valid(&self) -> bool;

    /// Tear the session down; open exchanges fail with `SessionInvalidated`.
    fn invalidate(&self);
}

pub trait Transport: Send + Sync {
    fn create_session(&self, host: &HostKey) -> Result<Arc<dyn Session>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outgoing_body_lengths() {
        assert_eq!(OutgoingBody::Empty.len(), Some(0));
        assert_eq!(OutgoingBody::Bytes(Arc::from(&b"abc"[..])).len(), Some(3));
        let reader = OutgoingBody::Reader {
            reader: Box::new(io::Cursor::new(vec![1u8, 2])),
            len: None,
        };
        assert_eq!(reader.len(), None);
        assert_eq!(reader.read_all().unwrap(), vec![1, 2]);
    }

    #[test]
    fn into_reader_replays_bytes() {
        let (mut r, len) = OutgoingBody::Bytes(Arc::from(&b"hello"[..])).into_reader();
        let mut out = String::new();
        r.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello");
        assert_eq!(len, Some(5));
    }
}
