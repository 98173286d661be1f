//! Request descriptor: method, URL, headers, body and per-attempt timeout.

use std::fmt;
use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::error::FetchError;
use crate::host::HostKey;
use crate::transport::OutgoingBody;

/// Ordered, case-insensitive header multimap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replace every existing value of `name` with `value`.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.0.push((name, value.into()));
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn content_length(&self) -> Option<u64> {
        self.get("Content-Length").and_then(|v| v.trim().parse().ok())
    }

    /// Parse a raw `Name: value` header line. Returns None for lines without a colon
    /// or with an empty name.
    pub fn parse_line(line: &str) -> Option<(String, String)> {
        let (name, value) = line.split_once(':')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        Some((name.to_string(), value.trim().to_string()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Supplies a fresh reader for a streamed body on every attempt.
pub trait BodyStreamProvider: Send + Sync {
    fn open(&self) -> io::Result<Box<dyn Read + Send>>;

    /// Length in bytes when known up front.
    fn len(&self) -> Option<u64> {
        None
    }
}

/// Request body. Every variant can be replayed, so retries and
/// method-preserving redirects resend the same bytes.
#[derive(Clone, Default)]
pub enum Body {
    #[default]
    Empty,
    Bytes(Arc<[u8]>),
    /// Reopened on every attempt.
    File(PathBuf),
    Stream(Arc<dyn BodyStreamProvider>),
}

impl Body {
    pub fn is_empty(&self) -> bool {
        match self {
            Body::Empty => true,
            Body::Bytes(b) => b.is_empty(),
            Body::File(_) | Body::Stream(_) => false,
        }
    }

    /// Open the body for one attempt.
    pub(crate) fn open(&self) -> Result<OutgoingBody, FetchError> {
        match self {
            Body::Empty => Ok(OutgoingBody::Empty),
            Body::Bytes(b) => Ok(OutgoingBody::Bytes(Arc::clone(b))),
            Body::File(path) => {
                let file = fs::File::open(path)
                    .map_err(|e| FetchError::Body(format!("open {}: {e}", path.display())))?;
                let len = file.metadata().ok().map(|m| m.len());
                Ok(OutgoingBody::Reader {
                    reader: Box::new(file),
                    len,
                })
            }
            Body::Stream(provider) => {
                let reader = provider
                    .open()
                    .map_err(|e| FetchError::Body(format!("open body stream: {e}")))?;
                Ok(OutgoingBody::Reader {
                    reader,
                    len: provider.len(),
                })
            }
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => f.write_str("Empty"),
            Body::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            Body::File(p) => f.debug_tuple("File").field(p).finish(),
            Body::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(v: Vec<u8>) -> Self {
        Body::Bytes(v.into())
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Self {
        Body::Bytes(s.as_bytes().into())
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Body::Bytes(s.into_bytes().into())
    }
}

/// An HTTP request as submitted to a `FetchService`.
#[derive(Debug, Clone)]
pub struct Request {
    method: String,
    url: Url,
    headers: Headers,
    body: Body,
    timeout: Option<Duration>,
}

impl Request {
    /// Build a request. The method must be a non-empty HTTP token.
    pub fn new(method: &str, url: &str) -> Result<Self, FetchError> {
        if method.is_empty() || !method.bytes().all(is_token_byte) {
            return Err(FetchError::InvalidRequest(format!(
                "invalid method {method:?}"
            )));
        }
        let url = Url::parse(url)
            .map_err(|e| FetchError::InvalidRequest(format!("invalid URL {url}: {e}")))?;
        HostKey::from_url(&url)?;
        Ok(Self {
            method: method.to_string(),
            url,
            headers: Headers::new(),
            body: Body::Empty,
            timeout: None,
        })
    }

    pub fn get(url: &str) -> Result<Self, FetchError> {
        Self::new("GET", url)
    }

    pub fn post(url: &str, body: impl Into<Body>) -> Result<Self, FetchError> {
        Ok(Self::new("POST", url)?.with_body(body))
    }

    pub fn put(url: &str, body: impl Into<Body>) -> Result<Self, FetchError> {
        Ok(Self::new("PUT", url)?.with_body(body))
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn host_key(&self) -> Result<HostKey, FetchError> {
        HostKey::from_url(&self.url)
    }
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}
