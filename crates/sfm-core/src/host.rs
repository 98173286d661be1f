//! Host identity used for admission ceilings and session sharing.

use std::fmt;

use url::{Host, Url};

use crate::error::FetchError;

/// Key used to group fetches by origin.
///
/// URLs are normalised down to `(scheme, host, port)` so that different paths
/// on the same origin share one transport session and one concurrency ceiling.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostKey {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl HostKey {
    pub fn new(scheme: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: scheme.into(),
            host: host.into(),
            port,
        }
    }

    /// Construct a host key from a parsed URL.
    pub fn from_url(url: &Url) -> Result<Self, FetchError> {
        let host = url
            .host_str()
            .ok_or_else(|| FetchError::InvalidRequest(format!("URL has no host: {url}")))?
            .to_ascii_lowercase();
        let port = url.port_or_known_default().ok_or_else(|| {
            FetchError::InvalidRequest(format!("URL has no port and no known default: {url}"))
        })?;
        Ok(Self {
            scheme: url.scheme().to_string(),
            host,
            port,
        })
    }

    /// Parse a URL string and take its host key.
    pub fn parse(url: &str) -> Result<Self, FetchError> {
        let parsed = Url::parse(url)
            .map_err(|e| FetchError::InvalidRequest(format!("invalid URL {url}: {e}")))?;
        Self::from_url(&parsed)
    }
}

impl fmt::Display for HostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// True when the URL points at the local machine (`localhost` or a loopback address).
pub fn is_localhost(url: &Url) -> bool {
    match url.host() {
        Some(Host::Domain(d)) => d.eq_ignore_ascii_case("localhost"),
        Some(Host::Ipv4(ip)) => ip.is_loopback(),
        Some(Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    }
}
