//! Authentication challenges (401/407) and the resolver capability that answers them.

use std::fmt;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::request::{Headers, Request};

/// Resolution rounds a single fetch may go through before giving up.
pub(crate) const MAX_CHALLENGE_ROUNDS: u32 = 3;

/// A server (401) or proxy (407) demand for credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub status: u16,
    pub proxy: bool,
    /// Auth scheme named first in the header, e.g. `Basic` or `Bearer`.
    pub scheme: String,
    pub realm: Option<String>,
    /// Raw `WWW-Authenticate` / `Proxy-Authenticate` value.
    pub header: String,
}

impl Challenge {
    /// Parse a challenge out of a response, if it is one.
    pub fn from_response(status: u16, headers: &Headers) -> Option<Self> {
        let (proxy, header_name) = match status {
            401 => (false, "WWW-Authenticate"),
            407 => (true, "Proxy-Authenticate"),
            _ => return None,
        };
        let header = headers.get(header_name).unwrap_or("").trim().to_string();
        let scheme = header
            .split_whitespace()
            .next()
            .unwrap_or("")
            .trim_end_matches(',')
            .to_string();
        let realm = parse_realm(&header);
        Some(Self {
            status,
            proxy,
            scheme,
            realm,
            header,
        })
    }

    /// Request header that carries the answer.
    pub fn answer_header(&self) -> &'static str {
        if self.proxy {
            "Proxy-Authorization"
        } else {
            "Authorization"
        }
    }
}

fn parse_realm(header: &str) -> Option<String> {
    let lower = header.to_ascii_lowercase();
    let start = lower.find("realm=")? + "realm=".len();
    let rest = &header[start..];
    if let Some(quoted) = rest.strip_prefix('"') {
        quoted.split('"').next().map(str::to_string)
    } else {
        rest.split([',', ' ']).next().map(str::to_string)
    }
}

/// Credentials supplied in answer to a challenge.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Basic { username: String, password: String },
    Bearer(String),
    /// Used verbatim as the header value.
    Raw(String),
}

impl Credentials {
    pub fn header_value(&self) -> String {
        match self {
            Credentials::Basic { username, password } => {
                format!("Basic {}", STANDARD.encode(format!("{username}:{password}")))
            }
            Credentials::Bearer(token) => format!("Bearer {token}"),
            Credentials::Raw(value) => value.clone(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Credentials::Bearer(_) => f.write_str("Bearer(<redacted>)"),
            Credentials::Raw(_) => f.write_str("Raw(<redacted>)"),
        }
    }
}

/// Supplied by the application to answer challenges. Returning `None` gives up.
#[async_trait]
pub trait ChallengeResolver: Send + Sync {
    /// `previous_failures` counts earlier rounds for this fetch that did not satisfy the server.
    async fn resolve_challenge(
        &self,
        request: &Request,
        challenge: &Challenge,
        previous_failures: u32,
    ) -> Option<Credentials>;
}

/// Resolver that always answers with the same credentials.
#[derive(Debug, Clone)]
pub struct StaticCredentials(pub Credentials);

#[async_trait]
impl ChallengeResolver for StaticCredentials {
    async fn resolve_challenge(
        &self,
        _request: &Request,
        _challenge: &Challenge,
        _previous_failures: u32,
    ) -> Option<Credentials> {
        Some(self.0.clone())
    }
}

/// Credentials currently attached to a fetch's outgoing requests.
#[derive(Debug, Clone, Default)]
pub(crate) struct AppliedCredentials {
    server: Option<Credentials>,
    proxy: Option<Credentials>,
}

impl AppliedCredentials {
    pub(crate) fn set(&mut self, challenge: &Challenge, credentials: Credentials) {
        if challenge.proxy {
            self.proxy = Some(credentials);
        } else {
            self.server = Some(credentials);
        }
    }

    /// Forget server credentials, e.g. after a redirect to another host.
    pub(crate) fn clear_server(&mut self) {
        self.server = None;
    }

    pub(crate) fn apply(&self, headers: &mut Headers) {
        if let Some(c) = &self.server {
            headers.insert("Authorization", c.header_value());
        }
        if let Some(c) = &self.proxy {
            headers.insert("Proxy-Authorization", c.header_value());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_www_authenticate() {
        let headers: Headers = [("WWW-Authenticate", r#"Basic realm="files", charset="UTF-8""#)]
            .into_iter()
            .collect();
        let ch = Challenge::from_response(401, &headers).unwrap();
        assert!(!ch.proxy);
        assert_eq!(ch.scheme, "Basic");
        assert_eq!(ch.realm.as_deref(), Some("files"));
        assert_eq!(ch.answer_header(), "Authorization");
    }

    #[test]
    fn parses_proxy_challenge_without_realm() {
        let headers: Headers = [("Proxy-Authenticate", "Bearer")].into_iter().collect();
        let ch = Challenge::from_response(407, &headers).unwrap();
        assert!(ch.proxy);
        assert_eq!(ch.scheme, "Bearer");
        assert_eq!(ch.realm, None);
        assert_eq!(ch.answer_header(), "Proxy-Authorization");
    }

    #[test]
    fn non_challenge_status() {
        assert!(Challenge::from_response(403, &Headers::new()).is_none());
    }

    #[test]
    fn basic_credentials_encode() {
        let c = Credentials::Basic {
            username: "Aladdin".into(),
            password: "open sesame".into(),
        };
        assert_eq!(c.header_value(), "Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ==");
        assert!(!format!("{c:?}").contains("sesame"));
    }

    #[test]
    fn applied_credentials_fill_headers() {
        let ch = Challenge::from_response(401, &Headers::new()).unwrap();
        let mut applied = AppliedCredentials::default();
        applied.set(&ch, Credentials::Bearer("t0k".into()));
        let mut headers = Headers::new();
        headers.append("Authorization", "stale");
        applied.apply(&mut headers);
        assert_eq!(headers.get_all("authorization").collect::<Vec<_>>(), vec!["Bearer t0k"]);
        applied.clear_server();
        let mut fresh = Headers::new();
        applied.apply(&mut fresh);
        assert!(fresh.is_empty());
    }
}
