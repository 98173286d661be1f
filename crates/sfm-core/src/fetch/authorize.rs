//! Request signing applied before every attempt.

use async_trait::async_trait;
use url::Url;

use crate::error::FetchError;
use crate::request::{Headers, Request};

/// Signs outgoing requests, e.g. by attaching a fresh OAuth bearer token.
///
/// Called before each attempt of a fetch, including re-sends after a
/// challenge and hops after a redirect. `url` is where this attempt goes,
/// which differs from `request.url()` after a redirect. An error counts as
/// a failed attempt; `FetchError::Authorization` is permanent.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(
        &self,
        request: &Request,
        url: &Url,
        headers: &mut Headers,
    ) -> Result<(), FetchError>;

    /// Called on a 401 for a request this authorizer signed. Returning true
    /// means new credentials are ready; the request is signed and sent once
    /// more before challenge resolution is tried.
    async fn refresh(&self) -> bool {
        false
    }
}

/// Authorizer that sets a fixed `Authorization` value.
#[derive(Clone)]
pub struct StaticAuthorization(pub String);

impl std::fmt::Debug for StaticAuthorization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StaticAuthorization(<redacted>)")
    }
}

#[async_trait]
impl Authorizer for StaticAuthorization {
    async fn authorize(
        &self,
        _request: &Request,
        _url: &Url,
        headers: &mut Headers,
    ) -> Result<(), FetchError> {
        headers.insert("Authorization", self.0.clone());
        Ok(())
    }
}
