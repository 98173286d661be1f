//! Redirect following: hop limit, loop detection and method-change approval.

use std::collections::HashSet;
use std::sync::Arc;

use url::Url;

use crate::error::FetchError;
use crate::host::HostKey;
use crate::request::{Headers, Request};

/// A redirect that would change the request method and drop its body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectProposal {
    pub status: u16,
    pub from: Url,
    pub to: Url,
    pub original_method: String,
    pub new_method: String,
}

/// Caller hook approving a method-changing redirect of a body-bearing request.
pub type RedirectHook = Arc<dyn Fn(&RedirectProposal) -> bool + Send + Sync>;

/// Where the next exchange of a fetch goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Target {
    pub method: String,
    pub url: Url,
    /// False once a redirect has switched the method and dropped the body.
    pub send_body: bool,
    /// Set after a cross-host hop; authorization is not forwarded from then on.
    pub strip_auth: bool,
}

impl Target {
    pub(crate) fn initial(request: &Request) -> Self {
        Self {
            method: request.method().to_string(),
            url: request.url().clone(),
            send_body: true,
            strip_auth: false,
        }
    }
}

pub(crate) fn is_redirect(status: u16) -> bool {
    matches!(status, 301 | 302 | 303 | 307 | 308)
}

pub(crate) struct RedirectTracker {
    limit: usize,
    hops: usize,
    visited: HashSet<Url>,
}

impl RedirectTracker {
    pub(crate) fn new(limit: usize, start: &Url) -> Self {
        let mut visited = HashSet::new();
        visited.insert(start.clone());
        Self {
            limit,
            hops: 0,
            visited,
        }
    }

    /// Next target if the response is a followable redirect, `None` if it is not a redirect.
    pub(crate) fn step(
        &mut self,
        current: &Target,
        has_body: bool,
        status: u16,
        headers: &Headers,
        hook: Option<&RedirectHook>,
    ) -> Result<Option<Target>, FetchError> {
        if !is_redirect(status) {
            return Ok(None);
        }
        let Some(location) = headers.get("Location") else {
            return Ok(None);
        };
        let to = current.url.join(location).map_err(|e| {
            FetchError::InvalidRequest(format!("bad redirect location {location:?}: {e}"))
        })?;

        if self.hops >= self.limit {
            return Err(FetchError::RedirectLimit { limit: self.limit });
        }
        if !self.visited.insert(to.clone()) {
            return Err(FetchError::RedirectLoop {
                url: to.to_string(),
            });
        }
        self.hops += 1;

        let method = current.method.as_str();
        let carries_body = has_body && current.send_body;
        // 301/302 turn POST, and any method still sending a body, into GET.
        let new_method = match status {
            303 if method != "HEAD" => "GET",
            301 | 302 if method == "POST" || carries_body => "GET",
            _ => method,
        };
        if new_method != method && carries_body {
            let proposal = RedirectProposal {
                status,
                from: current.url.clone(),
                to: to.clone(),
                original_method: method.to_string(),
                new_method: new_method.to_string(),
            };
            let approved = hook.map(|h| h(&proposal)).unwrap_or(false);
            if !approved {
                return Err(FetchError::RedirectRefused {
                    status,
                    method: method.to_string(),
                    location: to.to_string(),
                });
            }
        }

        let cross_host = HostKey::from_url(&current.url).ok() != HostKey::from_url(&to).ok();
        Ok(Some(Target {
            method: new_method.to_string(),
            send_body: current.send_body && new_method == method,
            strip_auth: current.strip_auth || cross_host,
            url: to,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(method: &str, url: &str) -> Target {
        Target {
            method: method.into(),
            url: Url::parse(url).unwrap(),
            send_body: true,
            strip_auth: false,
        }
    }

    fn location(url: &str) -> Headers {
        [("Location", url)].into_iter().collect()
    }

    #[test]
    fn follows_relative_location() {
        let cur = target("GET", "https://a.test/x/y");
        let mut t = RedirectTracker::new(5, &cur.url);
        let next = t
            .step(&cur, false, 302, &location("../z"), None)
            .unwrap()
            .unwrap();
        assert_eq!(next.url.as_str(), "https://a.test/z");
        assert_eq!(next.method, "GET");
        assert!(!next.strip_auth);
    }

    #[test]
    fn non_redirect_or_missing_location_is_final() {
        let cur = target("GET", "https://a.test/");
        let mut t = RedirectTracker::new(5, &cur.url);
        assert!(t.step(&cur, false, 200, &Headers::new(), None).unwrap().is_none());
        assert!(t.step(&cur, false, 302, &Headers::new(), None).unwrap().is_none());
    }

    #[test]
    fn hop_limit_is_permanent() {
        let mut cur = target("GET", "https://a.test/0");
        let mut t = RedirectTracker::new(2, &cur.url);
        for i in 1..=2 {
            cur = t
                .step(&cur, false, 301, &location(&format!("/{i}")), None)
                .unwrap()
                .unwrap();
        }
        let err = t.step(&cur, false, 301, &location("/3"), None).unwrap_err();
        assert!(matches!(err, FetchError::RedirectLimit { limit: 2 }));
    }

    #[test]
    fn revisiting_a_url_is_a_loop() {
        let cur = target("GET", "https://a.test/a");
        let mut t = RedirectTracker::new(10, &cur.url);
        let next = t.step(&cur, false, 307, &location("/b"), None).unwrap().unwrap();
        let err = t.step(&next, false, 307, &location("/a"), None).unwrap_err();
        assert!(matches!(err, FetchError::RedirectLoop { .. }));
    }

    #[test]
    fn post_303_needs_approval() {
        let cur = target("POST", "https://a.test/form");
        let mut t = RedirectTracker::new(10, &cur.url);
        let err = t.step(&cur, true, 303, &location("/done"), None).unwrap_err();
        assert!(matches!(err, FetchError::RedirectRefused { status: 303, .. }));

        let mut t = RedirectTracker::new(10, &cur.url);
        let hook: RedirectHook = Arc::new(|p| p.new_method == "GET");
        let next = t
            .step(&cur, true, 303, &location("/done"), Some(&hook))
            .unwrap()
            .unwrap();
        assert_eq!(next.method, "GET");
        assert!(!next.send_body);
    }

    #[test]
    fn bodyless_post_switches_without_approval() {
        let cur = target("POST", "https://a.test/form");
        let mut t = RedirectTracker::new(10, &cur.url);
        let next = t.step(&cur, false, 302, &location("/x"), None).unwrap().unwrap();
        assert_eq!(next.method, "GET");
    }

    #[test]
    fn put_302_with_body_needs_approval() {
        let cur = target("PUT", "https://a.test/doc");
        let mut t = RedirectTracker::new(10, &cur.url);
        let err = t.step(&cur, true, 302, &location("/moved"), None).unwrap_err();
        assert!(matches!(
            err,
            FetchError::RedirectRefused { status: 302, ref method, .. } if method == "PUT"
        ));

        let mut t = RedirectTracker::new(10, &cur.url);
        let hook: RedirectHook = Arc::new(|p| p.original_method == "PUT");
        let next = t
            .step(&cur, true, 301, &location("/moved"), Some(&hook))
            .unwrap()
            .unwrap();
        assert_eq!(next.method, "GET");
        assert!(!next.send_body);
    }

    #[test]
    fn bodyless_put_302_keeps_method() {
        let cur = target("PUT", "https://a.test/doc");
        let mut t = RedirectTracker::new(10, &cur.url);
        let next = t.step(&cur, false, 302, &location("/moved"), None).unwrap().unwrap();
        assert_eq!(next.method, "PUT");
    }

    #[test]
    fn method_preserving_redirect_keeps_body() {
        let cur = target("PUT", "https://a.test/up");
        let mut t = RedirectTracker::new(10, &cur.url);
        let next = t
            .step(&cur, true, 308, &location("https://b.test/up"), None)
            .unwrap()
            .unwrap();
        assert_eq!(next.method, "PUT");
        assert!(next.send_body);
        assert!(next.strip_auth);
    }
}
