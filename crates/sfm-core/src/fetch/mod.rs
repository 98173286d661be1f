//! A single managed request/response exchange, including its retries.
//!
//! A fetch runs as its own tokio task. It asks the service for a slot,
//! performs the exchange, answers challenges while holding the slot, follows
//! redirects by re-entering admission, and on failure consults the backoff
//! policy with the slot released. Completion is delivered exactly once.

pub(crate) mod attempt;
pub mod authorize;
pub mod cancel;
pub mod challenge;
pub(crate) mod driver;
pub mod events;
pub mod log;
pub mod redirect;

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use url::Url;

use crate::error::FetchError;
use crate::request::Headers;
use crate::retry::BackoffPolicy;

pub use authorize::{Authorizer, StaticAuthorization};
pub use cancel::CancelToken;
pub use challenge::{Challenge, ChallengeResolver, Credentials, StaticCredentials};
pub use events::{FetchEvent, FetchObserver};
pub use log::{ExchangeRecord, FetchLogger, TracingLogger};
pub use redirect::{RedirectHook, RedirectProposal};

pub type FetchResult = Result<FetchResponse, FetchError>;

/// Opaque fetch identity, unique within a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FetchId(pub(crate) u64);

impl fmt::Display for FetchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fetch#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    Created,
    Admitted,
    Sending,
    AwaitingResponse,
    Retrying,
    Completed,
    Cancelled,
}

impl FetchState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => FetchState::Created,
            1 => FetchState::Admitted,
            2 => FetchState::Sending,
            3 => FetchState::AwaitingResponse,
            4 => FetchState::Retrying,
            5 => FetchState::Completed,
            _ => FetchState::Cancelled,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            FetchState::Created => 0,
            FetchState::Admitted => 1,
            FetchState::Sending => 2,
            FetchState::AwaitingResponse => 3,
            FetchState::Retrying => 4,
            FetchState::Completed => 5,
            FetchState::Cancelled => 6,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, FetchState::Completed | FetchState::Cancelled)
    }
}

/// Successful outcome of a fetch.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub headers: Headers,
    /// Empty when the body was streamed to `destination`.
    pub body: Vec<u8>,
    /// Final URL after redirects.
    pub url: Url,
    /// Admissions used, counting redirects and retries.
    pub attempts: u32,
    pub destination: Option<PathBuf>,
}

/// Which backoff policy a fetch uses.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum RetrySetting {
    #[default]
    ServiceDefault,
    Disabled,
    Policy(BackoffPolicy),
}

/// `(suggested, error) -> retry?`, consulted on every retryable-or-not failure
/// below the retry ceiling.
pub type ShouldRetry = Arc<dyn Fn(bool, &FetchError) -> bool + Send + Sync>;
pub type AcceptStatus = Arc<dyn Fn(u16) -> bool + Send + Sync>;

/// Per-fetch knobs. Defaults: service retry policy, 2xx accepted, redirects followed.
#[derive(Clone)]
pub struct FetchOptions {
    pub(crate) retry: RetrySetting,
    pub(crate) should_retry: Option<ShouldRetry>,
    pub(crate) accept_status: Option<AcceptStatus>,
    pub(crate) follow_redirects: bool,
    pub(crate) max_redirects: Option<usize>,
    pub(crate) redirect_hook: Option<RedirectHook>,
    pub(crate) challenge_resolver: Option<Arc<dyn ChallengeResolver>>,
    pub(crate) authorizer: Option<Arc<dyn Authorizer>>,
    pub(crate) observer: Option<FetchObserver>,
    pub(crate) destination: Option<PathBuf>,
    pub(crate) priority: i32,
    pub(crate) comment: Option<String>,
    pub(crate) cancel: Option<CancelToken>,
    pub(crate) jitter_seed: Option<u64>,
    pub(crate) timeout: Option<Duration>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            retry: RetrySetting::ServiceDefault,
            should_retry: None,
            accept_status: None,
            follow_redirects: true,
            max_redirects: None,
            redirect_hook: None,
            challenge_resolver: None,
            authorizer: None,
            observer: None,
            destination: None,
            priority: 0,
            comment: None,
            cancel: None,
            jitter_seed: None,
            timeout: None,
        }
    }
}

impl FetchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retry(mut self, setting: RetrySetting) -> Self {
        self.retry = setting;
        self
    }

    pub fn retry_policy(self, policy: BackoffPolicy) -> Self {
        self.retry(RetrySetting::Policy(policy))
    }

    pub fn without_retries(self) -> Self {
        self.retry(RetrySetting::Disabled)
    }

    pub fn should_retry<F>(mut self, f: F) -> Self
    where
        F: Fn(bool, &FetchError) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Some(Arc::new(f));
        self
    }

    /// Statuses for which the fetch completes successfully. Defaults to 2xx.
    pub fn accept_status<F>(mut self, f: F) -> Self
    where
        F: Fn(u16) -> bool + Send + Sync + 'static,
    {
        self.accept_status = Some(Arc::new(f));
        self
    }

    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = follow;
        self
    }

    pub fn max_redirects(mut self, hops: usize) -> Self {
        self.max_redirects = Some(hops);
        self
    }

    pub fn on_redirect<F>(mut self, f: F) -> Self
    where
        F: Fn(&RedirectProposal) -> bool + Send + Sync + 'static,
    {
        self.redirect_hook = Some(Arc::new(f));
        self
    }

    pub fn challenge_resolver(mut self, resolver: Arc<dyn ChallengeResolver>) -> Self {
        self.challenge_resolver = Some(resolver);
        self
    }

    /// Sign every outgoing attempt with `authorizer`.
    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    pub fn observer<F>(mut self, f: F) -> Self
    where
        F: Fn(&FetchEvent) + Send + Sync + 'static,
    {
        self.observer = Some(Arc::new(f));
        self
    }

    /// Stream the response body to `path` instead of memory.
    pub fn destination(mut self, path: impl Into<PathBuf>) -> Self {
        self.destination = Some(path.into());
        self
    }

    /// Lower values are admitted first among queued fetches.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Share an existing cancel token instead of creating a fresh one.
    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Seed for backoff jitter; fixed seeds make delays reproducible.
    pub fn jitter_seed(mut self, seed: u64) -> Self {
        self.jitter_seed = Some(seed);
        self
    }

    /// Per-attempt timeout, overriding the request and service values.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub(crate) fn accepts(&self, status: u16) -> bool {
        match &self.accept_status {
            Some(f) => f(status),
            None => (200..300).contains(&status),
        }
    }

    pub(crate) fn emit(&self, event: FetchEvent) {
        if let Some(observer) = &self.observer {
            observer(&event);
        }
    }
}

impl fmt::Debug for FetchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchOptions")
            .field("retry", &self.retry)
            .field("follow_redirects", &self.follow_redirects)
            .field("max_redirects", &self.max_redirects)
            .field("destination", &self.destination)
            .field("priority", &self.priority)
            .field("comment", &self.comment)
            .field("jitter_seed", &self.jitter_seed)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// State of a fetch visible to its handle.
#[derive(Debug)]
pub(crate) struct FetchShared {
    pub(crate) id: FetchId,
    state: AtomicU8,
    retries: AtomicU32,
    pub(crate) cancel: CancelToken,
}

impl FetchShared {
    pub(crate) fn new(id: FetchId, cancel: CancelToken) -> Self {
        Self {
            id,
            state: AtomicU8::new(FetchState::Created.as_u8()),
            retries: AtomicU32::new(0),
            cancel,
        }
    }

    pub(crate) fn state(&self) -> FetchState {
        FetchState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: FetchState) {
        let prev = self.state.swap(state.as_u8(), Ordering::AcqRel);
        if prev != state.as_u8() {
            tracing::debug!(fetch = %self.id, from = ?FetchState::from_u8(prev), to = ?state, "state");
        }
    }

    pub(crate) fn set_retries(&self, n: u32) {
        self.retries.store(n, Ordering::Release);
    }
}

/// Caller's handle on a running fetch.
#[derive(Debug)]
pub struct FetchHandle {
    pub(crate) shared: Arc<FetchShared>,
    pub(crate) rx: oneshot::Receiver<FetchResult>,
}

impl FetchHandle {
    pub fn id(&self) -> FetchId {
        self.shared.id
    }

    pub fn state(&self) -> FetchState {
        self.shared.state()
    }

    /// Retries performed so far.
    pub fn retry_count(&self) -> u32 {
        self.shared.retries.load(Ordering::Acquire)
    }

    /// Request cancellation; observed at the fetch's next suspension point.
    pub fn cancel(&self) {
        self.shared.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.shared.cancel.clone()
    }

    /// Wait for the terminal result.
    pub async fn wait(self) -> FetchResult {
        self.rx.await.unwrap_or(Err(FetchError::Cancelled))
    }
}
