//! sfm: a managed HTTP fetch layer.
//!
//! [`FetchService`] admits fetches under global and per-host ceilings and
//! shares one transport session per host. Each fetch retries transient
//! failures under a [`BackoffPolicy`], answers authentication challenges and
//! follows redirects. [`FetchService::begin_upload`] drives resumable chunked
//! uploads on top of the same machinery.

pub mod config;
pub mod error;
pub mod fetch;
pub mod host;
pub mod logging;
pub mod request;
pub mod retry;
pub mod service;
pub mod transport;
pub mod upload;

pub use error::{FetchError, TransportError};
pub use fetch::{
    Authorizer, CancelToken, Challenge, ChallengeResolver, Credentials, FetchEvent, FetchHandle, FetchId,
    FetchOptions, FetchResponse, FetchResult, FetchState, RetrySetting,
};
pub use host::HostKey;
pub use request::{Body, BodyStreamProvider, Headers, Request};
pub use retry::{BackoffPolicy, ErrorKind, RetryDecision};
pub use service::{FetchService, SecurityPolicy, ServiceConfig, ServiceStats};
pub use upload::{UploadBody, UploadHandle, UploadLocation, UploadOptions, UploadRequest};
