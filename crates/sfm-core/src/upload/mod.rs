//! Resumable, chunked uploads on top of the fetch service.
//!
//! An upload negotiates a chunk location, sends the body in chunks, and after
//! a failed chunk asks the server how much it actually holds before sending
//! again. Each step is an ordinary fetch, so uploads share admission and
//! sessions with everything else on the service.

pub mod protocol;
mod run;
mod source;

use std::fmt;
use std::io::Read;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use url::Url;

use crate::error::FetchError;
use crate::fetch::{Authorizer, CancelToken, FetchResult};
use crate::request::Headers;
use crate::retry::BackoffPolicy;
use crate::service::FetchService;

/// Bytes to upload.
pub enum UploadBody {
    Bytes(Arc<[u8]>),
    File(PathBuf),
    /// Unknown length; finalized with a terminal empty chunk.
    Stream(Box<dyn Read + Send>),
}

impl fmt::Debug for UploadBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadBody::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            UploadBody::File(p) => f.debug_tuple("File").field(p).finish(),
            UploadBody::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

impl From<Vec<u8>> for UploadBody {
    fn from(v: Vec<u8>) -> Self {
        UploadBody::Bytes(v.into())
    }
}

impl From<PathBuf> for UploadBody {
    fn from(p: PathBuf) -> Self {
        UploadBody::File(p)
    }
}

/// Where an upload's chunks go. Keep it to resume the upload later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadLocation {
    pub upload_id: String,
    pub url: Url,
}

#[derive(Debug)]
pub struct UploadRequest {
    pub(crate) endpoint: Url,
    pub(crate) body: UploadBody,
    pub(crate) content_type: Option<String>,
    pub(crate) metadata: Option<serde_json::Value>,
    pub(crate) headers: Headers,
    pub(crate) resume: Option<UploadLocation>,
}

impl UploadRequest {
    pub fn new(endpoint: &str, body: impl Into<UploadBody>) -> Result<Self, FetchError> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| FetchError::InvalidRequest(format!("bad upload endpoint {endpoint:?}: {e}")))?;
        Ok(Self {
            endpoint,
            body: body.into(),
            content_type: None,
            metadata: None,
            headers: Headers::new(),
            resume: None,
        })
    }

    /// Declared type of the uploaded content (`X-Upload-Content-Type`).
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// JSON document sent as the negotiation body.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Header sent on every request of the upload.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Continue an upload negotiated earlier; starts with a status query.
    pub fn resume_from(mut self, location: UploadLocation) -> Self {
        self.resume = Some(location);
        self
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UploadPhase {
    #[default]
    Negotiating,
    Uploading,
    Querying,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

/// Snapshot of an upload's progress.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadSessionState {
    pub phase: UploadPhase,
    pub location: Option<UploadLocation>,
    /// `None` for streamed bodies.
    pub total: Option<u64>,
    /// Highest offset handed to the transport so far.
    pub bytes_sent: u64,
    /// Bytes the server has acknowledged.
    pub confirmed_offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadEvent {
    LocationObtained(UploadLocation),
    ChunkStarted { offset: u64, len: u64 },
    ChunkCompleted { confirmed: u64 },
    StatusQueried { offset: u64 },
    RetryScheduled { failure: u32, delay: Duration },
}

pub type UploadObserver = Arc<dyn Fn(&UploadEvent) + Send + Sync>;

#[derive(Clone, Default)]
pub struct UploadOptions {
    pub(crate) chunk_size: Option<u64>,
    pub(crate) retry: Option<BackoffPolicy>,
    pub(crate) observer: Option<UploadObserver>,
    pub(crate) jitter_seed: Option<u64>,
    pub(crate) priority: i32,
    pub(crate) comment: Option<String>,
    pub(crate) cancel: Option<CancelToken>,
    pub(crate) authorizer: Option<Arc<dyn Authorizer>>,
}

impl UploadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes per chunk; at least 1.
    pub fn chunk_size(mut self, bytes: u64) -> Self {
        self.chunk_size = Some(bytes.max(1));
        self
    }

    /// Backoff for failed chunks, overriding the service's upload policy.
    pub fn retry_policy(mut self, policy: BackoffPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn observer<F>(mut self, f: F) -> Self
    where
        F: Fn(&UploadEvent) + Send + Sync + 'static,
    {
        self.observer = Some(Arc::new(f));
        self
    }

    pub fn jitter_seed(mut self, seed: u64) -> Self {
        self.jitter_seed = Some(seed);
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Sign the negotiation, every chunk and every status query.
    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    pub(crate) fn emit(&self, event: UploadEvent) {
        if let Some(observer) = &self.observer {
            observer(&event);
        }
    }
}

impl fmt::Debug for UploadOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadOptions")
            .field("chunk_size", &self.chunk_size)
            .field("retry", &self.retry)
            .field("jitter_seed", &self.jitter_seed)
            .field("priority", &self.priority)
            .field("comment", &self.comment)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub(crate) struct UploadShared {
    state: Mutex<UploadSessionState>,
    pub(crate) cancel: CancelToken,
}

impl UploadShared {
    pub(crate) fn snapshot(&self) -> UploadSessionState {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn update(&self, f: impl FnOnce(&mut UploadSessionState)) {
        f(&mut self.state.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

/// Caller's handle on a running upload.
#[derive(Debug)]
pub struct UploadHandle {
    shared: Arc<UploadShared>,
    rx: oneshot::Receiver<FetchResult>,
}

impl UploadHandle {
    /// Abort the in-flight chunk. No status query follows.
    pub fn cancel(&self) {
        self.shared.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.shared.cancel.clone()
    }

    pub fn state(&self) -> UploadSessionState {
        self.shared.snapshot()
    }

    /// Chunk location once negotiated, for resuming later.
    pub fn location(&self) -> Option<UploadLocation> {
        self.shared.snapshot().location
    }

    /// Final response of the upload: the server's 2xx with the created resource.
    pub async fn wait(self) -> FetchResult {
        self.rx.await.unwrap_or(Err(FetchError::Cancelled))
    }
}

pub(crate) fn spawn(service: FetchService, request: UploadRequest, options: UploadOptions) -> UploadHandle {
    let cancel = options.cancel.clone().unwrap_or_default();
    let shared = Arc::new(UploadShared {
        state: Mutex::new(UploadSessionState {
            location: request.resume.clone(),
            ..UploadSessionState::default()
        }),
        cancel,
    });
    let (tx, rx) = oneshot::channel();
    let task = run::UploadTask::new(service, Arc::clone(&shared), options);
    tokio::spawn(task.run(request, tx));
    UploadHandle { shared, rx }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_endpoint_is_invalid_request() {
        assert!(matches!(
            UploadRequest::new("not a url", Vec::new()),
            Err(FetchError::InvalidRequest(_))
        ));
    }

    #[test]
    fn chunk_size_is_at_least_one() {
        assert_eq!(UploadOptions::new().chunk_size(0).chunk_size, Some(1));
    }
}
