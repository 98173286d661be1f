//! Fetch service: admission, session reuse and lifecycle for many fetches.
//!
//! Counters, the wait queue and the per-host session map live behind one
//! mutex that is never held across an `.await`. Admission grants for queued
//! fetches are sent after the lock is released; a grant nobody receives is
//! dropped, which releases the slot again.

mod admission;
mod guard;
pub mod security;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::config::SfmConfig;
use crate::error::FetchError;
use crate::fetch::driver::FetchTask;
use crate::fetch::{
    FetchEvent, FetchHandle, FetchId, FetchLogger, FetchOptions, FetchResult, FetchShared,
    TracingLogger,
};
use crate::host::HostKey;
use crate::request::Request;
use crate::retry::BackoffPolicy;
use crate::transport::{CurlTransport, Transport};
use crate::upload::{self, UploadHandle, UploadOptions, UploadRequest};

use admission::{Admission, SlotTicket};
pub(crate) use guard::Slot;

pub use admission::ServiceStats;
pub use security::SecurityPolicy;

/// Runtime configuration of a `FetchService`.
#[derive(Clone)]
pub struct ServiceConfig {
    pub max_concurrent_global: usize,
    pub max_concurrent_per_host: usize,
    /// Per-attempt timeout when neither the request nor the options set one.
    pub request_timeout: Duration,
    pub max_redirects: usize,
    /// How long a session without fetches is kept for reuse.
    pub session_idle_timeout: Duration,
    pub retry: BackoffPolicy,
    /// Policy for upload chunks.
    pub upload_retry: BackoffPolicy,
    pub upload_chunk_size: u64,
    pub security: SecurityPolicy,
    pub logger: Option<Arc<dyn FetchLogger>>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_concurrent_global: 64,
            max_concurrent_per_host: 10,
            request_timeout: Duration::from_secs(60),
            max_redirects: 10,
            session_idle_timeout: Duration::from_secs(60),
            retry: BackoffPolicy::default(),
            upload_retry: BackoffPolicy::for_uploads(),
            upload_chunk_size: 8 * 1024 * 1024,
            security: SecurityPolicy::default(),
            logger: Some(Arc::new(TracingLogger)),
        }
    }
}

impl From<&SfmConfig> for ServiceConfig {
    fn from(cfg: &SfmConfig) -> Self {
        let retry = cfg.retry.clone().unwrap_or_default().to_policy();
        let upload = cfg.upload.clone().unwrap_or_default();
        Self {
            max_concurrent_global: cfg.max_concurrent_global,
            max_concurrent_per_host: cfg.max_concurrent_per_host,
            request_timeout: Duration::from_secs(cfg.request_timeout_secs),
            max_redirects: cfg.max_redirects,
            session_idle_timeout: Duration::from_secs(cfg.session_idle_timeout_secs),
            retry,
            upload_retry: BackoffPolicy {
                max_delay: Duration::from_secs(upload.max_delay_secs),
                ..retry
            },
            upload_chunk_size: upload.chunk_size.max(1),
            security: cfg
                .security
                .as_ref()
                .map(SecurityPolicy::from)
                .unwrap_or_default(),
            logger: Some(Arc::new(TracingLogger)),
        }
    }
}

impl fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("max_concurrent_global", &self.max_concurrent_global)
            .field("max_concurrent_per_host", &self.max_concurrent_per_host)
            .field("request_timeout", &self.request_timeout)
            .field("max_redirects", &self.max_redirects)
            .field("session_idle_timeout", &self.session_idle_timeout)
            .field("retry", &self.retry)
            .field("upload_retry", &self.upload_retry)
            .field("upload_chunk_size", &self.upload_chunk_size)
            .field("security", &self.security)
            .field("logger", &self.logger.is_some())
            .finish()
    }
}

type PendingSlot = oneshot::Sender<Result<Slot, FetchError>>;

pub(crate) struct ServiceInner {
    transport: Arc<dyn Transport>,
    pub(crate) config: ServiceConfig,
    state: Mutex<Admission<PendingSlot>>,
    next_id: AtomicU64,
}

impl ServiceInner {
    fn lock(&self) -> MutexGuard<'_, Admission<PendingSlot>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for a slot on `host`. Emits `Queued` if the fetch has to wait.
    pub(crate) async fn acquire(
        self: &Arc<Self>,
        shared: &FetchShared,
        host: &HostKey,
        options: &FetchOptions,
    ) -> Result<Slot, FetchError> {
        let mut rx = {
            let mut state = self.lock();
            if let Some(ticket) = state.try_admit(host, &*self.transport, Instant::now())? {
                tracing::debug!(fetch = %shared.id, host = %host, "admitted");
                return Ok(Slot::new(Arc::clone(self), ticket));
            }
            let (tx, rx) = oneshot::channel();
            state.enqueue(shared.id, host.clone(), options.priority, tx);
            rx
        };
        tracing::debug!(fetch = %shared.id, host = %host, "queued");
        options.emit(FetchEvent::Queued);

        tokio::select! {
            biased;
            granted = &mut rx => granted.unwrap_or(Err(FetchError::ServiceStopped)),
            _ = shared.cancel.cancelled() => {
                if !self.lock().withdraw(shared.id) {
                    // Already drained: a slot is on its way or was just sent.
                    rx.close();
                    if let Ok(Ok(slot)) = rx.try_recv() {
                        drop(slot);
                    }
                }
                Err(FetchError::Cancelled)
            }
        }
    }

    pub(crate) fn release(self: &Arc<Self>, host: &HostKey, generation: u64) {
        let ready = {
            let mut state = self.lock();
            let now = Instant::now();
            state.release(host, generation, now);
            state.drain(&*self.transport, now)
        };
        self.dispatch(ready);
    }

    fn drain(self: &Arc<Self>) {
        let ready = self.lock().drain(&*self.transport, Instant::now());
        self.dispatch(ready);
    }

    fn dispatch(self: &Arc<Self>, ready: Vec<(PendingSlot, Result<SlotTicket, FetchError>)>) {
        for (tx, ticket) in ready {
            let grant = ticket.map(|t| Slot::new(Arc::clone(self), t));
            // An undeliverable grant is dropped here, which releases its slot.
            let _ = tx.send(grant);
        }
    }

    /// Forget the session if it is still the one the failed exchange used.
    pub(crate) fn invalidate_session(&self, host: &HostKey, generation: u64) {
        let dropped = self.lock().invalidate_session(host, generation);
        if let Some(session) = dropped {
            tracing::warn!(host = %host, generation, "session invalidated");
            session.invalidate();
        }
    }

    pub(crate) fn finish(&self, id: FetchId) {
        self.lock().unregister(id);
    }
}

/// Creates fetches and enforces global and per-host concurrency ceilings.
/// Cloning yields another handle on the same service.
#[derive(Clone)]
pub struct FetchService {
    inner: Arc<ServiceInner>,
}

impl FetchService {
    pub fn new(transport: Arc<dyn Transport>, config: ServiceConfig) -> Self {
        let state = Admission::new(
            config.max_concurrent_global,
            config.max_concurrent_per_host,
            config.session_idle_timeout,
        );
        Self {
            inner: Arc::new(ServiceInner {
                transport,
                config,
                state: Mutex::new(state),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Service over libcurl with default curl options.
    pub fn with_curl(config: ServiceConfig) -> Self {
        Self::new(Arc::new(CurlTransport::default()), config)
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    /// Start a fetch; `on_complete` runs exactly once, after every observer event,
    /// before the handle's `wait` resolves. Must be called inside a tokio runtime.
    pub fn begin_fetch<F>(&self, request: Request, options: FetchOptions, on_complete: F) -> FetchHandle
    where
        F: FnOnce(&FetchResult) + Send + 'static,
    {
        self.spawn(request, options, Some(Box::new(on_complete)))
    }

    /// Start a fetch whose result is only observed through the handle.
    pub fn fetch(&self, request: Request, options: FetchOptions) -> FetchHandle {
        self.spawn(request, options, None)
    }

    fn spawn(
        &self,
        request: Request,
        options: FetchOptions,
        on_complete: Option<Box<dyn FnOnce(&FetchResult) + Send>>,
    ) -> FetchHandle {
        let id = FetchId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let cancel = options.cancel.clone().unwrap_or_default();
        let shared = Arc::new(FetchShared::new(id, cancel.clone()));
        let (tx, rx) = oneshot::channel();
        self.inner.lock().register(id, cancel);
        tracing::debug!(fetch = %id, method = request.method(), url = %request.url(), "fetch created");

        let task = FetchTask {
            service: Arc::clone(&self.inner),
            shared: Arc::clone(&shared),
            request: Arc::new(request),
            options,
            on_complete,
            tx,
        };
        tokio::spawn(task.run());
        FetchHandle { shared, rx }
    }

    pub fn cancel(&self, handle: &FetchHandle) {
        handle.cancel();
    }

    /// Raising the ceiling admits eligible queued fetches at once; lowering it
    /// never pre-empts running ones. Clamped to at least 1.
    pub fn set_max_concurrent_per_host(&self, n: usize) {
        self.inner.lock().set_max_per_host(n);
        self.inner.drain();
    }

    pub fn set_max_concurrent_global(&self, n: usize) {
        self.inner.lock().set_max_global(n);
        self.inner.drain();
    }

    /// Fail queued fetches with `ServiceStopped`, cancel running ones and
    /// release every session. Later fetches fail with `ServiceStopped`.
    pub fn stop(&self) {
        let stopped = self.inner.lock().stop();
        tracing::info!(
            queued = stopped.waiters.len(),
            active = stopped.active.len(),
            sessions = stopped.sessions.len(),
            "stopping fetch service"
        );
        for waiter in stopped.waiters {
            let _ = waiter.send(Err(FetchError::ServiceStopped));
        }
        for token in stopped.active {
            token.cancel();
        }
        for session in stopped.sessions {
            session.invalidate();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.lock().is_stopped()
    }

    pub fn stats(&self) -> ServiceStats {
        self.inner.lock().stats()
    }

    /// Start a resumable upload driven by chunk fetches on this service.
    pub fn begin_upload(&self, request: UploadRequest, options: UploadOptions) -> UploadHandle {
        upload::spawn(self.clone(), request, options)
    }
}

impl fmt::Debug for FetchService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchService")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}
