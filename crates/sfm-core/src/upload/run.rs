//! The upload task: negotiate, send chunks, reconcile after failures.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::oneshot;
use url::Url;

use super::protocol::{self, RESUME_INCOMPLETE};
use super::source::ChunkSource;
use super::{UploadEvent, UploadLocation, UploadOptions, UploadPhase, UploadRequest, UploadShared};
use crate::error::FetchError;
use crate::fetch::{FetchOptions, FetchResponse, FetchResult};
use crate::request::{Body, Headers, Request};
use crate::retry::{BackoffPolicy, ErrorKind, RetryDecision};
use crate::service::FetchService;

/// What a status query found out.
enum Probe {
    Complete(FetchResponse),
    Offset(u64),
}

fn chunk_status(status: u16) -> bool {
    status == RESUME_INCOMPLETE || (200..300).contains(&status)
}

fn mismatch(server: u64, sent: u64) -> FetchError {
    FetchError::UploadReconciliation(Box::new(FetchError::UploadOffsetMismatch { server, sent }))
}

pub(crate) struct UploadTask {
    service: FetchService,
    shared: Arc<UploadShared>,
    options: UploadOptions,
    policy: BackoffPolicy,
    chunk_size: u64,
    rng: StdRng,
    headers: Headers,
    total: Option<u64>,
}

impl UploadTask {
    pub(crate) fn new(service: FetchService, shared: Arc<UploadShared>, options: UploadOptions) -> Self {
        let config = service.config();
        let policy = options.retry.unwrap_or(config.upload_retry);
        let chunk_size = options.chunk_size.unwrap_or(config.upload_chunk_size).max(1);
        let rng = match options.jitter_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            service,
            shared,
            options,
            policy,
            chunk_size,
            rng,
            headers: Headers::new(),
            total: None,
        }
    }

    pub(crate) async fn run(mut self, request: UploadRequest, tx: oneshot::Sender<FetchResult>) {
        let endpoint = request.endpoint.clone();
        let result = self.drive(request).await;
        let phase = match &result {
            Ok(_) => UploadPhase::Completed,
            Err(e) if e.kind() == ErrorKind::Cancelled => UploadPhase::Cancelled,
            Err(_) => UploadPhase::Failed,
        };
        self.shared.update(|s| s.phase = phase);
        match &result {
            Ok(resp) => tracing::info!(endpoint = %endpoint, status = resp.status, total = ?self.total, "upload complete"),
            Err(e) => tracing::warn!(endpoint = %endpoint, error = %e, "upload ended"),
        }
        let _ = tx.send(result);
    }

    async fn drive(&mut self, request: UploadRequest) -> FetchResult {
        let UploadRequest {
            endpoint,
            body,
            content_type,
            metadata,
            headers,
            resume,
        } = request;
        self.headers = headers;
        let mut source = ChunkSource::open(body).await?;
        self.total = source.declared_total();
        let total = self.total;
        self.shared.update(|s| s.total = total);

        let (location, mut confirmed) = match resume {
            Some(location) => {
                self.shared.update(|s| s.phase = UploadPhase::Querying);
                match self.query(&location).await {
                    Ok(Probe::Complete(resp)) => return Ok(resp),
                    Ok(Probe::Offset(server)) => {
                        if let Some(t) = total.filter(|t| server > *t) {
                            return Err(mismatch(server, t));
                        }
                        self.options.emit(UploadEvent::StatusQueried { offset: server });
                        (location, server)
                    }
                    Err(e) if e.kind() == ErrorKind::Cancelled => return Err(e),
                    Err(e) => return Err(FetchError::UploadReconciliation(Box::new(e))),
                }
            }
            None => {
                let location = self.negotiate(&endpoint, content_type, metadata).await?;
                self.options
                    .emit(UploadEvent::LocationObtained(location.clone()));
                (location, 0)
            }
        };
        tracing::debug!(upload = %location.upload_id, url = %location.url, offset = confirmed, "upload location");
        {
            let location = location.clone();
            self.shared.update(move |s| {
                s.location = Some(location);
                s.confirmed_offset = confirmed;
                s.bytes_sent = confirmed;
            });
        }

        let mut sent_high = confirmed;
        let mut failures = 0u32;
        loop {
            if self.shared.cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            let data = source.chunk(confirmed, self.chunk_size).await?;
            let len = data.len() as u64;
            let range = if len == 0 {
                protocol::finalize_range(confirmed)
            } else {
                protocol::chunk_range(confirmed, len, total)
            };
            sent_high = sent_high.max(confirmed + len);
            self.shared.update(|s| {
                s.phase = UploadPhase::Uploading;
                s.bytes_sent = sent_high;
            });
            self.options.emit(UploadEvent::ChunkStarted {
                offset: confirmed,
                len,
            });

            let failure = match self.send_chunk(&location.url, range, data).await {
                Ok(resp) if resp.status != RESUME_INCOMPLETE => {
                    self.shared.update(|s| s.confirmed_offset = sent_high);
                    return Ok(resp);
                }
                Ok(resp) => match protocol::parse_confirmed_offset(&resp.headers) {
                    Ok(server) if server > sent_high => return Err(mismatch(server, sent_high)),
                    Ok(server) if server > confirmed => {
                        confirmed = server;
                        failures = 0;
                        source.release_before(confirmed);
                        self.shared.update(|s| s.confirmed_offset = confirmed);
                        self.options.emit(UploadEvent::ChunkCompleted { confirmed });
                        continue;
                    }
                    Ok(server) => FetchError::UploadOffsetMismatch {
                        server,
                        sent: confirmed + len,
                    },
                    Err(e) => e,
                },
                Err(e) => e,
            };

            let kind = failure.kind();
            if matches!(kind, ErrorKind::Cancelled | ErrorKind::Permanent) {
                return Err(failure);
            }
            failures += 1;
            let delay = match self.policy.decide(failures, kind, &mut self.rng) {
                RetryDecision::RetryAfter(d) => d,
                RetryDecision::NoRetry => {
                    return Err(FetchError::RetriesExhausted {
                        attempts: failures,
                        last: Box::new(failure),
                    })
                }
            };
            self.shared.update(|s| s.phase = UploadPhase::Retrying);
            self.options
                .emit(UploadEvent::RetryScheduled { failure: failures, delay });
            tracing::warn!(
                upload = %location.upload_id,
                offset = confirmed,
                failure = failures,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "chunk failed, querying upload status"
            );
            tokio::select! {
                biased;
                _ = self.shared.cancel.cancelled() => return Err(FetchError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }

            self.shared.update(|s| s.phase = UploadPhase::Querying);
            let server = match self.query(&location).await {
                Ok(Probe::Complete(resp)) => {
                    self.shared.update(|s| s.confirmed_offset = sent_high);
                    return Ok(resp);
                }
                Ok(Probe::Offset(server)) => server,
                Err(e) if e.kind() == ErrorKind::Cancelled => return Err(e),
                Err(e) => return Err(FetchError::UploadReconciliation(Box::new(e))),
            };
            if server > sent_high || server < source.lowest_offset() {
                return Err(mismatch(server, sent_high));
            }
            tracing::debug!(upload = %location.upload_id, server, client = confirmed, "upload status");
            self.options.emit(UploadEvent::StatusQueried { offset: server });
            if server > confirmed {
                failures = 0;
            }
            confirmed = server;
            source.release_before(confirmed);
            self.shared.update(|s| s.confirmed_offset = confirmed);
        }
    }

    fn request(&self, method: &str, url: &Url) -> Result<Request, FetchError> {
        let mut request = Request::new(method, url.as_str())?;
        for (name, value) in self.headers.iter() {
            request.headers_mut().append(name, value);
        }
        Ok(request)
    }

    fn fetch_options(&self) -> FetchOptions {
        let mut options = FetchOptions::new()
            .cancel_token(self.shared.cancel.clone())
            .priority(self.options.priority);
        if let Some(comment) = &self.options.comment {
            options = options.comment(comment.clone());
        }
        if let Some(seed) = self.options.jitter_seed {
            options = options.jitter_seed(seed);
        }
        if let Some(authorizer) = &self.options.authorizer {
            options = options.authorizer(Arc::clone(authorizer));
        }
        options
    }

    async fn negotiate(
        &self,
        endpoint: &Url,
        content_type: Option<String>,
        metadata: Option<serde_json::Value>,
    ) -> Result<UploadLocation, FetchError> {
        let mut request = self.request("POST", endpoint)?.with_header(
            protocol::UPLOAD_CONTENT_LENGTH,
            protocol::declared_length(self.total),
        );
        if let Some(content_type) = content_type {
            request = request.with_header(protocol::UPLOAD_CONTENT_TYPE, content_type);
        }
        if let Some(metadata) = metadata {
            let body = serde_json::to_vec(&metadata)
                .map_err(|e| FetchError::Body(format!("encode upload metadata: {e}")))?;
            request = request
                .with_header("Content-Type", "application/json")
                .with_body(body);
        }
        let resp = self
            .service
            .fetch(request, self.fetch_options())
            .wait()
            .await?;
        protocol::location_from(&resp.url, &resp.headers)
    }

    async fn send_chunk(&self, url: &Url, range: String, data: Vec<u8>) -> FetchResult {
        let request = self
            .request("PUT", url)?
            .with_header("Content-Range", range)
            .with_body(Body::from(data));
        let options = self
            .fetch_options()
            .without_retries()
            .follow_redirects(false)
            .accept_status(chunk_status);
        self.service.fetch(request, options).wait().await
    }

    async fn query(&self, location: &UploadLocation) -> Result<Probe, FetchError> {
        let request = self
            .request("PUT", &location.url)?
            .with_header("Content-Range", protocol::query_range(self.total));
        let options = self
            .fetch_options()
            .follow_redirects(false)
            .accept_status(chunk_status);
        let resp = self.service.fetch(request, options).wait().await?;
        if resp.status == RESUME_INCOMPLETE {
            Ok(Probe::Offset(protocol::parse_confirmed_offset(&resp.headers)?))
        } else {
            Ok(Probe::Complete(resp))
        }
    }
}
