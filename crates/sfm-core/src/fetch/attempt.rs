//! One exchange on an admitted slot: send, await the head, collect the body.

use std::path::Path;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;

use super::log::{ExchangeRecord, FetchLogger};
use super::{FetchEvent, FetchOptions, FetchShared, FetchState};
use crate::error::{FetchError, TransportError};
use crate::request::Headers;
use crate::transport::{ExchangeEvent, OutgoingRequest, Session};

const FAR_FUTURE: Duration = Duration::from_secs(365 * 24 * 3600);

/// Response of a completed exchange, before acceptance is decided.
#[derive(Debug)]
pub(crate) struct RawResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Vec<u8>,
}

/// Where body chunks go for this attempt.
enum BodySink {
    Memory(Vec<u8>),
    File(File),
}

impl BodySink {
    /// A destination file is truncated at the start of every attempt.
    async fn open(destination: Option<&Path>) -> Result<Self, FetchError> {
        match destination {
            None => Ok(BodySink::Memory(Vec::new())),
            Some(path) => File::create(path)
                .await
                .map(BodySink::File)
                .map_err(|e| FetchError::Body(format!("create {}: {e}", path.display()))),
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), FetchError> {
        match self {
            BodySink::Memory(buf) => {
                buf.extend_from_slice(data);
                Ok(())
            }
            BodySink::File(f) => f
                .write_all(data)
                .await
                .map_err(|e| FetchError::Body(format!("write destination: {e}"))),
        }
    }

    async fn finish(self) -> Result<Vec<u8>, FetchError> {
        match self {
            BodySink::Memory(buf) => Ok(buf),
            BodySink::File(mut f) => {
                f.flush()
                    .await
                    .map_err(|e| FetchError::Body(format!("flush destination: {e}")))?;
                Ok(Vec::new())
            }
        }
    }
}

pub(crate) struct Attempt<'a> {
    pub shared: &'a FetchShared,
    pub options: &'a FetchOptions,
    pub logger: Option<&'a dyn FetchLogger>,
    pub timeout: Duration,
}

impl Attempt<'_> {
    /// Run one exchange to completion. The timeout covers this attempt only.
    pub(crate) async fn run(
        &self,
        session: &dyn Session,
        request: OutgoingRequest,
    ) -> Result<RawResponse, FetchError> {
        let started = Instant::now();
        let method = request.method.clone();
        let url = request.url.to_string();
        let mut sent = 0u64;
        let mut received = 0u64;
        let mut status = None;

        let result = self
            .exchange(session, request, started, &mut sent, &mut received, &mut status)
            .await;

        if let Some(logger) = self.logger {
            logger.record(&ExchangeRecord {
                fetch: self.shared.id,
                comment: self.options.comment.clone(),
                method,
                url,
                status,
                duration: started.elapsed(),
                bytes_sent: sent,
                bytes_received: received,
                error: result.as_ref().err().map(|e| e.to_string()),
            });
        }
        result
    }

    async fn exchange(
        &self,
        session: &dyn Session,
        request: OutgoingRequest,
        started: Instant,
        sent: &mut u64,
        received: &mut u64,
        status: &mut Option<u16>,
    ) -> Result<RawResponse, FetchError> {
        self.shared.set_state(FetchState::Sending);
        let mut sink = BodySink::open(self.options.destination.as_deref()).await?;
        let mut exchange = session.open(request)?;
        let deadline = started
            .checked_add(self.timeout)
            .unwrap_or_else(|| started + FAR_FUTURE);
        let mut head: Option<(u16, Headers)> = None;
        let mut expected = None;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.shared.cancel.cancelled() => {
                    exchange.cancel();
                    return Err(FetchError::Cancelled);
                }
                next = tokio::time::timeout_at(deadline, exchange.next_event()) => next,
            };
            let event = match next {
                Err(_elapsed) => {
                    exchange.cancel();
                    return Err(TransportError::Timeout.into());
                }
                Ok(event) => event?,
            };
            match event {
                None => break,
                Some(ExchangeEvent::Sent { sent: n, total }) => {
                    *sent = n;
                    self.options.emit(FetchEvent::SendProgress { sent: n, total });
                    if total == Some(n) {
                        self.shared.set_state(FetchState::AwaitingResponse);
                    }
                }
                Some(ExchangeEvent::Head(h)) => {
                    self.shared.set_state(FetchState::AwaitingResponse);
                    *status = Some(h.status);
                    expected = h.headers.content_length();
                    self.options
                        .emit(FetchEvent::ResponseHead { status: h.status });
                    head = Some((h.status, h.headers));
                }
                Some(ExchangeEvent::Chunk(data)) => {
                    if head.is_none() {
                        return Err(TransportError::Other(
                            "response body arrived before headers".into(),
                        )
                        .into());
                    }
                    *received += data.len() as u64;
                    sink.write(&data).await?;
                    self.options.emit(FetchEvent::ReceiveProgress {
                        received: *received,
                        expected,
                    });
                }
            }
        }

        let Some((status, headers)) = head else {
            return Err(TransportError::Connection("exchange ended without a response".into()).into());
        };
        let body = sink.finish().await?;
        Ok(RawResponse {
            status,
            headers,
            body,
        })
    }
}
