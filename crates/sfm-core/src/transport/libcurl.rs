//! libcurl-backed transport.
//!
//! A session keeps a small pool of `Easy` handles for one host so keep-alive
//! connections are reused across fetches. Each exchange runs on the blocking
//! pool and streams its events back through a bounded channel; cancel and
//! session invalidation abort the transfer from the progress callback.

use std::cell::{Cell, RefCell};
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use ::curl::easy::{Easy, List, ReadError};
use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Exchange, ExchangeEvent, OutgoingRequest, ResponseHead, Session, Transport};
use crate::error::TransportError;
use crate::host::HostKey;
use crate::request::Headers;

type EventTx = mpsc::Sender<Result<ExchangeEvent, TransportError>>;

/// Tuning for curl-backed sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurlOptions {
    pub connect_timeout: Duration,
    /// Idle `Easy` handles kept per session for connection reuse.
    pub max_idle_handles: usize,
    /// Abort when throughput stays below this many bytes/s for `low_speed_time`.
    pub low_speed_limit: u32,
    pub low_speed_time: Duration,
}

impl Default for CurlOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            max_idle_handles: 4,
            low_speed_limit: 1024,
            low_speed_time: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CurlTransport {
    opts: CurlOptions,
}

impl CurlTransport {
    pub fn new(opts: CurlOptions) -> Self {
        Self { opts }
    }
}

impl Transport for CurlTransport {
    fn create_session(&self, host: &HostKey) -> Result<Arc<dyn Session>, TransportError> {
        tracing::debug!(host = %host, "creating curl session");
        Ok(Arc::new(CurlSession {
            inner: Arc::new(SessionInner {
                opts: self.opts,
                idle: Mutex::new(Vec::new()),
                valid: AtomicBool::new(true),
            }),
        }))
    }
}

struct SessionInner {
    opts: CurlOptions,
    idle: Mutex<Vec<Easy>>,
    valid: AtomicBool,
}

impl SessionInner {
    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    fn checkout(&self) -> Easy {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_else(Easy::new)
    }

    fn checkin(&self, mut easy: Easy) {
        if !self.is_valid() {
            return;
        }
        easy.reset();
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < self.opts.max_idle_handles {
            idle.push(easy);
        }
    }
}

pub struct CurlSession {
    inner: Arc<SessionInner>,
}

impl Session for CurlSession {
    fn open(&self, request: OutgoingRequest) -> Result<Box<dyn Exchange>, TransportError> {
        if !self.inner.is_valid() {
            return Err(TransportError::SessionInvalidated);
        }
        let (tx, rx) = mpsc::channel(16);
        let abort = Arc::new(AtomicBool::new(false));
        let session = Arc::clone(&self.inner);
        let abort_cb = Arc::clone(&abort);
        tokio::task::spawn_blocking(move || {
            let mut easy = session.checkout();
            match perform(&mut easy, request, &session, &abort_cb, &tx) {
                Ok(()) => session.checkin(easy),
                Err(e) => {
                    let _ = tx.blocking_send(Err(e));
                }
            }
        });
        Ok(Box::new(CurlExchange { rx, abort }))
    }

    fn is_valid(&self) -> bool {
        self.inner.is_valid()
    }

    fn invalidate(&self) {
        self.inner.valid.store(false, Ordering::Release);
        self.inner
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

struct CurlExchange {
    rx: mpsc::Receiver<Result<ExchangeEvent, TransportError>>,
    abort: Arc<AtomicBool>,
}

#[async_trait]
impl Exchange for CurlExchange {
    async fn next_event(&mut self) -> Result<Option<ExchangeEvent>, TransportError> {
        match self.rx.recv().await {
            Some(Ok(event)) => Ok(Some(event)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    fn cancel(&mut self) {
        self.abort.store(true, Ordering::Release);
    }
}

impl Drop for CurlExchange {
    fn drop(&mut self) {
        self.abort.store(true, Ordering::Release);
    }
}

/// Status line and headers of the response currently being received.
#[derive(Debug, Default)]
struct HeadState {
    status: Option<u16>,
    headers: Headers,
    delivered: bool,
}

impl HeadState {
    fn push_line(&mut self, raw: &[u8]) {
        let line = String::from_utf8_lossy(raw);
        let line = line.trim_end();
        if let Some(status) = parse_status_line(line) {
            // Interim responses (100 Continue) are replaced by the final one.
            self.status = Some(status);
            self.headers = Headers::new();
        } else if let Some((name, value)) = Headers::parse_line(line) {
            self.headers.append(name, value);
        }
    }
}

fn parse_status_line(line: &str) -> Option<u16> {
    if !line.starts_with("HTTP/") {
        return None;
    }
    line.split_whitespace().nth(1)?.parse().ok()
}

/// Deliver the response head once. Returns false if the receiver is gone.
fn flush_head(head: &RefCell<HeadState>, tx: &EventTx) -> bool {
    let mut h = head.borrow_mut();
    if h.delivered {
        return true;
    }
    let Some(status) = h.status else {
        return true;
    };
    h.delivered = true;
    let event = ExchangeEvent::Head(ResponseHead {
        status,
        headers: std::mem::take(&mut h.headers),
    });
    tx.blocking_send(Ok(event)).is_ok()
}

fn setup_err(e: ::curl::Error) -> TransportError {
    TransportError::Other(e.to_string())
}

fn map_curl_error(e: &::curl::Error, abort: &AtomicBool, session: &SessionInner) -> TransportError {
    if !session.is_valid() {
        return TransportError::SessionInvalidated;
    }
    if abort.load(Ordering::Acquire) {
        return TransportError::Cancelled;
    }
    if e.is_operation_timedout() {
        return TransportError::Timeout;
    }
    if e.is_couldnt_connect()
        || e.is_couldnt_resolve_host()
        || e.is_couldnt_resolve_proxy()
        || e.is_recv_error()
        || e.is_send_error()
        || e.is_got_nothing()
        || e.is_partial_file()
    {
        return TransportError::Connection(e.to_string());
    }
    if e.is_url_malformed() || e.is_unsupported_protocol() {
        return TransportError::InvalidRequest(e.to_string());
    }
    TransportError::Other(e.to_string())
}

fn perform(
    easy: &mut Easy,
    request: OutgoingRequest,
    session: &SessionInner,
    abort: &AtomicBool,
    tx: &EventTx,
) -> Result<(), TransportError> {
    let OutgoingRequest {
        method,
        url,
        headers,
        body,
        timeout,
    } = request;

    easy.url(url.as_str())
        .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
    easy.follow_location(false).map_err(setup_err)?;
    easy.connect_timeout(session.opts.connect_timeout)
        .map_err(setup_err)?;
    easy.low_speed_limit(session.opts.low_speed_limit)
        .map_err(setup_err)?;
    easy.low_speed_time(session.opts.low_speed_time)
        .map_err(setup_err)?;
    if let Some(t) = timeout {
        easy.timeout(t).map_err(setup_err)?;
    }
    easy.progress(true).map_err(setup_err)?;

    let sends_body = !body.is_empty() || matches!(method.as_str(), "POST" | "PUT" | "PATCH");
    let (mut reader, body_len) = body.into_reader();

    let mut list = List::new();
    for (name, value) in headers.iter() {
        list.append(&format!("{}: {}", name.trim(), value.trim()))
            .map_err(setup_err)?;
    }
    if sends_body {
        easy.upload(true).map_err(setup_err)?;
        if let Some(len) = body_len {
            easy.in_filesize(len).map_err(setup_err)?;
        }
        list.append("Expect:").map_err(setup_err)?;
        if method != "PUT" {
            easy.custom_request(&method).map_err(setup_err)?;
        }
    } else if method == "HEAD" {
        easy.nobody(true).map_err(setup_err)?;
    } else if method != "GET" {
        easy.custom_request(&method).map_err(setup_err)?;
    }
    easy.http_headers(list).map_err(setup_err)?;

    let head = RefCell::new(HeadState::default());
    let sent = Cell::new(0u64);
    let body_error: RefCell<Option<String>> = RefCell::new(None);
    let halted = || abort.load(Ordering::Acquire) || !session.is_valid();

    let performed = {
        let mut transfer = easy.transfer();
        transfer
            .header_function(|line| {
                head.borrow_mut().push_line(line);
                true
            })
            .map_err(setup_err)?;
        transfer
            .write_function(|data| {
                if halted() || !flush_head(&head, tx) {
                    return Ok(0);
                }
                if tx
                    .blocking_send(Ok(ExchangeEvent::Chunk(data.to_vec())))
                    .is_err()
                {
                    return Ok(0);
                }
                Ok(data.len())
            })
            .map_err(setup_err)?;
        if sends_body {
            transfer
                .read_function(|buf| match reader.read(buf) {
                    Ok(n) => Ok(n),
                    Err(e) => {
                        *body_error.borrow_mut() = Some(e.to_string());
                        Err(ReadError::Abort)
                    }
                })
                .map_err(setup_err)?;
        }
        transfer
            .progress_function(|_dltotal, _dlnow, _ultotal, ulnow| {
                if halted() {
                    return false;
                }
                let now = ulnow as u64;
                if now > sent.get() {
                    sent.set(now);
                    let _ = tx.blocking_send(Ok(ExchangeEvent::Sent {
                        sent: now,
                        total: body_len,
                    }));
                }
                true
            })
            .map_err(setup_err)?;
        transfer.perform()
    };

    if let Err(e) = performed {
        if let Some(msg) = body_error.into_inner() {
            return Err(TransportError::Body(msg));
        }
        return Err(map_curl_error(&e, abort, session));
    }

    if head.borrow().status.is_none() {
        let code = easy.response_code().map_err(setup_err)?;
        head.borrow_mut().status = Some(code as u16);
    }
    if !flush_head(&head, tx) {
        return Err(TransportError::Cancelled);
    }
    Ok(())
}
