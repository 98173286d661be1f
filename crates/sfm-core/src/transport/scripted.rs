//! Deterministic in-process transport.
//!
//! Replies come from a handler closure that sees every request. Replies can be
//! immediate, fail with a transport error, hang until the session is
//! invalidated, or wait on a [`Gate`] that the driver of the scenario opens.
//! The transport records every request and tracks sessions created and peak
//! concurrent exchanges, per host and in total.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{watch, Semaphore};
use url::Url;

use super::{Exchange, ExchangeEvent, OutgoingRequest, ResponseHead, Session, Transport};
use crate::error::TransportError;
use crate::host::HostKey;
use crate::request::Headers;

/// A request as seen by the scripted transport.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// Position in the transport-wide request log.
    pub seq: usize,
    /// Id of the session the request was opened on.
    pub session: u64,
    pub host: HostKey,
    pub method: String,
    pub url: Url,
    pub headers: Headers,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptedResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl ScriptedResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }
}

/// One-way latch a scripted reply can wait on. Each `open` releases one waiter.
#[derive(Clone)]
pub struct Gate {
    permits: Arc<Semaphore>,
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

impl Gate {
    pub fn new() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(0)),
        }
    }

    pub fn open(&self) {
        self.permits.add_permits(1);
    }

    /// Release every current and future waiter.
    pub fn open_all(&self) {
        self.permits.close();
    }

    async fn pass(&self) {
        if let Ok(permit) = self.permits.acquire().await {
            permit.forget();
        }
    }
}

impl fmt::Debug for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gate")
            .field("permits", &self.permits.available_permits())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Respond(ScriptedResponse),
    Fail(TransportError),
    /// Never answers; fails only when the session is invalidated.
    Hang,
    /// Wait for the gate, then behave like the inner reply.
    Gated(Gate, Box<ScriptedReply>),
}

impl ScriptedReply {
    pub fn status(status: u16) -> Self {
        ScriptedReply::Respond(ScriptedResponse::new(status))
    }

    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        ScriptedReply::Respond(ScriptedResponse::new(200).with_body(body))
    }

    pub fn after(gate: &Gate, reply: ScriptedReply) -> Self {
        ScriptedReply::Gated(gate.clone(), Box::new(reply))
    }
}

impl From<ScriptedResponse> for ScriptedReply {
    fn from(r: ScriptedResponse) -> Self {
        ScriptedReply::Respond(r)
    }
}

type ReplyFn = dyn Fn(&RecordedRequest) -> ScriptedReply + Send + Sync;

#[derive(Default)]
struct Counters {
    in_flight: HashMap<HostKey, usize>,
    peak: HashMap<HostKey, usize>,
    in_flight_total: usize,
    peak_total: usize,
    sessions_created: HashMap<HostKey, usize>,
}

struct Shared {
    reply: Box<ReplyFn>,
    log: Mutex<Vec<RecordedRequest>>,
    counters: Mutex<Counters>,
    sessions: Mutex<Vec<(HostKey, Arc<SessionState>)>>,
    session_failures: Mutex<VecDeque<TransportError>>,
    next_session: AtomicU64,
}

impl Shared {
    fn counters(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct SessionState {
    valid: watch::Sender<bool>,
}

impl SessionState {
    fn is_valid(&self) -> bool {
        *self.valid.borrow()
    }

    fn invalidate(&self) {
        self.valid.send_replace(false);
    }
}

/// Scripted in-process transport. Cloning shares the same log and counters.
#[derive(Clone)]
pub struct ScriptedTransport {
    shared: Arc<Shared>,
}

impl ScriptedTransport {
    pub fn new<F>(reply: F) -> Self
    where
        F: Fn(&RecordedRequest) -> ScriptedReply + Send + Sync + 'static,
    {
        Self {
            shared: Arc::new(Shared {
                reply: Box::new(reply),
                log: Mutex::new(Vec::new()),
                counters: Mutex::new(Counters::default()),
                sessions: Mutex::new(Vec::new()),
                session_failures: Mutex::new(VecDeque::new()),
                next_session: AtomicU64::new(1),
            }),
        }
    }

    /// Every request opened so far, in order.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.shared
            .log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn request_count(&self) -> usize {
        self.shared
            .log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn sessions_created(&self, host: &HostKey) -> usize {
        self.shared
            .counters()
            .sessions_created
            .get(host)
            .copied()
            .unwrap_or(0)
    }

    pub fn in_flight(&self, host: &HostKey) -> usize {
        self.shared.counters().in_flight.get(host).copied().unwrap_or(0)
    }

    pub fn in_flight_total(&self) -> usize {
        self.shared.counters().in_flight_total
    }

    pub fn peak_in_flight(&self, host: &HostKey) -> usize {
        self.shared.counters().peak.get(host).copied().unwrap_or(0)
    }

    pub fn peak_in_flight_total(&self) -> usize {
        self.shared.counters().peak_total
    }

    /// Make the next session creation, for any host, fail with `err`.
    /// Repeated calls queue further failures.
    pub fn fail_next_session(&self, err: TransportError) {
        self.shared
            .session_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(err);
    }

    /// Simulate a connectivity change: every live session for `host` becomes invalid
    /// and its pending exchanges fail with `SessionInvalidated`.
    pub fn invalidate_sessions(&self, host: &HostKey) {
        let sessions = self
            .shared
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for (h, state) in sessions.iter() {
            if h == host {
                state.invalidate();
            }
        }
    }
}

impl Transport for ScriptedTransport {
    fn create_session(&self, host: &HostKey) -> Result<Arc<dyn Session>, TransportError> {
        let failure = self
            .shared
            .session_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        if let Some(err) = failure {
            return Err(err);
        }
        let id = self.shared.next_session.fetch_add(1, Ordering::Relaxed);
        let (valid, _) = watch::channel(true);
        let state = Arc::new(SessionState { valid });
        self.shared
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((host.clone(), Arc::clone(&state)));
        *self
            .shared
            .counters()
            .sessions_created
            .entry(host.clone())
            .or_insert(0) += 1;
        Ok(Arc::new(ScriptedSession {
            id,
            host: host.clone(),
            state,
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct ScriptedSession {
    id: u64,
    host: HostKey,
    state: Arc<SessionState>,
    shared: Arc<Shared>,
}

impl Session for ScriptedSession {
    fn open(&self, request: OutgoingRequest) -> Result<Box<dyn Exchange>, TransportError> {
        if !self.state.is_valid() {
            return Err(TransportError::SessionInvalidated);
        }
        let OutgoingRequest {
            method,
            url,
            headers,
            body,
            ..
        } = request;
        let body = body
            .read_all()
            .map_err(|e| TransportError::Body(e.to_string()))?;
        let sent = body.len() as u64;

        let recorded = {
            let mut log = self.shared.log.lock().unwrap_or_else(PoisonError::into_inner);
            let recorded = RecordedRequest {
                seq: log.len(),
                session: self.id,
                host: self.host.clone(),
                method,
                url,
                headers,
                body,
            };
            log.push(recorded.clone());
            recorded
        };
        let reply = (self.shared.reply)(&recorded);

        {
            let mut c = self.shared.counters();
            let n = c.in_flight.entry(self.host.clone()).or_insert(0);
            *n += 1;
            let n = *n;
            let peak = c.peak.entry(self.host.clone()).or_insert(0);
            *peak = (*peak).max(n);
            c.in_flight_total += 1;
            c.peak_total = c.peak_total.max(c.in_flight_total);
        }

        Ok(Box::new(ScriptedExchange {
            phase: Phase::Send { sent },
            reply: Some(reply),
            pending: VecDeque::new(),
            session: Arc::clone(&self.state),
            _guard: InFlight {
                shared: Arc::clone(&self.shared),
                host: self.host.clone(),
            },
        }))
    }

    fn is_valid(&self) -> bool {
        self.state.is_valid()
    }

    fn invalidate(&self) {
        self.state.invalidate();
    }
}

/// Decrements the in-flight counters when an exchange ends.
struct InFlight {
    shared: Arc<Shared>,
    host: HostKey,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut c = self.shared.counters();
        if let Some(n) = c.in_flight.get_mut(&self.host) {
            *n = n.saturating_sub(1);
        }
        c.in_flight_total = c.in_flight_total.saturating_sub(1);
    }
}

enum Phase {
    Send { sent: u64 },
    Reply,
    Stream,
    Done,
}

struct ScriptedExchange {
    phase: Phase,
    reply: Option<ScriptedReply>,
    pending: VecDeque<ExchangeEvent>,
    session: Arc<SessionState>,
    _guard: InFlight,
}

impl ScriptedExchange {
    async fn invalidated(&self) {
        let mut rx = self.session.valid.subscribe();
        let _ = rx.wait_for(|valid| !*valid).await;
    }

    async fn resolve(&self, mut reply: ScriptedReply) -> Result<ScriptedResponse, TransportError> {
        loop {
            reply = match reply {
                ScriptedReply::Respond(response) => return Ok(response),
                ScriptedReply::Fail(e) => return Err(e),
                ScriptedReply::Hang => {
                    self.invalidated().await;
                    return Err(TransportError::SessionInvalidated);
                }
                ScriptedReply::Gated(gate, inner) => {
                    tokio::select! {
                        _ = gate.pass() => *inner,
                        _ = self.invalidated() => return Err(TransportError::SessionInvalidated),
                    }
                }
            };
            if !self.session.is_valid() {
                return Err(TransportError::SessionInvalidated);
            }
        }
    }
}

#[async_trait]
impl Exchange for ScriptedExchange {
    async fn next_event(&mut self) -> Result<Option<ExchangeEvent>, TransportError> {
        loop {
            match self.phase {
                Phase::Send { sent } => {
                    self.phase = Phase::Reply;
                    if sent > 0 {
                        return Ok(Some(ExchangeEvent::Sent {
                            sent,
                            total: Some(sent),
                        }));
                    }
                }
                Phase::Reply => {
                    // Cloned so that a dropped `next_event` future can be polled again.
                    let Some(reply) = self.reply.clone() else {
                        self.phase = Phase::Done;
                        continue;
                    };
                    let resolved = self.resolve(reply).await;
                    self.reply = None;
                    match resolved {
                        Ok(response) => {
                            self.pending.push_back(ExchangeEvent::Head(ResponseHead {
                                status: response.status,
                                headers: response.headers,
                            }));
                            if !response.body.is_empty() {
                                self.pending.push_back(ExchangeEvent::Chunk(response.body));
                            }
                            self.phase = Phase::Stream;
                        }
                        Err(e) => {
                            self.phase = Phase::Done;
                            return Err(e);
                        }
                    }
                }
                Phase::Stream => match self.pending.pop_front() {
                    Some(event) => return Ok(Some(event)),
                    None => self.phase = Phase::Done,
                },
                Phase::Done => return Ok(None),
            }
        }
    }

    fn cancel(&mut self) {
        self.phase = Phase::Done;
        self.reply = None;
        self.pending.clear();
    }
}
