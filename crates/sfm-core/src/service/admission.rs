//! Admission bookkeeping: running counters, the wait queue and per-host sessions.
//!
//! Everything here runs inside the service's critical section and never awaits.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::FetchError;
use crate::fetch::{CancelToken, FetchId};
use crate::host::HostKey;
use crate::transport::{Session, Transport};

/// A queued fetch's way of being told it was admitted.
pub(crate) trait Waiter {
    /// True when nobody is listening any more; such entries are skipped.
    fn is_abandoned(&self) -> bool;
}

impl<T> Waiter for oneshot::Sender<T> {
    fn is_abandoned(&self) -> bool {
        self.is_closed()
    }
}

/// Counters already incremented and a session reference already taken.
/// Must be handed back through `release`.
pub(crate) struct SlotTicket {
    pub host: HostKey,
    pub session: Arc<dyn Session>,
    pub generation: u64,
}

struct Queued<W> {
    id: FetchId,
    host: HostKey,
    waiter: W,
}

struct SessionEntry {
    session: Arc<dyn Session>,
    generation: u64,
    refs: usize,
    idle_since: Option<Instant>,
}

/// Point-in-time view of the service's admission state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceStats {
    pub running_total: usize,
    pub running_by_host: BTreeMap<HostKey, usize>,
    pub queued_total: usize,
    pub queued_by_host: BTreeMap<HostKey, usize>,
    /// Live sessions, idle ones included.
    pub sessions: usize,
    pub max_concurrent_global: usize,
    pub max_concurrent_per_host: usize,
    pub stopped: bool,
}

impl ServiceStats {
    pub fn running(&self, host: &HostKey) -> usize {
        self.running_by_host.get(host).copied().unwrap_or(0)
    }

    pub fn queued(&self, host: &HostKey) -> usize {
        self.queued_by_host.get(host).copied().unwrap_or(0)
    }
}

/// What `stop` hands back for the caller to notify outside the lock.
pub(crate) struct Stopped<W> {
    pub waiters: Vec<W>,
    pub active: Vec<CancelToken>,
    pub sessions: Vec<Arc<dyn Session>>,
}

pub(crate) struct Admission<W> {
    max_global: usize,
    max_per_host: usize,
    idle_timeout: Duration,
    running: HashMap<HostKey, usize>,
    running_total: usize,
    /// Ordered by (priority, arrival); lower admits first.
    queue: BTreeMap<(i32, u64), Queued<W>>,
    queued_ids: HashMap<FetchId, (i32, u64)>,
    next_seq: u64,
    sessions: HashMap<HostKey, SessionEntry>,
    next_generation: u64,
    active: HashMap<FetchId, CancelToken>,
    stopped: bool,
}

impl<W: Waiter> Admission<W> {
    pub(crate) fn new(max_global: usize, max_per_host: usize, idle_timeout: Duration) -> Self {
        Self {
            max_global: max_global.max(1),
            max_per_host: max_per_host.max(1),
            idle_timeout,
            running: HashMap::new(),
            running_total: 0,
            queue: BTreeMap::new(),
            queued_ids: HashMap::new(),
            next_seq: 0,
            sessions: HashMap::new(),
            next_generation: 0,
            active: HashMap::new(),
            stopped: false,
        }
    }

    pub(crate) fn set_max_global(&mut self, n: usize) {
        self.max_global = n.max(1);
    }

    pub(crate) fn set_max_per_host(&mut self, n: usize) {
        self.max_per_host = n.max(1);
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Track a live fetch so `stop` can cancel it.
    pub(crate) fn register(&mut self, id: FetchId, cancel: CancelToken) {
        self.active.insert(id, cancel);
    }

    pub(crate) fn unregister(&mut self, id: FetchId) {
        self.active.remove(&id);
    }

    fn has_capacity(&self, host: &HostKey) -> bool {
        self.running_total < self.max_global
            && self.running.get(host).copied().unwrap_or(0) < self.max_per_host
    }

    /// Admit immediately if both ceilings allow, else `Ok(None)`; the caller then enqueues.
    pub(crate) fn try_admit(
        &mut self,
        host: &HostKey,
        transport: &dyn Transport,
        now: Instant,
    ) -> Result<Option<SlotTicket>, FetchError> {
        if self.stopped {
            return Err(FetchError::ServiceStopped);
        }
        self.sweep_idle(now);
        if !self.has_capacity(host) {
            return Ok(None);
        }
        self.admit(host, transport).map(Some)
    }

    pub(crate) fn enqueue(&mut self, id: FetchId, host: HostKey, priority: i32, waiter: W) {
        let key = (priority, self.next_seq);
        self.next_seq += 1;
        self.queued_ids.insert(id, key);
        self.queue.insert(key, Queued { id, host, waiter });
    }

    /// Remove a queued fetch. False if it is no longer queued (already admitted or drained).
    pub(crate) fn withdraw(&mut self, id: FetchId) -> bool {
        match self.queued_ids.remove(&id) {
            Some(key) => self.queue.remove(&key).is_some(),
            None => false,
        }
    }

    fn admit(&mut self, host: &HostKey, transport: &dyn Transport) -> Result<SlotTicket, FetchError> {
        let (session, generation) = match self.sessions.get_mut(host) {
            Some(entry) if entry.session.is_valid() => {
                entry.refs += 1;
                entry.idle_since = None;
                (Arc::clone(&entry.session), entry.generation)
            }
            _ => {
                if let Some(stale) = self.sessions.remove(host) {
                    stale.session.invalidate();
                }
                let session = transport.create_session(host)?;
                self.next_generation += 1;
                let generation = self.next_generation;
                tracing::debug!(host = %host, generation, "session created");
                self.sessions.insert(
                    host.clone(),
                    SessionEntry {
                        session: Arc::clone(&session),
                        generation,
                        refs: 1,
                        idle_since: None,
                    },
                );
                (session, generation)
            }
        };
        *self.running.entry(host.clone()).or_insert(0) += 1;
        self.running_total += 1;
        Ok(SlotTicket {
            host: host.clone(),
            session,
            generation,
        })
    }

    /// Give a slot back. Session refs are only touched when the generation still matches.
    pub(crate) fn release(&mut self, host: &HostKey, generation: u64, now: Instant) {
        if let Some(n) = self.running.get_mut(host) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                self.running.remove(host);
            }
        }
        self.running_total = self.running_total.saturating_sub(1);

        let teardown = match self.sessions.get_mut(host) {
            Some(entry) if entry.generation == generation => {
                entry.refs = entry.refs.saturating_sub(1);
                if entry.refs > 0 {
                    false
                } else if self.idle_timeout.is_zero() || !entry.session.is_valid() {
                    true
                } else {
                    entry.idle_since = Some(now);
                    false
                }
            }
            _ => false,
        };
        if teardown {
            if let Some(entry) = self.sessions.remove(host) {
                tracing::debug!(host = %host, generation, "session released");
                entry.session.invalidate();
            }
        }
    }

    /// Admit queued fetches in queue order while ceilings allow.
    pub(crate) fn drain(
        &mut self,
        transport: &dyn Transport,
        now: Instant,
    ) -> Vec<(W, Result<SlotTicket, FetchError>)> {
        let mut admitted = Vec::new();
        if self.stopped || self.queue.is_empty() {
            return admitted;
        }
        self.sweep_idle(now);
        let keys: Vec<(i32, u64)> = self.queue.keys().copied().collect();
        for key in keys {
            if self.running_total >= self.max_global {
                break;
            }
            let eligible = match self.queue.get(&key) {
                Some(q) => self.has_capacity(&q.host),
                None => false,
            };
            if !eligible {
                continue;
            }
            let Some(q) = self.queue.remove(&key) else {
                continue;
            };
            self.queued_ids.remove(&q.id);
            if q.waiter.is_abandoned() {
                continue;
            }
            tracing::debug!(fetch = %q.id, host = %q.host, "admitted from queue");
            let ticket = self.admit(&q.host, transport);
            admitted.push((q.waiter, ticket));
        }
        admitted
    }

    /// Drop the session for `host` if it is still the given generation.
    pub(crate) fn invalidate_session(
        &mut self,
        host: &HostKey,
        generation: u64,
    ) -> Option<Arc<dyn Session>> {
        match self.sessions.get(host) {
            Some(entry) if entry.generation == generation => {
                self.sessions.remove(host).map(|e| e.session)
            }
            _ => None,
        }
    }

    fn sweep_idle(&mut self, now: Instant) {
        let timeout = self.idle_timeout;
        let expired: Vec<HostKey> = self
            .sessions
            .iter()
            .filter(|(_, e)| {
                e.refs == 0
                    && e.idle_since
                        .map(|since| now.saturating_duration_since(since) >= timeout)
                        .unwrap_or(false)
            })
            .map(|(h, _)| h.clone())
            .collect();
        for host in expired {
            if let Some(entry) = self.sessions.remove(&host) {
                tracing::debug!(host = %host, "idle session torn down");
                entry.session.invalidate();
            }
        }
    }

    /// Refuse further admissions and hand back everything that must be notified.
    pub(crate) fn stop(&mut self) -> Stopped<W> {
        self.stopped = true;
        self.queued_ids.clear();
        let waiters = std::mem::take(&mut self.queue)
            .into_values()
            .map(|q| q.waiter)
            .collect();
        let active = self.active.values().cloned().collect();
        let sessions = self.sessions.drain().map(|(_, e)| e.session).collect();
        Stopped {
            waiters,
            active,
            sessions,
        }
    }

    pub(crate) fn stats(&self) -> ServiceStats {
        let mut queued_by_host = BTreeMap::new();
        for q in self.queue.values() {
            *queued_by_host.entry(q.host.clone()).or_insert(0) += 1;
        }
        ServiceStats {
            running_total: self.running_total,
            running_by_host: self
                .running
                .iter()
                .map(|(h, n)| (h.clone(), *n))
                .collect(),
            queued_total: self.queue.len(),
            queued_by_host,
            sessions: self.sessions.len(),
            max_concurrent_global: self.max_global,
            max_concurrent_per_host: self.max_per_host,
            stopped: self.stopped,
        }
    }
}
