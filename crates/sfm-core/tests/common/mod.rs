//! Shared helpers for sfm-core integration tests.
#![allow(dead_code)]

pub mod http_server;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use sfm_core::fetch::FetchEvent;
use sfm_core::transport::ScriptedTransport;
use sfm_core::{BackoffPolicy, FetchService, HostKey, SecurityPolicy, ServiceConfig};

/// Config for scripted tests: plain http allowed, no exchange log sink.
pub fn test_config() -> ServiceConfig {
    ServiceConfig {
        security: SecurityPolicy::permissive(),
        logger: None,
        ..ServiceConfig::default()
    }
}

pub fn service(transport: &ScriptedTransport, config: ServiceConfig) -> FetchService {
    FetchService::new(Arc::new(transport.clone()), config)
}

pub fn host(url: &str) -> HostKey {
    HostKey::parse(url).unwrap()
}

/// Policy with a fixed 1s delay and no jitter, so paused-clock tests can reason about time.
pub fn flat_policy(max_retries: u32) -> BackoffPolicy {
    BackoffPolicy {
        max_retries,
        base_delay: Duration::from_secs(1),
        multiplier: 1.0,
        max_delay: Duration::from_secs(60),
        jitter: 0.0,
    }
}

/// Let every spawned task run until it blocks. Under a paused clock this does
/// not advance time past any backoff delay.
pub async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(1)).await;
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

/// Collects observer events in order.
#[derive(Clone)]
pub struct EventLog<T> {
    events: Arc<Mutex<Vec<T>>>,
}

impl<T: Clone + Send + 'static> EventLog<T> {
    pub fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn sink(&self) -> impl Fn(&T) + Send + Sync + 'static {
        let events = Arc::clone(&self.events);
        move |e: &T| events.lock().unwrap().push(e.clone())
    }

    pub fn take(&self) -> Vec<T> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.events.lock().unwrap().clone()
    }
}

pub type FetchEvents = EventLog<FetchEvent>;
