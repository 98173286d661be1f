use std::sync::Arc;
use std::time::Duration;

/// Progress notifications delivered to a fetch observer, in the order they occur.
/// Completion is never an event; it is always delivered last, through the handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchEvent {
    /// Waiting for a concurrency slot.
    Queued,
    /// Slot granted; `attempt` counts admissions including redirects and retries.
    Admitted { attempt: u32 },
    SendProgress { sent: u64, total: Option<u64> },
    ResponseHead { status: u16 },
    ReceiveProgress { received: u64, expected: Option<u64> },
    ChallengeReceived { status: u16, scheme: String },
    Redirected { status: u16, location: String },
    RetryScheduled { failure: u32, delay: Duration },
}

pub type FetchObserver = Arc<dyn Fn(&FetchEvent) + Send + Sync>;
