use std::time::Duration;

use rand::Rng;

/// Failure classes the backoff policy distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connection reset, timeout, 408 or 5xx.
    TransientNetwork,
    /// Server asked us to slow down (429, or 503 carrying a hint).
    RateLimited { retry_after: Option<Duration> },
    /// The shared transport session went away; retried on a fresh one.
    SessionInvalidated,
    /// Malformed request, 4xx, redirect failure, unanswered challenge.
    Permanent,
    /// Stopped by the caller or the service. Never retried.
    Cancelled,
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::TransientNetwork
                | ErrorKind::RateLimited { .. }
                | ErrorKind::SessionInvalidated
        )
    }
}

/// Decision returned by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Do not retry this error.
    NoRetry,
    /// Retry after the given delay.
    RetryAfter(Duration),
}

/// Exponential backoff with jitter and caps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Growth factor per further failure (values below 1 are treated as 1).
    pub multiplier: f64,
    /// Upper bound on any single delay, server hints included.
    pub max_delay: Duration,
    /// Each delay is scaled by `1 + U[0, jitter]`.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: 1.0,
        }
    }
}

impl BackoffPolicy {
    /// Defaults for chunked uploads: same curve, longer cap.
    pub fn for_uploads() -> Self {
        Self {
            max_delay: Duration::from_secs(600),
            ..Self::default()
        }
    }

    /// Decide whether failure number `failure` (1-based) of kind `kind` is retried.
    ///
    /// A fetch therefore makes at most `max_retries + 1` attempts.
    pub fn decide<R: Rng + ?Sized>(&self, failure: u32, kind: ErrorKind, rng: &mut R) -> RetryDecision {
        if failure == 0 || failure > self.max_retries {
            return RetryDecision::NoRetry;
        }

        match kind {
            ErrorKind::Permanent | ErrorKind::Cancelled => RetryDecision::NoRetry,
            ErrorKind::RateLimited {
                retry_after: Some(hint),
            } => RetryDecision::RetryAfter(hint.min(self.max_delay)),
            ErrorKind::RateLimited { retry_after: None }
            | ErrorKind::TransientNetwork
            | ErrorKind::SessionInvalidated => {
                RetryDecision::RetryAfter(self.backoff_delay(failure, rng))
            }
        }
    }

    /// Jittered exponential delay for failure number `failure`, ignoring classification.
    pub fn backoff_delay<R: Rng + ?Sized>(&self, failure: u32, rng: &mut R) -> Duration {
        let exp = failure.saturating_sub(1).min(63) as i32;
        let raw = self.base_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exp);
        let factor = if self.jitter.is_finite() && self.jitter > 0.0 {
            1.0 + rng.gen_range(0.0..=self.jitter)
        } else {
            1.0
        };
        let cap = self.max_delay.as_secs_f64();
        let secs = raw * factor;
        if secs.is_finite() && secs < cap {
            Duration::from_secs_f64(secs.max(0.0))
        } else {
            self.max_delay
        }
    }
}
