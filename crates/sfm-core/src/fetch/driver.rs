//! The task that carries one fetch from admission to its single completion.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::oneshot;

use super::attempt::{Attempt, RawResponse};
use super::challenge::{AppliedCredentials, Challenge, MAX_CHALLENGE_ROUNDS};
use super::redirect::{RedirectTracker, Target};
use super::{FetchEvent, FetchOptions, FetchResponse, FetchResult, FetchShared, FetchState, RetrySetting};
use crate::error::{FetchError, TransportError};
use crate::host::HostKey;
use crate::request::Request;
use crate::retry::{BackoffPolicy, ErrorKind, RetryDecision};
use crate::service::{ServiceInner, Slot};
use crate::transport::{OutgoingBody, OutgoingRequest};

pub(crate) struct FetchTask {
    pub(crate) service: Arc<ServiceInner>,
    pub(crate) shared: Arc<FetchShared>,
    pub(crate) request: Arc<Request>,
    pub(crate) options: FetchOptions,
    pub(crate) on_complete: Option<Box<dyn FnOnce(&FetchResult) + Send>>,
    pub(crate) tx: oneshot::Sender<FetchResult>,
}

impl FetchTask {
    pub(crate) async fn run(self) {
        let FetchTask {
            service,
            shared,
            request,
            options,
            on_complete,
            tx,
        } = self;
        let driver = Driver {
            service,
            shared,
            request,
            options,
        };
        let result = driver.drive().await;
        let id = driver.shared.id;

        let cancelled = matches!(&result, Err(e) if e.kind() == ErrorKind::Cancelled);
        driver.shared.set_state(if cancelled {
            FetchState::Cancelled
        } else {
            FetchState::Completed
        });
        driver.service.finish(id);

        match &result {
            Ok(resp) => tracing::debug!(fetch = %id, status = resp.status, attempts = resp.attempts, "fetch complete"),
            Err(e) if cancelled => tracing::debug!(fetch = %id, error = %e, "fetch cancelled"),
            Err(e) => tracing::warn!(fetch = %id, error = %e, "fetch failed"),
        }

        if let Some(on_complete) = on_complete {
            on_complete(&result);
        }
        let _ = tx.send(result);
    }
}

/// The parts of a fetch the driving loop borrows across awaits.
struct Driver {
    service: Arc<ServiceInner>,
    shared: Arc<FetchShared>,
    request: Arc<Request>,
    options: FetchOptions,
}

impl Driver {
    async fn drive(&self) -> FetchResult {
        let config = &self.service.config;
        let options = &self.options;
        let timeout = options
            .timeout
            .or(self.request.timeout())
            .unwrap_or(config.request_timeout);
        let policy = match options.retry {
            RetrySetting::ServiceDefault => Some(config.retry),
            RetrySetting::Disabled => None,
            RetrySetting::Policy(p) => Some(p),
        };
        let mut rng = match options.jitter_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let attempt = Attempt {
            shared: &self.shared,
            options,
            logger: config.logger.as_deref(),
            timeout,
        };

        let has_body = !self.request.body().is_empty();
        let mut target = Target::initial(&self.request);
        let mut redirects = RedirectTracker::new(
            options.max_redirects.unwrap_or(config.max_redirects),
            &target.url,
        );
        let mut credentials = AppliedCredentials::default();
        let mut challenge_rounds = 0u32;
        let mut admissions = 0u32;
        let mut failures = 0u32;

        loop {
            if self.shared.cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            config.security.check(&target.url)?;
            let host = HostKey::from_url(&target.url)?;

            let slot = match self.service.acquire(&self.shared, &host, options).await {
                Ok(slot) => slot,
                Err(err) if err.kind() == ErrorKind::Cancelled => return Err(err),
                Err(err) => {
                    // No session could be opened for the host; nothing was sent.
                    failures += 1;
                    self.back_off(err, failures, policy.as_ref(), &mut rng).await?;
                    continue;
                }
            };
            if self.shared.cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            admissions += 1;
            self.shared.set_state(FetchState::Admitted);
            options.emit(FetchEvent::Admitted {
                attempt: admissions,
            });

            let outcome = self
                .exchange(&attempt, &slot, &target, &mut credentials, &mut challenge_rounds)
                .await;

            let err = match outcome {
                Ok(raw) => {
                    let next = if options.follow_redirects {
                        redirects.step(
                            &target,
                            has_body,
                            raw.status,
                            &raw.headers,
                            options.redirect_hook.as_ref(),
                        )?
                    } else {
                        None
                    };
                    if let Some(next) = next {
                        drop(slot);
                        tracing::debug!(fetch = %self.shared.id, status = raw.status, to = %next.url, "redirect");
                        options.emit(FetchEvent::Redirected {
                            status: raw.status,
                            location: next.url.to_string(),
                        });
                        if HostKey::from_url(&next.url).ok().as_ref() != Some(&host) {
                            credentials.clear_server();
                        }
                        target = next;
                        continue;
                    }
                    if options.accepts(raw.status) {
                        return Ok(FetchResponse {
                            status: raw.status,
                            headers: raw.headers,
                            body: raw.body,
                            url: target.url,
                            attempts: admissions,
                            destination: options.destination.clone(),
                        });
                    }
                    FetchError::Status {
                        status: raw.status,
                        headers: raw.headers,
                        body: raw.body,
                    }
                }
                Err(err) => {
                    let session_lost =
                        matches!(err, FetchError::Transport(TransportError::SessionInvalidated));
                    if session_lost || !slot.session().is_valid() {
                        self.service.invalidate_session(&host, slot.generation());
                    }
                    err
                }
            };
            // The slot is never held across a backoff delay.
            drop(slot);

            if err.kind() == ErrorKind::Cancelled {
                return Err(err);
            }
            failures += 1;
            self.back_off(err, failures, policy.as_ref(), &mut rng).await?;
        }
    }

    /// Wait out the delay before the next attempt, or return the terminal error.
    async fn back_off(
        &self,
        err: FetchError,
        failures: u32,
        policy: Option<&BackoffPolicy>,
        rng: &mut StdRng,
    ) -> Result<(), FetchError> {
        let kind = err.kind();
        let Some(delay) = self.retry_delay(policy, failures, kind, &err, rng) else {
            return Err(match policy {
                Some(p) if kind.is_retryable() && failures > p.max_retries => {
                    FetchError::RetriesExhausted {
                        attempts: failures,
                        last: Box::new(err),
                    }
                }
                _ => err,
            });
        };

        self.shared.set_retries(failures);
        self.shared.set_state(FetchState::Retrying);
        self.options.emit(FetchEvent::RetryScheduled {
            failure: failures,
            delay,
        });
        tracing::warn!(
            fetch = %self.shared.id,
            failure = failures,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "retrying fetch"
        );
        tokio::select! {
            biased;
            _ = self.shared.cancel.cancelled() => Err(FetchError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Run the exchange on `slot`, answering challenges without giving the slot up.
    async fn exchange(
        &self,
        attempt: &Attempt<'_>,
        slot: &Slot,
        target: &Target,
        credentials: &mut AppliedCredentials,
        challenge_rounds: &mut u32,
    ) -> Result<RawResponse, FetchError> {
        let mut refreshed = false;
        loop {
            let outgoing = self.outgoing(target, credentials, attempt.timeout).await?;
            let raw = attempt.run(slot.session().as_ref(), outgoing).await?;
            let Some(challenge) = Challenge::from_response(raw.status, &raw.headers) else {
                return Ok(raw);
            };
            self.options.emit(FetchEvent::ChallengeReceived {
                status: challenge.status,
                scheme: challenge.scheme.clone(),
            });
            if let (false, false, Some(authorizer)) =
                (challenge.proxy, refreshed, &self.options.authorizer)
            {
                let primed = tokio::select! {
                    biased;
                    _ = self.shared.cancel.cancelled() => return Err(FetchError::Cancelled),
                    primed = authorizer.refresh() => primed,
                };
                if primed {
                    tracing::debug!(fetch = %self.shared.id, "authorizer refreshed after 401");
                    refreshed = true;
                    continue;
                }
            }
            let Some(resolver) = &self.options.challenge_resolver else {
                if self.options.accepts(raw.status) {
                    return Ok(raw);
                }
                return Err(FetchError::ChallengeUnresolved { status: raw.status });
            };
            if *challenge_rounds >= MAX_CHALLENGE_ROUNDS {
                return Err(FetchError::ChallengeUnresolved { status: raw.status });
            }

            tracing::debug!(fetch = %self.shared.id, status = raw.status, scheme = %challenge.scheme, "resolving challenge");
            let resolved = tokio::select! {
                biased;
                _ = self.shared.cancel.cancelled() => return Err(FetchError::Cancelled),
                c = resolver.resolve_challenge(&self.request, &challenge, *challenge_rounds) => c,
            };
            *challenge_rounds += 1;
            match resolved {
                Some(c) => credentials.set(&challenge, c),
                None => return Err(FetchError::ChallengeUnresolved { status: raw.status }),
            }
        }
    }

    /// Build one attempt's request. The authorizer signs it first; challenge
    /// credentials applied after take precedence.
    async fn outgoing(
        &self,
        target: &Target,
        credentials: &AppliedCredentials,
        timeout: std::time::Duration,
    ) -> Result<OutgoingRequest, FetchError> {
        let mut headers = self.request.headers().clone();
        if target.strip_auth {
            headers.remove("Authorization");
        }
        if let Some(authorizer) = &self.options.authorizer {
            tokio::select! {
                biased;
                _ = self.shared.cancel.cancelled() => return Err(FetchError::Cancelled),
                signed = authorizer.authorize(&self.request, &target.url, &mut headers) => signed?,
            }
        }
        credentials.apply(&mut headers);
        let body = if target.send_body {
            self.request.body().open()?
        } else {
            headers.remove("Content-Type");
            headers.remove("Content-Length");
            OutgoingBody::Empty
        };
        Ok(OutgoingRequest {
            method: target.method.clone(),
            url: target.url.clone(),
            headers,
            body,
            timeout: Some(timeout),
        })
    }

    /// Delay before the next attempt, or `None` to give up.
    fn retry_delay(
        &self,
        policy: Option<&BackoffPolicy>,
        failure: u32,
        kind: ErrorKind,
        err: &FetchError,
        rng: &mut StdRng,
    ) -> Option<std::time::Duration> {
        let policy = policy?;
        if failure > policy.max_retries {
            return None;
        }
        let suggested = policy.decide(failure, kind, rng);
        let Some(hook) = &self.options.should_retry else {
            return match suggested {
                RetryDecision::RetryAfter(d) => Some(d),
                RetryDecision::NoRetry => None,
            };
        };
        let retry = hook(matches!(suggested, RetryDecision::RetryAfter(_)), err);
        match (retry, suggested) {
            (false, _) => None,
            (true, RetryDecision::RetryAfter(d)) => Some(d),
            (true, RetryDecision::NoRetry) => Some(policy.backoff_delay(failure, rng)),
        }
    }
}
