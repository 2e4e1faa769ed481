//! # Request Dispatcher
//!
//! Issues one logical request: admission, pacing, the network call and the
//! retry loop around them.
//!
//! ## Module Structure
//!
//! ```text
//!     dispatcher/
//!     ├── mod.rs          (You are here - RequestSpec, FetchResult, retry loop)
//!     ├── backoff.rs      (Exponential backoff with jitter)
//!     └── transport.rs    (HTTP boundary and scripted transport)
//! ```
//!
//! ## Attempt Loop
//!
//! ```text
//!     for each attempt (max_retries + 1 slots):
//!          │
//!          ▼
//!     wait_for_admission ──Reject──► Failure(RateLimitExceeded)
//!          │ Admit
//!          ▼
//!     pacer.pace ──► transport.send
//!          │
//!          ├── 2xx ───────────────► sync quota window, Success
//!          ├── 429 + future reset ► rewrite window; first signal refunds the slot
//!          ├── 429 / 5xx / io ────► backoff(attempt), retry
//!          └── other 4xx ─────────► Failure(ClientError)
//!
//!     slots used up ──► Failure(RetriesExhausted)
//! ```
//!
//! `attempts` in a [`FetchResult::Failure`] counts network calls actually
//! issued, including ones whose slot was refunded by a server throttle.

mod backoff;
mod transport;

pub use backoff::{backoff_delay, JITTER_FRACTION, MAX_BACKOFF};
pub use transport::{
    HttpTransport, RateLimitHeaders, ScriptedTransport, Transport, TransportResponse,
};

use crate::cancel::CancelToken;
use crate::error::{Cancelled, ErrorKind};
use crate::rate_limiter::{AdaptivePacer, AdmissionDecision, PacingConfig, Priority, RateLimiter};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default retry budget for a [`RequestSpec`].
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default first backoff step for a [`RequestSpec`].
pub const DEFAULT_BASE_BACKOFF: Duration = Duration::from_secs(1);

/// Shortest gap between a throttled call and its retry, however close the
/// server's reset is.
const MIN_THROTTLE_PAUSE: Duration = Duration::from_millis(250);

/// One logical request. Immutable once handed to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSpec {
    /// Endpoint the quota is tracked against.
    pub endpoint_id: String,
    /// Query parameters, in order.
    pub params: Vec<(String, String)>,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// First backoff step; doubles per attempt.
    pub base_backoff: Duration,
    /// Scales the pacing delay.
    pub priority: Priority,
}

impl RequestSpec {
    /// Request with no parameters and default retry settings.
    pub fn new(endpoint_id: impl Into<String>) -> Self {
        Self {
            endpoint_id: endpoint_id.into(),
            params: Vec::new(),
            max_retries: DEFAULT_MAX_RETRIES,
            base_backoff: DEFAULT_BASE_BACKOFF,
            priority: Priority::Normal,
        }
    }

    /// Appends a query parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    /// Sets the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the first backoff step.
    pub fn with_base_backoff(mut self, base_backoff: Duration) -> Self {
        self.base_backoff = base_backoff;
        self
    }

    /// Sets the pacing priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Value of the first parameter named `key`.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Outcome of [`Dispatcher::execute`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchResult {
    /// The server answered 2xx.
    Success {
        /// Response body.
        payload: Vec<u8>,
        /// Time spent in the successful network call.
        latency: Duration,
    },
    /// The request was given up.
    Failure {
        /// Why.
        kind: ErrorKind,
        /// Network calls issued.
        attempts: u32,
        /// Last HTTP status received, if any.
        status: Option<u16>,
    },
}

impl FetchResult {
    fn failure(kind: ErrorKind, attempts: u32, status: Option<u16>) -> Self {
        Self::Failure {
            kind,
            attempts,
            status,
        }
    }

    /// Whether the request succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Error kind of a failure.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { kind, .. } => Some(*kind),
        }
    }
}

/// What to do after one network call.
enum Step {
    Done(FetchResult),
    /// Retry after backing off.
    Backoff(Option<u16>),
    /// Retry once the server's reset (still in the future) has passed;
    /// admission waits for it.
    Throttled { reset_at_ms: u64 },
}

/// Runs requests through the shared limiter, a pacer and a transport.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use tweetpace::{
///     CancelToken, Dispatcher, FetchResult, LimiterConfig, QuotaConfig, RateLimiter,
///     RequestSpec, ScriptedTransport, SystemClock, TransportResponse,
/// };
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let limiter = Arc::new(RateLimiter::new(
///     LimiterConfig::new(QuotaConfig::per_minute(10)),
///     Arc::new(SystemClock),
/// ));
/// let transport = Arc::new(ScriptedTransport::new());
/// transport.push_response(TransportResponse::new(200, "{}"));
///
/// let dispatcher = Dispatcher::new(limiter, transport);
/// let result = dispatcher.execute(&RequestSpec::new("search"), &CancelToken::new()).await;
/// assert!(result.is_success());
/// # }
/// ```
pub struct Dispatcher {
    limiter: Arc<RateLimiter>,
    pacer: Arc<AdaptivePacer>,
    transport: Arc<dyn Transport>,
    admission_timeout: Duration,
    jitter: bool,
}

impl Dispatcher {
    /// Dispatcher with pacing disabled and the limiter's admission timeout.
    pub fn new(limiter: Arc<RateLimiter>, transport: Arc<dyn Transport>) -> Self {
        let admission_timeout = limiter.admission_timeout();
        Self {
            limiter,
            pacer: Arc::new(AdaptivePacer::new(PacingConfig::disabled())),
            transport,
            admission_timeout,
            jitter: true,
        }
    }

    /// Replaces the pacer.
    pub fn with_pacer(mut self, pacer: Arc<AdaptivePacer>) -> Self {
        self.pacer = pacer;
        self
    }

    /// Longest a single admission may wait before the request is rejected.
    pub fn with_admission_timeout(mut self, timeout: Duration) -> Self {
        self.admission_timeout = timeout;
        self
    }

    /// Enables or disables backoff jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Shared limiter.
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Pacer used by this dispatcher.
    pub fn pacer(&self) -> &Arc<AdaptivePacer> {
        &self.pacer
    }

    /// Executes `spec` until success, a non-retryable failure, exhaustion or
    /// cancellation.
    pub async fn execute(&self, spec: &RequestSpec, cancel: &CancelToken) -> FetchResult {
        let endpoint = spec.endpoint_id.as_str();
        let slots = spec.max_retries.saturating_add(1);
        // Bounds refunds so repeated throttles still terminate.
        let max_refunds = slots;

        let mut attempts = 0u32;
        let mut used_slots = 0u32;
        let mut refunds = 0u32;
        let mut last_status = None;
        let mut last_cause = None;

        while used_slots < slots {
            match self
                .limiter
                .wait_for_admission(endpoint, self.admission_timeout, cancel)
                .await
            {
                Err(Cancelled) => return FetchResult::failure(ErrorKind::Cancelled, attempts, last_status),
                Ok(AdmissionDecision::Reject(reason)) => {
                    warn!(
                        "Admission rejected for {} ({}): {}",
                        endpoint,
                        self.reject_cause(endpoint),
                        reason
                    );
                    return FetchResult::failure(ErrorKind::RateLimitExceeded, attempts, last_status);
                }
                Ok(_) => {}
            }

            if self.pacer.pace(spec.priority, cancel).await.is_err() {
                return FetchResult::failure(ErrorKind::Cancelled, attempts, last_status);
            }

            attempts += 1;
            used_slots += 1;
            debug!("{} attempt {} ({} of {} slots)", endpoint, attempts, used_slots, slots);

            let started = Instant::now();
            let sent = tokio::select! {
                sent = self.transport.send(endpoint, &spec.params) => sent,
                _ = cancel.cancelled() => {
                    return FetchResult::failure(ErrorKind::Cancelled, attempts, last_status);
                }
            };
            let latency = started.elapsed();

            let step = match sent {
                Ok(response) => {
                    last_status = Some(response.status);
                    self.classify(endpoint, response, latency, attempts)
                }
                Err(err) => {
                    self.pacer.record(false, latency, None);
                    warn!("{} attempt {} failed: {}", endpoint, attempts, err);
                    last_cause = Some(err.kind());
                    Step::Backoff(None)
                }
            };

            match step {
                Step::Done(result) => return result,
                Step::Throttled { reset_at_ms } => {
                    last_cause = Some(ErrorKind::RateLimitExceeded);
                    let quota = self.limiter.quota();
                    let first = quota.apply_server_reset(endpoint, reset_at_ms);
                    if first && refunds < max_refunds {
                        refunds += 1;
                        used_slots -= 1;
                        info!("First throttle signal for {}; attempt not counted", endpoint);
                    }

                    let until_reset = Duration::from_millis(reset_at_ms.saturating_sub(quota.now_ms()));
                    let pause = MIN_THROTTLE_PAUSE.saturating_sub(until_reset);
                    if used_slots < slots && !pause.is_zero() {
                        tokio::select! {
                            _ = tokio::time::sleep(pause) => {}
                            _ = cancel.cancelled() => {
                                return FetchResult::failure(ErrorKind::Cancelled, attempts, last_status);
                            }
                        }
                    }
                }
                Step::Backoff(status) => {
                    if status.is_some() {
                        last_cause = Some(if status == Some(429) {
                            ErrorKind::RateLimitExceeded
                        } else {
                            ErrorKind::TransportError
                        });
                    }
                    if used_slots >= slots {
                        break;
                    }
                    let delay = backoff_delay(spec.base_backoff, used_slots, self.jitter);
                    info!(
                        "Retrying {} in {:?} (status {:?}, attempt {}/{})",
                        endpoint, delay, status, used_slots, slots
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            return FetchResult::failure(ErrorKind::Cancelled, attempts, last_status);
                        }
                    }
                }
            }
        }

        warn!(
            "{} gave up after {} attempts (last cause: {})",
            endpoint,
            attempts,
            last_cause.map_or("none", |kind| kind.as_str())
        );
        FetchResult::failure(ErrorKind::RetriesExhausted, attempts, last_status)
    }

    fn classify(
        &self,
        endpoint: &str,
        response: TransportResponse,
        latency: Duration,
        attempts: u32,
    ) -> Step {
        let status = response.status;
        let success = (200..300).contains(&status);
        self.pacer.record(success, latency, Some(status));

        if success {
            if let Some(remaining) = response.rate_limit.remaining {
                self.limiter
                    .quota()
                    .sync_server_window(endpoint, remaining, response.rate_limit.reset_at_ms);
            }
            debug!("{} answered {} in {:?}", endpoint, status, latency);
            return Step::Done(FetchResult::Success {
                payload: response.body,
                latency,
            });
        }

        if status == 429 {
            let now_ms = self.limiter.quota().now_ms();
            return match response.rate_limit.reset_instant(now_ms) {
                Some(reset_at_ms) if reset_at_ms > now_ms => Step::Throttled { reset_at_ms },
                Some(reset_at_ms) => {
                    // Skewed server clock; the reset tells us nothing.
                    debug!(
                        "{} sent a reset {}ms in the past; backing off instead",
                        endpoint,
                        now_ms - reset_at_ms
                    );
                    Step::Backoff(Some(status))
                }
                None => Step::Backoff(Some(status)),
            };
        }

        if status >= 500 {
            return Step::Backoff(Some(status));
        }

        warn!("{} answered {}; not retrying", endpoint, status);
        Step::Done(FetchResult::failure(ErrorKind::ClientError, attempts, Some(status)))
    }

    /// Whether a rejection stems from our own window or the server's throttle.
    fn reject_cause(&self, endpoint: &str) -> ErrorKind {
        match self.limiter.quota().window_snapshot(endpoint) {
            Some(window) if window.server_signalled() => ErrorKind::RateLimitExceeded,
            _ => ErrorKind::QuotaExceeded,
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("limiter", &self.limiter)
            .field("transport", &self.transport)
            .field("admission_timeout", &self.admission_timeout)
            .field("jitter", &self.jitter)
            .finish()
    }
}
