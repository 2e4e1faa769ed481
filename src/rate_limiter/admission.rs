//! # Rate Limiter (admission)
//!
//! Combines the hard quota and the smoothing bucket into a single verdict per
//! request attempt.
//!
//! ```text
//!     admit(endpoint)
//!          │
//!          ▼
//!     bucket has a token? ──no──► wait_b = bucket refill time
//!          │ yes                  wait_q = quota peek
//!          ▼                      stricter(decide(wait_b), decide(wait_q))
//!     quota.reserve(1)
//!          │
//!     granted? ──yes──► Admit(now)
//!          │ no
//!          ▼
//!     refund token, decide(retry_after)
//!
//!     decide(wait): wait ≤ timeout ? Delay(now + wait) : Reject
//! ```
//!
//! A `Delay` never holds a reservation. The caller sleeps until the given
//! instant and asks again, so a delayed request cannot strand quota if it is
//! cancelled while waiting.

use super::config::{LimiterConfig, SmoothingConfig};
use super::core::TokenBucket;
use super::quota::{QuotaTracker, Reservation};
use super::utils::{millis_until, SharedClock};
use crate::cancel::CancelToken;
use crate::error::Cancelled;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Why admission was refused outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The quota window resets later than the admission timeout allows.
    QuotaWindowExceedsTimeout {
        /// Time until the window resets.
        retry_after: Duration,
    },
    /// The smoothing bucket refills later than the admission timeout allows.
    SmoothingExceedsTimeout {
        /// Time until a token is available.
        retry_after: Duration,
    },
    /// The request costs more than the whole window allows.
    CostExceedsLimit,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QuotaWindowExceedsTimeout { retry_after } => {
                write!(f, "quota window exceeds timeout (resets in {:?})", retry_after)
            }
            Self::SmoothingExceedsTimeout { retry_after } => {
                write!(f, "smoothing delay exceeds timeout (token in {:?})", retry_after)
            }
            Self::CostExceedsLimit => f.write_str("request cost exceeds the window limit"),
        }
    }
}

/// Verdict for one request attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    /// Go now; quota has been charged. Carries the admission instant.
    Admit(u64),
    /// Ask again at `until_ms` (epoch milliseconds). Nothing was charged.
    Delay {
        /// Earliest instant worth retrying.
        until_ms: u64,
    },
    /// Give up on this request.
    Reject(RejectReason),
}

impl AdmissionDecision {
    /// The more restrictive of two decisions.
    ///
    /// ```text
    ///     Reject  >  Delay(later)  >  Delay(earlier)  >  Admit
    /// ```
    pub fn stricter(self, other: Self) -> Self {
        use AdmissionDecision::*;
        match (self, other) {
            (Reject(reason), _) | (_, Reject(reason)) => Reject(reason),
            (Delay { until_ms: a }, Delay { until_ms: b }) => Delay { until_ms: a.max(b) },
            (delay @ Delay { .. }, Admit(_)) | (Admit(_), delay @ Delay { .. }) => delay,
            (Admit(a), Admit(b)) => Admit(a.max(b)),
        }
    }

    /// Whether the request may go now.
    pub fn is_admit(&self) -> bool {
        matches!(self, Self::Admit(_))
    }
}

/// Admission front-end shared by every dispatcher and fetch chain.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use std::time::Duration;
/// use tweetpace::{AdmissionDecision, LimiterConfig, ManualClock, QuotaConfig, RateLimiter};
///
/// let clock = Arc::new(ManualClock::new(0));
/// let limiter = RateLimiter::new(LimiterConfig::new(QuotaConfig::per_minute(1)), clock.clone());
///
/// assert!(limiter.admit("search").is_admit());
/// assert_eq!(limiter.admit("search"), AdmissionDecision::Delay { until_ms: 60_000 });
///
/// clock.advance(Duration::from_secs(60));
/// assert!(limiter.admit("search").is_admit());
/// ```
pub struct RateLimiter {
    quota: Arc<QuotaTracker>,
    buckets: DashMap<String, Arc<TokenBucket>, ahash::RandomState>,
    smoothing: Option<SmoothingConfig>,
    admission_timeout: Duration,
    clock: SharedClock,
}

impl RateLimiter {
    /// Builds a limiter with its own quota tracker.
    pub fn new(config: LimiterConfig, clock: SharedClock) -> Self {
        let quota = Arc::new(QuotaTracker::new(config.quota.clone(), clock.clone()));
        Self::with_tracker(config, quota, clock)
    }

    /// Builds a limiter around an existing (possibly persisted) tracker.
    pub fn with_tracker(config: LimiterConfig, quota: Arc<QuotaTracker>, clock: SharedClock) -> Self {
        Self {
            quota,
            buckets: DashMap::with_hasher(ahash::RandomState::new()),
            smoothing: config.smoothing,
            admission_timeout: config.admission_timeout(),
            clock,
        }
    }

    /// The underlying quota tracker.
    pub fn quota(&self) -> &Arc<QuotaTracker> {
        &self.quota
    }

    /// Default timeout used by [`admit`](Self::admit).
    pub fn admission_timeout(&self) -> Duration {
        self.admission_timeout
    }

    /// The clock all admission arithmetic runs on.
    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Smoothing bucket for `endpoint_id`, created on first use.
    pub fn bucket(&self, endpoint_id: &str) -> Option<Arc<TokenBucket>> {
        let smoothing = self.smoothing?;
        if let Some(bucket) = self.buckets.get(endpoint_id) {
            return Some(bucket.clone());
        }
        let bucket = self
            .buckets
            .entry(endpoint_id.to_string())
            .or_insert_with(|| Arc::new(TokenBucket::new(smoothing, self.clock.now_ms())))
            .clone();
        Some(bucket)
    }

    fn decide(&self, wait: Duration, now_ms: u64, timeout: Duration, smoothing: bool) -> AdmissionDecision {
        if wait <= timeout {
            AdmissionDecision::Delay {
                until_ms: now_ms + wait.as_millis() as u64,
            }
        } else if smoothing {
            AdmissionDecision::Reject(RejectReason::SmoothingExceedsTimeout { retry_after: wait })
        } else {
            AdmissionDecision::Reject(RejectReason::QuotaWindowExceedsTimeout { retry_after: wait })
        }
    }

    fn from_quota(&self, reservation: Reservation, now_ms: u64, timeout: Duration) -> AdmissionDecision {
        if reservation.granted {
            return AdmissionDecision::Admit(now_ms);
        }
        match reservation.retry_after {
            Some(wait) => self.decide(wait, now_ms, timeout, false),
            None => AdmissionDecision::Reject(RejectReason::CostExceedsLimit),
        }
    }

    /// Decides with the limiter's default admission timeout.
    pub fn admit(&self, endpoint_id: &str) -> AdmissionDecision {
        self.admit_within(endpoint_id, self.admission_timeout)
    }

    /// Decides for one request, turning waits longer than `timeout` into
    /// rejections. Only an `Admit` charges the quota.
    pub fn admit_within(&self, endpoint_id: &str, timeout: Duration) -> AdmissionDecision {
        let now_ms = self.clock.now_ms();

        let Some(bucket) = self.bucket(endpoint_id) else {
            let reservation = self.quota.reserve(endpoint_id, 1);
            return self.from_quota(reservation, now_ms, timeout);
        };

        if bucket.try_acquire_at(1, now_ms) {
            let reservation = self.quota.reserve(endpoint_id, 1);
            if !reservation.granted {
                bucket.add_tokens(1);
            }
            return self.from_quota(reservation, now_ms, timeout);
        }

        let smoothing_wait = bucket.time_until_available(1, now_ms);
        let smoothing = self.decide(smoothing_wait, now_ms, timeout, true);
        let quota = match self.quota.peek(endpoint_id, 1) {
            peek if peek.granted => AdmissionDecision::Admit(now_ms),
            peek => self.from_quota(peek, now_ms, timeout),
        };
        smoothing.stricter(quota)
    }

    /// Waits, up to `timeout` of real time, until a request to `endpoint_id`
    /// is admitted.
    ///
    /// Returns `Ok(true)` once admitted (quota charged), `Ok(false)` when the
    /// limiter rejects or the timeout runs out, and `Err(Cancelled)` as soon
    /// as `cancel` fires.
    pub async fn await_admission(
        &self,
        endpoint_id: &str,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<bool, Cancelled> {
        match self.wait_for_admission(endpoint_id, timeout, cancel).await? {
            AdmissionDecision::Admit(_) => Ok(true),
            _ => Ok(false),
        }
    }

    /// Like [`await_admission`](Self::await_admission) but returns the final
    /// decision, which is always `Admit` or `Reject`.
    pub async fn wait_for_admission(
        &self,
        endpoint_id: &str,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<AdmissionDecision, Cancelled> {
        let started = tokio::time::Instant::now();
        loop {
            if cancel.is_cancelled() {
                return Err(Cancelled);
            }
            let remaining = timeout.saturating_sub(started.elapsed());

            match self.admit_within(endpoint_id, remaining) {
                AdmissionDecision::Delay { until_ms } => {
                    let wait = millis_until(until_ms, self.clock.now_ms())
                        .max(Duration::from_millis(1))
                        .min(remaining.max(Duration::from_millis(1)));
                    debug!("Admission for {} delayed {:?}", endpoint_id, wait);
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = cancel.cancelled() => return Err(Cancelled),
                    }
                    if started.elapsed() >= timeout {
                        // One last try in case the window rolled right at the deadline.
                        return match self.admit_within(endpoint_id, Duration::ZERO) {
                            admit @ AdmissionDecision::Admit(_) => Ok(admit),
                            AdmissionDecision::Reject(reason) => Ok(AdmissionDecision::Reject(reason)),
                            AdmissionDecision::Delay { until_ms } => {
                                Ok(AdmissionDecision::Reject(RejectReason::QuotaWindowExceedsTimeout {
                                    retry_after: millis_until(until_ms, self.clock.now_ms()),
                                }))
                            }
                        };
                    }
                }
                decision => return Ok(decision),
            }
        }
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("quota", &self.quota)
            .field("smoothing", &self.smoothing)
            .field("admission_timeout", &self.admission_timeout)
            .finish()
    }
}
