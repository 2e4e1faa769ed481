//! # Smoothing Token Bucket
//!
//! The quota tracker answers "how many calls are left in this window"; the
//! token bucket answers "how fast may we spend them". Without it a fresh
//! 450-call window would be drained in the first second.
//!
//! ```text
//!     Bucket with max_burst = 5, refill 1 token / 2000ms:
//!
//!     t=0      ┌─────────────┐
//!              │ ● ● ● ● ●   │ 5/5   five requests go out back-to-back
//!              └─────────────┘
//!     t=10ms   ┌─────────────┐
//!              │             │ 0/5   sixth request: Delay ~1990ms
//!              └─────────────┘
//!     t=2000   ┌─────────────┐
//!              │ ●           │ 1/5   one more may go
//!              └─────────────┘
//! ```
//!
//! ## Lock-Free Design
//!
//! Token count and last-refill timestamp are atomics updated with
//! compare-and-swap, so any number of pipeline tasks can contend for the same
//! bucket without a lock. Time is passed in explicitly (`*_at(now_ms)`) so
//! the bucket follows whatever [`Clock`](super::utils::Clock) the limiter uses.
//!
//! ```text
//!     Task A ──┐
//!              ├──► CAS(tokens, n → n-1) ──► Ok / retry
//!     Task B ──┘
//! ```

use super::config::{SmoothingConfig, MAX_REFILL_PERIODS};
use super::metrics::BucketMetrics;
use super::utils::{millis_until, CacheAligned};
use std::hint::spin_loop;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Maximum number of CAS attempts before an acquisition gives up.
const MAX_CAS_RETRIES: usize = 16;

/// After this many failed CAS attempts, spin with exponential backoff.
const CAS_BACKOFF_THRESHOLD: usize = 4;

#[inline(always)]
fn backoff(retries: usize) {
    if retries > CAS_BACKOFF_THRESHOLD {
        for _ in 0..(1 << (retries - CAS_BACKOFF_THRESHOLD).min(4)) {
            spin_loop();
        }
    } else {
        spin_loop();
    }
}

/// Lock-free token bucket used as the smoothing layer of the rate limiter.
///
/// # Example
///
/// ```rust
/// use tweetpace::{SmoothingConfig, TokenBucket};
///
/// let bucket = TokenBucket::new(SmoothingConfig::new(2, 1, 1000), 0);
///
/// assert!(bucket.try_acquire_at(1, 0));
/// assert!(bucket.try_acquire_at(1, 0));
/// assert!(!bucket.try_acquire_at(1, 0));
///
/// // One refill interval later a single token is back.
/// assert!(bucket.try_acquire_at(1, 1000));
/// ```
#[repr(C)]
pub struct TokenBucket {
    tokens: CacheAligned<AtomicU64>,
    last_refill_ms: CacheAligned<AtomicU64>,

    max_tokens: u64,
    refill_rate: u32,
    refill_interval_ms: u64,

    total_acquired: AtomicU64,
    total_rejected: AtomicU64,
    total_refills: AtomicU64,
}

impl TokenBucket {
    /// Creates a full bucket whose refill clock starts at `now_ms`.
    ///
    /// The config is expected to have passed [`SmoothingConfig::validate`];
    /// a zero interval is treated as one millisecond.
    pub fn new(config: SmoothingConfig, now_ms: u64) -> Self {
        Self {
            tokens: CacheAligned::new(AtomicU64::new(config.max_burst)),
            last_refill_ms: CacheAligned::new(AtomicU64::new(now_ms)),
            max_tokens: config.max_burst,
            refill_rate: config.refill_rate,
            refill_interval_ms: config.refill_interval_ms.max(1),
            total_acquired: AtomicU64::new(0),
            total_rejected: AtomicU64::new(0),
            total_refills: AtomicU64::new(0),
        }
    }

    /// Bucket capacity.
    #[inline]
    pub fn capacity(&self) -> u64 {
        self.max_tokens
    }

    /// Takes `n` tokens at `now_ms`, all or nothing.
    ///
    /// ```text
    ///     try_acquire_at(n):
    ///
    ///     refill due? ──yes──► credit missed periods
    ///          │
    ///          ▼
    ///     tokens >= n ──yes──► CAS(tokens, t → t-n) ──► true
    ///          │
    ///          no ──────────────────────────────────► false
    /// ```
    pub fn try_acquire_at(&self, n: u64, now_ms: u64) -> bool {
        if n == 0 {
            return true;
        }
        if n > self.max_tokens {
            self.total_rejected.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        self.refill_if_needed(now_ms);

        let mut retries = 0;
        let mut current = self.tokens.value.load(Ordering::Acquire);
        loop {
            if current < n {
                self.total_rejected.fetch_add(1, Ordering::Relaxed);
                return false;
            }

            match self.tokens.value.compare_exchange_weak(
                current,
                current - n,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.total_acquired.fetch_add(n, Ordering::Relaxed);
                    return true;
                }
                Err(actual) => {
                    current = actual;
                    retries += 1;
                    if retries >= MAX_CAS_RETRIES {
                        warn!("Token bucket CAS retry limit reached after {} attempts", retries);
                        self.total_rejected.fetch_add(1, Ordering::Relaxed);
                        return false;
                    }
                    backoff(retries);
                }
            }
        }
    }

    /// Returns tokens to the bucket, capped at capacity.
    ///
    /// The limiter uses this to hand back a token when the quota layer
    /// refuses a request the bucket had already admitted.
    pub fn add_tokens(&self, n: u64) {
        let mut retries = 0;
        let mut current = self.tokens.value.load(Ordering::Acquire);
        loop {
            let next = current.saturating_add(n).min(self.max_tokens);
            match self.tokens.value.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => {
                    current = actual;
                    retries += 1;
                    if retries >= MAX_CAS_RETRIES {
                        debug!("Token add CAS retry limit reached");
                        break;
                    }
                    backoff(retries);
                }
            }
        }
        self.total_acquired
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(n)))
            .ok();
    }

    /// Tokens available at `now_ms`, after crediting any due refill.
    pub fn available_at(&self, now_ms: u64) -> u64 {
        self.refill_if_needed(now_ms);
        self.tokens.value.load(Ordering::Acquire)
    }

    /// How long until `n` tokens could be taken, assuming nobody else takes any.
    ///
    /// ```text
    ///     tokens = 0, need 1, rate 1 / 2000ms, last refill at t=500
    ///     now = 1200  ──►  wait = (500 + 2000) - 1200 = 1300ms
    /// ```
    pub fn time_until_available(&self, n: u64, now_ms: u64) -> Duration {
        let available = self.available_at(now_ms);
        if available >= n {
            return Duration::ZERO;
        }
        let missing = n.min(self.max_tokens) - available;
        let rate = (self.refill_rate as u64).max(1);
        let periods = missing.div_ceil(rate);
        let last_refill = self.last_refill_ms.value.load(Ordering::Acquire);
        millis_until(
            last_refill.saturating_add(periods.saturating_mul(self.refill_interval_ms)),
            now_ms,
        )
    }

    /// Credits whole refill periods that elapsed since the last refill.
    ///
    /// Only the caller that wins the timestamp CAS adds tokens, so concurrent
    /// callers never double-credit a period.
    fn refill_if_needed(&self, now_ms: u64) {
        let last_refill = self.last_refill_ms.value.load(Ordering::Acquire);
        let elapsed = now_ms.saturating_sub(last_refill);
        if elapsed < self.refill_interval_ms {
            return;
        }

        let periods = elapsed / self.refill_interval_ms;
        // After a long idle gap jump the timestamp straight to now.
        let next_refill = if periods > MAX_REFILL_PERIODS {
            now_ms
        } else {
            last_refill + periods * self.refill_interval_ms
        };
        let credited = periods.min(MAX_REFILL_PERIODS);

        if self
            .last_refill_ms
            .value
            .compare_exchange(last_refill, next_refill, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let to_add = (self.refill_rate as u64)
            .saturating_mul(credited)
            .min(self.max_tokens);
        let mut current = self.tokens.value.load(Ordering::Acquire);
        let mut retries = 0;
        loop {
            let next = current.saturating_add(to_add).min(self.max_tokens);
            match self.tokens.value.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.total_refills.fetch_add(1, Ordering::Relaxed);
                    debug!("Refilled {} tokens (periods: {})", next - current, credited);
                    break;
                }
                Err(actual) => {
                    current = actual;
                    retries += 1;
                    if retries >= MAX_CAS_RETRIES {
                        warn!("Token bucket refill CAS retry limit reached");
                        break;
                    }
                    backoff(retries);
                }
            }
        }
    }

    /// Snapshot of the bucket counters.
    pub fn metrics(&self) -> BucketMetrics {
        BucketMetrics {
            total_acquired: self.total_acquired.load(Ordering::Relaxed),
            total_rejected: self.total_rejected.load(Ordering::Relaxed),
            total_refills: self.total_refills.load(Ordering::Relaxed),
            current_tokens: self.tokens.value.load(Ordering::Acquire),
            max_tokens: self.max_tokens,
        }
    }

    /// Refills to capacity and clears the counters.
    pub fn reset(&self, now_ms: u64) {
        self.tokens.value.store(self.max_tokens, Ordering::Release);
        self.last_refill_ms.value.store(now_ms, Ordering::Release);
        self.total_acquired.store(0, Ordering::Relaxed);
        self.total_rejected.store(0, Ordering::Relaxed);
        self.total_refills.store(0, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("max_tokens", &self.max_tokens)
            .field("refill_rate", &self.refill_rate)
            .field("refill_interval_ms", &self.refill_interval_ms)
            .field("current_tokens", &self.tokens.value.load(Ordering::Relaxed))
            .finish()
    }
}
