//! # Time Sources and Layout Helpers (utils.rs)
//!
//! Every quota window and token bucket in this crate is driven by a [`Clock`]
//! rather than by calling the system clock directly. Production code uses
//! [`SystemClock`]; tests use [`ManualClock`] so that window resets can be
//! stepped through deterministically.
//!
//! ```text
//!     Clock sources:
//!
//!     SystemClock ──► epoch base (captured once) + monotonic elapsed
//!          │            └─ immune to wall-clock jumps after start
//!          │
//!     ManualClock ──► AtomicU64 you set / advance yourself
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

// Wall-clock epoch millis captured at first use, advanced by a monotonic
// Instant afterwards so that a system clock step never moves windows backwards.
static START_TIME_BASE: OnceLock<(Instant, u64)> = OnceLock::new();

/// Returns the current time in milliseconds since UNIX epoch.
///
/// The value is monotonic for the lifetime of the process.
///
/// # Example
///
/// ```rust
/// use tweetpace::current_time_ms;
///
/// let a = current_time_ms();
/// let b = current_time_ms();
/// assert!(b >= a);
/// ```
#[inline]
pub fn current_time_ms() -> u64 {
    let (start, base_ms) = START_TIME_BASE.get_or_init(|| {
        let epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        (Instant::now(), epoch_ms)
    });
    base_ms.saturating_add(start.elapsed().as_millis() as u64)
}

/// Source of "now" for quota and bucket arithmetic.
///
/// Implementations must be cheap to call and safe to share across threads.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Milliseconds since UNIX epoch.
    fn now_ms(&self) -> u64;
}

/// Shared clock handle passed between the tracker, limiter and dispatcher.
pub type SharedClock = Arc<dyn Clock>;

/// Process clock backed by [`current_time_ms`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now_ms(&self) -> u64 {
        current_time_ms()
    }
}

/// Hand-driven clock for tests and simulations.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use tweetpace::{Clock, ManualClock};
///
/// let clock = ManualClock::new(1_000);
/// clock.advance(Duration::from_secs(60));
/// assert_eq!(clock.now_ms(), 61_000);
/// ```
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    /// Creates a clock frozen at `start_ms`.
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(start_ms),
        }
    }

    /// Moves the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        self.now_ms
            .fetch_add(by.as_millis() as u64, Ordering::AcqRel);
    }

    /// Jumps the clock to an absolute instant.
    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::Release);
    }
}

impl Clock for ManualClock {
    #[inline]
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::Acquire)
    }
}

/// Converts a millisecond gap into a `Duration`, treating "in the past" as zero.
#[inline]
pub(crate) fn millis_until(target_ms: u64, now_ms: u64) -> Duration {
    Duration::from_millis(target_ms.saturating_sub(now_ms))
}

/// Cache-aligned wrapper so the hot token counter and refill timestamp of a
/// bucket never share a cache line with each other.
#[cfg_attr(target_arch = "aarch64", repr(C, align(128)))]
#[cfg_attr(not(target_arch = "aarch64"), repr(C, align(64)))]
pub(crate) struct CacheAligned<T> {
    pub(crate) value: T,
}

impl<T> CacheAligned<T> {
    #[inline(always)]
    pub(crate) const fn new(value: T) -> Self {
        Self { value }
    }
}

impl<T: fmt::Debug> fmt::Debug for CacheAligned<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.value.fmt(f)
    }
}
