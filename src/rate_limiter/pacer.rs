//! # Adaptive Pacing
//!
//! The quota and smoothing layers keep us inside the limits the API
//! publishes. The pacer reacts to what the API actually does: when it starts
//! answering 429s, 5xx gateway errors or slow responses, the delay between
//! requests grows; after a long run of successes it shrinks back.
//!
//! ```text
//!     delay
//!       ▲
//!  15s  ┤                          max_delay
//!       │           ┌──┐
//!       │        ┌──┘  └──┐        ×1.3 per throttle signal
//!       │     ┌──┘        └──┐     ×0.9 per 20 successes
//!  0.8s ┤─────┘              └──── base_delay
//!       └──────────────────────────► time
//!
//!     3 consecutive failures ──► hold all traffic for the cooldown period
//! ```

use super::config::PacingConfig;
use super::metrics::{HealthReport, PacerStats};
use crate::cancel::CancelToken;
use crate::error::Cancelled;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Responses kept for the recent success rate and response time.
const RECENT_WINDOW: usize = 100;

/// Time after the last throttle signal before "rate limited" clears.
const RATE_LIMIT_MEMORY: Duration = Duration::from_secs(300);

/// Status codes treated as the server pushing back.
const THROTTLE_STATUSES: [u16; 4] = [429, 502, 503, 504];

/// Slow responses raise the delay by this factor.
const SLOW_RESPONSE_FACTOR: f64 = 1.2;

/// Each recovery step lowers the delay by this factor.
const RECOVERY_FACTOR: f64 = 0.9;

fn scale(delay: Duration, factor: f64) -> Duration {
    Duration::from_millis((delay.as_millis() as f64 * factor).round() as u64)
}

/// Relative urgency of a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Priority {
    /// Half the normal delay.
    High,
    /// The current delay as is.
    #[default]
    Normal,
    /// One and a half times the normal delay.
    Low,
}

impl Priority {
    /// Delay multiplier for this priority.
    pub fn multiplier(&self) -> f64 {
        match self {
            Self::High => 0.5,
            Self::Normal => 1.0,
            Self::Low => 1.5,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Outcome {
    at: Instant,
    success: bool,
    response_time: Duration,
}

#[derive(Debug)]
struct PacerState {
    current_delay: Duration,
    failure_count: u32,
    last_failure: Option<Instant>,
    consecutive_successes: u32,
    rate_limited_since: Option<Instant>,
    recent: VecDeque<Outcome>,
    paced: VecDeque<Instant>,
    stats: PacerStats,
}

impl PacerState {
    fn new(base_delay: Duration) -> Self {
        Self {
            current_delay: base_delay,
            failure_count: 0,
            last_failure: None,
            consecutive_successes: 0,
            rate_limited_since: None,
            recent: VecDeque::with_capacity(RECENT_WINDOW),
            paced: VecDeque::new(),
            stats: PacerStats::default(),
        }
    }
}

/// Why the pacer asked the caller to wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaceReason {
    /// Regular adaptive delay.
    Adaptive,
    /// Too many consecutive failures; waiting out the cooldown.
    Cooldown,
    /// The rolling per-minute ceiling was reached.
    MinuteCeiling,
}

/// Adaptive delay between dispatched requests.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use tweetpace::{AdaptivePacer, PacingConfig};
///
/// let pacer = AdaptivePacer::new(PacingConfig { jitter: false, ..PacingConfig::default() });
/// assert_eq!(pacer.current_delay(), Duration::from_millis(800));
///
/// pacer.record(false, Duration::from_millis(200), Some(429));
/// assert_eq!(pacer.current_delay(), Duration::from_millis(1040));
/// assert!(pacer.health().is_rate_limited);
/// ```
#[derive(Debug)]
pub struct AdaptivePacer {
    config: PacingConfig,
    state: Mutex<PacerState>,
}

impl AdaptivePacer {
    /// Creates a pacer starting at the base delay.
    pub fn new(config: PacingConfig) -> Self {
        Self {
            state: Mutex::new(PacerState::new(config.base_delay())),
            config,
        }
    }

    /// Pacing settings.
    pub fn config(&self) -> &PacingConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, PacerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn max_delay(&self) -> Duration {
        Duration::from_millis(self.config.max_delay_ms)
    }

    fn cooldown_remaining(&self, state: &PacerState, now: Instant) -> Option<Duration> {
        if state.failure_count < self.config.detection_threshold {
            return None;
        }
        let since_failure = now.saturating_duration_since(state.last_failure?);
        Duration::from_millis(self.config.cooldown_period_ms)
            .checked_sub(since_failure)
            .filter(|remaining| !remaining.is_zero())
    }

    /// Works out how long to wait before the next request at `now`.
    ///
    /// Also records the request against the per-minute ceiling. Returns
    /// zero when pacing is disabled.
    pub fn plan(&self, priority: Priority, now: Instant) -> (Duration, PaceReason) {
        if !self.config.enabled {
            return (Duration::ZERO, PaceReason::Adaptive);
        }
        let mut state = self.state();

        if let Some(remaining) = self.cooldown_remaining(&state, now) {
            return (remaining, PaceReason::Cooldown);
        }

        while let Some(front) = state.paced.front() {
            if now.saturating_duration_since(*front) >= Duration::from_secs(60) {
                state.paced.pop_front();
            } else {
                break;
            }
        }

        let ceiling = self.config.requests_per_minute as usize;
        if ceiling > 0 && state.paced.len() >= ceiling {
            let oldest = state.paced[0];
            let wait = (oldest + Duration::from_secs(60))
                .saturating_duration_since(now)
                .min(self.max_delay());
            state.stats.rate_limit_hits += 1;
            state.rate_limited_since = Some(now);
            state.paced.pop_front();
            state.paced.push_back(now + wait);
            return (wait, PaceReason::MinuteCeiling);
        }

        let mut delay = scale(state.current_delay, priority.multiplier());
        if self.config.jitter {
            delay += Duration::from_millis(rand::rng().random_range(100..=300));
        }
        let delay = delay.clamp(
            Duration::from_millis(self.config.min_delay_ms),
            self.max_delay(),
        );
        state.paced.push_back(now + delay);
        (delay, PaceReason::Adaptive)
    }

    /// Sleeps for the planned delay. Returns the time waited, or
    /// `Err(Cancelled)` if `cancel` fired first.
    pub async fn pace(&self, priority: Priority, cancel: &CancelToken) -> Result<Duration, Cancelled> {
        let (wait, reason) = self.plan(priority, Instant::now());
        if wait.is_zero() {
            return Ok(wait);
        }
        match reason {
            PaceReason::Cooldown => warn!("In cooldown period, waiting {:.1}s", wait.as_secs_f64()),
            PaceReason::MinuteCeiling => warn!(
                "Per-minute ceiling reached, waiting {:.1}s",
                wait.as_secs_f64()
            ),
            PaceReason::Adaptive => debug!("Pacing request for {:?}", wait),
        }

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = cancel.cancelled() => return Err(Cancelled),
        }
        self.state().stats.total_delay += wait;
        Ok(wait)
    }

    /// Records a response and adapts the delay.
    ///
    /// `status` is the HTTP status when a response arrived, `None` for
    /// transport failures.
    pub fn record(&self, success: bool, response_time: Duration, status: Option<u16>) {
        self.record_at(success, response_time, status, Instant::now());
    }

    fn record_at(&self, success: bool, response_time: Duration, status: Option<u16>, now: Instant) {
        let max_delay = self.max_delay();
        let base_delay = self.config.base_delay();
        let mut state = self.state();

        if state.recent.len() == RECENT_WINDOW {
            state.recent.pop_front();
        }
        state.recent.push_back(Outcome {
            at: now,
            success,
            response_time,
        });

        state.stats.total_requests += 1;
        if success {
            state.stats.successful_requests += 1;
            state.consecutive_successes += 1;
            state.failure_count = 0;
        } else {
            state.stats.failed_requests += 1;
            state.failure_count += 1;
            state.consecutive_successes = 0;
            state.last_failure = Some(now);
            if state.failure_count == self.config.detection_threshold {
                warn!(
                    "{} consecutive failures, entering {}s cooldown",
                    state.failure_count,
                    self.config.cooldown_period_ms / 1000
                );
            }
        }

        if status.is_some_and(|code| THROTTLE_STATUSES.contains(&code)) {
            state.rate_limited_since = Some(now);
            state.current_delay = scale(state.current_delay, self.config.adaptive_factor).min(max_delay);
            state.stats.rate_limit_hits += 1;
            state.stats.adaptive_increases += 1;
            warn!(
                "Throttle status {:?} detected, increasing delay to {:.1}s",
                status,
                state.current_delay.as_secs_f64()
            );
        }

        if response_time > Duration::from_millis(self.config.slow_response_ms)
            && state.rate_limited_since.is_none()
        {
            state.current_delay = scale(state.current_delay, SLOW_RESPONSE_FACTOR).min(max_delay);
            state.stats.adaptive_increases += 1;
            warn!(
                "Slow response ({:.1}s), adjusting delay to {:.1}s",
                response_time.as_secs_f64(),
                state.current_delay.as_secs_f64()
            );
        }

        if state.consecutive_successes >= self.config.recovery_successes
            && state.current_delay > base_delay
        {
            state.current_delay = scale(state.current_delay, RECOVERY_FACTOR).max(base_delay);
            state.stats.adaptive_decreases += 1;
            state.consecutive_successes = 0;
            debug!("Recovering, delay lowered to {:?}", state.current_delay);
        }

        if let Some(since) = state.rate_limited_since {
            if now.saturating_duration_since(since) > RATE_LIMIT_MEMORY {
                state.rate_limited_since = None;
                info!("Rate limiting cleared");
            }
        }
    }

    /// Delay the next adaptive pace starts from.
    pub fn current_delay(&self) -> Duration {
        self.state().current_delay
    }

    /// Lifetime counters.
    pub fn stats(&self) -> PacerStats {
        self.state().stats.clone()
    }

    /// Live health view.
    pub fn health(&self) -> HealthReport {
        self.health_at(Instant::now())
    }

    fn health_at(&self, now: Instant) -> HealthReport {
        let state = self.state();
        let recent = state.recent.len();
        let (recent_success_rate, average_response_time) = if recent == 0 {
            (1.0, Duration::ZERO)
        } else {
            let successes = state.recent.iter().filter(|o| o.success).count();
            let total: Duration = state.recent.iter().map(|o| o.response_time).sum();
            (successes as f64 / recent as f64, total / recent as u32)
        };
        let requests_last_minute = state
            .recent
            .iter()
            .filter(|o| now.saturating_duration_since(o.at) < Duration::from_secs(60))
            .count();

        HealthReport {
            current_delay: state.current_delay,
            is_rate_limited: state.rate_limited_since.is_some(),
            failure_count: state.failure_count,
            consecutive_successes: state.consecutive_successes,
            recent_success_rate,
            requests_last_minute,
            average_response_time,
            in_cooldown: self.cooldown_remaining(&state, now).is_some(),
        }
    }

    /// Back to the base delay with empty history and counters.
    pub fn reset(&self) {
        *self.state() = PacerState::new(self.config.base_delay());
    }
}
