//! # Limiter Metrics and Health
//!
//! Point-in-time snapshots from each layer of the limiter, plus a coarse
//! health verdict for the pacing layer that callers can log or alert on.
//!
//! ```text
//!     Health report:
//!     ┌─────────────────────────────────────┐
//!     │  Current Delay: 1.04s               │
//!     │  Recent Success: 97% (last 100)     │
//!     │  Requests / min: 42                 │
//!     │  Rate Limited: no   Cooldown: no    │
//!     │                                     │
//!     │  Health: ✅ Healthy                 │
//!     └─────────────────────────────────────┘
//! ```

use std::fmt;
use std::time::Duration;

/// Snapshot of a [`TokenBucket`](super::core::TokenBucket).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketMetrics {
    /// Tokens handed out, net of refunds.
    pub total_acquired: u64,
    /// Acquisition attempts that found too few tokens.
    pub total_rejected: u64,
    /// Refill operations performed.
    pub total_refills: u64,
    /// Tokens in the bucket right now.
    pub current_tokens: u64,
    /// Bucket capacity.
    pub max_tokens: u64,
}

impl BucketMetrics {
    /// Fraction of acquisition attempts that succeeded; 1.0 when idle.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_acquired + self.total_rejected;
        if total == 0 {
            1.0
        } else {
            self.total_acquired as f64 / total as f64
        }
    }

    /// 0.0 for a full bucket, 1.0 for an empty one.
    pub fn utilization(&self) -> f64 {
        if self.max_tokens == 0 {
            0.0
        } else {
            1.0 - (self.current_tokens as f64 / self.max_tokens as f64)
        }
    }
}

/// Counters kept by the [`QuotaTracker`](super::quota::QuotaTracker).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuotaStats {
    /// Endpoints with a live window.
    pub tracked_endpoints: usize,
    /// Reservations granted.
    pub total_granted: u64,
    /// Reservations denied because the window was full.
    pub total_denied: u64,
    /// Server throttle signals applied to a window.
    pub server_signals: u64,
}

impl QuotaStats {
    /// Share of reservations that were denied.
    pub fn denial_rate(&self) -> f64 {
        let total = self.total_granted + self.total_denied;
        if total == 0 {
            0.0
        } else {
            self.total_denied as f64 / total as f64
        }
    }
}

/// Lifetime counters of the [`AdaptivePacer`](super::pacer::AdaptivePacer).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PacerStats {
    /// Responses recorded, successful or not.
    pub total_requests: u64,
    /// Responses recorded as successful.
    pub successful_requests: u64,
    /// Responses recorded as failed.
    pub failed_requests: u64,
    /// Failures whose status code signalled throttling.
    pub rate_limit_hits: u64,
    /// Time spent sleeping in `pace`.
    pub total_delay: Duration,
    /// Times the delay was raised.
    pub adaptive_increases: u64,
    /// Times the delay was lowered.
    pub adaptive_decreases: u64,
}

impl PacerStats {
    /// Successful share of all recorded responses; 1.0 when nothing recorded.
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            1.0
        } else {
            self.successful_requests as f64 / self.total_requests as f64
        }
    }

    /// Mean sleep per recorded request.
    pub fn average_delay(&self) -> Duration {
        if self.total_requests == 0 {
            Duration::ZERO
        } else {
            self.total_delay / self.total_requests as u32
        }
    }
}

/// Live view of the pacer's state.
///
/// ## Example
///
/// ```rust
/// use tweetpace::{AdaptivePacer, HealthStatus, PacingConfig};
///
/// let pacer = AdaptivePacer::new(PacingConfig::default());
/// let report = pacer.health();
/// assert_eq!(report.health_status(), HealthStatus::Healthy);
/// println!("{}", report.summary());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct HealthReport {
    /// Delay the next `pace` call will start from.
    pub current_delay: Duration,
    /// The server throttled us within the last five minutes.
    pub is_rate_limited: bool,
    /// Consecutive failures.
    pub failure_count: u32,
    /// Consecutive successes.
    pub consecutive_successes: u32,
    /// Success rate over the last 100 responses.
    pub recent_success_rate: f64,
    /// Paced requests in the last 60 seconds.
    pub requests_last_minute: usize,
    /// Mean response time over the last 100 responses.
    pub average_response_time: Duration,
    /// All traffic is held until the cooldown ends.
    pub in_cooldown: bool,
}

impl HealthReport {
    /// Three-level verdict.
    ///
    /// ```text
    ///     in cooldown or recent success < 50% ───► Critical
    ///     throttled, failing, or success < 90% ──► Degraded
    ///     otherwise ─────────────────────────────► Healthy
    /// ```
    pub fn health_status(&self) -> HealthStatus {
        if self.in_cooldown || self.recent_success_rate < 0.5 {
            HealthStatus::Critical
        } else if self.is_rate_limited || self.failure_count > 0 || self.recent_success_rate < 0.9 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    /// Multi-line report for logs.
    ///
    /// # Example Output
    ///
    /// ```text
    /// Pacer Health:
    /// ├─ Pacing:
    /// │  ├─ Current Delay: 1.040s
    /// │  ├─ Rate Limited: false
    /// │  └─ In Cooldown: false
    /// ├─ Recent Traffic:
    /// │  ├─ Success Rate: 97.00%
    /// │  ├─ Requests Last Minute: 42
    /// │  └─ Avg Response Time: 0.310s
    /// ├─ Streaks:
    /// │  ├─ Failures: 0
    /// │  └─ Successes: 12
    /// └─ Status: ✅ Healthy
    /// ```
    pub fn summary(&self) -> String {
        format!(
            "Pacer Health:\n\
             ├─ Pacing:\n\
             │  ├─ Current Delay: {:.3}s\n\
             │  ├─ Rate Limited: {}\n\
             │  └─ In Cooldown: {}\n\
             ├─ Recent Traffic:\n\
             │  ├─ Success Rate: {:.2}%\n\
             │  ├─ Requests Last Minute: {}\n\
             │  └─ Avg Response Time: {:.3}s\n\
             ├─ Streaks:\n\
             │  ├─ Failures: {}\n\
             │  └─ Successes: {}\n\
             └─ Status: {}",
            self.current_delay.as_secs_f64(),
            self.is_rate_limited,
            self.in_cooldown,
            self.recent_success_rate * 100.0,
            self.requests_last_minute,
            self.average_response_time.as_secs_f64(),
            self.failure_count,
            self.consecutive_successes,
            self.health_status(),
        )
    }
}

impl fmt::Display for HealthReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

/// Coarse health of the request pacing.
///
/// ```text
///     Healthy ──────► traffic flowing, no throttling
///        │
///     Degraded ─────► server pushing back, delays growing
///        │
///     Critical ─────► cooldown active or most requests failing
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Normal operation.
    Healthy,
    /// Throttled or seeing failures, still making progress.
    Degraded,
    /// Cooling down or failing most requests.
    Critical,
}

impl HealthStatus {
    /// True for anything but `Healthy`.
    pub fn is_unhealthy(&self) -> bool {
        !matches!(self, Self::Healthy)
    }

    /// Operator hint for logs.
    pub fn suggested_action(&self) -> &'static str {
        match self {
            Self::Healthy => "No action needed",
            Self::Degraded => "Monitor closely, consider lowering request volume",
            Self::Critical => "Immediate action required: pause fetching or check credentials",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "✅ Healthy"),
            Self::Degraded => write!(f, "⚠️ Degraded"),
            Self::Critical => write!(f, "🔴 Critical"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> HealthReport {
        HealthReport {
            current_delay: Duration::from_millis(800),
            is_rate_limited: false,
            failure_count: 0,
            consecutive_successes: 5,
            recent_success_rate: 1.0,
            requests_last_minute: 5,
            average_response_time: Duration::from_millis(300),
            in_cooldown: false,
        }
    }

    #[test]
    fn test_bucket_metrics_calculations() {
        let metrics = BucketMetrics {
            total_acquired: 80,
            total_rejected: 20,
            total_refills: 10,
            current_tokens: 25,
            max_tokens: 100,
        };
        assert_eq!(metrics.success_rate(), 0.8);
        assert_eq!(metrics.utilization(), 0.75);

        let empty = BucketMetrics {
            total_acquired: 0,
            total_rejected: 0,
            total_refills: 0,
            current_tokens: 0,
            max_tokens: 0,
        };
        assert_eq!(empty.success_rate(), 1.0);
        assert_eq!(empty.utilization(), 0.0);
    }

    #[test]
    fn test_quota_stats_denial_rate() {
        assert_eq!(QuotaStats::default().denial_rate(), 0.0);
        let stats = QuotaStats {
            tracked_endpoints: 2,
            total_granted: 3,
            total_denied: 1,
            server_signals: 0,
        };
        assert_eq!(stats.denial_rate(), 0.25);
    }

    #[test]
    fn test_pacer_stats() {
        let stats = PacerStats {
            total_requests: 4,
            successful_requests: 3,
            failed_requests: 1,
            total_delay: Duration::from_secs(2),
            ..PacerStats::default()
        };
        assert_eq!(stats.success_rate(), 0.75);
        assert_eq!(stats.average_delay(), Duration::from_millis(500));
        assert_eq!(PacerStats::default().average_delay(), Duration::ZERO);
    }

    #[test]
    fn test_health_status_levels() {
        assert_eq!(report().health_status(), HealthStatus::Healthy);

        let throttled = HealthReport {
            is_rate_limited: true,
            ..report()
        };
        assert_eq!(throttled.health_status(), HealthStatus::Degraded);

        let cooling = HealthReport {
            in_cooldown: true,
            ..report()
        };
        assert_eq!(cooling.health_status(), HealthStatus::Critical);

        let failing = HealthReport {
            recent_success_rate: 0.3,
            ..report()
        };
        assert_eq!(failing.health_status(), HealthStatus::Critical);
    }

    #[test]
    fn test_health_status_methods() {
        assert!(!HealthStatus::Healthy.is_unhealthy());
        assert!(HealthStatus::Degraded.is_unhealthy());
        assert!(HealthStatus::Critical.suggested_action().contains("Immediate"));
        assert!(format!("{}", HealthStatus::Degraded).contains("Degraded"));
    }

    #[test]
    fn test_summary_sections() {
        let summary = report().summary();
        assert!(summary.contains("Pacer Health"));
        assert!(summary.contains("Requests Last Minute: 5"));
        assert!(summary.contains("Healthy"));
        assert_eq!(format!("{}", report()), summary);
    }
}
