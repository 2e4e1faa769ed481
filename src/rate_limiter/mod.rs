//! # Rate Limiter Module
//!
//! Everything that decides *when* a request may leave the process.
//!
//! ## Module Structure
//!
//! ```text
//!     rate_limiter/
//!     ├── mod.rs          (You are here - Module organization)
//!     ├── admission.rs    (RateLimiter: admit / delay / reject)
//!     ├── config.rs       (Quota, smoothing and pacing settings)
//!     ├── core.rs         (Lock-free smoothing token bucket)
//!     ├── quota.rs        (Per-endpoint fixed windows)
//!     ├── pacer.rs        (Adaptive inter-request delay)
//!     ├── metrics.rs      (Stats and health)
//!     ├── store.rs        (Persisted quota state)
//!     └── utils.rs        (Clocks and layout helpers)
//! ```
//!
//! ## Architecture Flow
//!
//! ```text
//!     Dispatcher attempt
//!          │
//!          ▼
//!     ┌───────────┐
//!     │ Admission │ ◄── stricter of quota and smoothing
//!     └─────┬─────┘
//!           │
//!     ┌─────┴──────┐
//!     ▼            ▼
//!  ┌───────┐  ┌──────────┐
//!  │ Quota │  │  Bucket  │
//!  └───┬───┘  └──────────┘
//!      │
//!      ▼
//!  ┌───────┐
//!  │ Store │ ◄── optional, survives restarts
//!  └───────┘
//!
//!     then ──► Pacer (adaptive delay, cooldown) ──► network
//! ```

mod admission;
mod config;
mod core;
mod metrics;
mod pacer;
mod quota;
mod store;
mod utils;

/// Admission decisions and the limiter that produces them
pub use admission::{AdmissionDecision, RateLimiter, RejectReason};

/// Configuration types for the limiter layers
pub use config::{
    EndpointQuota, LimiterConfig, PacingConfig, QuotaConfig, SmoothingConfig, MAX_REFILL_PERIODS,
};

/// Smoothing token bucket
pub use self::core::TokenBucket;

/// Metrics and health monitoring for observability
pub use metrics::{BucketMetrics, HealthReport, HealthStatus, PacerStats, QuotaStats};

/// Adaptive pacing
pub use pacer::{AdaptivePacer, PaceReason, Priority};

/// Per-endpoint quota windows
pub use quota::{QuotaTracker, QuotaWindow, Reservation};

/// Persistence of quota windows
pub use store::{JsonFileStore, QuotaStore, WindowState};

/// Time sources
pub use utils::{current_time_ms, Clock, ManualClock, SharedClock, SystemClock};
