//! # Quota Tracker
//!
//! Keeps one fixed window per endpoint and hands out reservations against it.
//! This is the only place the hard API limit is enforced, so its one job is
//! to never grant more than `limit` calls inside a window, however many tasks
//! race for it.
//!
//! ## Architecture
//!
//! ```text
//!     QuotaTracker
//!     ┌─────────────────────────────────────────────┐
//!     │  DashMap<endpoint, Arc<Mutex<QuotaWindow>>> │
//!     │                                             │
//!     │  "search"   ──► [start 12:00, 3/450 used]   │
//!     │  "timeline" ──► [start 12:04, 900/900 used] │
//!     │  "users"    ──► [start 12:01, 0/300 used]   │
//!     └─────────────────────────────────────────────┘
//! ```
//!
//! Windows are created lazily through the map's entry API. Each window has its
//! own mutex, so a full "timeline" window never blocks a reservation against
//! "search".
//!
//! ## Window Lifecycle
//!
//! ```text
//!     reserve() at t ≥ start + duration
//!          │
//!          ▼
//!     used = 0, start = t ──► used + cost ≤ limit ? grant : deny(retry_after)
//!
//!     429 with reset R
//!          │
//!          ▼
//!     start = now, duration = R - now, used = limit
//! ```

use super::config::QuotaConfig;
use super::metrics::QuotaStats;
use super::store::{QuotaStore, WindowState};
use super::utils::{millis_until, SharedClock};
use crate::error::StoreError;
use dashmap::DashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Usage counter for one endpoint.
///
/// Invariant: `used <= limit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaWindow {
    /// Endpoint this window counts calls for.
    pub endpoint_id: String,
    /// Window start, epoch milliseconds.
    pub window_start: u64,
    /// Window length.
    pub window_duration: Duration,
    /// Calls allowed in the window.
    pub limit: u64,
    /// Calls already granted.
    pub used: u64,
    server_signalled: bool,
}

impl QuotaWindow {
    fn fresh(endpoint_id: &str, now_ms: u64, window_duration: Duration, limit: u64) -> Self {
        Self {
            endpoint_id: endpoint_id.to_string(),
            window_start: now_ms,
            window_duration,
            limit,
            used: 0,
            server_signalled: false,
        }
    }

    /// Epoch milliseconds at which `used` goes back to zero.
    #[inline]
    pub fn resets_at_ms(&self) -> u64 {
        self.window_start
            .saturating_add(self.window_duration.as_millis() as u64)
    }

    /// Whether the window has run out at `now_ms`.
    #[inline]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.resets_at_ms()
    }

    /// Calls still available.
    #[inline]
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.used)
    }

    /// Whether the server has already throttled this window.
    #[inline]
    pub fn server_signalled(&self) -> bool {
        self.server_signalled
    }
}

/// Outcome of [`QuotaTracker::reserve`] or [`QuotaTracker::peek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    /// The cost was (or would be) charged to the window.
    pub granted: bool,
    /// Wait until the window resets. `None` when granted, or when the cost
    /// exceeds the whole limit and no reset will ever help.
    pub retry_after: Option<Duration>,
    /// Epoch milliseconds of the next reset.
    pub resets_at_ms: u64,
}

type SharedWindow = Arc<Mutex<QuotaWindow>>;

fn lock(window: &Mutex<QuotaWindow>) -> MutexGuard<'_, QuotaWindow> {
    // Every critical section leaves the window consistent, so a panic in
    // another holder does not invalidate it.
    window.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-endpoint fixed-window quota.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use std::time::Duration;
/// use tweetpace::{ManualClock, QuotaConfig, QuotaTracker};
///
/// let clock = Arc::new(ManualClock::new(0));
/// let tracker = QuotaTracker::new(QuotaConfig::per_minute(2), clock.clone());
///
/// assert!(tracker.reserve("search", 1).granted);
/// assert!(tracker.reserve("search", 1).granted);
///
/// let denied = tracker.reserve("search", 1);
/// assert!(!denied.granted);
/// assert_eq!(denied.retry_after, Some(Duration::from_secs(60)));
///
/// clock.advance(Duration::from_secs(60));
/// assert!(tracker.reserve("search", 1).granted);
/// ```
pub struct QuotaTracker {
    windows: DashMap<String, SharedWindow, ahash::RandomState>,
    config: QuotaConfig,
    clock: SharedClock,
    store: Option<Arc<dyn QuotaStore>>,
    flush_interval: Duration,

    total_granted: AtomicU64,
    total_denied: AtomicU64,
    server_signals: AtomicU64,
}

impl QuotaTracker {
    /// Creates an empty tracker.
    pub fn new(config: QuotaConfig, clock: SharedClock) -> Self {
        Self {
            windows: DashMap::with_hasher(ahash::RandomState::new()),
            config,
            clock,
            store: None,
            flush_interval: Duration::from_secs(30),
            total_granted: AtomicU64::new(0),
            total_denied: AtomicU64::new(0),
            server_signals: AtomicU64::new(0),
        }
    }

    /// Attaches a persistence backend used by [`flush`](Self::flush),
    /// [`load_from_store`](Self::load_from_store) and the flush thread.
    pub fn with_store(mut self, store: Arc<dyn QuotaStore>, flush_interval: Duration) -> Self {
        self.store = Some(store);
        self.flush_interval = flush_interval;
        self
    }

    /// Quota settings the tracker was built with.
    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }

    /// Current time on the tracker's clock.
    #[inline]
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Gets or lazily creates the window for `endpoint_id`.
    fn window(&self, endpoint_id: &str) -> SharedWindow {
        if let Some(window) = self.windows.get(endpoint_id) {
            return window.clone();
        }

        match self.windows.entry(endpoint_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(occupied) => occupied.get().clone(),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let quota = self.config.quota_for(endpoint_id);
                let window = Arc::new(Mutex::new(QuotaWindow::fresh(
                    endpoint_id,
                    self.clock.now_ms(),
                    quota.window(),
                    quota.limit,
                )));
                vacant.insert(window.clone());
                debug!(
                    "Created quota window for {} ({} per {}ms)",
                    endpoint_id, quota.limit, quota.window_ms
                );
                window
            }
        }
    }

    /// Restarts an expired window with the configured limit and duration.
    fn roll_if_expired(&self, window: &mut QuotaWindow, now_ms: u64) {
        if window.is_expired(now_ms) {
            let quota = self.config.quota_for(&window.endpoint_id);
            debug!(
                "Quota window for {} reset ({} of {} used)",
                window.endpoint_id, window.used, window.limit
            );
            *window = QuotaWindow::fresh(&window.endpoint_id, now_ms, quota.window(), quota.limit);
        }
    }

    fn evaluate(window: &QuotaWindow, cost: u64, now_ms: u64) -> Reservation {
        let resets_at_ms = window.resets_at_ms();
        if window.used.saturating_add(cost) <= window.limit {
            Reservation {
                granted: true,
                retry_after: None,
                resets_at_ms,
            }
        } else {
            Reservation {
                granted: false,
                retry_after: (cost <= window.limit).then(|| millis_until(resets_at_ms, now_ms)),
                resets_at_ms,
            }
        }
    }

    /// Charges `cost` calls to the endpoint's current window if they fit.
    ///
    /// Atomic per endpoint: concurrent callers never push `used` past `limit`.
    pub fn reserve(&self, endpoint_id: &str, cost: u64) -> Reservation {
        let window = self.window(endpoint_id);
        let mut window = lock(&window);
        let now_ms = self.clock.now_ms();
        self.roll_if_expired(&mut window, now_ms);

        let reservation = Self::evaluate(&window, cost, now_ms);
        if reservation.granted {
            window.used += cost;
            self.total_granted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.total_denied.fetch_add(1, Ordering::Relaxed);
            debug!(
                "Quota denied for {} ({}/{} used, resets in {:?})",
                endpoint_id, window.used, window.limit, reservation.retry_after
            );
        }
        reservation
    }

    /// What `reserve` would answer right now, without charging anything.
    pub fn peek(&self, endpoint_id: &str, cost: u64) -> Reservation {
        let window = self.window(endpoint_id);
        let mut window = lock(&window);
        let now_ms = self.clock.now_ms();
        self.roll_if_expired(&mut window, now_ms);
        Self::evaluate(&window, cost, now_ms)
    }

    /// Applies a server-reported reset instant after a 429.
    ///
    /// The window is rewritten to end exactly at `reset_at_ms` and marked
    /// full, so local admission waits for the server's reset rather than our
    /// own estimate. Returns `true` if this is the first server signal seen
    /// for the current window.
    pub fn apply_server_reset(&self, endpoint_id: &str, reset_at_ms: u64) -> bool {
        let window = self.window(endpoint_id);
        let mut window = lock(&window);
        let now_ms = self.clock.now_ms();
        self.roll_if_expired(&mut window, now_ms);

        let first = !window.server_signalled;
        window.window_start = now_ms;
        window.window_duration = millis_until(reset_at_ms, now_ms);
        window.used = window.limit;
        window.server_signalled = true;
        self.server_signals.fetch_add(1, Ordering::Relaxed);

        warn!(
            "Server throttled {}; window now resets in {:?} (first signal: {})",
            endpoint_id, window.window_duration, first
        );
        first
    }

    /// Folds the server's view of the window into the local one after a
    /// successful response.
    ///
    /// Only ever raises `used`; a server that reports more headroom than we
    /// think we have is not trusted over our own count. When the server
    /// reports nothing left and resets later than our window would, the
    /// window is stretched to end at the server's reset instead.
    pub fn sync_server_window(&self, endpoint_id: &str, remaining: u64, reset_at_ms: Option<u64>) {
        let window = self.window(endpoint_id);
        let mut window = lock(&window);
        let now_ms = self.clock.now_ms();
        self.roll_if_expired(&mut window, now_ms);

        let server_used = window.limit.saturating_sub(remaining);
        if server_used > window.used {
            debug!(
                "Server reports {} remaining for {}; raising used {} -> {}",
                remaining, endpoint_id, window.used, server_used
            );
            window.used = server_used;
        }

        if remaining > 0 {
            return;
        }
        if let Some(reset_at_ms) = reset_at_ms {
            if reset_at_ms > window.resets_at_ms() {
                window.window_duration = millis_until(reset_at_ms, window.window_start);
                info!(
                    "Server quota for {} spent; window extended to reset in {:?}",
                    endpoint_id,
                    millis_until(reset_at_ms, now_ms)
                );
            }
        }
    }

    /// Copy of the endpoint's window, if one exists.
    pub fn window_snapshot(&self, endpoint_id: &str) -> Option<QuotaWindow> {
        self.windows
            .get(endpoint_id)
            .map(|window| lock(window.value()).clone())
    }

    /// Serializable view of every live window.
    pub fn snapshot(&self) -> Vec<WindowState> {
        let mut states: Vec<WindowState> = self
            .windows
            .iter()
            .map(|entry| {
                let window = lock(entry.value());
                WindowState {
                    endpoint_id: window.endpoint_id.clone(),
                    window_start: window.window_start,
                    window_duration_ms: window.window_duration.as_millis() as u64,
                    used: window.used,
                }
            })
            .collect();
        states.sort_by(|a, b| a.endpoint_id.cmp(&b.endpoint_id));
        states
    }

    /// Reinstates persisted windows. Windows that already expired are
    /// skipped; `used` is clamped to the currently configured limit.
    /// Returns the number of windows restored.
    pub fn restore(&self, states: Vec<WindowState>) -> usize {
        let now_ms = self.clock.now_ms();
        let mut restored = 0;
        for state in states {
            if now_ms >= state.resets_at_ms() {
                debug!("Skipping expired persisted window for {}", state.endpoint_id);
                continue;
            }
            let limit = self.config.quota_for(&state.endpoint_id).limit;
            let window = QuotaWindow {
                endpoint_id: state.endpoint_id.clone(),
                window_start: state.window_start,
                window_duration: Duration::from_millis(state.window_duration_ms),
                limit,
                used: state.used.min(limit),
                server_signalled: false,
            };
            self.windows
                .insert(state.endpoint_id, Arc::new(Mutex::new(window)));
            restored += 1;
        }
        info!("Restored {} quota windows", restored);
        restored
    }

    /// Loads persisted windows from the attached store, if any.
    pub fn load_from_store(&self) -> Result<usize, StoreError> {
        match &self.store {
            Some(store) => Ok(self.restore(store.load()?)),
            None => Ok(0),
        }
    }

    /// Writes every live window to the attached store, if any.
    pub fn flush(&self) -> Result<(), StoreError> {
        if let Some(store) = &self.store {
            store.save(&self.snapshot())?;
        }
        Ok(())
    }

    /// Starts a background thread that flushes to the store every
    /// `flush_interval` and once more when stopped.
    ///
    /// Send `()` on the returned channel (or drop it) to stop the thread.
    ///
    /// # Example
    ///
    /// ```rust
    /// use std::sync::Arc;
    /// use tweetpace::{QuotaConfig, QuotaTracker, SystemClock};
    ///
    /// let tracker = Arc::new(QuotaTracker::new(QuotaConfig::default(), Arc::new(SystemClock)));
    /// let (handle, stop_tx) = tracker.clone().start_flush_thread().unwrap();
    ///
    /// stop_tx.send(()).unwrap();
    /// handle.join().unwrap();
    /// ```
    pub fn start_flush_thread(
        self: Arc<Self>,
    ) -> io::Result<(thread::JoinHandle<()>, mpsc::Sender<()>)> {
        let (stop_tx, stop_rx) = mpsc::channel();
        let tracker = self;

        let handle = thread::Builder::new()
            .name("tweetpace-quota-flush".to_string())
            .spawn(move || {
                info!(
                    "Started quota flush thread (interval: {}ms)",
                    tracker.flush_interval.as_millis()
                );

                loop {
                    match stop_rx.recv_timeout(tracker.flush_interval) {
                        Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                            if let Err(err) = tracker.flush() {
                                warn!("Final quota flush failed: {}", err);
                            }
                            info!("Quota flush thread stopping");
                            break;
                        }
                        Err(mpsc::RecvTimeoutError::Timeout) => {
                            if let Err(err) = tracker.flush() {
                                warn!("Quota flush failed: {}", err);
                            }
                        }
                    }
                }
            })?;

        Ok((handle, stop_tx))
    }

    /// Counters since construction.
    pub fn stats(&self) -> QuotaStats {
        QuotaStats {
            tracked_endpoints: self.windows.len(),
            total_granted: self.total_granted.load(Ordering::Relaxed),
            total_denied: self.total_denied.load(Ordering::Relaxed),
            server_signals: self.server_signals.load(Ordering::Relaxed),
        }
    }

    /// Drops every window; the next reservation starts a fresh one.
    pub fn clear(&self) {
        let count = self.windows.len();
        self.windows.clear();
        info!("Cleared {} quota windows", count);
    }
}

impl std::fmt::Debug for QuotaTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaTracker")
            .field("endpoints", &self.windows.len())
            .field("default_limit", &self.config.default_limit)
            .field("has_store", &self.store.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limiter::store::JsonFileStore;
    use crate::rate_limiter::utils::ManualClock;
    use std::sync::Barrier;
    use tempfile::TempDir;

    fn tracker(limit: u64, window: Duration) -> (Arc<ManualClock>, QuotaTracker) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let tracker = QuotaTracker::new(QuotaConfig::per_window(limit, window), clock.clone());
        (clock, tracker)
    }

    #[test]
    fn test_lazy_window_creation() {
        let (_, tracker) = tracker(5, Duration::from_secs(60));
        assert!(tracker.window_snapshot("search").is_none());

        tracker.reserve("search", 1);
        let window = tracker.window_snapshot("search").unwrap();
        assert_eq!(window.used, 1);
        assert_eq!(window.window_start, 1_000_000);
        assert_eq!(tracker.stats().tracked_endpoints, 1);
    }

    #[test]
    fn test_denial_reports_time_to_reset() {
        let (clock, tracker) = tracker(2, Duration::from_secs(60));
        assert!(tracker.reserve("search", 2).granted);

        clock.advance(Duration::from_secs(15));
        let denied = tracker.reserve("search", 1);
        assert!(!denied.granted);
        assert_eq!(denied.retry_after, Some(Duration::from_secs(45)));
        assert_eq!(denied.resets_at_ms, 1_060_000);
    }

    #[test]
    fn test_window_resets_after_duration() {
        let (clock, tracker) = tracker(1, Duration::from_secs(10));
        assert!(tracker.reserve("a", 1).granted);
        assert!(!tracker.reserve("a", 1).granted);

        clock.advance(Duration::from_secs(10));
        assert!(tracker.reserve("a", 1).granted);
        assert_eq!(tracker.window_snapshot("a").unwrap().window_start, 1_010_000);
    }

    #[test]
    fn test_cost_above_limit_never_fits() {
        let (_, tracker) = tracker(3, Duration::from_secs(10));
        let denied = tracker.reserve("a", 4);
        assert!(!denied.granted);
        assert_eq!(denied.retry_after, None);
    }

    #[test]
    fn test_endpoints_are_independent() {
        let (_, tracker) = tracker(1, Duration::from_secs(10));
        assert!(tracker.reserve("a", 1).granted);
        assert!(tracker.reserve("b", 1).granted);
        assert!(!tracker.reserve("a", 1).granted);
    }

    #[test]
    fn test_peek_does_not_charge() {
        let (_, tracker) = tracker(1, Duration::from_secs(10));
        assert!(tracker.peek("a", 1).granted);
        assert!(tracker.peek("a", 1).granted);
        assert_eq!(tracker.window_snapshot("a").unwrap().used, 0);
    }

    #[test]
    fn test_server_reset_rewrites_window() {
        let (clock, tracker) = tracker(100, Duration::from_secs(900));
        tracker.reserve("search", 1);

        assert!(tracker.apply_server_reset("search", 1_030_000));
        let window = tracker.window_snapshot("search").unwrap();
        assert_eq!(window.window_start, 1_000_000);
        assert_eq!(window.window_duration, Duration::from_secs(30));
        assert_eq!(window.used, 100);

        // Second signal for the same window is not "first".
        assert!(!tracker.apply_server_reset("search", 1_030_000));

        let denied = tracker.reserve("search", 1);
        assert_eq!(denied.retry_after, Some(Duration::from_secs(30)));

        clock.advance(Duration::from_secs(30));
        assert!(tracker.reserve("search", 1).granted);
        let window = tracker.window_snapshot("search").unwrap();
        assert_eq!(window.window_duration, Duration::from_secs(900));
        assert!(!window.server_signalled());
        assert_eq!(tracker.stats().server_signals, 2);
    }

    #[test]
    fn test_server_sync_only_raises_used() {
        let (_, tracker) = tracker(10, Duration::from_secs(60));
        tracker.reserve("a", 2);

        tracker.sync_server_window("a", 5, None);
        assert_eq!(tracker.window_snapshot("a").unwrap().used, 5);

        tracker.sync_server_window("a", 9, Some(2_000_000));
        let window = tracker.window_snapshot("a").unwrap();
        assert_eq!(window.used, 5);
        // Headroom left, so the local reset stands.
        assert_eq!(window.resets_at_ms(), 1_060_000);
    }

    #[test]
    fn test_server_sync_extends_spent_window() {
        let (clock, tracker) = tracker(10, Duration::from_secs(60));
        tracker.reserve("a", 1);

        tracker.sync_server_window("a", 0, Some(1_900_000));
        let window = tracker.window_snapshot("a").unwrap();
        assert_eq!(window.used, 10);
        assert_eq!(window.window_start, 1_000_000);
        assert_eq!(window.resets_at_ms(), 1_900_000);

        clock.advance(Duration::from_secs(61));
        let denied = tracker.reserve("a", 1);
        assert!(!denied.granted);
        assert_eq!(denied.resets_at_ms, 1_900_000);

        clock.set(1_900_000);
        assert!(tracker.reserve("a", 1).granted);
        assert_eq!(
            tracker.window_snapshot("a").unwrap().window_duration,
            Duration::from_secs(60)
        );
    }

    #[test]
    fn test_server_sync_never_shortens_window() {
        let (_, tracker) = tracker(10, Duration::from_secs(60));
        tracker.reserve("a", 1);

        tracker.sync_server_window("a", 0, Some(1_030_000));
        let window = tracker.window_snapshot("a").unwrap();
        assert_eq!(window.used, 10);
        assert_eq!(window.resets_at_ms(), 1_060_000);
    }

    #[test]
    fn test_concurrent_reserve_never_exceeds_limit() {
        let (_, tracker) = tracker(50, Duration::from_secs(60));
        let tracker = Arc::new(tracker);
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tracker = tracker.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    (0..20).filter(|_| tracker.reserve("hot", 1).granted).count()
                })
            })
            .collect();

        let granted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(granted, 50);
        assert_eq!(tracker.window_snapshot("hot").unwrap().used, 50);
        assert_eq!(tracker.stats().total_denied, 110);
    }

    #[test]
    fn test_snapshot_and_restore() {
        let (clock, tracker) = tracker(10, Duration::from_secs(60));
        tracker.reserve("a", 4);
        tracker.reserve("b", 1);
        let states = tracker.snapshot();
        assert_eq!(states.len(), 2);
        assert_eq!(states[0].endpoint_id, "a");

        let restored = QuotaTracker::new(QuotaConfig::per_window(10, Duration::from_secs(60)), clock.clone());
        assert_eq!(restored.restore(states.clone()), 2);
        assert_eq!(restored.window_snapshot("a").unwrap().used, 4);

        clock.advance(Duration::from_secs(61));
        let late = QuotaTracker::new(QuotaConfig::default(), clock.clone());
        assert_eq!(late.restore(states), 0);
    }

    #[test]
    fn test_restore_clamps_to_limit() {
        let (_, tracker) = tracker(3, Duration::from_secs(60));
        tracker.restore(vec![WindowState {
            endpoint_id: "a".into(),
            window_start: 1_000_000,
            window_duration_ms: 60_000,
            used: 99,
        }]);
        assert_eq!(tracker.window_snapshot("a").unwrap().used, 3);
    }

    #[test]
    fn test_flush_and_load_through_store() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(JsonFileStore::new(dir.path().join("quota.json")));
        let clock = Arc::new(ManualClock::new(5_000));

        let tracker = QuotaTracker::new(QuotaConfig::per_minute(10), clock.clone())
            .with_store(store.clone(), Duration::from_secs(1));
        tracker.reserve("search", 3);
        tracker.flush().unwrap();

        let reloaded = QuotaTracker::new(QuotaConfig::per_minute(10), clock)
            .with_store(store, Duration::from_secs(1));
        assert_eq!(reloaded.load_from_store().unwrap(), 1);
        assert_eq!(reloaded.window_snapshot("search").unwrap().used, 3);
    }

    #[test]
    fn test_flush_thread_writes_on_stop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("quota.json");
        let store = Arc::new(JsonFileStore::new(&path));

        let tracker = Arc::new(
            QuotaTracker::new(QuotaConfig::per_minute(10), Arc::new(ManualClock::new(0)))
                .with_store(store, Duration::from_secs(3600)),
        );
        let (handle, stop_tx) = tracker.clone().start_flush_thread().unwrap();
        tracker.reserve("search", 1);

        stop_tx.send(()).unwrap();
        handle.join().unwrap();

        assert!(path.exists());
    }

    #[test]
    fn test_clear() {
        let (_, tracker) = tracker(1, Duration::from_secs(60));
        tracker.reserve("a", 1);
        tracker.clear();
        assert_eq!(tracker.stats().tracked_endpoints, 0);
        assert!(tracker.reserve("a", 1).granted);
    }
}
