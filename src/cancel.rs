//! Cooperative cancellation shared by every suspension point.
//!
//! ```text
//!     CancelToken (root, optional deadline)
//!        ├── child ──► one fetch chain
//!        └── child ──► another chain
//!
//!     cancel() on the root wakes every waiter below it
//! ```
//!
//! A token is cancelled when `cancel()` was called on it or any ancestor, or
//! when its own or an ancestor's deadline passed.

use futures_util::future::BoxFuture;
use std::fmt;
use std::future::pending;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};

struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
    deadline: Option<Instant>,
    parent: Option<CancelToken>,
}

/// Cloneable cancellation handle; clones share state.
///
/// # Example
///
/// ```rust
/// use tweetpace::CancelToken;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let token = CancelToken::new();
/// let child = token.child();
///
/// token.cancel();
/// child.cancelled().await;
/// assert!(child.is_cancelled());
/// # }
/// ```
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    fn build(deadline: Option<Instant>, parent: Option<CancelToken>) -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
                deadline,
                parent,
            }),
        }
    }

    /// Token that only cancels when asked to.
    pub fn new() -> Self {
        Self::build(None, None)
    }

    /// Token that also cancels itself once `timeout` has elapsed.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::build(Some(Instant::now() + timeout), None)
    }

    /// Token cancelled whenever `self` is, and independently cancellable.
    pub fn child(&self) -> Self {
        Self::build(None, Some(self.clone()))
    }

    /// Cancels this token and all of its children.
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::AcqRel) {
            self.inner.notify.notify_waiters();
        }
    }

    /// Whether the token, or one of its ancestors, is cancelled.
    pub fn is_cancelled(&self) -> bool {
        if self.inner.cancelled.load(Ordering::Acquire) {
            return true;
        }
        if matches!(self.inner.deadline, Some(deadline) if Instant::now() >= deadline) {
            return true;
        }
        self.inner
            .parent
            .as_ref()
            .is_some_and(|parent| parent.is_cancelled())
    }

    /// Completes once the token is cancelled.
    pub fn cancelled(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            // Register before checking the flag so a concurrent cancel() is not missed.
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }

            let parent = async {
                match &self.inner.parent {
                    Some(parent) => parent.cancelled().await,
                    None => pending::<()>().await,
                }
            };
            let deadline = async {
                match self.inner.deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => pending::<()>().await,
                }
            };

            tokio::select! {
                _ = notified => {}
                _ = parent => {}
                _ = deadline => {}
            }
        })
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .field("has_deadline", &self.inner.deadline.is_some())
            .field("has_parent", &self.inner.parent.is_some())
            .finish()
    }
}
