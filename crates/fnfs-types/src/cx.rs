//! Cooperative cancellation context (`Cx`).
//!
//! Every operation that can block (waiting for a busy buffer, a congestion
//! credit, a reply, or a connection) takes `&Cx` and calls
//! [`Cx::checkpoint`] each time it wakes. A context carries:
//! - a cancel flag shared by all clones and propagated to children
//! - an optional absolute deadline inherited by children

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CxError {
    #[error("operation cancelled")]
    Cancelled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

#[derive(Debug, Default)]
struct CxInner {
    cancel_requested: AtomicBool,
    children: Mutex<Vec<Arc<Self>>>,
}

fn propagate_cancel(inner: &CxInner) {
    inner.cancel_requested.store(true, Ordering::Release);
    // Release the lock before recursing.
    let children: Vec<Arc<CxInner>> = inner
        .children
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    for child in &children {
        propagate_cancel(child);
    }
}

/// Capability context passed through every blocking operation.
#[derive(Debug, Clone)]
pub struct Cx {
    inner: Arc<CxInner>,
    deadline: Option<Instant>,
}

impl Default for Cx {
    fn default() -> Self {
        Self::for_request()
    }
}

impl Cx {
    /// Unbounded context for a production request.
    #[must_use]
    pub fn for_request() -> Self {
        Self {
            inner: Arc::new(CxInner::default()),
            deadline: None,
        }
    }

    /// Unbounded context for tests.
    #[must_use]
    pub fn for_testing() -> Self {
        Self::for_request()
    }

    /// Context that expires `timeout` from now.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(CxInner::default()),
            deadline: Instant::now().checked_add(timeout),
        }
    }

    /// Child context with independent cancellation; cancelling `self` also
    /// cancels the child. The effective deadline is the tighter of the two.
    #[must_use]
    pub fn create_child(&self) -> Self {
        self.child_with_deadline(self.deadline)
    }

    /// Child context bounded by `timeout` from now (or the parent deadline,
    /// whichever comes first).
    #[must_use]
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let own = Instant::now().checked_add(timeout);
        let deadline = match (self.deadline, own) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.child_with_deadline(deadline)
    }

    fn child_with_deadline(&self, deadline: Option<Instant>) -> Self {
        let child = Arc::new(CxInner::default());
        if self.is_cancel_requested() {
            child.cancel_requested.store(true, Ordering::Release);
        }
        self.inner
            .children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&child));
        Self {
            inner: child,
            deadline,
        }
    }

    #[must_use]
    pub fn is_cancel_requested(&self) -> bool {
        self.inner.cancel_requested.load(Ordering::Acquire)
    }

    /// Request cancellation of this context and all of its children.
    pub fn cancel(&self) {
        propagate_cancel(&self.inner);
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; `None` when unbounded.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Fail if cancellation was requested or the deadline passed.
    pub fn checkpoint(&self) -> Result<(), CxError> {
        if self.inner.cancel_requested.load(Ordering::Acquire) {
            return Err(CxError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(CxError::DeadlineExceeded);
            }
        }
        Ok(())
    }

    /// Clamp a wait slice so it never sleeps past the deadline.
    #[must_use]
    pub fn bounded_wait(&self, slice: Duration) -> Duration {
        self.remaining().map_or(slice, |left| left.min(slice))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_context_passes_checkpoint() {
        let cx = Cx::for_testing();
        assert!(cx.checkpoint().is_ok());
        assert!(cx.remaining().is_none());
    }

    #[test]
    fn cancel_is_shared_by_clones() {
        let cx = Cx::for_testing();
        let clone = cx.clone();
        cx.cancel();
        assert!(clone.is_cancel_requested());
        assert_eq!(clone.checkpoint(), Err(CxError::Cancelled));
    }

    #[test]
    fn cancel_propagates_to_children_but_not_parents() {
        let parent = Cx::for_testing();
        let child = parent.create_child();
        let grandchild = child.create_child();
        child.cancel();
        assert!(!parent.is_cancel_requested());
        assert!(grandchild.is_cancel_requested());

        parent.cancel();
        let late = parent.create_child();
        assert!(late.is_cancel_requested());
    }

    #[test]
    fn expired_deadline_fails_checkpoint() {
        let cx = Cx::with_timeout(Duration::ZERO);
        assert_eq!(cx.checkpoint(), Err(CxError::DeadlineExceeded));
        assert_eq!(cx.bounded_wait(Duration::from_secs(1)), Duration::ZERO);
    }

    #[test]
    fn child_deadline_is_the_tighter_one() {
        let parent = Cx::with_timeout(Duration::from_secs(60));
        let child = parent.child_with_timeout(Duration::from_millis(10));
        assert!(child.deadline() < parent.deadline());
        let loose = parent.child_with_timeout(Duration::from_secs(600));
        assert_eq!(loose.deadline(), parent.deadline());
    }
}
