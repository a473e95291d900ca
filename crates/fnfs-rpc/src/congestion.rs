//! Send window for datagram connections.
//!
//! The window and the outstanding count are both in units of
//! [`CWND_SCALE`]; one request holds one credit while it is on the wire.

use fnfs_error::{NfsError, Result};
use fnfs_types::{Attempt, Cx, WaitQueue};
use parking_lot::Mutex;
use tracing::trace;

/// One credit.
pub const CWND_SCALE: u32 = 256;

/// Largest window regardless of configuration, in credits.
pub const MAX_CWND_CREDITS: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Window {
    cwnd: u32,
    sent: u32,
}

#[derive(Debug)]
pub struct CongestionController {
    window: Mutex<Window>,
    waiters: WaitQueue<()>,
    max_cwnd: u32,
}

/// Snapshot of the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowState {
    pub cwnd: u32,
    pub outstanding: u32,
    pub max: u32,
}

impl CongestionController {
    /// Window capped at `max_requests` credits (at least one, at most
    /// [`MAX_CWND_CREDITS`]); starts at half the cap.
    #[must_use]
    pub fn new(max_requests: usize) -> Self {
        let credits = u32::try_from(max_requests)
            .unwrap_or(MAX_CWND_CREDITS)
            .clamp(1, MAX_CWND_CREDITS);
        let max_cwnd = credits * CWND_SCALE;
        Self {
            window: Mutex::new(Window {
                cwnd: (max_cwnd / 2).max(CWND_SCALE),
                sent: 0,
            }),
            waiters: WaitQueue::new(),
            max_cwnd,
        }
    }

    /// Take one credit, waiting in arrival order while the window is full.
    pub fn acquire(&self, cx: &Cx) -> Result<()> {
        let mut window = self.window.lock();
        self.waiters
            .acquire(cx, &mut window, |w, turn| {
                if w.sent < w.cwnd && !turn.blocked_by_earlier(&()) {
                    w.sent += CWND_SCALE;
                    Ok::<_, NfsError>(Attempt::Ready(()))
                } else {
                    Ok(Attempt::Wait(()))
                }
            })
    }

    /// Take a credit only if one is free right now.
    pub fn try_acquire(&self) -> bool {
        let mut window = self.window.lock();
        if window.sent < window.cwnd && self.waiters.waiters() == 0 {
            window.sent += CWND_SCALE;
            true
        } else {
            false
        }
    }

    /// Return a credit without touching the window size.
    pub fn release(&self) {
        let mut window = self.window.lock();
        window.sent = window.sent.saturating_sub(CWND_SCALE);
        drop(window);
        self.waiters.notify();
    }

    /// A reply arrived for a request holding a credit: grow the window if
    /// it was fully used, then return the credit.
    pub fn on_reply(&self) {
        let mut window = self.window.lock();
        if window.cwnd <= window.sent {
            let grow = (CWND_SCALE * CWND_SCALE + window.cwnd / 2) / window.cwnd;
            window.cwnd = (window.cwnd + grow).min(self.max_cwnd);
            trace!(cwnd = window.cwnd, "congestion window opened");
        }
        window.sent = window.sent.saturating_sub(CWND_SCALE);
        drop(window);
        self.waiters.notify();
    }

    /// A request timed out: halve the window, never below one credit.
    pub fn on_timeout(&self) {
        let mut window = self.window.lock();
        window.cwnd = (window.cwnd / 2).max(CWND_SCALE);
        trace!(cwnd = window.cwnd, "congestion window closed");
    }

    /// Forget outstanding credits after the connection was rebuilt.
    pub fn reset_outstanding(&self) {
        self.window.lock().sent = 0;
        self.waiters.notify();
    }

    #[must_use]
    pub fn state(&self) -> WindowState {
        let window = self.window.lock();
        WindowState {
            cwnd: window.cwnd,
            outstanding: window.sent,
            max: self.max_cwnd,
        }
    }

    /// Callers currently blocked on the window.
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.waiters.waiters()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn window_limits_outstanding_credits() {
        let cc = CongestionController::new(4);
        assert_eq!(cc.state().cwnd, 2 * CWND_SCALE);
        assert!(cc.try_acquire());
        assert!(cc.try_acquire());
        assert!(!cc.try_acquire());
        cc.release();
        assert!(cc.try_acquire());
    }

    #[test]
    fn full_window_grows_on_reply() {
        let cc = CongestionController::new(8);
        let start = cc.state().cwnd;
        while cc.try_acquire() {}
        cc.on_reply();
        let after = cc.state();
        assert!(after.cwnd > start);
        assert_eq!(after.outstanding, start - CWND_SCALE);
    }

    #[test]
    fn timeout_halves_down_to_one_credit() {
        let cc = CongestionController::new(32);
        for _ in 0..10 {
            cc.on_timeout();
        }
        assert_eq!(cc.state().cwnd, CWND_SCALE);
    }

    #[test]
    fn blocked_sender_wakes_on_reply() {
        let cc = Arc::new(CongestionController::new(1));
        cc.acquire(&Cx::for_testing()).expect("first");
        let waiter = {
            let cc = Arc::clone(&cc);
            thread::spawn(move || cc.acquire(&Cx::for_testing()))
        };
        let deadline = Instant::now() + Duration::from_secs(5);
        while cc.waiters() == 0 {
            assert!(Instant::now() < deadline);
            thread::yield_now();
        }
        cc.on_reply();
        waiter.join().expect("join").expect("acquire");
        assert_eq!(cc.state().outstanding, CWND_SCALE);
    }

    #[test]
    fn blocked_sender_honours_deadline() {
        let cc = CongestionController::new(1);
        cc.acquire(&Cx::for_testing()).expect("first");
        let err = cc
            .acquire(&Cx::with_timeout(Duration::from_millis(30)))
            .expect_err("window full");
        assert!(matches!(err, NfsError::Timeout(_)));
    }

    proptest! {
        #[test]
        fn window_stays_within_bounds(
            max in 1usize..64,
            events in proptest::collection::vec(0u8..3, 0..200),
        ) {
            let cc = CongestionController::new(max);
            for e in events {
                match e {
                    0 => { let _ = cc.try_acquire(); }
                    1 => cc.on_reply(),
                    _ => cc.on_timeout(),
                }
                let s = cc.state();
                prop_assert!(s.cwnd >= CWND_SCALE);
                prop_assert!(s.cwnd <= s.max);
                prop_assert!(s.max <= MAX_CWND_CREDITS * CWND_SCALE);
            }
        }
    }
}
