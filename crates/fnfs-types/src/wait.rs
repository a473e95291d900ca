//! Fair blocking acquisition over a caller-owned mutex.
//!
//! A [`WaitQueue`] pairs a condition variable with a FIFO of tickets. The
//! resource state lives in the caller's `parking_lot::Mutex`; the caller
//! supplies an `attempt` closure that either takes the resource or names the
//! key it is waiting on. A waiter may only take a resource once every older
//! ticket waiting on the same key has been served, so waiters for one
//! resource are served in arrival order while waiters for unrelated
//! resources never block each other.
//!
//! Waits are sliced so that cancellation and deadlines on the [`Cx`] are
//! observed even when nobody calls [`WaitQueue::notify`].

use crate::cx::{Cx, CxError};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// Longest single sleep between cancellation checks.
pub const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Outcome of one acquisition attempt.
#[derive(Debug)]
pub enum Attempt<T, K> {
    Ready(T),
    /// Sleep until the resource identified by the key may have changed.
    Wait(K),
}

#[derive(Debug)]
struct Ticket<K> {
    id: u64,
    key: Option<K>,
}

#[derive(Debug)]
struct Order<K> {
    next_id: u64,
    /// Ascending by id.
    waiting: Vec<Ticket<K>>,
}

#[derive(Debug)]
pub struct WaitQueue<K> {
    cond: Condvar,
    order: Mutex<Order<K>>,
    slice: Duration,
}

/// The caller's place in line, handed to every attempt.
pub struct Turn<'a, K> {
    queue: &'a WaitQueue<K>,
    id: u64,
}

impl<K: PartialEq> Turn<'_, K> {
    /// Whether an older waiter is queued on `key`.
    #[must_use]
    pub fn blocked_by_earlier(&self, key: &K) -> bool {
        let order = self.queue.order.lock();
        order
            .waiting
            .iter()
            .take_while(|t| t.id < self.id)
            .any(|t| t.key.as_ref() == Some(key))
    }
}

impl<K: PartialEq> Default for WaitQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: PartialEq> WaitQueue<K> {
    #[must_use]
    pub fn new() -> Self {
        Self::with_slice(WAIT_SLICE)
    }

    #[must_use]
    pub fn with_slice(slice: Duration) -> Self {
        Self {
            cond: Condvar::new(),
            order: Mutex::new(Order {
                next_id: 0,
                waiting: Vec::new(),
            }),
            slice,
        }
    }

    /// Run `attempt` under `guard` until it yields a value or fails.
    ///
    /// The guard is released while sleeping and reacquired before each
    /// attempt. Cancellation of `cx` fails the wait with `E::from(CxError)`;
    /// the caller's state is left as the last attempt left it.
    pub fn acquire<S, T, E, F>(
        &self,
        cx: &Cx,
        guard: &mut MutexGuard<'_, S>,
        mut attempt: F,
    ) -> Result<T, E>
    where
        F: FnMut(&mut S, &Turn<'_, K>) -> Result<Attempt<T, K>, E>,
        E: From<CxError>,
    {
        let id = self.enqueue();
        let turn = Turn { queue: self, id };
        let result = loop {
            if let Err(err) = cx.checkpoint() {
                break Err(E::from(err));
            }
            match attempt(&mut **guard, &turn) {
                Ok(Attempt::Ready(value)) => break Ok(value),
                Ok(Attempt::Wait(key)) => {
                    self.park(id, key);
                    let _ = self.cond.wait_for(guard, cx.bounded_wait(self.slice));
                }
                Err(err) => break Err(err),
            }
        };
        self.dequeue(id);
        // The next ticket in line may now be eligible.
        self.cond.notify_all();
        result
    }

    /// Wake every waiter so it re-runs its attempt.
    pub fn notify(&self) {
        self.cond.notify_all();
    }

    /// Number of callers currently inside [`Self::acquire`].
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.order.lock().waiting.len()
    }

    /// Whether anyone is parked on `key`.
    #[must_use]
    pub fn has_waiters_on(&self, key: &K) -> bool {
        self.order
            .lock()
            .waiting
            .iter()
            .any(|t| t.key.as_ref() == Some(key))
    }

    fn enqueue(&self) -> u64 {
        let mut order = self.order.lock();
        let id = order.next_id;
        order.next_id += 1;
        order.waiting.push(Ticket { id, key: None });
        id
    }

    fn park(&self, id: u64, key: K) {
        let mut order = self.order.lock();
        if let Some(ticket) = order.waiting.iter_mut().find(|t| t.id == id) {
            ticket.key = Some(key);
        }
    }

    fn dequeue(&self, id: u64) {
        let mut order = self.order.lock();
        order.waiting.retain(|t| t.id != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Instant;

    #[derive(Debug, PartialEq, Eq)]
    enum TestError {
        Cx(CxError),
        Refused,
    }

    impl From<CxError> for TestError {
        fn from(err: CxError) -> Self {
            Self::Cx(err)
        }
    }

    struct Pool {
        queue: WaitQueue<()>,
        free: Mutex<usize>,
    }

    impl Pool {
        fn take(&self, cx: &Cx) -> Result<(), TestError> {
            let mut guard = self.free.lock();
            self.queue.acquire(cx, &mut guard, |free, turn| {
                if *free > 0 && !turn.blocked_by_earlier(&()) {
                    *free -= 1;
                    Ok(Attempt::Ready(()))
                } else {
                    Ok(Attempt::Wait(()))
                }
            })
        }

        fn give(&self) {
            *self.free.lock() += 1;
            self.queue.notify();
        }
    }

    #[test]
    fn ready_resource_is_taken_without_waiting() {
        let pool = Pool {
            queue: WaitQueue::new(),
            free: Mutex::new(1),
        };
        pool.take(&Cx::for_testing()).expect("take");
        assert_eq!(*pool.free.lock(), 0);
        assert_eq!(pool.queue.waiters(), 0);
    }

    #[test]
    fn waiter_wakes_on_release() {
        let pool = Arc::new(Pool {
            queue: WaitQueue::new(),
            free: Mutex::new(0),
        });
        let taker = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.take(&Cx::for_testing()))
        };
        while pool.queue.waiters() == 0 {
            thread::yield_now();
        }
        pool.give();
        taker.join().expect("join").expect("take");
        assert_eq!(pool.queue.waiters(), 0);
    }

    #[test]
    fn waiters_are_served_in_arrival_order() {
        let pool = Arc::new(Pool {
            queue: WaitQueue::new(),
            free: Mutex::new(0),
        });
        let served = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..3 {
            let pool_c = Arc::clone(&pool);
            let served_c = Arc::clone(&served);
            handles.push(thread::spawn(move || {
                pool_c.take(&Cx::for_testing()).expect("take");
                served_c.lock().push(i);
            }));
            while !pool.queue.has_waiters_on(&()) || pool.queue.waiters() < i + 1 {
                thread::yield_now();
            }
            // Let the newest waiter park on the key before the next arrives.
            thread::sleep(Duration::from_millis(5));
        }
        for _ in 0..3 {
            pool.give();
            thread::sleep(Duration::from_millis(20));
        }
        for h in handles {
            h.join().expect("join");
        }
        assert_eq!(*served.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn cancellation_interrupts_wait() {
        let pool = Arc::new(Pool {
            queue: WaitQueue::new(),
            free: Mutex::new(0),
        });
        let cx = Cx::for_testing();
        let taker = {
            let pool = Arc::clone(&pool);
            let cx = cx.clone();
            thread::spawn(move || pool.take(&cx))
        };
        while pool.queue.waiters() == 0 {
            thread::yield_now();
        }
        cx.cancel();
        let result = taker.join().expect("join");
        assert_eq!(result, Err(TestError::Cx(CxError::Cancelled)));
        assert_eq!(pool.queue.waiters(), 0);
    }

    #[test]
    fn deadline_bounds_the_wait() {
        let pool = Pool {
            queue: WaitQueue::new(),
            free: Mutex::new(0),
        };
        let start = Instant::now();
        let result = pool.take(&Cx::with_timeout(Duration::from_millis(30)));
        assert_eq!(result, Err(TestError::Cx(CxError::DeadlineExceeded)));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn attempt_errors_propagate() {
        let queue: WaitQueue<()> = WaitQueue::new();
        let state = Mutex::new(0_u32);
        let attempts = AtomicUsize::new(0);
        let mut guard = state.lock();
        let result: Result<(), TestError> =
            queue.acquire(&Cx::for_testing(), &mut guard, |_, _| {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(TestError::Refused)
            });
        assert_eq!(result, Err(TestError::Refused));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
