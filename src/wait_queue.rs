//! A generic FIFO capacity wait queue (§4.3), parameterized over a reservation type `R`.
//!
//! Grounded on the teacher's partition `Scheduler`, which keeps a `LinkedList` of
//! `(index, oneshot::Sender<Token>)` waiters and replays it on every `reuse_permit`. This
//! generalizes that to an arbitrary `try_reserve` closure per waiter and adds the `processing`
//! re-entrancy guard required by §5: a `try_reserve` call can itself release capacity elsewhere
//! (e.g. when the reservation type holds a `Drop` guard that got swapped out), which would
//! otherwise cause `notify_capacity_available` to recurse into itself.

use std::{collections::VecDeque, sync::Arc};

use tokio::sync::{oneshot, Mutex};

type TryReserve<R> = Box<dyn Fn() -> Option<R> + Send + Sync>;

struct Waiter<R> {
    try_reserve: TryReserve<R>,
    resolver: oneshot::Sender<R>,
}

struct State<R> {
    queue: VecDeque<Waiter<R>>,
    /// Re-entrancy guard: set while `notify_capacity_available` is draining the queue, so that a
    /// `try_reserve` which synchronously triggers another notification doesn't recurse — it
    /// instead returns immediately, trusting the outer call to keep draining.
    processing: bool,
}

/// FIFO queue of waiters blocked on some capacity resource, each carrying its own atomic
/// check-and-reserve closure.
pub struct CapacityWaitQueue<R> {
    state: Mutex<State<R>>,
}

impl<R: Send + 'static> Default for CapacityWaitQueue<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Send + 'static> CapacityWaitQueue<R> {
    /// An empty wait queue.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                processing: false,
            }),
        }
    }

    /// Wait for capacity, as defined by `try_reserve`, for up to `max_wait`.
    ///
    /// `max_wait == Duration::ZERO` makes this a single non-blocking attempt. Otherwise,
    /// `try_reserve` is attempted immediately; on failure the caller enqueues behind any earlier
    /// waiters and is woken (in FIFO order, §4.3/I6) by [`Self::notify_capacity_available`], or
    /// times out and is removed from the queue with no reservation held.
    pub async fn wait_for_capacity(
        self: &Arc<Self>,
        try_reserve: impl Fn() -> Option<R> + Send + Sync + 'static,
        max_wait: std::time::Duration,
    ) -> Option<R> {
        if let Some(r) = try_reserve() {
            return Some(r);
        }
        if max_wait.is_zero() {
            return None;
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock().await;
            // Re-check under the lock: another task may have freed capacity between our
            // unlocked attempt above and taking the lock here.
            if let Some(r) = try_reserve() {
                return Some(r);
            }
            state.queue.push_back(Waiter {
                try_reserve: Box::new(try_reserve),
                resolver: tx,
            });
        }

        match tokio::time::timeout(max_wait, rx).await {
            Ok(Ok(r)) => Some(r),
            Ok(Err(_)) => None, // sender dropped: cancelled, see `cancel_all`
            Err(_elapsed) => {
                // Dropping `rx` here (the `timeout` future owned it and is now gone) closes the
                // channel; the stale waiter is lazily reaped by `notify_capacity_available`'s
                // `is_closed` check rather than removed eagerly, since that would need a stable
                // waiter id threaded through the queue.
                None
            }
        }
    }

    /// Notify the queue that capacity may have become available, draining FIFO waiters whose
    /// `try_reserve` now succeeds.
    ///
    /// Per §4.3, a `None` from the head's `try_reserve` stops the drain entirely rather than
    /// skipping to the next waiter — preserving fairness (I6) means a later, smaller waiter must
    /// not be served ahead of an earlier, larger one even if it could be.
    pub async fn notify_capacity_available(&self) {
        let mut state = self.state.lock().await;
        if state.processing {
            return;
        }
        state.processing = true;

        loop {
            let Some(front) = state.queue.front() else {
                break;
            };
            if front.resolver.is_closed() {
                state.queue.pop_front();
                continue;
            }
            match (front.try_reserve)() {
                Some(reserved) => {
                    let waiter = state.queue.pop_front().expect("front just matched");
                    let _ = waiter.resolver.send(reserved);
                }
                None => break,
            }
        }

        state.processing = false;
    }

    /// Cancel every waiter with no reservation (used by `stop()`, §5 cancellation). Dropping
    /// each `oneshot::Sender` causes the waiter's `rx.await` to resolve to `Err`, which
    /// `wait_for_capacity` turns into `None`.
    pub async fn cancel_all(&self) {
        let mut state = self.state.lock().await;
        state.queue.clear();
    }

    /// Number of waiters currently queued.
    pub async fn len(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    /// Whether the queue is empty.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn non_blocking_attempt_returns_immediately() {
        let queue: Arc<CapacityWaitQueue<u32>> = Arc::new(CapacityWaitQueue::new());
        let got = queue
            .wait_for_capacity(|| Some(7), Duration::ZERO)
            .await;
        assert_eq!(got, Some(7));

        let got_none = queue.wait_for_capacity(|| None::<u32>, Duration::ZERO).await;
        assert_eq!(got_none, None);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_when_never_notified() {
        let queue: Arc<CapacityWaitQueue<u32>> = Arc::new(CapacityWaitQueue::new());
        let got = queue
            .wait_for_capacity(|| None::<u32>, Duration::from_millis(50))
            .await;
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn fifo_order_preserved_on_notify() {
        let queue: Arc<CapacityWaitQueue<u32>> = Arc::new(CapacityWaitQueue::new());
        let available = Arc::new(AtomicUsize::new(0));

        let try_reserve = {
            let available = available.clone();
            move || {
                let mut current = available.load(Ordering::SeqCst);
                loop {
                    if current == 0 {
                        return None;
                    }
                    match available.compare_exchange(
                        current,
                        current - 1,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    ) {
                        Ok(_) => return Some(1u32),
                        Err(actual) => current = actual,
                    }
                }
            }
        };

        let q1 = queue.clone();
        let tr1 = try_reserve.clone_fn();
        let first = tokio::spawn(async move { q1.wait_for_capacity(tr1, Duration::from_secs(5)).await });
        tokio::task::yield_now().await;

        let q2 = queue.clone();
        let tr2 = try_reserve.clone_fn();
        let second = tokio::spawn(async move { q2.wait_for_capacity(tr2, Duration::from_secs(5)).await });
        tokio::task::yield_now().await;

        available.store(1, Ordering::SeqCst);
        queue.notify_capacity_available().await;

        let first_result = first.await.unwrap();
        assert_eq!(first_result, Some(1), "earliest waiter must be served first");

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!second.is_finished());

        available.store(1, Ordering::SeqCst);
        queue.notify_capacity_available().await;
        let second_result = second.await.unwrap();
        assert_eq!(second_result, Some(1));
    }

    trait CloneFn<R> {
        fn clone_fn(&self) -> Box<dyn Fn() -> Option<R> + Send + Sync>;
    }

    impl<F, R> CloneFn<R> for F
    where
        F: Fn() -> Option<R> + Send + Sync + Clone + 'static,
    {
        fn clone_fn(&self) -> Box<dyn Fn() -> Option<R> + Send + Sync> {
            Box::new(self.clone())
        }
    }
}
