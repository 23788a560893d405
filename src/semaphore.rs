//! A resizable, FIFO counting semaphore with variable-size acquisition (§4.2).
//!
//! `tokio::sync::Semaphore` already gives FIFO fairness and `acquire_many`, but it has no way to
//! shrink its capacity without either blocking the shrinking task on `acquire_many` (as the
//! teacher's `Limiter::record_reading` does for its congestion-control limit changes) or
//! revoking permits that are currently held. §4.2 requires a resize that "never revokes in-use
//! permits" and completes synchronously, so capacity is tracked explicitly here instead of
//! being implied by the semaphore's available-permit count.
//!
//! State lives behind a plain [`std::sync::Mutex`] rather than `tokio::sync::Mutex`: every
//! critical section here is a handful of arithmetic operations with no `.await` inside it, so a
//! blocking mutex is both cheaper and lets [`CountingSemaphore::try_acquire`] stay a fully
//! synchronous function — required for composing it into the single-model limiter's
//! synchronous compound `try_reserve` (§4.4), which the generic capacity wait queue (§4.3)
//! expects.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use tokio::sync::oneshot;

struct Waiter {
    requested: usize,
    resolver: Option<oneshot::Sender<()>>,
}

struct State {
    /// Permits available to hand out right now.
    permits: usize,
    /// The configured maximum, i.e. total capacity (in use + available), kept in sync with
    /// `permits` by `resize`.
    max_permits: usize,
    queue: VecDeque<Waiter>,
}

/// A FIFO, resizable counting semaphore.
pub struct CountingSemaphore {
    state: Mutex<State>,
    in_use: AtomicUsize,
}

/// A held permit (or permits).
///
/// Dropping without calling [`Permit::release`] still recovers the capacity (via [`Drop`]) but
/// does not synchronously drain FIFO waiters — prefer explicit `release` so they're woken
/// promptly.
pub struct Permit {
    semaphore: Arc<CountingSemaphore>,
    amount: usize,
    released: bool,
}

impl Permit {
    /// Number of permits this guard holds.
    pub fn amount(&self) -> usize {
        self.amount
    }

    /// Explicitly release these permits, draining FIFO waiters.
    pub fn release(mut self) {
        self.released = true;
        self.semaphore.release(self.amount);
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if !self.released {
            self.semaphore.release(self.amount);
        }
    }
}

impl CountingSemaphore {
    /// Create a semaphore with `initial_permits` available, up to a max of the same value.
    pub fn new(initial_permits: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                permits: initial_permits,
                max_permits: initial_permits,
                queue: VecDeque::new(),
            }),
            in_use: AtomicUsize::new(0),
        })
    }

    /// Non-blocking acquire: succeeds only if the queue is empty and `n` permits are free.
    ///
    /// Barging is deliberately disallowed even when permits are free: if the queue is non-empty,
    /// an earlier waiter is owed those permits first (I6).
    pub fn try_acquire(self: &Arc<Self>, n: usize) -> Option<Permit> {
        if n == 0 {
            // A zero-sized request always succeeds immediately and never joins the queue: there
            // is nothing to reserve, so it can't barge ahead of anyone.
            return Some(Permit {
                semaphore: self.clone(),
                amount: 0,
                released: false,
            });
        }
        let mut state = self.state.lock().expect("semaphore mutex poisoned");
        if state.queue.is_empty() && state.permits >= n {
            state.permits -= n;
            drop(state);
            self.in_use.fetch_add(n, Ordering::SeqCst);
            Some(Permit {
                semaphore: self.clone(),
                amount: n,
                released: false,
            })
        } else {
            None
        }
    }

    /// Acquire `n` permits, waiting in FIFO order if unavailable.
    pub async fn acquire(self: &Arc<Self>, n: usize) -> Permit {
        let rx = {
            let mut state = self.state.lock().expect("semaphore mutex poisoned");
            if state.queue.is_empty() && state.permits >= n {
                state.permits -= n;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state.queue.push_back(Waiter {
                    requested: n,
                    resolver: Some(tx),
                });
                Some(rx)
            }
        };

        if let Some(rx) = rx {
            let _ = rx.await;
        }

        self.in_use.fetch_add(n, Ordering::SeqCst);
        Permit {
            semaphore: self.clone(),
            amount: n,
            released: false,
        }
    }

    /// Release `n` permits back to the pool and drain the FIFO queue while the head waiter's
    /// request is satisfiable.
    pub fn release(&self, n: usize) {
        self.in_use.fetch_sub(n, Ordering::SeqCst);
        let mut state = self.state.lock().expect("semaphore mutex poisoned");
        state.permits += n;
        self.drain(&mut state);
    }

    fn drain(&self, state: &mut State) {
        while let Some(front) = state.queue.front() {
            if front.requested > state.permits {
                break;
            }
            let mut waiter = state.queue.pop_front().expect("just peeked");
            state.permits -= waiter.requested;
            // The permits for this waiter are already accounted for in `permits` (deducted
            // above) and will show up in `in_use` once its `acquire` future resumes and adds
            // them; if the receiver was dropped (its task was cancelled), refund instead of
            // leaking.
            if let Some(resolver) = waiter.resolver.take() {
                if resolver.send(()).is_err() {
                    state.permits += waiter.requested;
                }
            }
        }
    }

    /// Resize the semaphore's maximum capacity.
    ///
    /// Clamped at a minimum of 1. Growing adds the delta to `permits` and drains the queue;
    /// shrinking reduces `permits` but never below zero and never touches permits already held
    /// by a live [`Permit`] — `in_use` only decreases as those are released.
    pub fn resize(&self, new_max: usize) {
        let new_max = new_max.max(1);
        let mut state = self.state.lock().expect("semaphore mutex poisoned");
        match new_max.cmp(&state.max_permits) {
            std::cmp::Ordering::Greater => {
                let delta = new_max - state.max_permits;
                state.permits += delta;
                state.max_permits = new_max;
                self.drain(&mut state);
            }
            std::cmp::Ordering::Less => {
                let delta = state.max_permits - new_max;
                state.permits = state.permits.saturating_sub(delta);
                state.max_permits = new_max;
            }
            std::cmp::Ordering::Equal => {}
        }
    }

    /// Permits currently available to hand out.
    pub fn available(&self) -> usize {
        self.state.lock().expect("semaphore mutex poisoned").permits
    }

    /// Permits currently held by live [`Permit`]s.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    /// The configured maximum capacity.
    pub fn max_permits(&self) -> usize {
        self.state
            .lock()
            .expect("semaphore mutex poisoned")
            .max_permits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquires_and_releases() {
        let sem = CountingSemaphore::new(2);
        let p1 = sem.try_acquire(1).unwrap();
        assert_eq!(sem.available(), 1);
        p1.release();
        assert_eq!(sem.available(), 2);
    }

    #[test]
    fn try_acquire_fails_when_insufficient() {
        let sem = CountingSemaphore::new(1);
        let _p = sem.try_acquire(1).unwrap();
        assert!(sem.try_acquire(1).is_none());
    }

    #[tokio::test]
    async fn fifo_order_no_barging() {
        let sem = CountingSemaphore::new(1);
        let p = sem.try_acquire(1).unwrap();

        let sem2 = sem.clone();
        let first = tokio::spawn(async move { sem2.acquire(1).await });
        tokio::task::yield_now().await;

        // A second, smaller request must not barge ahead of the first waiter even though it
        // could be satisfied on its own once released.
        assert!(sem.try_acquire(1).is_none());

        p.release();
        let _first_permit = first.await.unwrap();
    }

    #[test]
    fn resize_down_does_not_revoke_in_use() {
        let sem = CountingSemaphore::new(4);
        let _p = sem.try_acquire(3).unwrap();
        sem.resize(1);
        assert_eq!(sem.in_use(), 3);
        assert_eq!(sem.available(), 0);
    }

    #[tokio::test]
    async fn resize_up_drains_queue() {
        let sem = CountingSemaphore::new(1);
        let _p = sem.try_acquire(1).unwrap();

        let sem2 = sem.clone();
        let waiter = tokio::spawn(async move { sem2.acquire(1).await });
        tokio::task::yield_now().await;

        sem.resize(2);
        let _permit = waiter.await.unwrap();
    }
}
