//! Single-flight access token renewal.
//!
//! At most one renewal runs at a time. Requests that hit an expired token
//! while a renewal is running park a waiter here and are resumed, in the
//! order they arrived, once the renewal concludes.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

use crate::session::Token;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("token refresh failed")]
pub struct RefreshRejected;

pub type RefreshOutcome = Result<Token, RefreshRejected>;

type WaiterCallback = Box<dyn FnOnce(RefreshOutcome) + Send>;

#[derive(Default)]
struct RefreshState {
    in_flight: bool,
    waiters: VecDeque<WaiterCallback>,
}

/// Shared renewal state. Clones observe the same flag and queue.
#[derive(Clone, Default)]
pub struct RefreshCoordinator {
    state: Arc<Mutex<RefreshState>>,
}

impl std::fmt::Debug for RefreshCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("RefreshCoordinator")
            .field("in_flight", &state.in_flight)
            .field("waiting", &state.waiters.len())
            .finish()
    }
}

pub enum RefreshClaim {
    /// This caller performs the renewal.
    Leader(RefreshGuard),
    /// A renewal is already running; await its result.
    Follower(Waiter),
}

impl RefreshCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically either takes the renewal or joins the queue behind the
    /// one already running.
    pub fn claim(&self) -> RefreshClaim {
        let mut state = self.lock();
        if state.in_flight {
            RefreshClaim::Follower(Self::push_waiter(&mut state))
        } else {
            state.in_flight = true;
            RefreshClaim::Leader(RefreshGuard {
                coordinator: self.clone(),
                finished: false,
            })
        }
    }

    /// Sets the in-flight flag. Returns `false` if a renewal is already running.
    pub fn acquire_refresh(&self) -> bool {
        let mut state = self.lock();
        if state.in_flight {
            false
        } else {
            state.in_flight = true;
            true
        }
    }

    pub fn enqueue_waiter(&self) -> Waiter {
        Self::push_waiter(&mut self.lock())
    }

    /// Queues a callback that is invoked with the renewal outcome.
    pub fn enqueue_with(&self, callback: impl FnOnce(RefreshOutcome) + Send + 'static) {
        self.lock().waiters.push_back(Box::new(callback));
    }

    /// Clears the flag and hands `token` to every queued waiter in FIFO order.
    /// Returns how many waiters were released.
    pub fn release_refresh(&self, token: &Token) -> usize {
        self.conclude(&Ok(token.clone()))
    }

    /// Clears the flag and rejects every queued waiter.
    pub fn fail_refresh(&self) -> usize {
        self.conclude(&Err(RefreshRejected))
    }

    pub fn is_in_flight(&self) -> bool {
        self.lock().in_flight
    }

    pub fn waiting(&self) -> usize {
        self.lock().waiters.len()
    }

    fn conclude(&self, outcome: &RefreshOutcome) -> usize {
        let waiters = {
            let mut state = self.lock();
            state.in_flight = false;
            std::mem::take(&mut state.waiters)
        };
        let released = waiters.len();
        for callback in waiters {
            callback(outcome.clone());
        }
        debug!(released, ok = outcome.is_ok(), "refresh concluded");
        released
    }

    fn push_waiter(state: &mut RefreshState) -> Waiter {
        let (tx, rx) = oneshot::channel();
        state.waiters.push_back(Box::new(move |outcome| {
            // Receiver may have been dropped by a cancelled request.
            let _ = tx.send(outcome);
        }));
        Waiter { rx }
    }

    fn lock(&self) -> MutexGuard<'_, RefreshState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Held by the caller performing the renewal. Dropping it without calling
/// [`RefreshGuard::succeed`] rejects the queue, so a cancelled or panicking
/// renewal never strands waiters.
pub struct RefreshGuard {
    coordinator: RefreshCoordinator,
    finished: bool,
}

impl RefreshGuard {
    pub fn succeed(mut self, token: &Token) -> usize {
        self.finished = true;
        self.coordinator.release_refresh(token)
    }

    pub fn fail(mut self) -> usize {
        self.finished = true;
        self.coordinator.fail_refresh()
    }
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.coordinator.fail_refresh();
        }
    }
}

/// Resolves to the renewed token, or [`RefreshRejected`].
#[must_use = "a waiter does nothing unless awaited"]
pub struct Waiter {
    rx: oneshot::Receiver<RefreshOutcome>,
}

impl Future for Waiter {
    type Output = RefreshOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(RefreshRejected)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn token(value: &str) -> Token {
        Token::parse(value).unwrap()
    }

    #[test]
    fn second_claim_becomes_follower() {
        let coordinator = RefreshCoordinator::new();
        let first = coordinator.claim();
        assert!(matches!(first, RefreshClaim::Leader(_)));
        assert!(matches!(coordinator.claim(), RefreshClaim::Follower(_)));
        assert_eq!(coordinator.waiting(), 1);
    }

    #[test]
    fn acquire_is_exclusive_until_released() {
        let coordinator = RefreshCoordinator::new();
        assert!(coordinator.acquire_refresh());
        assert!(!coordinator.acquire_refresh());
        coordinator.release_refresh(&token("t"));
        assert!(!coordinator.is_in_flight());
        assert!(coordinator.acquire_refresh());
    }

    #[tokio::test]
    async fn waiters_receive_the_renewed_token() {
        let coordinator = RefreshCoordinator::new();
        let RefreshClaim::Leader(guard) = coordinator.claim() else {
            panic!("expected leader");
        };
        let RefreshClaim::Follower(w1) = coordinator.claim() else {
            panic!("expected follower");
        };
        let w2 = coordinator.enqueue_waiter();

        assert_eq!(guard.succeed(&token("fresh")), 2);
        assert_eq!(w1.await, Ok(token("fresh")));
        assert_eq!(w2.await, Ok(token("fresh")));
        assert!(!coordinator.is_in_flight());
    }

    #[tokio::test]
    async fn failure_rejects_waiters_and_clears_flag() {
        let coordinator = RefreshCoordinator::new();
        let RefreshClaim::Leader(guard) = coordinator.claim() else {
            panic!("expected leader");
        };
        let waiter = coordinator.enqueue_waiter();

        guard.fail();

        assert_eq!(waiter.await, Err(RefreshRejected));
        assert!(!coordinator.is_in_flight());
        assert_eq!(coordinator.waiting(), 0);
    }

    #[tokio::test]
    async fn dropped_guard_rejects_waiters() {
        let coordinator = RefreshCoordinator::new();
        let waiter = {
            let _guard = coordinator.claim();
            coordinator.enqueue_waiter()
        };
        assert_eq!(waiter.await, Err(RefreshRejected));
        assert!(!coordinator.is_in_flight());
    }

    #[test]
    fn dropped_waiter_does_not_block_release() {
        let coordinator = RefreshCoordinator::new();
        coordinator.acquire_refresh();
        drop(coordinator.enqueue_waiter());
        assert_eq!(coordinator.release_refresh(&token("t")), 1);
    }

    proptest! {
        #[test]
        fn waiters_are_released_in_enqueue_order(count in 0usize..40, succeed in any::<bool>()) {
            let coordinator = RefreshCoordinator::new();
            prop_assert!(coordinator.acquire_refresh());

            let order = Arc::new(Mutex::new(Vec::new()));
            for i in 0..count {
                let order = order.clone();
                coordinator.enqueue_with(move |outcome| {
                    order.lock().unwrap().push((i, outcome.is_ok()));
                });
            }

            let released = if succeed {
                coordinator.release_refresh(&token("t"))
            } else {
                coordinator.fail_refresh()
            };

            prop_assert_eq!(released, count);
            let observed = order.lock().unwrap().clone();
            let expected: Vec<_> = (0..count).map(|i| (i, succeed)).collect();
            prop_assert_eq!(observed, expected);
            prop_assert!(!coordinator.is_in_flight());
        }
    }
}
