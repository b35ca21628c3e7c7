//! One in-flight operation, any number of waiters.
//!
//! The first caller of [`SingleFlight::join`] becomes the [`Leader`] and runs
//! the operation; callers arriving while it runs become [`Follower`]s and
//! receive a clone of the leader's result. A failed, abandoned or dropped
//! leader rejects every follower.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

struct FlightState<T> {
    in_flight: bool,
    waiters: Vec<oneshot::Sender<T>>,
}

pub struct SingleFlight<T> {
    state: Mutex<FlightState<T>>,
}

pub enum Flight<'a, T: Clone> {
    Leader(Leader<'a, T>),
    Follower(Follower<T>),
}

/// Owner of the in-flight operation. Must settle it with
/// [`complete`](Leader::complete); dropping it rejects all followers.
pub struct Leader<'a, T: Clone> {
    flight: &'a SingleFlight<T>,
    settled: bool,
}

/// A queued caller waiting on the leader.
pub struct Follower<T> {
    rx: oneshot::Receiver<T>,
}

impl<T: Clone> Default for SingleFlight<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> SingleFlight<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FlightState {
                in_flight: false,
                waiters: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FlightState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Become the leader if nothing is in flight, otherwise queue up.
    pub fn join(&self) -> Flight<'_, T> {
        let mut state = self.lock();
        if state.in_flight {
            let (tx, rx) = oneshot::channel();
            state.waiters.push(tx);
            Flight::Follower(Follower { rx })
        } else {
            state.in_flight = true;
            Flight::Leader(Leader {
                flight: self,
                settled: false,
            })
        }
    }

    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        self.lock().in_flight
    }

    /// Number of followers currently queued.
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.lock().waiters.len()
    }

    /// Reject every queued follower without ending the flight.
    /// Returns how many were rejected.
    pub fn abandon_waiters(&self) -> usize {
        let waiters = std::mem::take(&mut self.lock().waiters);
        waiters.len()
    }

    fn finish(&self, value: Option<T>) {
        let waiters = {
            let mut state = self.lock();
            state.in_flight = false;
            std::mem::take(&mut state.waiters)
        };
        if let Some(value) = value {
            for waiter in waiters {
                // A follower that stopped waiting is not an error.
                let _ = waiter.send(value.clone());
            }
        }
    }
}

impl<T: Clone> Leader<'_, T> {
    /// Settle the flight. `None` rejects every follower.
    pub fn complete(mut self, value: Option<T>) {
        self.settled = true;
        self.flight.finish(value);
    }
}

impl<T: Clone> Drop for Leader<'_, T> {
    fn drop(&mut self) {
        if !self.settled {
            self.flight.finish(None);
        }
    }
}

impl<T> Follower<T> {
    /// Wait for the leader. `None` means the flight failed or was abandoned.
    pub async fn wait(self) -> Option<T> {
        self.rx.await.ok()
    }
}
