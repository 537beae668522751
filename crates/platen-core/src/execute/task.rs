//! Single-resolution result slots for queued work.
//!
//! A [`Promise`] is the writer half (held by the executor and, for
//! cancellable requests, the cancellation callback); a [`TaskHandle`] is the
//! caller's waiter half. The slot resolves exactly once: `complete`,
//! `fault` and `cancel` are mutually exclusive and the first writer wins —
//! later writers are no-ops, so firing a cancellation after completion is
//! safe.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::error::{Error, Result};

/// Final state of one submitted request.
#[derive(Debug)]
pub enum Outcome<R> {
    Completed(R),
    Faulted(Error),
    /// Cancelled before or during execution; distinct from a fault.
    Cancelled,
}

enum SlotState<R> {
    Pending,
    Resolved(Outcome<R>),
    /// Outcome already consumed by a waiter.
    Taken,
}

struct Slot<R> {
    state: Mutex<SlotState<R>>,
    done: Condvar,
}

impl<R> Slot<R> {
    fn resolve(&self, outcome: Outcome<R>) -> bool {
        let mut state = self.state.lock().unwrap();
        match *state {
            SlotState::Pending => {
                *state = SlotState::Resolved(outcome);
                self.done.notify_all();
                true
            }
            _ => false,
        }
    }
}

/// Writer half of a result slot.
pub struct Promise<R> {
    slot: Arc<Slot<R>>,
}

impl<R> Clone for Promise<R> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<R> Promise<R> {
    /// Resolve with a result. Returns false if already resolved.
    pub fn complete(&self, value: R) -> bool {
        self.slot.resolve(Outcome::Completed(value))
    }

    /// Resolve with a fault. Returns false if already resolved.
    pub fn fault(&self, error: Error) -> bool {
        self.slot.resolve(Outcome::Faulted(error))
    }

    /// Resolve as cancelled. Returns false if already resolved.
    pub fn cancel(&self) -> bool {
        self.slot.resolve(Outcome::Cancelled)
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(*self.slot.state.lock().unwrap(), SlotState::Pending)
    }
}

/// Waiter half of a result slot.
pub struct TaskHandle<R> {
    slot: Arc<Slot<R>>,
}

impl<R> TaskHandle<R> {
    /// Block until resolved; cancellation surfaces as [`Error::Cancelled`].
    pub fn wait(self) -> Result<R> {
        match self.wait_outcome() {
            Outcome::Completed(value) => Ok(value),
            Outcome::Faulted(error) => Err(error),
            Outcome::Cancelled => Err(Error::Cancelled),
        }
    }

    /// Block until resolved and return the raw outcome.
    pub fn wait_outcome(self) -> Outcome<R> {
        let mut state = self.slot.state.lock().unwrap();
        loop {
            match std::mem::replace(&mut *state, SlotState::Taken) {
                SlotState::Resolved(outcome) => return outcome,
                SlotState::Taken => unreachable!("outcome taken twice"),
                SlotState::Pending => {
                    *state = SlotState::Pending;
                    state = self.slot.done.wait(state).unwrap();
                }
            }
        }
    }

    /// Like [`wait_outcome`](Self::wait_outcome) with a deadline; returns
    /// the handle back on timeout.
    pub fn wait_outcome_timeout(self, timeout: Duration) -> std::result::Result<Outcome<R>, Self> {
        let state = self.slot.state.lock().unwrap();
        let (mut state, _) = self
            .slot
            .done
            .wait_timeout_while(state, timeout, |s| matches!(s, SlotState::Pending))
            .unwrap();
        match std::mem::replace(&mut *state, SlotState::Taken) {
            SlotState::Resolved(outcome) => Ok(outcome),
            other => {
                *state = other;
                drop(state);
                Err(self)
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        !matches!(*self.slot.state.lock().unwrap(), SlotState::Pending)
    }
}

/// A fresh slot as (writer, waiter) halves.
pub fn result_slot<R>() -> (Promise<R>, TaskHandle<R>) {
    let slot = Arc::new(Slot {
        state: Mutex::new(SlotState::Pending),
        done: Condvar::new(),
    });
    (
        Promise { slot: slot.clone() },
        TaskHandle { slot },
    )
}
