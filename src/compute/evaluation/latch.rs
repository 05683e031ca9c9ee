//! One-shot value hand-off between a computing thread and its waiters.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// A value published once and read by any number of waiters.
#[derive(Debug)]
pub(crate) struct Latch<T> {
    value: Mutex<Option<T>>,
    ready: Condvar,
}

impl<T: Clone> Latch<T> {
    pub(crate) fn new() -> Self {
        Self {
            value: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<T>> {
        self.value.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish the value and wake every waiter. Later calls are ignored.
    pub(crate) fn publish(&self, value: T) {
        let mut slot = self.lock();
        if slot.is_none() {
            *slot = Some(value);
            self.ready.notify_all();
        }
    }

    pub(crate) fn is_published(&self) -> bool {
        self.lock().is_some()
    }

    /// Block until the value is published or `until` passes.
    ///
    /// Returns `None` only on timeout.
    pub(crate) fn wait(&self, until: Option<Instant>) -> Option<T> {
        let mut slot = self.lock();
        loop {
            if let Some(value) = slot.as_ref() {
                return Some(value.clone());
            }
            match until {
                None => {
                    slot = self
                        .ready
                        .wait(slot)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(until) => {
                    let remaining = until.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return None;
                    }
                    slot = self
                        .ready
                        .wait_timeout(slot, remaining)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
    }
}
