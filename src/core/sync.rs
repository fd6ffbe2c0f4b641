// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Synchronization primitives

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Instant;

/// An ergonomic wrapper around a [`Mutex`]-[`Condvar`] pair.
pub struct Status<T> {
    mutex: Mutex<T>,
    condvar: Condvar,
}

impl<T> Status<T> {
    /// Creates a new status initialized with the given value.
    pub fn new(t: T) -> Self {
        Self {
            mutex: Mutex::new(t),
            condvar: Condvar::new(),
        }
    }

    /// Locks the status without waiting on any condition.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.mutex.lock().unwrap()
    }

    /// Applies the given function to the status and notifies all waiting
    /// threads.
    pub fn update_all<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let result = f(&mut *self.mutex.lock().unwrap());
        self.condvar.notify_all();
        result
    }

    /// Waits until the predicate is false on this status.
    ///
    /// This returns a [`MutexGuard`], allowing to further inspect or modify the
    /// status.
    pub fn wait_while(&self, predicate: impl FnMut(&mut T) -> bool) -> MutexGuard<'_, T> {
        self.condvar
            .wait_while(self.mutex.lock().unwrap(), predicate)
            .unwrap()
    }

    /// Waits until the predicate is false on this status, or until the given
    /// deadline passes.
    ///
    /// The returned boolean is true if the deadline passed while the predicate
    /// was still true.
    pub fn wait_while_until(
        &self,
        deadline: Instant,
        mut predicate: impl FnMut(&mut T) -> bool,
    ) -> (MutexGuard<'_, T>, bool) {
        let mut guard = self.mutex.lock().unwrap();
        loop {
            if !predicate(&mut guard) {
                return (guard, false);
            }
            let now = Instant::now();
            if now >= deadline {
                return (guard, true);
            }
            guard = self.condvar.wait_timeout(guard, deadline - now).unwrap().0;
        }
    }
}

/// State of a [`Channel`], protected by its mutex.
struct ChannelState<T> {
    /// Values sent but not yet received, in FIFO order.
    queue: VecDeque<T>,
    /// Whether the channel refuses new values.
    closed: bool,
}

/// An unbounded multi-producer multi-consumer FIFO channel that can be
/// closed.
///
/// Closing is a graceful signal: values already queued are still handed out by
/// [`recv()`](Self::recv), which only returns [`None`] once the channel is
/// both closed and empty.
pub struct Channel<T> {
    status: Status<ChannelState<T>>,
}

impl<T> Channel<T> {
    /// Creates a new open and empty channel.
    pub fn new() -> Self {
        Self {
            status: Status::new(ChannelState {
                queue: VecDeque::new(),
                closed: false,
            }),
        }
    }

    /// Sends a value and wakes up one receiver. Hands the value back if the
    /// channel is closed.
    pub fn send(&self, value: T) -> Result<(), T> {
        self.send_with(value, |value| value)
    }

    /// Converts the given value with `wrap` and sends the result, waking up
    /// one receiver. Hands the original value back (without calling `wrap`)
    /// if the channel is closed.
    ///
    /// The closed check and the push happen under the same lock, so a value
    /// accepted here is guaranteed to be received by a draining consumer.
    pub fn send_with<U>(&self, value: U, wrap: impl FnOnce(U) -> T) -> Result<(), U> {
        {
            let mut state = self.status.lock();
            if state.closed {
                return Err(value);
            }
            state.queue.push_back(wrap(value));
        }
        self.status.condvar.notify_one();
        Ok(())
    }

    /// Blocks until a value is available and returns it, or returns [`None`]
    /// once the channel is closed and drained.
    pub fn recv(&self) -> Option<T> {
        let mut state = self
            .status
            .wait_while(|state| state.queue.is_empty() && !state.closed);
        state.queue.pop_front()
    }

    /// Closes the channel and wakes up all receivers. Idempotent.
    pub fn close(&self) {
        self.status.update_all(|state| state.closed = true);
    }

    /// Returns whether the channel was closed.
    pub fn is_closed(&self) -> bool {
        self.status.lock().closed
    }

    /// Returns the number of queued values.
    pub fn len(&self) -> usize {
        self.status.lock().queue.len()
    }
}

impl<T> Default for Channel<T> {
    fn default() -> Self {
        Self::new()
    }
}
