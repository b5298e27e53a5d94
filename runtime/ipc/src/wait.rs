// Licensed under the Apache-2.0 license

use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Wakes threads waiting for the peer to make progress.
///
/// The local interrupt handler pokes the notifier whenever the peer shows
/// activity. Waiters still re-check their condition every `interval`
/// because the peer may drain a ring without raising an interrupt.
#[derive(Default)]
pub struct Notifier {
    generation: Mutex<u64>,
    cv: Condvar,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify_all(&self) {
        *self.generation.lock().unwrap() += 1;
        self.cv.notify_all();
    }

    /// Waits until `ready` returns true, re-checking after every
    /// notification and at least every `interval`, for at most `tries`
    /// intervals. Returns the last value of `ready`.
    pub fn wait_until<F>(&self, tries: u32, interval: Duration, mut ready: F) -> bool
    where
        F: FnMut() -> bool,
    {
        for _ in 0..tries {
            let generation = self.generation.lock().unwrap();
            if ready() {
                return true;
            }
            let seen = *generation;
            let _ = self
                .cv
                .wait_timeout_while(generation, interval, |g| *g == seen)
                .unwrap();
        }
        ready()
    }

    /// Same as [`Notifier::wait_until`] with a total timeout instead of a
    /// try count.
    pub fn wait_for<F>(&self, timeout: Duration, interval: Duration, ready: F) -> bool
    where
        F: FnMut() -> bool,
    {
        let interval = interval.max(Duration::from_micros(100));
        let tries = timeout.as_micros().div_ceil(interval.as_micros()).max(1);
        self.wait_until(tries.min(u32::MAX as u128) as u32, interval, ready)
    }
}
