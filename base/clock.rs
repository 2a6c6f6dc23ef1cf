// This file is part of Vigil, a streaming video compliance monitor.
// Copyright (C) 2025 The Vigil Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Clock interface and implementations for testability.
//!
//! Wall-clock reads (live timestamp synthesis, report stamps, checklist
//! expiry) go through [`Clocks`] so tests can drive time deterministically.
//! Purely async waits (retry backoff, rate-limit refill) use `tokio::time`
//! and are tested with paused runtimes instead.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::Mutex;

/// Abstract interface to the system clocks. This is for testability.
pub trait Clocks: Send + Sync + 'static {
    /// Gets the current wall-clock time.
    fn realtime(&self) -> jiff::Timestamp;

    /// Gets the time since an arbitrary epoch from a monotonic clock.
    fn monotonic(&self) -> Duration;

    /// Causes the current thread to sleep for the specified time.
    fn sleep(&self, how_long: Duration);
}

impl<C: Clocks + ?Sized> Clocks for Arc<C> {
    fn realtime(&self) -> jiff::Timestamp {
        (**self).realtime()
    }

    fn monotonic(&self) -> Duration {
        (**self).monotonic()
    }

    fn sleep(&self, how_long: Duration) {
        (**self).sleep(how_long)
    }
}

#[derive(Clone)]
pub struct RealClocks {
    epoch: Instant,
}

impl RealClocks {
    pub fn new() -> Self {
        RealClocks {
            epoch: Instant::now(),
        }
    }
}

impl Default for RealClocks {
    fn default() -> Self {
        Self::new()
    }
}

impl Clocks for RealClocks {
    fn realtime(&self) -> jiff::Timestamp {
        jiff::Timestamp::now()
    }

    fn monotonic(&self) -> Duration {
        self.epoch.elapsed()
    }

    fn sleep(&self, how_long: Duration) {
        std::thread::sleep(how_long)
    }
}

/// Logs a warning if the `TimerGuard` lives "too long", using the label
/// created by a supplied function.
pub struct TimerGuard<'a, C: Clocks + ?Sized, S: AsRef<str>, F: FnOnce() -> S + 'a> {
    clocks: &'a C,
    label_f: Option<F>,
    start: Duration,
}

impl<'a, C: Clocks + ?Sized, S: AsRef<str>, F: FnOnce() -> S + 'a> TimerGuard<'a, C, S, F> {
    pub fn new(clocks: &'a C, label_f: F) -> Self {
        TimerGuard {
            clocks,
            label_f: Some(label_f),
            start: clocks.monotonic(),
        }
    }
}

impl<'a, C, S, F> Drop for TimerGuard<'a, C, S, F>
where
    C: Clocks + ?Sized,
    S: AsRef<str>,
    F: FnOnce() -> S + 'a,
{
    fn drop(&mut self) {
        let elapsed = self.clocks.monotonic().saturating_sub(self.start);
        if elapsed.as_secs() >= 1 {
            let label_f = self.label_f.take().unwrap();
            warn!("{} took {:?}!", label_f().as_ref(), elapsed);
        }
    }
}

/// Simulated clock for testing. `sleep` advances time without blocking.
#[derive(Clone)]
pub struct SimulatedClocks(Arc<SimulatedClocksInner>);

struct SimulatedClocksInner {
    boot: jiff::Timestamp,
    uptime: Mutex<Duration>,
}

impl SimulatedClocks {
    pub fn new(boot: jiff::Timestamp) -> Self {
        SimulatedClocks(Arc::new(SimulatedClocksInner {
            boot,
            uptime: Mutex::new(Duration::ZERO),
        }))
    }
}

impl Clocks for SimulatedClocks {
    fn realtime(&self) -> jiff::Timestamp {
        let uptime = *self.0.uptime.lock();
        self.0.boot + jiff::SignedDuration::try_from(uptime).expect("uptime fits")
    }

    fn monotonic(&self) -> Duration {
        *self.0.uptime.lock()
    }

    /// Advances the clock by the specified amount without actually sleeping.
    fn sleep(&self, how_long: Duration) {
        let mut l = self.0.uptime.lock();
        *l += how_long;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_advances_on_sleep() {
        let boot: jiff::Timestamp = "2025-04-26T00:00:00Z".parse().unwrap();
        let c = SimulatedClocks::new(boot);
        assert_eq!(c.monotonic(), Duration::ZERO);
        c.sleep(Duration::from_secs(90));
        assert_eq!(c.monotonic(), Duration::from_secs(90));
        assert_eq!(c.realtime(), boot + jiff::SignedDuration::from_secs(90));
    }

    #[test]
    fn real_monotonic_is_nondecreasing() {
        let c = RealClocks::new();
        let a = c.monotonic();
        let b = c.monotonic();
        assert!(b >= a);
    }
}
