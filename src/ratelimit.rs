// This file is part of Vigil, a streaming video compliance monitor.
// Copyright (C) 2025 The Vigil Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Process-global rate limiting for remote model calls.
//!
//! One token-bucket service per provider name, shared by every session in
//! the process: provider-side RPM/RPH limits don't care how many cameras we
//! happen to be watching. Acquisition blocks until refill or cancellation.

use base::{err, Error};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Copy, Clone, Debug)]
pub struct RateLimits {
    pub per_minute: u32,
    pub per_hour: u32,
}

struct Window {
    length: Duration,
    limit: u32,
    started: Instant,
    count: u32,
}

impl Window {
    fn new(length: Duration, limit: u32, now: Instant) -> Self {
        Window {
            length,
            limit,
            started: now,
            count: 0,
        }
    }

    /// Rolls the window forward if it has elapsed, then reports whether a
    /// token is available, or when the next one will be.
    fn check(&mut self, now: Instant) -> Result<(), Instant> {
        if now.duration_since(self.started) >= self.length {
            self.started = now;
            self.count = 0;
        }
        if self.count < self.limit {
            Ok(())
        } else {
            Err(self.started + self.length)
        }
    }
}

struct State {
    minute: Window,
    hour: Window,
}

pub struct RateLimiter {
    name: String,
    state: base::Mutex<State>,
}

impl RateLimiter {
    pub fn new(name: &str, limits: RateLimits) -> Self {
        let now = Instant::now();
        RateLimiter {
            name: name.to_owned(),
            state: base::Mutex::new(State {
                minute: Window::new(Duration::from_secs(60), limits.per_minute, now),
                hour: Window::new(Duration::from_secs(3600), limits.per_hour, now),
            }),
        }
    }

    /// Returns the process-wide limiter for `name`, creating it with
    /// `limits` on first use. Later callers share the first bucket even if
    /// their configured limits differ; provider limits are global by nature.
    pub fn global(name: &str, limits: RateLimits) -> Arc<RateLimiter> {
        static REGISTRY: OnceLock<base::Mutex<HashMap<String, Arc<RateLimiter>>>> =
            OnceLock::new();
        let registry = REGISTRY.get_or_init(|| base::Mutex::new(HashMap::new()));
        let mut l = registry.lock();
        l.entry(name.to_owned())
            .or_insert_with(|| Arc::new(RateLimiter::new(name, limits)))
            .clone()
    }

    /// Takes one token from both windows, or reports when to retry.
    fn try_acquire(&self) -> Result<(), Instant> {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.minute.check(now)?;
        state.hour.check(now)?;
        state.minute.count += 1;
        state.hour.count += 1;
        Ok(())
    }

    /// Blocks until a token is available or the session is cancelled.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), Error> {
        loop {
            let retry_at = match self.try_acquire() {
                Ok(()) => return Ok(()),
                Err(at) => at,
            };
            debug!(
                provider = %self.name,
                wait = ?retry_at.saturating_duration_since(Instant::now()),
                "rate limited; waiting for refill"
            );
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(err!(Cancelled, msg("cancelled while rate limited")));
                }
                _ = tokio::time::sleep_until(retry_at) => {}
            }
        }
    }

    /// Clears usage counters, e.g. from the process-wide state reset.
    pub fn reset(&self) {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.minute.started = now;
        state.minute.count = 0;
        state.hour.started = now;
        state.hour.count = 0;
    }
}
