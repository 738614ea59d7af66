//! Clock abstractions used by bucket stores.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Thread-safe monotonic time source.
///
/// Stores read the clock once per operation and feed the reading into bucket
/// refill math, so a non-decreasing sequence of readings guarantees that no
/// bucket ever loses tokens to clock skew. Calls must be safe concurrently
/// (`Send + Sync`).
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// The current monotonic reading.
    fn now(&self) -> Instant;
}

/// The process clock, backed by [`Instant::now`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to, for deterministic tests.
///
/// Clones share the same reading; advancing one advances all of them.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<Instant>>,
}

impl ManualClock {
    /// A manual clock pinned to the current instant.
    pub fn starting_now() -> Self {
        Self { now: Arc::new(Mutex::new(Instant::now())) }
    }

    /// Move the clock forward by `step`.
    pub fn advance(&self, step: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += step;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap()
    }
}
