//! Steady-state throughput expressed as a token budget over a time interval.

use std::fmt;
use std::time::{Duration, Instant};

use crate::error::BuildError;

/// Largest accepted token budget (`2^32`).
const MAX_TOKENS: f64 = 4_294_967_296.0;
/// Shortest accepted replenishment interval.
const MIN_INTERVAL: Duration = Duration::from_millis(20);
/// Longest accepted replenishment interval.
const MAX_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// An immutable throughput descriptor: `tokens` replenished per `interval`.
///
/// Constructed once, shared freely, never mutated. The derived
/// tokens-per-nanosecond figure drives all bucket refill math, and the token
/// budget doubles as the default bucket depth ([`Rate::burst`]).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rate {
    tokens: f64,
    interval: Duration,
    per_nanosecond: f64,
}

impl Rate {
    /// Create a validated `Rate` of `tokens` per `interval`.
    ///
    /// # Errors
    /// Returns [`BuildError::InvalidTokens`] unless `tokens` is finite and
    /// within `[1, 2^32]`, and [`BuildError::InvalidInterval`] unless
    /// `interval` is within `[20ms, 24h]`.
    pub fn new(tokens: f64, interval: Duration) -> Result<Self, BuildError> {
        if !tokens.is_finite() || !(1.0..=MAX_TOKENS).contains(&tokens) {
            return Err(BuildError::InvalidTokens(tokens));
        }
        if !(MIN_INTERVAL..=MAX_INTERVAL).contains(&interval) {
            return Err(BuildError::InvalidInterval(interval));
        }
        let per_nanosecond = tokens / interval.as_nanos() as f64;
        if !per_nanosecond.is_finite() || per_nanosecond <= 0.0 {
            return Err(BuildError::InvalidTokens(tokens));
        }
        Ok(Self { tokens, interval, per_nanosecond })
    }

    /// The token budget over one interval.
    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    /// The replenishment interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Tokens replenished per nanosecond; always finite and positive.
    pub fn per_nanosecond(&self) -> f64 {
        self.per_nanosecond
    }

    /// Tokens replenished per microsecond, for stores that persist
    /// microsecond timestamps.
    pub(crate) fn per_microsecond(&self) -> f64 {
        self.per_nanosecond * 1_000.0
    }

    /// Default bucket depth: one full interval worth of tokens.
    pub fn burst(&self) -> f64 {
        self.tokens
    }

    /// Fractional tokens replenished between two monotonic readings.
    ///
    /// A `to` earlier than `from` counts as zero elapsed time, so a skewed
    /// caller can never drain a bucket by reading time backwards.
    pub fn replenished(&self, from: Instant, to: Instant) -> f64 {
        to.saturating_duration_since(from).as_nanos() as f64 * self.per_nanosecond
    }

    /// Strictly greater throughput than `other`.
    pub fn faster_than(&self, other: &Rate) -> bool {
        self.per_nanosecond > other.per_nanosecond
    }

    /// Strictly lower throughput than `other`.
    pub fn slower_than(&self, other: &Rate) -> bool {
        self.per_nanosecond < other.per_nanosecond
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} per {:?}", self.tokens, self.interval)
    }
}
