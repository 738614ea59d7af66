//! Error types for limiter construction and request admission.

use std::fmt;
use std::time::Duration;

/// Rejected configuration, reported once at construction time.
///
/// Request handling never produces a `BuildError`: every bound below is
/// checked before a store, tagger, or middleware is handed to callers.
#[derive(Debug, Clone, PartialEq)]
pub enum BuildError {
    /// Token budget outside `[1, 2^32]` or not finite.
    InvalidTokens(f64),
    /// Replenishment interval outside `[20ms, 24h]`.
    InvalidInterval(Duration),
    /// Bucket depth override that is zero, negative, or not finite.
    InvalidBurst(f64),
    /// Pre-allocation hint outside `[64, 2^32]`.
    InvalidInitialCapacity(usize),
    /// Purge frequency outside `[1s, 1h]`.
    InvalidCleanupInterval(Duration),
    /// Cookie or header name with characters outside the token charset.
    InvalidName(String),
    /// SQL table name that does not match `^\w+$`.
    InvalidTable(String),
    /// Two limiters registered under the same name.
    DuplicateName(String),
    /// A middleware with no limiters at all.
    NoLimiters,
    /// A skip list with no entries, or a repeated entry.
    InvalidSkipList(String),
    /// The limiter table could not be created at startup.
    Schema(String),
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidTokens(tokens) => {
                write!(f, "token budget must be a finite number in [1, 2^32] (got {})", tokens)
            }
            Self::InvalidInterval(interval) => {
                write!(f, "rate interval must be within [20ms, 24h] (got {:?})", interval)
            }
            Self::InvalidBurst(burst) => {
                write!(f, "burst limit must be a finite number greater than zero (got {})", burst)
            }
            Self::InvalidInitialCapacity(capacity) => {
                write!(f, "initial capacity must be within [64, 2^32] (got {})", capacity)
            }
            Self::InvalidCleanupInterval(interval) => {
                write!(f, "cleanup interval must be within [1s, 1h] (got {:?})", interval)
            }
            Self::InvalidName(name) => write!(f, "invalid cookie or header name: {:?}", name),
            Self::InvalidTable(table) => write!(f, "invalid table name: {:?}", table),
            Self::DuplicateName(name) => write!(f, "limiter {:?} is already registered", name),
            Self::NoLimiters => write!(f, "at least one request limiter is required"),
            Self::InvalidSkipList(reason) => write!(f, "invalid skip list: {}", reason),
            Self::Schema(reason) => write!(f, "cannot create limiter table: {}", reason),
        }
    }
}

impl std::error::Error for BuildError {}

/// A transport failure while admitting a single request.
///
/// Running out of tokens is *not* an error; that is [`Decision::Denied`].
/// A `LimiterError` is fatal for the current request only and never poisons
/// the limiter that produced it.
///
/// [`Decision::Denied`]: crate::Decision::Denied
#[derive(Debug)]
pub enum LimiterError {
    /// The request carried no usable peer address.
    PeerAddress,
    /// The relational store failed or the transaction was interrupted.
    Database(sqlx::Error),
}

impl LimiterError {
    /// True when the failure came from the storage backend.
    pub fn is_database(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

impl fmt::Display for LimiterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerAddress => write!(f, "request has no usable peer address"),
            Self::Database(e) => write!(f, "rate limiter storage failed: {}", e),
        }
    }
}

impl std::error::Error for LimiterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Database(e) => Some(e),
            Self::PeerAddress => None,
        }
    }
}

impl From<sqlx::Error> for LimiterError {
    fn from(e: sqlx::Error) -> Self {
        Self::Database(e)
    }
}
