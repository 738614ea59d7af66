//! Tag-keyed bucket stores with background eviction.
//!
//! Two interchangeable backends implement [`Limiter`](crate::Limiter):
//! - [`MemoryStore`](memory::MemoryStore): a mutex-guarded map of
//!   [`LeakyBucket`](crate::LeakyBucket)s, for single-process deployments.
//! - [`SqlStore`](sql::SqlStore): leaky-bucket state as one row per tag in a
//!   relational table, for deployments that share a limit across processes.
//!
//! Both spawn a janitor task that periodically evicts buckets left untouched
//! for longer than one rate interval. An absent bucket is indistinguishable
//! from a full one, so eviction never changes observable balances.

pub mod memory;
pub mod sql;

use std::time::Duration;

use crate::error::BuildError;

/// Default purge frequency for both backends.
pub(crate) const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(11 * 60);

/// Default pre-allocation hint for the in-memory map.
pub(crate) const DEFAULT_INITIAL_CAPACITY: usize = 1024;

pub(crate) fn validate_burst(burst: f64) -> Result<f64, BuildError> {
    if !burst.is_finite() || burst <= 0.0 {
        return Err(BuildError::InvalidBurst(burst));
    }
    Ok(burst)
}

pub(crate) fn validate_cleanup_interval(every: Duration) -> Result<Duration, BuildError> {
    if !(Duration::from_secs(1)..=Duration::from_secs(60 * 60)).contains(&every) {
        return Err(BuildError::InvalidCleanupInterval(every));
    }
    Ok(every)
}

pub(crate) fn validate_initial_capacity(capacity: usize) -> Result<usize, BuildError> {
    if capacity < 64 || capacity as u64 > 1 << 32 {
        return Err(BuildError::InvalidInitialCapacity(capacity));
    }
    Ok(capacity)
}

/// Table names are interpolated into SQL, so only `^\w+$` is accepted.
pub(crate) fn validate_table(table: &str) -> Result<(), BuildError> {
    if table.is_empty() || !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(BuildError::InvalidTable(table.to_string()));
    }
    Ok(())
}
