//! The tag-keyed limiter contract shared by every storage backend.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::LimiterError;
use crate::rate::Rate;

/// The outcome of one withdrawal attempt.
///
/// Both variants carry the token balance left for the tag so callers can
/// report the tightest remaining budget across several limiters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    /// Tokens were withdrawn; the request may proceed.
    Allowed {
        /// Balance left after the withdrawal.
        remaining: f64,
    },
    /// The tag's bucket ran dry; nothing was withdrawn.
    Denied {
        /// Balance the bucket would need to cover the withdrawal from.
        remaining: f64,
    },
}

impl Decision {
    /// True when the withdrawal happened.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }

    /// The token balance carried by either variant.
    pub fn remaining(&self) -> f64 {
        match self {
            Self::Allowed { remaining } | Self::Denied { remaining } => *remaining,
        }
    }
}

/// A tag-keyed token store constrained to a [`Rate`].
///
/// Implementations must be safe under concurrent `take` calls from many
/// workers; within one tag, takes are totally ordered by the store's lock or
/// by its database. Cancellation is cooperative: dropping the returned
/// future before completion must never debit tokens.
#[async_trait]
pub trait Limiter: Send + Sync {
    /// The steady-state rate this limiter enforces.
    fn rate(&self) -> &Rate;

    /// Withdraw `tokens` from the bucket keyed by `tag`.
    ///
    /// An exhausted bucket is a [`Decision::Denied`], not an error; `Err` is
    /// reserved for transport failures.
    async fn take(&self, tag: &str, tokens: f64) -> Result<Decision, LimiterError>;

    /// Read the balance for `tag` without withdrawing anything.
    ///
    /// A tag with no bucket reports the burst limit; callers cannot tell an
    /// absent bucket from a full one, so purging idle buckets never changes
    /// an observable balance.
    async fn remaining(&self, tag: &str) -> Result<f64, LimiterError>;
}

#[async_trait]
impl<L: Limiter + ?Sized> Limiter for Arc<L> {
    fn rate(&self) -> &Rate {
        (**self).rate()
    }

    async fn take(&self, tag: &str, tokens: f64) -> Result<Decision, LimiterError> {
        (**self).take(tag, tokens).await
    }

    async fn remaining(&self, tag: &str) -> Result<f64, LimiterError> {
        (**self).remaining(tag).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_exposes_both_fields() {
        let allowed = Decision::Allowed { remaining: 3.5 };
        assert!(allowed.is_allowed());
        assert_eq!(allowed.remaining(), 3.5);

        let denied = Decision::Denied { remaining: 0.25 };
        assert!(!denied.is_allowed());
        assert_eq!(denied.remaining(), 0.25);
    }
}
