//! Request-level limiters: the glue between a [`Tagger`] and a [`Limiter`].

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use http::request::Parts;

use crate::bucket::LeakyBucket;
use crate::clock::{Clock, SystemClock};
use crate::error::LimiterError;
use crate::limiter::{Decision, Limiter};
use crate::rate::Rate;
use crate::tag::{TagOutcome, Tagger};

/// Admits or rejects one HTTP request.
///
/// Exposes its [`Rate`] so a composite can pick a display rate for response
/// headers.
#[async_trait]
pub trait RequestLimiter: Send + Sync {
    /// The effective rate this limiter enforces.
    fn rate(&self) -> &Rate;

    /// Withdraw one token on behalf of the request head.
    async fn take(&self, head: &Parts) -> Result<Decision, LimiterError>;
}

/// The ordinary request limiter: derive a tag, take one token for it.
///
/// A [`TagOutcome::Skip`] from the tagger admits the request without
/// touching the store and reports a full bucket.
#[derive(Debug)]
pub struct TaggedLimiter<T, L> {
    tagger: T,
    limiter: L,
}

impl<T, L> TaggedLimiter<T, L> {
    /// Pair `tagger` with `limiter`.
    pub fn new(tagger: T, limiter: L) -> Self {
        Self { tagger, limiter }
    }
}

#[async_trait]
impl<T, L> RequestLimiter for TaggedLimiter<T, L>
where
    T: Tagger,
    L: Limiter,
{
    fn rate(&self) -> &Rate {
        self.limiter.rate()
    }

    async fn take(&self, head: &Parts) -> Result<Decision, LimiterError> {
        match self.tagger.tag(head)? {
            TagOutcome::Skip => Ok(Decision::Allowed { remaining: self.limiter.rate().burst() }),
            TagOutcome::Tag(tag) => self.limiter.take(&tag, 1.0).await,
        }
    }
}

/// Counts every request against one fixed tag.
///
/// Pair it with a store shared by other limiters to give "everything else"
/// a budget, or use it alone as a crude global throttle over a shared
/// store.
#[derive(Debug)]
pub struct StaticLimiter<L> {
    tag: String,
    limiter: L,
}

impl<L> StaticLimiter<L> {
    /// Count all requests under `tag`.
    pub fn new(tag: impl Into<String>, limiter: L) -> Self {
        Self { tag: tag.into(), limiter }
    }
}

#[async_trait]
impl<L: Limiter> RequestLimiter for StaticLimiter<L> {
    fn rate(&self) -> &Rate {
        self.limiter.rate()
    }

    async fn take(&self, _head: &Parts) -> Result<Decision, LimiterError> {
        self.limiter.take(&self.tag, 1.0).await
    }
}

/// Applies a tag predicate before debiting: tags the predicate rejects are
/// admitted with their current balance and cost nothing.
///
/// Unlike [`SkipList`](crate::SkipList), which short-circuits inside the
/// tagger, the bypass still reports the tag's live balance, so composites
/// keep an accurate least-remaining figure.
pub struct FilteredLimiter<T, L> {
    tagger: T,
    limiter: L,
    filter: Arc<dyn Fn(&str) -> bool + Send + Sync>,
}

impl<T, L> FilteredLimiter<T, L> {
    /// Limit only the tags for which `filter` returns `true`.
    pub fn new(tagger: T, limiter: L, filter: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        Self { tagger, limiter, filter: Arc::new(filter) }
    }
}

impl<T, L> std::fmt::Debug for FilteredLimiter<T, L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilteredLimiter").finish_non_exhaustive()
    }
}

#[async_trait]
impl<T, L> RequestLimiter for FilteredLimiter<T, L>
where
    T: Tagger,
    L: Limiter,
{
    fn rate(&self) -> &Rate {
        self.limiter.rate()
    }

    async fn take(&self, head: &Parts) -> Result<Decision, LimiterError> {
        match self.tagger.tag(head)? {
            TagOutcome::Skip => Ok(Decision::Allowed { remaining: self.limiter.rate().burst() }),
            TagOutcome::Tag(tag) => {
                if !(self.filter)(&tag) {
                    let remaining = self.limiter.remaining(&tag).await?;
                    return Ok(Decision::Allowed { remaining });
                }
                self.limiter.take(&tag, 1.0).await
            }
        }
    }
}

/// One mutex-guarded bucket shared by every request, for global throttling
/// without a tag map.
#[derive(Debug)]
pub struct SingleBucketLimiter {
    rate: Rate,
    burst: f64,
    clock: Arc<dyn Clock>,
    bucket: Mutex<LeakyBucket>,
}

impl SingleBucketLimiter {
    /// A full bucket replenishing at `rate`.
    pub fn new(rate: Rate) -> Self {
        Self::with_clock(rate, SystemClock)
    }

    /// Like [`new`](Self::new) with a substitute time source for tests.
    pub fn with_clock(rate: Rate, clock: impl Clock + 'static) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(clock);
        let bucket = Mutex::new(LeakyBucket::new(clock.now(), rate.burst()));
        Self { rate, burst: rate.burst(), clock, bucket }
    }
}

#[async_trait]
impl RequestLimiter for SingleBucketLimiter {
    fn rate(&self) -> &Rate {
        &self.rate
    }

    async fn take(&self, _head: &Parts) -> Result<Decision, LimiterError> {
        let now = self.clock.now();
        let mut bucket = self.bucket.lock().unwrap();
        bucket.refill(now, &self.rate, self.burst);
        let (remaining, ok) = bucket.take(1.0);
        Ok(if ok {
            Decision::Allowed { remaining }
        } else {
            Decision::Denied { remaining }
        })
    }
}

#[async_trait]
impl<R: RequestLimiter + ?Sized> RequestLimiter for Arc<R> {
    fn rate(&self) -> &Rate {
        (**self).rate()
    }

    async fn take(&self, head: &Parts) -> Result<Decision, LimiterError> {
        (**self).take(head).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::memory::MemoryStore;
    use crate::tag::{CookieTagger, MissingTag, PeerAddr, PeerIpTagger};
    use http::Request;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::time::Duration;

    fn head() -> Parts {
        Request::builder().uri("/").body(()).unwrap().into_parts().0
    }

    fn head_from(ip: [u8; 4]) -> Parts {
        let mut head = head();
        head.extensions.insert(PeerAddr(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3])),
            80,
        )));
        head
    }

    fn rate(tokens: f64, interval: Duration) -> Rate {
        Rate::new(tokens, interval).unwrap()
    }

    #[tokio::test]
    async fn tagged_limiter_buckets_by_tag() {
        let store = MemoryStore::new(rate(2.0, Duration::from_secs(1)));
        let limiter = TaggedLimiter::new(PeerIpTagger::new(), store);

        let first = head_from([10, 0, 0, 1]);
        assert!(limiter.take(&first).await.unwrap().is_allowed());
        assert!(limiter.take(&first).await.unwrap().is_allowed());
        assert!(!limiter.take(&first).await.unwrap().is_allowed());

        // A different peer draws from its own bucket.
        let second = head_from([10, 0, 0, 2]);
        assert!(limiter.take(&second).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn skip_admits_without_debiting() {
        let store = MemoryStore::new(rate(3.0, Duration::from_secs(1)));
        let tagger = CookieTagger::new("id").unwrap().when_missing(MissingTag::Skip);
        let limiter = TaggedLimiter::new(tagger, store);

        for _ in 0..10 {
            let decision = limiter.take(&head()).await.unwrap();
            assert!(decision.is_allowed());
            assert_eq!(decision.remaining(), 3.0);
        }
    }

    #[tokio::test]
    async fn static_limiter_pools_every_request() {
        let store = MemoryStore::new(rate(2.0, Duration::from_secs(1)));
        let limiter = StaticLimiter::new("global", store);

        assert!(limiter.take(&head()).await.unwrap().is_allowed());
        assert!(limiter.take(&head_from([9, 9, 9, 9])).await.unwrap().is_allowed());
        assert!(!limiter.take(&head()).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn filtered_limiter_bypasses_without_spending() {
        let store = Arc::new(MemoryStore::new(rate(5.0, Duration::from_secs(1))));
        let limiter = FilteredLimiter::new(PeerIpTagger::new(), store.clone(), |tag| {
            tag != "10.0.0.1"
        });

        let exempt = head_from([10, 0, 0, 1]);
        for _ in 0..10 {
            let decision = limiter.take(&exempt).await.unwrap();
            assert!(decision.is_allowed());
            assert_eq!(decision.remaining(), 5.0);
        }
        assert_eq!(store.remaining("10.0.0.1").await.unwrap(), 5.0);

        let limited = head_from([10, 0, 0, 2]);
        let decision = limiter.take(&limited).await.unwrap();
        assert!(decision.is_allowed());
        assert_eq!(decision.remaining(), 4.0);
    }

    #[tokio::test]
    async fn single_bucket_limiter_throttles_globally() {
        let clock = ManualClock::starting_now();
        let limiter = SingleBucketLimiter::with_clock(rate(2.0, Duration::from_secs(1)), clock.clone());

        assert!(limiter.take(&head()).await.unwrap().is_allowed());
        assert!(limiter.take(&head_from([1, 2, 3, 4])).await.unwrap().is_allowed());
        assert!(!limiter.take(&head()).await.unwrap().is_allowed());

        clock.advance(Duration::from_secs(1));
        assert!(limiter.take(&head()).await.unwrap().is_allowed());
    }
}
