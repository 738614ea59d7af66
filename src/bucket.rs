//! Per-tag token accounting.

use std::time::Instant;

use crate::rate::Rate;

/// Mutable token state for one tag.
///
/// A bucket refills continuously at a [`Rate`] up to a burst limit and hands
/// out tokens until it runs dry. All methods must be called under the owning
/// store's lock; the bucket itself holds no reference back to its store.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LeakyBucket {
    touched: Instant,
    tokens: f64,
}

impl LeakyBucket {
    /// A bucket created full at `at`.
    pub fn new(at: Instant, burst: f64) -> Self {
        Self { touched: at, tokens: burst }
    }

    /// The last time the bucket was refilled below burst or drawn from.
    ///
    /// A full bucket is never touched by [`refill`](Self::refill), so an idle
    /// tag stops advancing and becomes eligible for purging one interval
    /// after its last take.
    pub fn touched(&self) -> Instant {
        self.touched
    }

    /// Tokens currently in the bucket. Meaningful only after a refill.
    pub fn remaining(&self) -> f64 {
        self.tokens
    }

    /// Replenish tokens for the time elapsed since the last touch, clamped to
    /// `burst`. Refilling an already-full bucket is a no-op, leaving both the
    /// token count and the touch time unchanged.
    pub fn refill(&mut self, at: Instant, rate: &Rate, burst: f64) {
        if self.tokens < burst {
            self.tokens = (self.tokens + rate.replenished(self.touched, at)).min(burst);
            self.touched = at;
        }
    }

    /// Withdraw `tokens` if that many are available.
    ///
    /// Returns the balance after the call and whether the withdrawal
    /// happened. A short bucket is left untouched: the caller gets all of
    /// `tokens` or none of them.
    pub fn take(&mut self, tokens: f64) -> (f64, bool) {
        if self.tokens < tokens {
            return (self.tokens, false);
        }
        self.tokens -= tokens;
        (self.tokens, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 0.1
    }

    #[test]
    fn drains_and_replenishes_on_schedule() {
        let rate = Rate::new(9.0, Duration::from_secs(1)).unwrap();
        let t0 = Instant::now();
        let mut bucket = LeakyBucket::new(t0, rate.burst());

        // Three immediate takes drain three tokens.
        for expected in [8.0, 7.0, 6.0] {
            bucket.refill(t0, &rate, rate.burst());
            let (remaining, ok) = bucket.take(1.0);
            assert!(ok);
            assert!(close(remaining, expected), "got {remaining}, want {expected}");
        }

        // One ninth of the interval replenishes one token, which the next
        // take consumes again.
        let t1 = t0 + Duration::from_secs(1) / 9;
        bucket.refill(t1, &rate, rate.burst());
        let (remaining, ok) = bucket.take(1.0);
        assert!(ok);
        assert!(close(remaining, 6.0), "got {remaining}");

        // A full second later the bucket has clamped back to burst.
        let t2 = t0 + Duration::from_secs(1);
        bucket.refill(t2, &rate, rate.burst());
        let (remaining, ok) = bucket.take(1.0);
        assert!(ok);
        assert!(close(remaining, 8.0), "got {remaining}");
    }

    #[test]
    fn refill_on_full_bucket_changes_nothing() {
        let rate = Rate::new(5.0, Duration::from_millis(50)).unwrap();
        let t0 = Instant::now();
        let mut bucket = LeakyBucket::new(t0, rate.burst());

        for step in 1..10u32 {
            bucket.refill(t0 + Duration::from_millis(u64::from(step) * 100), &rate, rate.burst());
            assert_eq!(bucket.touched(), t0);
            assert_eq!(bucket.remaining(), rate.burst());
        }
    }

    #[test]
    fn take_is_all_or_nothing() {
        let rate = Rate::new(2.0, Duration::from_secs(1)).unwrap();
        let mut bucket = LeakyBucket::new(Instant::now(), rate.burst());

        let (_, ok) = bucket.take(1.5);
        assert!(ok);
        let (remaining, ok) = bucket.take(1.0);
        assert!(!ok, "partial debit must be refused");
        assert_eq!(remaining, 0.5);
        assert_eq!(bucket.remaining(), 0.5);
    }

    #[test]
    fn fractional_takes_are_legal() {
        let rate = Rate::new(1.0, Duration::from_secs(1)).unwrap();
        let mut bucket = LeakyBucket::new(Instant::now(), rate.burst());
        for _ in 0..4 {
            let (_, ok) = bucket.take(0.25);
            assert!(ok);
        }
        let (remaining, ok) = bucket.take(0.25);
        assert!(!ok);
        assert!(remaining.abs() < 1e-9);
    }

    #[test]
    fn never_overspends_under_interleaved_refills() {
        let rate = Rate::new(10.0, Duration::from_secs(1)).unwrap();
        let burst = rate.burst();
        let t0 = Instant::now();
        let mut bucket = LeakyBucket::new(t0, burst);

        let mut spent = 0.0;
        let mut replenished = 0.0;
        for step in 1..200u64 {
            let at = t0 + Duration::from_millis(step * 7);
            let before = bucket.remaining();
            bucket.refill(at, &rate, burst);
            // Track actual replenishment, which clamping may cut short.
            replenished += bucket.remaining() - before;
            let want = f64::from(u32::try_from(step % 3).unwrap());
            let (_, ok) = bucket.take(want);
            if ok {
                spent += want;
            }
            assert!(bucket.remaining() >= 0.0);
        }
        assert!(
            spent <= burst + replenished + 1e-6,
            "spent {spent} with burst {burst} and replenished {replenished}"
        );
    }
}
