//! Mutex-guarded in-memory bucket store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::bucket::LeakyBucket;
use crate::clock::{Clock, SystemClock};
use crate::error::{BuildError, LimiterError};
use crate::limiter::{Decision, Limiter};
use crate::rate::Rate;
use crate::store::{
    validate_burst, validate_cleanup_interval, validate_initial_capacity,
    DEFAULT_CLEANUP_INTERVAL, DEFAULT_INITIAL_CAPACITY,
};

type BucketMap = Mutex<HashMap<String, LeakyBucket>>;

/// A tag-keyed store of [`LeakyBucket`]s behind a single mutex.
///
/// One lock covers the whole map and every bucket in it, which keeps takes
/// totally ordered per tag. For very hot deployments, instantiate one store
/// per endpoint rather than sharding inside the store.
///
/// Construction spawns a janitor task that evicts idle buckets roughly every
/// cleanup interval; the task stops when the store is dropped or when the
/// configured cleanup signal fires. Share the store across limiters with
/// [`Arc`].
#[derive(Debug)]
pub struct MemoryStore {
    rate: Rate,
    burst: f64,
    clock: Arc<dyn Clock>,
    buckets: Arc<BucketMap>,
    janitor: JoinHandle<()>,
}

impl MemoryStore {
    /// A store with default depth, capacity, and cleanup settings.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(rate: Rate) -> Self {
        MemoryStoreBuilder::defaults(rate).spawn()
    }

    /// Start configuring a store for `rate`.
    pub fn builder(rate: Rate) -> MemoryStoreBuilder {
        MemoryStoreBuilder::defaults(rate)
    }

    /// The rate every bucket in this store replenishes at.
    pub fn rate(&self) -> &Rate {
        &self.rate
    }

    /// Number of live buckets, including ones eligible for the next purge.
    pub fn len(&self) -> usize {
        self.buckets.lock().unwrap().len()
    }

    /// True when no tag currently holds a bucket.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evict every bucket left untouched for at least one rate interval
    /// before `at`. The janitor calls this on a timer; tests may call it
    /// directly.
    pub fn purge(&self, at: Instant) {
        purge_idle(&self.buckets, &self.rate, at);
    }
}

#[async_trait]
impl Limiter for MemoryStore {
    fn rate(&self) -> &Rate {
        &self.rate
    }

    async fn take(&self, tag: &str, tokens: f64) -> Result<Decision, LimiterError> {
        let now = self.clock.now();
        let mut buckets = self.buckets.lock().unwrap();
        if let Some(bucket) = buckets.get_mut(tag) {
            bucket.refill(now, &self.rate, self.burst);
            return Ok(decide(bucket.take(tokens)));
        }
        let bucket = buckets
            .entry(tag.to_string())
            .or_insert_with(|| LeakyBucket::new(now, self.burst));
        Ok(decide(bucket.take(tokens)))
    }

    async fn remaining(&self, tag: &str) -> Result<f64, LimiterError> {
        let now = self.clock.now();
        let mut buckets = self.buckets.lock().unwrap();
        Ok(match buckets.get_mut(tag) {
            None => self.burst,
            Some(bucket) => {
                bucket.refill(now, &self.rate, self.burst);
                bucket.remaining()
            }
        })
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        self.janitor.abort();
    }
}

fn decide((remaining, ok): (f64, bool)) -> Decision {
    if ok {
        Decision::Allowed { remaining }
    } else {
        Decision::Denied { remaining }
    }
}

fn purge_idle(buckets: &BucketMap, rate: &Rate, at: Instant) {
    // A process younger than one interval has nothing old enough to evict.
    let Some(cutoff) = at.checked_sub(rate.interval()) else {
        return;
    };
    let mut buckets = buckets.lock().unwrap();
    let before = buckets.len();
    buckets.retain(|_, bucket| bucket.touched() >= cutoff);
    let evicted = before - buckets.len();
    if evicted > 0 {
        debug!(evicted, live = buckets.len(), "evicted idle rate limiter buckets");
    }
}

/// Configures and spawns a [`MemoryStore`].
pub struct MemoryStoreBuilder {
    rate: Rate,
    burst: Option<f64>,
    initial_capacity: usize,
    cleanup_interval: Duration,
    cleanup_signal: Option<watch::Receiver<bool>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStoreBuilder {
    fn defaults(rate: Rate) -> Self {
        Self {
            rate,
            burst: None,
            initial_capacity: DEFAULT_INITIAL_CAPACITY,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            cleanup_signal: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Override the bucket depth; defaults to the rate's token budget.
    pub fn burst(mut self, burst: f64) -> Self {
        self.burst = Some(burst);
        self
    }

    /// Pre-size the tag map. Accepts `[64, 2^32]`.
    pub fn initial_capacity(mut self, capacity: usize) -> Self {
        self.initial_capacity = capacity;
        self
    }

    /// How often the janitor evicts idle buckets. Accepts `[1s, 1h]`.
    pub fn cleanup_interval(mut self, every: Duration) -> Self {
        self.cleanup_interval = every;
        self
    }

    /// Stop the janitor when `true` is published or the sender is dropped.
    pub fn cleanup_signal(mut self, signal: watch::Receiver<bool>) -> Self {
        self.cleanup_signal = Some(signal);
        self
    }

    /// Substitute the time source, e.g. a [`ManualClock`] in tests.
    ///
    /// [`ManualClock`]: crate::ManualClock
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Validate the configuration and spawn the store and its janitor.
    ///
    /// Must be called within a tokio runtime.
    ///
    /// # Errors
    /// Returns a [`BuildError`] naming the first bound violated.
    pub fn build(self) -> Result<MemoryStore, BuildError> {
        if let Some(burst) = self.burst {
            validate_burst(burst)?;
        }
        validate_initial_capacity(self.initial_capacity)?;
        validate_cleanup_interval(self.cleanup_interval)?;
        Ok(self.spawn())
    }

    fn spawn(self) -> MemoryStore {
        let burst = self.burst.unwrap_or_else(|| self.rate.burst());
        let buckets: Arc<BucketMap> =
            Arc::new(Mutex::new(HashMap::with_capacity(self.initial_capacity)));
        let janitor = spawn_janitor(
            Arc::downgrade(&buckets),
            self.rate,
            self.clock.clone(),
            self.cleanup_interval,
            self.cleanup_signal,
        );
        MemoryStore { rate: self.rate, burst, clock: self.clock, buckets, janitor }
    }
}

fn spawn_janitor(
    buckets: Weak<BucketMap>,
    rate: Rate,
    clock: Arc<dyn Clock>,
    every: Duration,
    mut signal: Option<watch::Receiver<bool>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await; // the zeroth tick fires immediately
        loop {
            if let Some(stop) = signal.as_mut() {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            return;
                        }
                        continue;
                    }
                }
            } else {
                ticker.tick().await;
            }
            let Some(buckets) = buckets.upgrade() else {
                return;
            };
            purge_idle(&buckets, &rate, clock.now());
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn rate(tokens: f64, interval: Duration) -> Rate {
        Rate::new(tokens, interval).unwrap()
    }

    #[tokio::test]
    async fn first_take_creates_a_full_bucket() {
        let store = MemoryStore::new(rate(8.0, Duration::from_millis(20)));
        let decision = store.take("client", 1.0).await.unwrap();
        assert!(decision.is_allowed());
        assert_eq!(decision.remaining(), 7.0);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn remaining_reports_burst_without_creating_a_bucket() {
        let store = MemoryStore::new(rate(8.0, Duration::from_millis(20)));
        assert_eq!(store.remaining("ghost").await.unwrap(), 8.0);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn tags_are_accounted_independently() {
        let clock = ManualClock::starting_now();
        let store = MemoryStore::builder(rate(2.0, Duration::from_secs(1)))
            .clock(clock)
            .build()
            .unwrap();

        for _ in 0..2 {
            assert!(store.take("a", 1.0).await.unwrap().is_allowed());
        }
        assert!(!store.take("a", 1.0).await.unwrap().is_allowed());
        assert!(store.take("b", 1.0).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn drained_bucket_recovers_at_the_configured_rate() {
        let clock = ManualClock::starting_now();
        let store = MemoryStore::builder(rate(9.0, Duration::from_secs(1)))
            .clock(clock.clone())
            .build()
            .unwrap();

        for expected in [8.0, 7.0, 6.0] {
            let decision = store.take("client", 1.0).await.unwrap();
            assert!((decision.remaining() - expected).abs() < 0.1);
        }

        clock.advance(Duration::from_secs(1) / 9);
        let decision = store.take("client", 1.0).await.unwrap();
        assert!(decision.is_allowed());
        assert!((decision.remaining() - 6.0).abs() < 0.1);

        clock.advance(Duration::from_secs(1) - Duration::from_secs(1) / 9);
        let decision = store.take("client", 1.0).await.unwrap();
        assert!(decision.is_allowed());
        assert!((decision.remaining() - 8.0).abs() < 0.1);
    }

    #[tokio::test]
    async fn purge_evicts_one_interval_after_the_last_touch() {
        let interval = Duration::from_millis(100);
        let clock = ManualClock::starting_now();
        let store = MemoryStore::builder(rate(10.0, interval))
            .clock(clock.clone())
            .build()
            .unwrap();

        store.take("idle", 1.0).await.unwrap();

        // Half an interval later a read refills the bucket back to full;
        // that is the last touch, because refilling a full bucket is a
        // no-op no matter how often it happens afterwards.
        clock.advance(interval / 2);
        let touched_at = clock.now();
        store.remaining("idle").await.unwrap();
        clock.advance(interval * 5);
        store.remaining("idle").await.unwrap();

        store.purge(touched_at + interval);
        assert_eq!(store.len(), 1, "bucket still within its grace interval");
        store.purge(touched_at + interval + Duration::from_millis(1));
        assert!(store.is_empty());
        assert_eq!(store.remaining("idle").await.unwrap(), 10.0);
    }

    #[tokio::test]
    async fn purge_keeps_active_buckets() {
        let interval = Duration::from_millis(100);
        let clock = ManualClock::starting_now();
        let store = MemoryStore::builder(rate(100.0, interval))
            .clock(clock.clone())
            .build()
            .unwrap();

        store.take("busy", 1.0).await.unwrap();
        store.take("idle", 1.0).await.unwrap();
        clock.advance(interval * 3);
        store.take("busy", 1.0).await.unwrap();

        store.purge(clock.now());
        assert_eq!(store.len(), 1);
        assert!(store.take("busy", 0.0).await.unwrap().is_allowed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_takes_match_the_serial_balance() {
        let clock = ManualClock::starting_now();
        let store = Arc::new(
            MemoryStore::builder(rate(1000.0, Duration::from_secs(60)))
                .clock(clock)
                .build()
                .unwrap(),
        );

        // 8 workers x 100 takes with a frozen clock: every take succeeds and
        // the final balance must equal the serial result exactly.
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    assert!(store.take("shared", 1.0).await.unwrap().is_allowed());
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let remaining = store.remaining("shared").await.unwrap();
        assert!((remaining - 200.0).abs() < 1e-6, "got {remaining}");
    }

    #[tokio::test]
    async fn builder_rejects_out_of_range_settings() {
        let r = rate(5.0, Duration::from_secs(1));
        assert!(matches!(
            MemoryStore::builder(r).burst(0.0).build(),
            Err(BuildError::InvalidBurst(_))
        ));
        assert!(matches!(
            MemoryStore::builder(r).initial_capacity(8).build(),
            Err(BuildError::InvalidInitialCapacity(_))
        ));
        assert!(matches!(
            MemoryStore::builder(r).cleanup_interval(Duration::from_millis(10)).build(),
            Err(BuildError::InvalidCleanupInterval(_))
        ));
    }

    #[tokio::test]
    async fn cleanup_signal_stops_the_janitor() {
        let (tx, rx) = watch::channel(false);
        let store = MemoryStore::builder(rate(5.0, Duration::from_secs(1)))
            .cleanup_signal(rx)
            .build()
            .unwrap();
        tx.send(true).unwrap();
        // Give the janitor a moment to observe the signal and exit.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.janitor.is_finished());
    }
}
