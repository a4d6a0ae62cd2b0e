use std::hash::Hash;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tally_hll::Sketch;

use crate::events::{EventSelectionRule, KEY_EXPIRY_WEEKS};
use crate::store::{CounterStore, StoreResult};

/// Lifetime of calendar-bucketed keys in the cache.
fn bucket_expiry() -> Duration {
    Duration::from_secs(KEY_EXPIRY_WEEKS * 7 * 24 * 60 * 60)
}

/// Exact integer counters addressed by event keys.
pub struct ExactCounter<'a, S: ?Sized> {
    store: &'a S,
}

impl<'a, S: CounterStore + ?Sized> ExactCounter<'a, S> {
    /// Creates a counter facade over `store`.
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Atomically increments the counter for `rule` by one.
    pub async fn increment(&self, rule: &EventSelectionRule, at: DateTime<Utc>) -> StoreResult<i64> {
        self.increment_by(rule, 1, at).await
    }

    /// Atomically adds `amount` to the counter for `rule`.
    ///
    /// Bucketed keys are given their expiry on every write; refreshing the
    /// TTL of a live bucket is harmless.
    pub async fn increment_by(
        &self,
        rule: &EventSelectionRule,
        amount: i64,
        at: DateTime<Utc>,
    ) -> StoreResult<i64> {
        let expire = rule.time_framed.then(bucket_expiry);
        self.store
            .increment(&rule.tracking_key(at), amount, expire)
            .await
    }

    /// Sums the counters stored at `keys`.
    ///
    /// Missing keys count as zero: a bucket nobody wrote to is an empty
    /// bucket, not an error.
    pub async fn sum(&self, keys: &[String]) -> StoreResult<i64> {
        let values = self.store.get_many(keys).await?;
        Ok(values.into_iter().flatten().sum())
    }
}

/// Approximate distinct counters backed by one sketch per event key.
pub struct ApproxSetCounter<'a, S: ?Sized> {
    store: &'a S,
}

impl<'a, S: CounterStore + ?Sized> ApproxSetCounter<'a, S> {
    /// Creates a counter facade over `store`.
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Records that `value` performed the event at instant `at`.
    ///
    /// The sketch at the bucket key is read, updated, and written back.
    /// Concurrent writers can race; losing an update only widens the
    /// estimate's error by a fraction of one identity, which the documented
    /// error rate already dwarfs.
    pub async fn track<T: Hash + ?Sized>(
        &self,
        rule: &EventSelectionRule,
        value: &T,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let key = rule.tracking_key(at);

        let mut sketch = match self.store.read_blob(&key).await? {
            Some(bytes) => Sketch::from_bytes(&bytes).unwrap_or_default(),
            None => Sketch::new(),
        };
        sketch.insert(value);

        let expire = rule.time_framed.then(bucket_expiry);
        self.store.write_blob(&key, &sketch.to_bytes(), expire).await
    }

    /// Loads the sketches at `keys` in one round trip and merges them.
    ///
    /// Undecodable blobs are skipped: a single corrupted bucket costs its
    /// contribution, not the whole metric.
    pub async fn merged_sketch(&self, keys: &[String]) -> StoreResult<Sketch> {
        let blobs = self.store.read_blobs(keys).await?;

        let mut merged = Sketch::new();
        for bytes in blobs.into_iter().flatten() {
            match Sketch::from_bytes(&bytes).and_then(|sketch| merged.merge(&sketch)) {
                Ok(()) => {}
                Err(error) => {
                    tally_log::warn!(
                        error = &error as &dyn std::error::Error,
                        "skipping undecodable sketch bucket"
                    );
                }
            }
        }

        Ok(merged)
    }

    /// Estimates the distinct count over the union of `keys`.
    pub async fn count(&self, keys: &[String]) -> StoreResult<u64> {
        Ok(self.merged_sketch(keys).await?.cardinality())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use crate::store::MemoryCounterStore;
    use crate::time_frame::TimeFrame;

    use super::*;

    fn at(year: i32, month: u32, day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_exact_counter_sums_buckets() {
        let store = MemoryCounterStore::new();
        let counter = ExactCounter::new(&store);
        let rule = EventSelectionRule::time_framed("pushes");

        // Two pushes in one week, one in the next.
        counter.increment(&rule, at(2024, 5, 8)).await.unwrap();
        counter.increment(&rule, at(2024, 5, 8)).await.unwrap();
        counter.increment(&rule, at(2024, 5, 15)).await.unwrap();

        let window = TimeFrame::Days28.resolve(at(2024, 5, 22));
        let keys = rule.storage_keys(&window);
        assert_eq!(counter.sum(&keys).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_exact_counter_missing_buckets_are_zero() {
        let store = MemoryCounterStore::new();
        let counter = ExactCounter::new(&store);

        let keys = vec!["tally:usage:1:ghost-2024-01".to_owned()];
        assert_eq!(counter.sum(&keys).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_approx_counter_counts_distinct_values() {
        let store = MemoryCounterStore::new();
        let counter = ApproxSetCounter::new(&store);
        let rule = EventSelectionRule::time_framed("searches");

        for user_id in 0_i64..50 {
            counter.track(&rule, &user_id, at(2024, 5, 8)).await.unwrap();
            // Repeated activity of the same user must not inflate the count.
            counter.track(&rule, &user_id, at(2024, 5, 8)).await.unwrap();
        }

        let window = TimeFrame::Days28.resolve(at(2024, 5, 22));
        let keys = rule.storage_keys(&window);

        // Small cardinalities sit in the linear-counting range and come out
        // exact for all practical purposes.
        let estimate = counter.count(&keys).await.unwrap();
        assert!((45..=55).contains(&estimate), "estimate was {estimate}");
    }

    #[tokio::test]
    async fn test_approx_counter_window_excludes_other_buckets() {
        let store = MemoryCounterStore::new();
        let counter = ApproxSetCounter::new(&store);
        let rule = EventSelectionRule::time_framed("searches");

        // One user three months ago, one recent.
        counter.track(&rule, &1_i64, at(2024, 2, 1)).await.unwrap();
        counter.track(&rule, &2_i64, at(2024, 5, 20)).await.unwrap();

        let window = TimeFrame::Days7.resolve(at(2024, 5, 22));
        let estimate = counter.count(&rule.storage_keys(&window)).await.unwrap();

        assert_eq!(estimate, 1);
    }
}
