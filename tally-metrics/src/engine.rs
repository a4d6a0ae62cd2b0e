use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tally_database::{BatchConfig, BoundsCache, RelationSource, SketchStore};
use tally_statsd::metric;

use crate::definition::MetricDefinition;
use crate::error::ComputeError;
use crate::instrumentation::{
    ComputeContext, GenericProvider, Instrumentation, MetricValue, RelationRegistry,
};
use crate::statsd::{EngineCounters, EngineTimers};
use crate::store::CounterStore;

/// The sentinel reported for a metric whose source failed at value time.
pub const FALLBACK_VALUE: i64 = -1;

const fn default_fallback_value() -> i64 {
    FALLBACK_VALUE
}

/// What to do when a metric cannot compute its value.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct FallbackPolicy {
    /// The value substituted for a failing metric.
    pub value: i64,
    /// Propagate the error instead of substituting.
    ///
    /// Enabled in development and test environments, where a silently
    /// degraded report hides bugs.
    pub raise_on_error: bool,
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        Self {
            value: default_fallback_value(),
            raise_on_error: false,
        }
    }
}

/// Computes report values from validated metric definitions.
///
/// Metrics are computed sequentially; the only state shared between them is
/// the batch boundary cache, which is safe for concurrent reads and tolerates
/// racy writes.
pub struct Engine {
    counters: Arc<dyn CounterStore>,
    relations: RelationRegistry,
    sketches: Option<Arc<dyn SketchStore>>,
    bounds_cache: BoundsCache,
    batch_config: BatchConfig,
    fallback: FallbackPolicy,
    providers: hashbrown::HashMap<String, GenericProvider>,
}

impl Engine {
    /// Creates an engine reading cache counters from `counters`.
    pub fn new(counters: Arc<dyn CounterStore>) -> Self {
        Self {
            counters,
            relations: RelationRegistry::new(),
            sketches: None,
            bounds_cache: BoundsCache::default(),
            batch_config: BatchConfig::default(),
            fallback: FallbackPolicy::default(),
            providers: hashbrown::HashMap::new(),
        }
    }

    /// Registers a relational source for database metrics.
    pub fn register_relation(&mut self, source: impl RelationSource + 'static) -> &mut Self {
        self.relations.insert(source);
        self
    }

    /// Enables durable sketch persistence.
    pub fn with_sketch_store(mut self, sketches: Arc<dyn SketchStore>) -> Self {
        self.sketches = Some(sketches);
        self
    }

    /// Overrides the batch sizing of database walks.
    pub fn with_batch_config(mut self, config: BatchConfig) -> Self {
        self.batch_config = config;
        self
    }

    /// Overrides the time to live of cached batch boundaries.
    pub fn with_bounds_ttl(mut self, ttl: std::time::Duration) -> Self {
        self.bounds_cache = BoundsCache::new(ttl);
        self
    }

    /// Overrides the fallback policy.
    pub fn with_fallback(mut self, fallback: FallbackPolicy) -> Self {
        self.fallback = fallback;
        self
    }

    /// Registers the value provider of a generic metric.
    pub fn register_provider(&mut self, metric: &str, provider: GenericProvider) -> &mut Self {
        self.providers.insert(metric.to_owned(), provider);
        self
    }

    /// Computes one metric value, anchored at `now`.
    pub async fn compute(
        &self,
        definition: &MetricDefinition,
        now: DateTime<Utc>,
    ) -> Result<MetricValue, ComputeError> {
        let provider = self.providers.get(&definition.name).cloned();
        let instrumentation = Instrumentation::for_definition(definition, provider)?;

        let ctx = ComputeContext {
            counters: self.counters.as_ref(),
            relations: &self.relations,
            sketches: self.sketches.as_deref(),
            bounds_cache: Some(&self.bounds_cache),
            batch_config: self.batch_config,
            now,
        };

        let started = Instant::now();
        let value = instrumentation.compute(&ctx).await?;

        metric!(
            timer(EngineTimers::Compute) = started.elapsed(),
            data_source = instrumentation.data_source(),
        );
        metric!(
            counter(EngineCounters::Computed) += 1,
            data_source = instrumentation.data_source(),
        );

        Ok(value)
    }

    /// Computes all `definitions` into one report, anchored at `now`.
    ///
    /// With the default fallback policy a failing metric contributes the
    /// fallback value and the run continues; with `raise_on_error` the first
    /// failure aborts the report.
    pub async fn compute_report(
        &self,
        definitions: &[MetricDefinition],
        now: DateTime<Utc>,
    ) -> Result<BTreeMap<String, MetricValue>, ComputeError> {
        let mut report = BTreeMap::new();

        for definition in definitions {
            let value = match self.compute(definition, now).await {
                Ok(value) => value,
                Err(error) if !self.fallback.raise_on_error => {
                    tally_log::warn!(
                        error = &error as &dyn std::error::Error,
                        metric = definition.name.as_str(),
                        "substituting the fallback value for a failing metric"
                    );
                    metric!(
                        counter(EngineCounters::Fallback) += 1,
                        data_source = definition.data_source.as_str(),
                    );
                    MetricValue::Number(self.fallback.value)
                }
                Err(error) => return Err(error),
            };

            report.insert(definition.name.clone(), value);
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap as StdBTreeMap;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::TimeZone;
    use tally_database::testutils::{MemoryRelationSource, MemoryRow, MemorySketchStore};
    use tally_hll::Sketch;

    use crate::counters::{ApproxSetCounter, ExactCounter};
    use crate::definition::MetricRecord;
    use crate::events::EventSelectionRule;
    use crate::store::{MemoryCounterStore, StoreError, StoreResult};

    use super::*;

    /// A counter store whose backend is down.
    struct FailingCounterStore;

    #[async_trait]
    impl CounterStore for FailingCounterStore {
        async fn get(&self, _key: &str) -> StoreResult<Option<i64>> {
            Err(StoreError::Unavailable)
        }

        async fn get_many(&self, _keys: &[String]) -> StoreResult<Vec<Option<i64>>> {
            Err(StoreError::Unavailable)
        }

        async fn increment(
            &self,
            _key: &str,
            _by: i64,
            _expire: Option<Duration>,
        ) -> StoreResult<i64> {
            Err(StoreError::Unavailable)
        }

        async fn read_hash(&self, _key: &str) -> StoreResult<StdBTreeMap<String, i64>> {
            Err(StoreError::Unavailable)
        }

        async fn hash_increment(&self, _key: &str, _field: &str, _by: i64) -> StoreResult<i64> {
            Err(StoreError::Unavailable)
        }

        async fn read_blob(&self, _key: &str) -> StoreResult<Option<Vec<u8>>> {
            Err(StoreError::Unavailable)
        }

        async fn read_blobs(&self, _keys: &[String]) -> StoreResult<Vec<Option<Vec<u8>>>> {
            Err(StoreError::Unavailable)
        }

        async fn write_blob(
            &self,
            _key: &str,
            _bytes: &[u8],
            _expire: Option<Duration>,
        ) -> StoreResult<()> {
            Err(StoreError::Unavailable)
        }
    }

    fn definition(json: serde_json::Value) -> MetricDefinition {
        let record: MetricRecord = serde_json::from_value(json).unwrap();
        MetricDefinition::parse(record).unwrap()
    }

    fn at(year: i32, month: u32, day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, 12, 0, 0).unwrap()
    }

    /// Three users trigger the event in week one, two more in week three.
    /// The 28d frame sees all five, the 7d frame at the end of week three
    /// sees only the recent two.
    #[tokio::test]
    async fn test_hll_metric_across_time_frames() {
        let store = Arc::new(MemoryCounterStore::new());
        let tracker = ApproxSetCounter::new(store.as_ref());
        let rule = EventSelectionRule::time_framed("users_viewed_dashboard");

        for user_id in [1_i64, 2, 3] {
            tracker.track(&rule, &user_id, at(2024, 5, 8)).await.unwrap();
        }
        for user_id in [4_i64, 5] {
            tracker.track(&rule, &user_id, at(2024, 5, 20)).await.unwrap();
        }

        let engine = Engine::new(store);
        let now = at(2024, 5, 22);

        let monthly = definition(serde_json::json!({
            "name": "users_viewed_dashboard_monthly",
            "data_source": "redis_hll",
            "time_frame": "28d",
            "options": { "events": ["users_viewed_dashboard"] }
        }));
        let weekly = definition(serde_json::json!({
            "name": "users_viewed_dashboard_weekly",
            "data_source": "redis_hll",
            "time_frame": "7d",
            "options": { "events": ["users_viewed_dashboard"] }
        }));

        assert_eq!(
            engine.compute(&monthly, now).await.unwrap(),
            MetricValue::Number(5)
        );
        assert_eq!(
            engine.compute(&weekly, now).await.unwrap(),
            MetricValue::Number(2)
        );
    }

    /// E1 has users {1,2,3}, E2 has users {3,4}: OR estimates 4, AND 1.
    #[tokio::test]
    async fn test_aggregated_or_and() {
        let store = Arc::new(MemoryCounterStore::new());
        let tracker = ApproxSetCounter::new(store.as_ref());
        let e1 = EventSelectionRule::time_framed("e1");
        let e2 = EventSelectionRule::time_framed("e2");

        let fired_at = at(2024, 5, 20);
        for user_id in [1_i64, 2, 3] {
            tracker.track(&e1, &user_id, fired_at).await.unwrap();
        }
        for user_id in [3_i64, 4] {
            tracker.track(&e2, &user_id, fired_at).await.unwrap();
        }

        let engine = Engine::new(store);
        let now = at(2024, 5, 22);

        let union = definition(serde_json::json!({
            "name": "users_any_event",
            "data_source": "redis_hll",
            "time_frame": "7d",
            "options": {
                "events": ["e1", "e2"],
                "aggregate": { "operator": "OR", "attribute": "user_id" }
            }
        }));
        let intersection = definition(serde_json::json!({
            "name": "users_both_events",
            "data_source": "redis_hll",
            "time_frame": "7d",
            "options": {
                "events": ["e1", "e2"],
                "aggregate": { "operator": "AND", "attribute": "user_id" }
            }
        }));

        assert_eq!(
            engine.compute(&union, now).await.unwrap(),
            MetricValue::Number(4)
        );
        assert_eq!(
            engine.compute(&intersection, now).await.unwrap(),
            MetricValue::Number(1)
        );
    }

    /// Cache-origin and database-persisted sketches of the same event merge
    /// into one sketch before estimating. Users {0..100} in the cache and
    /// {50..150} persisted overlap in 50 identities.
    #[tokio::test]
    async fn test_cross_source_merge_does_not_double_count() {
        let store = Arc::new(MemoryCounterStore::new());
        let sketches = Arc::new(MemorySketchStore::new());
        let tracker = ApproxSetCounter::new(store.as_ref());
        let rule = EventSelectionRule::time_framed("pipelines_ran");

        let fired_at = at(2024, 5, 20);
        for user_id in 0_i64..100 {
            tracker.track(&rule, &user_id, fired_at).await.unwrap();
        }

        let mut persisted = Sketch::new();
        for user_id in 50_i64..150 {
            persisted.insert(&user_id);
        }
        // Persist under the ISO-week period of the fired instant, the same
        // label the aggregation derives from the window.
        sketches
            .save("pipelines_ran", "2024-21", &persisted)
            .await
            .unwrap();

        let engine = Engine::new(store).with_sketch_store(sketches);
        let now = at(2024, 5, 22);

        let metric = definition(serde_json::json!({
            "name": "pipelines_ran_weekly",
            "data_source": "redis_hll",
            "time_frame": "7d",
            "options": {
                "events": ["pipelines_ran"],
                "aggregate": { "operator": "OR", "attribute": "user_id" }
            }
        }));

        let MetricValue::Number(value) = engine.compute(&metric, now).await.unwrap() else {
            panic!("expected a number");
        };

        // 150 distinct identities across both sources; a naive sum of
        // estimates would report about 200.
        assert!((140..=160).contains(&value), "estimate was {value}");
    }

    #[tokio::test]
    async fn test_total_count_metric() {
        let store = Arc::new(MemoryCounterStore::new());
        let counter = ExactCounter::new(store.as_ref());
        let rule = EventSelectionRule::all_time("projects_created");

        for _ in 0..7 {
            counter.increment(&rule, at(2024, 5, 20)).await.unwrap();
        }

        let engine = Engine::new(store);
        let metric = definition(serde_json::json!({
            "name": "projects_created_total",
            "data_source": "redis_counter",
            "time_frame": "all",
            "options": { "events": ["projects_created"] }
        }));

        assert_eq!(
            engine.compute(&metric, at(2024, 5, 22)).await.unwrap(),
            MetricValue::Number(7)
        );
    }

    #[tokio::test]
    async fn test_total_sum_metric() {
        let store = Arc::new(MemoryCounterStore::new());
        let counter = ExactCounter::new(store.as_ref());
        let rule = EventSelectionRule::all_time("build_minutes");

        counter.increment_by(&rule, 90, at(2024, 5, 19)).await.unwrap();
        counter.increment_by(&rule, 30, at(2024, 5, 20)).await.unwrap();

        let engine = Engine::new(store);
        let metric = definition(serde_json::json!({
            "name": "build_minutes_total",
            "data_source": "redis_counter",
            "time_frame": "all",
            "options": { "events": ["build_minutes"], "operation": "sum" }
        }));

        assert_eq!(
            engine.compute(&metric, at(2024, 5, 22)).await.unwrap(),
            MetricValue::Number(120)
        );
    }

    #[tokio::test]
    async fn test_unique_totals_breakdown() {
        let store = Arc::new(MemoryCounterStore::new());
        let rule = EventSelectionRule::time_framed("deploys_by_tier");

        // Labels collide across weekly buckets and sum up per label.
        let week1 = rule.tracking_key(at(2024, 5, 8));
        let week3 = rule.tracking_key(at(2024, 5, 20));
        store.hash_increment(&week1, "free", 2).await.unwrap();
        store.hash_increment(&week1, "premium", 1).await.unwrap();
        store.hash_increment(&week3, "free", 3).await.unwrap();

        let engine = Engine::new(store);
        let metric = definition(serde_json::json!({
            "name": "deploys_by_tier_monthly",
            "data_source": "redis_counter",
            "time_frame": "28d",
            "options": { "events": ["deploys_by_tier"], "operation": "unique_totals" }
        }));

        let expected: StdBTreeMap<String, i64> =
            [("free".to_owned(), 5), ("premium".to_owned(), 1)]
                .into_iter()
                .collect();
        assert_eq!(
            engine.compute(&metric, at(2024, 5, 22)).await.unwrap(),
            MetricValue::Breakdown(expected)
        );
    }

    #[tokio::test]
    async fn test_database_metrics() {
        let store = Arc::new(MemoryCounterStore::new());
        let rows = (1_i64..=500)
            .map(|id| {
                MemoryRow::with_id(id)
                    .value("user_id", id % 120)
                    .created_at(at(2024, 5, 10))
            })
            .collect();

        let mut engine = Engine::new(store);
        engine.register_relation(MemoryRelationSource::new("events", rows));

        let count = definition(serde_json::json!({
            "name": "events_count",
            "data_source": "database",
            "time_frame": "all",
            "options": { "relation": "events", "operation": "count" }
        }));
        let distinct = definition(serde_json::json!({
            "name": "events_distinct_users",
            "data_source": "database",
            "time_frame": "28d",
            "options": {
                "relation": "events",
                "operation": "distinct_count",
                "column": "user_id"
            }
        }));

        let now = at(2024, 5, 22);
        assert_eq!(
            engine.compute(&count, now).await.unwrap(),
            MetricValue::Number(500)
        );
        assert_eq!(
            engine.compute(&distinct, now).await.unwrap(),
            MetricValue::Number(120)
        );
    }

    #[tokio::test]
    async fn test_database_estimate_persists_sketch() {
        let store = Arc::new(MemoryCounterStore::new());
        let sketches = Arc::new(MemorySketchStore::new());
        let rows = (1_i64..=2_000)
            .map(|id| {
                MemoryRow::with_id(id)
                    .value("user_id", id % 700)
                    .created_at(at(2024, 5, 10))
            })
            .collect();

        let mut engine = Engine::new(store).with_sketch_store(sketches.clone());
        engine.register_relation(MemoryRelationSource::new("events", rows));

        let metric = definition(serde_json::json!({
            "name": "events_estimated_users",
            "data_source": "database",
            "time_frame": "28d",
            "options": {
                "relation": "events",
                "operation": "estimate_batch_distinct_count",
                "column": "user_id"
            }
        }));

        let MetricValue::Number(value) =
            engine.compute(&metric, at(2024, 5, 22)).await.unwrap()
        else {
            panic!("expected a number");
        };

        assert!((650..=750).contains(&value), "estimate was {value}");
        // One durable row per metric per computation period.
        assert_eq!(sketches.len(), 1);
    }

    #[tokio::test]
    async fn test_generic_metric_uses_registered_provider() {
        let store = Arc::new(MemoryCounterStore::new());
        let mut engine = Engine::new(store);
        engine.register_provider(
            "installation_flavor",
            Arc::new(|| Ok(MetricValue::Number(3))),
        );

        let metric = definition(serde_json::json!({
            "name": "installation_flavor",
            "data_source": "generic",
        }));

        assert_eq!(
            engine.compute(&metric, Utc::now()).await.unwrap(),
            MetricValue::Number(3)
        );
    }

    #[tokio::test]
    async fn test_report_substitutes_fallback_and_continues() {
        let mut engine = Engine::new(Arc::new(FailingCounterStore));
        engine.register_provider("works", Arc::new(|| Ok(MetricValue::Number(42))));

        let definitions = vec![
            definition(serde_json::json!({
                "name": "broken",
                "data_source": "redis_counter",
                "time_frame": "all",
                "options": { "events": ["some_event"] }
            })),
            definition(serde_json::json!({
                "name": "works",
                "data_source": "generic",
            })),
        ];

        let report = engine
            .compute_report(&definitions, Utc::now())
            .await
            .unwrap();

        assert_eq!(report["broken"], MetricValue::Number(FALLBACK_VALUE));
        assert_eq!(report["works"], MetricValue::Number(42));
    }

    #[test]
    fn test_compute_emits_internal_measurements() {
        let captures = tally_statsd::with_capturing_test_client(|| {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .build()
                .unwrap();

            runtime.block_on(async {
                let mut engine = Engine::new(Arc::new(MemoryCounterStore::new()));
                engine.register_provider("flavor", Arc::new(|| Ok(MetricValue::Number(1))));

                let metric = definition(serde_json::json!({
                    "name": "flavor",
                    "data_source": "generic",
                }));
                engine.compute(&metric, Utc::now()).await.unwrap();
            });
        });

        assert!(
            captures
                .iter()
                .any(|capture| capture.starts_with("metrics.computed:1|c")),
            "missing computed counter in {captures:?}"
        );
        assert!(
            captures
                .iter()
                .any(|capture| capture.starts_with("metrics.compute.duration:")),
            "missing compute timer in {captures:?}"
        );
    }

    #[tokio::test]
    async fn test_report_raises_in_strict_mode() {
        let engine = Engine::new(Arc::new(FailingCounterStore)).with_fallback(FallbackPolicy {
            raise_on_error: true,
            ..Default::default()
        });

        let definitions = vec![definition(serde_json::json!({
            "name": "broken",
            "data_source": "redis_counter",
            "time_frame": "all",
            "options": { "events": ["some_event"] }
        }))];

        assert!(matches!(
            engine.compute_report(&definitions, Utc::now()).await,
            Err(ComputeError::Store(StoreError::Unavailable))
        ));
    }
}
