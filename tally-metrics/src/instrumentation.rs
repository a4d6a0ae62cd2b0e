use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tally_database::{BatchConfig, BatchCounter, BoundsCache, RelationSource, SketchStore};

use crate::aggregator::Aggregator;
use crate::counters::{ApproxSetCounter, ExactCounter};
use crate::definition::{
    AggregateOperator, CounterOperation, DataSource, MetricDefinition,
};
use crate::error::ComputeError;
use crate::events::EventSelectionRule;
use crate::store::CounterStore;
use crate::time_frame::TimeFrame;

/// One computed metric value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum MetricValue {
    /// A single numeric value.
    Number(i64),
    /// Per-label counts of a breakdown metric.
    Breakdown(BTreeMap<String, i64>),
}

/// Produces the value of a generic metric.
pub type GenericProvider = Arc<dyn Fn() -> Result<MetricValue, ComputeError> + Send + Sync>;

/// Named relational sources available to database metrics.
#[derive(Default)]
pub struct RelationRegistry {
    relations: hashbrown::HashMap<String, Box<dyn RelationSource>>,
}

impl RelationRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `source` under its relation name.
    pub fn insert(&mut self, source: impl RelationSource + 'static) {
        self.relations
            .insert(source.relation().to_owned(), Box::new(source));
    }

    /// Looks up the source for `relation`.
    pub fn get(&self, relation: &str) -> Option<&dyn RelationSource> {
        self.relations.get(relation).map(Box::as_ref)
    }
}

/// Everything a metric computation may touch.
pub struct ComputeContext<'a> {
    /// The cache collaborator.
    pub counters: &'a dyn CounterStore,
    /// The relational collaborators, by relation name.
    pub relations: &'a RelationRegistry,
    /// Durable sketch storage, when configured.
    pub sketches: Option<&'a dyn SketchStore>,
    /// Batch boundary cache, when configured.
    pub bounds_cache: Option<&'a BoundsCache>,
    /// Batch sizing for database walks.
    pub batch_config: BatchConfig,
    /// The instant the report run is anchored to.
    pub now: DateTime<Utc>,
}

/// Strategy objects producing one value per metric definition.
///
/// Dispatch happens on the definition's data source; each variant holds only
/// the fields it needs.
pub enum Instrumentation {
    /// Batched counts over a relational table.
    Database(DatabaseMetric),
    /// Sum of exact per-event occurrence counters.
    TotalCount(TotalCountMetric),
    /// Sum of exact per-event amount counters.
    TotalSum(TotalSumMetric),
    /// Per-label breakdown from hash counters.
    UniqueTotals(UniqueTotalsMetric),
    /// Approximate distinct count over one or more events.
    RedisHll(RedisHllMetric),
    /// Cross-event, cross-source aggregation with explicit set semantics.
    Aggregated(AggregatedMetric),
    /// A caller-provided value.
    Generic(GenericMetric),
}

impl Instrumentation {
    /// Selects the instrumentation variant for a validated definition.
    ///
    /// `provider` supplies the value of `generic` metrics; it is required for
    /// those and ignored for every other data source.
    pub fn for_definition(
        definition: &MetricDefinition,
        provider: Option<GenericProvider>,
    ) -> Result<Self, ComputeError> {
        let variant = match definition.data_source {
            DataSource::Database => Self::Database(DatabaseMetric {
                name: definition.name.clone(),
                // Validation guarantees a relation and an operation.
                relation: definition.relation.clone().unwrap_or_default(),
                operation: definition
                    .batch_operation
                    .unwrap_or(tally_database::Operation::Count),
                column: definition.column.clone(),
                timestamp_column: definition.timestamp_column.clone(),
                time_frame: definition.time_frame,
            }),
            DataSource::RedisCounter => match definition.counter_operation {
                CounterOperation::TotalCount => Self::TotalCount(TotalCountMetric {
                    events: definition.events.clone(),
                    time_frame: definition.time_frame,
                }),
                CounterOperation::Sum => Self::TotalSum(TotalSumMetric {
                    events: definition.events.clone(),
                    time_frame: definition.time_frame,
                }),
                CounterOperation::UniqueTotals => Self::UniqueTotals(UniqueTotalsMetric {
                    events: definition.events.clone(),
                    time_frame: definition.time_frame,
                }),
            },
            DataSource::RedisHll => match &definition.aggregate {
                Some(aggregate) => Self::Aggregated(AggregatedMetric {
                    events: definition.events.clone(),
                    operator: aggregate.operator,
                    time_frame: definition.time_frame,
                }),
                None => Self::RedisHll(RedisHllMetric {
                    events: definition.events.clone(),
                    time_frame: definition.time_frame,
                }),
            },
            DataSource::Generic => Self::Generic(GenericMetric {
                provider: provider
                    .ok_or_else(|| ComputeError::MissingProvider(definition.name.clone()))?,
            }),
        };

        Ok(variant)
    }

    /// The data source this instrumentation reads, for logs and metrics.
    pub fn data_source(&self) -> &'static str {
        match self {
            Self::Database(_) => "database",
            Self::TotalCount(_) | Self::TotalSum(_) | Self::UniqueTotals(_) => "redis_counter",
            Self::RedisHll(_) | Self::Aggregated(_) => "redis_hll",
            Self::Generic(_) => "generic",
        }
    }

    /// Computes the metric value.
    pub async fn compute(&self, ctx: &ComputeContext<'_>) -> Result<MetricValue, ComputeError> {
        match self {
            Self::Database(metric) => metric.compute(ctx).await,
            Self::TotalCount(metric) => metric.compute(ctx).await,
            Self::TotalSum(metric) => metric.compute(ctx).await,
            Self::UniqueTotals(metric) => metric.compute(ctx).await,
            Self::RedisHll(metric) => metric.compute(ctx).await,
            Self::Aggregated(metric) => metric.compute(ctx).await,
            Self::Generic(metric) => (metric.provider)(),
        }
    }
}

/// Batched counts or distinct estimates over one relation.
pub struct DatabaseMetric {
    name: String,
    relation: String,
    operation: tally_database::Operation,
    column: Option<String>,
    timestamp_column: String,
    time_frame: TimeFrame,
}

impl DatabaseMetric {
    async fn compute(&self, ctx: &ComputeContext<'_>) -> Result<MetricValue, ComputeError> {
        let source = ctx
            .relations
            .get(&self.relation)
            .ok_or_else(|| ComputeError::UnknownRelation(self.relation.clone()))?;

        let window = self.time_frame.resolve(ctx.now);
        let constraint = window.constraint(&self.timestamp_column);

        let mut counter = BatchCounter::new(source).with_config(ctx.batch_config);
        let bounds_key = format!("{}.{}", self.name, self.operation.as_str());
        if let Some(cache) = ctx.bounds_cache {
            counter = counter.with_bounds_cache(cache, &bounds_key);
        }

        // Validation guarantees a column for the distinct operations.
        let column = self.column.as_deref().unwrap_or("id");

        let value = match self.operation {
            tally_database::Operation::Count => counter.count("id", constraint.as_ref()).await?,
            tally_database::Operation::DistinctCount => {
                counter.distinct_count(column, constraint.as_ref()).await?
            }
            tally_database::Operation::EstimateBatchDistinctCount => {
                let mut sketch = counter
                    .estimate_distinct_count(column, constraint.as_ref())
                    .await?;

                // Persist the sketch so runs over overlapping windows merge
                // instead of recomputing, then estimate the merged result.
                if let Some(store) = ctx.sketches {
                    let period = window.period_label();
                    store.save(&self.name, &period, &sketch).await?;
                    if let Some(merged) = store.load(&self.name, &period).await? {
                        sketch = merged;
                    }
                }

                sketch.cardinality() as i64
            }
        };

        Ok(MetricValue::Number(value))
    }
}

/// Sums exact occurrence counters over the events' keys.
pub struct TotalCountMetric {
    events: Vec<EventSelectionRule>,
    time_frame: TimeFrame,
}

impl TotalCountMetric {
    async fn compute(&self, ctx: &ComputeContext<'_>) -> Result<MetricValue, ComputeError> {
        sum_counters(&self.events, self.time_frame, ctx).await
    }
}

/// Sums exact amount counters over the events' keys.
pub struct TotalSumMetric {
    events: Vec<EventSelectionRule>,
    time_frame: TimeFrame,
}

impl TotalSumMetric {
    async fn compute(&self, ctx: &ComputeContext<'_>) -> Result<MetricValue, ComputeError> {
        sum_counters(&self.events, self.time_frame, ctx).await
    }
}

async fn sum_counters(
    events: &[EventSelectionRule],
    time_frame: TimeFrame,
    ctx: &ComputeContext<'_>,
) -> Result<MetricValue, ComputeError> {
    let window = time_frame.resolve(ctx.now);
    let keys: Vec<String> = events
        .iter()
        .flat_map(|rule| rule.storage_keys(&window))
        .collect();

    let total = ExactCounter::new(ctx.counters).sum(&keys).await?;
    Ok(MetricValue::Number(total))
}

/// Groups per-label hash counters by label and sums across keys.
///
/// Used for exact small-cardinality breakdowns tracked directly as hash
/// counters, not for cardinality estimation.
pub struct UniqueTotalsMetric {
    events: Vec<EventSelectionRule>,
    time_frame: TimeFrame,
}

impl UniqueTotalsMetric {
    async fn compute(&self, ctx: &ComputeContext<'_>) -> Result<MetricValue, ComputeError> {
        let window = self.time_frame.resolve(ctx.now);

        let mut totals: BTreeMap<String, i64> = BTreeMap::new();
        for rule in &self.events {
            for key in rule.storage_keys(&window) {
                for (label, count) in ctx.counters.read_hash(&key).await? {
                    *totals.entry(label).or_default() += count;
                }
            }
        }

        Ok(MetricValue::Breakdown(totals))
    }
}

/// Estimates the distinct count over the union of the events' sketches.
pub struct RedisHllMetric {
    events: Vec<EventSelectionRule>,
    time_frame: TimeFrame,
}

impl RedisHllMetric {
    async fn compute(&self, ctx: &ComputeContext<'_>) -> Result<MetricValue, ComputeError> {
        let window = self.time_frame.resolve(ctx.now);
        let keys: Vec<String> = self
            .events
            .iter()
            .flat_map(|rule| rule.storage_keys(&window))
            .collect();

        let estimate = ApproxSetCounter::new(ctx.counters).count(&keys).await?;
        Ok(MetricValue::Number(estimate as i64))
    }
}

/// Combines per-event sketches across events and sources.
pub struct AggregatedMetric {
    events: Vec<EventSelectionRule>,
    operator: AggregateOperator,
    time_frame: TimeFrame,
}

impl AggregatedMetric {
    async fn compute(&self, ctx: &ComputeContext<'_>) -> Result<MetricValue, ComputeError> {
        let window = self.time_frame.resolve(ctx.now);
        let approx = ApproxSetCounter::new(ctx.counters);

        // Per-event sketches stay separate until the aggregation step, so
        // per-event cardinality is always computable before combination.
        let mut sketches = Vec::with_capacity(self.events.len());
        for rule in &self.events {
            let mut sketch = approx.merged_sketch(&rule.storage_keys(&window)).await?;

            // The same logical event may also have database-persisted
            // sketches for sub-windows. Both representations must merge into
            // one sketch before estimating; summing two estimates would count
            // overlapping identities twice.
            if let Some(store) = ctx.sketches {
                let persisted = store
                    .load_merged(&rule.event_name, &rule.period_labels(&window))
                    .await?;
                sketch.merge(&persisted)?;
            }

            sketches.push(sketch);
        }

        let estimate = Aggregator::estimate(self.operator, &sketches)?;
        Ok(MetricValue::Number(estimate.round() as i64))
    }
}

/// A caller-provided value with no backing store.
pub struct GenericMetric {
    provider: GenericProvider,
}
