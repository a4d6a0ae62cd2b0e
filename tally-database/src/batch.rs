use serde::{Deserialize, Serialize};
use tally_hll::Sketch;
use tally_statsd::metric;

use crate::statsd::{DatabaseHistograms, DatabaseTimers};
use crate::{
    BatchBounds, BoundsCache, DatabaseError, IdRange, RelationSource, Result, TimeConstraint,
};

const fn default_count_batch_size() -> u32 {
    100_000
}

const fn default_distinct_batch_size() -> u32 {
    10_000
}

const fn default_max_batches() -> u32 {
    10_000
}

/// Batch sizing for walks over a relation.
///
/// Batch sizes are engine configuration, not per-call parameters: a caller
/// must not be able to turn a bounded walk into a full scan.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Batch size for exact row counts.
    pub count_batch_size: u32,
    /// Batch size for distinct counts and sketch building.
    pub distinct_batch_size: u32,
    /// Maximum number of batches before a walk is aborted.
    pub max_batches: u32,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            count_batch_size: default_count_batch_size(),
            distinct_batch_size: default_distinct_batch_size(),
            max_batches: default_max_batches(),
        }
    }
}

/// A batched counting operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    /// Exact row count.
    Count,
    /// Exact `COUNT(DISTINCT column)`.
    DistinctCount,
    /// Approximate distinct count via an incrementally built sketch.
    EstimateBatchDistinctCount,
}

impl Operation {
    /// Resolves an operation name from the metric catalog.
    ///
    /// Returns `None` for unknown names so that definitions fail at
    /// construction time, not when the first value is computed.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "count" => Some(Self::Count),
            "distinct_count" => Some(Self::DistinctCount),
            "estimate_batch_distinct_count" => Some(Self::EstimateBatchDistinctCount),
            _ => None,
        }
    }

    /// The catalog name of this operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::DistinctCount => "distinct_count",
            Self::EstimateBatchDistinctCount => "estimate_batch_distinct_count",
        }
    }
}

/// Walks a relation in bounded batches of the batched column.
///
/// For [`Operation::Count`] the batched column is the primary key. For the
/// distinct operations it is the counted column itself, so that batch ranges
/// partition the distinct value space and per-batch results combine without
/// double counting.
pub struct BatchCounter<'a, S: ?Sized> {
    source: &'a S,
    config: BatchConfig,
    bounds_cache: Option<(&'a BoundsCache, String)>,
}

impl<'a, S: RelationSource + ?Sized> BatchCounter<'a, S> {
    /// Creates a counter over `source` with the default [`BatchConfig`].
    pub fn new(source: &'a S) -> Self {
        Self {
            source,
            config: BatchConfig::default(),
            bounds_cache: None,
        }
    }

    /// Overrides the batch configuration.
    pub fn with_config(mut self, config: BatchConfig) -> Self {
        self.config = config;
        self
    }

    /// Caches batch boundaries in `cache` under `key`.
    ///
    /// Caching is skipped while the source reports an open transaction, so
    /// boundaries observed inside a snapshot never leak into other runs.
    pub fn with_bounds_cache(mut self, cache: &'a BoundsCache, key: &str) -> Self {
        self.bounds_cache = Some((cache, key.to_owned()));
        self
    }

    /// Exact row count, optionally restricted to a time window.
    pub async fn count(&self, column: &str, time: Option<&TimeConstraint>) -> Result<i64> {
        let counts = self
            .walk(
                Operation::Count,
                column,
                self.config.count_batch_size,
                |range| async move { self.source.count_between(column, range, time).await },
            )
            .await?;

        Ok(counts.into_iter().sum())
    }

    /// Exact distinct count of `column`, optionally restricted to a time
    /// window.
    pub async fn distinct_count(&self, column: &str, time: Option<&TimeConstraint>) -> Result<i64> {
        let counts = self
            .walk(
                Operation::DistinctCount,
                column,
                self.config.distinct_batch_size,
                |range| async move {
                    self.source.distinct_count_between(column, range, time).await
                },
            )
            .await?;

        Ok(counts.into_iter().sum())
    }

    /// Builds a sketch over the distinct values of `column`.
    ///
    /// The sketch never materializes the full distinct set: each batch
    /// contributes only its hashes. The estimate carries the sketch's
    /// documented error rate.
    pub async fn estimate_distinct_count(
        &self,
        column: &str,
        time: Option<&TimeConstraint>,
    ) -> Result<Sketch> {
        let batches = self
            .walk(
                Operation::EstimateBatchDistinctCount,
                column,
                self.config.distinct_batch_size,
                |range| async move {
                    self.source.distinct_hashes_between(column, range, time).await
                },
            )
            .await?;

        let mut sketch = Sketch::new();
        for hashes in batches {
            for hash in hashes {
                sketch.insert_hash(hash);
            }
        }

        Ok(sketch)
    }

    /// Resolves the walk boundaries, consulting the bounds cache when
    /// configured.
    ///
    /// Boundaries are computed without the time constraint: wider bounds only
    /// cost empty batches, and unconstrained bounds stay valid for caching
    /// while the metric's window moves.
    async fn bounds(&self, column: &str) -> Result<Option<BatchBounds>> {
        // Boundary caching must not observe snapshots of an open caller
        // transaction.
        let cache = match &self.bounds_cache {
            Some((cache, key)) if !self.source.in_transaction() => Some((*cache, key.as_str())),
            _ => None,
        };

        if let Some((cache, key)) = cache {
            if let Some(bounds) = cache.get(key) {
                return Ok(Some(bounds));
            }
        }

        let start = self.source.min_value(column, None).await?;
        let finish = self.source.max_value(column, None).await?;
        let (Some(start), Some(finish)) = (start, finish) else {
            // Empty relation: counts are zero, nothing to cache.
            return Ok(None);
        };

        let bounds = BatchBounds { start, finish };
        if let Some((cache, key)) = cache {
            cache.insert(key, bounds);
        }

        Ok(Some(bounds))
    }

    /// Runs `op` over every batch between the walk boundaries.
    async fn walk<F, Fut, T>(
        &self,
        op: Operation,
        column: &str,
        batch_size: u32,
        run_batch: F,
    ) -> Result<Vec<T>>
    where
        F: Fn(IdRange) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = std::time::Instant::now();

        let Some(bounds) = self.bounds(column).await? else {
            return Ok(Vec::new());
        };

        let mut results = Vec::new();
        let mut batches = 0_u32;
        let mut cursor = bounds.start;

        while cursor <= bounds.finish {
            if batches >= self.config.max_batches {
                tally_log::warn!(
                    relation = self.source.relation(),
                    column,
                    "aborting batch walk over the batch ceiling"
                );
                return Err(DatabaseError::TooManyBatches(self.config.max_batches));
            }

            let upper = cursor
                .saturating_add(batch_size as i64 - 1)
                .min(bounds.finish);
            results.push(
                run_batch(IdRange {
                    start: cursor,
                    finish: upper,
                })
                .await?,
            );

            batches += 1;
            cursor = match upper.checked_add(1) {
                Some(next) => next,
                None => break,
            };
        }

        metric!(
            timer(DatabaseTimers::BatchWalk) = started.elapsed(),
            operation = op.as_str(),
        );
        metric!(
            histogram(DatabaseHistograms::Batches) = batches as u64,
            operation = op.as_str(),
        );
        tally_log::debug!(
            relation = self.source.relation(),
            column,
            batches,
            operation = op.as_str(),
            "finished batch walk"
        );

        Ok(results)
    }
}
