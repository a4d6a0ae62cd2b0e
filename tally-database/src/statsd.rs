use tally_statsd::{HistogramMetric, TimerMetric};

/// Timer metrics for batched database counting.
pub enum DatabaseTimers {
    /// Timer for a full batched walk over one relation.
    BatchWalk,
}

impl TimerMetric for DatabaseTimers {
    fn name(&self) -> &'static str {
        match self {
            Self::BatchWalk => "database.batch.walk.duration",
        }
    }
}

/// Histogram metrics for batched database counting.
pub enum DatabaseHistograms {
    /// Number of batches executed for one walk.
    ///
    /// This metric is tagged with:
    ///  - `operation`: The batch operation that was executed.
    Batches,
}

impl HistogramMetric for DatabaseHistograms {
    fn name(&self) -> &'static str {
        match self {
            Self::Batches => "database.batch.walk.batches",
        }
    }
}
