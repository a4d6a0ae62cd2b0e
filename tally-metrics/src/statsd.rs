use tally_statsd::{CounterMetric, TimerMetric};

/// Counter metrics for the instrumentation engine.
pub enum EngineCounters {
    /// Incremented for every successfully computed metric value.
    ///
    /// This metric is tagged with:
    ///  - `data_source`: The data source of the computed metric.
    Computed,
    /// Incremented for every metric replaced by the fallback value.
    ///
    /// This metric is tagged with:
    ///  - `data_source`: The data source of the failing metric.
    Fallback,
}

impl CounterMetric for EngineCounters {
    fn name(&self) -> &'static str {
        match self {
            Self::Computed => "metrics.computed",
            Self::Fallback => "metrics.fallback",
        }
    }
}

/// Timer metrics for the instrumentation engine.
pub enum EngineTimers {
    /// Timer for computing one metric value.
    ///
    /// This metric is tagged with:
    ///  - `data_source`: The data source of the computed metric.
    Compute,
}

impl TimerMetric for EngineTimers {
    fn name(&self) -> &'static str {
        match self {
            Self::Compute => "metrics.compute.duration",
        }
    }
}
