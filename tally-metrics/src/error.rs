use thiserror::Error;

use crate::store::StoreError;
use crate::time_frame::UnknownTimeFrameError;

/// An error raised while validating a metric definition.
///
/// Definition errors surface at construction time, never when the first
/// value is computed, and always name the offending field.
#[derive(Debug, Error)]
pub enum DefinitionError {
    /// A required option for the declared data source is missing.
    #[error("metric `{metric}` is missing required option `{option}`")]
    MissingOption {
        /// The metric being validated.
        metric: String,
        /// The missing option.
        option: &'static str,
    },

    /// The declared data source is not known.
    #[error("metric `{metric}` declares unknown data source `{value}`")]
    UnknownDataSource {
        /// The metric being validated.
        metric: String,
        /// The rejected value.
        value: String,
    },

    /// The declared time frame is not known.
    #[error("metric `{metric}` declares unknown time frame `{value}`")]
    UnknownTimeFrame {
        /// The metric being validated.
        metric: String,
        /// The rejected value.
        value: String,
    },

    /// The declared time frame is known but not supported by the data source.
    #[error("metric `{metric}` uses time frame `{value}`, which `{data_source}` does not support")]
    UnsupportedTimeFrame {
        /// The metric being validated.
        metric: String,
        /// The rejected value.
        value: String,
        /// The data source that rejected it.
        data_source: &'static str,
    },

    /// The aggregation operator is not `AND` or `OR`.
    #[error("metric `{metric}` declares unknown aggregation operator `{value}`")]
    UnknownOperator {
        /// The metric being validated.
        metric: String,
        /// The rejected value.
        value: String,
    },

    /// The aggregation attribute is not on the allow-list.
    #[error("metric `{metric}` aggregates on disallowed attribute `{value}`")]
    DisallowedAttribute {
        /// The metric being validated.
        metric: String,
        /// The rejected value.
        value: String,
    },

    /// The requested instrumentation operation does not exist.
    #[error("metric `{metric}` requests unimplemented operation `{value}`")]
    UnimplementedOperation {
        /// The metric being validated.
        metric: String,
        /// The rejected value.
        value: String,
    },
}

/// An error raised while computing a metric value.
#[derive(Debug, Error)]
pub enum ComputeError {
    /// A raw time frame symbol could not be resolved.
    #[error(transparent)]
    UnknownTimeFrame(#[from] UnknownTimeFrameError),

    /// The counter store could not be reached or returned garbage.
    #[error("counter store unavailable: {0}")]
    Store(#[from] StoreError),

    /// The relational store could not be reached or a batch walk failed.
    #[error("database unavailable: {0}")]
    Database(#[from] tally_database::DatabaseError),

    /// Sketch operations failed, e.g. on corrupted persisted data.
    #[error(transparent)]
    Sketch(#[from] tally_hll::SketchError),

    /// The metric references a relation that was never registered.
    #[error("unknown relation `{0}`")]
    UnknownRelation(String),

    /// A generic metric has no registered value provider.
    #[error("no value provider registered for generic metric `{0}`")]
    MissingProvider(String),
}
