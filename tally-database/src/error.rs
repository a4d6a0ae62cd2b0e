use thiserror::Error;

/// An error returned by batched counting or sketch persistence.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// A query against the relational store failed.
    #[error("failed to query the database: {0}")]
    Query(#[from] sqlx::Error),

    /// A persisted sketch blob could not be decoded.
    #[error("failed to decode a persisted sketch: {0}")]
    Sketch(#[from] tally_hll::SketchError),

    /// A relation or column name contains characters outside the allowed set.
    #[error("invalid identifier `{0}`")]
    InvalidIdentifier(String),

    /// The batch walk did not terminate within the configured ceiling.
    #[error("batch scan exceeded the ceiling of {0} batches")]
    TooManyBatches(u32),
}

/// Result type for this crate.
pub type Result<T, E = DatabaseError> = std::result::Result<T, E>;
