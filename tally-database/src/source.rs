use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::Row;

use crate::{DatabaseError, Result};

/// An inclusive range of values of the batched column.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdRange {
    /// The first value included in the batch.
    pub start: i64,
    /// The last value included in the batch.
    pub finish: i64,
}

/// Restricts an operation to rows whose timestamp column falls into a window.
///
/// `start` is inclusive, `finish` is exclusive. A missing bound leaves that
/// side of the window open.
#[derive(Clone, Debug)]
pub struct TimeConstraint {
    /// The timestamp column to restrict on.
    pub column: String,
    /// Inclusive lower bound.
    pub start: Option<DateTime<Utc>>,
    /// Exclusive upper bound.
    pub finish: Option<DateTime<Utc>>,
}

impl TimeConstraint {
    /// Creates a constraint on `column` for the window `[start, finish)`.
    pub fn between(column: &str, start: DateTime<Utc>, finish: DateTime<Utc>) -> Self {
        Self {
            column: column.to_owned(),
            start: Some(start),
            finish: Some(finish),
        }
    }
}

/// The relational collaborator boundary.
///
/// One instance corresponds to one relation. All operations are reads; the
/// engine never mutates the relation it counts.
#[async_trait]
pub trait RelationSource: Send + Sync {
    /// The name of the relation this source reads.
    fn relation(&self) -> &str;

    /// Whether the caller handed this source a connection with an open
    /// transaction.
    ///
    /// Batch boundaries must not be cached when this returns `true`: reads
    /// inside a transaction see a snapshot that other report runs must not
    /// inherit.
    fn in_transaction(&self) -> bool;

    /// Returns the smallest value of `column`, or `None` for an empty
    /// relation.
    async fn min_value(&self, column: &str, time: Option<&TimeConstraint>) -> Result<Option<i64>>;

    /// Returns the largest value of `column`, or `None` for an empty
    /// relation.
    async fn max_value(&self, column: &str, time: Option<&TimeConstraint>) -> Result<Option<i64>>;

    /// Counts rows whose `column` value falls into `range`.
    async fn count_between(
        &self,
        column: &str,
        range: IdRange,
        time: Option<&TimeConstraint>,
    ) -> Result<i64>;

    /// Counts distinct values of `column` within `range`.
    async fn distinct_count_between(
        &self,
        column: &str,
        range: IdRange,
        time: Option<&TimeConstraint>,
    ) -> Result<i64>;

    /// Returns the hashes of the distinct values of `column` within `range`.
    ///
    /// Values are hashed with [`tally_hll::hash_value`] so that sketches
    /// built from different sources remain mergeable.
    async fn distinct_hashes_between(
        &self,
        column: &str,
        range: IdRange,
        time: Option<&TimeConstraint>,
    ) -> Result<Vec<u64>>;
}

/// Validates a SQL identifier coming from the metric catalog.
///
/// Relation and column names are interpolated into query strings, so only a
/// conservative character set is accepted.
pub(crate) fn validate_identifier(identifier: &str) -> Result<&str> {
    let valid = !identifier.is_empty()
        && identifier
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid {
        Ok(identifier)
    } else {
        Err(DatabaseError::InvalidIdentifier(identifier.to_owned()))
    }
}

/// A [`RelationSource`] backed by a Postgres connection pool.
///
/// Connections are acquired from the pool per statement and are therefore
/// never part of a caller transaction.
#[derive(Debug, Clone)]
pub struct PgRelationSource {
    pool: PgPool,
    relation: String,
}

impl PgRelationSource {
    /// Creates a source reading `relation` through `pool`.
    pub fn new(pool: PgPool, relation: &str) -> Result<Self> {
        validate_identifier(relation)?;
        Ok(Self {
            pool,
            relation: relation.to_owned(),
        })
    }

    /// Appends the time constraint to `sql` and returns the bind values.
    ///
    /// `next_param` is the index of the first unused bind parameter.
    fn push_time_clause(
        sql: &mut String,
        time: Option<&TimeConstraint>,
        mut next_param: usize,
    ) -> Result<Vec<DateTime<Utc>>> {
        let mut binds = Vec::new();
        let Some(time) = time else {
            return Ok(binds);
        };

        validate_identifier(&time.column)?;
        if let Some(start) = time.start {
            sql.push_str(&format!(" AND {} >= ${next_param}", time.column));
            binds.push(start);
            next_param += 1;
        }
        if let Some(finish) = time.finish {
            sql.push_str(&format!(" AND {} < ${next_param}", time.column));
            binds.push(finish);
        }

        Ok(binds)
    }

    async fn aggregate_value(
        &self,
        aggregate: &str,
        column: &str,
        time: Option<&TimeConstraint>,
    ) -> Result<Option<i64>> {
        validate_identifier(column)?;

        let mut sql = format!(
            "SELECT {aggregate}({column}) FROM {} WHERE TRUE",
            self.relation
        );
        let binds = Self::push_time_clause(&mut sql, time, 1)?;

        let mut query = sqlx::query_scalar::<_, Option<i64>>(&sql);
        for bind in binds {
            query = query.bind(bind);
        }

        Ok(query.fetch_one(&self.pool).await?)
    }
}

#[async_trait]
impl RelationSource for PgRelationSource {
    fn relation(&self) -> &str {
        &self.relation
    }

    fn in_transaction(&self) -> bool {
        false
    }

    async fn min_value(&self, column: &str, time: Option<&TimeConstraint>) -> Result<Option<i64>> {
        self.aggregate_value("MIN", column, time).await
    }

    async fn max_value(&self, column: &str, time: Option<&TimeConstraint>) -> Result<Option<i64>> {
        self.aggregate_value("MAX", column, time).await
    }

    async fn count_between(
        &self,
        column: &str,
        range: IdRange,
        time: Option<&TimeConstraint>,
    ) -> Result<i64> {
        validate_identifier(column)?;

        let mut sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {column} BETWEEN $1 AND $2",
            self.relation
        );
        let binds = Self::push_time_clause(&mut sql, time, 3)?;

        let mut query = sqlx::query_scalar::<_, i64>(&sql)
            .bind(range.start)
            .bind(range.finish);
        for bind in binds {
            query = query.bind(bind);
        }

        Ok(query.fetch_one(&self.pool).await?)
    }

    async fn distinct_count_between(
        &self,
        column: &str,
        range: IdRange,
        time: Option<&TimeConstraint>,
    ) -> Result<i64> {
        validate_identifier(column)?;

        let mut sql = format!(
            "SELECT COUNT(DISTINCT {column}) FROM {} WHERE {column} BETWEEN $1 AND $2",
            self.relation
        );
        let binds = Self::push_time_clause(&mut sql, time, 3)?;

        let mut query = sqlx::query_scalar::<_, i64>(&sql)
            .bind(range.start)
            .bind(range.finish);
        for bind in binds {
            query = query.bind(bind);
        }

        Ok(query.fetch_one(&self.pool).await?)
    }

    async fn distinct_hashes_between(
        &self,
        column: &str,
        range: IdRange,
        time: Option<&TimeConstraint>,
    ) -> Result<Vec<u64>> {
        validate_identifier(column)?;

        let mut sql = format!(
            "SELECT DISTINCT {column} FROM {} WHERE {column} BETWEEN $1 AND $2",
            self.relation
        );
        let binds = Self::push_time_clause(&mut sql, time, 3)?;

        let mut query = sqlx::query(&sql).bind(range.start).bind(range.finish);
        for bind in binds {
            query = query.bind(bind);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| Ok(tally_hll::hash_value(&row.try_get::<i64, _>(0)?)))
            .collect()
    }
}
