//! Deterministic in-memory implementations of the collaborator traits.
//!
//! These back the unit tests of this crate and of the instrumentation layer;
//! they are not meant for production use.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tally_hll::Sketch;

use crate::{IdRange, RelationSource, Result, SketchStore, TimeConstraint};

/// One row of a [`MemoryRelationSource`].
#[derive(Clone, Debug, Default)]
pub struct MemoryRow {
    /// Column values of the row, including its primary key.
    pub values: BTreeMap<String, i64>,
    /// The row's timestamp, matched against any [`TimeConstraint`].
    pub created_at: Option<DateTime<Utc>>,
}

impl MemoryRow {
    /// Creates a row with an `id` column.
    pub fn with_id(id: i64) -> Self {
        Self::default().value("id", id)
    }

    /// Sets a column value.
    pub fn value(mut self, column: &str, value: i64) -> Self {
        self.values.insert(column.to_owned(), value);
        self
    }

    /// Sets the row timestamp.
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }
}

/// An in-memory [`RelationSource`].
#[derive(Debug, Default)]
pub struct MemoryRelationSource {
    relation: String,
    rows: Vec<MemoryRow>,
    in_transaction: bool,
}

impl MemoryRelationSource {
    /// Creates a source for `relation` holding `rows`.
    pub fn new(relation: &str, rows: Vec<MemoryRow>) -> Self {
        Self {
            relation: relation.to_owned(),
            rows,
            in_transaction: false,
        }
    }

    /// Marks the source as running inside an open transaction.
    pub fn in_open_transaction(mut self) -> Self {
        self.in_transaction = true;
        self
    }

    fn matching<'a>(
        &'a self,
        column: &'a str,
        range: Option<IdRange>,
        time: Option<&'a TimeConstraint>,
    ) -> impl Iterator<Item = i64> + 'a {
        self.rows
            .iter()
            .filter(move |row| match (time, row.created_at) {
                (None, _) => true,
                (Some(time), Some(at)) => {
                    time.start.is_none_or(|start| at >= start)
                        && time.finish.is_none_or(|finish| at < finish)
                }
                (Some(_), None) => false,
            })
            .filter_map(move |row| row.values.get(column).copied())
            .filter(move |value| {
                range.is_none_or(|range| (range.start..=range.finish).contains(value))
            })
    }
}

#[async_trait]
impl RelationSource for MemoryRelationSource {
    fn relation(&self) -> &str {
        &self.relation
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    async fn min_value(&self, column: &str, time: Option<&TimeConstraint>) -> Result<Option<i64>> {
        Ok(self.matching(column, None, time).min())
    }

    async fn max_value(&self, column: &str, time: Option<&TimeConstraint>) -> Result<Option<i64>> {
        Ok(self.matching(column, None, time).max())
    }

    async fn count_between(
        &self,
        column: &str,
        range: IdRange,
        time: Option<&TimeConstraint>,
    ) -> Result<i64> {
        Ok(self.matching(column, Some(range), time).count() as i64)
    }

    async fn distinct_count_between(
        &self,
        column: &str,
        range: IdRange,
        time: Option<&TimeConstraint>,
    ) -> Result<i64> {
        let distinct: std::collections::BTreeSet<_> =
            self.matching(column, Some(range), time).collect();
        Ok(distinct.len() as i64)
    }

    async fn distinct_hashes_between(
        &self,
        column: &str,
        range: IdRange,
        time: Option<&TimeConstraint>,
    ) -> Result<Vec<u64>> {
        let distinct: std::collections::BTreeSet<_> =
            self.matching(column, Some(range), time).collect();
        Ok(distinct
            .into_iter()
            .map(|value| tally_hll::hash_value(&value))
            .collect())
    }
}

/// An in-memory [`SketchStore`].
#[derive(Debug, Default)]
pub struct MemorySketchStore {
    sketches: Mutex<BTreeMap<(String, String), Sketch>>,
}

impl MemorySketchStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored rows.
    pub fn len(&self) -> usize {
        self.sketches.lock().len()
    }

    /// Returns `true` if nothing has been stored.
    pub fn is_empty(&self) -> bool {
        self.sketches.lock().is_empty()
    }
}

#[async_trait]
impl SketchStore for MemorySketchStore {
    async fn save(&self, metric: &str, period: &str, sketch: &Sketch) -> Result<()> {
        let mut sketches = self.sketches.lock();
        match sketches.entry((metric.to_owned(), period.to_owned())) {
            std::collections::btree_map::Entry::Occupied(mut entry) => {
                entry.get_mut().merge(sketch)?;
            }
            std::collections::btree_map::Entry::Vacant(entry) => {
                entry.insert(sketch.clone());
            }
        }
        Ok(())
    }

    async fn load(&self, metric: &str, period: &str) -> Result<Option<Sketch>> {
        Ok(self
            .sketches
            .lock()
            .get(&(metric.to_owned(), period.to_owned()))
            .cloned())
    }
}
