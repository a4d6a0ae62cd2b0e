use serde::{Deserialize, Serialize};

use crate::error::DefinitionError;
use crate::events::EventSelectionRule;
use crate::time_frame::TimeFrame;

/// Attributes a metric may aggregate identities on.
///
/// The attribute ends up in storage keys and, for database metrics, in query
/// text; everything not on this list is rejected at definition time.
pub const ALLOWED_AGGREGATE_ATTRIBUTES: &[&str] = &["user_id", "project_id"];

/// One metric record as it appears in the static catalog.
///
/// Records are plain data; [`MetricDefinition::parse`] turns them into
/// validated definitions.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct MetricRecord {
    /// Unique metric name.
    pub name: String,
    /// The backing data source: `database`, `redis_counter`, `redis_hll`, or
    /// `generic`.
    pub data_source: String,
    /// The symbolic time frame; defaults to `none`.
    #[serde(default)]
    pub time_frame: Option<String>,
    /// Source-specific options.
    #[serde(default)]
    pub options: MetricOptions,
}

/// Options of a [`MetricRecord`].
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct MetricOptions {
    /// Telemetry events feeding this metric.
    #[serde(default)]
    pub events: Vec<String>,
    /// Cross-event aggregation.
    #[serde(default)]
    pub aggregate: Option<AggregateOptions>,
    /// The counting operation of the data source.
    #[serde(default)]
    pub operation: Option<String>,
    /// The relation counted by database metrics.
    #[serde(default)]
    pub relation: Option<String>,
    /// The counted column of distinct database operations.
    #[serde(default)]
    pub column: Option<String>,
    /// The timestamp column restricting database metrics to the window.
    #[serde(default)]
    pub timestamp_column: Option<String>,
}

/// Aggregation options of a [`MetricRecord`].
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AggregateOptions {
    /// The identity attribute events are joined on.
    #[serde(default)]
    pub attribute: Option<String>,
    /// `OR` for union semantics, `AND` for intersection semantics.
    pub operator: String,
}

/// The backing store of a metric.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataSource {
    /// Batched counts over a relational table.
    Database,
    /// Exact integer counters in the cache.
    RedisCounter,
    /// Approximate distinct counters in the cache.
    RedisHll,
    /// A caller-provided value.
    Generic,
}

impl DataSource {
    fn parse(metric: &str, value: &str) -> Result<Self, DefinitionError> {
        match value {
            "database" => Ok(Self::Database),
            "redis_counter" => Ok(Self::RedisCounter),
            "redis_hll" => Ok(Self::RedisHll),
            "generic" => Ok(Self::Generic),
            other => Err(DefinitionError::UnknownDataSource {
                metric: metric.to_owned(),
                value: other.to_owned(),
            }),
        }
    }

    /// The catalog name of this data source.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Database => "database",
            Self::RedisCounter => "redis_counter",
            Self::RedisHll => "redis_hll",
            Self::Generic => "generic",
        }
    }
}

/// Set semantics for combining multiple events into one metric.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggregateOperator {
    /// Union cardinality.
    Or,
    /// Intersection cardinality.
    And,
}

impl AggregateOperator {
    fn parse(metric: &str, value: &str) -> Result<Self, DefinitionError> {
        match value {
            "OR" => Ok(Self::Or),
            "AND" => Ok(Self::And),
            other => Err(DefinitionError::UnknownOperator {
                metric: metric.to_owned(),
                value: other.to_owned(),
            }),
        }
    }
}

/// A validated cross-event aggregation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Aggregate {
    /// The identity attribute events are joined on.
    pub attribute: Option<String>,
    /// The set operator.
    pub operator: AggregateOperator,
}

/// The exact counter operation of a `redis_counter` metric.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CounterOperation {
    /// Sum of per-event occurrence counters.
    #[default]
    TotalCount,
    /// Sum of per-event amount counters.
    Sum,
    /// Per-label breakdown from hash counters.
    UniqueTotals,
}

/// A validated metric definition.
///
/// Construction is the validation state machine: a [`MetricRecord`] either
/// becomes a `MetricDefinition` or is rejected with a [`DefinitionError`]
/// naming the offending field. No partially valid definitions exist.
#[derive(Clone, Debug)]
pub struct MetricDefinition {
    /// Unique metric name.
    pub name: String,
    /// The validated data source.
    pub data_source: DataSource,
    /// The validated time frame.
    pub time_frame: TimeFrame,
    /// Per-event selection rules, one per catalog event, in catalog order.
    pub events: Vec<EventSelectionRule>,
    /// Cross-event aggregation, when declared.
    pub aggregate: Option<Aggregate>,
    /// The counter operation of `redis_counter` metrics.
    pub counter_operation: CounterOperation,
    /// The batch operation of `database` metrics.
    pub batch_operation: Option<tally_database::Operation>,
    /// The relation of `database` metrics.
    pub relation: Option<String>,
    /// The counted column of distinct `database` operations.
    pub column: Option<String>,
    /// The timestamp column of `database` metrics.
    pub timestamp_column: String,
}

impl MetricDefinition {
    /// Validates a catalog record.
    pub fn parse(record: MetricRecord) -> Result<Self, DefinitionError> {
        let MetricRecord {
            name,
            data_source,
            time_frame,
            options,
        } = record;

        let data_source = DataSource::parse(&name, &data_source)?;

        let time_frame_symbol = time_frame.unwrap_or_else(|| "none".to_owned());
        let time_frame = TimeFrame::parse(&time_frame_symbol).map_err(|_| {
            DefinitionError::UnknownTimeFrame {
                metric: name.clone(),
                value: time_frame_symbol.clone(),
            }
        })?;

        let aggregate = options
            .aggregate
            .as_ref()
            .map(|aggregate| Self::parse_aggregate(&name, aggregate))
            .transpose()?;

        let mut definition = Self {
            name,
            data_source,
            time_frame,
            events: Vec::new(),
            aggregate,
            counter_operation: CounterOperation::default(),
            batch_operation: None,
            relation: None,
            column: None,
            timestamp_column: options
                .timestamp_column
                .clone()
                .unwrap_or_else(|| "created_at".to_owned()),
        };

        match data_source {
            DataSource::Database => definition.validate_database(&options)?,
            DataSource::RedisCounter => definition.validate_redis_counter(&options)?,
            DataSource::RedisHll => definition.validate_redis_hll(&options)?,
            DataSource::Generic => {}
        }

        Ok(definition)
    }

    fn parse_aggregate(
        metric: &str,
        options: &AggregateOptions,
    ) -> Result<Aggregate, DefinitionError> {
        if let Some(attribute) = &options.attribute {
            if !ALLOWED_AGGREGATE_ATTRIBUTES.contains(&attribute.as_str()) {
                return Err(DefinitionError::DisallowedAttribute {
                    metric: metric.to_owned(),
                    value: attribute.clone(),
                });
            }
        }

        Ok(Aggregate {
            attribute: options.attribute.clone(),
            operator: AggregateOperator::parse(metric, &options.operator)?,
        })
    }

    fn validate_database(&mut self, options: &MetricOptions) -> Result<(), DefinitionError> {
        let relation = options
            .relation
            .clone()
            .ok_or_else(|| self.missing("relation"))?;

        let operation_name = options
            .operation
            .clone()
            .ok_or_else(|| self.missing("operation"))?;
        let operation = tally_database::Operation::from_name(&operation_name).ok_or_else(|| {
            DefinitionError::UnimplementedOperation {
                metric: self.name.clone(),
                value: operation_name,
            }
        })?;

        if operation != tally_database::Operation::Count && options.column.is_none() {
            return Err(self.missing("column"));
        }

        self.relation = Some(relation);
        self.batch_operation = Some(operation);
        self.column = options.column.clone();
        Ok(())
    }

    fn validate_redis_counter(&mut self, options: &MetricOptions) -> Result<(), DefinitionError> {
        self.events = self.parse_events(options)?;

        if let Some(operation) = &options.operation {
            self.counter_operation = match operation.as_str() {
                "total_count" => CounterOperation::TotalCount,
                "sum" => CounterOperation::Sum,
                "unique_totals" => CounterOperation::UniqueTotals,
                other => {
                    return Err(DefinitionError::UnimplementedOperation {
                        metric: self.name.clone(),
                        value: other.to_owned(),
                    });
                }
            };
        }

        Ok(())
    }

    fn validate_redis_hll(&mut self, options: &MetricOptions) -> Result<(), DefinitionError> {
        if !self.time_frame.is_bucketed() {
            return Err(DefinitionError::UnsupportedTimeFrame {
                metric: self.name.clone(),
                value: self.time_frame.as_str().to_owned(),
                data_source: self.data_source.as_str(),
            });
        }

        self.events = self.parse_events(options)?;
        Ok(())
    }

    fn parse_events(
        &self,
        options: &MetricOptions,
    ) -> Result<Vec<EventSelectionRule>, DefinitionError> {
        if options.events.is_empty() {
            return Err(self.missing("events"));
        }

        let identifier = self
            .aggregate
            .as_ref()
            .and_then(|aggregate| aggregate.attribute.clone());

        Ok(options
            .events
            .iter()
            .map(|event| EventSelectionRule {
                event_name: event.clone(),
                time_framed: self.time_frame.is_bucketed(),
                unique_identifier_name: identifier.clone(),
            })
            .collect())
    }

    fn missing(&self, option: &'static str) -> DefinitionError {
        DefinitionError::MissingOption {
            metric: self.name.clone(),
            option,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(json: serde_json::Value) -> MetricRecord {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_redis_hll_requires_events() {
        let error = MetricDefinition::parse(record(serde_json::json!({
            "name": "users_searched",
            "data_source": "redis_hll",
            "time_frame": "7d",
            "options": {}
        })))
        .unwrap_err();

        match error {
            DefinitionError::MissingOption { metric, option } => {
                assert_eq!(metric, "users_searched");
                assert_eq!(option, "events");
            }
            other => panic!("expected MissingOption, got {other:?}"),
        }
    }

    #[test]
    fn test_redis_hll_rejects_unbucketed_time_frames() {
        for frame in ["all", "none"] {
            let error = MetricDefinition::parse(record(serde_json::json!({
                "name": "users_searched",
                "data_source": "redis_hll",
                "time_frame": frame,
                "options": { "events": ["search"] }
            })))
            .unwrap_err();

            assert!(matches!(
                error,
                DefinitionError::UnsupportedTimeFrame { .. }
            ));
        }
    }

    #[test]
    fn test_unknown_enums_are_rejected() {
        assert!(matches!(
            MetricDefinition::parse(record(serde_json::json!({
                "name": "m",
                "data_source": "elasticsearch",
            })))
            .unwrap_err(),
            DefinitionError::UnknownDataSource { .. }
        ));

        assert!(matches!(
            MetricDefinition::parse(record(serde_json::json!({
                "name": "m",
                "data_source": "redis_hll",
                "time_frame": "90d",
                "options": { "events": ["search"] }
            })))
            .unwrap_err(),
            DefinitionError::UnknownTimeFrame { .. }
        ));

        assert!(matches!(
            MetricDefinition::parse(record(serde_json::json!({
                "name": "m",
                "data_source": "redis_hll",
                "time_frame": "7d",
                "options": {
                    "events": ["a", "b"],
                    "aggregate": { "operator": "XOR" }
                }
            })))
            .unwrap_err(),
            DefinitionError::UnknownOperator { .. }
        ));
    }

    #[test]
    fn test_aggregate_attribute_allow_list() {
        let error = MetricDefinition::parse(record(serde_json::json!({
            "name": "m",
            "data_source": "redis_hll",
            "time_frame": "28d",
            "options": {
                "events": ["a", "b"],
                "aggregate": { "operator": "OR", "attribute": "password" }
            }
        })))
        .unwrap_err();

        match error {
            DefinitionError::DisallowedAttribute { value, .. } => {
                assert_eq!(value, "password");
            }
            other => panic!("expected DisallowedAttribute, got {other:?}"),
        }

        let definition = MetricDefinition::parse(record(serde_json::json!({
            "name": "m",
            "data_source": "redis_hll",
            "time_frame": "28d",
            "options": {
                "events": ["a", "b"],
                "aggregate": { "operator": "OR", "attribute": "user_id" }
            }
        })))
        .unwrap();

        assert_eq!(
            definition.aggregate.unwrap().operator,
            AggregateOperator::Or
        );
        assert_eq!(
            definition.events[0].unique_identifier_name.as_deref(),
            Some("user_id")
        );
    }

    #[test]
    fn test_database_metric_requires_relation_and_operation() {
        let error = MetricDefinition::parse(record(serde_json::json!({
            "name": "count_users",
            "data_source": "database",
            "time_frame": "all",
            "options": {}
        })))
        .unwrap_err();
        assert!(matches!(
            error,
            DefinitionError::MissingOption { option: "relation", .. }
        ));

        let error = MetricDefinition::parse(record(serde_json::json!({
            "name": "count_users",
            "data_source": "database",
            "time_frame": "all",
            "options": { "relation": "users" }
        })))
        .unwrap_err();
        assert!(matches!(
            error,
            DefinitionError::MissingOption { option: "operation", .. }
        ));
    }

    #[test]
    fn test_database_operation_fails_fast_at_definition_time() {
        let error = MetricDefinition::parse(record(serde_json::json!({
            "name": "count_users",
            "data_source": "database",
            "time_frame": "all",
            "options": { "relation": "users", "operation": "median" }
        })))
        .unwrap_err();

        match error {
            DefinitionError::UnimplementedOperation { value, .. } => {
                assert_eq!(value, "median");
            }
            other => panic!("expected UnimplementedOperation, got {other:?}"),
        }
    }

    #[test]
    fn test_distinct_database_operations_require_a_column() {
        let error = MetricDefinition::parse(record(serde_json::json!({
            "name": "distinct_users",
            "data_source": "database",
            "time_frame": "28d",
            "options": { "relation": "events", "operation": "distinct_count" }
        })))
        .unwrap_err();
        assert!(matches!(
            error,
            DefinitionError::MissingOption { option: "column", .. }
        ));

        let definition = MetricDefinition::parse(record(serde_json::json!({
            "name": "distinct_users",
            "data_source": "database",
            "time_frame": "28d",
            "options": {
                "relation": "events",
                "operation": "estimate_batch_distinct_count",
                "column": "user_id"
            }
        })))
        .unwrap();

        assert_eq!(
            definition.batch_operation,
            Some(tally_database::Operation::EstimateBatchDistinctCount)
        );
        assert_eq!(definition.timestamp_column, "created_at");
    }

    #[test]
    fn test_time_frame_defaults_to_none() {
        let definition = MetricDefinition::parse(record(serde_json::json!({
            "name": "version",
            "data_source": "generic",
        })))
        .unwrap();

        assert_eq!(definition.time_frame, TimeFrame::None);
    }
}
