use tally_hll::{Sketch, SketchError};

use crate::definition::AggregateOperator;

/// Combines per-event sketches according to an [`AggregateOperator`].
///
/// `OR` merges every sketch register-wise and estimates once on the result,
/// which bounds the union by `max(|A|,|B|) <= |A∪B| <= |A|+|B|`. `AND` is not
/// directly expressible on sketches and falls back to inclusion–exclusion
/// over subset unions; beyond two events the error compounds with every term.
///
/// Sketches from different origins (cache buckets, database-persisted rows)
/// must be merged into one sketch *before* estimating. Summing two estimates
/// would double count every identity present in both sources.
pub struct Aggregator;

impl Aggregator {
    /// Merges all sketches into one union sketch.
    pub fn union(sketches: &[Sketch]) -> Result<Sketch, SketchError> {
        let mut merged = Sketch::new();
        for sketch in sketches {
            merged.merge(sketch)?;
        }
        Ok(merged)
    }

    /// Estimates the combined cardinality of `sketches` under `operator`.
    pub fn estimate(
        operator: AggregateOperator,
        sketches: &[Sketch],
    ) -> Result<f64, SketchError> {
        match operator {
            AggregateOperator::Or => Ok(Self::union(sketches)?.estimate()),
            AggregateOperator::And => Self::intersection_estimate(sketches),
        }
    }

    /// Inclusion–exclusion over all non-empty subsets:
    /// `|∩ A_i| = Σ (-1)^(|S|+1) |∪_{i∈S} A_i|`.
    fn intersection_estimate(sketches: &[Sketch]) -> Result<f64, SketchError> {
        match sketches {
            [] => return Ok(0.0),
            [only] => return Ok(only.estimate()),
            _ => {}
        }

        let mut estimate = 0.0;
        for mask in 1_u32..(1 << sketches.len()) {
            let mut union = Sketch::new();
            for (index, sketch) in sketches.iter().enumerate() {
                if mask & (1 << index) != 0 {
                    union.merge(sketch)?;
                }
            }

            let sign = if mask.count_ones() % 2 == 1 { 1.0 } else { -1.0 };
            estimate += sign * union.estimate();
        }

        // Estimator noise can push inclusion-exclusion slightly outside the
        // feasible range.
        let smallest = sketches
            .iter()
            .map(Sketch::estimate)
            .fold(f64::INFINITY, f64::min);
        Ok(estimate.clamp(0.0, smallest))
    }
}
