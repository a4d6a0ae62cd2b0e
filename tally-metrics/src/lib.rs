//! Usage-metrics instrumentation engine.
//!
//! The engine computes aggregate telemetry values ("how many users did X in
//! time window Y") from two backing stores: exact counters and
//! HyperLogLog sketches held in a distributed cache, and batched counts over
//! relational tables. Multiple named events combine with `AND`/`OR` set
//! semantics across multiple time windows.
//!
//! A report run takes validated [`MetricDefinition`]s from a static catalog,
//! selects the matching [`Instrumentation`] variant per metric, and produces
//! one [`MetricValue`] each. Definitions are validated eagerly: a broken
//! definition fails at construction, before any I/O. A metric whose source
//! fails at value time is replaced by a configurable fallback so that one
//! broken metric never aborts the whole report.
#![warn(missing_docs)]

mod aggregator;
pub use self::aggregator::*;

mod counters;
pub use self::counters::*;

mod definition;
pub use self::definition::*;

mod engine;
pub use self::engine::*;

mod error;
pub use self::error::*;

mod events;
pub use self::events::*;

mod instrumentation;
pub use self::instrumentation::*;

mod statsd;

mod store;
pub use self::store::*;

mod time_frame;
pub use self::time_frame::*;
