//! Batched counting over large relational tables.
//!
//! Very large tables cannot be counted with a single `COUNT(*)` without
//! risking statement timeouts and long-held locks. The [`BatchCounter`]
//! instead walks a relation in bounded batches between the minimum and
//! maximum value of the batched column, summing exact counts or folding
//! distinct values into a [`Sketch`](tally_hll::Sketch).
//!
//! The relational store itself is only reachable through the
//! [`RelationSource`] trait, so tests run against a deterministic in-memory
//! implementation and production runs against Postgres via sqlx.
//!
//! Sketches built from database batches can be persisted per metric and time
//! period through a [`SketchStore`], allowing later report runs to merge
//! previously computed periods instead of rescanning them.
#![warn(missing_docs)]

mod batch;
pub use self::batch::*;

mod bounds;
pub use self::bounds::*;

mod error;
pub use self::error::*;

mod sketch_store;
pub use self::sketch_store::*;

mod source;
pub use self::source::*;

mod statsd;

pub mod testutils;
