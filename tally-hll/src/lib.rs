//! Mergeable HyperLogLog sketches for approximate distinct counting.
//!
//! A [`Sketch`] estimates the number of distinct values it has seen using a
//! fixed amount of memory. Sketches with the same precision can be merged;
//! the merge is commutative, associative, and idempotent, which makes union
//! counting over many partial sketches safe regardless of who produced them
//! or in which order they are combined.
//!
//! The default precision is [`DEFAULT_PRECISION`] with a documented relative
//! error of [`ERROR_RATE`]. Both the precision and the hash function are part
//! of the persisted format: changing either invalidates stored sketches, so
//! the serialization carries a format version that is checked on decode.
#![warn(missing_docs)]

mod sketch;
pub use self::sketch::*;
