use std::hash::{Hash, Hasher};

use thiserror::Error;
use twox_hash::XxHash64;

/// Default sketch precision.
///
/// `2^9 = 512` registers, with a relative error of [`ERROR_RATE`]. All
/// sketches produced by the engine use this precision so that cache-origin
/// and database-persisted sketches merge without conversion.
pub const DEFAULT_PRECISION: u8 = 9;

/// Documented relative error of a sketch with [`DEFAULT_PRECISION`].
pub const ERROR_RATE: f64 = 0.049;

/// Version of the serialized sketch format.
///
/// Increment whenever the register layout or the hash function changes.
/// Persisted sketches with a different version are rejected on decode.
const FORMAT_VERSION: u8 = 1;

/// Seed for the 64-bit hash of inserted values.
///
/// Fixed forever: persisted sketches hash with this seed and survive process
/// restarts and releases.
const HASH_SEED: u64 = 0x5F3A_91C4_2B68_D701;

const MIN_PRECISION: u8 = 4;
const MAX_PRECISION: u8 = 16;

/// An error produced when operating on [`Sketch`]es.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SketchError {
    /// The precision is outside of the supported range.
    #[error("precision must be in the inclusive range [{MIN_PRECISION}, {MAX_PRECISION}]")]
    InvalidPrecision,

    /// Two sketches of different precision cannot be merged.
    #[error("cannot merge sketches of different precisions ({0} and {1})")]
    IncompatiblePrecision(u8, u8),

    /// The serialized blob is shorter than its header declares.
    #[error("serialized sketch is truncated")]
    Truncated,

    /// The serialized blob was produced by an unsupported format version.
    #[error("unsupported sketch format version {0}")]
    UnsupportedVersion(u8),
}

/// Hashes a value into the 64-bit space used by [`Sketch`].
///
/// Exposed so that callers building sketches from pre-fetched values (e.g.
/// batched database scans) hash identically to [`Sketch::insert`].
pub fn hash_value<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = XxHash64::with_seed(HASH_SEED);
    value.hash(&mut hasher);
    hasher.finish()
}

/// Approximate distinct counter using HyperLogLog registers.
///
/// Each register stores the maximum observed run of leading zeros for values
/// hashed into its index. The cardinality estimate uses the harmonic-mean
/// formula with linear-counting correction for small ranges and a 64-bit
/// large-range correction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sketch {
    precision: u8,
    registers: Vec<u8>,
}

impl Default for Sketch {
    fn default() -> Self {
        Self::new()
    }
}

impl Sketch {
    /// Creates an empty sketch with [`DEFAULT_PRECISION`].
    pub fn new() -> Self {
        Self {
            precision: DEFAULT_PRECISION,
            registers: vec![0; 1 << DEFAULT_PRECISION],
        }
    }

    /// Creates an empty sketch with `2^precision` registers.
    pub fn with_precision(precision: u8) -> Result<Self, SketchError> {
        if !(MIN_PRECISION..=MAX_PRECISION).contains(&precision) {
            return Err(SketchError::InvalidPrecision);
        }

        Ok(Self {
            precision,
            registers: vec![0; 1 << precision],
        })
    }

    /// Returns the precision of this sketch.
    pub fn precision(&self) -> u8 {
        self.precision
    }

    /// Returns the number of registers (`2^precision`).
    pub fn register_count(&self) -> usize {
        self.registers.len()
    }

    /// Returns `true` if no value has been observed yet.
    pub fn is_empty(&self) -> bool {
        self.registers.iter().all(|&register| register == 0)
    }

    /// Adds one value to the sketch.
    pub fn insert<T: Hash + ?Sized>(&mut self, value: &T) {
        self.insert_hash(hash_value(value));
    }

    /// Adds a pre-hashed value to the sketch.
    ///
    /// The hash must come from [`hash_value`], otherwise merged estimates
    /// count the same identity twice.
    pub fn insert_hash(&mut self, hash: u64) {
        let index = (hash >> (64 - self.precision)) as usize;
        let rank = Self::rank(hash, self.precision);

        if rank > self.registers[index] {
            self.registers[index] = rank;
        }
    }

    /// Merges another sketch into this one by taking the register-wise
    /// maximum.
    ///
    /// The operation is commutative, associative, and idempotent: merging a
    /// sketch with itself does not change the estimate.
    pub fn merge(&mut self, other: &Self) -> Result<(), SketchError> {
        if self.precision != other.precision {
            return Err(SketchError::IncompatiblePrecision(
                self.precision,
                other.precision,
            ));
        }

        for (left, right) in self.registers.iter_mut().zip(other.registers.iter()) {
            *left = (*left).max(*right);
        }
        Ok(())
    }

    /// Returns the estimated cardinality.
    pub fn estimate(&self) -> f64 {
        if self.is_empty() {
            return 0.0;
        }

        let m = self.register_count() as f64;
        let harmonic_sum = self
            .registers
            .iter()
            .map(|&register| 2_f64.powi(-(register as i32)))
            .sum::<f64>();

        let raw_estimate = Self::alpha(self.register_count()) * m * m / harmonic_sum;
        let zero_registers = self
            .registers
            .iter()
            .filter(|&&register| register == 0)
            .count() as f64;

        // Small-range correction (linear counting).
        let corrected = if raw_estimate <= 2.5 * m && zero_registers > 0.0 {
            m * (m / zero_registers).ln()
        } else {
            raw_estimate
        };

        // Large-range correction in 64-bit hash space.
        let two_to_64 = (u64::MAX as f64) + 1.0;
        if corrected > two_to_64 / 30.0 {
            let ratio = (corrected / two_to_64).min(1.0 - f64::EPSILON);
            -two_to_64 * (1.0 - ratio).ln()
        } else {
            corrected
        }
    }

    /// Returns the estimated cardinality rounded to `u64`.
    pub fn cardinality(&self) -> u64 {
        self.estimate().round() as u64
    }

    /// Serializes the sketch into its persisted byte format.
    ///
    /// Layout: `[FORMAT_VERSION, precision, registers...]`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(2 + self.registers.len());
        bytes.push(FORMAT_VERSION);
        bytes.push(self.precision);
        bytes.extend_from_slice(&self.registers);
        bytes
    }

    /// Deserializes a sketch from its persisted byte format.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SketchError> {
        let [version, precision, registers @ ..] = bytes else {
            return Err(SketchError::Truncated);
        };

        if *version != FORMAT_VERSION {
            return Err(SketchError::UnsupportedVersion(*version));
        }
        if !(MIN_PRECISION..=MAX_PRECISION).contains(precision) {
            return Err(SketchError::InvalidPrecision);
        }
        if registers.len() != 1 << *precision {
            return Err(SketchError::Truncated);
        }

        Ok(Self {
            precision: *precision,
            registers: registers.to_vec(),
        })
    }

    /// The run of leading zeros in the part of the hash not used for the
    /// register index, counted from 1.
    fn rank(hash: u64, precision: u8) -> u8 {
        let max_rank = 64 - precision as u32 + 1;
        let remainder = hash << precision;
        (remainder.leading_zeros() + 1).min(max_rank) as u8
    }

    /// Bias correction constant of the raw harmonic-mean estimate.
    fn alpha(register_count: usize) -> f64 {
        match register_count {
            16 => 0.673,
            32 => 0.697,
            64 => 0.709,
            m => 0.7213 / (1.0 + 1.079 / m as f64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sketch_of(range: std::ops::Range<u64>) -> Sketch {
        let mut sketch = Sketch::new();
        for value in range {
            sketch.insert(&value);
        }
        sketch
    }

    #[test]
    fn test_empty_sketch() {
        let sketch = Sketch::new();
        assert!(sketch.is_empty());
        assert_eq!(sketch.cardinality(), 0);
        assert_eq!(sketch.register_count(), 512);
    }

    #[test]
    fn test_precision_bounds() {
        assert_eq!(
            Sketch::with_precision(3).unwrap_err(),
            SketchError::InvalidPrecision
        );
        assert_eq!(
            Sketch::with_precision(17).unwrap_err(),
            SketchError::InvalidPrecision
        );
        assert!(Sketch::with_precision(4).is_ok());
    }

    #[test]
    fn test_estimate_within_error_bound() {
        for &n in &[100_u64, 1_000, 10_000, 100_000] {
            let sketch = sketch_of(0..n);
            let estimate = sketch.estimate();
            let relative_error = (estimate - n as f64).abs() / n as f64;

            // Allow three standard errors to keep the test stable.
            assert!(
                relative_error <= 3.0 * ERROR_RATE,
                "estimate {estimate} for true cardinality {n} is off by {relative_error}"
            );
        }
    }

    #[test]
    fn test_merge_is_idempotent() {
        let sketch = sketch_of(0..5_000);
        let mut merged = sketch.clone();
        merged.merge(&sketch).unwrap();

        assert_eq!(merged, sketch);
    }

    #[test]
    fn test_merge_is_commutative() {
        let a = sketch_of(0..3_000);
        let b = sketch_of(2_000..6_000);

        let mut ab = a.clone();
        ab.merge(&b).unwrap();
        let mut ba = b.clone();
        ba.merge(&a).unwrap();

        assert_eq!(ab, ba);
    }

    #[test]
    fn test_merged_estimate_dominates_inputs() {
        let a = sketch_of(0..4_000);
        let b = sketch_of(3_000..5_000);

        let mut union = a.clone();
        union.merge(&b).unwrap();

        assert!(union.estimate() >= a.estimate().max(b.estimate()));
        assert!(union.estimate() <= (a.estimate() + b.estimate()) * (1.0 + 3.0 * ERROR_RATE));
    }

    #[test]
    fn test_disjoint_union_is_the_sum() {
        let a = sketch_of(0..5_000);
        let b = sketch_of(5_000..10_000);

        let mut union = a.clone();
        union.merge(&b).unwrap();

        let relative_error = (union.estimate() - 10_000.0).abs() / 10_000.0;
        assert!(relative_error <= 3.0 * ERROR_RATE);
    }

    #[test]
    fn test_merge_rejects_different_precisions() {
        let mut wide = Sketch::with_precision(12).unwrap();
        let narrow = Sketch::new();

        assert_eq!(
            wide.merge(&narrow).unwrap_err(),
            SketchError::IncompatiblePrecision(12, 9)
        );
    }

    #[test]
    fn test_bytes_roundtrip() {
        let sketch = sketch_of(0..1_000);
        let restored = Sketch::from_bytes(&sketch.to_bytes()).unwrap();

        assert_eq!(restored, sketch);
    }

    #[test]
    fn test_from_bytes_rejects_garbage() {
        assert_eq!(Sketch::from_bytes(&[]).unwrap_err(), SketchError::Truncated);
        assert_eq!(
            Sketch::from_bytes(&[FORMAT_VERSION]).unwrap_err(),
            SketchError::Truncated
        );
        assert_eq!(
            Sketch::from_bytes(&[99, DEFAULT_PRECISION, 0]).unwrap_err(),
            SketchError::UnsupportedVersion(99)
        );

        let mut bytes = sketch_of(0..10).to_bytes();
        bytes.truncate(100);
        assert_eq!(
            Sketch::from_bytes(&bytes).unwrap_err(),
            SketchError::Truncated
        );
    }

    #[test]
    fn test_insert_hash_matches_insert() {
        let mut by_value = Sketch::new();
        let mut by_hash = Sketch::new();

        for value in 0_u64..100 {
            by_value.insert(&value);
            by_hash.insert_hash(hash_value(&value));
        }

        assert_eq!(by_value, by_hash);
    }
}
