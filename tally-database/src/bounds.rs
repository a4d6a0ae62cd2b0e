use std::time::{Duration, Instant};

use parking_lot::RwLock;

/// The `[start, finish]` boundaries of a batched walk.
///
/// Invariant: `start <= finish`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchBounds {
    /// Smallest value of the batched column.
    pub start: i64,
    /// Largest value of the batched column.
    pub finish: i64,
}

/// A read-mostly cache for batch boundaries.
///
/// Boundaries are expensive to compute on very large relations (`MIN`/`MAX`
/// over the batched column) and widen only slowly, so report runs may reuse
/// them for a bounded time. Entries are keyed by a caller-chosen name and
/// expire after the configured TTL.
///
/// Writes use last-writer-wins semantics. Losing a race only costs a
/// redundant recomputation, never correctness, because boundaries widen
/// monotonically.
pub struct BoundsCache {
    ttl: Duration,
    inner: RwLock<hashbrown::HashMap<String, Entry>>,
}

#[derive(Debug)]
struct Entry {
    bounds: BatchBounds,
    expires_at: Instant,
}

impl BoundsCache {
    /// Default time to live of a cached boundary pair.
    pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

    /// Creates a cache whose entries expire after `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: RwLock::new(hashbrown::HashMap::new()),
        }
    }

    /// Returns the cached boundaries for `key` if they have not expired.
    pub fn get(&self, key: &str) -> Option<BatchBounds> {
        let inner = self.inner.read();
        let entry = inner.get(key)?;

        (entry.expires_at > Instant::now()).then_some(entry.bounds)
    }

    /// Stores boundaries under `key`, replacing any previous entry.
    pub fn insert(&self, key: &str, bounds: BatchBounds) {
        let mut inner = self.inner.write();

        // Expired entries of other keys are dropped on the way; the map only
        // ever holds one entry per metric so this stays cheap.
        let now = Instant::now();
        inner.retain(|_, entry| entry.expires_at > now);

        inner.insert(
            key.to_owned(),
            Entry {
                bounds,
                expires_at: now + self.ttl,
            },
        );
    }
}

impl Default for BoundsCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_TTL)
    }
}
