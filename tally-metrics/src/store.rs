use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tally_redis::{AsyncRedisPool, redis};
use thiserror::Error;

/// An error produced by a [`CounterStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// The Redis backend failed.
    #[error("failed to communicate with the counter store: {0}")]
    Redis(#[from] tally_redis::RedisError),

    /// The store is unreachable.
    #[error("counter store unavailable")]
    Unavailable,
}

/// Result type for counter store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// The distributed cache collaborator boundary.
///
/// Counters are incremented by request-handling code concurrently with
/// telemetry computation, so reads are eventually-consistent snapshots. The
/// engine tolerates values growing between the start and end of a multi-key
/// read; telemetry over a live system is inherently approximate.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Reads the integer counter at `key`.
    async fn get(&self, key: &str) -> StoreResult<Option<i64>>;

    /// Reads many integer counters in one round trip.
    async fn get_many(&self, keys: &[String]) -> StoreResult<Vec<Option<i64>>>;

    /// Atomically adds `by` to the counter at `key` and returns the new
    /// value. A missing counter starts at zero.
    async fn increment(&self, key: &str, by: i64, expire: Option<Duration>) -> StoreResult<i64>;

    /// Reads the per-label hash counter at `key`.
    async fn read_hash(&self, key: &str) -> StoreResult<BTreeMap<String, i64>>;

    /// Atomically adds `by` to `field` of the hash counter at `key`.
    async fn hash_increment(&self, key: &str, field: &str, by: i64) -> StoreResult<i64>;

    /// Reads the opaque blob at `key`.
    async fn read_blob(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Reads many opaque blobs in one round trip.
    async fn read_blobs(&self, keys: &[String]) -> StoreResult<Vec<Option<Vec<u8>>>>;

    /// Writes the opaque blob at `key`.
    async fn write_blob(&self, key: &str, bytes: &[u8], expire: Option<Duration>)
    -> StoreResult<()>;
}

fn redis_err(error: redis::RedisError) -> StoreError {
    StoreError::Redis(tally_redis::RedisError::Redis(error))
}

/// A [`CounterStore`] backed by a pooled Redis client.
#[derive(Debug, Clone)]
pub struct RedisCounterStore {
    pool: AsyncRedisPool,
}

impl RedisCounterStore {
    /// Creates a store reading and writing through `pool`.
    pub fn new(pool: AsyncRedisPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn get(&self, key: &str) -> StoreResult<Option<i64>> {
        let mut connection = self.pool.get_connection().await?;
        let value: Option<i64> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut connection)
            .await
            .map_err(redis_err)?;
        Ok(value)
    }

    async fn get_many(&self, keys: &[String]) -> StoreResult<Vec<Option<i64>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut connection = self.pool.get_connection().await?;
        let values: Vec<Option<i64>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut connection)
            .await
            .map_err(redis_err)?;
        Ok(values)
    }

    async fn increment(&self, key: &str, by: i64, expire: Option<Duration>) -> StoreResult<i64> {
        let mut connection = self.pool.get_connection().await?;

        let mut pipe = redis::pipe();
        pipe.cmd("INCRBY").arg(key).arg(by);
        if let Some(expire) = expire {
            pipe.cmd("EXPIRE").arg(key).arg(expire.as_secs()).ignore();
        }

        let (value,): (i64,) = pipe
            .query_async(&mut connection)
            .await
            .map_err(redis_err)?;
        Ok(value)
    }

    async fn read_hash(&self, key: &str) -> StoreResult<BTreeMap<String, i64>> {
        let mut connection = self.pool.get_connection().await?;
        let hash: BTreeMap<String, i64> = redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut connection)
            .await
            .map_err(redis_err)?;
        Ok(hash)
    }

    async fn hash_increment(&self, key: &str, field: &str, by: i64) -> StoreResult<i64> {
        let mut connection = self.pool.get_connection().await?;
        let value: i64 = redis::cmd("HINCRBY")
            .arg(key)
            .arg(field)
            .arg(by)
            .query_async(&mut connection)
            .await
            .map_err(redis_err)?;
        Ok(value)
    }

    async fn read_blob(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let mut connection = self.pool.get_connection().await?;
        let blob: Option<Vec<u8>> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut connection)
            .await
            .map_err(redis_err)?;
        Ok(blob)
    }

    async fn read_blobs(&self, keys: &[String]) -> StoreResult<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut connection = self.pool.get_connection().await?;
        let blobs: Vec<Option<Vec<u8>>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut connection)
            .await
            .map_err(redis_err)?;
        Ok(blobs)
    }

    async fn write_blob(
        &self,
        key: &str,
        bytes: &[u8],
        expire: Option<Duration>,
    ) -> StoreResult<()> {
        let mut connection = self.pool.get_connection().await?;

        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(bytes);
        if let Some(expire) = expire {
            cmd.arg("EX").arg(expire.as_secs());
        }

        cmd.query_async::<()>(&mut connection)
            .await
            .map_err(redis_err)?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum StoredValue {
    Integer(i64),
    Hash(BTreeMap<String, i64>),
    Blob(Vec<u8>),
}

/// A deterministic in-memory [`CounterStore`] for tests.
///
/// Expiry hints are accepted and ignored; entries live as long as the store.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    values: Mutex<BTreeMap<String, StoredValue>>,
}

impl MemoryCounterStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of live keys.
    pub fn len(&self) -> usize {
        self.values.lock().len()
    }

    /// Returns `true` when no key has been written.
    pub fn is_empty(&self) -> bool {
        self.values.lock().is_empty()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn get(&self, key: &str) -> StoreResult<Option<i64>> {
        Ok(match self.values.lock().get(key) {
            Some(StoredValue::Integer(value)) => Some(*value),
            _ => None,
        })
    }

    async fn get_many(&self, keys: &[String]) -> StoreResult<Vec<Option<i64>>> {
        let values = self.values.lock();
        Ok(keys
            .iter()
            .map(|key| match values.get(key) {
                Some(StoredValue::Integer(value)) => Some(*value),
                _ => None,
            })
            .collect())
    }

    async fn increment(&self, key: &str, by: i64, _expire: Option<Duration>) -> StoreResult<i64> {
        let mut values = self.values.lock();
        let value = match values.get(key) {
            Some(StoredValue::Integer(value)) => value + by,
            _ => by,
        };
        values.insert(key.to_owned(), StoredValue::Integer(value));
        Ok(value)
    }

    async fn read_hash(&self, key: &str) -> StoreResult<BTreeMap<String, i64>> {
        Ok(match self.values.lock().get(key) {
            Some(StoredValue::Hash(hash)) => hash.clone(),
            _ => BTreeMap::new(),
        })
    }

    async fn hash_increment(&self, key: &str, field: &str, by: i64) -> StoreResult<i64> {
        let mut values = self.values.lock();
        let mut hash = match values.get(key) {
            Some(StoredValue::Hash(hash)) => hash.clone(),
            _ => BTreeMap::new(),
        };
        let value = hash.get(field).copied().unwrap_or(0) + by;
        hash.insert(field.to_owned(), value);
        values.insert(key.to_owned(), StoredValue::Hash(hash));
        Ok(value)
    }

    async fn read_blob(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(match self.values.lock().get(key) {
            Some(StoredValue::Blob(blob)) => Some(blob.clone()),
            _ => None,
        })
    }

    async fn read_blobs(&self, keys: &[String]) -> StoreResult<Vec<Option<Vec<u8>>>> {
        let values = self.values.lock();
        Ok(keys
            .iter()
            .map(|key| match values.get(key) {
                Some(StoredValue::Blob(blob)) => Some(blob.clone()),
                _ => None,
            })
            .collect())
    }

    async fn write_blob(
        &self,
        key: &str,
        bytes: &[u8],
        _expire: Option<Duration>,
    ) -> StoreResult<()> {
        self.values
            .lock()
            .insert(key.to_owned(), StoredValue::Blob(bytes.to_vec()));
        Ok(())
    }
}
