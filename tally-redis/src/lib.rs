//! Abstraction over pooled Redis caches.
//!
//! The engine talks to Redis exclusively through [`AsyncRedisPool`] and
//! [`AsyncRedisConnection`], which hide whether the upstream is a single node
//! or a cluster.
#![warn(missing_docs)]

mod config;
pub use self::config::*;

mod pool;
pub use self::pool::*;

pub use deadpool_redis::redis;
