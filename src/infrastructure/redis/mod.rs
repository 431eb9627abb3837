//! Redis client used by the Redis queue driver.

pub mod pool;

pub use pool::{PoolError, RedisPool};
