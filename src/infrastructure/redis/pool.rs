//! Redis connection pool backing the Redis queue driver.

use std::future::Future;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, RedisError, RedisResult};
use tokio::sync::RwLock;

use crate::driver::KeyListClient;
use crate::error::Result;

/// Error type for Redis pool operations.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Redis operation failed
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    /// Connection not available
    #[error("Connection not available: {0}")]
    ConnectionUnavailable(String),
}

/// Lazily connected, multiplexed Redis connection shared by all tasks.
///
/// A dropped connection is discarded on the failing command so the next
/// call reconnects.
pub struct RedisPool {
    client: Client,
    connection: RwLock<Option<MultiplexedConnection>>,
    url: String,
}

impl RedisPool {
    /// Create a pool; no connection is made until the first command.
    pub fn new(url: &str) -> std::result::Result<Self, PoolError> {
        let client = Client::open(url)?;

        Ok(Self {
            client,
            connection: RwLock::new(None),
            url: url.to_string(),
        })
    }

    pub async fn get_connection(&self) -> std::result::Result<MultiplexedConnection, PoolError> {
        {
            let conn = self.connection.read().await;
            if let Some(ref c) = *conn {
                return Ok(c.clone());
            }
        }

        self.connect().await
    }

    async fn connect(&self) -> std::result::Result<MultiplexedConnection, PoolError> {
        let mut conn_guard = self.connection.write().await;

        // Another task may have connected while we waited for the lock
        if let Some(ref c) = *conn_guard {
            return Ok(c.clone());
        }

        match self.client.get_multiplexed_tokio_connection().await {
            Ok(conn) => {
                *conn_guard = Some(conn.clone());
                tracing::info!("Redis queue connection established");
                Ok(conn)
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to connect to Redis");
                Err(PoolError::ConnectionUnavailable(e.to_string()))
            }
        }
    }

    /// Run a command on the shared connection.
    pub async fn execute<F, T, Fut>(&self, f: F) -> std::result::Result<T, PoolError>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let conn = self.get_connection().await?;

        match f(conn).await {
            Ok(result) => Ok(result),
            Err(e) => {
                if e.is_connection_dropped() || e.is_io_error() {
                    let mut conn_guard = self.connection.write().await;
                    *conn_guard = None;
                }
                Err(PoolError::Redis(e))
            }
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn ping(&self) -> std::result::Result<(), PoolError> {
        let mut conn = self.get_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl KeyListClient for RedisPool {
    async fn lpush(&self, key: &str, values: Vec<String>) -> Result<()> {
        let key = key.to_string();
        self.execute(|mut conn| async move { conn.lpush::<_, _, ()>(key, values).await })
            .await?;
        Ok(())
    }

    async fn rpop(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        Ok(self
            .execute(|mut conn| async move { conn.rpop::<_, Option<String>>(key, None).await })
            .await?)
    }

    async fn llen(&self, key: &str) -> Result<usize> {
        let key = key.to_string();
        Ok(self
            .execute(|mut conn| async move { conn.llen::<_, usize>(key).await })
            .await?)
    }

    async fn del(&self, keys: &[String]) -> Result<()> {
        let keys = keys.to_vec();
        self.execute(|mut conn| async move { conn.del::<_, ()>(keys).await })
            .await?;
        Ok(())
    }

    fn supports_sorted_sets(&self) -> bool {
        true
    }

    async fn zadd(&self, key: &str, score: i64, member: String) -> Result<()> {
        let key = key.to_string();
        self.execute(|mut conn| async move { conn.zadd::<_, _, _, ()>(key, member, score).await })
            .await?;
        Ok(())
    }

    async fn zfirst(&self, key: &str) -> Result<Option<(String, i64)>> {
        let key = key.to_string();
        let first: Vec<(String, f64)> = self
            .execute(|mut conn| async move { conn.zrange_withscores(key, 0, 0).await })
            .await?;
        Ok(first
            .into_iter()
            .next()
            .map(|(member, score)| (member, score as i64)))
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let key = key.to_string();
        let member = member.to_string();
        let removed: i64 = self
            .execute(|mut conn| async move { conn.zrem(key, member).await })
            .await?;
        Ok(removed > 0)
    }
}
