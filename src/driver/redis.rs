//! Key-list (Redis) driver.
//!
//! Ready jobs are LPUSHed onto `{prefix}{queue}` and RPOPed from the other
//! end, giving FIFO order. Delayed jobs wait in the sorted set
//! `{prefix}{queue}:delayed` scored by their due time; `pop` checks that set
//! first. Clients without sorted-set support get delayed jobs pushed
//! immediately.

use std::sync::Arc;

use async_trait::async_trait;

use crate::clock::SharedClock;
use crate::error::{QueueError, Result};
use crate::serializer::SerializedJob;

use super::{BatchCapable, QueueDriver};

pub const DEFAULT_PREFIX: &str = "queue:";

/// List (and optionally sorted-set) operations the driver needs.
#[async_trait]
pub trait KeyListClient: Send + Sync {
    async fn lpush(&self, key: &str, values: Vec<String>) -> Result<()>;

    async fn rpop(&self, key: &str) -> Result<Option<String>>;

    async fn llen(&self, key: &str) -> Result<usize>;

    async fn del(&self, keys: &[String]) -> Result<()>;

    fn supports_sorted_sets(&self) -> bool {
        false
    }

    async fn zadd(&self, _key: &str, _score: i64, _member: String) -> Result<()> {
        Err(unsupported("ZADD"))
    }

    /// Lowest-scored member with its score.
    async fn zfirst(&self, _key: &str) -> Result<Option<(String, i64)>> {
        Err(unsupported("ZRANGE"))
    }

    /// Returns whether the member was present.
    async fn zrem(&self, _key: &str, _member: &str) -> Result<bool> {
        Err(unsupported("ZREM"))
    }
}

fn unsupported(operation: &'static str) -> QueueError {
    QueueError::Unsupported {
        driver: "redis",
        operation,
    }
}

pub struct RedisDriver {
    client: Arc<dyn KeyListClient>,
    prefix: String,
    clock: SharedClock,
}

impl RedisDriver {
    pub fn new(client: Arc<dyn KeyListClient>, clock: SharedClock) -> Self {
        Self {
            client,
            prefix: DEFAULT_PREFIX.to_string(),
            clock,
        }
    }

    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.to_string();
        self
    }

    fn key(&self, queue: &str) -> String {
        format!("{}{}", self.prefix, queue)
    }

    fn delayed_key(&self, queue: &str) -> String {
        format!("{}{}:delayed", self.prefix, queue)
    }

    async fn take_due_delayed(&self, queue: &str) -> Result<Option<SerializedJob>> {
        let delayed_key = self.delayed_key(queue);
        let Some((payload, due_at)) = self.client.zfirst(&delayed_key).await? else {
            return Ok(None);
        };
        if due_at > self.clock.now_millis() {
            return Ok(None);
        }
        // Another consumer may have claimed it between ZRANGE and ZREM
        if !self.client.zrem(&delayed_key, &payload).await? {
            return Ok(None);
        }
        parse_payload(&payload).map(Some)
    }
}

/// Redis removes the payload on pop, so a malformed one carries no handle.
fn parse_payload(payload: &str) -> Result<SerializedJob> {
    SerializedJob::from_json(payload).map_err(|e| QueueError::malformed(None, e))
}

#[async_trait]
impl QueueDriver for RedisDriver {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn push(&self, queue: &str, job: SerializedJob) -> Result<()> {
        let payload = job.to_json()?;
        match job.delay_seconds {
            Some(delay) if delay > 0 => {
                if self.client.supports_sorted_sets() {
                    let due_at = self.clock.now_millis() + (delay as i64) * 1000;
                    self.client.zadd(&self.delayed_key(queue), due_at, payload).await
                } else {
                    tracing::debug!(
                        queue = %queue,
                        job_id = %job.id,
                        "Client has no sorted sets, pushing delayed job immediately"
                    );
                    self.client.lpush(&self.key(queue), vec![payload]).await
                }
            }
            _ => self.client.lpush(&self.key(queue), vec![payload]).await,
        }
    }

    async fn pop(&self, queue: &str) -> Result<Option<SerializedJob>> {
        if self.client.supports_sorted_sets() {
            if let Some(job) = self.take_due_delayed(queue).await? {
                return Ok(Some(job));
            }
        }

        match self.client.rpop(&self.key(queue)).await? {
            Some(payload) => parse_payload(&payload).map(Some),
            None => Ok(None),
        }
    }

    /// Ready jobs only; delayed jobs are not counted.
    async fn size(&self, queue: &str) -> Result<usize> {
        self.client.llen(&self.key(queue)).await
    }

    async fn clear(&self, queue: &str) -> Result<()> {
        self.client
            .del(&[self.key(queue), self.delayed_key(queue)])
            .await
    }

    fn as_batch(&self) -> Option<&dyn BatchCapable> {
        Some(self)
    }
}

#[async_trait]
impl BatchCapable for RedisDriver {
    async fn push_many(&self, queue: &str, jobs: Vec<SerializedJob>) -> Result<()> {
        let mut ready = Vec::with_capacity(jobs.len());
        for job in jobs {
            if job.delay_seconds.unwrap_or(0) > 0 && self.client.supports_sorted_sets() {
                self.push(queue, job).await?;
            } else {
                ready.push(job.to_json()?);
            }
        }
        if ready.is_empty() {
            return Ok(());
        }
        self.client.lpush(&self.key(queue), ready).await
    }

    async fn pop_many(&self, queue: &str, count: usize) -> Result<Vec<SerializedJob>> {
        let key = self.key(queue);
        let mut jobs = Vec::with_capacity(count);
        while jobs.len() < count {
            match self.client.rpop(&key).await? {
                Some(payload) => match parse_payload(&payload) {
                    Ok(job) => jobs.push(job),
                    Err(e) => tracing::error!(queue = %queue, error = %e, "Skipping malformed payload"),
                },
                None => break,
            }
        }
        Ok(jobs)
    }
}
