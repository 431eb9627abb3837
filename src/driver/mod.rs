//! Queue drivers
//!
//! Every backend implements [`QueueDriver`] (push/pop/size/clear). Optional
//! behaviour is exposed through capability traits that callers query with
//! the `as_*` methods instead of probing for methods at runtime:
//!
//! | Capability              | memory | database | redis | kafka | sqs |
//! |-------------------------|--------|----------|-------|-------|-----|
//! | [`BatchCapable`]        | yes    | yes      | yes   | yes   | yes |
//! | [`AcknowledgeCapable`]  |        | yes      |       |       | yes |
//! | [`SubscribableCapable`] |        |          |       | yes   |     |
//! | [`TopicAdminCapable`]   |        |          |       | yes   |     |

mod database;
mod kafka;
mod memory;
mod redis;
mod sqs;

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::clock::SharedClock;
use crate::config::ConnectionConfig;
use crate::error::{JobError, QueueError, Result};
use crate::serializer::SerializedJob;

pub use database::{
    create_table_sql, DatabaseDriver, DatabaseService, SqlRow, SqlStatement, SqlValue,
    DEFAULT_LEASE_SECONDS, DEFAULT_TABLE,
};
pub use kafka::{
    KafkaDriver, LogAdmin, LogClient, LogConsumer, LogMessage, LogProducer, LogRecord,
    TopicOptions, DEFAULT_CONSUMER_GROUP,
};
pub use memory::MemoryDriver;
pub use redis::{KeyListClient, RedisDriver, DEFAULT_PREFIX};
pub use sqs::{
    ManagedQueueClient, SqsBatchEntry, SqsCommand, SqsDriver, SqsMessage, SqsResponse,
    MAX_BATCH_SIZE, MAX_DELAY_SECONDS,
};

/// Backend contract shared by all drivers.
#[async_trait]
pub trait QueueDriver: Send + Sync {
    /// Driver kind, as used in connection configs
    fn name(&self) -> &'static str;

    async fn push(&self, queue: &str, job: SerializedJob) -> Result<()>;

    /// Take the next eligible job, if any
    async fn pop(&self, queue: &str) -> Result<Option<SerializedJob>>;

    /// Number of jobs in the queue, as precisely as the backend allows
    async fn size(&self, queue: &str) -> Result<usize>;

    async fn clear(&self, queue: &str) -> Result<()>;

    fn as_batch(&self) -> Option<&dyn BatchCapable> {
        None
    }

    fn as_acknowledge(&self) -> Option<&dyn AcknowledgeCapable> {
        None
    }

    fn as_subscribable(&self) -> Option<&dyn SubscribableCapable> {
        None
    }

    fn as_topic_admin(&self) -> Option<&dyn TopicAdminCapable> {
        None
    }
}

pub type SharedDriver = Arc<dyn QueueDriver>;

/// Batched push and pop.
#[async_trait]
pub trait BatchCapable: QueueDriver {
    async fn push_many(&self, queue: &str, jobs: Vec<SerializedJob>) -> Result<()>;

    async fn pop_many(&self, queue: &str, count: usize) -> Result<Vec<SerializedJob>> {
        let mut jobs = Vec::with_capacity(count);
        while jobs.len() < count {
            match self.pop(queue).await? {
                Some(job) => jobs.push(job),
                None => break,
            }
        }
        Ok(jobs)
    }
}

/// Drivers that keep a popped job reserved until it is acknowledged.
#[async_trait]
pub trait AcknowledgeCapable: QueueDriver {
    /// Permanently remove a job previously returned by `pop`.
    async fn acknowledge(&self, queue: &str, job: &SerializedJob) -> Result<()> {
        match job.receipt_handle.as_deref() {
            Some(receipt_handle) => self.acknowledge_handle(queue, receipt_handle).await,
            None => {
                tracing::debug!(queue = %queue, job_id = %job.id, "No receipt handle, nothing to acknowledge");
                Ok(())
            }
        }
    }

    /// Remove a delivery by its driver handle (row id, receipt handle). Used
    /// directly for deliveries whose payload could not be parsed.
    async fn acknowledge_handle(&self, queue: &str, receipt_handle: &str) -> Result<()>;
}

/// Callback invoked for every message delivered by a subscription.
pub type JobCallback =
    Arc<dyn Fn(SerializedJob) -> BoxFuture<'static, std::result::Result<(), JobError>> + Send + Sync>;

/// Push-based delivery for log/topic brokers.
#[async_trait]
pub trait SubscribableCapable: QueueDriver {
    async fn subscribe(&self, queue: &str, callback: JobCallback) -> Result<Subscription>;
}

/// Topic lifecycle management.
#[async_trait]
pub trait TopicAdminCapable: QueueDriver {
    async fn create_topic(&self, topic: &str, options: TopicOptions) -> Result<()>;

    async fn delete_topic(&self, topic: &str) -> Result<()>;
}

/// A running subscription loop.
pub struct Subscription {
    queue: String,
    stop: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl Subscription {
    pub(crate) fn new(queue: String, stop: Arc<Notify>, handle: JoinHandle<()>) -> Self {
        Self {
            queue,
            stop,
            handle,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop receiving and wait for the in-flight message to finish.
    pub async fn stop(self) {
        self.stop.notify_one();
        if let Err(e) = self.handle.await {
            tracing::warn!(queue = %self.queue, error = %e, "Subscription task ended abnormally");
        }
    }
}

/// Build a driver from a connection config.
///
/// Fails fast with [`QueueError::UnsupportedDriver`] for unknown kinds and
/// [`QueueError::MissingDependency`] when the backend client is absent.
pub fn create_driver(config: &ConnectionConfig, clock: SharedClock) -> Result<SharedDriver> {
    let clients = &config.clients;
    match config.driver.as_str() {
        "memory" => Ok(Arc::new(MemoryDriver::with_clock(clock))),
        "database" => {
            let db = clients
                .database
                .clone()
                .ok_or_else(|| QueueError::missing_dependency("database", "database service"))?;
            let mut driver = DatabaseDriver::new(db, clock);
            if let Some(table) = &config.table {
                driver = driver.with_table(table);
            }
            if let Some(lease) = config.lease_seconds {
                driver = driver.with_lease_seconds(lease);
            }
            Ok(Arc::new(driver))
        }
        "redis" => {
            let client = clients
                .key_list
                .clone()
                .ok_or_else(|| QueueError::missing_dependency("redis", "key-list client"))?;
            let mut driver = RedisDriver::new(client, clock);
            if let Some(prefix) = &config.prefix {
                driver = driver.with_prefix(prefix);
            }
            Ok(Arc::new(driver))
        }
        "kafka" => {
            let client = clients
                .log
                .clone()
                .ok_or_else(|| QueueError::missing_dependency("kafka", "log client"))?;
            let mut driver = KafkaDriver::new(client);
            if let Some(group) = &config.consumer_group_id {
                driver = driver.with_consumer_group(group);
            }
            Ok(Arc::new(driver))
        }
        "sqs" => {
            let client = clients
                .managed_queue
                .clone()
                .ok_or_else(|| QueueError::missing_dependency("sqs", "managed queue client"))?;
            let mut driver = SqsDriver::new(client);
            if let Some(prefix) = &config.queue_url_prefix {
                driver = driver.with_queue_url_prefix(prefix);
            }
            if let Some(timeout) = config.visibility_timeout {
                driver = driver.with_visibility_timeout(timeout);
            }
            if let Some(wait) = config.wait_time_seconds {
                driver = driver.with_wait_time_seconds(wait);
            }
            Ok(Arc::new(driver))
        }
        other => Err(QueueError::UnsupportedDriver(other.to_string())),
    }
}
