//! Log/topic (Kafka) driver.
//!
//! Each queue maps to a topic. Messages are delivered by subscription rather
//! than polling: `pop` is unsupported and `size` always reports 0 because a
//! topic has no meaningful backlog count per consumer. Offsets are committed
//! after the callback returns, so a consumer that dies mid-message sees it
//! again (at-least-once).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, OnceCell};

use crate::error::{QueueError, Result};
use crate::serializer::SerializedJob;

use super::{
    BatchCapable, JobCallback, QueueDriver, SubscribableCapable, Subscription, TopicAdminCapable,
};

pub const DEFAULT_CONSUMER_GROUP: &str = "gravito-workers";

const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub key: Option<String>,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicOptions {
    pub partitions: i32,
    pub replication_factor: i16,
    pub config: HashMap<String, String>,
}

impl Default for TopicOptions {
    fn default() -> Self {
        Self {
            partitions: 1,
            replication_factor: 1,
            config: HashMap::new(),
        }
    }
}

#[async_trait]
pub trait LogProducer: Send + Sync {
    async fn connect(&self) -> Result<()>;

    async fn send(&self, topic: &str, records: Vec<LogRecord>) -> Result<()>;
}

#[async_trait]
pub trait LogConsumer: Send + Sync {
    async fn connect(&self) -> Result<()>;

    async fn subscribe(&self, topic: &str, from_beginning: bool) -> Result<()>;

    /// Next message, or `None` once the consumer is closed.
    async fn next_message(&self) -> Result<Option<LogMessage>>;

    async fn commit(&self, message: &LogMessage) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;
}

#[async_trait]
pub trait LogAdmin: Send + Sync {
    async fn connect(&self) -> Result<()>;

    async fn create_topic(&self, topic: &str, options: &TopicOptions) -> Result<()>;

    async fn delete_topics(&self, topics: &[String]) -> Result<()>;
}

/// Factory for producer, consumer and admin handles.
pub trait LogClient: Send + Sync {
    fn producer(&self) -> Arc<dyn LogProducer>;

    fn consumer(&self, group_id: &str) -> Arc<dyn LogConsumer>;

    fn admin(&self) -> Arc<dyn LogAdmin>;
}

pub struct KafkaDriver {
    client: Arc<dyn LogClient>,
    consumer_group_id: String,
    producer: OnceCell<Arc<dyn LogProducer>>,
    admin: OnceCell<Arc<dyn LogAdmin>>,
}

impl KafkaDriver {
    pub fn new(client: Arc<dyn LogClient>) -> Self {
        Self {
            client,
            consumer_group_id: DEFAULT_CONSUMER_GROUP.to_string(),
            producer: OnceCell::new(),
            admin: OnceCell::new(),
        }
    }

    pub fn with_consumer_group(mut self, group_id: &str) -> Self {
        self.consumer_group_id = group_id.to_string();
        self
    }

    pub fn consumer_group_id(&self) -> &str {
        &self.consumer_group_id
    }

    async fn producer(&self) -> Result<&Arc<dyn LogProducer>> {
        self.producer
            .get_or_try_init(|| async {
                let producer = self.client.producer();
                producer.connect().await?;
                tracing::info!("Kafka producer connected");
                Ok::<_, QueueError>(producer)
            })
            .await
    }

    async fn admin(&self) -> Result<&Arc<dyn LogAdmin>> {
        self.admin
            .get_or_try_init(|| async {
                let admin = self.client.admin();
                admin.connect().await?;
                Ok::<_, QueueError>(admin)
            })
            .await
    }

    fn record(job: &SerializedJob) -> Result<LogRecord> {
        Ok(LogRecord {
            key: Some(job.id.clone()),
            value: job.to_json()?,
        })
    }
}

#[async_trait]
impl QueueDriver for KafkaDriver {
    fn name(&self) -> &'static str {
        "kafka"
    }

    async fn push(&self, queue: &str, job: SerializedJob) -> Result<()> {
        let record = Self::record(&job)?;
        self.producer().await?.send(queue, vec![record]).await
    }

    async fn pop(&self, _queue: &str) -> Result<Option<SerializedJob>> {
        Err(QueueError::Unsupported {
            driver: "kafka",
            operation: "pop (use subscribe)",
        })
    }

    async fn size(&self, _queue: &str) -> Result<usize> {
        Ok(0)
    }

    /// Deletes the topic.
    async fn clear(&self, queue: &str) -> Result<()> {
        self.delete_topic(queue).await
    }

    fn as_batch(&self) -> Option<&dyn BatchCapable> {
        Some(self)
    }

    fn as_subscribable(&self) -> Option<&dyn SubscribableCapable> {
        Some(self)
    }

    fn as_topic_admin(&self) -> Option<&dyn TopicAdminCapable> {
        Some(self)
    }
}

#[async_trait]
impl BatchCapable for KafkaDriver {
    async fn push_many(&self, queue: &str, jobs: Vec<SerializedJob>) -> Result<()> {
        if jobs.is_empty() {
            return Ok(());
        }
        let records = jobs.iter().map(Self::record).collect::<Result<Vec<_>>>()?;
        self.producer().await?.send(queue, records).await
    }
}

#[async_trait]
impl TopicAdminCapable for KafkaDriver {
    async fn create_topic(&self, topic: &str, options: TopicOptions) -> Result<()> {
        self.admin().await?.create_topic(topic, &options).await?;
        tracing::info!(
            topic = %topic,
            partitions = options.partitions,
            replication_factor = options.replication_factor,
            "Kafka topic created"
        );
        Ok(())
    }

    async fn delete_topic(&self, topic: &str) -> Result<()> {
        self.admin()
            .await?
            .delete_topics(&[topic.to_string()])
            .await
    }
}

#[async_trait]
impl SubscribableCapable for KafkaDriver {
    async fn subscribe(&self, queue: &str, callback: JobCallback) -> Result<Subscription> {
        let consumer = self.client.consumer(&self.consumer_group_id);
        consumer.connect().await?;
        consumer.subscribe(queue, false).await?;

        tracing::info!(
            topic = %queue,
            group_id = %self.consumer_group_id,
            "Kafka subscription started"
        );

        let stop = Arc::new(Notify::new());
        let handle = tokio::spawn(run_subscription(
            consumer,
            queue.to_string(),
            callback,
            stop.clone(),
        ));
        Ok(Subscription::new(queue.to_string(), stop, handle))
    }
}

async fn run_subscription(
    consumer: Arc<dyn LogConsumer>,
    topic: String,
    callback: JobCallback,
    stop: Arc<Notify>,
) {
    loop {
        let message = tokio::select! {
            _ = stop.notified() => break,
            next = consumer.next_message() => next,
        };

        let message = match message {
            Ok(Some(message)) => message,
            Ok(None) => break,
            Err(e) => {
                tracing::error!(topic = %topic, error = %e, "Failed to receive Kafka message");
                tokio::time::sleep(RECEIVE_ERROR_BACKOFF).await;
                continue;
            }
        };

        match SerializedJob::from_json(&message.value) {
            Ok(job) => {
                let job_id = job.id.clone();
                if let Err(e) = callback(job).await {
                    tracing::error!(
                        topic = %topic,
                        job_id = %job_id,
                        error = %e,
                        "Subscription callback failed"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(
                    topic = %topic,
                    offset = message.offset,
                    error = %e,
                    "Skipping malformed Kafka message"
                );
            }
        }

        if let Err(e) = consumer.commit(&message).await {
            tracing::warn!(topic = %topic, offset = message.offset, error = %e, "Offset commit failed");
        }
    }

    if let Err(e) = consumer.disconnect().await {
        tracing::warn!(topic = %topic, error = %e, "Kafka consumer disconnect failed");
    }
    tracing::info!(topic = %topic, "Kafka subscription stopped");
}
