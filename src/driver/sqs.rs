//! Managed queue (SQS) driver.
//!
//! Visibility and redelivery are handled by the service: a received message
//! stays hidden for the visibility timeout and reappears unless deleted with
//! its receipt handle, which `pop` stores on the envelope.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::{QueueError, Result};
use crate::serializer::SerializedJob;

use super::{AcknowledgeCapable, BatchCapable, QueueDriver};

/// Longest delay the service accepts, in seconds.
pub const MAX_DELAY_SECONDS: u64 = 900;

/// Maximum entries per batch send.
pub const MAX_BATCH_SIZE: usize = 10;

const DEFAULT_VISIBILITY_TIMEOUT: u32 = 30;
const DEFAULT_WAIT_TIME_SECONDS: u32 = 20;
const APPROXIMATE_NUMBER_OF_MESSAGES: &str = "ApproximateNumberOfMessages";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqsBatchEntry {
    pub id: String,
    pub body: String,
    pub delay_seconds: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqsCommand {
    SendMessage {
        queue_url: String,
        body: String,
        delay_seconds: u32,
    },
    SendMessageBatch {
        queue_url: String,
        entries: Vec<SqsBatchEntry>,
    },
    ReceiveMessage {
        queue_url: String,
        max_messages: u32,
        wait_time_seconds: u32,
        visibility_timeout: u32,
    },
    DeleteMessage {
        queue_url: String,
        receipt_handle: String,
    },
    GetQueueAttributes {
        queue_url: String,
        attribute_names: Vec<String>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SqsMessage {
    pub message_id: Option<String>,
    pub body: Option<String>,
    pub receipt_handle: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SqsResponse {
    pub messages: Vec<SqsMessage>,
    pub attributes: HashMap<String, String>,
}

/// Command-style client, mirroring the AWS SDK's `send(command)`.
#[async_trait]
pub trait ManagedQueueClient: Send + Sync {
    async fn send(&self, command: SqsCommand) -> Result<SqsResponse>;
}

pub struct SqsDriver {
    client: Arc<dyn ManagedQueueClient>,
    queue_url_prefix: Option<String>,
    visibility_timeout: u32,
    wait_time_seconds: u32,
    queue_urls: DashMap<String, String>,
}

impl SqsDriver {
    pub fn new(client: Arc<dyn ManagedQueueClient>) -> Self {
        Self {
            client,
            queue_url_prefix: None,
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            wait_time_seconds: DEFAULT_WAIT_TIME_SECONDS,
            queue_urls: DashMap::new(),
        }
    }

    pub fn with_queue_url_prefix(mut self, prefix: &str) -> Self {
        self.queue_url_prefix = Some(prefix.trim_end_matches('/').to_string());
        self
    }

    pub fn with_visibility_timeout(mut self, seconds: u32) -> Self {
        self.visibility_timeout = seconds;
        self
    }

    pub fn with_wait_time_seconds(mut self, seconds: u32) -> Self {
        self.wait_time_seconds = seconds;
        self
    }

    /// `{prefix}/{queue}` when a prefix is configured, else the queue name is
    /// taken to be a full URL.
    pub fn queue_url(&self, queue: &str) -> String {
        if let Some(url) = self.queue_urls.get(queue) {
            return url.clone();
        }
        let url = match &self.queue_url_prefix {
            Some(prefix) if !prefix.is_empty() => format!("{}/{}", prefix, queue),
            _ => queue.to_string(),
        };
        self.queue_urls.insert(queue.to_string(), url.clone());
        url
    }

    fn delay_for(job: &SerializedJob) -> u32 {
        job.delay_seconds.unwrap_or(0).min(MAX_DELAY_SECONDS) as u32
    }

    fn parse_message(message: SqsMessage) -> Result<SerializedJob> {
        let receipt_handle = message.receipt_handle;
        let malformed = |e: QueueError| QueueError::malformed(receipt_handle.clone(), e);

        let mut payload: serde_json::Value =
            serde_json::from_str(message.body.as_deref().unwrap_or("{}"))
                .map_err(|e| malformed(e.into()))?;
        if payload.get("id").is_none() {
            if let (Some(obj), Some(message_id)) = (payload.as_object_mut(), message.message_id) {
                obj.insert("id".into(), serde_json::Value::String(message_id));
            }
        }
        let mut job: SerializedJob =
            serde_json::from_value(payload).map_err(|e| malformed(e.into()))?;
        job.validate().map_err(malformed)?;
        job.receipt_handle = receipt_handle;
        Ok(job)
    }

    /// Delete a received message by receipt handle.
    pub async fn delete_message(&self, queue: &str, receipt_handle: &str) -> Result<()> {
        self.client
            .send(SqsCommand::DeleteMessage {
                queue_url: self.queue_url(queue),
                receipt_handle: receipt_handle.to_string(),
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl QueueDriver for SqsDriver {
    fn name(&self) -> &'static str {
        "sqs"
    }

    async fn push(&self, queue: &str, job: SerializedJob) -> Result<()> {
        self.client
            .send(SqsCommand::SendMessage {
                queue_url: self.queue_url(queue),
                body: job.to_json()?,
                delay_seconds: Self::delay_for(&job),
            })
            .await?;
        Ok(())
    }

    /// One long-poll receive of at most one message.
    async fn pop(&self, queue: &str) -> Result<Option<SerializedJob>> {
        let response = self
            .client
            .send(SqsCommand::ReceiveMessage {
                queue_url: self.queue_url(queue),
                max_messages: 1,
                wait_time_seconds: self.wait_time_seconds,
                visibility_timeout: self.visibility_timeout,
            })
            .await?;

        match response.messages.into_iter().next() {
            Some(message) => Self::parse_message(message).map(Some),
            None => Ok(None),
        }
    }

    /// Approximate visible count; 0 when the attribute cannot be read.
    async fn size(&self, queue: &str) -> Result<usize> {
        let response = self
            .client
            .send(SqsCommand::GetQueueAttributes {
                queue_url: self.queue_url(queue),
                attribute_names: vec![APPROXIMATE_NUMBER_OF_MESSAGES.to_string()],
            })
            .await;

        match response {
            Ok(response) => Ok(response
                .attributes
                .get(APPROXIMATE_NUMBER_OF_MESSAGES)
                .and_then(|count| count.parse().ok())
                .unwrap_or(0)),
            Err(e) => {
                tracing::warn!(queue = %queue, error = %e, "Failed to read SQS queue size");
                Ok(0)
            }
        }
    }

    /// Drain by receiving and deleting until the queue reports empty.
    async fn clear(&self, queue: &str) -> Result<()> {
        let mut cleared = 0usize;
        loop {
            let receipt_handle = match self.pop(queue).await {
                Ok(Some(job)) => job.receipt_handle,
                Ok(None) => break,
                Err(QueueError::MalformedEnvelope { receipt_handle, .. }) => receipt_handle,
                Err(e) => return Err(e),
            };
            if let Some(receipt_handle) = &receipt_handle {
                self.delete_message(queue, receipt_handle).await?;
            }
            cleared += 1;
        }
        tracing::debug!(queue = %queue, cleared, "SQS queue drained");
        Ok(())
    }

    fn as_batch(&self) -> Option<&dyn BatchCapable> {
        Some(self)
    }

    fn as_acknowledge(&self) -> Option<&dyn AcknowledgeCapable> {
        Some(self)
    }
}

#[async_trait]
impl BatchCapable for SqsDriver {
    async fn push_many(&self, queue: &str, jobs: Vec<SerializedJob>) -> Result<()> {
        let queue_url = self.queue_url(queue);
        for chunk in jobs.chunks(MAX_BATCH_SIZE) {
            let entries = chunk
                .iter()
                .enumerate()
                .map(|(index, job)| {
                    Ok(SqsBatchEntry {
                        id: format!("{}-{}", job.id, index),
                        body: job.to_json()?,
                        delay_seconds: Self::delay_for(job),
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            self.client
                .send(SqsCommand::SendMessageBatch {
                    queue_url: queue_url.clone(),
                    entries,
                })
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl AcknowledgeCapable for SqsDriver {
    async fn acknowledge_handle(&self, queue: &str, receipt_handle: &str) -> Result<()> {
        self.delete_message(queue, receipt_handle).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serializer::SerializationKind;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeSqs {
        commands: Mutex<Vec<SqsCommand>>,
        inbox: Mutex<VecDeque<SqsMessage>>,
        attributes_fail: AtomicBool,
    }

    #[async_trait]
    impl ManagedQueueClient for FakeSqs {
        async fn send(&self, command: SqsCommand) -> Result<SqsResponse> {
            self.commands.lock().unwrap().push(command.clone());
            match command {
                SqsCommand::ReceiveMessage { .. } => Ok(SqsResponse {
                    messages: self.inbox.lock().unwrap().pop_front().into_iter().collect(),
                    ..Default::default()
                }),
                SqsCommand::GetQueueAttributes { .. } => {
                    if self.attributes_fail.load(Ordering::SeqCst) {
                        return Err(QueueError::backend("AccessDenied"));
                    }
                    Ok(SqsResponse {
                        attributes: HashMap::from([(
                            APPROXIMATE_NUMBER_OF_MESSAGES.to_string(),
                            "42".to_string(),
                        )]),
                        ..Default::default()
                    })
                }
                _ => Ok(SqsResponse::default()),
            }
        }
    }

    fn job(id: &str, delay: Option<u64>) -> SerializedJob {
        SerializedJob {
            id: id.into(),
            kind: SerializationKind::Json,
            data: "{}".into(),
            class_name: None,
            created_at: 0,
            delay_seconds: delay,
            attempts: 0,
            max_attempts: None,
            receipt_handle: None,
        }
    }

    fn setup() -> (Arc<FakeSqs>, SqsDriver) {
        let client = Arc::new(FakeSqs::default());
        let driver = SqsDriver::new(client.clone())
            .with_queue_url_prefix("https://sqs.eu-west-1.amazonaws.com/123456789012/");
        (client, driver)
    }

    #[tokio::test]
    async fn test_push_caps_delay() {
        let (client, driver) = setup();
        driver.push("emails", job("a", Some(3600))).await.unwrap();

        let commands = client.commands.lock().unwrap();
        match &commands[0] {
            SqsCommand::SendMessage {
                queue_url,
                delay_seconds,
                body,
            } => {
                assert_eq!(
                    queue_url,
                    "https://sqs.eu-west-1.amazonaws.com/123456789012/emails"
                );
                assert_eq!(*delay_seconds, 900);
                assert_eq!(SerializedJob::from_json(body).unwrap().delay_seconds, Some(3600));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_queue_used_as_url_without_prefix() {
        let driver = SqsDriver::new(Arc::new(FakeSqs::default()));
        assert_eq!(
            driver.queue_url("https://sqs.local/q1"),
            "https://sqs.local/q1"
        );
    }

    #[tokio::test]
    async fn test_pop_carries_receipt_handle() {
        let (client, driver) = setup();
        let driver = driver.with_visibility_timeout(60).with_wait_time_seconds(5);
        client.inbox.lock().unwrap().push_back(SqsMessage {
            message_id: Some("m-1".into()),
            body: Some(job("a", None).to_json().unwrap()),
            receipt_handle: Some("rh-1".into()),
        });

        let popped = driver.pop("emails").await.unwrap().unwrap();
        assert_eq!(popped.id, "a");
        assert_eq!(popped.receipt_handle.as_deref(), Some("rh-1"));

        driver.acknowledge("emails", &popped).await.unwrap();
        let commands = client.commands.lock().unwrap();
        assert!(matches!(
            &commands[0],
            SqsCommand::ReceiveMessage { max_messages: 1, wait_time_seconds: 5, visibility_timeout: 60, .. }
        ));
        assert!(matches!(
            &commands[1],
            SqsCommand::DeleteMessage { receipt_handle, .. } if receipt_handle == "rh-1"
        ));
    }

    #[tokio::test]
    async fn test_pop_falls_back_to_message_id() {
        let (client, driver) = setup();
        client.inbox.lock().unwrap().push_back(SqsMessage {
            message_id: Some("m-9".into()),
            body: Some(r#"{"type":"json","data":"{}","createdAt":5}"#.into()),
            receipt_handle: None,
        });

        assert_eq!(driver.pop("emails").await.unwrap().unwrap().id, "m-9");
    }

    #[tokio::test]
    async fn test_size_reads_attribute_and_swallows_errors() {
        let (client, driver) = setup();
        assert_eq!(driver.size("emails").await.unwrap(), 42);

        client.attributes_fail.store(true, Ordering::SeqCst);
        assert_eq!(driver.size("emails").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_clear_deletes_every_message() {
        let (client, driver) = setup();
        for (i, id) in ["a", "b"].iter().enumerate() {
            client.inbox.lock().unwrap().push_back(SqsMessage {
                message_id: None,
                body: Some(job(id, None).to_json().unwrap()),
                receipt_handle: Some(format!("rh-{i}")),
            });
        }

        driver.clear("emails").await.unwrap();
        let deletes = client
            .commands
            .lock()
            .unwrap()
            .iter()
            .filter(|c| matches!(c, SqsCommand::DeleteMessage { .. }))
            .count();
        assert_eq!(deletes, 2);
    }

    #[tokio::test]
    async fn test_push_many_chunks_by_ten() {
        let (client, driver) = setup();
        let jobs = (0..23).map(|i| job(&format!("j{i}"), None)).collect();
        driver.push_many("bulk", jobs).await.unwrap();

        let commands = client.commands.lock().unwrap();
        let sizes: Vec<usize> = commands
            .iter()
            .map(|c| match c {
                SqsCommand::SendMessageBatch { entries, .. } => entries.len(),
                _ => 0,
            })
            .collect();
        assert_eq!(sizes, vec![10, 10, 3]);

        match &commands[1] {
            SqsCommand::SendMessageBatch { entries, .. } => {
                assert_eq!(entries[0].id, "j10-0");
                assert_eq!(entries[9].id, "j19-9");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
