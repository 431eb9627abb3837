//! In-memory queue driver using DashMap.
//!
//! Jobs live only as long as the process. Each queue is a `VecDeque` behind
//! its DashMap shard lock, so one manager can be shared across tasks; there
//! is no cross-process visibility.

use std::collections::VecDeque;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::clock::{system_clock, SharedClock};
use crate::error::Result;
use crate::serializer::SerializedJob;

use super::{BatchCapable, QueueDriver};

pub struct MemoryDriver {
    queues: DashMap<String, VecDeque<SerializedJob>>,
    clock: SharedClock,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            queues: DashMap::new(),
            clock,
        }
    }
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueDriver for MemoryDriver {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn push(&self, queue: &str, job: SerializedJob) -> Result<()> {
        let mut jobs = self.queues.entry(queue.to_string()).or_default();
        jobs.push_back(job);

        tracing::debug!(queue = %queue, queue_size = jobs.len(), "Job pushed to memory queue");
        Ok(())
    }

    async fn pop(&self, queue: &str) -> Result<Option<SerializedJob>> {
        let now = self.clock.now_millis();
        let Some(mut jobs) = self.queues.get_mut(queue) else {
            return Ok(None);
        };

        // First eligible job wins; delayed jobs ahead of it stay in place
        let job = jobs
            .iter()
            .position(|job| job.is_available(now))
            .and_then(|index| jobs.remove(index));
        Ok(job)
    }

    async fn size(&self, queue: &str) -> Result<usize> {
        Ok(self.queues.get(queue).map(|jobs| jobs.len()).unwrap_or(0))
    }

    async fn clear(&self, queue: &str) -> Result<()> {
        if let Some((_, jobs)) = self.queues.remove(queue) {
            tracing::debug!(queue = %queue, cleared = jobs.len(), "Memory queue cleared");
        }
        Ok(())
    }

    fn as_batch(&self) -> Option<&dyn BatchCapable> {
        Some(self)
    }
}

#[async_trait]
impl BatchCapable for MemoryDriver {
    async fn push_many(&self, queue: &str, jobs: Vec<SerializedJob>) -> Result<()> {
        if jobs.is_empty() {
            return Ok(());
        }
        self.queues
            .entry(queue.to_string())
            .or_default()
            .extend(jobs);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::serializer::SerializationKind;
    use std::sync::Arc;
    use std::time::Duration;

    fn job(id: &str, created_at: i64, delay: Option<u64>) -> SerializedJob {
        SerializedJob {
            id: id.into(),
            kind: SerializationKind::Json,
            data: "{}".into(),
            class_name: None,
            created_at,
            delay_seconds: delay,
            attempts: 0,
            max_attempts: None,
            receipt_handle: None,
        }
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let driver = MemoryDriver::new();
        for id in ["a", "b", "c"] {
            driver.push("default", job(id, 0, None)).await.unwrap();
        }

        let mut popped = Vec::new();
        while let Some(job) = driver.pop("default").await.unwrap() {
            popped.push(job.id);
        }
        assert_eq!(popped, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_delayed_job_hidden_until_due() {
        let clock = Arc::new(ManualClock::new(10_000));
        let driver = MemoryDriver::with_clock(clock.clone());
        driver.push("default", job("late", 10_000, Some(5))).await.unwrap();
        driver.push("default", job("now", 10_000, None)).await.unwrap();

        // The undelayed job behind the delayed one is still eligible
        assert_eq!(driver.pop("default").await.unwrap().unwrap().id, "now");
        assert!(driver.pop("default").await.unwrap().is_none());

        clock.advance(Duration::from_millis(4_999));
        assert!(driver.pop("default").await.unwrap().is_none());

        clock.advance(Duration::from_millis(1));
        assert_eq!(driver.pop("default").await.unwrap().unwrap().id, "late");
    }

    #[tokio::test]
    async fn test_size_does_not_mutate() {
        let driver = MemoryDriver::new();
        driver.push("emails", job("a", 0, None)).await.unwrap();
        driver.push("emails", job("b", 0, None)).await.unwrap();

        assert_eq!(driver.size("emails").await.unwrap(), 2);
        assert_eq!(driver.size("emails").await.unwrap(), 2);
        assert_eq!(driver.size("missing").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_clear_only_touches_one_queue() {
        let driver = MemoryDriver::new();
        driver.push("a", job("1", 0, None)).await.unwrap();
        driver.push("b", job("2", 0, None)).await.unwrap();

        driver.clear("a").await.unwrap();
        assert_eq!(driver.size("a").await.unwrap(), 0);
        assert_eq!(driver.size("b").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_batch_push_and_pop() {
        let driver = MemoryDriver::new();
        let jobs = (0..5).map(|i| job(&i.to_string(), 0, None)).collect();
        driver.push_many("bulk", jobs).await.unwrap();

        let first = driver.pop_many("bulk", 3).await.unwrap();
        assert_eq!(
            first.iter().map(|j| j.id.as_str()).collect::<Vec<_>>(),
            vec!["0", "1", "2"]
        );
        assert_eq!(driver.pop_many("bulk", 10).await.unwrap().len(), 2);
    }
}
