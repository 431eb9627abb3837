//! Polling consumer
//!
//! A [`Consumer`] walks its queues in order, one reservation per queue per
//! round, hands each job to a [`Worker`] and acknowledges it once the worker
//! is done with it. Shutdown is cooperative: [`Consumer::stop`] raises a flag
//! that the loop checks between jobs, so an in-flight job always finishes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use crate::config::WorkerSettings;
use crate::error::{QueueError, Result};
use crate::manager::QueueManager;
use crate::worker::{Worker, WorkerOptions};

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub queues: Vec<String>,
    /// Connection to poll (the manager default when unset)
    pub connection: Option<String>,
    pub worker: WorkerOptions,
    pub poll_interval: Duration,
    /// Keep polling when a whole round finds nothing
    pub keep_alive: bool,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            queues: vec![crate::job::DEFAULT_QUEUE.to_string()],
            connection: None,
            worker: WorkerOptions::default(),
            poll_interval: Duration::from_millis(1_000),
            keep_alive: true,
        }
    }
}

impl ConsumerOptions {
    pub fn new(queues: Vec<String>) -> Self {
        Self {
            queues,
            ..Default::default()
        }
    }

    pub fn from_settings(settings: &WorkerSettings) -> Self {
        let mut worker = WorkerOptions::default().with_max_attempts(settings.max_attempts);
        if let Some(secs) = settings.timeout_seconds {
            worker = worker.with_timeout(Duration::from_secs(secs));
        }
        Self {
            queues: settings.queues.clone(),
            connection: settings.connection.clone(),
            worker,
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
            keep_alive: settings.keep_alive,
        }
    }
}

pub struct Consumer {
    manager: Arc<QueueManager>,
    options: ConsumerOptions,
    worker: Worker,
    running: AtomicBool,
    stop_requested: AtomicBool,
    wake: Notify,
}

impl Consumer {
    pub fn new(manager: Arc<QueueManager>, options: ConsumerOptions) -> Self {
        let worker = Worker::new(options.worker.clone());
        Self {
            manager,
            options,
            worker,
            running: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    pub fn options(&self) -> &ConsumerOptions {
        &self.options
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run the polling loop until stopped, or until an empty round when
    /// `keep_alive` is off.
    pub async fn start(&self) -> Result<()> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(QueueError::WorkerAlreadyRunning);
        }

        tracing::info!(
            queues = ?self.options.queues,
            connection = ?self.options.connection,
            poll_interval_ms = self.options.poll_interval.as_millis() as u64,
            keep_alive = self.options.keep_alive,
            "Consumer started"
        );

        while !self.stop_requested.load(Ordering::SeqCst) {
            let mut processed_any = false;

            for queue in &self.options.queues {
                if self.stop_requested.load(Ordering::SeqCst) {
                    break;
                }
                match self.run_next(queue).await {
                    Ok(found) => processed_any |= found,
                    Err(e) => {
                        tracing::error!(queue = %queue, error = %e, "Error polling queue");
                    }
                }
            }

            if !processed_any {
                if !self.options.keep_alive {
                    tracing::info!("Queues drained, consumer exiting");
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(self.options.poll_interval) => {}
                    _ = self.wake.notified() => {}
                }
            }
        }

        // Cleared on exit rather than entry so a stop() that lands before the
        // first poll is honoured
        self.stop_requested.store(false, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        tracing::info!("Consumer stopped");
        Ok(())
    }

    /// Reserve, process and acknowledge one job. Returns whether a job was found.
    async fn run_next(&self, queue: &str) -> Result<bool> {
        let Some(mut reserved) = self
            .manager
            .reserve(queue, self.options.connection.as_deref())
            .await?
        else {
            return Ok(false);
        };

        if let Err(e) = self.worker.process(reserved.job.as_mut()).await {
            tracing::error!(
                job = %reserved.job.name(),
                id = %reserved.envelope.id,
                queue = %queue,
                error = %e,
                "Job failed"
            );
        }

        self.manager.acknowledge(&reserved).await?;
        Ok(true)
    }

    /// Ask the loop to exit and wait until it has.
    pub async fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.wake.notify_one();
        while self.is_running() {
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }
    }
}
