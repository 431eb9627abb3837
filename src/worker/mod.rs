//! Job execution with bounded retries.
//!
//! [`Worker::process`] runs a job's `handle()` up to its attempt limit,
//! racing each attempt against the optional timeout and sleeping with
//! exponential backoff between attempts. After the last failed attempt the
//! job's `failed()` hook and the worker's `on_failed` callback run once, and
//! the original error is returned.

mod backoff;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt};

use crate::error::JobError;
use crate::job::Job;
use crate::metrics::QueueMetrics;

pub use backoff::{BackoffConfig, ExponentialBackoff};

/// Default attempt limit for jobs that do not set their own.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// What the `on_failed` callback learns about an exhausted job.
#[derive(Debug, Clone)]
pub struct FailedJob {
    pub name: String,
    pub queue: Option<String>,
    pub attempts: u32,
    pub properties: serde_json::Value,
    pub error: JobError,
}

pub type FailedHook =
    Arc<dyn Fn(FailedJob) -> BoxFuture<'static, Result<(), JobError>> + Send + Sync>;

#[derive(Clone)]
pub struct WorkerOptions {
    /// Applies to jobs without their own `max_attempts`
    pub max_attempts: u32,
    /// Per-attempt limit on `handle()`
    pub timeout: Option<Duration>,
    pub backoff: BackoffConfig,
    pub on_failed: Option<FailedHook>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            timeout: None,
            backoff: BackoffConfig::default(),
            on_failed: None,
        }
    }
}

impl fmt::Debug for WorkerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerOptions")
            .field("max_attempts", &self.max_attempts)
            .field("timeout", &self.timeout)
            .field("backoff", &self.backoff)
            .field("on_failed", &self.on_failed.is_some())
            .finish()
    }
}

impl WorkerOptions {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn on_failed<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(FailedJob) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), JobError>> + Send + 'static,
    {
        self.on_failed = Some(Arc::new(move |failed| hook(failed).boxed()));
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct Worker {
    options: WorkerOptions,
}

impl Worker {
    pub fn new(options: WorkerOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    pub async fn process(&self, job: &mut dyn Job) -> Result<(), JobError> {
        let max_attempts = job
            .options()
            .max_attempts
            .unwrap_or(self.options.max_attempts)
            .max(1);
        let mut backoff = ExponentialBackoff::with_config(self.options.backoff.clone());
        let mut attempt = 1;

        loop {
            {
                let options = job.options_mut();
                options.attempts = attempt;
                options.max_attempts = Some(max_attempts);
            }

            let started = Instant::now();
            let result = self.attempt(job).await;
            QueueMetrics::observe_attempt(job.name(), started.elapsed());

            let error = match result {
                Ok(()) => {
                    QueueMetrics::record_completed();
                    tracing::debug!(job = %job.name(), attempt, "Job completed");
                    return Ok(());
                }
                Err(error) => error,
            };

            if attempt >= max_attempts {
                tracing::error!(
                    job = %job.name(),
                    attempts = attempt,
                    error = %error,
                    "Job failed permanently"
                );
                QueueMetrics::record_failed();
                self.run_failure_hooks(job, &error).await;
                return Err(error);
            }

            let delay = backoff.next_delay();
            tracing::warn!(
                job = %job.name(),
                attempt,
                max_attempts,
                retry_in_ms = delay.as_millis() as u64,
                error = %error,
                "Job attempt failed, retrying"
            );
            QueueMetrics::record_retry(job.name());
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn attempt(&self, job: &mut dyn Job) -> Result<(), JobError> {
        match self.options.timeout {
            Some(limit) => match tokio::time::timeout(limit, job.handle()).await {
                Ok(result) => result,
                Err(_) => Err(JobError::Timeout(limit)),
            },
            None => job.handle().await,
        }
    }

    async fn run_failure_hooks(&self, job: &mut dyn Job, error: &JobError) {
        if let Err(e) = job.failed(error).await {
            tracing::error!(job = %job.name(), error = %e, "Job failed() hook errored");
        }

        let Some(hook) = &self.options.on_failed else {
            return;
        };
        let failed = FailedJob {
            name: job.name().to_string(),
            queue: job.options().queue_name.clone(),
            attempts: job.options().attempts,
            properties: job.properties().unwrap_or(serde_json::Value::Null),
            error: error.clone(),
        };
        if let Err(e) = hook(failed).await {
            tracing::error!(job = %job.name(), error = %e, "on_failed callback errored");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobOptions;
    use async_trait::async_trait;
    use serde::Serialize;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Serialize, Default)]
    struct Flaky {
        succeed_on: u32,
        #[serde(skip)]
        calls: Arc<AtomicU32>,
        #[serde(skip)]
        failed_calls: Arc<AtomicU32>,
        #[serde(skip)]
        seen_attempts: Arc<std::sync::Mutex<Vec<u32>>>,
        #[serde(skip)]
        options: JobOptions,
    }

    #[async_trait]
    impl Job for Flaky {
        fn name(&self) -> &str {
            "Flaky"
        }

        fn options(&self) -> &JobOptions {
            &self.options
        }

        fn options_mut(&mut self) -> &mut JobOptions {
            &mut self.options
        }

        async fn handle(&mut self) -> Result<(), JobError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.seen_attempts.lock().unwrap().push(self.options.attempts);
            if self.succeed_on != 0 && call >= self.succeed_on {
                Ok(())
            } else {
                Err(JobError::handler(format!("call {call} failed")))
            }
        }

        async fn failed(&mut self, _error: &JobError) -> Result<(), JobError> {
            self.failed_calls.fetch_add(1, Ordering::SeqCst);
            Err(JobError::handler("failed hook itself failed"))
        }
    }

    #[derive(Serialize, Default)]
    struct Sleepy {
        #[serde(skip)]
        options: JobOptions,
    }

    #[async_trait]
    impl Job for Sleepy {
        fn name(&self) -> &str {
            "Sleepy"
        }

        fn options(&self) -> &JobOptions {
            &self.options
        }

        fn options_mut(&mut self) -> &mut JobOptions {
            &mut self.options
        }

        async fn handle(&mut self) -> Result<(), JobError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_job_exhausts_attempts() {
        let mut job = Flaky::default();
        let worker = Worker::default();

        let err = worker.process(&mut job).await.unwrap_err();

        assert_eq!(err, JobError::handler("call 3 failed"));
        assert_eq!(job.calls.load(Ordering::SeqCst), 3);
        assert_eq!(job.failed_calls.load(Ordering::SeqCst), 1);
        assert_eq!(*job.seen_attempts.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(job.options.max_attempts, Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_between_attempts() {
        let mut job = Flaky::default();
        let worker = Worker::new(WorkerOptions::default().with_max_attempts(4));

        let started = tokio::time::Instant::now();
        let _ = worker.process(&mut job).await;

        // 1s + 2s + 4s between four attempts
        assert_eq!(started.elapsed(), Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_retry() {
        let mut job = Flaky {
            succeed_on: 2,
            ..Default::default()
        };

        Worker::default().process(&mut job).await.unwrap();
        assert_eq!(job.calls.load(Ordering::SeqCst), 2);
        assert_eq!(job.failed_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_limit_overrides_worker_default() {
        let mut job = Flaky::default();
        job.options.max_attempts = Some(1);

        let _ = Worker::default().process(&mut job).await;
        assert_eq!(job.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let mut job = Sleepy::default();
        let worker = Worker::new(
            WorkerOptions::default()
                .with_max_attempts(1)
                .with_timeout(Duration::from_secs(2)),
        );

        let err = worker.process(&mut job).await.unwrap_err();
        assert_eq!(err, JobError::Timeout(Duration::from_secs(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_failed_hook_receives_report() {
        let reports = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = reports.clone();
        let worker = Worker::new(WorkerOptions::default().with_max_attempts(2).on_failed(
            move |failed: FailedJob| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(failed);
                    Err(JobError::handler("hook errors are only logged"))
                }
            },
        ));

        let mut job = Flaky {
            succeed_on: 0,
            ..Default::default()
        };
        let err = worker.process(&mut job).await.unwrap_err();

        assert_eq!(err, JobError::handler("call 2 failed"));
        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].name, "Flaky");
        assert_eq!(reports[0].attempts, 2);
        assert_eq!(reports[0].properties["succeed_on"], 0);
    }
}
