//! Embedded queue service
//!
//! Wires a [`QueueManager`] from [`Settings`] for use inside a host
//! application, binds late dependencies such as the database service, and
//! optionally runs a consumer on a background task.

use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;

use crate::config::{Settings, WorkerSettings};
use crate::consumer::{Consumer, ConsumerOptions};
use crate::driver::DatabaseService;
use crate::error::{QueueError, Result};
use crate::manager::QueueManager;
use crate::serializer::JobSerializer;

struct RunningConsumer {
    consumer: Arc<Consumer>,
    handle: JoinHandle<Result<()>>,
}

pub struct QueueService {
    manager: Arc<QueueManager>,
    worker_settings: Option<WorkerSettings>,
    running: Mutex<Option<RunningConsumer>>,
}

impl QueueService {
    /// Build the manager and, in development with `auto_start_worker` set,
    /// start the configured consumer.
    pub async fn install(settings: &Settings, serializer: Arc<dyn JobSerializer>) -> Result<Self> {
        let manager = Arc::new(QueueManager::from_settings(settings, serializer)?);
        let service = Self {
            manager,
            worker_settings: settings.worker.clone(),
            running: Mutex::new(None),
        };

        tracing::info!(
            default_connection = %service.manager.default_connection(),
            connections = settings.connections.len(),
            "Queue service installed"
        );

        if settings.auto_start_worker && settings.is_development() {
            match &service.worker_settings {
                Some(worker) => {
                    service.start_worker(ConsumerOptions::from_settings(worker))?;
                }
                None => {
                    tracing::warn!("auto_start_worker is set but no worker settings were given");
                }
            }
        }

        Ok(service)
    }

    pub fn manager(&self) -> Arc<QueueManager> {
        self.manager.clone()
    }

    /// Supply the database service once the host has one.
    pub fn bind_database(&self, db: Arc<dyn DatabaseService>) -> Result<usize> {
        let resolved = self.manager.bind_database(db)?;
        tracing::info!(resolved, "Database service bound to queue");
        Ok(resolved)
    }

    /// Start the configured consumer on a background task.
    pub fn start_configured_worker(&self) -> Result<()> {
        let settings = self
            .worker_settings
            .as_ref()
            .ok_or_else(|| QueueError::backend("no worker settings configured"))?;
        self.start_worker(ConsumerOptions::from_settings(settings))
    }

    pub fn start_worker(&self, options: ConsumerOptions) -> Result<()> {
        let mut running = self
            .running
            .lock()
            .map_err(|_| QueueError::backend("queue service state poisoned"))?;
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return Err(QueueError::WorkerAlreadyRunning);
        }

        let consumer = Arc::new(Consumer::new(self.manager.clone(), options));
        let runner = consumer.clone();
        let handle = tokio::spawn(async move {
            let result = runner.start().await;
            if let Err(e) = &result {
                tracing::error!(error = %e, "Embedded consumer exited with error");
            }
            result
        });

        *running = Some(RunningConsumer { consumer, handle });
        tracing::info!("Embedded consumer started");
        Ok(())
    }

    pub fn is_worker_running(&self) -> bool {
        self.running
            .lock()
            .map(|running| running.as_ref().is_some_and(|r| !r.handle.is_finished()))
            .unwrap_or(false)
    }

    /// Stop the embedded consumer, letting its current job finish.
    pub async fn stop_worker(&self) {
        let taken = match self.running.lock() {
            Ok(mut running) => running.take(),
            Err(_) => None,
        };
        let Some(RunningConsumer { consumer, handle }) = taken else {
            return;
        };

        consumer.stop().await;
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "Embedded consumer task ended abnormally");
        }
        tracing::info!("Embedded consumer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::serializer::JsonSerializer;
    use std::time::Duration;

    fn worker_settings() -> WorkerSettings {
        WorkerSettings {
            queues: vec!["default".into()],
            connection: None,
            poll_interval_ms: 50,
            keep_alive: true,
            max_attempts: 3,
            timeout_seconds: None,
        }
    }

    #[tokio::test]
    async fn test_auto_start_in_development() {
        let mut settings = Settings::default();
        settings.run_mode = "development".into();
        settings.auto_start_worker = true;
        settings.worker = Some(worker_settings());

        let service = QueueService::install(&settings, Arc::new(JsonSerializer::new()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(service.is_worker_running());

        service.stop_worker().await;
        assert!(!service.is_worker_running());
    }

    #[tokio::test]
    async fn test_no_auto_start_in_production() {
        let mut settings = Settings::default();
        settings.run_mode = "production".into();
        settings.auto_start_worker = true;
        settings.worker = Some(worker_settings());

        let service = QueueService::install(&settings, Arc::new(JsonSerializer::new()))
            .await
            .unwrap();
        assert!(!service.is_worker_running());

        service.start_configured_worker().unwrap();
        let err = service.start_configured_worker().unwrap_err();
        assert!(matches!(err, QueueError::WorkerAlreadyRunning));
        service.stop_worker().await;
    }

    #[tokio::test]
    async fn test_install_fails_fast_on_bad_driver() {
        let mut settings = Settings::default();
        settings
            .connections
            .insert("bus".into(), ConnectionConfig::new("amqp"));

        let err = QueueService::install(&settings, Arc::new(JsonSerializer::new()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, QueueError::UnsupportedDriver(_)));
    }
}
