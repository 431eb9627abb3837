//! Standalone worker process
//!
//! ```bash
//! queue-worker --queues default,emails --connection jobs --workers 4
//! queue-worker --queues reports --keep-alive false --config queue.json
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{ArgAction, Parser};

use crate::config::Settings;
use crate::consumer::{Consumer, ConsumerOptions};
use crate::manager::QueueManager;
use crate::serializer::{create_serializer, JobSerializer};
use crate::shutdown::{stop_consumers, wait_for_signal, ShutdownConfig};
use crate::telemetry::init_telemetry;
use crate::worker::WorkerOptions;

/// Exit status for a missing required flag.
pub const EXIT_USAGE: u8 = 1;

/// Run queue consumers as a standalone process
#[derive(Debug, Clone, Parser)]
#[command(name = "queue-worker", version, about)]
pub struct WorkerArgs {
    /// Connection to consume from (defaults to the configured default)
    #[arg(long, env = "QUEUE_WORKER_CONNECTION")]
    pub connection: Option<String>,

    /// Comma-separated queues, polled in order
    #[arg(long, value_delimiter = ',')]
    pub queues: Vec<String>,

    /// Number of consumers to run concurrently
    #[arg(long, default_value_t = 1)]
    pub workers: usize,

    /// Per-attempt job timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    #[arg(long, default_value_t = 3)]
    pub max_attempts: u32,

    /// Sleep between empty polling rounds, in milliseconds
    #[arg(long, default_value_t = 1000)]
    pub poll_interval: u64,

    /// Keep polling when every queue is empty
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub keep_alive: bool,

    /// JSON file with connection settings
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl WorkerArgs {
    fn queues(&self) -> Vec<String> {
        self.queues
            .iter()
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty())
            .collect()
    }

    pub fn consumer_options(&self) -> ConsumerOptions {
        let mut worker = WorkerOptions::default().with_max_attempts(self.max_attempts);
        if let Some(secs) = self.timeout {
            worker = worker.with_timeout(Duration::from_secs(secs));
        }
        ConsumerOptions {
            queues: self.queues(),
            connection: self.connection.clone(),
            worker,
            poll_interval: Duration::from_millis(self.poll_interval),
            keep_alive: self.keep_alive,
        }
    }
}

/// Run the worker until its queues drain (without keep-alive) or a
/// shutdown signal arrives.
///
/// Jobs are reconstructed with `serializer`; without one, the serializer
/// kind from settings is used with an empty class registry.
pub async fn run(args: WorkerArgs, serializer: Option<Arc<dyn JobSerializer>>) -> anyhow::Result<ExitCode> {
    if args.queues().is_empty() {
        eprintln!("Error: --queues is required");
        eprintln!("Usage: queue-worker --queues default,emails [options]");
        return Ok(ExitCode::from(EXIT_USAGE));
    }

    let (mut settings, config_error) = match Settings::load(args.config.as_deref()) {
        Ok(settings) => (settings, None),
        Err(e) => (Settings::load(None).unwrap_or_default(), Some(e)),
    };

    let _telemetry = match init_telemetry(&settings.otel) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Telemetry disabled: {e}");
            None
        }
    };

    if let Some(e) = config_error {
        tracing::warn!(
            path = ?args.config,
            error = %e,
            "Failed to load config file, using defaults"
        );
    }

    settings.connect_clients().await?;
    let serializer = serializer.unwrap_or_else(|| create_serializer(settings.serializer));
    let mut manager = QueueManager::from_settings(&settings, serializer)?;
    if let Some(connection) = &args.connection {
        manager = manager.with_default_connection(connection.clone());
    }
    // Fail before polling if the connection cannot be resolved
    manager.driver(None)?;
    let manager = Arc::new(manager);

    let options = args.consumer_options();
    let workers = args.workers.max(1);
    tracing::info!(
        queues = ?options.queues,
        connection = %manager.default_connection(),
        workers,
        "Queue worker starting"
    );

    let consumers: Vec<Arc<Consumer>> = (0..workers)
        .map(|_| Arc::new(Consumer::new(manager.clone(), options.clone())))
        .collect();
    let handles: Vec<_> = consumers
        .iter()
        .map(|consumer| {
            let consumer = consumer.clone();
            tokio::spawn(async move { consumer.start().await })
        })
        .collect();

    let all = futures::future::join_all(handles);
    tokio::pin!(all);

    let results = tokio::select! {
        results = &mut all => results,
        signal = wait_for_signal() => {
            tracing::info!(signal, "Shutdown signal received, stopping consumers");
            let result = stop_consumers(&consumers, &ShutdownConfig::default()).await;
            if result.consumers_abandoned > 0 {
                return Ok(ExitCode::SUCCESS);
            }
            all.await
        }
    };

    let mut failed = 0;
    for result in results {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                failed += 1;
                tracing::error!(error = %e, "Consumer exited with error");
            }
            Err(e) => {
                failed += 1;
                tracing::error!(error = %e, "Consumer task panicked");
            }
        }
    }

    tracing::info!("Queue worker stopped");
    if failed > 0 {
        anyhow::bail!("{failed} consumer(s) exited with errors");
    }
    Ok(ExitCode::SUCCESS)
}
