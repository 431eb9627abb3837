//! Graceful shutdown for worker processes.
//!
//! 1. Wait for SIGINT or SIGTERM
//! 2. Ask every consumer to stop after its in-flight job
//! 3. Give up waiting once the drain timeout elapses

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::signal;
use tokio::time::timeout;

use crate::consumer::Consumer;

/// Configuration for graceful shutdown behavior
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Time to wait for in-flight jobs to finish (default: 30 seconds)
    pub drain_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Result of a graceful shutdown operation
#[derive(Debug, Default)]
pub struct ShutdownResult {
    /// Consumers that stopped within the drain timeout
    pub consumers_stopped: usize,
    /// Consumers still busy when the timeout hit
    pub consumers_abandoned: usize,
    pub duration: Duration,
}

/// Resolve once the process receives Ctrl+C or SIGTERM.
///
/// A handler that cannot be installed is logged and treated as never firing.
pub async fn wait_for_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT",
        _ = terminate => "SIGTERM",
    }
}

/// Stop all consumers concurrently, waiting at most `config.drain_timeout`.
#[tracing::instrument(name = "graceful_shutdown", skip_all, fields(consumers = consumers.len()))]
pub async fn stop_consumers(consumers: &[Arc<Consumer>], config: &ShutdownConfig) -> ShutdownResult {
    let start = Instant::now();
    let total = consumers.len();
    let mut stopped = 0;

    let mut futures: FuturesUnordered<_> = consumers.iter().map(|consumer| consumer.stop()).collect();
    let drain = async {
        while futures.next().await.is_some() {
            stopped += 1;
        }
    };

    if timeout(config.drain_timeout, drain).await.is_err() {
        tracing::warn!(
            remaining = total - stopped,
            "Drain timeout reached, some jobs may not have finished"
        );
    }

    let result = ShutdownResult {
        consumers_stopped: stopped,
        consumers_abandoned: total - stopped,
        duration: start.elapsed(),
    };
    tracing::info!(
        consumers_stopped = result.consumers_stopped,
        duration_ms = result.duration.as_millis() as u64,
        "Graceful shutdown completed"
    );
    result
}
