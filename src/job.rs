//! Job definitions
//!
//! A job is a serde-serializable struct that knows how to `handle()` itself.
//! Routing and retry bookkeeping live in [`JobOptions`], which job types keep
//! in a `#[serde(skip)]` field so it never leaks into the captured properties.
//!
//! ```ignore
//! #[derive(Serialize, Deserialize)]
//! struct SendWelcomeEmail {
//!     user_id: u64,
//!     #[serde(skip)]
//!     options: JobOptions,
//! }
//!
//! #[async_trait]
//! impl Job for SendWelcomeEmail {
//!     fn name(&self) -> &str { "SendWelcomeEmail" }
//!     fn options(&self) -> &JobOptions { &self.options }
//!     fn options_mut(&mut self) -> &mut JobOptions { &mut self.options }
//!     async fn handle(&mut self) -> Result<(), JobError> { Ok(()) }
//! }
//!
//! manager.push(SendWelcomeEmail { user_id: 7, options: Default::default() }.on_queue("emails")).await?;
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::JobError;

/// Queue used when a job does not name one.
pub const DEFAULT_QUEUE: &str = "default";

/// Routing and retry state carried alongside a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Target queue (falls back to [`DEFAULT_QUEUE`])
    pub queue_name: Option<String>,
    /// Target connection (falls back to the manager default)
    pub connection_name: Option<String>,
    /// Seconds before the job becomes visible to consumers
    pub delay_seconds: Option<u64>,
    /// Attempt currently being made (0 until a worker picks the job up)
    pub attempts: u32,
    /// Attempt limit; the worker default applies when unset
    pub max_attempts: Option<u32>,
}

/// Captures the data properties of a job for serialization.
///
/// Implemented for every `Serialize` type, so job structs only need
/// `#[derive(Serialize)]`.
pub trait JobProperties {
    fn properties(&self) -> Result<serde_json::Value, serde_json::Error>;
}

impl<T: Serialize> JobProperties for T {
    fn properties(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

/// Generic Job Trait
#[async_trait]
pub trait Job: JobProperties + Send + Sync {
    /// Type tag used to reconstruct the job on the consuming side
    fn name(&self) -> &str;

    fn options(&self) -> &JobOptions;

    fn options_mut(&mut self) -> &mut JobOptions;

    /// Execute the job
    async fn handle(&mut self) -> Result<(), JobError>;

    /// Called once after the final attempt has failed
    async fn failed(&mut self, _error: &JobError) -> Result<(), JobError> {
        Ok(())
    }
}

/// Fluent routing helpers available on every job.
pub trait Queueable: Job + Sized {
    fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.options_mut().queue_name = Some(queue.into());
        self
    }

    fn on_connection(mut self, connection: impl Into<String>) -> Self {
        self.options_mut().connection_name = Some(connection.into());
        self
    }

    fn delay(mut self, seconds: u64) -> Self {
        self.options_mut().delay_seconds = Some(seconds);
        self
    }

    fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.options_mut().max_attempts = Some(max_attempts);
        self
    }
}

impl<T: Job + Sized> Queueable for T {}
