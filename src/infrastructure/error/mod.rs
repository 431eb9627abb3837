use std::time::Duration;

use thiserror::Error;

use crate::infrastructure::redis::PoolError;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Errors raised by the queue manager, drivers and serializers.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Job class \"{0}\" is not registered")]
    UnregisteredJobClass(String),

    #[error("Connection \"{0}\" not found")]
    ConnectionNotFound(String),

    #[error("Driver \"{0}\" is not supported (supported drivers: memory, database, redis, kafka, sqs)")]
    UnsupportedDriver(String),

    #[error("{driver} driver requires a {dependency}")]
    MissingDependency {
        driver: String,
        dependency: &'static str,
    },

    #[error("{driver} driver does not support {operation}")]
    Unsupported {
        driver: &'static str,
        operation: &'static str,
    },

    #[error("Invalid job envelope: {0}")]
    InvalidEnvelope(String),

    /// A stored payload could not be parsed. Carries the driver handle so
    /// the delivery can still be acknowledged and dropped.
    #[error("Malformed job envelope: {reason}")]
    MalformedEnvelope {
        receipt_handle: Option<String>,
        reason: String,
    },

    #[error("Worker is already running")]
    WorkerAlreadyRunning,

    #[error(transparent)]
    Job(#[from] JobError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] PoolError),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl QueueError {
    pub fn missing_dependency(driver: impl Into<String>, dependency: &'static str) -> Self {
        QueueError::MissingDependency {
            driver: driver.into(),
            dependency,
        }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        QueueError::Backend(message.into())
    }

    pub fn malformed(receipt_handle: Option<String>, reason: impl std::fmt::Display) -> Self {
        QueueError::MalformedEnvelope {
            receipt_handle,
            reason: reason.to_string(),
        }
    }
}

/// Failure of a single job execution.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum JobError {
    /// `handle()` did not finish within the worker timeout
    #[error("Job timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),

    /// `handle()` returned an error
    #[error("Job handler failed: {0}")]
    Handler(String),
}

impl JobError {
    pub fn handler(message: impl Into<String>) -> Self {
        JobError::Handler(message.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, JobError::Timeout(_))
    }
}

impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        JobError::Handler(format!("{:#}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unregistered_class_display() {
        let err = QueueError::UnregisteredJobClass("SendEmail".into());
        assert_eq!(err.to_string(), "Job class \"SendEmail\" is not registered");
    }

    #[test]
    fn test_missing_dependency_display() {
        let err = QueueError::missing_dependency("redis", "key-list client");
        assert_eq!(err.to_string(), "redis driver requires a key-list client");
    }

    #[test]
    fn test_job_error_is_transparent() {
        let err: QueueError = JobError::handler("smtp down").into();
        assert_eq!(err.to_string(), "Job handler failed: smtp down");
    }

    #[test]
    fn test_malformed_keeps_handle() {
        let err = QueueError::malformed(Some("42".into()), "expected value at line 1 column 1");
        assert_eq!(
            err.to_string(),
            "Malformed job envelope: expected value at line 1 column 1"
        );
        assert!(matches!(
            err,
            QueueError::MalformedEnvelope { receipt_handle: Some(ref h), .. } if h == "42"
        ));
    }

    #[test]
    fn test_timeout_display() {
        let err = JobError::Timeout(Duration::from_millis(1500));
        assert_eq!(err.to_string(), "Job timed out after 1.5s");
        assert!(err.is_timeout());
    }

    #[test]
    fn test_from_anyhow_keeps_context() {
        let err = anyhow::anyhow!("connection refused").context("sending welcome mail");
        let job_err = JobError::from(err);
        assert_eq!(
            job_err,
            JobError::Handler("sending welcome mail: connection refused".into())
        );
    }
}
