//! Job serialization
//!
//! A [`JobSerializer`] turns a job into a [`SerializedJob`] envelope that any
//! driver can store, and back again. Two strategies exist:
//!
//! - [`ClassSerializer`]: tags the envelope with the job's type name and
//!   rebuilds a real job instance through a registered factory.
//! - [`JsonSerializer`]: captures properties only and rebuilds a
//!   [`PropertyBag`] for inspection.

mod class;
mod json;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{QueueError, Result};
use crate::job::Job;

pub use class::{ClassSerializer, JobFactory};
pub use json::{JsonSerializer, PropertyBag};

/// Which strategy produced an envelope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializationKind {
    #[default]
    Class,
    Json,
}

impl fmt::Display for SerializationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerializationKind::Class => write!(f, "class"),
            SerializationKind::Json => write!(f, "json"),
        }
    }
}

/// Storage and wire form of a job.
///
/// Serialized as camelCase JSON (`id`, `type`, `data`, `className`,
/// `createdAt`, `delaySeconds`, `attempts`, `maxAttempts`), which is the
/// payload every driver stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedJob {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: SerializationKind,
    /// JSON-encoded job properties
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    /// Milliseconds since the Unix epoch
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_seconds: Option<u64>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    /// Driver-specific handle needed to acknowledge the job (SQS receipt
    /// handle, database row id). Never serialized.
    #[serde(skip)]
    pub receipt_handle: Option<String>,
}

impl SerializedJob {
    /// Check that `className` is present exactly when the kind is `class`.
    pub fn validate(&self) -> Result<()> {
        match (self.kind, &self.class_name) {
            (SerializationKind::Class, None) => Err(QueueError::InvalidEnvelope(format!(
                "job {} has type \"class\" but no className",
                self.id
            ))),
            (SerializationKind::Json, Some(name)) => Err(QueueError::InvalidEnvelope(format!(
                "job {} has type \"json\" but carries className \"{}\"",
                self.id, name
            ))),
            _ => Ok(()),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse and validate a stored payload.
    pub fn from_json(payload: &str) -> Result<Self> {
        let job: SerializedJob = serde_json::from_str(payload)?;
        job.validate()?;
        Ok(job)
    }

    /// Millisecond timestamp at which the job may be popped.
    pub fn available_at(&self) -> i64 {
        let delay_ms = self.delay_seconds.unwrap_or(0).saturating_mul(1000);
        self.created_at.saturating_add(delay_ms as i64)
    }

    pub fn is_available(&self, now_millis: i64) -> bool {
        match self.delay_seconds {
            None | Some(0) => true,
            Some(_) => now_millis >= self.available_at(),
        }
    }
}

/// Serialization strategy.
pub trait JobSerializer: Send + Sync {
    fn kind(&self) -> SerializationKind;

    fn serialize(&self, job: &dyn Job) -> Result<SerializedJob>;

    fn deserialize(&self, envelope: &SerializedJob) -> Result<Box<dyn Job>>;
}

/// Build an unregistered serializer for the configured strategy.
pub fn create_serializer(kind: SerializationKind) -> Arc<dyn JobSerializer> {
    match kind {
        SerializationKind::Class => Arc::new(ClassSerializer::new()),
        SerializationKind::Json => Arc::new(JsonSerializer::new()),
    }
}

pub(crate) fn new_job_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
