use std::sync::Arc;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::clock::{system_clock, SharedClock};
use crate::error::{QueueError, Result};
use crate::job::Job;

use super::{new_job_id, JobSerializer, SerializationKind, SerializedJob};

/// Rebuilds a job from its captured properties.
pub type JobFactory =
    Arc<dyn Fn(serde_json::Value) -> std::result::Result<Box<dyn Job>, serde_json::Error> + Send + Sync>;

#[derive(Serialize, Deserialize)]
struct ClassPayload {
    class: String,
    #[serde(default)]
    properties: serde_json::Value,
}

/// Serializer that restores real job instances from a name → factory registry.
///
/// Job types must be registered on the consuming side before their envelopes
/// can be deserialized; unknown names fail with
/// [`QueueError::UnregisteredJobClass`].
pub struct ClassSerializer {
    factories: DashMap<String, JobFactory>,
    clock: SharedClock,
}

impl ClassSerializer {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            factories: DashMap::new(),
            clock,
        }
    }

    /// Register a job type that can be rebuilt with serde.
    pub fn register<J>(&self, name: &str) -> &Self
    where
        J: Job + DeserializeOwned + 'static,
    {
        self.register_factory(name, |properties| {
            let job: J = serde_json::from_value(properties)?;
            Ok(Box::new(job) as Box<dyn Job>)
        })
    }

    /// Register a custom factory (useful for jobs that need injected state).
    pub fn register_factory<F>(&self, name: &str, factory: F) -> &Self
    where
        F: Fn(serde_json::Value) -> std::result::Result<Box<dyn Job>, serde_json::Error>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(name.to_string(), Arc::new(factory));
        tracing::debug!(job = %name, "Registered job class");
        self
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn registered_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl Default for ClassSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl JobSerializer for ClassSerializer {
    fn kind(&self) -> SerializationKind {
        SerializationKind::Class
    }

    fn serialize(&self, job: &dyn Job) -> Result<SerializedJob> {
        let class = job.name().to_string();
        let options = job.options();
        let data = serde_json::to_string(&ClassPayload {
            class: class.clone(),
            properties: job.properties()?,
        })?;

        Ok(SerializedJob {
            id: new_job_id(),
            kind: SerializationKind::Class,
            data,
            class_name: Some(class),
            created_at: self.clock.now_millis(),
            delay_seconds: options.delay_seconds,
            attempts: options.attempts,
            max_attempts: options.max_attempts,
            receipt_handle: None,
        })
    }

    fn deserialize(&self, envelope: &SerializedJob) -> Result<Box<dyn Job>> {
        if envelope.kind != SerializationKind::Class {
            return Err(QueueError::InvalidEnvelope(format!(
                "expected type \"class\", got \"{}\"",
                envelope.kind
            )));
        }
        let class = envelope.class_name.as_deref().ok_or_else(|| {
            QueueError::InvalidEnvelope(format!("job {} is missing className", envelope.id))
        })?;

        // Clone the factory out so the map shard is not locked while it runs
        let factory = self
            .factories
            .get(class)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| QueueError::UnregisteredJobClass(class.to_string()))?;

        let payload: ClassPayload = serde_json::from_str(&envelope.data)?;
        let mut job = factory(payload.properties)?;

        let options = job.options_mut();
        if envelope.delay_seconds.is_some() {
            options.delay_seconds = envelope.delay_seconds;
        }
        options.attempts = envelope.attempts;
        if envelope.max_attempts.is_some() {
            options.max_attempts = envelope.max_attempts;
        }

        Ok(job)
    }
}
