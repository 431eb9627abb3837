use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::clock::{system_clock, SharedClock};
use crate::error::{JobError, QueueError, Result};
use crate::job::{Job, JobOptions};

use super::{new_job_id, JobSerializer, SerializationKind, SerializedJob};

#[derive(Serialize, Deserialize)]
struct JsonPayload {
    job: String,
    #[serde(default)]
    properties: serde_json::Value,
}

/// Plain-data serializer.
///
/// Deserializing yields a [`PropertyBag`]: the captured properties and
/// options, without the original type. Useful for logging and inspection;
/// a bag cannot be executed.
pub struct JsonSerializer {
    clock: SharedClock,
}

impl JsonSerializer {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self { clock }
    }
}

impl Default for JsonSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl JobSerializer for JsonSerializer {
    fn kind(&self) -> SerializationKind {
        SerializationKind::Json
    }

    fn serialize(&self, job: &dyn Job) -> Result<SerializedJob> {
        let options = job.options();
        let data = serde_json::to_string(&JsonPayload {
            job: job.name().to_string(),
            properties: job.properties()?,
        })?;

        Ok(SerializedJob {
            id: new_job_id(),
            kind: SerializationKind::Json,
            data,
            class_name: None,
            created_at: self.clock.now_millis(),
            delay_seconds: options.delay_seconds,
            attempts: options.attempts,
            max_attempts: options.max_attempts,
            receipt_handle: None,
        })
    }

    fn deserialize(&self, envelope: &SerializedJob) -> Result<Box<dyn Job>> {
        if envelope.kind != SerializationKind::Json {
            return Err(QueueError::InvalidEnvelope(format!(
                "expected type \"json\", got \"{}\"",
                envelope.kind
            )));
        }

        let payload: JsonPayload = serde_json::from_str(&envelope.data)?;
        Ok(Box::new(PropertyBag {
            name: payload.job,
            properties: payload.properties,
            options: JobOptions {
                delay_seconds: envelope.delay_seconds,
                attempts: envelope.attempts,
                max_attempts: envelope.max_attempts,
                ..JobOptions::default()
            },
        }))
    }
}

/// Properties of a job whose type is not known on this side.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct PropertyBag {
    #[serde(skip)]
    name: String,
    properties: serde_json::Value,
    #[serde(skip)]
    options: JobOptions,
}

impl PropertyBag {
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.properties.get(key)
    }

    pub fn into_properties(self) -> serde_json::Value {
        self.properties
    }
}

#[async_trait]
impl Job for PropertyBag {
    fn name(&self) -> &str {
        &self.name
    }

    fn options(&self) -> &JobOptions {
        &self.options
    }

    fn options_mut(&mut self) -> &mut JobOptions {
        &mut self.options
    }

    async fn handle(&mut self) -> std::result::Result<(), JobError> {
        Err(JobError::handler(format!(
            "{} was deserialized as plain data and cannot be executed",
            self.name
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Queueable;

    #[derive(Serialize)]
    struct Report {
        month: u32,
        #[serde(skip)]
        options: JobOptions,
    }

    #[async_trait]
    impl Job for Report {
        fn name(&self) -> &str {
            "MonthlyReport"
        }

        fn options(&self) -> &JobOptions {
            &self.options
        }

        fn options_mut(&mut self) -> &mut JobOptions {
            &mut self.options
        }

        async fn handle(&mut self) -> std::result::Result<(), JobError> {
            Ok(())
        }
    }

    #[test]
    fn test_envelope_has_no_class_name() {
        let envelope = JsonSerializer::new()
            .serialize(&Report { month: 3, options: JobOptions::default() })
            .unwrap();

        assert_eq!(envelope.kind, SerializationKind::Json);
        assert_eq!(envelope.class_name, None);
        assert!(envelope.validate().is_ok());

        let data: serde_json::Value = serde_json::from_str(&envelope.data).unwrap();
        assert_eq!(data["job"], "MonthlyReport");
        assert_eq!(data["properties"]["month"], 3);
    }

    #[tokio::test]
    async fn test_deserializes_to_property_bag() {
        let serializer = JsonSerializer::new();
        let envelope = serializer
            .serialize(&Report { month: 7, options: JobOptions::default() }.with_max_attempts(2))
            .unwrap();

        let mut job = serializer.deserialize(&envelope).unwrap();
        assert_eq!(job.name(), "MonthlyReport");
        assert_eq!(job.properties().unwrap(), serde_json::json!({ "month": 7 }));
        assert_eq!(job.options().max_attempts, Some(2));

        let err = job.handle().await.unwrap_err();
        assert!(err.to_string().contains("cannot be executed"));
    }

    #[test]
    fn test_rejects_class_envelope() {
        let serializer = JsonSerializer::new();
        let mut envelope = serializer
            .serialize(&Report { month: 1, options: JobOptions::default() })
            .unwrap();
        envelope.kind = SerializationKind::Class;
        envelope.class_name = Some("MonthlyReport".into());

        assert!(matches!(
            serializer.deserialize(&envelope),
            Err(QueueError::InvalidEnvelope(_))
        ));
    }
}
