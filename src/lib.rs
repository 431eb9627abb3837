// Infrastructure layer (shared components)
pub mod infrastructure;

pub use infrastructure::config;
pub use infrastructure::error;
pub use infrastructure::metrics;
pub use infrastructure::postgres;

// Core
pub mod clock;
pub mod driver;
pub mod job;
pub mod serializer;

// Execution
pub mod consumer;
pub mod manager;
pub mod service;
pub mod worker;

// Supporting modules
pub mod cli;
pub mod shutdown;
pub mod telemetry;

pub use consumer::{Consumer, ConsumerOptions};
pub use error::{JobError, QueueError, Result};
pub use job::{Job, JobOptions, Queueable, DEFAULT_QUEUE};
pub use manager::{QueueManager, ReservedJob};
pub use serializer::{ClassSerializer, JobSerializer, JsonSerializer, SerializationKind, SerializedJob};
pub use service::QueueService;
pub use worker::{Worker, WorkerOptions};
