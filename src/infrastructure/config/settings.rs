use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;

use crate::driver::{DatabaseService, KeyListClient, LogClient, ManagedQueueClient};
use crate::infrastructure::postgres::PostgresPool;
use crate::infrastructure::redis::RedisPool;
use crate::serializer::SerializationKind;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Connection used when a job or call does not name one
    #[serde(default = "default_connection")]
    pub default: String,
    #[serde(default)]
    pub serializer: SerializationKind,
    #[serde(default)]
    pub connections: HashMap<String, ConnectionConfig>,
    /// Start an embedded consumer on install (development mode only)
    #[serde(default)]
    pub auto_start_worker: bool,
    #[serde(default)]
    pub worker: Option<WorkerSettings>,
    #[serde(default = "default_run_mode")]
    pub run_mode: String,
    #[serde(default)]
    pub otel: OtelConfig,
}

/// A named connection: driver kind plus driver-specific settings.
///
/// Backend clients cannot come from a file; they are attached at runtime
/// through [`DriverClients`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectionConfig {
    pub driver: String,
    /// database: jobs table name
    #[serde(default)]
    pub table: Option<String>,
    /// database: lease window in seconds
    #[serde(default)]
    pub lease_seconds: Option<u64>,
    /// redis: key prefix
    #[serde(default)]
    pub prefix: Option<String>,
    /// database / redis: connection URL used by the standalone worker
    #[serde(default)]
    pub url: Option<String>,
    /// database: pool size when connecting from `url`
    #[serde(default)]
    pub pool_size: Option<u32>,
    /// kafka: consumer group
    #[serde(default)]
    pub consumer_group_id: Option<String>,
    /// sqs: prepended to queue names to form queue URLs
    #[serde(default)]
    pub queue_url_prefix: Option<String>,
    #[serde(default)]
    pub visibility_timeout: Option<u32>,
    #[serde(default)]
    pub wait_time_seconds: Option<u32>,
    #[serde(skip)]
    pub clients: DriverClients,
}

/// Runtime backend handles for a connection.
#[derive(Clone, Default)]
pub struct DriverClients {
    pub database: Option<Arc<dyn DatabaseService>>,
    pub key_list: Option<Arc<dyn KeyListClient>>,
    pub log: Option<Arc<dyn LogClient>>,
    pub managed_queue: Option<Arc<dyn ManagedQueueClient>>,
}

impl fmt::Debug for DriverClients {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverClients")
            .field("database", &self.database.is_some())
            .field("key_list", &self.key_list.is_some())
            .field("log", &self.log.is_some())
            .field("managed_queue", &self.managed_queue.is_some())
            .finish()
    }
}

/// Options for the embedded consumer started by the queue service.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSettings {
    pub queues: Vec<String>,
    #[serde(default)]
    pub connection: Option<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_keep_alive")]
    pub keep_alive: bool,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Per-attempt timeout in seconds
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OtelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_otel_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_sampling_ratio")]
    pub sampling_ratio: f64,
    /// Emit logs as JSON lines instead of human-readable text
    #[serde(default)]
    pub json_logs: bool,
}

fn default_connection() -> String {
    "default".to_string()
}

fn default_run_mode() -> String {
    "development".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_keep_alive() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    3
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_service_name() -> String {
    "orbit-queue".to_string()
}

fn default_sampling_ratio() -> f64 {
    1.0
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load settings, layering (lowest first): defaults, `config/queue`,
    /// `config/queue.{RUN_MODE}`, the optional JSON file, then `QUEUE__*`
    /// environment variables (e.g. `QUEUE__CONNECTIONS__JOBS__DRIVER=redis`).
    pub fn load(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let mut builder = Config::builder()
            .set_default("default", "default")?
            .set_default("serializer", "class")?
            .set_default("run_mode", run_mode.as_str())?
            .set_default("auto_start_worker", false)?
            .add_source(File::with_name("config/queue").required(false))
            .add_source(File::with_name(&format!("config/queue.{}", run_mode)).required(false));

        if let Some(path) = config_file {
            builder = builder.add_source(File::from(path).format(FileFormat::Json).required(true));
        }

        builder
            .add_source(
                Environment::with_prefix("QUEUE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    pub fn is_development(&self) -> bool {
        matches!(self.run_mode.as_str(), "development" | "dev")
    }

    /// Build database and Redis clients for connections that carry a `url`
    /// and have no client attached yet.
    pub async fn connect_clients(&mut self) -> crate::error::Result<()> {
        for (name, connection) in self.connections.iter_mut() {
            let Some(url) = connection.url.clone() else {
                continue;
            };
            match connection.driver.as_str() {
                "database" if connection.clients.database.is_none() => {
                    let pool = PostgresPool::connect(&url, connection.pool_size.unwrap_or(10)).await?;
                    tracing::info!(
                        connection = %name,
                        url = %pool.database_url_masked(),
                        "Database client connected"
                    );
                    connection.clients.database = Some(Arc::new(pool));
                }
                "redis" if connection.clients.key_list.is_none() => {
                    let pool = RedisPool::new(&url)?;
                    tracing::info!(connection = %name, "Redis client configured");
                    connection.clients.key_list = Some(Arc::new(pool));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default: default_connection(),
            serializer: SerializationKind::Class,
            connections: HashMap::new(),
            auto_start_worker: false,
            worker: None,
            run_mode: default_run_mode(),
            otel: OtelConfig::default(),
        }
    }
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_otel_endpoint(),
            service_name: default_service_name(),
            sampling_ratio: default_sampling_ratio(),
            json_logs: false,
        }
    }
}

impl ConnectionConfig {
    pub fn new(driver: &str) -> Self {
        Self {
            driver: driver.to_string(),
            ..Default::default()
        }
    }

    pub fn memory() -> Self {
        Self::new("memory")
    }

    pub fn database(db: Arc<dyn DatabaseService>) -> Self {
        let mut config = Self::new("database");
        config.clients.database = Some(db);
        config
    }

    pub fn redis(client: Arc<dyn KeyListClient>) -> Self {
        let mut config = Self::new("redis");
        config.clients.key_list = Some(client);
        config
    }

    pub fn kafka(client: Arc<dyn LogClient>) -> Self {
        let mut config = Self::new("kafka");
        config.clients.log = Some(client);
        config
    }

    pub fn sqs(client: Arc<dyn ManagedQueueClient>) -> Self {
        let mut config = Self::new("sqs");
        config.clients.managed_queue = Some(client);
        config
    }

    pub fn with_table(mut self, table: &str) -> Self {
        self.table = Some(table.to_string());
        self
    }

    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = Some(prefix.to_string());
        self
    }

    /// A database connection still waiting for its database service.
    pub fn awaits_database(&self) -> bool {
        self.driver == "database" && self.clients.database.is_none()
    }
}
