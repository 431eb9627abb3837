//! Queue manager
//!
//! Owns the registry of named connections and the serializer, and routes
//! push/pop calls from jobs to drivers. Connections whose database service is
//! not available yet are parked and resolved once [`QueueManager::bind_database`]
//! supplies one.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use futures::FutureExt;

use crate::clock::{system_clock, SharedClock};
use crate::config::{ConnectionConfig, Settings};
use crate::driver::{create_driver, DatabaseService, JobCallback, SharedDriver, Subscription};
use crate::error::{QueueError, Result};
use crate::job::{Job, DEFAULT_QUEUE};
use crate::metrics::QueueMetrics;
use crate::serializer::{JobSerializer, SerializedJob};
use crate::worker::Worker;

/// Connection registered by [`QueueManager::new`].
pub const DEFAULT_CONNECTION: &str = "default";

/// A popped job together with the envelope needed to acknowledge it.
pub struct ReservedJob {
    pub job: Box<dyn Job>,
    pub envelope: SerializedJob,
    pub connection: String,
    pub queue: String,
}

pub struct QueueManager {
    connections: DashMap<String, SharedDriver>,
    pending: DashMap<String, ConnectionConfig>,
    database: RwLock<Option<Arc<dyn DatabaseService>>>,
    default_connection: String,
    serializer: Arc<dyn JobSerializer>,
    clock: SharedClock,
}

impl QueueManager {
    /// Manager with an in-memory `default` connection.
    pub fn new(serializer: Arc<dyn JobSerializer>) -> Self {
        Self::with_clock(serializer, system_clock())
    }

    pub fn with_clock(serializer: Arc<dyn JobSerializer>, clock: SharedClock) -> Self {
        let manager = Self {
            connections: DashMap::new(),
            pending: DashMap::new(),
            database: RwLock::new(None),
            default_connection: DEFAULT_CONNECTION.to_string(),
            serializer,
            clock,
        };
        manager.connections.insert(
            DEFAULT_CONNECTION.to_string(),
            Arc::new(crate::driver::MemoryDriver::with_clock(manager.clock.clone())),
        );
        manager
    }

    /// Build a manager from loaded settings.
    ///
    /// Database connections without a service are deferred; every other
    /// misconfiguration fails immediately.
    pub fn from_settings(settings: &Settings, serializer: Arc<dyn JobSerializer>) -> Result<Self> {
        let mut manager = Self::new(serializer);
        manager.default_connection = settings.default.clone();

        let mut names: Vec<&String> = settings.connections.keys().collect();
        names.sort();
        for name in names {
            let config = &settings.connections[name];
            if config.awaits_database() {
                tracing::debug!(connection = %name, "Deferring database connection until a service is bound");
                manager.pending.insert(name.clone(), config.clone());
            } else {
                manager.register_connection(name, config.clone())?;
            }
        }
        Ok(manager)
    }

    pub fn with_default_connection(mut self, name: impl Into<String>) -> Self {
        self.default_connection = name.into();
        self
    }

    pub fn default_connection(&self) -> &str {
        &self.default_connection
    }

    pub fn serializer(&self) -> &Arc<dyn JobSerializer> {
        &self.serializer
    }

    /// Construct and register the driver for `config`, replacing any
    /// connection of the same name.
    pub fn register_connection(&self, name: &str, config: ConnectionConfig) -> Result<()> {
        let driver = create_driver(&config, self.clock.clone())?;
        tracing::info!(connection = %name, driver = %driver.name(), "Queue connection registered");
        self.pending.remove(name);
        self.connections.insert(name.to_string(), driver);
        Ok(())
    }

    /// Supply the database service and resolve parked connections.
    /// Returns how many connections were resolved.
    pub fn bind_database(&self, db: Arc<dyn DatabaseService>) -> Result<usize> {
        if let Ok(mut slot) = self.database.write() {
            *slot = Some(db);
        }

        let names: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        let mut resolved = 0;
        for name in names {
            if self.resolve_pending(&name)?.is_some() {
                resolved += 1;
            }
        }
        Ok(resolved)
    }

    pub fn has_connection(&self, name: &str) -> bool {
        self.connections.contains_key(name) || self.pending.contains_key(name)
    }

    /// Resolve a connection name (or the default) to its driver.
    pub fn driver(&self, name: Option<&str>) -> Result<SharedDriver> {
        let name = name.unwrap_or(&self.default_connection);
        if let Some(driver) = self.connections.get(name) {
            return Ok(driver.clone());
        }
        if self.pending.contains_key(name) {
            return self
                .resolve_pending(name)?
                .ok_or_else(|| QueueError::missing_dependency("database", "database service"));
        }
        Err(QueueError::ConnectionNotFound(name.to_string()))
    }

    fn resolve_pending(&self, name: &str) -> Result<Option<SharedDriver>> {
        let db = self.database.read().ok().and_then(|slot| slot.clone());
        let Some(db) = db else {
            return Ok(None);
        };
        let Some((_, mut config)) = self.pending.remove(name) else {
            return Ok(self.connections.get(name).map(|d| d.clone()));
        };
        config.clients.database = Some(db);
        let driver = create_driver(&config, self.clock.clone())?;
        tracing::info!(connection = %name, "Deferred database connection resolved");
        self.connections.insert(name.to_string(), driver.clone());
        Ok(Some(driver))
    }

    fn route(&self, job: &dyn Job) -> (String, String) {
        let options = job.options();
        let connection = options
            .connection_name
            .clone()
            .unwrap_or_else(|| self.default_connection.clone());
        let queue = options
            .queue_name
            .clone()
            .unwrap_or_else(|| DEFAULT_QUEUE.to_string());
        (connection, queue)
    }

    /// Serialize and enqueue a job, handing it back for chaining.
    pub async fn push<J: Job>(&self, job: J) -> Result<J> {
        let (connection, queue) = self.route(&job);
        let driver = self.driver(Some(&connection))?;
        let envelope = self.serializer.serialize(&job)?;
        let id = envelope.id.clone();

        driver.push(&queue, envelope).await?;
        QueueMetrics::record_pushed(&connection, 1);
        tracing::debug!(job = %job.name(), id = %id, connection = %connection, queue = %queue, "Job pushed");
        Ok(job)
    }

    /// Enqueue several jobs, batching per `(connection, queue)` where the
    /// driver supports it.
    pub async fn push_many<J: Job>(&self, jobs: &[J]) -> Result<()> {
        let mut groups: Vec<((String, String), Vec<SerializedJob>)> = Vec::new();
        let mut index: HashMap<(String, String), usize> = HashMap::new();

        for job in jobs {
            let key = self.route(job);
            let envelope = self.serializer.serialize(job)?;
            match index.get(&key) {
                Some(&i) => groups[i].1.push(envelope),
                None => {
                    index.insert(key.clone(), groups.len());
                    groups.push((key, vec![envelope]));
                }
            }
        }

        for ((connection, queue), envelopes) in groups {
            let driver = self.driver(Some(&connection))?;
            let count = envelopes.len();
            match driver.as_batch() {
                Some(batch) => batch.push_many(&queue, envelopes).await?,
                None => {
                    for envelope in envelopes {
                        driver.push(&queue, envelope).await?;
                    }
                }
            }
            QueueMetrics::record_pushed(&connection, count);
            tracing::debug!(connection = %connection, queue = %queue, count, "Jobs pushed");
        }
        Ok(())
    }

    /// Pop and deserialize the next job.
    ///
    /// An envelope that cannot be parsed or deserialized is logged, dropped
    /// and reported as `None`, so a malformed message never breaks a polling
    /// loop.
    pub async fn pop(&self, queue: Option<&str>, connection: Option<&str>) -> Result<Option<Box<dyn Job>>> {
        let connection = connection.unwrap_or(&self.default_connection);
        let queue = queue.unwrap_or(DEFAULT_QUEUE);
        let driver = self.driver(Some(connection))?;

        let Some(envelope) = self.next_envelope(&driver, connection, queue).await? else {
            return Ok(None);
        };

        match self.serializer.deserialize(&envelope) {
            Ok(job) => Ok(Some(job)),
            Err(e) => {
                self.drop_envelope(&driver, connection, queue, &envelope, &e).await?;
                Ok(None)
            }
        }
    }

    /// Pop a job and keep its envelope for a later [`acknowledge`](Self::acknowledge).
    ///
    /// Undeserializable envelopes are acknowledged straight away on drivers
    /// that hold reservations, so they do not come back after the lease.
    pub async fn reserve(&self, queue: &str, connection: Option<&str>) -> Result<Option<ReservedJob>> {
        let connection = connection.unwrap_or(&self.default_connection).to_string();
        let driver = self.driver(Some(&connection))?;

        let Some(envelope) = self.next_envelope(&driver, &connection, queue).await? else {
            return Ok(None);
        };

        match self.serializer.deserialize(&envelope) {
            Ok(job) => Ok(Some(ReservedJob {
                job,
                envelope,
                connection,
                queue: queue.to_string(),
            })),
            Err(e) => {
                self.drop_envelope(&driver, &connection, queue, &envelope, &e).await?;
                Ok(None)
            }
        }
    }

    /// Driver pop that swallows payloads the driver could not parse,
    /// acknowledging them by handle where the driver keeps reservations.
    async fn next_envelope(
        &self,
        driver: &SharedDriver,
        connection: &str,
        queue: &str,
    ) -> Result<Option<SerializedJob>> {
        match driver.pop(queue).await {
            Ok(Some(envelope)) => {
                QueueMetrics::record_popped(connection);
                Ok(Some(envelope))
            }
            Ok(None) => Ok(None),
            Err(QueueError::MalformedEnvelope { receipt_handle, reason }) => {
                QueueMetrics::record_deserialize_failure(connection);
                tracing::error!(
                    connection = %connection,
                    queue = %queue,
                    receipt_handle = ?receipt_handle,
                    error = %reason,
                    "Malformed job envelope, dropping it"
                );
                if let (Some(ack), Some(handle)) = (driver.as_acknowledge(), receipt_handle.as_deref()) {
                    ack.acknowledge_handle(queue, handle).await?;
                }
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn drop_envelope(
        &self,
        driver: &SharedDriver,
        connection: &str,
        queue: &str,
        envelope: &SerializedJob,
        error: &QueueError,
    ) -> Result<()> {
        QueueMetrics::record_deserialize_failure(connection);
        tracing::error!(
            id = %envelope.id,
            connection = %connection,
            queue = %queue,
            error = %error,
            "Failed to deserialize job, dropping it"
        );
        if let Some(ack) = driver.as_acknowledge() {
            ack.acknowledge(queue, envelope).await?;
        }
        Ok(())
    }

    /// Release a reserved job for good. A no-op on drivers that remove jobs on pop.
    pub async fn acknowledge(&self, reserved: &ReservedJob) -> Result<()> {
        let driver = self.driver(Some(&reserved.connection))?;
        if let Some(ack) = driver.as_acknowledge() {
            ack.acknowledge(&reserved.queue, &reserved.envelope).await?;
        }
        Ok(())
    }

    pub async fn size(&self, queue: Option<&str>, connection: Option<&str>) -> Result<usize> {
        let driver = self.driver(connection)?;
        driver.size(queue.unwrap_or(DEFAULT_QUEUE)).await
    }

    pub async fn clear(&self, queue: Option<&str>, connection: Option<&str>) -> Result<()> {
        let driver = self.driver(connection)?;
        driver.clear(queue.unwrap_or(DEFAULT_QUEUE)).await
    }

    /// Run every message a subscribable driver delivers through `worker`.
    pub async fn subscribe(
        &self,
        queue: &str,
        connection: Option<&str>,
        worker: Arc<Worker>,
    ) -> Result<Subscription> {
        let connection = connection.unwrap_or(&self.default_connection).to_string();
        let driver = self.driver(Some(&connection))?;
        let subscribable = driver.as_subscribable().ok_or(QueueError::Unsupported {
            driver: driver.name(),
            operation: "subscribe",
        })?;

        let serializer = self.serializer.clone();
        let callback: JobCallback = Arc::new(move |envelope: SerializedJob| {
            let serializer = serializer.clone();
            let worker = worker.clone();
            let connection = connection.clone();
            async move {
                let mut job = match serializer.deserialize(&envelope) {
                    Ok(job) => job,
                    Err(e) => {
                        QueueMetrics::record_deserialize_failure(&connection);
                        tracing::error!(id = %envelope.id, error = %e, "Failed to deserialize delivered job");
                        return Ok(());
                    }
                };
                worker.process(job.as_mut()).await
            }
            .boxed()
        });

        subscribable.subscribe(queue, callback).await
    }
}
