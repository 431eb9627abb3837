mod settings;

pub use settings::{ConnectionConfig, DriverClients, OtelConfig, Settings, WorkerSettings};
