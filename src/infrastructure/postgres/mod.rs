//! PostgreSQL backing for the database queue driver.

pub mod pool;

pub use pool::PostgresPool;
