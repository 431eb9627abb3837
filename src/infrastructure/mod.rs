//! Infrastructure layer modules
//!
//! This module contains shared infrastructure components:
//! - `config`: Settings and connection configuration
//! - `error`: Queue and job error types
//! - `metrics`: Prometheus metrics helpers
//! - `postgres`: PostgreSQL pool backing the database driver
//! - `redis`: Redis pool backing the Redis driver

pub mod config;
pub mod error;
pub mod metrics;
pub mod postgres;
pub mod redis;
