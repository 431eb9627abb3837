//! Relational database driver.
//!
//! Jobs are rows in a table shaped like:
//!
//! ```sql
//! CREATE TABLE jobs (
//!     id           BIGSERIAL PRIMARY KEY,
//!     queue        VARCHAR(255) NOT NULL,
//!     payload      TEXT NOT NULL,
//!     attempts     INTEGER NOT NULL DEFAULT 0,
//!     available_at BIGINT NOT NULL,
//!     reserved_at  BIGINT NULL,
//!     created_at   BIGINT NOT NULL
//! );
//! ```
//!
//! Timestamps are epoch milliseconds taken from the driver clock. A pop takes
//! a lease by stamping `reserved_at`; rows whose lease is older than the lease
//! window become eligible again, which recovers jobs from crashed consumers.
//! Acknowledging a job deletes its row.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::clock::SharedClock;
use crate::error::{QueueError, Result};
use crate::serializer::SerializedJob;

use super::{AcknowledgeCapable, BatchCapable, QueueDriver};

pub const DEFAULT_TABLE: &str = "jobs";

/// Reservations older than this are considered abandoned.
pub const DEFAULT_LEASE_SECONDS: u64 = 300;

/// A bound parameter or a decoded column value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlValue {
    Null,
    Int(i64),
    Text(String),
}

impl SqlValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Int(v) => Some(*v),
            SqlValue::Text(s) => s.parse().ok(),
            SqlValue::Null => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

/// One result row, keyed by column name.
pub type SqlRow = HashMap<String, SqlValue>;

#[derive(Debug, Clone, PartialEq)]
pub struct SqlStatement {
    pub sql: String,
    pub bindings: Vec<SqlValue>,
}

/// Raw SQL access supplied by the host application.
///
/// Statements use `$n` positional placeholders.
#[async_trait]
pub trait DatabaseService: Send + Sync {
    async fn execute(&self, sql: &str, bindings: &[SqlValue]) -> Result<Vec<SqlRow>>;

    /// Run all statements in one transaction.
    async fn transaction(&self, statements: Vec<SqlStatement>) -> Result<()>;
}

/// DDL for the jobs table, for hosts that do not manage it with migrations.
pub fn create_table_sql(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            id BIGSERIAL PRIMARY KEY,
            queue VARCHAR(255) NOT NULL,
            payload TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            available_at BIGINT NOT NULL,
            reserved_at BIGINT NULL,
            created_at BIGINT NOT NULL
        )"
    )
}

pub struct DatabaseDriver {
    db: Arc<dyn DatabaseService>,
    table: String,
    lease: Duration,
    clock: SharedClock,
}

impl DatabaseDriver {
    pub fn new(db: Arc<dyn DatabaseService>, clock: SharedClock) -> Self {
        Self {
            db,
            table: DEFAULT_TABLE.to_string(),
            lease: Duration::from_secs(DEFAULT_LEASE_SECONDS),
            clock,
        }
    }

    pub fn with_table(mut self, table: &str) -> Self {
        self.table = table.to_string();
        self
    }

    pub fn with_lease_seconds(mut self, seconds: u64) -> Self {
        self.lease = Duration::from_secs(seconds);
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn insert_statement(&self, queue: &str, job: &SerializedJob, now: i64) -> Result<SqlStatement> {
        let delay_ms = job.delay_seconds.unwrap_or(0).saturating_mul(1000) as i64;
        Ok(SqlStatement {
            sql: format!(
                "INSERT INTO {} (queue, payload, attempts, available_at, created_at) \
                 VALUES ($1, $2, $3, $4, $5)",
                self.table
            ),
            bindings: vec![
                queue.into(),
                job.to_json()?.into(),
                SqlValue::Int(job.attempts as i64),
                SqlValue::Int(now + delay_ms),
                SqlValue::Int(now),
            ],
        })
    }

    /// Reserve the oldest eligible row in one statement and return it.
    fn reserve_sql(&self, skip_locked: bool) -> String {
        format!(
            "UPDATE {table} SET reserved_at = $2 \
             WHERE id = ( \
                 SELECT id FROM {table} \
                 WHERE queue = $1 \
                   AND available_at <= $2 \
                   AND (reserved_at IS NULL OR reserved_at < $3) \
                 ORDER BY created_at ASC, id ASC \
                 LIMIT 1 \
                 FOR UPDATE{skip} \
             ) \
             RETURNING id, payload, attempts, available_at, created_at",
            table = self.table,
            skip = if skip_locked { " SKIP LOCKED" } else { "" },
        )
    }

    fn lease_cutoff(&self, now: i64) -> i64 {
        now - self.lease.as_millis() as i64
    }

    fn row_to_job(&self, row: &SqlRow) -> Result<SerializedJob> {
        let id = row
            .get("id")
            .and_then(SqlValue::as_i64)
            .ok_or_else(|| QueueError::backend(format!("{} row is missing id", self.table)))?;
        let payload = row
            .get("payload")
            .and_then(SqlValue::as_str)
            .ok_or_else(|| QueueError::backend(format!("{} row {} is missing payload", self.table, id)))?;

        let mut job = SerializedJob::from_json(payload)
            .map_err(|e| QueueError::malformed(Some(id.to_string()), e))?;
        if let Some(attempts) = row.get("attempts").and_then(SqlValue::as_i64) {
            job.attempts = attempts.max(0) as u32;
        }
        job.receipt_handle = Some(id.to_string());
        Ok(job)
    }
}

#[async_trait]
impl QueueDriver for DatabaseDriver {
    fn name(&self) -> &'static str {
        "database"
    }

    async fn push(&self, queue: &str, job: SerializedJob) -> Result<()> {
        let statement = self.insert_statement(queue, &job, self.clock.now_millis())?;
        self.db.execute(&statement.sql, &statement.bindings).await?;
        Ok(())
    }

    async fn pop(&self, queue: &str) -> Result<Option<SerializedJob>> {
        let now = self.clock.now_millis();
        let bindings = [
            SqlValue::from(queue),
            SqlValue::Int(now),
            SqlValue::Int(self.lease_cutoff(now)),
        ];

        let rows = match self.db.execute(&self.reserve_sql(true), &bindings).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::debug!(
                    table = %self.table,
                    error = %e,
                    "SKIP LOCKED reservation failed, retrying with plain FOR UPDATE"
                );
                self.db.execute(&self.reserve_sql(false), &bindings).await?
            }
        };

        rows.first().map(|row| self.row_to_job(row)).transpose()
    }

    async fn size(&self, queue: &str) -> Result<usize> {
        let now = self.clock.now_millis();
        let sql = format!(
            "SELECT COUNT(*) AS count FROM {} \
             WHERE queue = $1 \
               AND available_at <= $2 \
               AND (reserved_at IS NULL OR reserved_at < $3)",
            self.table
        );
        let rows = self
            .db
            .execute(
                &sql,
                &[
                    SqlValue::from(queue),
                    SqlValue::Int(now),
                    SqlValue::Int(self.lease_cutoff(now)),
                ],
            )
            .await?;

        Ok(rows
            .first()
            .and_then(|row| row.get("count"))
            .and_then(SqlValue::as_i64)
            .unwrap_or(0)
            .max(0) as usize)
    }

    async fn clear(&self, queue: &str) -> Result<()> {
        let sql = format!("DELETE FROM {} WHERE queue = $1", self.table);
        self.db.execute(&sql, &[SqlValue::from(queue)]).await?;
        Ok(())
    }

    fn as_batch(&self) -> Option<&dyn BatchCapable> {
        Some(self)
    }

    fn as_acknowledge(&self) -> Option<&dyn AcknowledgeCapable> {
        Some(self)
    }
}

#[async_trait]
impl BatchCapable for DatabaseDriver {
    async fn push_many(&self, queue: &str, jobs: Vec<SerializedJob>) -> Result<()> {
        if jobs.is_empty() {
            return Ok(());
        }
        let now = self.clock.now_millis();
        let statements = jobs
            .iter()
            .map(|job| self.insert_statement(queue, job, now))
            .collect::<Result<Vec<_>>>()?;
        self.db.transaction(statements).await
    }
}

#[async_trait]
impl AcknowledgeCapable for DatabaseDriver {
    async fn acknowledge_handle(&self, queue: &str, receipt_handle: &str) -> Result<()> {
        let Ok(row_id) = receipt_handle.parse::<i64>() else {
            tracing::debug!(queue = %queue, receipt_handle = %receipt_handle, "Handle is not a row id, nothing to acknowledge");
            return Ok(());
        };

        let sql = format!("DELETE FROM {} WHERE id = $1", self.table);
        self.db.execute(&sql, &[SqlValue::Int(row_id)]).await?;
        Ok(())
    }
}
