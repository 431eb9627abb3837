//! PostgreSQL connection pool implementing the queue's database service.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Column, Postgres, Row, TypeInfo};

use crate::driver::{DatabaseService, SqlRow, SqlStatement, SqlValue};
use crate::error::Result;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);
const IDLE_TIMEOUT: Duration = Duration::from_secs(600);

pub struct PostgresPool {
    pool: PgPool,
    database_url: String,
}

impl PostgresPool {
    pub async fn connect(url: &str, pool_size: u32) -> std::result::Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(pool_size)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .idle_timeout(IDLE_TIMEOUT)
            .connect(url)
            .await?;

        tracing::info!(pool_size, "PostgreSQL connection pool created");

        Ok(Self::from_pool(pool, url))
    }

    /// Wrap a pool owned by the host application.
    pub fn from_pool(pool: PgPool, url: &str) -> Self {
        Self {
            pool,
            database_url: url.to_string(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Get the database URL (masked for logging).
    pub fn database_url_masked(&self) -> String {
        mask_url(&self.database_url)
    }

    pub async fn close(&self) {
        self.pool.close().await;
        tracing::info!("PostgreSQL connection pool closed");
    }
}

fn mask_url(url: &str) -> String {
    // Credentials live between "scheme://" and the last '@' of the authority
    let start = url.find("://").map_or(0, |pos| pos + 3);
    let end = url[start..].find('/').map_or(url.len(), |pos| start + pos);
    let Some(at_pos) = url[start..end].rfind('@').map(|pos| start + pos) else {
        return url.to_string();
    };
    match url[start..at_pos].find(':') {
        Some(colon_pos) => format!("{}***{}", &url[..start + colon_pos + 1], &url[at_pos..]),
        None => url.to_string(),
    }
}

fn bind_values<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    values: &'q [SqlValue],
) -> Query<'q, Postgres, PgArguments> {
    for value in values {
        query = match value {
            SqlValue::Null => query.bind(None::<i64>),
            SqlValue::Int(v) => query.bind(*v),
            SqlValue::Text(s) => query.bind(s.as_str()),
        };
    }
    query
}

fn decode_row(row: &PgRow) -> std::result::Result<SqlRow, sqlx::Error> {
    let mut decoded = SqlRow::with_capacity(row.columns().len());
    for column in row.columns() {
        let index = column.ordinal();
        let value = match column.type_info().name() {
            "INT8" => row.try_get::<Option<i64>, _>(index)?.map(SqlValue::Int),
            "INT4" => row
                .try_get::<Option<i32>, _>(index)?
                .map(|v| SqlValue::Int(v as i64)),
            "INT2" => row
                .try_get::<Option<i16>, _>(index)?
                .map(|v| SqlValue::Int(v as i64)),
            _ => row.try_get::<Option<String>, _>(index)?.map(SqlValue::Text),
        };
        decoded.insert(column.name().to_string(), value.unwrap_or(SqlValue::Null));
    }
    Ok(decoded)
}

#[async_trait]
impl DatabaseService for PostgresPool {
    async fn execute(&self, sql: &str, bindings: &[SqlValue]) -> Result<Vec<SqlRow>> {
        let rows = bind_values(sqlx::query(sql), bindings)
            .fetch_all(&self.pool)
            .await?;
        let decoded = rows
            .iter()
            .map(decode_row)
            .collect::<std::result::Result<Vec<_>, sqlx::Error>>()?;
        Ok(decoded)
    }

    async fn transaction(&self, statements: Vec<SqlStatement>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for statement in &statements {
            bind_values(sqlx::query(&statement.sql), &statement.bindings)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
