//! Structured store backed by SQLite
//!
//! Each operation checks a connection out of the pool for exactly one
//! statement and hands it back when the guard drops, on success and on error
//! alike. Mutations run inside a transaction that is committed explicitly;
//! a transaction dropped before commit rolls back.

use super::StructuredStore;
use crate::conductor::types::Record;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, ConnectOptions, Row, TypeInfo, ValueRef};
use std::path::Path;
use tracing::{debug, info};

/// SQLite-backed structured store
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open an existing database file
    ///
    /// Unlike the engine's own data directory, the structured store is never
    /// created on demand: a missing file means the store is unreachable.
    pub async fn connect(db_path: &Path, max_connections: u32) -> Result<Self> {
        info!("Opening structured store at: {}", db_path.display());

        if !db_path.exists() {
            anyhow::bail!("Structured store not found at {}", db_path.display());
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(false)
            .foreign_keys(true)
            .disable_statement_logging();

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .context("Failed to connect to structured store")?;

        debug!("Structured store connection pool established");

        Ok(Self { pool })
    }

    /// Wrap an already-configured pool
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StructuredStore for SqliteStore {
    async fn schema(&self) -> Result<String> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .context("Failed to acquire structured store connection")?;

        let rows = sqlx::query("SELECT sql FROM sqlite_master WHERE type='table'")
            .fetch_all(&mut *conn)
            .await
            .context("Failed to read sqlite_master")?;

        let statements: Vec<String> = rows
            .iter()
            .filter_map(|row| row.try_get::<Option<String>, _>(0).ok().flatten())
            .collect();

        Ok(statements.join("\n"))
    }

    async fn fetch_rows(&self, query: &str) -> Result<Vec<Record>> {
        let mut conn = self.pool.acquire().await?;

        let rows = sqlx::query(query).fetch_all(&mut *conn).await?;

        rows.iter().map(row_to_record).collect()
    }

    async fn execute_mutation(&self, query: &str) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        let done = sqlx::query(query).execute(&mut *tx).await?;
        tx.commit().await?;

        Ok(done.rows_affected())
    }
}

/// Convert one row to a field→value map using each cell's storage class
fn row_to_record(row: &SqliteRow) -> Result<Record> {
    let mut record = Record::new();

    for (i, column) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(i)?;

        let value = if raw.is_null() {
            Value::Null
        } else {
            let storage_class = raw.type_info().name().to_string();
            match storage_class.as_str() {
                "INTEGER" | "BOOLEAN" => Value::from(row.try_get::<i64, _>(i)?),
                "REAL" => serde_json::Number::from_f64(row.try_get::<f64, _>(i)?)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
                "BLOB" => Value::String(hex::encode(row.try_get::<Vec<u8>, _>(i)?)),
                _ => Value::String(row.try_get::<String, _>(i)?),
            }
        };

        record.insert(column.name().to_string(), value);
    }

    Ok(record)
}
