//! Backing stores
//!
//! The two systems tasks are executed against. Executors only see the traits
//! defined here; `structured` provides the SQLite implementation and
//! `document` the Data API client.

use crate::conductor::types::Record;
use crate::config::StoresConfig;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub mod document;
pub mod normalize;
pub mod structured;

pub use document::{DocumentQuery, HttpDocumentStore};
pub use structured::SqliteStore;

/// Inferred shape of one collection: field name to type name
pub type CollectionShape = BTreeMap<String, String>;

/// Structured (tabular) store
#[async_trait]
pub trait StructuredStore: Send + Sync {
    /// DDL of every table, one statement per line
    async fn schema(&self) -> Result<String>;

    /// Run a read-only statement and return its rows
    async fn fetch_rows(&self, query: &str) -> Result<Vec<Record>>;

    /// Run a mutating statement inside a transaction, commit it and
    /// return the affected-row count
    async fn execute_mutation(&self, query: &str) -> Result<u64>;
}

/// Result of a document store operation
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentOutput {
    /// Documents returned by find / aggregate, already normalized
    Documents(Vec<Record>),

    /// Write summary
    Written {
        affected_count: u64,
        inserted_ids: Vec<String>,
    },
}

/// Document store connector
///
/// Long-lived and shared; hands out one session per task.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Databases visible through this connector
    async fn list_databases(&self) -> Result<Vec<String>>;

    /// Verify the store answers at all
    async fn ping(&self) -> Result<()>;

    /// Open a session bound to the default database
    async fn open_session(&self) -> Result<Box<dyn DocumentSession>>;
}

/// A task-scoped document store session
#[async_trait]
pub trait DocumentSession: Send + Sync {
    /// Switch the database subsequent operations run against
    fn use_database(&mut self, name: &str);

    /// Currently selected database
    fn database(&self) -> &str;

    /// Collections in the current database
    async fn list_collections(&self) -> Result<Vec<String>>;

    /// Create a collection; false when it already exists
    async fn create_collection(&mut self, name: &str) -> Result<bool>;

    /// Drop a collection; false when there is no such collection
    async fn drop_collection(&mut self, name: &str) -> Result<bool>;

    /// Collection name to inferred shape for the current database
    async fn schema(&self) -> Result<BTreeMap<String, CollectionShape>>;

    /// Execute a validated query
    async fn execute(&mut self, query: &DocumentQuery) -> Result<DocumentOutput>;

    /// Release the session
    async fn close(self: Box<Self>);
}

/// Builds store handles for a request
///
/// Construction is where an unreachable store is detected; a failure here
/// fails the whole batch rather than any single task.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn structured(&self) -> Result<Arc<dyn StructuredStore>>;

    async fn document(&self) -> Result<Arc<dyn DocumentStore>>;
}

/// Connector for the stores described in configuration
pub struct ConfiguredStores {
    config: StoresConfig,
    timeout: Duration,
}

impl ConfiguredStores {
    pub fn new(config: StoresConfig, timeout: Duration) -> Self {
        Self { config, timeout }
    }
}

#[async_trait]
impl StoreConnector for ConfiguredStores {
    async fn structured(&self) -> Result<Arc<dyn StructuredStore>> {
        let store = SqliteStore::connect(
            &self.config.structured.path,
            self.config.structured.max_connections,
        )
        .await?;
        Ok(Arc::new(store))
    }

    async fn document(&self) -> Result<Arc<dyn DocumentStore>> {
        let store = HttpDocumentStore::new(self.config.document.clone(), self.timeout)?;
        store.ping().await?;
        Ok(Arc::new(store))
    }
}
