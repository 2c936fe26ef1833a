//! Document store over a JSON Data API
//!
//! Queries arrive as a JSON query spec produced by the language model. The
//! spec is validated into a [`DocumentQuery`] before anything is sent, then
//! executed as `POST {base_url}/action/<operation>` with an extended-JSON
//! body. Results are normalized to plain JSON before they are returned.

use super::normalize::{normalize_document, normalize_value, to_extended_json, type_name};
use super::{CollectionShape, DocumentOutput, DocumentSession, DocumentStore};
use crate::conductor::types::Record;
use crate::config::DocumentStoreConfig;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Database-management actions
#[derive(Debug, Clone, PartialEq)]
pub enum DbAction {
    UseDb(String),
    ListDbs,
    ListCollections,
    CreateCollection(String),
    DropCollection(String),
    GetSchema(Option<String>),
}

/// A validated document query
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentQuery {
    Find {
        collection: String,
        filter: Value,
        projection: Option<Value>,
        sort: Option<Value>,
        limit: Option<u64>,
        skip: Option<u64>,
    },
    Aggregate {
        collection: String,
        pipeline: Vec<Value>,
    },
    Insert {
        collection: String,
        documents: Vec<Value>,
    },
    Update {
        collection: String,
        filter: Value,
        update: Value,
        upsert: bool,
        one: bool,
    },
    Delete {
        collection: String,
        filter: Value,
        one: bool,
    },
    Db(DbAction),
}

/// Loose shape of the query spec the language model emits
#[derive(Debug, Deserialize)]
struct RawQuerySpec {
    operation: Option<String>,
    collection: Option<String>,
    query: Option<Value>,
    pipeline: Option<Vec<Value>>,
    document: Option<Value>,
    update: Option<Value>,
    filter: Option<Value>,
    limit: Option<u64>,
    skip: Option<u64>,
    sort: Option<Value>,
    projection: Option<Value>,
    #[serde(default)]
    update_one: bool,
    #[serde(default)]
    delete_one: bool,
    #[serde(default)]
    upsert: bool,
    action: Option<String>,
    database: Option<String>,
}

impl DocumentQuery {
    /// Parse and validate a JSON query spec
    pub fn parse(text: &str) -> Result<Self> {
        let raw: RawQuerySpec =
            serde_json::from_str(text).context("Invalid JSON query specification")?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawQuerySpec) -> Result<Self> {
        let operation = raw
            .operation
            .ok_or_else(|| anyhow!("Missing required fields in query specification: operation"))?;

        if operation == "db_operation" {
            let action = raw
                .action
                .ok_or_else(|| anyhow!("Database operation requires 'action' field"))?;
            let db_action = match action.as_str() {
                "use_db" => DbAction::UseDb(
                    raw.database
                        .filter(|d| !d.is_empty())
                        .ok_or_else(|| anyhow!("No database specified"))?,
                ),
                "list_dbs" => DbAction::ListDbs,
                "list_collections" => DbAction::ListCollections,
                "create_collection" => DbAction::CreateCollection(collection_name(raw.collection)?),
                "drop_collection" => DbAction::DropCollection(collection_name(raw.collection)?),
                "get_schema" => DbAction::GetSchema(raw.collection),
                other => bail!("Unsupported database operation: {}", other),
            };
            return Ok(DocumentQuery::Db(db_action));
        }

        let collection = raw
            .collection
            .filter(|c| !c.is_empty())
            .ok_or_else(|| anyhow!("Missing required fields in query specification: collection"))?;

        match operation.as_str() {
            "find" => Ok(DocumentQuery::Find {
                collection,
                filter: raw
                    .query
                    .or(raw.filter)
                    .ok_or_else(|| anyhow!("Find operation requires 'query' field"))?,
                projection: raw.projection,
                sort: raw.sort,
                limit: raw.limit.filter(|l| *l > 0),
                skip: raw.skip.filter(|s| *s > 0),
            }),
            "aggregate" => Ok(DocumentQuery::Aggregate {
                collection,
                pipeline: raw
                    .pipeline
                    .ok_or_else(|| anyhow!("Aggregate operation requires 'pipeline' field"))?,
            }),
            "insert" => {
                let documents = match raw
                    .document
                    .ok_or_else(|| anyhow!("Insert operation requires 'document' field"))?
                {
                    Value::Array(items) => items,
                    single => vec![single],
                };
                if documents.is_empty() {
                    bail!("Insert operation requires at least one document");
                }
                Ok(DocumentQuery::Insert {
                    collection,
                    documents,
                })
            }
            "update" => Ok(DocumentQuery::Update {
                collection,
                filter: raw
                    .filter
                    .ok_or_else(|| anyhow!("Update operation requires 'filter' field"))?,
                update: raw
                    .update
                    .ok_or_else(|| anyhow!("Update operation requires 'update' field"))?,
                upsert: raw.upsert,
                one: raw.update_one,
            }),
            "delete" => {
                let filter = raw
                    .filter
                    .ok_or_else(|| anyhow!("Delete operation requires 'filter' field"))?;
                if filter.as_object().map(Map::is_empty).unwrap_or(true) {
                    bail!("Refusing to delete with an empty filter");
                }
                Ok(DocumentQuery::Delete {
                    collection,
                    filter,
                    one: raw.delete_one,
                })
            }
            other => bail!(
                "Invalid operation type: {}. Must be one of [find, aggregate, insert, update, delete]",
                other
            ),
        }
    }

    /// Target collection, if the query has one
    pub fn collection(&self) -> Option<&str> {
        match self {
            DocumentQuery::Find { collection, .. }
            | DocumentQuery::Aggregate { collection, .. }
            | DocumentQuery::Insert { collection, .. }
            | DocumentQuery::Update { collection, .. }
            | DocumentQuery::Delete { collection, .. } => Some(collection),
            DocumentQuery::Db(_) => None,
        }
    }

    /// Short operation name for logs and payloads
    pub fn operation(&self) -> &'static str {
        match self {
            DocumentQuery::Find { .. } => "find",
            DocumentQuery::Aggregate { .. } => "aggregate",
            DocumentQuery::Insert { .. } => "insert",
            DocumentQuery::Update { .. } => "update",
            DocumentQuery::Delete { .. } => "delete",
            DocumentQuery::Db(_) => "db_operation",
        }
    }

    /// Data API action name and request body fields for a collection query
    fn to_action(&self) -> Option<(&'static str, Map<String, Value>)> {
        let mut body = Map::new();
        let action = match self {
            DocumentQuery::Find {
                filter,
                projection,
                sort,
                limit,
                skip,
                ..
            } => {
                body.insert("filter".into(), to_extended_json(filter.clone()));
                if let Some(p) = projection {
                    body.insert("projection".into(), p.clone());
                }
                if let Some(s) = sort {
                    body.insert("sort".into(), s.clone());
                }
                if let Some(l) = limit {
                    body.insert("limit".into(), json!(l));
                }
                if let Some(s) = skip {
                    body.insert("skip".into(), json!(s));
                }
                "find"
            }
            DocumentQuery::Aggregate { pipeline, .. } => {
                body.insert(
                    "pipeline".into(),
                    to_extended_json(Value::Array(pipeline.clone())),
                );
                "aggregate"
            }
            DocumentQuery::Insert { documents, .. } if documents.len() == 1 => {
                body.insert("document".into(), to_extended_json(documents[0].clone()));
                "insertOne"
            }
            DocumentQuery::Insert { documents, .. } => {
                body.insert(
                    "documents".into(),
                    to_extended_json(Value::Array(documents.clone())),
                );
                "insertMany"
            }
            DocumentQuery::Update {
                filter,
                update,
                upsert,
                one,
                ..
            } => {
                body.insert("filter".into(), to_extended_json(filter.clone()));
                body.insert("update".into(), to_extended_json(update.clone()));
                body.insert("upsert".into(), json!(upsert));
                if *one {
                    "updateOne"
                } else {
                    "updateMany"
                }
            }
            DocumentQuery::Delete { filter, one, .. } => {
                body.insert("filter".into(), to_extended_json(filter.clone()));
                if *one {
                    "deleteOne"
                } else {
                    "deleteMany"
                }
            }
            DocumentQuery::Db(_) => return None,
        };
        Some((action, body))
    }
}

fn collection_name(collection: Option<String>) -> Result<String> {
    collection
        .filter(|c| !c.is_empty())
        .ok_or_else(|| anyhow!("No collection name specified"))
}

/// Shared Data API client settings
struct DataApi {
    client: Client,
    base_url: String,
    data_source: String,
    api_key: Option<String>,
}

impl DataApi {
    async fn call(
        &self,
        action: &str,
        database: &str,
        collection: &str,
        mut body: Map<String, Value>,
    ) -> Result<Value> {
        body.insert("dataSource".into(), json!(self.data_source));
        body.insert("database".into(), json!(database));
        body.insert("collection".into(), json!(collection));

        let url = format!("{}/action/{}", self.base_url, action);
        debug!("Document store request: {} {}.{}", action, database, collection);

        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/ejson")
            .header("Accept", "application/ejson")
            .json(&Value::Object(body));

        if let Some(key) = &self.api_key {
            request = request.header("api-key", key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_connect() {
                anyhow!("Cannot connect to document store at {}", self.base_url)
            } else {
                anyhow!(e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("Document store error ({}): {}", status, text);
        }

        response
            .json::<Value>()
            .await
            .context("Failed to parse document store response")
    }
}

/// Data API connector
pub struct HttpDocumentStore {
    api: Arc<DataApi>,
    config: DocumentStoreConfig,
}

impl HttpDocumentStore {
    /// Build a connector from configuration; the API key is read from the
    /// configured environment variable when present
    pub fn new(config: DocumentStoreConfig, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        let api_key = std::env::var(&config.api_key_env).ok();
        if api_key.is_none() {
            debug!("{} not set, calling the document store without a key", config.api_key_env);
        }

        Ok(Self {
            api: Arc::new(DataApi {
                client,
                base_url: config.base_url.trim_end_matches('/').to_string(),
                data_source: config.data_source.clone(),
                api_key,
            }),
            config,
        })
    }
}

#[async_trait]
impl DocumentStore for HttpDocumentStore {
    async fn list_databases(&self) -> Result<Vec<String>> {
        Ok(self.config.known_databases())
    }

    async fn ping(&self) -> Result<()> {
        let mut body = Map::new();
        body.insert("filter".into(), json!({}));
        body.insert("limit".into(), json!(1));

        let collection = self
            .config
            .collections
            .first()
            .cloned()
            .unwrap_or_else(|| "users".to_string());

        self.api
            .call("find", &self.config.database, &collection, body)
            .await
            .map(|_| ())
    }

    async fn open_session(&self) -> Result<Box<dyn DocumentSession>> {
        Ok(Box::new(HttpDocumentSession {
            api: Arc::clone(&self.api),
            database: self.config.database.clone(),
            collections: self.config.collections.clone(),
            sample_size: self.config.sample_size,
        }))
    }
}

/// One task's view of the document store
pub struct HttpDocumentSession {
    api: Arc<DataApi>,
    database: String,
    collections: Vec<String>,
    sample_size: u32,
}

impl HttpDocumentSession {
    async fn sample_shape(&self, collection: &str) -> Result<CollectionShape> {
        let mut body = Map::new();
        body.insert("filter".into(), json!({}));
        body.insert("limit".into(), json!(self.sample_size));

        let response = self
            .api
            .call("find", &self.database, collection, body)
            .await?;

        let mut shape = CollectionShape::new();
        for doc in documents_of(&response) {
            if let Value::Object(fields) = doc {
                for (field, value) in fields {
                    shape
                        .entry(field.clone())
                        .or_insert_with(|| type_name(value).to_string());
                }
            }
        }
        Ok(shape)
    }
}

fn documents_of(response: &Value) -> &[Value] {
    response
        .get("documents")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn count_of(response: &Value, field: &str) -> u64 {
    match response.get(field) {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(other) => normalize_value(other.clone())
            .as_u64()
            .unwrap_or(0),
        None => 0,
    }
}

fn id_to_string(id: &Value) -> String {
    match normalize_value(id.clone()) {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

#[async_trait]
impl DocumentSession for HttpDocumentSession {
    fn use_database(&mut self, name: &str) {
        info!("Switching document store database to {}", name);
        self.database = name.to_string();
    }

    fn database(&self) -> &str {
        &self.database
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        Ok(self.collections.clone())
    }

    async fn create_collection(&mut self, name: &str) -> Result<bool> {
        if self.collections.iter().any(|c| c == name) {
            return Ok(false);
        }
        // The Data API creates a collection on its first insert
        info!("Registering collection {} in {}", name, self.database);
        self.collections.push(name.to_string());
        Ok(true)
    }

    async fn drop_collection(&mut self, name: &str) -> Result<bool> {
        if !self.collections.iter().any(|c| c == name) {
            return Ok(false);
        }
        bail!("The Data API has no action for dropping collection {}", name)
    }

    async fn schema(&self) -> Result<BTreeMap<String, CollectionShape>> {
        let mut schemas = BTreeMap::new();
        for collection in &self.collections {
            let shape = self.sample_shape(collection).await?;
            schemas.insert(collection.clone(), shape);
        }
        Ok(schemas)
    }

    async fn execute(&mut self, query: &DocumentQuery) -> Result<DocumentOutput> {
        if let DocumentQuery::Db(action) = query {
            return match action {
                DbAction::UseDb(name) => {
                    self.use_database(name);
                    Ok(DocumentOutput::Documents(vec![]))
                }
                _ => bail!("Database operations are answered by the executor"),
            };
        }

        let (action, body) = query
            .to_action()
            .ok_or_else(|| anyhow!("Unsupported operation: {}", query.operation()))?;
        let collection = query.collection().unwrap_or_default().to_string();

        if !self.collections.contains(&collection) {
            if matches!(query, DocumentQuery::Insert { .. }) {
                info!("Collection {} does not exist. Creating it.", collection);
                self.collections.push(collection.clone());
            } else {
                bail!("Collection {} does not exist", collection);
            }
        }

        let response = self
            .api
            .call(action, &self.database, &collection, body)
            .await?;

        match query {
            DocumentQuery::Find { .. } | DocumentQuery::Aggregate { .. } => {
                let documents: Vec<Record> = documents_of(&response)
                    .iter()
                    .filter_map(|doc| doc.as_object().cloned())
                    .map(normalize_document)
                    .collect();
                info!(
                    "{} on {} returned {} documents",
                    query.operation(),
                    collection,
                    documents.len()
                );
                Ok(DocumentOutput::Documents(documents))
            }
            DocumentQuery::Insert { .. } => {
                let inserted_ids: Vec<String> = match response.get("insertedIds") {
                    Some(Value::Array(ids)) => ids.iter().map(id_to_string).collect(),
                    _ => response
                        .get("insertedId")
                        .map(|id| vec![id_to_string(id)])
                        .unwrap_or_default(),
                };
                Ok(DocumentOutput::Written {
                    affected_count: inserted_ids.len() as u64,
                    inserted_ids,
                })
            }
            DocumentQuery::Update { .. } => {
                let modified = count_of(&response, "modifiedCount");
                let upserted: Vec<String> = response
                    .get("upsertedId")
                    .map(|id| vec![id_to_string(id)])
                    .unwrap_or_default();
                if modified == 0 && upserted.is_empty() {
                    warn!("Update on {} modified no documents", collection);
                }
                Ok(DocumentOutput::Written {
                    affected_count: modified + upserted.len() as u64,
                    inserted_ids: upserted,
                })
            }
            DocumentQuery::Delete { .. } => Ok(DocumentOutput::Written {
                affected_count: count_of(&response, "deletedCount"),
                inserted_ids: vec![],
            }),
            DocumentQuery::Db(_) => Ok(DocumentOutput::Documents(vec![])),
        }
    }

    async fn close(self: Box<Self>) {
        debug!("Document store session on {} closed", self.database);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_find() {
        let q = DocumentQuery::parse(
            r#"{"collection": "users", "operation": "find", "query": {"active": true}, "limit": 5}"#,
        )
        .unwrap();
        assert_eq!(q.collection(), Some("users"));
        assert_eq!(q.operation(), "find");
        match q {
            DocumentQuery::Find { limit, .. } => assert_eq!(limit, Some(5)),
            _ => panic!("expected find"),
        }
    }

    #[test]
    fn test_parse_rejects_unknown_operation() {
        let err = DocumentQuery::parse(r#"{"collection": "users", "operation": "drop"}"#)
            .unwrap_err();
        assert!(err.to_string().contains("Invalid operation type: drop"));
    }

    #[test]
    fn test_parse_requires_fields() {
        let err = DocumentQuery::parse(r#"{"collection": "users", "operation": "aggregate"}"#)
            .unwrap_err();
        assert!(err.to_string().contains("'pipeline'"));

        let err = DocumentQuery::parse(r#"{"operation": "find", "query": {}}"#).unwrap_err();
        assert!(err.to_string().contains("collection"));

        let err = DocumentQuery::parse(
            r#"{"collection": "users", "operation": "update", "filter": {"a": 1}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("'update'"));
    }

    #[test]
    fn test_parse_refuses_empty_delete_filter() {
        let err = DocumentQuery::parse(
            r#"{"collection": "users", "operation": "delete", "filter": {}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("empty filter"));
    }

    #[test]
    fn test_parse_db_operation() {
        let q = DocumentQuery::parse(
            r#"{"operation": "db_operation", "action": "use_db", "database": "crm"}"#,
        )
        .unwrap();
        assert_eq!(q, DocumentQuery::Db(DbAction::UseDb("crm".to_string())));

        let err = DocumentQuery::parse(r#"{"operation": "db_operation", "action": "shrink"}"#)
            .unwrap_err();
        assert!(err.to_string().contains("Unsupported database operation"));
    }

    #[test]
    fn test_parse_collection_management() {
        let q = DocumentQuery::parse(
            r#"{"operation": "db_operation", "action": "create_collection", "collection": "audit"}"#,
        )
        .unwrap();
        assert_eq!(
            q,
            DocumentQuery::Db(DbAction::CreateCollection("audit".to_string()))
        );

        let q = DocumentQuery::parse(
            r#"{"operation": "db_operation", "action": "drop_collection", "collection": "audit"}"#,
        )
        .unwrap();
        assert_eq!(q, DocumentQuery::Db(DbAction::DropCollection("audit".to_string())));

        let err = DocumentQuery::parse(
            r#"{"operation": "db_operation", "action": "create_collection"}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("No collection name specified"));
    }

    fn session(collections: &[&str]) -> HttpDocumentSession {
        let store = HttpDocumentStore::new(
            DocumentStoreConfig {
                collections: collections.iter().map(|c| c.to_string()).collect(),
                ..DocumentStoreConfig::default()
            },
            Duration::from_secs(1),
        )
        .unwrap();
        HttpDocumentSession {
            api: Arc::clone(&store.api),
            database: store.config.database.clone(),
            collections: store.config.collections.clone(),
            sample_size: 1,
        }
    }

    #[tokio::test]
    async fn test_create_collection_registers_once() {
        let mut session = session(&["users"]);
        assert!(session.create_collection("audit").await.unwrap());
        assert!(!session.create_collection("audit").await.unwrap());
        assert!(!session.create_collection("users").await.unwrap());
        assert_eq!(
            session.list_collections().await.unwrap(),
            vec!["users", "audit"]
        );
    }

    #[tokio::test]
    async fn test_drop_collection_is_unsupported() {
        let mut session = session(&["users"]);
        assert!(!session.drop_collection("missing").await.unwrap());

        let err = session.drop_collection("users").await.unwrap_err();
        assert!(err.to_string().contains("no action for dropping"));
        assert_eq!(session.list_collections().await.unwrap(), vec!["users"]);
    }

    #[test]
    fn test_insert_many_action() {
        let q = DocumentQuery::parse(
            r#"{"collection": "logs", "operation": "insert", "document": [{"a": 1}, {"a": 2}]}"#,
        )
        .unwrap();
        let (action, body) = q.to_action().unwrap();
        assert_eq!(action, "insertMany");
        assert_eq!(body["documents"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_update_one_action_wraps_dates() {
        let q = DocumentQuery::parse(
            r#"{"collection": "users", "operation": "update", "update_one": true,
                "filter": {"last_login": {"$lt": "2024-01-01"}}, "update": {"$set": {"active": false}}}"#,
        )
        .unwrap();
        let (action, body) = q.to_action().unwrap();
        assert_eq!(action, "updateOne");
        assert_eq!(
            body["filter"]["last_login"]["$lt"]["$date"],
            "2024-01-01T00:00:00.000Z"
        );
        assert_eq!(body["upsert"], false);
    }
}
