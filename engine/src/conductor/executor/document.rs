//! Document Executor
//!
//! Translates a task into a JSON query spec for the document store. Each task
//! opens its own session and closes it on every exit path.

use super::{with_deadline, TaskExecutor};
use crate::conductor::types::{ExecutorKind, Payload, Task};
use crate::llm::router::LLMRouter;
use crate::llm::{extract_json_object, Message};
use crate::store::document::DbAction;
use crate::store::{CollectionShape, DocumentOutput, DocumentQuery, DocumentSession, DocumentStore};
use async_trait::async_trait;
use sdk::errors::EngineError;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub struct DocumentExecutor {
    llm: Arc<LLMRouter>,
    store: Arc<dyn DocumentStore>,
    deadline: Duration,
}

impl DocumentExecutor {
    pub fn new(llm: Arc<LLMRouter>, store: Arc<dyn DocumentStore>, deadline: Duration) -> Self {
        Self {
            llm,
            store,
            deadline,
        }
    }

    async fn generate_query(
        &self,
        task: &Task,
        database: &str,
        schema: &BTreeMap<String, CollectionShape>,
    ) -> Result<(String, DocumentQuery), EngineError> {
        let schema_text = if schema.is_empty() {
            "No NoSQL schema available".to_string()
        } else {
            serde_json::to_string_pretty(schema).unwrap_or_default()
        };

        let system = Message::system(format!(
            "You are a document database expert. Current database: {}.\n\
            Collections and field types:\n{}\n\n\
            Respond with ONLY a JSON object:\n\
            {{\"collection\": \"name\", \"operation\": \"find|aggregate|insert|update|delete\", \
            \"query\": {{}}, \"pipeline\": [], \"document\": {{}}, \"update\": {{}}, \"filter\": {{}}, \
            \"limit\": 0, \"skip\": 0, \"sort\": {{}}, \"projection\": {{}}, \"update_one\": false, \
            \"delete_one\": false, \"upsert\": false}}\n\
            find needs query, aggregate needs pipeline, insert needs document, update needs \
            filter and update, delete needs a non-empty filter. Dates are ISO-8601 strings.\n\
            For database management answer {{\"operation\": \"db_operation\", \
            \"action\": \"use_db|list_dbs|list_collections|create_collection|drop_collection|get_schema\", \"database\": \"name\", \
            \"collection\": \"name\"}}.",
            database, schema_text
        ));
        let user = Message::user(format!(
            "Task: {}\nPurpose: {}",
            task.task_definition, task.purpose
        ));

        let (content, _) = self
            .llm
            .call(&[system, user])
            .await
            .map_err(|e| EngineError::QueryGeneration(e.to_string()))?;

        let spec = extract_json_object(&content)
            .ok_or_else(|| EngineError::QueryGeneration("Invalid JSON response from LLM".to_string()))?
            .to_string();

        let query = DocumentQuery::parse(&spec)
            .map_err(|e| EngineError::QueryGeneration(format!("{:#}", e)))?;

        Ok((spec, query))
    }

    async fn run_in_session(
        &self,
        session: &mut dyn DocumentSession,
        task: &Task,
    ) -> Result<Payload, EngineError> {
        let schema = match with_deadline(self.deadline, session.schema()).await {
            Ok(schema) => schema,
            Err(e) => {
                warn!("Document schema unavailable: {}", e);
                BTreeMap::new()
            }
        };

        let (spec, query) = self
            .generate_query(task, session.database(), &schema)
            .await?;
        debug!(query = %spec, "generated document query");

        if let DocumentQuery::Db(action) = &query {
            return self.db_operation(session, action, &schema, spec).await;
        }

        let collection = query.collection().unwrap_or_default().to_string();
        let output = with_deadline(self.deadline, session.execute(&query)).await?;

        Ok(match output {
            DocumentOutput::Documents(documents) => Payload::Documents {
                query: spec,
                collection,
                documents,
            },
            DocumentOutput::Written {
                affected_count,
                inserted_ids,
            } => Payload::DocumentMutation {
                query: spec,
                collection,
                operation: query.operation().to_string(),
                affected_count,
                inserted_ids,
            },
        })
    }

    async fn db_operation(
        &self,
        session: &mut dyn DocumentSession,
        action: &DbAction,
        schema: &BTreeMap<String, CollectionShape>,
        spec: String,
    ) -> Result<Payload, EngineError> {
        let data = match action {
            DbAction::UseDb(name) => {
                session.use_database(name);
                json!({
                    "database": name,
                    "message": format!(
                        "Switched to database: {} for this task only; later tasks use the default database",
                        name
                    )
                })
            }
            DbAction::ListDbs => {
                let databases = with_deadline(self.deadline, self.store.list_databases()).await?;
                json!({"count": databases.len(), "databases": databases})
            }
            DbAction::ListCollections => {
                let collections =
                    with_deadline(self.deadline, session.list_collections()).await?;
                json!({
                    "database": session.database(),
                    "count": collections.len(),
                    "collections": collections
                })
            }
            DbAction::CreateCollection(collection) => {
                if !with_deadline(self.deadline, session.create_collection(collection)).await? {
                    return Err(EngineError::QueryExecution(format!(
                        "Collection {} already exists",
                        collection
                    )));
                }
                json!({
                    "database": session.database(),
                    "collection": collection,
                    "message": format!("Collection {} created", collection)
                })
            }
            DbAction::DropCollection(collection) => {
                if !with_deadline(self.deadline, session.drop_collection(collection)).await? {
                    return Err(EngineError::QueryExecution(format!(
                        "Collection {} could not be dropped",
                        collection
                    )));
                }
                json!({
                    "database": session.database(),
                    "collection": collection,
                    "message": format!("Collection {} dropped", collection)
                })
            }
            DbAction::GetSchema(Some(collection)) => {
                let shape = schema.get(collection).ok_or_else(|| {
                    EngineError::QueryExecution(format!(
                        "Collection does not exist: {}",
                        collection
                    ))
                })?;
                json!({"collection": collection, "schema": shape})
            }
            DbAction::GetSchema(None) => json!({"schemas": schema}),
        };

        Ok(Payload::Info { query: spec, data })
    }
}

#[async_trait]
impl TaskExecutor for DocumentExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::DocumentQuery
    }

    async fn execute(&self, task: &Task) -> Result<Payload, EngineError> {
        let mut session = with_deadline(self.deadline, self.store.open_session()).await?;

        let outcome = self.run_in_session(session.as_mut(), task).await;
        session.close().await;

        outcome
    }
}
