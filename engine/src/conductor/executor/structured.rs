//! Structured Executor
//!
//! Translates a task into one SQL statement for the structured store and
//! runs it. Read-only statements return rows; anything else is executed as a
//! committed mutation and reports the affected-row count.

use super::{with_deadline, TaskExecutor};
use crate::conductor::decomposer::NO_STRUCTURED_SCHEMA;
use crate::conductor::types::{ExecutorKind, Payload, Task};
use crate::llm::router::LLMRouter;
use crate::llm::{strip_code_fence, Message};
use crate::store::StructuredStore;
use async_trait::async_trait;
use sdk::errors::EngineError;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Whether a statement reads or writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryClass {
    ReadOnly,
    Mutating,
}

/// Classify a statement by its leading keyword
pub fn classify(query: &str) -> QueryClass {
    let normalized = query.trim().to_uppercase();
    if ["SELECT", "PRAGMA", "EXPLAIN"]
        .iter()
        .any(|kw| normalized.starts_with(kw))
    {
        QueryClass::ReadOnly
    } else {
        QueryClass::Mutating
    }
}

pub struct StructuredExecutor {
    llm: Arc<LLMRouter>,
    store: Arc<dyn StructuredStore>,
    deadline: Duration,
}

impl StructuredExecutor {
    pub fn new(llm: Arc<LLMRouter>, store: Arc<dyn StructuredStore>, deadline: Duration) -> Self {
        Self {
            llm,
            store,
            deadline,
        }
    }

    async fn generate_query(&self, task: &Task, schema: &str) -> Result<String, EngineError> {
        let system = Message::system(format!(
            "You are a SQLite expert. Write exactly one SQL statement that accomplishes the task.\n\
            Use only tables and columns from this schema:\n{}\n\n\
            Return ONLY the SQL statement, no explanation and no markdown.",
            schema
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

        let query = strip_code_fence(&content).trim_end_matches(';').trim().to_string();
        if query.is_empty() {
            return Err(EngineError::QueryGeneration(
                "model returned an empty query".to_string(),
            ));
        }
        Ok(query)
    }
}

#[async_trait]
impl TaskExecutor for StructuredExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::StructuredQuery
    }

    async fn execute(&self, task: &Task) -> Result<Payload, EngineError> {
        let schema = match with_deadline(self.deadline, self.store.schema()).await {
            Ok(schema) => schema,
            Err(e) => {
                warn!("Structured schema unavailable: {}", e);
                NO_STRUCTURED_SCHEMA.to_string()
            }
        };

        let query = self.generate_query(task, &schema).await?;
        debug!(query = %query, "generated structured query");

        match classify(&query) {
            QueryClass::ReadOnly => {
                let rows = with_deadline(self.deadline, self.store.fetch_rows(&query)).await?;
                Ok(Payload::Rows { query, rows })
            }
            QueryClass::Mutating => {
                let affected_rows =
                    with_deadline(self.deadline, self.store.execute_mutation(&query)).await?;
                Ok(Payload::Mutation {
                    query,
                    affected_rows,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_read_only() {
        assert_eq!(classify("SELECT * FROM customers"), QueryClass::ReadOnly);
        assert_eq!(classify("  select 1"), QueryClass::ReadOnly);
        assert_eq!(classify("PRAGMA table_info(customers)"), QueryClass::ReadOnly);
        assert_eq!(classify("explain query plan select 1"), QueryClass::ReadOnly);
    }

    #[test]
    fn test_classify_mutating() {
        assert_eq!(
            classify("INSERT INTO customers VALUES (1, 'a')"),
            QueryClass::Mutating
        );
        assert_eq!(classify("UPDATE customers SET name = 'b'"), QueryClass::Mutating);
        assert_eq!(classify("DELETE FROM customers WHERE id = 1"), QueryClass::Mutating);
        assert_eq!(classify("WITH x AS (SELECT 1) SELECT * FROM x"), QueryClass::Mutating);
    }
}
