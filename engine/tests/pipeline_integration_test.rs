//! End-to-end tests for the conductor pipeline
//!
//! Runs decomposition, scheduling, routing, execution and aggregation
//! against a real SQLite file and a mocked document Data API. The language
//! model is replaced by a scripted provider that answers by prompt.

use async_trait::async_trait;
use serde_json::{json, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

use polyquery_engine::conductor::types::{ExecutorKind, Outcome, Payload, ReportStatus};
use polyquery_engine::conductor::{Conductor, ExecutionReport, PipelineResponse, TaskAnalysis};
use polyquery_engine::config::Config;
use polyquery_engine::llm::router::LLMRouter;
use polyquery_engine::llm::{LLMError, LLMProvider, Message, MessageRole};
use polyquery_engine::store::ConfiguredStores;

const PREFERENCE_ID: &str = "65f0c0ffee00000000000001";

/// Provider that replies from a script instead of a model
///
/// Decomposition prompts get the next decomposition reply; executor prompts
/// get the reply of the first rule whose needle occurs in the user message.
/// A rule with several replies hands them out in order, repeating the last.
struct ScriptedProvider {
    decomposition: Vec<String>,
    rules: Vec<(String, Vec<String>)>,
    counters: Mutex<HashMap<String, usize>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl ScriptedProvider {
    fn new(decomposition: Value) -> Self {
        Self {
            decomposition: vec![decomposition.to_string()],
            rules: Vec::new(),
            counters: Mutex::new(HashMap::new()),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn raw_decomposition(reply: &str) -> Self {
        let mut provider = Self::new(Value::Null);
        provider.decomposition = vec![reply.to_string()];
        provider
    }

    fn reply(mut self, needle: &str, reply: &str) -> Self {
        self.rules.push((needle.to_string(), vec![reply.to_string()]));
        self
    }

    fn replies(mut self, needle: &str, replies: &[&str]) -> Self {
        self.rules.push((
            needle.to_string(),
            replies.iter().map(|r| r.to_string()).collect(),
        ));
        self
    }

    fn next(&self, key: &str, replies: &[String]) -> Option<String> {
        let mut counters = self.counters.lock().unwrap();
        let count = counters.entry(key.to_string()).or_insert(0);
        let reply = replies.get((*count).min(replies.len().saturating_sub(1)))?;
        *count += 1;
        Some(reply.clone())
    }
}

#[async_trait]
impl LLMProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn is_local(&self) -> bool {
        true
    }

    async fn generate(&self, messages: &[Message]) -> Result<String, LLMError> {
        let system = messages
            .iter()
            .find(|m| m.role == MessageRole::System)
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        let user = messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();

        if system.contains("data analysis planner") {
            return self
                .next("__decomposition", &self.decomposition)
                .ok_or_else(|| LLMError::InvalidRequest("no decomposition".to_string()));
        }

        self.calls.lock().unwrap().push(user.clone());
        for (needle, replies) in &self.rules {
            if user.contains(needle.as_str()) {
                if let Some(reply) = self.next(needle, replies) {
                    return Ok(reply);
                }
            }
        }
        Err(LLMError::InvalidRequest(format!("no scripted reply for: {}", user)))
    }
}

fn task(agent: &str, definition: &str, priority: u8, dependencies: &[usize]) -> Value {
    json!({
        "agent": agent,
        "taskDefinition": definition,
        "purpose": format!("needed for: {}", definition),
        "priority": priority,
        "dependencies": dependencies,
    })
}

fn batch(tasks: Vec<Value>, retry_count: u32) -> Value {
    json!({
        "tasks": tasks,
        "context": {
            "required_data": ["customer records"],
            "relationships": [],
            "error_handling": {"retry_count": retry_count, "fallback_strategy": "report"}
        }
    })
}

async fn fixture_db(dir: &TempDir) -> PathBuf {
    let path = dir.path().join("shop.db");
    let options = SqliteConnectOptions::new()
        .filename(&path)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .unwrap();

    for statement in [
        "CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT NOT NULL, city TEXT)",
        "CREATE TABLE orders (id INTEGER PRIMARY KEY, customer_id INTEGER, total REAL)",
        "INSERT INTO customers VALUES (1, 'Ada', 'London'), (2, 'Grace', 'New York')",
        "INSERT INTO orders VALUES (1, 1, 20.5), (2, 1, 10.0), (3, 2, 7.25)",
    ] {
        sqlx::query(statement).execute(&pool).await.unwrap();
    }
    pool.close().await;
    path
}

async fn document_api() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/action/find"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "documents": [
                {"_id": {"$oid": PREFERENCE_ID}, "user_id": 1, "theme": "dark"}
            ]
        })))
        .mount(&server)
        .await;
    server
}

fn config_for(db: &Path, document_url: &str) -> Config {
    let mut config = Config::default_config();
    config.stores.structured.path = db.to_path_buf();
    config.stores.document.base_url = document_url.to_string();
    config.stores.document.database = "shop".to_string();
    config.stores.document.collections = vec!["preferences".to_string()];
    config.orchestration.store_timeout_secs = 5;
    config
}

fn conductor(config: Config, provider: ScriptedProvider) -> Conductor {
    let config = Arc::new(config);
    let llm = Arc::new(LLMRouter::new(
        vec![Box::new(provider) as Box<dyn LLMProvider>],
        Arc::new(config.llm.clone()),
    ));
    let stores = Arc::new(ConfiguredStores::new(
        config.stores.clone(),
        Duration::from_secs(5),
    ));
    Conductor::new(config, llm, stores).unwrap()
}

fn report(response: PipelineResponse) -> ExecutionReport {
    match response {
        PipelineResponse::Report(report) => report,
        PipelineResponse::Fatal(fatal) => panic!("unexpected fatal response: {}", fatal.error),
    }
}

#[tokio::test]
async fn test_batch_with_one_failing_task_still_succeeds() {
    let dir = TempDir::new().unwrap();
    let db = fixture_db(&dir).await;
    let server = document_api().await;

    let mut config = config_for(&db, &server.uri());
    config.orchestration.enforce_coverage = false;

    let provider = ScriptedProvider::new(batch(
        vec![
            task("structured_query", "List customers", 5, &[]),
            task("structured_query", "Total order amount per customer", 4, &[0]),
            task("document_query", "Find user preferences", 3, &[]),
            task("structured_query", "Count orders", 2, &[]),
            task("structured_query", "Read the invoices table", 1, &[]),
        ],
        0,
    ))
    .reply("List customers", "SELECT id, name FROM customers ORDER BY id")
    .reply(
        "Total order amount",
        "```sql\nSELECT customer_id, SUM(total) AS total FROM orders GROUP BY customer_id;\n```",
    )
    .reply(
        "preferences",
        r#"{"collection": "preferences", "operation": "find", "query": {"user_id": 1}, "limit": 10}"#,
    )
    .reply("Count orders", "SELECT COUNT(*) AS n FROM orders")
    .reply("invoices", "SELECT * FROM invoices");

    let report = report(conductor(config, provider).run("Summarize my shop").await);

    assert_eq!(report.status, ReportStatus::Success);
    assert_eq!(report.results.len(), 5);
    assert_eq!(report.failure_count(), 1);

    let definitions: Vec<&str> = report
        .results
        .iter()
        .map(|r| r.task.task_definition.as_str())
        .collect();
    assert_eq!(
        definitions,
        vec![
            "List customers",
            "Total order amount per customer",
            "Find user preferences",
            "Count orders",
            "Read the invoices table",
        ]
    );

    match &report.results[0].outcome {
        Outcome::Success(Payload::Rows { rows, .. }) => {
            assert_eq!(rows.len(), 2);
            assert_eq!(rows[0]["id"], json!(1));
            assert_eq!(rows[0]["name"], json!("Ada"));
        }
        other => panic!("expected rows, got {:?}", other),
    }

    match &report.results[2].outcome {
        Outcome::Success(Payload::Documents {
            collection,
            documents,
            ..
        }) => {
            assert_eq!(collection, "preferences");
            assert_eq!(documents[0]["_id"], json!(PREFERENCE_ID));
        }
        other => panic!("expected documents, got {:?}", other),
    }

    match &report.results[4].outcome {
        Outcome::Failure(error) => assert!(error.contains("invoices"), "{}", error),
        other => panic!("expected failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unknown_kind_fails_while_siblings_complete() {
    let dir = TempDir::new().unwrap();
    let db = fixture_db(&dir).await;

    // Document store is never needed for this batch
    let config = config_for(&db, "http://127.0.0.1:1");
    let provider = ScriptedProvider::raw_decomposition("unused")
        .reply("List customers", "SELECT name FROM customers ORDER BY id");
    let conductor = conductor(config, provider);

    let analysis = batch(
        vec![
            task("unknown_kind", "Do something unusual", 2, &[]),
            task("structured_query", "List customers", 1, &[]),
        ],
        0,
    );
    let mut messages = vec![
        Message::user("list customers and something unusual"),
        Message::assistant(analysis.to_string()),
    ];

    let report = report(conductor.execute_turn(&mut messages).await);
    assert_eq!(report.results.len(), 2);
    assert_eq!(
        report.results[0].outcome,
        Outcome::Failure("no executor available".to_string())
    );
    assert!(report.results[1].outcome.is_success());

    assert_eq!(messages.len(), 3);
    let envelope: Value = serde_json::from_str(&messages[2].content).unwrap();
    assert_eq!(envelope["status"], "success");
    assert_eq!(
        envelope["unknown_kind_results"][0]["error"],
        "no executor available"
    );
    assert_eq!(
        envelope["structured_query_results"][0]["result"]["rows"][1]["name"],
        "Grace"
    );
    assert_eq!(envelope["original_analysis"]["analysis"]["total_tasks"], 2);

    let decoded = ExecutionReport::from_envelope(&envelope).unwrap();
    assert_eq!(decoded.results, report.results);
}

#[tokio::test]
async fn test_coverage_adds_missing_document_task() {
    let dir = TempDir::new().unwrap();
    let db = fixture_db(&dir).await;
    let server = document_api().await;

    let provider = ScriptedProvider::new(batch(
        vec![task("structured_query", "List all customers", 4, &[])],
        0,
    ))
    .reply(
        "Retrieve all documents from preferences",
        r#"{"collection": "preferences", "operation": "find", "query": {}}"#,
    )
    .reply("List all customers", "SELECT * FROM customers");

    let conductor = conductor(config_for(&db, &server.uri()), provider);
    let report = report(
        conductor
            .run("show all customers and their saved preferences")
            .await,
    );

    assert_eq!(report.results.len(), 2);
    assert_eq!(report.failure_count(), 0);

    let injected = &report.results[1];
    assert_eq!(injected.task.agent, ExecutorKind::DocumentQuery);
    assert!(injected
        .task
        .task_definition
        .starts_with("Retrieve all documents from preferences"));
    match &injected.outcome {
        Outcome::Success(Payload::Documents { documents, .. }) => {
            assert_eq!(documents.len(), 1);
            assert_eq!(documents[0]["theme"], json!("dark"));
        }
        other => panic!("expected documents, got {:?}", other),
    }
}

#[tokio::test]
async fn test_dependency_runs_before_higher_priority_dependent() {
    let dir = TempDir::new().unwrap();
    let db = fixture_db(&dir).await;

    let mut config = config_for(&db, "http://127.0.0.1:1");
    config.orchestration.enforce_coverage = false;

    let provider = ScriptedProvider::new(batch(
        vec![
            task("structured_query", "Count orders", 1, &[]),
            task("structured_query", "List customers", 5, &[0]),
        ],
        0,
    ))
    .reply("Count orders", "SELECT COUNT(*) AS n FROM orders")
    .reply("List customers", "SELECT name FROM customers");
    let calls = Arc::clone(&provider.calls);

    let report = report(conductor(config, provider).run("orders then customers").await);

    let calls = calls.lock().unwrap().clone();
    let count_at = calls.iter().position(|c| c.contains("Count orders")).unwrap();
    let list_at = calls.iter().position(|c| c.contains("List customers")).unwrap();
    assert!(count_at < list_at);

    // Report order follows priority, not execution order
    assert_eq!(report.results[0].task.task_definition, "List customers");
    assert_eq!(report.failure_count(), 0);
}

#[tokio::test]
async fn test_failed_query_is_retried_up_to_the_cap() {
    let dir = TempDir::new().unwrap();
    let db = fixture_db(&dir).await;

    let mut config = config_for(&db, "http://127.0.0.1:1");
    config.orchestration.enforce_coverage = false;
    config.orchestration.max_task_retries = 2;

    let provider = ScriptedProvider::new(batch(
        vec![task("structured_query", "Count orders", 3, &[])],
        5,
    ))
    .replies(
        "Count orders",
        &["SELECT COUNT(*) FROM order_lines", "SELECT COUNT(*) AS n FROM orders"],
    );
    let calls = Arc::clone(&provider.calls);

    let report = report(conductor(config, provider).run("count orders").await);

    assert_eq!(calls.lock().unwrap().len(), 2);
    match &report.results[0].outcome {
        Outcome::Success(Payload::Rows { rows, .. }) => assert_eq!(rows[0]["n"], json!(3)),
        other => panic!("expected rows, got {:?}", other),
    }
}

#[tokio::test]
async fn test_mutation_is_committed() {
    let dir = TempDir::new().unwrap();
    let db = fixture_db(&dir).await;

    let mut config = config_for(&db, "http://127.0.0.1:1");
    config.orchestration.enforce_coverage = false;

    let provider = ScriptedProvider::new(batch(
        vec![task("structured_query", "Move Ada to Paris", 3, &[])],
        0,
    ))
    .reply(
        "Move Ada",
        "UPDATE customers SET city = 'Paris' WHERE name = 'Ada';",
    );

    let report = report(conductor(config, provider).run("Ada moved to Paris").await);
    match &report.results[0].outcome {
        Outcome::Success(Payload::Mutation { affected_rows, .. }) => {
            assert_eq!(*affected_rows, 1)
        }
        other => panic!("expected mutation, got {:?}", other),
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(SqliteConnectOptions::new().filename(&db))
        .await
        .unwrap();
    let city: (String,) = sqlx::query_as("SELECT city FROM customers WHERE id = 1")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(city.0, "Paris");
}

#[tokio::test]
async fn test_document_database_operation() {
    let dir = TempDir::new().unwrap();
    let db = fixture_db(&dir).await;
    let server = document_api().await;

    let mut config = config_for(&db, &server.uri());
    config.orchestration.enforce_coverage = false;

    let provider = ScriptedProvider::new(batch(
        vec![task("document_query", "List the collections", 3, &[])],
        0,
    ))
    .reply(
        "List the collections",
        r#"{"operation": "db_operation", "action": "list_collections"}"#,
    );

    let report = report(conductor(config, provider).run("what collections exist").await);
    match &report.results[0].outcome {
        Outcome::Success(Payload::Info { data, .. }) => {
            assert_eq!(data["database"], json!("shop"));
            assert_eq!(data["collections"], json!(["preferences"]));
        }
        other => panic!("expected info, got {:?}", other),
    }
}

#[tokio::test]
async fn test_document_collection_management() {
    let dir = TempDir::new().unwrap();
    let db = fixture_db(&dir).await;
    let server = document_api().await;

    let mut config = config_for(&db, &server.uri());
    config.orchestration.enforce_coverage = false;

    let provider = ScriptedProvider::new(batch(
        vec![
            task("document_query", "Create an audit collection", 3, &[]),
            task("document_query", "Drop the preferences collection", 2, &[]),
            task("document_query", "Create the preferences collection", 1, &[]),
            task("document_query", "Switch to the archive database", 1, &[]),
        ],
        0,
    ))
    .reply(
        "Create an audit",
        r#"{"operation": "db_operation", "action": "create_collection", "collection": "audit"}"#,
    )
    .reply(
        "Drop the preferences",
        r#"{"operation": "db_operation", "action": "drop_collection", "collection": "preferences"}"#,
    )
    .reply(
        "Create the preferences",
        r#"{"operation": "db_operation", "action": "create_collection", "collection": "preferences"}"#,
    )
    .reply(
        "Switch to the archive",
        r#"{"operation": "db_operation", "action": "use_db", "database": "archive"}"#,
    );

    let report = report(conductor(config, provider).run("manage collections").await);
    assert_eq!(report.results.len(), 4);

    match &report.results[0].outcome {
        Outcome::Success(Payload::Info { data, .. }) => {
            assert_eq!(data["collection"], json!("audit"));
            assert_eq!(data["message"], json!("Collection audit created"));
        }
        other => panic!("expected info, got {:?}", other),
    }
    match &report.results[1].outcome {
        Outcome::Failure(error) => assert!(error.contains("no action for dropping"), "{}", error),
        other => panic!("expected failure, got {:?}", other),
    }
    match &report.results[2].outcome {
        Outcome::Failure(error) => {
            assert_eq!(error, "Collection preferences already exists")
        }
        other => panic!("expected failure, got {:?}", other),
    }
    match &report.results[3].outcome {
        Outcome::Success(Payload::Info { data, .. }) => {
            assert_eq!(data["database"], json!("archive"));
            assert!(data["message"]
                .as_str()
                .unwrap()
                .contains("for this task only"));
        }
        other => panic!("expected info, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unreachable_store_is_fatal() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("missing.db");

    let provider = ScriptedProvider::new(batch(
        vec![task("structured_query", "List customers", 3, &[])],
        0,
    ));
    let conductor = conductor(config_for(&missing, "http://127.0.0.1:1"), provider);

    match conductor.run("list customers").await {
        PipelineResponse::Fatal(fatal) => {
            assert_eq!(fatal.status, ReportStatus::Error);
            assert!(fatal.error.starts_with("Store unavailable"), "{}", fatal.error);
            assert_eq!(fatal.retry_count, 0);
        }
        PipelineResponse::Report(report) => panic!("expected fatal, got {:?}", report),
    }
}

#[tokio::test]
async fn test_decomposition_failure_is_fatal() {
    let dir = TempDir::new().unwrap();
    let db = fixture_db(&dir).await;

    let provider = ScriptedProvider::raw_decomposition("I cannot help with that.");
    let conductor = conductor(config_for(&db, "http://127.0.0.1:1"), provider);

    let messages = conductor.handle("list customers").await;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].role, MessageRole::Assistant);

    let fatal: Value = serde_json::from_str(&messages[1].content).unwrap();
    assert_eq!(fatal["status"], "error");
    assert_eq!(fatal["retry_count"], 0);
    assert!(fatal["error"]
        .as_str()
        .unwrap()
        .starts_with("Failed to analyze query:"));
}

#[tokio::test]
async fn test_handle_appends_analysis_then_envelope() {
    let dir = TempDir::new().unwrap();
    let db = fixture_db(&dir).await;

    let mut config = config_for(&db, "http://127.0.0.1:1");
    config.orchestration.enforce_coverage = false;

    let provider = ScriptedProvider::new(batch(
        vec![task("structured_query", "List customers", 3, &[])],
        0,
    ))
    .reply("List customers", "SELECT name FROM customers");

    let messages = conductor(config, provider).handle("who are my customers").await;
    assert_eq!(messages.len(), 3);

    let analysis: TaskAnalysis = serde_json::from_str(&messages[1].content).unwrap();
    assert_eq!(analysis.analysis.total_tasks, 1);
    assert_eq!(analysis.current_task_index, 0);
    assert_eq!(analysis.analysis.task_types, vec!["structured_query"]);

    let envelope: Value = serde_json::from_str(&messages[2].content).unwrap();
    assert_eq!(envelope["status"], "success");
    assert_eq!(
        envelope["structured_query_results"][0]["result"]["rows"]
            .as_array()
            .unwrap()
            .len(),
        2
    );
}
