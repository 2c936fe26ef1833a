//! Decomposer
//!
//! Turns one user utterance plus schema context into a validated `TaskBatch`.
//! Model output is decoded through a loose intermediate type and then checked
//! strictly (priority range, executor kinds, dependency ordering) before any
//! task can reach the scheduler. A coverage pass afterwards makes sure every
//! store whose schema the request refers to has a task.

use crate::conductor::types::{BatchContext, ExecutorKind, Task, TaskAnalysis, TaskBatch};
use crate::llm::router::LLMRouter;
use crate::llm::{extract_json_object, Message};
use crate::store::CollectionShape;
use regex::Regex;
use sdk::errors::{EngineError, EngineErrorExt};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Placeholder used when the structured schema cannot be read
pub const NO_STRUCTURED_SCHEMA: &str = "No SQL schema available";

/// Schema descriptions of both stores, as handed to the language model
#[derive(Debug, Clone, Default)]
pub struct SchemaContext {
    /// DDL text of the structured store
    pub structured: String,

    /// Collection name to inferred field types
    pub document: BTreeMap<String, CollectionShape>,
}

impl SchemaContext {
    /// Context used when neither store could describe itself
    pub fn placeholder() -> Self {
        Self {
            structured: NO_STRUCTURED_SCHEMA.to_string(),
            document: BTreeMap::new(),
        }
    }

    fn render_document(&self) -> String {
        if self.document.is_empty() {
            return "No NoSQL schema available".to_string();
        }
        serde_json::to_string_pretty(&self.document).unwrap_or_default()
    }
}

/// Intermediate deserialization type for model output
#[derive(Debug, Deserialize)]
struct RawBatch {
    tasks: Option<Vec<RawTask>>,
    #[serde(default)]
    context: Option<BatchContext>,
}

#[derive(Debug, Deserialize)]
struct RawTask {
    agent: Option<String>,
    #[serde(rename = "taskDefinition", alias = "task_definition")]
    task_definition: Option<String>,
    purpose: Option<String>,
    priority: Option<Value>,
    #[serde(default)]
    dependencies: Vec<Value>,
}

/// Whether tags outside the closed kind set are accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindPolicy {
    /// Reject the batch (model output)
    Strict,
    /// Keep the task as unregistered (incoming analysis)
    Lenient,
}

/// Parse model output into a validated batch
pub fn parse_batch(content: &str, policy: KindPolicy) -> Result<TaskBatch, EngineError> {
    let json = extract_json_object(content)
        .ok_or_else(|| EngineError::Decomposition("no JSON object in model output".to_string()))?;

    let raw: RawBatch = serde_json::from_str(json)
        .map_err(|e| EngineError::Decomposition(format!("invalid task JSON: {}", e)))?;

    let raw_tasks = raw
        .tasks
        .ok_or_else(|| EngineError::Decomposition("missing 'tasks' field".to_string()))?;

    let tasks = raw_tasks
        .into_iter()
        .enumerate()
        .map(|(i, raw)| convert_task(i, raw, policy))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(TaskBatch {
        tasks,
        context: raw.context.unwrap_or_default(),
    })
}

fn convert_task(index: usize, raw: RawTask, policy: KindPolicy) -> Result<Task, EngineError> {
    let tag = raw
        .agent
        .ok_or_else(|| EngineError::Decomposition(format!("task {} has no agent", index)))?;
    let agent = ExecutorKind::from(tag);
    if policy == KindPolicy::Strict && !agent.is_known() {
        return Err(EngineError::Decomposition(format!(
            "task {} has unknown agent '{}'",
            index, agent
        )));
    }

    let task_definition = raw
        .task_definition
        .filter(|d| !d.trim().is_empty())
        .ok_or_else(|| {
            EngineError::Decomposition(format!("task {} has no taskDefinition", index))
        })?;

    let priority = raw
        .priority
        .as_ref()
        .and_then(as_index)
        .ok_or_else(|| {
            EngineError::Decomposition(format!("task {} has a non-integer priority", index))
        })?;
    if !(1..=5).contains(&priority) {
        return Err(EngineError::Decomposition(format!(
            "task {} priority {} is outside 1..=5",
            index, priority
        )));
    }

    let dependencies = raw
        .dependencies
        .iter()
        .map(|d| {
            as_index(d).ok_or_else(|| {
                EngineError::Decomposition(format!(
                    "task {} has a non-integer dependency {}",
                    index, d
                ))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    for dep in &dependencies {
        if *dep >= index {
            return Err(EngineError::Decomposition(format!(
                "task {} depends on task {}, which does not come before it",
                index, dep
            )));
        }
    }

    Ok(Task {
        agent,
        task_definition,
        purpose: raw.purpose.unwrap_or_default(),
        priority: priority as u8,
        dependencies,
    })
}

/// Accept integers and integer-valued strings
fn as_index(value: &Value) -> Option<usize> {
    match value {
        Value::Number(n) => n.as_u64().map(|n| n as usize),
        Value::String(s) => s.trim().parse::<usize>().ok(),
        _ => None,
    }
}

/// Re-check a batch that did not come through `parse_batch`
pub fn validate_batch(batch: &TaskBatch) -> Result<(), EngineError> {
    for (i, task) in batch.tasks.iter().enumerate() {
        if !(1..=5).contains(&task.priority) {
            return Err(EngineError::AnalysisParse(format!(
                "task {} priority {} is outside 1..=5",
                i, task.priority
            )));
        }
        if let Some(dep) = task.dependencies.iter().find(|d| **d >= i) {
            return Err(EngineError::AnalysisParse(format!(
                "task {} depends on task {}, which does not come before it",
                i, dep
            )));
        }
    }
    Ok(())
}

/// Read the incoming analysis at the start of the executor stage
///
/// Accepts a decomposition-stage document, a bare batch, or an executor-stage
/// envelope (whose `original_analysis` is used).
pub fn read_analysis(content: &str) -> Result<TaskBatch, EngineError> {
    let json = extract_json_object(content)
        .ok_or_else(|| EngineError::AnalysisParse("no JSON object in analysis".to_string()))?;

    let mut value: Value = serde_json::from_str(json)
        .map_err(|e| EngineError::AnalysisParse(e.to_string()))?;

    if value.get("tasks").is_none() {
        if let Some(original) = value.get_mut("original_analysis").map(Value::take) {
            value = original;
        }
    }

    if value.get("status").and_then(Value::as_str) == Some("error") {
        let error = value
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("upstream stage failed");
        return Err(EngineError::AnalysisParse(error.to_string()));
    }

    let text = value.to_string();
    parse_batch(&text, KindPolicy::Lenient).map_err(|e| match e {
        EngineError::Decomposition(detail) => EngineError::AnalysisParse(detail),
        other => other,
    })
}

/// Request-to-schema coverage check
pub struct CoverageRule {
    all_data: Regex,
    table_name: Regex,
}

/// A task injected to cover part of the request the model skipped
#[derive(Debug, Clone, PartialEq)]
pub struct Injection {
    pub kind: ExecutorKind,
    pub entities: Vec<String>,
}

impl CoverageRule {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            all_data: Regex::new(
                r"(?i)\ball\s+(?:of\s+)?(?:the\s+)?(?:my\s+)?(?:data|tables|collections|records|databases)\b",
            )?,
            table_name: Regex::new(
                r#"(?i)CREATE\s+TABLE\s+(?:IF\s+NOT\s+EXISTS\s+)?[`"\[]?(\w+)"#,
            )?,
        })
    }

    /// Table names declared in the structured schema
    pub fn structured_entities(&self, schema: &SchemaContext) -> Vec<String> {
        self.table_name
            .captures_iter(&schema.structured)
            .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
            .filter(|name| !name.starts_with("sqlite_"))
            .collect()
    }

    pub fn requests_all_data(&self, utterance: &str) -> bool {
        self.all_data.is_match(utterance)
    }

    /// Work out which kinds are missing which entities
    pub fn missing(
        &self,
        batch: &TaskBatch,
        utterance: &str,
        schema: &SchemaContext,
    ) -> Vec<Injection> {
        let tables: Vec<EntityMatcher> = self
            .structured_entities(schema)
            .into_iter()
            .map(EntityMatcher::new)
            .collect();
        let collections: Vec<EntityMatcher> = schema
            .document
            .keys()
            .cloned()
            .map(EntityMatcher::new)
            .collect();
        let all_data = self.requests_all_data(utterance);

        let mut injections = Vec::new();
        for (kind, entities, others) in [
            (ExecutorKind::StructuredQuery, &tables, &collections),
            (ExecutorKind::DocumentQuery, &collections, &tables),
        ] {
            let kind_tasks: Vec<&Task> =
                batch.tasks.iter().filter(|t| t.agent == kind).collect();

            if all_data && !entities.is_empty() && kind_tasks.is_empty() {
                injections.push(Injection {
                    kind,
                    entities: entities.iter().map(|e| e.name.clone()).collect(),
                });
                continue;
            }

            let uncovered: Vec<String> = entities
                .iter()
                .filter(|e| e.found_in(utterance))
                .filter(|e| !kind_tasks.iter().any(|t| e.found_in_task(t)))
                // Names present in both stores count as covered by either kind
                .filter(|e| {
                    !(others.iter().any(|o| o.stem == e.stem)
                        && batch.tasks.iter().any(|t| e.found_in_task(t)))
                })
                .map(|e| e.name.clone())
                .collect();

            if !uncovered.is_empty() {
                injections.push(Injection {
                    kind,
                    entities: uncovered,
                });
            }
        }
        injections
    }

    /// Append a task for every gap found by `missing`
    pub fn enforce(
        &self,
        batch: &mut TaskBatch,
        utterance: &str,
        schema: &SchemaContext,
    ) -> Vec<Injection> {
        let injections = self.missing(batch, utterance, schema);
        for injection in &injections {
            let noun = match injection.kind {
                ExecutorKind::DocumentQuery => "documents",
                _ => "rows",
            };
            warn!(
                "Decomposition skipped {:?} for {}; injecting a task",
                injection.entities, injection.kind
            );
            batch.tasks.push(Task {
                agent: injection.kind.clone(),
                task_definition: format!(
                    "Retrieve all {} from {} relevant to: {}",
                    noun,
                    injection.entities.join(", "),
                    utterance
                ),
                purpose: "Cover data the request refers to".to_string(),
                priority: 3,
                dependencies: vec![],
            });
        }
        injections
    }
}

/// Lowercased, singular-ish form of an entity name
fn stem(name: &str) -> String {
    let lowered = name.to_lowercase().replace('_', " ");
    match lowered.strip_suffix('s') {
        Some(s) if s.len() >= 3 => s.to_string(),
        _ => lowered,
    }
}

/// Word-start matcher for one entity name, compiled once per coverage check
struct EntityMatcher {
    name: String,
    stem: String,
    pattern: Option<Regex>,
}

impl EntityMatcher {
    fn new(name: String) -> Self {
        let stem = stem(&name);
        // Stems shorter than three characters match too much
        let pattern = if stem.len() < 3 {
            None
        } else {
            Regex::new(&format!(r"\b{}", regex::escape(&stem))).ok()
        };
        Self {
            name,
            stem,
            pattern,
        }
    }

    fn found_in(&self, text: &str) -> bool {
        match &self.pattern {
            Some(re) => re.is_match(&text.to_lowercase().replace('_', " ")),
            None => false,
        }
    }

    fn found_in_task(&self, task: &Task) -> bool {
        self.found_in(&task.task_definition) || self.found_in(&task.purpose)
    }
}

/// Produces task batches from user requests
pub struct Decomposer {
    router: Arc<LLMRouter>,
    attempts: u32,
    coverage: Option<CoverageRule>,
}

impl Decomposer {
    pub fn new(router: Arc<LLMRouter>, attempts: u32, enforce_coverage: bool) -> anyhow::Result<Self> {
        let coverage = if enforce_coverage {
            Some(CoverageRule::new()?)
        } else {
            None
        };

        Ok(Self {
            router,
            attempts: attempts.max(1),
            coverage,
        })
    }

    fn system_prompt(&self, schema: &SchemaContext) -> String {
        format!(
            "You are a data analysis planner. Break the user's request into tasks against \
            two data stores.\n\n\
            Structured store (SQL) schema:\n{}\n\n\
            Document store collections and field types:\n{}\n\n\
            Rules:\n\
            1. Use agent \"structured_query\" for tables in the SQL schema and \"document_query\" \
            for collections in the document store.\n\
            2. If the request asks for all data or all tables, create tasks for BOTH stores.\n\
            3. priority is an integer 1-5; higher runs first. Give a task a higher priority than \
            the tasks that need its data.\n\
            4. dependencies lists the 0-based indices of EARLIER tasks in this list whose results \
            are needed first. Never reference a later task or the task itself.\n\n\
            Respond with ONLY a JSON object in this format:\n\
            {{\"tasks\": [{{\"agent\": \"structured_query\", \"taskDefinition\": \"a clear description \
            of the query needed\", \"purpose\": \"why it is needed\", \"priority\": 3, \
            \"dependencies\": []}}],\n\
            \"context\": {{\"required_data\": [\"data points needed\"], \"relationships\": \
            [\"how they relate\"], \"error_handling\": {{\"retry_count\": 3, \
            \"fallback_strategy\": \"what to do if a task fails\"}}}}}}",
            schema.structured,
            schema.render_document()
        )
    }

    /// Decompose a request into a validated batch
    ///
    /// Retries the model up to the configured number of attempts when its
    /// output does not validate; the last error is returned otherwise.
    pub async fn decompose(
        &self,
        utterance: &str,
        schema: &SchemaContext,
    ) -> Result<TaskBatch, EngineError> {
        let messages = vec![
            Message::system(self.system_prompt(schema)),
            Message::user(utterance),
        ];

        let mut last_error = EngineError::Decomposition("no attempts made".to_string());

        for attempt in 1..=self.attempts {
            debug!("Decomposition attempt {}/{}", attempt, self.attempts);

            let content = match self.router.call(&messages).await {
                Ok((content, provider)) => {
                    debug!("Decomposition produced by {}", provider);
                    content
                }
                Err(e) => {
                    warn!("Decomposition attempt {} failed: {}", attempt, e);
                    last_error = EngineError::from(e);
                    // The router already tried every provider
                    if !last_error.is_recoverable() {
                        break;
                    }
                    continue;
                }
            };

            match parse_batch(&content, KindPolicy::Strict) {
                Ok(mut batch) => {
                    if let Some(rule) = &self.coverage {
                        rule.enforce(&mut batch, utterance, schema);
                    }
                    info!(
                        "Decomposed request into {} tasks ({:?})",
                        batch.tasks.len(),
                        TaskAnalysis::from(&batch).analysis.task_types
                    );
                    return Ok(batch);
                }
                Err(e) => {
                    warn!(
                        "Decomposition attempt {} rejected: {} (output: {})",
                        attempt, e, content
                    );
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }
}
