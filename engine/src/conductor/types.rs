//! Conductor data model
//!
//! Types shared by every stage of the pipeline, plus their JSON wire forms:
//! the decomposition-stage analysis document, per-task results and the
//! aggregated execution report.

use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// One row or document, field name to value
pub type Record = Map<String, Value>;

/// Executor kind a task is tagged with
///
/// Tags outside the closed set are kept as `Unregistered` so the router can
/// turn them into per-task failures instead of rejecting the whole batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ExecutorKind {
    StructuredQuery,
    DocumentQuery,
    Reserved,
    Unregistered(String),
}

impl ExecutorKind {
    /// Canonical wire tag
    pub fn as_str(&self) -> &str {
        match self {
            ExecutorKind::StructuredQuery => "structured_query",
            ExecutorKind::DocumentQuery => "document_query",
            ExecutorKind::Reserved => "reserved_unimplemented",
            ExecutorKind::Unregistered(tag) => tag,
        }
    }

    /// Key under which this kind's results appear in an executor-stage envelope
    pub fn results_key(&self) -> String {
        format!("{}_results", self.as_str())
    }

    /// True for the kinds that belong to the closed enumeration
    pub fn is_known(&self) -> bool {
        !matches!(self, ExecutorKind::Unregistered(_))
    }
}

impl From<String> for ExecutorKind {
    fn from(tag: String) -> Self {
        match tag.trim() {
            "structured_query" | "sql_agent" => ExecutorKind::StructuredQuery,
            "document_query" | "nosql_agent" => ExecutorKind::DocumentQuery,
            "reserved_unimplemented" | "drive_agent" => ExecutorKind::Reserved,
            _ => ExecutorKind::Unregistered(tag),
        }
    }
}

impl From<&str> for ExecutorKind {
    fn from(tag: &str) -> Self {
        ExecutorKind::from(tag.to_string())
    }
}

impl From<ExecutorKind> for String {
    fn from(kind: ExecutorKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One decomposed unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub agent: ExecutorKind,

    #[serde(rename = "taskDefinition")]
    pub task_definition: String,

    #[serde(default)]
    pub purpose: String,

    /// 1..=5, higher runs first
    pub priority: u8,

    /// Indices of earlier tasks in the same batch
    #[serde(default)]
    pub dependencies: Vec<usize>,
}

/// Retry policy the language model attached to a batch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorHandling {
    #[serde(default)]
    pub retry_count: u32,

    #[serde(default)]
    pub fallback_strategy: String,
}

/// Batch-level context accompanying the tasks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchContext {
    #[serde(default = "empty_list")]
    pub required_data: Value,

    #[serde(default = "empty_list")]
    pub relationships: Value,

    #[serde(default)]
    pub error_handling: ErrorHandling,
}

fn empty_list() -> Value {
    Value::Array(Vec::new())
}

impl Default for BatchContext {
    fn default() -> Self {
        Self {
            required_data: empty_list(),
            relationships: empty_list(),
            error_handling: ErrorHandling::default(),
        }
    }
}

/// Full decomposition output for one user turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskBatch {
    pub tasks: Vec<Task>,

    #[serde(default)]
    pub context: BatchContext,
}

impl TaskBatch {
    /// Index of the first task with the highest priority
    pub fn highest_priority_index(&self) -> Option<usize> {
        self.tasks
            .iter()
            .enumerate()
            .max_by(|(ia, a), (ib, b)| a.priority.cmp(&b.priority).then(ib.cmp(ia)))
            .map(|(i, _)| i)
    }

    /// Distinct executor kinds in first-seen order
    pub fn kinds(&self) -> Vec<ExecutorKind> {
        let mut kinds: Vec<ExecutorKind> = Vec::new();
        for task in &self.tasks {
            if !kinds.contains(&task.agent) {
                kinds.push(task.agent.clone());
            }
        }
        kinds
    }
}

/// Summary block of the decomposition-stage document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSummary {
    pub total_tasks: usize,
    pub task_types: Vec<String>,
    pub highest_priority_task: Option<Task>,
}

/// Decomposition-stage JSON document, appended as an assistant message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAnalysis {
    pub tasks: Vec<Task>,
    pub context: BatchContext,
    pub current_task_index: usize,
    pub error_handling: ErrorHandling,
    pub analysis: AnalysisSummary,
}

impl From<&TaskBatch> for TaskAnalysis {
    fn from(batch: &TaskBatch) -> Self {
        let highest = batch
            .highest_priority_index()
            .and_then(|i| batch.tasks.get(i))
            .cloned();

        Self {
            tasks: batch.tasks.clone(),
            context: batch.context.clone(),
            current_task_index: 0,
            error_handling: batch.context.error_handling.clone(),
            analysis: AnalysisSummary {
                total_tasks: batch.tasks.len(),
                task_types: batch.kinds().iter().map(|k| k.to_string()).collect(),
                highest_priority_task: highest,
            },
        }
    }
}

/// Success payload, shaped by the executor that produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    /// Read query against the structured store
    Rows { query: String, rows: Vec<Record> },

    /// Mutating statement against the structured store
    Mutation { query: String, affected_rows: u64 },

    /// Find or aggregate against the document store
    Documents {
        query: String,
        collection: String,
        documents: Vec<Record>,
    },

    /// Insert, update or delete against the document store
    DocumentMutation {
        query: String,
        collection: String,
        operation: String,
        affected_count: u64,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        inserted_ids: Vec<String>,
    },

    /// Database-management action
    Info { query: String, data: Value },
}

/// Two-variant outcome of a single task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Outcome {
    #[serde(rename = "result")]
    Success(Payload),

    #[serde(rename = "error")]
    Failure(String),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }
}

/// A task paired with what happened when it ran
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task: Task,

    #[serde(flatten)]
    pub outcome: Outcome,
}

impl TaskResult {
    pub fn success(task: Task, payload: Payload) -> Self {
        Self {
            task,
            outcome: Outcome::Success(payload),
        }
    }

    pub fn failure(task: Task, message: impl Into<String>) -> Self {
        Self {
            task,
            outcome: Outcome::Failure(message.into()),
        }
    }
}

/// Batch-level status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    Success,
    Error,
}

/// Position of an entry in the report, written into envelope entries
const SEQUENCE_FIELD: &str = "sequence";

/// Aggregated outcome of a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub status: ReportStatus,
    pub results: Vec<TaskResult>,
    pub original_analysis: TaskBatch,
}

impl ExecutionReport {
    /// Executor-stage envelope:
    /// `{status, <kind>_results..., original_analysis}` with one results key
    /// per kind in the batch. Every entry carries its `sequence` so the
    /// report order survives the grouping by kind.
    pub fn envelope(&self) -> Value {
        let mut envelope = Map::new();
        envelope.insert(
            "status".to_string(),
            serde_json::to_value(self.status).unwrap_or(Value::Null),
        );

        for kind in self.original_analysis.kinds() {
            let entries: Vec<Value> = self
                .results
                .iter()
                .enumerate()
                .filter(|(_, r)| r.task.agent == kind)
                .filter_map(|(sequence, r)| {
                    let mut entry = serde_json::to_value(r).ok()?;
                    if let Value::Object(fields) = &mut entry {
                        fields.insert(SEQUENCE_FIELD.to_string(), Value::from(sequence));
                    }
                    Some(entry)
                })
                .collect();
            envelope.insert(kind.results_key(), Value::Array(entries));
        }

        envelope.insert(
            "original_analysis".to_string(),
            serde_json::to_value(TaskAnalysis::from(&self.original_analysis))
                .unwrap_or(Value::Null),
        );
        Value::Object(envelope)
    }

    /// Rebuild a report from its executor-stage envelope
    ///
    /// Entries from every `<kind>_results` list are merged back into
    /// sequence order.
    pub fn from_envelope(envelope: &Value) -> Result<Self, EngineError> {
        let fields = envelope
            .as_object()
            .ok_or_else(|| EngineError::AnalysisParse("envelope is not an object".to_string()))?;

        let status: ReportStatus = fields
            .get("status")
            .cloned()
            .ok_or_else(|| EngineError::AnalysisParse("envelope has no status".to_string()))
            .and_then(|v| {
                serde_json::from_value(v)
                    .map_err(|e| EngineError::AnalysisParse(format!("invalid status: {}", e)))
            })?;

        let analysis: TaskAnalysis = fields
            .get("original_analysis")
            .cloned()
            .ok_or_else(|| {
                EngineError::AnalysisParse("envelope has no original_analysis".to_string())
            })
            .and_then(|v| {
                serde_json::from_value(v).map_err(|e| {
                    EngineError::AnalysisParse(format!("invalid original_analysis: {}", e))
                })
            })?;

        let mut sequenced: Vec<(usize, TaskResult)> = Vec::new();
        for (key, value) in fields {
            if !key.ends_with("_results") {
                continue;
            }
            let entries = value
                .as_array()
                .ok_or_else(|| EngineError::AnalysisParse(format!("{} is not a list", key)))?;

            for entry in entries {
                let mut entry = entry.clone();
                let sequence = entry
                    .as_object_mut()
                    .and_then(|f| f.remove(SEQUENCE_FIELD))
                    .and_then(|v| v.as_u64())
                    .ok_or_else(|| {
                        EngineError::AnalysisParse(format!("entry in {} has no sequence", key))
                    })? as usize;
                let result: TaskResult = serde_json::from_value(entry).map_err(|e| {
                    EngineError::AnalysisParse(format!("invalid entry in {}: {}", key, e))
                })?;
                sequenced.push((sequence, result));
            }
        }

        sequenced.sort_by_key(|(sequence, _)| *sequence);
        if let Some(pair) = sequenced.windows(2).find(|w| w[0].0 == w[1].0) {
            return Err(EngineError::AnalysisParse(format!(
                "duplicate sequence {} in envelope",
                pair[0].0
            )));
        }

        Ok(Self {
            status,
            results: sequenced.into_iter().map(|(_, r)| r).collect(),
            original_analysis: TaskBatch {
                tasks: analysis.tasks,
                context: analysis.context,
            },
        })
    }

    pub fn failure_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| !r.outcome.is_success())
            .count()
    }
}

/// Fatal (batch-level) error document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FatalResponse {
    pub status: ReportStatus,
    pub error: String,
    pub retry_count: u32,
}

impl FatalResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            status: ReportStatus::Error,
            error: error.into(),
            retry_count: 0,
        }
    }
}

/// What a pipeline run hands back to the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PipelineResponse {
    Report(ExecutionReport),
    Fatal(FatalResponse),
}

impl PipelineResponse {
    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineResponse::Fatal(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task(agent: &str, priority: u8) -> Task {
        Task {
            agent: ExecutorKind::from(agent),
            task_definition: format!("{} task", agent),
            purpose: String::new(),
            priority,
            dependencies: vec![],
        }
    }

    #[test]
    fn test_kind_aliases() {
        assert_eq!(ExecutorKind::from("sql_agent"), ExecutorKind::StructuredQuery);
        assert_eq!(ExecutorKind::from("nosql_agent"), ExecutorKind::DocumentQuery);
        assert_eq!(ExecutorKind::from("drive_agent"), ExecutorKind::Reserved);
        assert_eq!(
            ExecutorKind::from("unknown_kind"),
            ExecutorKind::Unregistered("unknown_kind".to_string())
        );
    }

    #[test]
    fn test_kind_serializes_canonical_tag() {
        let t = task("sql_agent", 3);
        let v = serde_json::to_value(&t).unwrap();
        assert_eq!(v["agent"], "structured_query");
        assert_eq!(v["taskDefinition"], "sql_agent task");

        let unknown = task("unknown_kind", 1);
        let v = serde_json::to_value(&unknown).unwrap();
        assert_eq!(v["agent"], "unknown_kind");
    }

    #[test]
    fn test_task_result_wire_shape() {
        let ok = TaskResult::success(
            task("structured_query", 2),
            Payload::Mutation {
                query: "DELETE FROM t".to_string(),
                affected_rows: 4,
            },
        );
        let v = serde_json::to_value(&ok).unwrap();
        assert_eq!(v["result"]["kind"], "mutation");
        assert_eq!(v["result"]["affected_rows"], 4);
        assert!(v.get("error").is_none());

        let failed = TaskResult::failure(task("document_query", 2), "boom");
        let v = serde_json::to_value(&failed).unwrap();
        assert_eq!(v["error"], "boom");
        assert!(v.get("result").is_none());

        let back: TaskResult = serde_json::from_value(v).unwrap();
        assert_eq!(back, failed);
    }

    #[test]
    fn test_analysis_summary() {
        let batch = TaskBatch {
            tasks: vec![
                task("structured_query", 2),
                task("document_query", 5),
                task("structured_query", 5),
            ],
            context: BatchContext::default(),
        };
        let analysis = TaskAnalysis::from(&batch);
        assert_eq!(analysis.analysis.total_tasks, 3);
        assert_eq!(
            analysis.analysis.task_types,
            vec!["structured_query", "document_query"]
        );
        assert_eq!(
            analysis.analysis.highest_priority_task.unwrap().agent,
            ExecutorKind::DocumentQuery
        );
        assert_eq!(analysis.current_task_index, 0);
    }

    #[test]
    fn test_envelope_groups_by_kind() {
        let report = ExecutionReport {
            status: ReportStatus::Success,
            results: vec![
                TaskResult::failure(task("structured_query", 1), "x"),
                TaskResult::failure(task("document_query", 1), "y"),
            ],
            original_analysis: TaskBatch {
                tasks: vec![task("structured_query", 1), task("document_query", 1)],
                context: BatchContext::default(),
            },
        };
        let env = report.envelope();
        assert_eq!(env["status"], "success");
        assert_eq!(env["structured_query_results"][0]["error"], "x");
        assert_eq!(env["document_query_results"].as_array().unwrap().len(), 1);
        assert_eq!(env["document_query_results"][0]["error"], "y");
        assert_eq!(env["original_analysis"]["analysis"]["total_tasks"], 2);
        assert_eq!(env["structured_query_results"][0]["sequence"], 0);
        assert_eq!(env["document_query_results"][0]["sequence"], 1);
    }

    #[test]
    fn test_envelope_decodes_in_report_order() {
        let mut d0 = task("document_query", 5);
        d0.task_definition = "d0".to_string();
        let mut s1 = task("structured_query", 4);
        s1.task_definition = "s1".to_string();
        let mut d2 = task("document_query", 3);
        d2.task_definition = "d2".to_string();

        let report = ExecutionReport {
            status: ReportStatus::Success,
            results: vec![
                TaskResult::success(
                    d0.clone(),
                    Payload::Info {
                        query: "{}".to_string(),
                        data: json!({"count": 0}),
                    },
                ),
                TaskResult::failure(s1.clone(), "no such table: invoices"),
                TaskResult::success(
                    d2.clone(),
                    Payload::DocumentMutation {
                        query: "{}".to_string(),
                        collection: "users".to_string(),
                        operation: "delete".to_string(),
                        affected_count: 2,
                        inserted_ids: vec![],
                    },
                ),
            ],
            original_analysis: TaskBatch {
                tasks: vec![d0, s1, d2],
                context: BatchContext::default(),
            },
        };

        let decoded = ExecutionReport::from_envelope(&report.envelope()).unwrap();
        let order: Vec<&str> = decoded
            .results
            .iter()
            .map(|r| r.task.task_definition.as_str())
            .collect();
        assert_eq!(order, vec!["d0", "s1", "d2"]);
        assert_eq!(decoded, report);
    }

    #[test]
    fn test_envelope_without_sequence_is_rejected() {
        let envelope = json!({
            "status": "success",
            "structured_query_results": [{"task": task("structured_query", 1), "error": "x"}],
            "original_analysis": TaskAnalysis::from(&TaskBatch {
                tasks: vec![task("structured_query", 1)],
                context: BatchContext::default(),
            }),
        });
        match ExecutionReport::from_envelope(&envelope) {
            Err(EngineError::AnalysisParse(msg)) => assert!(msg.contains("sequence")),
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_fatal_shape() {
        let fatal = FatalResponse::new("Failed to analyze query: bad");
        assert_eq!(
            serde_json::to_value(&fatal).unwrap(),
            json!({"status": "error", "error": "Failed to analyze query: bad", "retry_count": 0})
        );
    }
}
