//! Task Router
//!
//! Closed dispatch table from executor kind to executor. Kinds without a
//! registered executor (the reserved kind, unrecognized tags, or a store kind
//! not needed by this batch) yield a failure result immediately.

use crate::conductor::executor::{run_task, TaskExecutor};
use crate::conductor::types::{ExecutorKind, Task, TaskResult};
use sdk::errors::EngineError;
use std::sync::Arc;
use tracing::warn;

#[derive(Default, Clone)]
pub struct TaskRouter {
    structured: Option<Arc<dyn TaskExecutor>>,
    document: Option<Arc<dyn TaskExecutor>>,
}

impl TaskRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor under the kind it reports
    pub fn register(&mut self, executor: Arc<dyn TaskExecutor>) {
        match executor.kind() {
            ExecutorKind::StructuredQuery => self.structured = Some(executor),
            ExecutorKind::DocumentQuery => self.document = Some(executor),
            other => warn!("Ignoring executor registered for unsupported kind {}", other),
        }
    }

    /// Executor for a kind, if one is registered
    pub fn route(&self, kind: &ExecutorKind) -> Option<&Arc<dyn TaskExecutor>> {
        match kind {
            ExecutorKind::StructuredQuery => self.structured.as_ref(),
            ExecutorKind::DocumentQuery => self.document.as_ref(),
            ExecutorKind::Reserved | ExecutorKind::Unregistered(_) => None,
        }
    }

    /// Run a task on its executor, or record a dispatch failure
    pub async fn dispatch(&self, task: Task, retries: u32) -> TaskResult {
        match self.route(&task.agent) {
            Some(executor) => run_task(executor.as_ref(), task, retries).await,
            None => {
                let err = EngineError::Dispatch(task.agent.to_string());
                warn!(kind = %task.agent, "{}", err);
                TaskResult::failure(task, err.to_string())
            }
        }
    }
}
