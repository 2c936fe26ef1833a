//! Task executors
//!
//! An executor turns one task's natural-language definition into a concrete
//! query for its store, runs it and shapes the result. Every error stays
//! inside `run_task`, which converts it into a failure result.

use crate::conductor::types::{ExecutorKind, Payload, Task, TaskResult};
use async_trait::async_trait;
use sdk::errors::EngineError;
use std::future::Future;
use std::time::Duration;
use tracing::{error, info, warn};

pub mod document;
pub mod structured;

pub use document::DocumentExecutor;
pub use structured::{classify, QueryClass, StructuredExecutor};

/// Capability interface every executor implements
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Kind of task this executor accepts
    fn kind(&self) -> ExecutorKind;

    /// Translate, execute and normalize a single task
    async fn execute(&self, task: &Task) -> Result<Payload, EngineError>;
}

/// Run a task with up to `retries` extra attempts on query failures
///
/// Never returns an error: every failure becomes a `TaskResult` carrying the
/// error text.
pub async fn run_task(executor: &dyn TaskExecutor, task: Task, retries: u32) -> TaskResult {
    let mut attempt = 0;
    loop {
        match executor.execute(&task).await {
            Ok(payload) => {
                info!(kind = %executor.kind(), attempt, "task succeeded");
                return TaskResult::success(task, payload);
            }
            Err(e) => {
                let retryable = matches!(
                    e,
                    EngineError::QueryGeneration(_) | EngineError::QueryExecution(_)
                );
                if retryable && attempt < retries {
                    attempt += 1;
                    warn!(
                        kind = %executor.kind(),
                        attempt,
                        error = %e,
                        "task failed, retrying"
                    );
                    continue;
                }

                error!(
                    kind = %executor.kind(),
                    task = %task.task_definition,
                    error = %e,
                    "task failed"
                );
                return TaskResult::failure(task, e.to_string());
            }
        }
    }
}

/// Bound a store operation by the configured deadline
pub(crate) async fn with_deadline<T, Fut>(deadline: Duration, fut: Fut) -> Result<T, EngineError>
where
    Fut: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(EngineError::QueryExecution(format!("{:#}", e))),
        Err(_) => Err(EngineError::StoreTimeout(deadline.as_secs())),
    }
}
