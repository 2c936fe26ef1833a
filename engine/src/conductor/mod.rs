//! Conductor System
//!
//! Orchestrates a request end to end: decomposition into a task batch,
//! priority scheduling, routing to the store executors and aggregation into
//! a single report.

pub mod aggregator;
pub mod decomposer;
pub mod executor;
pub mod router;
pub mod scheduler;
pub mod types;

pub use decomposer::{read_analysis, Decomposer, SchemaContext};
pub use router::TaskRouter;
pub use scheduler::Schedule;
pub use types::{
    ExecutionReport, ExecutorKind, FatalResponse, PipelineResponse, Task, TaskAnalysis, TaskBatch,
    TaskResult,
};

use crate::config::Config;
use crate::llm::router::LLMRouter;
use crate::llm::{Message, MessageRole};
use crate::store::{ConfiguredStores, StoreConnector};
use executor::{DocumentExecutor, StructuredExecutor};
use sdk::errors::EngineError;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Instrument};

/// Entry point of the pipeline
pub struct Conductor {
    config: Arc<Config>,
    llm: Arc<LLMRouter>,
    stores: Arc<dyn StoreConnector>,
    decomposer: Decomposer,
}

impl Conductor {
    pub fn new(
        config: Arc<Config>,
        llm: Arc<LLMRouter>,
        stores: Arc<dyn StoreConnector>,
    ) -> anyhow::Result<Self> {
        let decomposer = Decomposer::new(
            Arc::clone(&llm),
            config.orchestration.decompose_attempts,
            config.orchestration.enforce_coverage,
        )?;

        Ok(Self {
            config,
            llm,
            stores,
            decomposer,
        })
    }

    /// Conductor wired to the configured providers and stores
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let llm = Arc::new(LLMRouter::from_config(Arc::new(config.llm.clone())));
        let stores = Arc::new(ConfiguredStores::new(
            config.stores.clone(),
            Duration::from_secs(config.orchestration.store_timeout_secs),
        ));
        Self::new(config, llm, stores)
    }

    fn store_deadline(&self) -> Duration {
        Duration::from_secs(self.config.orchestration.store_timeout_secs)
    }

    /// Describe both stores for the decomposer
    ///
    /// A store that cannot be reached or described contributes its
    /// placeholder instead of failing the request.
    pub async fn schema_context(&self) -> SchemaContext {
        let mut context = SchemaContext::placeholder();
        let deadline = self.store_deadline();

        match self.stores.structured().await {
            Ok(store) => match tokio::time::timeout(deadline, store.schema()).await {
                Ok(Ok(ddl)) if !ddl.trim().is_empty() => context.structured = ddl,
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!("{}", EngineError::SchemaRetrieval(format!("{:#}", e))),
                Err(_) => warn!("{}", EngineError::StoreTimeout(deadline.as_secs())),
            },
            Err(e) => warn!("{}", EngineError::SchemaRetrieval(format!("{:#}", e))),
        }

        match self.stores.document().await {
            Ok(store) => match store.open_session().await {
                Ok(session) => {
                    match tokio::time::timeout(deadline, session.schema()).await {
                        Ok(Ok(schema)) => context.document = schema,
                        Ok(Err(e)) => {
                            warn!("{}", EngineError::SchemaRetrieval(format!("{:#}", e)))
                        }
                        Err(_) => warn!("{}", EngineError::StoreTimeout(deadline.as_secs())),
                    }
                    session.close().await;
                }
                Err(e) => warn!("{}", EngineError::SchemaRetrieval(format!("{:#}", e))),
            },
            Err(e) => warn!("{}", EngineError::SchemaRetrieval(format!("{:#}", e))),
        }

        context
    }

    /// Decompose a request into a validated batch
    pub async fn decompose(&self, utterance: &str) -> Result<TaskBatch, EngineError> {
        let schema = self.schema_context().await;
        self.decomposer.decompose(utterance, &schema).await
    }

    /// Router with executors for the kinds present in the batch
    async fn router_for(&self, batch: &TaskBatch) -> Result<TaskRouter, EngineError> {
        let mut router = TaskRouter::new();
        let deadline = self.store_deadline();

        for kind in batch.kinds() {
            match kind {
                ExecutorKind::StructuredQuery => {
                    let store = self
                        .stores
                        .structured()
                        .await
                        .map_err(|e| EngineError::StoreUnavailable(format!("{:#}", e)))?;
                    router.register(Arc::new(StructuredExecutor::new(
                        Arc::clone(&self.llm),
                        store,
                        deadline,
                    )));
                }
                ExecutorKind::DocumentQuery => {
                    let store = self
                        .stores
                        .document()
                        .await
                        .map_err(|e| EngineError::StoreUnavailable(format!("{:#}", e)))?;
                    router.register(Arc::new(DocumentExecutor::new(
                        Arc::clone(&self.llm),
                        store,
                        deadline,
                    )));
                }
                ExecutorKind::Reserved | ExecutorKind::Unregistered(_) => {}
            }
        }

        Ok(router)
    }

    /// Execute a batch and aggregate its results
    ///
    /// Task failures are carried inside the report. Only a malformed batch or
    /// a store that cannot be reached at all produces a fatal response.
    pub async fn execute(&self, batch: TaskBatch) -> PipelineResponse {
        if let Err(e) = decomposer::validate_batch(&batch) {
            return PipelineResponse::Fatal(aggregator::fatal(&e));
        }

        let router = match self.router_for(&batch).await {
            Ok(router) => router,
            Err(e) => return PipelineResponse::Fatal(aggregator::fatal(&e)),
        };

        let retries = batch
            .context
            .error_handling
            .retry_count
            .min(self.config.orchestration.max_task_retries);
        let schedule = Schedule::new(&batch.tasks);
        info!(tasks = schedule.len(), retries, "executing batch");

        let results = schedule
            .drive(
                self.config.orchestration.max_concurrency_per_kind,
                |scheduled| {
                    let router = router.clone();
                    let span = tracing::info_span!(
                        "task",
                        sequence = scheduled.sequence,
                        kind = %scheduled.task.agent
                    );
                    async move { router.dispatch(scheduled.task, retries).await }.instrument(span)
                },
            )
            .await;

        PipelineResponse::Report(aggregator::aggregate(batch, results))
    }

    /// Decompose and execute one request
    pub async fn run(&self, utterance: &str) -> PipelineResponse {
        let span = tracing::info_span!("request", id = %uuid::Uuid::new_v4());
        async {
            match self.decompose(utterance).await {
                Ok(batch) => self.execute(batch).await,
                Err(e) => PipelineResponse::Fatal(aggregator::fatal(&e)),
            }
        }
        .instrument(span)
        .await
    }

    /// Decomposition stage of a conversation turn
    ///
    /// Reads the latest user message and appends the analysis document (or
    /// the fatal response) as an assistant message. Returns whether the turn
    /// may proceed to execution.
    pub async fn decompose_turn(&self, messages: &mut Vec<Message>) -> bool {
        let utterance = messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();

        let (content, ok) = match self.decompose(&utterance).await {
            Ok(batch) => (
                serde_json::to_string_pretty(&TaskAnalysis::from(&batch)),
                true,
            ),
            Err(e) => (serde_json::to_string(&aggregator::fatal(&e)), false),
        };

        match content {
            Ok(content) => {
                messages.push(Message::assistant(content));
                ok
            }
            Err(e) => {
                warn!("Failed to serialize decomposition output: {}", e);
                false
            }
        }
    }

    /// Execution stage of a conversation turn
    ///
    /// Reads the analysis from the latest assistant message, executes it and
    /// appends the per-kind results envelope.
    pub async fn execute_turn(&self, messages: &mut Vec<Message>) -> PipelineResponse {
        let content = messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::Assistant)
            .map(|m| m.content.as_str())
            .unwrap_or_default();

        let response = match read_analysis(content) {
            Ok(batch) => self.execute(batch).await,
            Err(e) => PipelineResponse::Fatal(aggregator::fatal(&e)),
        };

        let rendered = match &response {
            PipelineResponse::Report(report) => serde_json::to_string(&report.envelope()),
            PipelineResponse::Fatal(fatal) => serde_json::to_string(fatal),
        };
        match rendered {
            Ok(rendered) => messages.push(Message::assistant(rendered)),
            Err(e) => warn!("Failed to serialize execution output: {}", e),
        }

        response
    }

    /// Run both stages over a fresh conversation and return it
    pub async fn handle(&self, utterance: &str) -> Vec<Message> {
        let span = tracing::info_span!("request", id = %uuid::Uuid::new_v4());
        async {
            let mut messages = vec![Message::user(utterance)];
            if self.decompose_turn(&mut messages).await {
                self.execute_turn(&mut messages).await;
            }
            messages
        }
        .instrument(span)
        .await
    }
}
