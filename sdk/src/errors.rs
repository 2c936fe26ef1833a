//! Error types and handling
//!
//! This module provides the error types used throughout the Polyquery engine.
//! All errors implement the `EngineErrorExt` trait which provides user-friendly
//! hints and indicates whether errors are recoverable.
//!
//! # Scope
//!
//! Errors fall into two scopes:
//! - **Batch-scoped**: the request cannot proceed at all (`Decomposition`,
//!   `AnalysisParse`, `StoreUnavailable`, `Config`). These surface as the fatal
//!   error document.
//! - **Task-scoped**: one task failed (`Dispatch`, `QueryGeneration`,
//!   `QueryExecution`, `StoreTimeout`). These are converted to failure outcomes
//!   at the executor boundary and never abort sibling tasks.
//!
//! # Security
//!
//! Hints returned by `user_hint()` are static strings. They never echo query
//! text, connection strings or API keys.

use thiserror::Error;

/// Trait for engine error extensions
///
/// This trait provides additional context for errors, including user-friendly
/// hints and recoverability information. All engine errors implement this trait.
pub trait EngineErrorExt {
    /// Returns a user-friendly hint for the error
    fn user_hint(&self) -> &str;

    /// Returns whether the error is recoverable
    ///
    /// Recoverable errors can be retried or worked around. Non-recoverable
    /// errors typically require configuration changes or operator action.
    fn is_recoverable(&self) -> bool;

    /// Returns true when the error is confined to a single task
    fn is_task_scoped(&self) -> bool;
}

/// Main engine error type
///
/// # Error Categories
///
/// - **Configuration**: Invalid or missing configuration
/// - **Decomposition**: Language model output that is not a valid task batch
/// - **Dispatch**: No executor registered for a task's kind
/// - **Query**: Query generation or execution failures inside one task
/// - **Store**: Schema retrieval, connectivity and timeouts
/// - **LLM Provider**: API failures, authentication errors
///
/// # Examples
///
/// ```
/// use sdk::errors::{EngineError, EngineErrorExt};
///
/// let error = EngineError::Dispatch("unknown_kind".to_string());
/// assert!(error.is_task_scoped());
/// assert!(!error.user_hint().is_empty());
///
/// let fatal_error = EngineError::Decomposition("expected value at line 1".to_string());
/// assert!(!fatal_error.is_task_scoped());
/// ```
#[derive(Debug, Error)]
pub enum EngineError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Batch-level errors
    #[error("Failed to analyze query: {0}")]
    Decomposition(String),

    #[error("Failed to parse task analysis: {0}")]
    AnalysisParse(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    // Task-level errors
    #[error("no executor available")]
    Dispatch(String),

    #[error("Query generation failed: {0}")]
    QueryGeneration(String),

    #[error("{0}")]
    QueryExecution(String),

    #[error("Store operation timed out after {0}s")]
    StoreTimeout(u64),

    // Degraded context
    #[error("Schema retrieval failed: {0}")]
    SchemaRetrieval(String),

    // LLM provider errors
    #[error("LLM provider error: {0}")]
    LLMProvider(String),

    #[error("All LLM providers exhausted")]
    AllProvidersExhausted,
}

impl EngineErrorExt for EngineError {
    fn user_hint(&self) -> &str {
        match self {
            // Configuration errors
            Self::Config(_) => "Check your config.toml file for errors",

            // Batch-level errors
            Self::Decomposition(_) => "The request could not be broken into tasks. Try rephrasing it",
            Self::AnalysisParse(_) => "The task analysis document is malformed",
            Self::StoreUnavailable(_) => "A data store is unreachable. Check that it is running",

            // Task-level errors
            Self::Dispatch(_) => "No executor handles this kind of task",
            Self::QueryGeneration(_) => "Could not translate the task into a query",
            Self::QueryExecution(_) => "The generated query failed against the store",
            Self::StoreTimeout(_) => "The data store took too long to respond. Try again",

            // Degraded context
            Self::SchemaRetrieval(_) => "Schema unavailable. Results may be less accurate",

            // LLM provider errors
            Self::LLMProvider(_) => "LLM provider unavailable. Check your API keys and network",
            Self::AllProvidersExhausted => "No LLM providers available. Check configuration",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            // Non-recoverable errors
            Self::Config(_)
            | Self::AnalysisParse(_)
            | Self::Dispatch(_)
            | Self::AllProvidersExhausted => false,

            // All other errors are potentially recoverable
            _ => true,
        }
    }

    fn is_task_scoped(&self) -> bool {
        matches!(
            self,
            Self::Dispatch(_)
                | Self::QueryGeneration(_)
                | Self::QueryExecution(_)
                | Self::StoreTimeout(_)
        )
    }
}
