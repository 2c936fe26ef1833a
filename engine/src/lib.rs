//! Polyquery Engine Library
//!
//! Natural-language task orchestration over a structured and a document
//! store. Used by both the main binary and integration tests.

/// Configuration management module
pub mod config;

/// LLM provider abstraction layer
pub mod llm;

/// Structured and document store access
pub mod store;

/// Conductor orchestration module
pub mod conductor;

/// Telemetry and Observability
pub mod telemetry;

/// CLI interface module
pub mod cli;

/// Command handlers module
pub mod handlers;
