//! Polyquery SDK
//!
//! Shared library providing the error taxonomy used by the engine and its
//! store and provider integrations.

/// Error types and handling
pub mod errors;

// Re-export commonly used types
pub use errors::{EngineError, EngineErrorExt};
