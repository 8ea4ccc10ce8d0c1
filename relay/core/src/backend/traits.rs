//! Analyzer Traits
//!
//! Trait definitions for the analysis collaborator. The task processor only
//! ever talks to `dyn Analyzer`, so the engine behind it (a local Ollama
//! model, a remote API, a test double) can change without touching the
//! worker loop.
//!
//! # Design Philosophy
//!
//! The Analyzer trait provides a common interface for:
//! - Analyzing a piece of text into a structured JSON result
//! - Health checking the engine
//!
//! Unavailability is a typed failure, never a panic. Each processor worker
//! builds its own analyzer through an [`AnalyzerFactory`] so that one slow
//! call never blocks the other workers behind a shared client.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;

/// Errors reported by an analyzer
#[derive(Debug, Error)]
pub enum AnalyzerError {
    /// Engine not reachable or has no usable model
    #[error("analysis service unavailable: {0}")]
    Unavailable(String),

    /// Engine did not answer in time
    #[error("analysis timed out after {0:?}")]
    Timeout(Duration),

    /// Engine answered with a non-success HTTP status
    #[error("analysis service returned {status}: {body}")]
    Http {
        /// HTTP status code
        status: u16,
        /// Response body, possibly truncated
        body: String,
    },

    /// Engine answered with something that is not a usable result
    #[error("malformed analysis response: {0}")]
    Malformed(String),

    /// Input rejected before reaching the engine
    #[error("invalid analysis input: {0}")]
    InvalidInput(String),
}

/// Analysis collaborator
///
/// Implementations must be safe to call from several workers at once, or be
/// instantiated per worker through an [`AnalyzerFactory`].
#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Engine name (e.g., "Ollama")
    fn name(&self) -> &str;

    /// Check if the engine is healthy and reachable
    async fn health_check(&self) -> bool;

    /// Analyze `text` into a structured result
    async fn analyze(&self, text: &str) -> Result<Value, AnalyzerError>;
}

/// Builds one analyzer per processor worker
pub trait AnalyzerFactory: Send + Sync {
    /// Create a fresh analyzer
    fn create(&self) -> Arc<dyn Analyzer>;
}

impl<F> AnalyzerFactory for F
where
    F: Fn() -> Arc<dyn Analyzer> + Send + Sync,
{
    fn create(&self) -> Arc<dyn Analyzer> {
        self()
    }
}

/// Generic feedback used when the engine could not produce any
#[must_use]
pub fn fallback_analysis() -> Value {
    json!({
        "clarity_score": 3,
        "testability": "Requires manual review",
        "suggestions": ["Ensure measurable metrics", "Define success criteria"],
    })
}
