//! Task Types
//!
//! Data structures for analysis work flowing through the background
//! processor. The processor owns task state; producers only see ids and
//! status snapshots.
//!
//! # Lifecycle
//!
//! ```text
//!   Queued ──► Processing ──► Completed
//!     ▲            │
//!     └── retry ───┤
//!                  └────────► Failed
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::scheduling::Priority;
use crate::session::SessionId;

/// Task identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(String);

impl TaskId {
    /// Create a task ID from a string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new unique task ID
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get the string value
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a task
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting for a worker (first attempt or retry)
    Queued,
    /// A worker is running it
    Processing,
    /// Result handed to the outbound queue
    Completed,
    /// Retries exhausted
    Failed,
}

impl TaskStatus {
    /// Human-readable label
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether the task will never change state again
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// What a task does
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Run the analysis collaborator over a piece of text
    Analysis,
}

/// Work submitted by a producer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    /// Producer-side request id, echoed in result and error events
    pub request_id: String,
    /// Session the result should be delivered to
    pub session_id: Option<SessionId>,
    /// Text to analyze
    pub text: String,
    /// Free-form context echoed back with the result
    #[serde(default)]
    pub context: BTreeMap<String, String>,
}

impl AnalysisRequest {
    /// Create a request with a generated request id
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            session_id: None,
            text: text.into(),
            context: BTreeMap::new(),
        }
    }

    /// Deliver the result to this session
    #[must_use]
    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    /// Use a caller-supplied request id
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    /// Attach a context entry
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// A unit of background work
#[derive(Clone, Debug, Serialize)]
pub struct Task {
    /// Unique task identifier
    pub id: TaskId,
    /// What the task does
    pub kind: TaskKind,
    /// The submitted request
    pub request: AnalysisRequest,
    /// Dispatch priority, kept across retries
    pub priority: Priority,
    /// When the task was submitted
    pub created_at: DateTime<Utc>,
    /// When the task last changed state
    pub updated_at: DateTime<Utc>,
    /// Failed attempts so far
    pub attempts: u32,
    /// Current status
    pub status: TaskStatus,
    /// Last failure reason
    pub error: Option<String>,
}

impl Task {
    /// Create a queued analysis task
    #[must_use]
    pub fn new(request: AnalysisRequest, priority: Priority) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::generate(),
            kind: TaskKind::Analysis,
            request,
            priority,
            created_at: now,
            updated_at: now,
            attempts: 0,
            status: TaskStatus::Queued,
            error: None,
        }
    }

    /// Update task status
    pub fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// Record a failed attempt
    pub fn record_failure(&mut self, reason: impl Into<String>) {
        self.attempts += 1;
        self.error = Some(reason.into());
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_task_is_queued() {
        let task = Task::new(AnalysisRequest::new("hello"), Priority::High);
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.kind, TaskKind::Analysis);
        assert_eq!(task.attempts, 0);
        assert!(task.error.is_none());
    }

    #[test]
    fn test_record_failure() {
        let mut task = Task::new(AnalysisRequest::new("hello"), Priority::Normal);
        task.record_failure("timeout");
        task.record_failure("unavailable");
        assert_eq!(task.attempts, 2);
        assert_eq!(task.error.as_deref(), Some("unavailable"));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!TaskStatus::Queued.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert_eq!(TaskStatus::Failed.to_string(), "failed");
    }

    #[test]
    fn test_request_builder() {
        let session = SessionId::from("s1");
        let request = AnalysisRequest::new("text")
            .with_session(session.clone())
            .with_request_id("req-1")
            .with_context("source", "form");
        assert_eq!(request.session_id, Some(session));
        assert_eq!(request.request_id, "req-1");
        assert_eq!(request.context.get("source").map(String::as_str), Some("form"));
    }

    #[test]
    fn test_request_deserializes_without_context() {
        let request: AnalysisRequest =
            serde_json::from_str(r#"{"request_id":"r","session_id":null,"text":"t"}"#).unwrap();
        assert!(request.context.is_empty());
    }
}
