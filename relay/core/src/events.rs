//! Client-facing events
//!
//! Event names and payload shapes the processor hands to the outbound
//! queue. Clients acknowledge any of them by echoing `_message_id`.

use serde_json::{json, Value};

use crate::backend::fallback_analysis;
use crate::cache::{CacheHit, HitKind};
use crate::tasks::Task;

/// Analysis finished; payload carries the result
pub const EVENT_ANALYSIS_RESULT: &str = "analysis_result";

/// Analysis permanently failed; payload carries the reason and a fallback
pub const EVENT_ANALYSIS_ERROR: &str = "analysis_error";

/// Payload of an [`EVENT_ANALYSIS_RESULT`] event
///
/// `cache_hit` is `null` for fresh results, otherwise `"exact"` or
/// `"similar"` (with the match similarity).
#[must_use]
pub fn analysis_result(task: &Task, analysis: Value, hit: Option<&CacheHit>) -> Value {
    let mut payload = json!({
        "task_id": task.id.as_str(),
        "request_id": task.request.request_id,
        "analysis": analysis,
        "context": task.request.context,
        "cache_hit": hit.map(|h| h.kind.label()),
    });
    if let Some(CacheHit {
        kind: HitKind::Similar { similarity },
        ..
    }) = hit
    {
        payload["similarity"] = json!(similarity);
    }
    payload
}

/// Payload of an [`EVENT_ANALYSIS_ERROR`] event
#[must_use]
pub fn analysis_error(task: &Task, reason: &str) -> Value {
    json!({
        "task_id": task.id.as_str(),
        "request_id": task.request.request_id,
        "error": reason,
        "attempts": task.attempts,
        "fallback_analysis": fallback_analysis(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduling::Priority;
    use crate::tasks::AnalysisRequest;

    fn task() -> Task {
        Task::new(
            AnalysisRequest::new("text")
                .with_request_id("req-1")
                .with_context("page", "home"),
            Priority::Normal,
        )
    }

    #[test]
    fn test_fresh_result_payload() {
        let task = task();
        let payload = analysis_result(&task, json!({ "clarity_score": 4 }), None);
        assert_eq!(payload["task_id"], task.id.as_str());
        assert_eq!(payload["request_id"], "req-1");
        assert_eq!(payload["context"]["page"], "home");
        assert!(payload["cache_hit"].is_null());
        assert!(payload.get("similarity").is_none());
    }

    #[test]
    fn test_similar_hit_payload() {
        let hit = CacheHit {
            result: json!({}),
            kind: HitKind::Similar { similarity: 0.8 },
            matched_text: "other".to_string(),
        };
        let payload = analysis_result(&task(), json!({}), Some(&hit));
        assert_eq!(payload["cache_hit"], "similar");
        assert_eq!(payload["similarity"], 0.8);
    }

    #[test]
    fn test_error_payload_carries_fallback() {
        let payload = analysis_error(&task(), "analysis timed out");
        assert_eq!(payload["error"], "analysis timed out");
        assert_eq!(payload["fallback_analysis"]["clarity_score"], 3);
    }
}
