//! Worker lifecycle helpers shared by the background components.

use std::time::Duration;

use tokio::task::JoinHandle;

/// Join worker handles, giving each one at most `timeout`
///
/// A worker that does not finish in time is detached and left to end on its
/// own; it is never forcibly aborted.
pub(crate) async fn join_with_timeout(
    component: &'static str,
    handles: Vec<JoinHandle<()>>,
    timeout: Duration,
) {
    for (index, handle) in handles.into_iter().enumerate() {
        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(component, worker = index, error = %e, "Worker ended abnormally");
            }
            Err(_) => {
                tracing::warn!(
                    component,
                    worker = index,
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    "Worker did not stop in time, abandoning it"
                );
            }
        }
    }
}
