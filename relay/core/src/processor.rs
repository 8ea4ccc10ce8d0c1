//! Background Task Processor
//!
//! Runs analysis work off the request path and hands results to the
//! outbound queue for delivery to the submitting session.
//!
//! # Design
//!
//! ```text
//!   enqueue(request) ──► validate ──► priority queue ──► worker 1..N
//!                                                          │
//!                           cache.get(text) ── hit ──► synthesize result
//!                                 │ miss
//!                                 ▼
//!                  analyzer.analyze(text) under processing_timeout
//!                                 │ ok
//!                                 ▼
//!                           cache.put(text) ──► queue.enqueue(analysis_result, HIGH)
//!
//!   any failure: attempts += 1 ──► below limit: re-queue after backoff
//!                              └─► at limit: Failed + analysis_error (HIGH)
//!
//!   Failed tasks stay visible through status() for failed_retention_secs,
//!   then the workers drop them from the index.
//! ```
//!
//! Each worker owns the analyzer it was given by the factory, so a slow call
//! in one worker never queues the others behind a shared client. Analysis
//! runs in its own task: a timeout aborts it and a panic inside it is
//! reported as an ordinary failure.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::backend::{Analyzer, AnalyzerError, AnalyzerFactory};
use crate::cache::SimilarityCache;
use crate::events;
use crate::lifecycle::join_with_timeout;
use crate::outbound::MessageQueue;
use crate::retry::RetryPolicy;
use crate::scheduling::{Priority, PriorityQueue};
use crate::tasks::{AnalysisRequest, Task, TaskId, TaskStatus};

/// Errors from submitting work to the processor
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProcessorError {
    /// The request was rejected before being queued
    #[error("invalid request: {0}")]
    InvalidInput(String),

    /// Too many tasks are already pending
    #[error("task queue full ({max_pending} pending)")]
    Full {
        /// Configured bound
        max_pending: usize,
    },
}

/// Processor configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Number of worker loops
    pub workers: usize,
    /// Longest a worker sleeps when idle (milliseconds)
    pub poll_interval_ms: u64,
    /// Upper bound on one analysis call (seconds)
    pub processing_timeout_secs: u64,
    /// Longest accepted input (characters)
    pub max_input_chars: usize,
    /// Bound on queued tasks (0 = unbounded)
    pub max_pending: usize,
    /// Pause after a worker-level fault (milliseconds)
    pub error_backoff_ms: u64,
    /// How long `stop()` waits for each worker (milliseconds)
    pub shutdown_timeout_ms: u64,
    /// How long a failed task stays inspectable (seconds)
    pub failed_retention_secs: u64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            poll_interval_ms: 1_000,
            processing_timeout_secs: 30,
            max_input_chars: 1_000,
            max_pending: 0,
            error_backoff_ms: 1_000,
            shutdown_timeout_ms: 2_000,
            failed_retention_secs: 3_600,
        }
    }
}

impl ProcessorConfig {
    /// Set the worker count
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Analysis timeout, never shorter than one second
    #[must_use]
    pub fn processing_timeout(&self) -> Duration {
        Duration::from_secs(self.processing_timeout_secs.max(1))
    }

    /// Failed task retention
    #[must_use]
    pub fn failed_retention(&self) -> Duration {
        Duration::from_secs(self.failed_retention_secs)
    }
}

/// Processor statistics
#[derive(Clone, Debug, Default, Serialize)]
pub struct ProcessorStats {
    /// Tasks accepted since start
    pub queued: u64,
    /// Tasks completed
    pub processed: u64,
    /// Tasks that exhausted their retries
    pub failed: u64,
    /// Tasks answered from the cache
    pub cache_hits: u64,
    /// Retries scheduled
    pub retried: u64,
    /// Tasks waiting, including those backing off
    pub queue_size: usize,
    /// Running workers
    pub worker_count: usize,
    /// Tasks queued, backing off or processing
    pub active_tasks: usize,
    /// Failed tasks still held for inspection
    pub retained_failed: usize,
    /// Whether the workers are running
    pub running: bool,
}

#[derive(Default)]
struct Counters {
    queued: u64,
    processed: u64,
    failed: u64,
    cache_hits: u64,
    retried: u64,
}

struct ProcessorState {
    queue: PriorityQueue<TaskId>,
    tasks: HashMap<TaskId, Task>,
    /// Failed tasks in the order they failed
    failed: VecDeque<(Instant, TaskId)>,
    counters: Counters,
}

impl ProcessorState {
    /// Drop failed tasks older than `retention`
    fn prune_failed(&mut self, now: Instant, retention: Duration) -> usize {
        let mut pruned = 0;
        while let Some((failed_at, _)) = self.failed.front() {
            if now.saturating_duration_since(*failed_at) < retention {
                break;
            }
            if let Some((_, id)) = self.failed.pop_front() {
                self.tasks.remove(&id);
                pruned += 1;
            }
        }
        pruned
    }

    /// Pop the next task and mark it processing
    fn claim_next(&mut self) -> Option<Task> {
        while let Some(id) = self.queue.pop() {
            if let Some(task) = self.tasks.get_mut(&id) {
                task.set_status(TaskStatus::Processing);
                return Some(task.clone());
            }
        }
        None
    }
}

/// How one attempt went wrong
struct AttemptFailure {
    reason: String,
    /// The worker itself hit a fault (panic) rather than a typed failure
    fault: bool,
}

impl AttemptFailure {
    fn error(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            fault: false,
        }
    }
}

struct ProcessorInner {
    config: ProcessorConfig,
    retry: RetryPolicy,
    factory: Arc<dyn AnalyzerFactory>,
    cache: SimilarityCache,
    queue: MessageQueue,
    state: Mutex<ProcessorState>,
    running: AtomicBool,
    wakeup: Notify,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Pool of analysis workers
///
/// Cheap to clone; all clones share the same task queue and workers.
#[derive(Clone)]
pub struct BackgroundProcessor {
    inner: Arc<ProcessorInner>,
}

impl BackgroundProcessor {
    /// Create a processor; workers are not started
    pub fn new(
        config: ProcessorConfig,
        retry: RetryPolicy,
        factory: Arc<dyn AnalyzerFactory>,
        cache: SimilarityCache,
        queue: MessageQueue,
    ) -> Self {
        Self {
            inner: Arc::new(ProcessorInner {
                config,
                retry,
                factory,
                cache,
                queue,
                state: Mutex::new(ProcessorState {
                    queue: PriorityQueue::new(),
                    tasks: HashMap::new(),
                    failed: VecDeque::new(),
                    counters: Counters::default(),
                }),
                running: AtomicBool::new(false),
                wakeup: Notify::new(),
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Processor configuration
    #[must_use]
    pub fn config(&self) -> &ProcessorConfig {
        &self.inner.config
    }

    fn validate(&self, request: &AnalysisRequest) -> Result<(), ProcessorError> {
        if request.text.trim().is_empty() {
            return Err(ProcessorError::InvalidInput("text is empty".to_string()));
        }
        let max = self.inner.config.max_input_chars;
        if request.text.chars().count() > max {
            return Err(ProcessorError::InvalidInput(format!(
                "text exceeds {max} characters"
            )));
        }
        Ok(())
    }

    /// Submit analysis work
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for empty or oversized text and `Full` when
    /// `max_pending` tasks are already queued. Rejected work is never queued.
    pub fn enqueue(
        &self,
        request: AnalysisRequest,
        priority: Priority,
    ) -> Result<TaskId, ProcessorError> {
        if let Err(e) = self.validate(&request) {
            tracing::warn!(request_id = %request.request_id, error = %e, "Request rejected");
            return Err(e);
        }

        let task = Task::new(request, priority);
        let id = task.id.clone();
        let max_pending = self.inner.config.max_pending;
        {
            let mut state = self.inner.state.lock();
            if max_pending > 0 && state.queue.len() >= max_pending {
                drop(state);
                tracing::warn!(max_pending, "Task queue full");
                return Err(ProcessorError::Full { max_pending });
            }
            state.queue.push(id.clone(), priority);
            state.tasks.insert(id.clone(), task);
            state.counters.queued += 1;
        }

        self.inner.wakeup.notify_one();
        tracing::debug!(task_id = %id, %priority, "Task queued for analysis");
        Ok(id)
    }

    /// Snapshot of a task
    ///
    /// Completed tasks leave the index and return `None`; failed tasks are
    /// kept for inspection until `failed_retention_secs` has passed.
    #[must_use]
    pub fn status(&self, task_id: &TaskId) -> Option<Task> {
        self.inner.state.lock().tasks.get(task_id).cloned()
    }

    /// Processor statistics
    #[must_use]
    pub fn stats(&self) -> ProcessorStats {
        let worker_count = self.inner.workers.lock().len();
        let state = self.inner.state.lock();
        let c = &state.counters;
        ProcessorStats {
            queued: c.queued,
            processed: c.processed,
            failed: c.failed,
            cache_hits: c.cache_hits,
            retried: c.retried,
            queue_size: state.queue.len(),
            worker_count,
            active_tasks: state.tasks.len().saturating_sub(state.failed.len()),
            retained_failed: state.failed.len(),
            running: self.inner.running.load(Ordering::SeqCst),
        }
    }

    /// Start the worker pool
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut workers = self.inner.workers.lock();
        for index in 0..self.inner.config.workers {
            let processor = self.clone();
            let analyzer = self.inner.factory.create();
            workers.push(tokio::spawn(async move {
                processor.run_worker(index, analyzer).await;
            }));
        }
        tracing::info!(workers = workers.len(), "Background processor started");
    }

    /// Stop the worker pool
    ///
    /// Workers finish the task in hand; queued tasks stay queued.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.wakeup.notify_waiters();
        let handles: Vec<JoinHandle<()>> = self.inner.workers.lock().drain(..).collect();
        join_with_timeout(
            "processor",
            handles,
            Duration::from_millis(self.inner.config.shutdown_timeout_ms),
        )
        .await;
        tracing::info!("Background processor stopped");
    }

    /// Whether the workers are running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Drop failed tasks held longer than `failed_retention_secs`
    ///
    /// Running workers call this on every pass; returns the number dropped.
    pub fn prune_failed(&self) -> usize {
        let retention = self.inner.config.failed_retention();
        let pruned = self
            .inner
            .state
            .lock()
            .prune_failed(Instant::now(), retention);
        if pruned > 0 {
            tracing::debug!(pruned, "Dropped retained failed tasks");
        }
        pruned
    }

    async fn run_worker(&self, index: usize, analyzer: Arc<dyn Analyzer>) {
        tracing::debug!(worker = index, analyzer = analyzer.name(), "Worker started");
        let poll = Duration::from_millis(self.inner.config.poll_interval_ms);

        while self.inner.running.load(Ordering::SeqCst) {
            self.prune_failed();
            let next = self.inner.state.lock().claim_next();
            let Some(task) = next else {
                let now = Instant::now();
                let deadline = self
                    .inner
                    .state
                    .lock()
                    .queue
                    .next_ready_at()
                    .map_or(now + poll, |at| at.min(now + poll));
                tokio::select! {
                    () = self.inner.wakeup.notified() => {}
                    () = tokio::time::sleep_until(deadline) => {}
                }
                continue;
            };

            tracing::info!(worker = index, task_id = %task.id, attempt = task.attempts + 1, "Processing task");
            match self.attempt(&analyzer, &task).await {
                Ok(()) => self.complete(&task.id),
                Err(failure) => {
                    let fault = failure.fault;
                    self.fail(&task.id, failure.reason);
                    if fault {
                        tokio::time::sleep(Duration::from_millis(self.inner.config.error_backoff_ms))
                            .await;
                    }
                }
            }
        }
        tracing::debug!(worker = index, "Worker stopped");
    }

    async fn attempt(
        &self,
        analyzer: &Arc<dyn Analyzer>,
        task: &Task,
    ) -> Result<(), AttemptFailure> {
        let text = &task.request.text;

        let cached = self.inner.cache.get(text);
        let from_cache = cached.is_some();
        let payload = if let Some(hit) = cached {
            tracing::debug!(task_id = %task.id, kind = hit.kind.label(), "Answered from cache");
            events::analysis_result(task, hit.result.clone(), Some(&hit))
        } else {
            let analysis = self.analyze(analyzer, text).await?;
            self.inner.cache.put(text, analysis.clone());
            events::analysis_result(task, analysis, None)
        };

        match &task.request.session_id {
            Some(session_id) => {
                let message_id = self
                    .inner
                    .queue
                    .enqueue(session_id, events::EVENT_ANALYSIS_RESULT, payload, Priority::High)
                    .map_err(|e| AttemptFailure::error(e.to_string()))?;
                tracing::info!(
                    task_id = %task.id,
                    session_id = %session_id,
                    message_id = %message_id,
                    "Analysis result queued"
                );
            }
            None => {
                tracing::debug!(task_id = %task.id, "No session on request, result not delivered");
            }
        }

        // Counted once the result is handed off, so a retried task counts once
        if from_cache {
            self.inner.state.lock().counters.cache_hits += 1;
        }
        Ok(())
    }

    /// Run the analyzer in its own task under the processing timeout
    async fn analyze(
        &self,
        analyzer: &Arc<dyn Analyzer>,
        text: &str,
    ) -> Result<Value, AttemptFailure> {
        let timeout = self.inner.config.processing_timeout();
        let analyzer = Arc::clone(analyzer);
        let owned = text.to_string();
        let mut handle = tokio::spawn(async move { analyzer.analyze(&owned).await });

        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(Ok(analysis))) => Ok(analysis),
            Ok(Ok(Err(e))) => Err(AttemptFailure::error(e.to_string())),
            Ok(Err(join_error)) => Err(AttemptFailure {
                reason: format!("analysis task ended abnormally: {join_error}"),
                fault: true,
            }),
            Err(_) => {
                handle.abort();
                Err(AttemptFailure::error(AnalyzerError::Timeout(timeout).to_string()))
            }
        }
    }

    fn complete(&self, task_id: &TaskId) {
        let mut state = self.inner.state.lock();
        state.tasks.remove(task_id);
        state.counters.processed += 1;
        drop(state);
        tracing::info!(task_id = %task_id, "Task completed");
    }

    fn fail(&self, task_id: &TaskId, reason: String) {
        let mut state = self.inner.state.lock();
        let Some(task) = state.tasks.get_mut(task_id) else {
            return;
        };
        task.record_failure(reason.clone());
        let attempts = task.attempts;

        if self.inner.retry.should_retry(attempts) {
            task.set_status(TaskStatus::Queued);
            let priority = task.priority;
            let delay = self.inner.retry.backoff(attempts);
            state
                .queue
                .push_at(task_id.clone(), priority, Instant::now() + delay);
            state.counters.retried += 1;
            drop(state);
            tracing::warn!(
                task_id = %task_id,
                attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %reason,
                "Task failed, will retry"
            );
            self.inner.wakeup.notify_one();
            return;
        }

        task.set_status(TaskStatus::Failed);
        let failed = task.clone();
        state.failed.push_back((Instant::now(), task_id.clone()));
        state.counters.failed += 1;
        drop(state);
        tracing::error!(task_id = %task_id, attempts, error = %reason, "Task failed permanently");

        if let Some(session_id) = &failed.request.session_id {
            let payload = events::analysis_error(&failed, &reason);
            if let Err(e) = self.inner.queue.enqueue(
                session_id,
                events::EVENT_ANALYSIS_ERROR,
                payload,
                Priority::High,
            ) {
                tracing::error!(task_id = %task_id, error = %e, "Failed to queue error notification");
            }
        }
    }
}

impl fmt::Debug for BackgroundProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundProcessor")
            .field("workers", &self.inner.config.workers)
            .field("running", &self.inner.running.load(Ordering::SeqCst))
            .finish()
    }
}
