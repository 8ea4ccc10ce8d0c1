//! Relay Core - Session-Routed Background Analysis
//!
//! This crate decouples slow, latency-variable analysis work from the
//! lifetime of a client's live connection. A client connects, is issued a
//! session identity, submits work tagged with that session, and receives the
//! result on whichever connection represents the session when the work
//! finishes - which may not be the connection that submitted it.
//!
//! # Architecture
//!
//! ```text
//!   transport connect/disconnect            producer (HTTP layer, CLI, tests)
//!              │                                        │
//!   ┌──────────▼───────────┐                 ┌──────────▼───────────┐
//!   │  ConnectionRegistry  │── purge ──┐     │ BackgroundProcessor  │
//!   │  (health sweep,      │           │     │  (worker pool,       │
//!   │   resource alerts)   │           │     │   retry, timeout)    │
//!   └──────────────────────┘           │     └───┬─────────────┬────┘
//!                                      │         │             │
//!                           ┌──────────▼───┐  ┌──▼──────────┐  │ results
//!                           │ SessionRouter│  │ Similarity  │  │ (HIGH)
//!                           │ session⇄conn │  │   Cache     │  │
//!                           └──────▲───────┘  └─────────────┘  │
//!                                  │ resolve                   │
//!                           ┌──────┴──────────────────────────▼─┐
//!                           │          MessageQueue             │
//!                           │  (priority tier + retry tier)     │
//!                           └──────────────┬────────────────────┘
//!                                          │ push(connection, event, payload)
//!                                    Transport
//! ```
//!
//! # Key Types
//!
//! - [`ConnectionRegistry`]: live connections, ping/pong health, resource telemetry
//! - [`SessionRouter`]: the 1:1 session ⇄ connection binding
//! - [`MessageQueue`]: prioritized outbound delivery with bounded retry
//! - [`BackgroundProcessor`]: worker pool running the [`Analyzer`] collaborator
//! - [`SimilarityCache`]: exact and near-duplicate result reuse
//! - [`Relay`]: explicit wiring of all of the above with `start()`/`stop()`
//!
//! # Locking
//!
//! Every component owns exactly one lock for its state. No lock is held
//! across an `.await` or across a call into another component, so there is
//! no lock hierarchy to get wrong.

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod cache;
pub mod config;
pub mod events;
pub mod outbound;
pub mod processor;
pub mod registry;
pub mod relay;
pub mod retry;
pub mod scheduling;
pub mod session;
pub mod tasks;

mod lifecycle;

// Re-exports for convenience
pub use backend::{
    fallback_analysis, Analyzer, AnalyzerConfig, AnalyzerError, AnalyzerFactory, OllamaAnalyzer,
};
pub use cache::{CacheConfig, CacheConfigUpdate, CacheHit, CacheStats, HitKind, SimilarityCache};
pub use config::{default_config_path, load_config, load_config_from_path, ConfigError, RelayConfig};
pub use events::{EVENT_ANALYSIS_ERROR, EVENT_ANALYSIS_RESULT};
pub use outbound::{
    ChannelTransport, MessageId, MessageQueue, OutboundEvent, QueueConfig, QueueError, QueueStats,
    QueuedMessage, Transport, TransportError, MESSAGE_ID_KEY,
};
pub use processor::{BackgroundProcessor, ProcessorConfig, ProcessorError, ProcessorStats};
pub use registry::{
    Connection, ConnectionId, ConnectionMetadata, ConnectionRegistry, ConnectionSummary,
    PressureLevel, RegistryConfig, RegistrySnapshot, ResourceSample, ResourceThresholds,
    SweepReport,
};
pub use relay::{ConnectError, Relay, RelayStats};
pub use retry::RetryPolicy;
pub use scheduling::Priority;
pub use session::{RouterConfig, RouterStats, Session, SessionId, SessionRouter};
pub use tasks::{AnalysisRequest, Task, TaskId, TaskKind, TaskStatus};
