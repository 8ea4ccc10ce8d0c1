//! Relay Daemon - Session-Routed Analysis Server
//!
//! Entry point that loads configuration, wires the relay core to the Ollama
//! analyzer and an in-process transport, and runs until signalled.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults
//! relay-daemon
//!
//! # With config file and more workers
//! relay-daemon --config /etc/relay/relay.toml --workers 4
//!
//! # One-shot round trip: submit, wait for the delivered event, print it
//! relay-daemon --analyze "Increase newsletter signups by 10% this quarter"
//!
//! # Verbose logging
//! RUST_LOG=debug relay-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use relay_core::{
    default_config_path, load_config_from_path, AnalysisRequest, Analyzer, AnalyzerConfig,
    AnalyzerFactory, ChannelTransport, ConnectionId, ConnectionMetadata, MessageId,
    OllamaAnalyzer, Priority, Relay, RelayConfig, MESSAGE_ID_KEY,
};

/// Relay Daemon - session-routed background analysis
#[derive(Parser, Debug)]
#[command(name = "relay-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "RELAY_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Number of analysis workers (overrides config and environment)
    #[arg(short = 'w', long, value_name = "N")]
    workers: Option<usize>,

    /// Analyze one text, print the delivered event and exit
    #[arg(short = 'a', long, value_name = "TEXT")]
    analyze: Option<String>,

    /// Seconds between statistics log lines
    #[arg(long, default_value_t = 60, value_name = "SECS")]
    stats_interval: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "RELAY_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("relay_daemon={level},relay_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

/// Load the config file, environment and CLI overrides
fn resolve_config(args: &Args) -> Result<RelayConfig> {
    let path = args.config.clone().or_else(default_config_path);
    if let Some(ref path) = path {
        info!(config_path = %path.display(), "Config file");
    }

    let mut config = load_config_from_path(path.as_deref())
        .with_context(|| "Failed to load relay configuration")?;
    if let Some(workers) = args.workers {
        config.processor.workers = workers;
    }
    config
        .validate()
        .with_context(|| "Invalid relay configuration")?;
    Ok(config)
}

fn ollama_factory(config: AnalyzerConfig) -> Arc<dyn AnalyzerFactory> {
    Arc::new(move || -> Arc<dyn Analyzer> { Arc::new(OllamaAnalyzer::new(config.clone())) })
}

/// Wait for SIGTERM or SIGINT
async fn shutdown_signal() -> Result<()> {
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
        _ = sigint.recv() => info!("Received SIGINT, initiating shutdown"),
    }
    Ok(())
}

fn log_stats(relay: &Relay) {
    let pruned = relay.router().prune_expired();
    let stats = relay.stats();
    info!(
        connections = stats.connections.count,
        sessions = stats.sessions.total_sessions,
        bound_sessions = stats.sessions.bound_sessions,
        pruned_sessions = pruned,
        queue_size = stats.queue.queue_size,
        retry_queue = stats.queue.retry_queue_size,
        sent = stats.queue.sent,
        tasks_processed = stats.processor.processed,
        tasks_failed = stats.processor.failed,
        tasks_failed_retained = stats.processor.retained_failed,
        tasks_pending = stats.processor.queue_size,
        cache_size = stats.cache.size,
        cache_hit_rate = stats.cache.hit_rate_percent,
        cache_degraded = stats.cache.degraded,
        "Relay statistics"
    );
}

/// Run until signalled, logging statistics periodically
async fn serve(relay: &Relay, stats_interval: Duration) -> Result<()> {
    relay.start();

    let mut ticker = tokio::time::interval(stats_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let result = loop {
        tokio::select! {
            _ = ticker.tick() => log_stats(relay),
            signalled = &mut shutdown => break signalled,
        }
    };

    info!("Shutting down...");
    relay.stop().await;
    result
}

/// Submit one text through a local connection and print what gets delivered
async fn analyze_once(relay: &Relay, transport: &ChannelTransport, text: String) -> Result<()> {
    let analyzer = OllamaAnalyzer::new(relay.config().analyzer.clone());
    if !analyzer.health_check().await {
        warn!(
            base_url = %relay.config().analyzer.base_url(),
            "Analysis service unreachable, expect a fallback result"
        );
    }

    let connection_id = ConnectionId::generate();
    let mut events = transport.register(&connection_id);
    let session_id = relay
        .connect(
            connection_id.clone(),
            ConnectionMetadata::default().with_user_agent("relay-daemon/cli"),
            None,
        )
        .context("Failed to open local connection")?;
    relay.start();

    relay
        .submit(
            AnalysisRequest::new(text).with_session(session_id),
            Priority::High,
        )
        .context("Request rejected")?;

    // Every attempt may take the full processing timeout, plus backoff
    let config = relay.config();
    let budget = Duration::from_secs(
        config.processor.processing_timeout_secs * u64::from(config.retry.max_attempts.max(1)),
    ) + Duration::from_millis(config.retry.max_backoff_ms * u64::from(config.retry.max_attempts))
        + Duration::from_secs(5);

    let delivered = tokio::time::timeout(budget, events.recv()).await;
    let outcome = match delivered {
        Ok(Some(event)) => {
            if let Some(id) = event.payload.get(MESSAGE_ID_KEY).and_then(|v| v.as_str()) {
                relay.queue().confirm_delivery(&MessageId::from(id));
            }
            let rendered = serde_json::to_string_pretty(&event)
                .context("Failed to render delivered event")?;
            println!("{rendered}");
            Ok(())
        }
        Ok(None) => Err(anyhow::anyhow!("Local connection closed before delivery")),
        Err(_) => Err(anyhow::anyhow!(
            "No result delivered within {}s",
            budget.as_secs()
        )),
    };

    relay.disconnect(&connection_id);
    transport.unregister(&connection_id);
    relay.stop().await;
    outcome
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!("Relay daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("PID: {}", std::process::id());

    let config = resolve_config(&args)?;
    info!(
        workers = config.processor.workers,
        max_connections = config.registry.max_connections,
        analyzer = %config.analyzer.base_url(),
        model = %config.analyzer.model,
        "Configuration resolved"
    );

    let transport = ChannelTransport::default();
    let relay = Relay::new(
        config.clone(),
        ollama_factory(config.analyzer.clone()),
        Arc::new(transport.clone()),
    );

    let result = match args.analyze {
        Some(text) => analyze_once(&relay, &transport, text).await,
        None => serve(&relay, Duration::from_secs(args.stats_interval.max(1))).await,
    };

    match result {
        Ok(()) => {
            info!("Relay daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Relay daemon stopped with error");
            Err(e)
        }
    }
}
