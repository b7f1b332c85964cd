//! Log latency probe
//!
//! Watches for new pods in namespaces matching a prefix and measures how long
//! each one takes until its logs can be queried from Loki.

mod config;
mod output;

use anyhow::{Context, Result};
use clap::Parser;
use crate::config::{ConcurrencyMode, FailureMode, ProbeConfig, TerminationMode};
use kube::config::{KubeConfigOptions, Kubeconfig};
use probe_lib::{
    api::{self, AppState},
    discovery::KubeLister,
    engine::EngineBuilder,
    health::HealthRegistry,
    observability::{ProbeMetrics, StructuredLogger},
    probe::LokiClient,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const PROBE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Log latency probe
#[derive(Parser, Debug)]
#[command(name = "log-latency-probe")]
#[command(author, version, about = "Measure pod start to first queryable log latency", long_about = None)]
pub struct Cli {
    /// YAML config file (defaults to ./config.yaml if present)
    #[arg(long, short, env = "PROBE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Only namespaces starting with this prefix are watched
    #[arg(long)]
    pub namespace_prefix: Option<String>,

    /// Loki base URL
    #[arg(long)]
    pub loki_address: Option<String>,

    /// Path to kubeconfig file (inferred if not specified)
    #[arg(long)]
    pub kubeconfig: Option<String>,

    /// Seconds between discovery cycles
    #[arg(long)]
    pub discovery_interval_secs: Option<u64>,

    #[arg(long, value_enum)]
    pub concurrency: Option<ConcurrencyMode>,

    /// Number of probe workers in pool mode
    #[arg(long)]
    pub workers: Option<usize>,

    #[arg(long, value_enum)]
    pub termination: Option<TerminationMode>,

    /// Consecutive empty cycles before stopping in empty-queue mode
    #[arg(long)]
    pub empty_queue_threshold: Option<u32>,

    /// Timeout for a single Loki query in seconds
    #[arg(long)]
    pub probe_timeout_secs: Option<u64>,

    #[arg(long, value_enum)]
    pub discovery_failure: Option<FailureMode>,

    /// Count a restarted pod again
    #[arg(long)]
    pub track_restarts: bool,

    /// Serve /healthz, /readyz and /metrics on this port
    #[arg(long)]
    pub api_port: Option<u16>,

    /// Report format
    #[arg(long, short, value_enum, default_value = "table")]
    pub format: output::OutputFormat,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // JSON logs go to stderr; stdout carries the report
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json().with_writer(std::io::stderr))
        .init();

    let config = ProbeConfig::load(&cli)?;
    let engine_config = config.engine_config()?;
    info!(
        namespace_prefix = %config.namespace_prefix,
        loki_address = %config.loki_address,
        concurrency = ?config.concurrency,
        termination = ?config.termination,
        "Probe configured"
    );

    let health = HealthRegistry::new();
    health.register_all().await;

    let metrics = ProbeMetrics::new();
    let logger = StructuredLogger::new(&config.namespace_prefix);
    let scheduler = match config.concurrency {
        ConcurrencyMode::Sequential => "sequential",
        ConcurrencyMode::Pool => "worker_pool",
    };
    logger.log_startup(PROBE_VERSION, &config.loki_address, scheduler);

    let client = kube_client(config.kubeconfig()).await?;
    let lister = Arc::new(KubeLister::new(client));
    let loki = Arc::new(LokiClient::new(config.loki_config()).context("Failed to create Loki client")?);

    let api_handle = config.api_port.map(|port| {
        let state = Arc::new(AppState::new(health.clone(), metrics.clone()));
        tokio::spawn(api::serve(port, state))
    });

    let engine = EngineBuilder::new()
        .lister(lister)
        .probe_client(loki)
        .config(engine_config)
        .health(health.clone())
        .build()?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let signal_handle = tokio::spawn(forward_signals(shutdown_tx, logger.clone()));

    let result = engine.run(shutdown_rx).await;

    signal_handle.abort();
    if let Some(handle) = api_handle {
        handle.abort();
    }

    let report = result.context("Probe stopped")?;
    output::print_report(&report, cli.format)?;

    Ok(())
}

/// Build a Kubernetes client from an explicit kubeconfig or the environment
async fn kube_client(kubeconfig: Option<&str>) -> Result<kube::Client> {
    let config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("Error reading kubeconfig from {}", path))?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .with_context(|| format!("Error building kubeconfig from {}", path))?
        }
        None => kube::Config::infer()
            .await
            .context("Failed to infer Kubernetes configuration")?,
    };

    kube::Client::try_from(config).context("Failed to create Kubernetes client")
}

/// Forward the first SIGINT or SIGTERM to the engine
async fn forward_signals(shutdown: broadcast::Sender<()>, logger: StructuredLogger) {
    let signal = wait_for_signal().await;
    logger.log_shutdown(signal);

    if shutdown.send(()).is_err() {
        warn!("Engine already stopped");
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return "SIGINT received";
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT received",
        _ = sigterm.recv() => "SIGTERM received",
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "SIGINT received"
}
