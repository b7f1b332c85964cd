//! Probe configuration
//!
//! Values are layered: YAML file, then `PROBE_*` environment variables, then
//! command line flags.

use crate::Cli;
use anyhow::{Context, Result};
use clap::ValueEnum;
use config::{Environment, File, FileFormat};
use probe_lib::{
    discovery::DiscoveryFailurePolicy,
    engine::EngineConfig,
    models::KeyPolicy,
    probe::LokiConfig,
    scheduler::Concurrency,
    termination::TerminationPolicy,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Config file read when `--config` is not given; missing is not an error
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ConcurrencyMode {
    /// Probe one pod at a time
    #[default]
    Sequential,
    /// Probe through a fixed pool of workers
    Pool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum TerminationMode {
    /// Run until SIGINT or SIGTERM
    #[default]
    Signal,
    /// Stop after consecutive cycles with nothing to probe
    EmptyQueue,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum FailureMode {
    /// Stop on the first discovery failure
    #[default]
    Abort,
    /// Retry discovery with exponential backoff
    Retry,
}

macro_rules! mode_str {
    ($($ty:ty),*) => {$(
        impl $ty {
            fn as_str(&self) -> String {
                self.to_possible_value()
                    .map(|v| v.get_name().to_string())
                    .unwrap_or_default()
            }
        }
    )*};
}

mode_str!(ConcurrencyMode, TerminationMode, FailureMode);

/// Probe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Namespaces starting with this prefix are watched
    #[serde(default = "default_namespace_prefix")]
    pub namespace_prefix: String,

    /// Base URL of the Loki query frontend
    #[serde(default = "default_loki_address")]
    pub loki_address: String,

    /// Kubeconfig to use; in-cluster or `~/.kube/config` inference when unset
    #[serde(default)]
    pub kubeconfig_path: Option<String>,

    /// Pause between discovery cycles in seconds; 0 runs back to back
    #[serde(default = "default_discovery_interval")]
    pub discovery_interval_secs: u64,

    #[serde(default)]
    pub concurrency: ConcurrencyMode,

    /// Worker count in pool mode
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Bound on queued work items in pool mode
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default)]
    pub termination: TerminationMode,

    /// Consecutive empty cycles before stopping in empty-queue mode
    #[serde(default = "default_empty_queue_threshold")]
    pub empty_queue_threshold: u32,

    /// Timeout for a single Loki query in seconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    #[serde(default)]
    pub discovery_failure: FailureMode,

    /// Consecutive failed discovery passes tolerated in retry mode
    #[serde(default = "default_discovery_retries")]
    pub discovery_retries: u32,

    /// Loki stream label holding the pod name
    #[serde(default = "default_pod_label")]
    pub pod_label: String,

    /// Treat a restarted pod (new start time) as a new instance
    #[serde(default)]
    pub track_restarts: bool,

    /// Port for /healthz, /readyz and /metrics; disabled when unset
    #[serde(default)]
    pub api_port: Option<u16>,
}

fn default_namespace_prefix() -> String {
    probe_lib::discovery::DEFAULT_NAMESPACE_PREFIX.to_string()
}

fn default_loki_address() -> String {
    "http://localhost:3100".to_string()
}

fn default_discovery_interval() -> u64 {
    2
}

fn default_workers() -> usize {
    probe_lib::scheduler::DEFAULT_WORKERS
}

fn default_queue_capacity() -> usize {
    probe_lib::scheduler::DEFAULT_QUEUE_CAPACITY
}

fn default_empty_queue_threshold() -> u32 {
    probe_lib::termination::DEFAULT_EMPTY_QUEUE_THRESHOLD
}

fn default_probe_timeout() -> u64 {
    probe_lib::probe::DEFAULT_PROBE_TIMEOUT.as_secs()
}

fn default_discovery_retries() -> u32 {
    5
}

fn default_pod_label() -> String {
    probe_lib::probe::DEFAULT_POD_LABEL.to_string()
}

impl ProbeConfig {
    /// Load configuration for the given command line
    pub fn load(cli: &Cli) -> Result<Self> {
        let env = Environment::with_prefix("PROBE").try_parsing(true);
        match &cli.config {
            Some(path) => Self::load_from(path, true, env, cli),
            None => Self::load_from(Path::new(DEFAULT_CONFIG_FILE), false, env, cli),
        }
    }

    fn load_from(path: &Path, required: bool, env: Environment, cli: &Cli) -> Result<Self> {
        let path_str = path
            .to_str()
            .with_context(|| format!("Config path is not valid UTF-8: {}", path.display()))?;

        let int = |v: Option<u64>| v.map(|v| v as i64);

        let config = config::Config::builder()
            .add_source(File::new(path_str, FileFormat::Yaml).required(required))
            .add_source(env)
            .set_override_option("namespace_prefix", cli.namespace_prefix.clone())?
            .set_override_option("loki_address", cli.loki_address.clone())?
            .set_override_option("kubeconfig_path", cli.kubeconfig.clone())?
            .set_override_option("discovery_interval_secs", int(cli.discovery_interval_secs))?
            .set_override_option("concurrency", cli.concurrency.map(|m| m.as_str()))?
            .set_override_option("workers", int(cli.workers.map(|w| w as u64)))?
            .set_override_option("termination", cli.termination.map(|m| m.as_str()))?
            .set_override_option(
                "empty_queue_threshold",
                int(cli.empty_queue_threshold.map(u64::from)),
            )?
            .set_override_option("probe_timeout_secs", int(cli.probe_timeout_secs))?
            .set_override_option("discovery_failure", cli.discovery_failure.map(|m| m.as_str()))?
            .set_override_option("track_restarts", cli.track_restarts.then_some(true))?
            .set_override_option("api_port", int(cli.api_port.map(u64::from)))?
            .build()
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?;

        config
            .try_deserialize()
            .context("Failed to parse configuration")
    }

    /// Kubeconfig override, treating an empty value as unset
    pub fn kubeconfig(&self) -> Option<&str> {
        self.kubeconfig_path.as_deref().filter(|p| !p.is_empty())
    }

    pub fn loki_config(&self) -> LokiConfig {
        LokiConfig {
            address: self.loki_address.clone(),
            pod_label: self.pod_label.clone(),
            request_timeout: Duration::from_secs(self.probe_timeout_secs),
        }
    }

    /// Translate into engine configuration, rejecting unusable values
    pub fn engine_config(&self) -> Result<EngineConfig> {
        let concurrency = match self.concurrency {
            ConcurrencyMode::Sequential => Concurrency::Sequential,
            ConcurrencyMode::Pool => Concurrency::WorkerPool {
                workers: self.workers,
                capacity: self.queue_capacity,
            },
        };

        let termination = match self.termination {
            TerminationMode::Signal => TerminationPolicy::RunUntilSignal,
            TerminationMode::EmptyQueue => TerminationPolicy::EmptyQueueThreshold {
                threshold: self.empty_queue_threshold,
            },
        };

        let discovery_failure = match self.discovery_failure {
            FailureMode::Abort => DiscoveryFailurePolicy::Abort,
            FailureMode::Retry => DiscoveryFailurePolicy::retry(self.discovery_retries),
        };

        let key_policy = if self.track_restarts {
            KeyPolicy::NameAndStart
        } else {
            KeyPolicy::Name
        };

        let config = EngineConfig {
            namespace_prefix: self.namespace_prefix.clone(),
            discovery_interval: Duration::from_secs(self.discovery_interval_secs),
            concurrency,
            termination,
            probe_timeout: Duration::from_secs(self.probe_timeout_secs),
            discovery_failure,
            key_policy,
        };
        config.validate()?;

        Ok(config)
    }
}
