//! ---
//! mayhem_section: "01-core-functionality"
//! mayhem_subsection: "module"
//! mayhem_type: "source"
//! mayhem_scope: "code"
//! mayhem_description: "Shared configuration and logging primitives."
//! mayhem_version: "v0.1.0"
//! mayhem_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

/// Resource kinds accepted as keys of `engine.max_concurrent`.
pub const RESOURCE_KINDS: [&str; 5] = ["cpu", "memory", "disk", "network", "generic"];

fn default_scratch_dir() -> PathBuf {
    std::env::temp_dir().join("mayhem-scratch")
}

fn default_memory_chunk_bytes() -> usize {
    1024
}

fn default_max_pacing() -> Duration {
    Duration::from_millis(1)
}

fn default_history_limit() -> usize {
    10
}

fn default_retention_days() -> u64 {
    30
}

fn default_prune_interval() -> Duration {
    Duration::from_secs(3600)
}

fn default_refresh_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9898))
}

fn default_api_enabled() -> bool {
    true
}

fn default_api_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 5000))
}

/// Primary configuration object for the Mayhem daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: Option<PathBuf>,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "MAYHEM_CONFIG";

    /// Load configuration from disk, respecting the `MAYHEM_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration together with the effective source path.
    ///
    /// Unlike a missing override, an absent candidate list is not an error:
    /// every section carries defaults, so the daemon starts with
    /// [`AppConfig::default`] and reports `source = None`.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        debug!(
            inspected = %candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
            "no configuration file found; using defaults"
        );
        Ok(LoadedAppConfig {
            config: AppConfig::default(),
            source: None,
        })
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.engine.validate()?;
        self.ledger.validate()?;
        if self.telemetry.refresh_interval.is_zero() {
            return Err(anyhow!("telemetry.refresh_interval must be greater than zero"));
        }
        if self.api.history_limit == 0 {
            return Err(anyhow!("api.history_limit must be greater than zero"));
        }
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Settings consumed by the injection engine and its workers.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory receiving disk-fill artifacts.
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
    /// Size of a single memory-pressure allocation.
    #[serde(default = "default_memory_chunk_bytes")]
    pub memory_chunk_bytes: usize,
    /// Upper bound for the delay between two memory allocations.
    #[serde(default = "default_max_pacing", rename = "max_pacing_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max_pacing: Duration,
    /// Optional ceiling of concurrently running workloads per resource kind.
    /// Kinds without an entry are unlimited.
    #[serde(default)]
    pub max_concurrent: IndexMap<String, usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scratch_dir: default_scratch_dir(),
            memory_chunk_bytes: default_memory_chunk_bytes(),
            max_pacing: default_max_pacing(),
            max_concurrent: IndexMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.memory_chunk_bytes == 0 {
            return Err(anyhow!("engine.memory_chunk_bytes must be greater than zero"));
        }
        for (kind, ceiling) in &self.max_concurrent {
            if !RESOURCE_KINDS.contains(&kind.as_str()) {
                return Err(anyhow!(
                    "engine.max_concurrent references unknown resource kind '{}' (expected one of {})",
                    kind,
                    RESOURCE_KINDS.join(", ")
                ));
            }
            if *ceiling == 0 {
                return Err(anyhow!(
                    "engine.max_concurrent.{} must be greater than zero",
                    kind
                ));
            }
        }
        Ok(())
    }
}

/// Storage backend used by the experiment ledger.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    #[default]
    Memory,
    Jsonl,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default)]
    pub backend: LedgerBackend,
    /// Location of the JSON-lines file when `backend = "jsonl"`.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Experiments older than this are pruned. Zero disables pruning.
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
    #[serde(default = "default_prune_interval", rename = "prune_interval_secs")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub prune_interval: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            backend: LedgerBackend::default(),
            path: None,
            retention_days: default_retention_days(),
            prune_interval: default_prune_interval(),
        }
    }
}

impl LedgerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.backend == LedgerBackend::Jsonl && self.path.is_none() {
            return Err(anyhow!("ledger.path is required when ledger.backend = \"jsonl\""));
        }
        if self.prune_interval.is_zero() {
            return Err(anyhow!("ledger.prune_interval_secs must be greater than zero"));
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_refresh_interval", rename = "refresh_interval_secs")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub refresh_interval: Duration,
    /// Mount point whose usage feeds `disk_percent`. When unset the root
    /// filesystem is used, or the first disk the host lists if nothing is
    /// mounted at `/`.
    #[serde(default)]
    pub disk_mount: Option<PathBuf>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            refresh_interval: default_refresh_interval(),
            disk_mount: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: default_metrics_listen(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_enabled")]
    pub enabled: bool,
    #[serde(default = "default_api_listen")]
    pub listen: SocketAddr,
    /// Default number of experiments returned by `/chaos-history`.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: default_api_enabled(),
            listen: default_api_listen(),
            history_limit: default_history_limit(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config: AppConfig = "".parse().unwrap();
        assert_eq!(config.engine.memory_chunk_bytes, 1024);
        assert_eq!(config.engine.max_pacing, Duration::from_millis(1));
        assert_eq!(config.ledger.backend, LedgerBackend::Memory);
        assert_eq!(config.ledger.retention_days, 30);
        assert_eq!(config.api.history_limit, 10);
        assert!(config.engine.max_concurrent.is_empty());
    }

    #[test]
    fn parses_full_document() {
        let config: AppConfig = r#"
            [engine]
            scratch_dir = "/tmp/mayhem"
            memory_chunk_bytes = 2048
            max_pacing_ms = 2

            [engine.max_concurrent]
            cpu = 2
            disk = 1

            [ledger]
            backend = "jsonl"
            path = "/tmp/mayhem/experiments.jsonl"
            retention_days = 7
            prune_interval_secs = 60

            [telemetry]
            refresh_interval_secs = 1

            [logging]
            format = "pretty"

            [api]
            listen = "127.0.0.1:5001"
            history_limit = 25
        "#
        .parse()
        .unwrap();
        assert_eq!(config.engine.scratch_dir, PathBuf::from("/tmp/mayhem"));
        assert_eq!(config.engine.max_concurrent.get("cpu"), Some(&2));
        assert_eq!(config.ledger.backend, LedgerBackend::Jsonl);
        assert_eq!(config.ledger.prune_interval, Duration::from_secs(60));
        assert_eq!(config.telemetry.refresh_interval, Duration::from_secs(1));
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert_eq!(config.api.listen.port(), 5001);
    }

    #[test]
    fn rejects_unknown_concurrency_kind() {
        let err = r#"
            [engine.max_concurrent]
            gpu = 1
        "#
        .parse::<AppConfig>()
        .unwrap_err();
        assert!(err.to_string().contains("gpu"));
    }

    #[test]
    fn jsonl_backend_requires_path() {
        let err = r#"
            [ledger]
            backend = "jsonl"
        "#
        .parse::<AppConfig>()
        .unwrap_err();
        assert!(err.to_string().contains("ledger.path"));
    }

    #[test]
    fn missing_candidates_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = AppConfig::load_with_source(&[dir.path().join("absent.toml")]).unwrap();
        assert!(loaded.source.is_none());
        assert_eq!(loaded.config.api.history_limit, 10);
    }

    #[test]
    fn load_takes_the_first_existing_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("mayhem.toml");
        std::fs::write(&present, "[api]\nhistory_limit = 42\n").unwrap();
        let config = AppConfig::load(&[dir.path().join("absent.toml"), present]).unwrap();
        assert_eq!(config.api.history_limit, 42);
    }
}
