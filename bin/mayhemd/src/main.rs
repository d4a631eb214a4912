//! ---
//! mayhem_section: "01-core-functionality"
//! mayhem_subsection: "binary"
//! mayhem_type: "source"
//! mayhem_scope: "code"
//! mayhem_description: "Binary entrypoint for the Mayhem daemon."
//! mayhem_version: "v0.1.0"
//! mayhem_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use mayhem_api::{spawn_api_server, ApiServer, ApiState};
use mayhem_common::config::{AppConfig, LedgerBackend, LedgerConfig};
use mayhem_common::logging::{init_tracing, LogFormat};
use mayhem_core::{
    ChaosInjectionEngine, ChaosMetrics, ExperimentLedger, HostSampler, JsonlExperimentStore,
    MetricsSource, RiskAssessor, ScenarioRegistry, TelemetryHub, WorkerSettings, WorkloadPermits,
    MAX_DURATION_SECS,
};
use mayhem_metrics::{new_registry, spawn_http_server, DaemonMetrics};
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Longest time shutdown waits for running workloads before exiting anyway.
/// Covers the longest accepted workload plus time to record its outcome.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(MAX_DURATION_SECS.unsigned_abs() + 30);

#[derive(Debug, Parser)]
#[command(
    author,
    version = concat!("Mayhem ", env!("CARGO_PKG_VERSION")),
    about = "Mayhem chaos orchestration daemon",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_name = "FORMAT", help = "Override log format (structured-json or pretty)")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the daemon")]
    Run,
    #[command(about = "List registered scenario ids")]
    Scenarios,
    #[command(about = "Sample the host once and print a risk assessment")]
    Assess,
    #[command(about = "Load and validate the configuration, then exit")]
    CheckConfig,
}

fn build_profile() -> &'static str {
    if cfg!(debug_assertions) {
        "debug"
    } else {
        "release"
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/mayhem.toml"));

    let load_started = Instant::now();
    let loaded_config = AppConfig::load_with_source(&candidates)?;
    let mut config = loaded_config.config;
    let config_path = loaded_config.source;
    let load_duration = load_started.elapsed();

    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            init_tracing("mayhemd", &config.logging)?;
            info!(
                config_path = %config_path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "<defaults>".into()),
                "configuration loaded"
            );
            run_daemon(config, load_duration).await?
        }
        Commands::Scenarios => {
            for id in ScenarioRegistry::builtin().ids() {
                println!("{id}");
            }
        }
        Commands::Assess => {
            let sampler = HostSampler::new(config.telemetry.disk_mount.clone());
            let snapshot = tokio::task::spawn_blocking(move || sampler.snapshot())
                .await
                .context("host sampler task failed")??;
            let assessment = RiskAssessor::new().assess(&snapshot.usage());
            let report = serde_json::json!({
                "system_metrics": snapshot,
                "risk": assessment,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::CheckConfig => {
            config.validate()?;
            match &config_path {
                Some(path) => println!("configuration OK: {}", path.display()),
                None => println!("configuration OK: built-in defaults"),
            }
        }
    }

    Ok(())
}

async fn run_daemon(config: AppConfig, load_duration: Duration) -> Result<()> {
    let metrics_registry = new_registry();
    let daemon_metrics = DaemonMetrics::new(&metrics_registry)?;
    daemon_metrics.observe_config_load(load_duration.as_secs_f64());
    daemon_metrics.inc_start();
    daemon_metrics.set_build_info(env!("CARGO_PKG_VERSION"), build_profile());
    let chaos_metrics = ChaosMetrics::new(&metrics_registry)?;

    let metrics_server = if config.metrics.enabled {
        info!(address = %config.metrics.listen, "metrics exporter enabled");
        let server = spawn_http_server(metrics_registry.clone(), config.metrics.listen)?;
        daemon_metrics.set_component_up("exporter", true);
        Some(server)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let sampler: Arc<dyn MetricsSource> =
        Arc::new(HostSampler::new(config.telemetry.disk_mount.clone()));
    let hub = Arc::new(TelemetryHub::new(sampler).with_metrics(chaos_metrics.clone()));
    let refresh_task = hub.spawn_refresh(config.telemetry.refresh_interval);
    daemon_metrics.set_component_up("telemetry", true);

    let ledger = open_ledger(&config.ledger)?;
    let prune_task = spawn_pruner(ledger.clone(), &config.ledger);
    daemon_metrics.set_component_up("pruner", prune_task.is_some());

    let engine = Arc::new(
        ChaosInjectionEngine::new(Arc::new(ScenarioRegistry::builtin()), ledger, hub)
            .with_settings(WorkerSettings::from(&config.engine))
            .with_permits(WorkloadPermits::from_config(&config.engine.max_concurrent))
            .with_metrics(chaos_metrics),
    );
    info!(
        scenarios = engine.registry().len(),
        scratch_dir = %config.engine.scratch_dir.display(),
        "injection engine ready"
    );

    let mut api_server: Option<ApiServer> = None;
    if config.api.enabled {
        let state = Arc::new(ApiState::new(Arc::clone(&engine), config.api.history_limit));
        match spawn_api_server(state, config.api.listen) {
            Ok(server) => {
                info!(address = %server.addr(), "api server listening");
                daemon_metrics.set_component_up("api", true);
                api_server = Some(server);
            }
            Err(err) => {
                warn!(error = %err, "failed to start api server");
            }
        }
    } else {
        info!("api server disabled by configuration");
    }

    info!("daemon running; waiting for termination signal");
    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");

    if let Some(server) = api_server {
        server.shutdown().await?;
        daemon_metrics.set_component_up("api", false);
    }

    let active = engine.active_workloads();
    if active > 0 {
        info!(active_workloads = active, "waiting for running workloads to finish");
    }
    let drain_started = Instant::now();
    if tokio::time::timeout(DRAIN_TIMEOUT, engine.wait_idle())
        .await
        .is_err()
    {
        warn!(
            active_workloads = engine.active_workloads(),
            "workloads still running after drain timeout; exiting anyway"
        );
    }
    daemon_metrics.observe_drain(drain_started.elapsed().as_secs_f64());

    refresh_task.abort();
    daemon_metrics.set_component_up("telemetry", false);
    if let Some(task) = prune_task {
        task.abort();
        daemon_metrics.set_component_up("pruner", false);
    }

    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }

    Ok(())
}

fn open_ledger(config: &LedgerConfig) -> Result<ExperimentLedger> {
    match (config.backend, &config.path) {
        (LedgerBackend::Jsonl, Some(path)) => {
            let store = JsonlExperimentStore::open(path)
                .with_context(|| format!("failed to open ledger file {}", path.display()))?;
            info!(path = %store.path().display(), "experiment ledger backed by jsonl file");
            Ok(ExperimentLedger::spawn(store)?)
        }
        (LedgerBackend::Jsonl, None) => {
            anyhow::bail!("ledger.path is required when ledger.backend = \"jsonl\"")
        }
        (LedgerBackend::Memory, _) => {
            info!("experiment ledger kept in memory");
            Ok(ExperimentLedger::in_memory()?)
        }
    }
}

/// Periodically drop finished experiments older than the retention window.
fn spawn_pruner(ledger: ExperimentLedger, config: &LedgerConfig) -> Option<JoinHandle<()>> {
    if config.retention_days == 0 {
        info!("experiment retention disabled");
        return None;
    }
    let retention = chrono::Duration::days(config.retention_days as i64);
    let interval = config.prune_interval;
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let cutoff = Utc::now() - retention;
            match ledger.prune_older_than(cutoff).await {
                Ok(0) => {}
                Ok(removed) => {
                    info!(target: "mayhem::ledger", removed, cutoff = %cutoff, "pruned old experiments")
                }
                Err(err) => {
                    warn!(target: "mayhem::ledger", error = %err, "experiment pruning failed")
                }
            }
        }
    }))
}
