//! ---
//! mayhem_section: "03-observability"
//! mayhem_subsection: "module"
//! mayhem_type: "source"
//! mayhem_scope: "code"
//! mayhem_description: "Metrics registry and export utilities."
//! mayhem_version: "v0.1.0"
//! mayhem_owner: "tbd"
//! ---
//! The registry is created once by the daemon and handed to every component
//! that records metrics; nothing in the workspace registers against the
//! prometheus default registry.
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::core::Collector;
use prometheus::{
    GaugeVec, Histogram, HistogramOpts, IntCounter, IntGaugeVec, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across services.
pub type SharedRegistry = Arc<Registry>;

pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Register `collector` and hand back a clone for recording.
pub fn register<C>(registry: &Registry, collector: C) -> prometheus::Result<C>
where
    C: Collector + Clone + 'static,
{
    registry.register(Box::new(collector.clone()))?;
    Ok(collector)
}

/// Encode every family in the registry using the Prometheus text format.
pub fn encode_text(registry: &Registry) -> Result<String> {
    TextEncoder::new()
        .encode_to_string(&registry.gather())
        .context("failed to encode metrics")
}

/// Serve `registry` at `GET /metrics` on `addr` until shut down.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {addr}"))?;
    std_listener
        .set_nonblocking(true)
        .context("failed to configure metrics listener as non-blocking")?;
    let bound = std_listener
        .local_addr()
        .context("failed to resolve metrics listener address")?;
    let listener =
        TcpListener::from_std(std_listener).context("failed to create tokio listener")?;

    let app = Router::new()
        .route("/metrics", get(scrape))
        .with_state(registry);
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let task: JoinHandle<Result<()>> = tokio::spawn(async move {
        info!(address = %bound, "metrics exporter listening");
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics exporter encountered an error")
    });

    Ok(MetricsServer {
        addr: bound,
        shutdown: Some(shutdown_tx),
        task,
    })
}

async fn scrape(State(registry): State<SharedRegistry>) -> Response {
    match encode_text(&registry) {
        Ok(body) => ([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response(),
        Err(err) => {
            error!(error = %err, "metrics scrape failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error").into_response()
        }
    }
}

/// Handle to the running `/metrics` exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting scrapes and wait for the server task.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.task.await.context("metrics exporter task panicked")?
    }
}

/// Daemon lifecycle metrics: start-ups, configuration load time, build
/// metadata, which components came up, and how long shutdown spent draining
/// running workloads.
#[derive(Clone)]
pub struct DaemonMetrics {
    starts_total: IntCounter,
    config_load_seconds: Histogram,
    build_info: GaugeVec,
    component_up: IntGaugeVec,
    drain_seconds: Histogram,
}

impl DaemonMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let starts_total = register(
            registry,
            IntCounter::with_opts(Opts::new(
                "mayhemd_starts_total",
                "Times the Mayhem daemon has initialised",
            ))?,
        )?;
        let load_buckets = prometheus::exponential_buckets(0.001, 2.0, 16)
            .context("failed to construct config load buckets")?;
        let config_load_seconds = register(
            registry,
            Histogram::with_opts(
                HistogramOpts::new(
                    "mayhemd_config_load_seconds",
                    "Time spent loading and validating configuration",
                )
                .buckets(load_buckets),
            )?,
        )?;
        let build_info = register(
            registry,
            GaugeVec::new(
                Opts::new("mayhemd_build_info", "Version and profile of the running daemon"),
                &["version", "profile"],
            )?,
        )?;
        let component_up = register(
            registry,
            IntGaugeVec::new(
                Opts::new(
                    "mayhemd_component_up",
                    "1 while a daemon component (api, exporter, telemetry, pruner) is running",
                ),
                &["component"],
            )?,
        )?;
        let drain_buckets = prometheus::exponential_buckets(0.01, 2.0, 14)
            .context("failed to construct drain buckets")?;
        let drain_seconds = register(
            registry,
            Histogram::with_opts(
                HistogramOpts::new(
                    "mayhemd_shutdown_drain_seconds",
                    "Time shutdown waited for in-flight workloads",
                )
                .buckets(drain_buckets),
            )?,
        )?;

        Ok(Self {
            starts_total,
            config_load_seconds,
            build_info,
            component_up,
            drain_seconds,
        })
    }

    pub fn inc_start(&self) {
        self.starts_total.inc();
    }

    pub fn observe_config_load(&self, seconds: f64) {
        self.config_load_seconds.observe(seconds);
    }

    pub fn set_build_info(&self, version: &str, profile: &str) {
        self.build_info
            .with_label_values(&[version, profile])
            .set(1.0);
    }

    pub fn set_component_up(&self, component: &str, up: bool) {
        self.component_up
            .with_label_values(&[component])
            .set(i64::from(up));
    }

    pub fn observe_drain(&self, seconds: f64) {
        self.drain_seconds.observe(seconds);
    }
}

impl std::fmt::Debug for DaemonMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonMetrics").finish_non_exhaustive()
    }
}

pub use prometheus;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daemon_metrics_register_once() {
        let registry = new_registry();
        let metrics = DaemonMetrics::new(&registry).unwrap();
        metrics.inc_start();
        metrics.set_build_info("0.1.0", "debug");
        metrics.set_component_up("api", true);
        metrics.set_component_up("pruner", false);
        let body = encode_text(&registry).unwrap();
        assert!(body.contains("mayhemd_starts_total 1"));
        assert!(body.contains(r#"mayhemd_component_up{component="api"} 1"#));
        assert!(body.contains(r#"mayhemd_component_up{component="pruner"} 0"#));
        assert!(DaemonMetrics::new(&registry).is_err());
    }

    #[tokio::test]
    async fn exporter_serves_registry() {
        let registry = new_registry();
        let metrics = DaemonMetrics::new(&registry).unwrap();
        metrics.inc_start();
        metrics.observe_drain(0.25);
        let server = spawn_http_server(registry, "127.0.0.1:0".parse().unwrap()).unwrap();
        let response = reqwest::get(format!("http://{}/metrics", server.addr()))
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
        let body = response.text().await.unwrap();
        assert!(body.contains("mayhemd_starts_total"));
        assert!(body.contains("mayhemd_shutdown_drain_seconds_count 1"));
        server.shutdown().await.unwrap();
    }
}
