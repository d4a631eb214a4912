//! ---
//! mayhem_section: "03-observability"
//! mayhem_subsection: "module"
//! mayhem_type: "source"
//! mayhem_scope: "code"
//! mayhem_description: "Prometheus instrumentation for chaos injections."
//! mayhem_version: "v0.1.0"
//! mayhem_owner: "tbd"
//! ---
use mayhem_metrics::SharedRegistry;
use prometheus::{Gauge, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts};

use crate::ledger::ExperimentStatus;
use crate::scenario::ResourceKind;
use crate::telemetry::SystemSnapshot;

/// Injection, ledger and host metrics registered against the shared registry.
#[derive(Clone)]
pub struct ChaosMetrics {
    injections_total: IntCounterVec,
    experiments_finished_total: IntCounterVec,
    workload_duration_seconds: HistogramVec,
    workloads_in_flight: IntGauge,
    ledger_errors_total: IntCounterVec,
    snapshot_failures_total: IntCounter,
    host: HostGauges,
}

#[derive(Clone)]
struct HostGauges {
    cpu_percent: Gauge,
    memory_percent: Gauge,
    disk_percent: Gauge,
}

impl ChaosMetrics {
    pub fn new(registry: &SharedRegistry) -> prometheus::Result<Self> {
        let injections_total = IntCounterVec::new(
            Opts::new(
                "mayhem_injections_total",
                "Injection requests by scenario and admission outcome",
            ),
            &["scenario", "outcome"],
        )?;
        registry.register(Box::new(injections_total.clone()))?;

        let experiments_finished_total = IntCounterVec::new(
            Opts::new(
                "mayhem_experiments_finished_total",
                "Experiments that reached a terminal state",
            ),
            &["scenario", "status"],
        )?;
        registry.register(Box::new(experiments_finished_total.clone()))?;

        let workload_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "mayhem_workload_duration_seconds",
                "Wall-clock time spent inside pressure workers",
            )
            .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
            &["kind"],
        )?;
        registry.register(Box::new(workload_duration_seconds.clone()))?;

        let workloads_in_flight = IntGauge::with_opts(Opts::new(
            "mayhem_workloads_in_flight",
            "Dispatched workloads that have not finished yet",
        ))?;
        registry.register(Box::new(workloads_in_flight.clone()))?;

        let ledger_errors_total = IntCounterVec::new(
            Opts::new(
                "mayhem_ledger_errors_total",
                "Ledger operations that failed and were skipped",
            ),
            &["operation"],
        )?;
        registry.register(Box::new(ledger_errors_total.clone()))?;

        let snapshot_failures_total = IntCounter::with_opts(Opts::new(
            "mayhem_metrics_snapshot_failures_total",
            "System metric snapshots that could not be taken",
        ))?;
        registry.register(Box::new(snapshot_failures_total.clone()))?;

        let host = HostGauges {
            cpu_percent: gauge(registry, "system_cpu_percent", "Host CPU utilisation")?,
            memory_percent: gauge(registry, "system_memory_percent", "Host memory utilisation")?,
            disk_percent: gauge(registry, "system_disk_percent", "Watched disk utilisation")?,
        };

        Ok(Self {
            injections_total,
            experiments_finished_total,
            workload_duration_seconds,
            workloads_in_flight,
            ledger_errors_total,
            snapshot_failures_total,
            host,
        })
    }

    pub fn record_accepted(&self, scenario: &str) {
        self.injections_total
            .with_label_values(&[scenario, "accepted"])
            .inc();
    }

    pub fn record_rejected(&self, scenario: &str) {
        self.injections_total
            .with_label_values(&[scenario, "rejected"])
            .inc();
    }

    pub fn record_finished(&self, scenario: &str, status: ExperimentStatus) {
        self.experiments_finished_total
            .with_label_values(&[scenario, status.as_str()])
            .inc();
    }

    pub fn observe_workload(&self, kind: ResourceKind, seconds: f64) {
        self.workload_duration_seconds
            .with_label_values(&[kind.as_str()])
            .observe(seconds);
    }

    pub fn workload_started(&self) {
        self.workloads_in_flight.inc();
    }

    pub fn workload_finished(&self) {
        self.workloads_in_flight.dec();
    }

    pub fn record_ledger_error(&self, operation: &str) {
        self.ledger_errors_total.with_label_values(&[operation]).inc();
    }

    pub fn record_snapshot_failure(&self) {
        self.snapshot_failures_total.inc();
    }

    pub fn observe_host(&self, snapshot: &SystemSnapshot) {
        self.host.cpu_percent.set(snapshot.cpu_percent);
        self.host.memory_percent.set(snapshot.memory_percent);
        self.host.disk_percent.set(snapshot.disk_percent);
    }
}

fn gauge(registry: &SharedRegistry, name: &str, help: &str) -> prometheus::Result<Gauge> {
    let gauge = Gauge::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

impl std::fmt::Debug for ChaosMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaosMetrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mayhem_metrics::{encode_text, new_registry};

    #[test]
    fn metrics_render_with_expected_names() {
        let registry = new_registry();
        let metrics = ChaosMetrics::new(&registry).unwrap();
        metrics.record_accepted("cpu_spike");
        metrics.record_rejected("bogus");
        metrics.record_finished("cpu_spike", ExperimentStatus::Completed);
        metrics.observe_workload(ResourceKind::Cpu, 2.0);
        metrics.record_ledger_error("create");
        metrics.observe_host(&SystemSnapshot::with_usage(42.0, 55.0, 61.0));

        let body = encode_text(&registry).unwrap();
        assert!(body.contains(r#"mayhem_injections_total{outcome="accepted",scenario="cpu_spike"} 1"#));
        assert!(body.contains(r#"mayhem_experiments_finished_total{scenario="cpu_spike",status="completed"} 1"#));
        assert!(body.contains(r#"mayhem_ledger_errors_total{operation="create"} 1"#));
        assert!(body.contains("system_cpu_percent 42"));
        assert!(body.contains("system_memory_percent 55"));
        assert!(body.contains("system_disk_percent 61"));
    }

    #[test]
    fn double_registration_is_rejected() {
        let registry = new_registry();
        ChaosMetrics::new(&registry).unwrap();
        assert!(ChaosMetrics::new(&registry).is_err());
    }
}
