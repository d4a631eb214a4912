//! ---
//! mayhem_section: "03-observability"
//! mayhem_subsection: "module"
//! mayhem_type: "source"
//! mayhem_scope: "code"
//! mayhem_description: "Host telemetry sampling and snapshot cache."
//! mayhem_version: "v0.1.0"
//! mayhem_owner: "tbd"
//! ---
//! Host telemetry.
//!
//! [`HostSampler`] reads CPU, memory, disk, network and process figures
//! through `sysinfo`. [`TelemetryHub`] keeps the latest snapshot behind an
//! `Arc` so request handlers read it without waiting on a sample, and a
//! background task refreshes it on a fixed interval.
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sysinfo::{Disk, Disks, Networks, ProcessesToUpdate, System};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::MetricsUnavailableError;
use crate::metrics::ChaosMetrics;
use crate::risk::ResourceUsage;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkCounters {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub rss_bytes: u64,
    pub active_processes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoadAverage {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

/// Point-in-time host figures. A non-empty `errors` list marks a partial
/// snapshot whose missing figures are reported as zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub network: NetworkCounters,
    pub process: ProcessInfo,
    #[serde(default)]
    pub load_average: Option<LoadAverage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl SystemSnapshot {
    /// Snapshot carrying only utilisation percentages.
    pub fn with_usage(cpu_percent: f64, memory_percent: f64, disk_percent: f64) -> Self {
        Self {
            timestamp: Utc::now(),
            cpu_percent,
            memory_percent,
            disk_percent,
            memory_used_bytes: 0,
            memory_total_bytes: 0,
            network: NetworkCounters::default(),
            process: ProcessInfo::default(),
            load_average: None,
            errors: Vec::new(),
        }
    }

    pub fn usage(&self) -> ResourceUsage {
        ResourceUsage {
            cpu_percent: self.cpu_percent,
            memory_percent: self.memory_percent,
            disk_percent: self.disk_percent,
        }
    }

    pub fn is_partial(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Provider of host snapshots.
pub trait MetricsSource: Send + Sync + 'static {
    fn snapshot(&self) -> Result<SystemSnapshot, MetricsUnavailableError>;
}

/// `sysinfo`-backed sampler. CPU usage is a delta between refreshes, so the
/// sampler keeps its `System` across calls.
pub struct HostSampler {
    system: Mutex<System>,
    disk_mount: Option<PathBuf>,
}

impl HostSampler {
    pub fn new(disk_mount: Option<PathBuf>) -> Self {
        let mut system = System::new();
        system.refresh_cpu_all();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
            disk_mount,
        }
    }
}

impl Default for HostSampler {
    fn default() -> Self {
        Self::new(None)
    }
}

impl std::fmt::Debug for HostSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostSampler")
            .field("disk_mount", &self.disk_mount)
            .finish_non_exhaustive()
    }
}

impl MetricsSource for HostSampler {
    #[allow(clippy::cast_precision_loss)]
    fn snapshot(&self) -> Result<SystemSnapshot, MetricsUnavailableError> {
        let mut errors = Vec::new();
        let mut system = self.system.lock();
        system.refresh_cpu_all();
        system.refresh_memory();
        system.refresh_processes(ProcessesToUpdate::All, true);

        let cpu_percent = f64::from(system.global_cpu_usage());
        let memory_total_bytes = system.total_memory();
        let memory_used_bytes = system.used_memory();
        let memory_percent = if memory_total_bytes > 0 {
            memory_used_bytes as f64 / memory_total_bytes as f64 * 100.0
        } else {
            errors.push("memory totals unavailable".to_owned());
            0.0
        };

        let process = match sysinfo::get_current_pid() {
            Ok(pid) => ProcessInfo {
                pid: pid.as_u32(),
                rss_bytes: system.process(pid).map(sysinfo::Process::memory).unwrap_or(0),
                active_processes: system.processes().len(),
            },
            Err(err) => {
                errors.push(format!("current pid unavailable: {err}"));
                ProcessInfo {
                    active_processes: system.processes().len(),
                    ..ProcessInfo::default()
                }
            }
        };
        drop(system);

        let disk = disk_usage(self.disk_mount.as_deref());
        if disk.is_none() {
            errors.push("no disk matched the watched mount".to_owned());
        }
        if disk.is_none() && memory_total_bytes == 0 {
            return Err(MetricsUnavailableError::new(errors.join("; ")));
        }
        let disk_percent = disk.unwrap_or(0.0);

        let networks = Networks::new_with_refreshed_list();
        let network = networks
            .list()
            .values()
            .fold(NetworkCounters::default(), |acc, data| NetworkCounters {
                bytes_sent: acc.bytes_sent + data.total_transmitted(),
                bytes_recv: acc.bytes_recv + data.total_received(),
            });

        let load = System::load_average();
        let load_average = (load.one >= 0.0).then_some(LoadAverage {
            one: load.one,
            five: load.five,
            fifteen: load.fifteen,
        });

        Ok(SystemSnapshot {
            timestamp: Utc::now(),
            cpu_percent,
            memory_percent,
            disk_percent,
            memory_used_bytes,
            memory_total_bytes,
            network,
            process,
            load_average,
            errors,
        })
    }
}

/// Usage of the disk mounted at `mount`, or of the root filesystem (falling
/// back to the first listed disk) when no mount is configured.
#[allow(clippy::cast_precision_loss)]
fn disk_usage(mount: Option<&Path>) -> Option<f64> {
    let disks = Disks::new_with_refreshed_list();
    let disk = select_disk(disks.list(), mount, Disk::mount_point)?;
    let total = disk.total_space();
    if total == 0 {
        return None;
    }
    let used = total.saturating_sub(disk.available_space());
    Some(used as f64 / total as f64 * 100.0)
}

fn select_disk<'a, D>(
    disks: &'a [D],
    mount: Option<&Path>,
    mount_point: impl Fn(&D) -> &Path,
) -> Option<&'a D> {
    match mount {
        Some(mount) => disks.iter().find(|disk| mount_point(disk) == mount),
        None => disks
            .iter()
            .find(|disk| mount_point(disk) == Path::new("/"))
            .or_else(|| disks.first()),
    }
}

/// Fixed snapshot source for tests and one-shot tooling.
#[derive(Debug)]
pub struct StaticMetricsSource {
    current: Mutex<Result<SystemSnapshot, MetricsUnavailableError>>,
}

impl StaticMetricsSource {
    pub fn new(snapshot: SystemSnapshot) -> Self {
        Self {
            current: Mutex::new(Ok(snapshot)),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            current: Mutex::new(Err(MetricsUnavailableError::new(message))),
        }
    }

    pub fn set(&self, snapshot: SystemSnapshot) {
        *self.current.lock() = Ok(snapshot);
    }

    pub fn fail(&self, message: impl Into<String>) {
        *self.current.lock() = Err(MetricsUnavailableError::new(message));
    }
}

impl MetricsSource for StaticMetricsSource {
    fn snapshot(&self) -> Result<SystemSnapshot, MetricsUnavailableError> {
        self.current.lock().clone()
    }
}

/// Cached view over a [`MetricsSource`].
pub struct TelemetryHub {
    source: Arc<dyn MetricsSource>,
    latest: RwLock<Option<Arc<SystemSnapshot>>>,
    metrics: Option<ChaosMetrics>,
}

impl TelemetryHub {
    pub fn new(source: Arc<dyn MetricsSource>) -> Self {
        Self {
            source,
            latest: RwLock::new(None),
            metrics: None,
        }
    }

    /// Mirror every refreshed snapshot into the host gauges.
    pub fn with_metrics(mut self, metrics: ChaosMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Latest cached snapshot. Never samples.
    pub fn latest(&self) -> Result<Arc<SystemSnapshot>, MetricsUnavailableError> {
        self.latest
            .read()
            .clone()
            .ok_or_else(|| MetricsUnavailableError::new("no system sample collected yet"))
    }

    /// Sample the source now and publish the result. On failure the previous
    /// snapshot stays in place.
    pub fn refresh(&self) -> Result<Arc<SystemSnapshot>, MetricsUnavailableError> {
        let snapshot = match self.source.snapshot() {
            Ok(snapshot) => Arc::new(snapshot),
            Err(err) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_snapshot_failure();
                }
                return Err(err);
            }
        };
        if snapshot.is_partial() {
            debug!(target: "mayhem::telemetry", errors = ?snapshot.errors, "partial system snapshot");
        }
        if let Some(metrics) = &self.metrics {
            metrics.observe_host(&snapshot);
        }
        *self.latest.write() = Some(Arc::clone(&snapshot));
        Ok(snapshot)
    }

    /// Refresh on `interval` until the returned task is aborted. Sampling
    /// runs on the blocking pool. The first sample is taken one interval
    /// after the call, and never before sysinfo's minimum CPU update
    /// interval has passed.
    pub fn spawn_refresh(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        let first = tokio::time::Instant::now()
            + interval.max(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(first, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let worker = Arc::clone(&hub);
                match tokio::task::spawn_blocking(move || worker.refresh()).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => {
                        warn!(target: "mayhem::telemetry", error = %err, "system sample failed")
                    }
                    Err(err) => {
                        warn!(target: "mayhem::telemetry", error = %err, "system sampler task aborted")
                    }
                }
            }
        })
    }
}

impl MetricsSource for TelemetryHub {
    fn snapshot(&self) -> Result<SystemSnapshot, MetricsUnavailableError> {
        self.latest().map(|snapshot| snapshot.as_ref().clone())
    }
}

impl std::fmt::Debug for TelemetryHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryHub")
            .field("has_sample", &self.latest.read().is_some())
            .finish_non_exhaustive()
    }
}
