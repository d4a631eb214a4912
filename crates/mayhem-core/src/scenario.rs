//! ---
//! mayhem_section: "07-fault-injection"
//! mayhem_subsection: "module"
//! mayhem_type: "source"
//! mayhem_scope: "code"
//! mayhem_description: "Scenario catalogue and intensity tables."
//! mayhem_version: "v0.1.0"
//! mayhem_owner: "tbd"
//! ---
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Qualitative stress level requested by a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intensity {
    Low,
    Medium,
    High,
}

impl Intensity {
    pub const ALL: [Intensity; 3] = [Intensity::Low, Intensity::Medium, Intensity::High];

    pub fn as_str(&self) -> &'static str {
        match self {
            Intensity::Low => "low",
            Intensity::Medium => "medium",
            Intensity::High => "high",
        }
    }

    /// One level up, saturating at `High`.
    pub fn raised(self) -> Self {
        match self {
            Intensity::Low => Intensity::Medium,
            Intensity::Medium | Intensity::High => Intensity::High,
        }
    }

    /// One level down, saturating at `Low`.
    pub fn lowered(self) -> Self {
        match self {
            Intensity::High => Intensity::Medium,
            Intensity::Medium | Intensity::Low => Intensity::Low,
        }
    }
}

impl fmt::Display for Intensity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Intensity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Intensity::ALL
            .into_iter()
            .find(|level| level.as_str() == s)
            .ok_or_else(|| format!("unknown intensity: {}", s))
    }
}

/// Host resource a workload puts pressure on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Cpu,
    Memory,
    Disk,
    Network,
    Generic,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 5] = [
        ResourceKind::Cpu,
        ResourceKind::Memory,
        ResourceKind::Disk,
        ResourceKind::Network,
        ResourceKind::Generic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Cpu => "cpu",
            ResourceKind::Memory => "memory",
            ResourceKind::Disk => "disk",
            ResourceKind::Network => "network",
            ResourceKind::Generic => "generic",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown resource kind: {}", s))
    }
}

/// Numeric parameter per intensity level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct IntensityTable<T> {
    pub low: T,
    pub medium: T,
    pub high: T,
}

impl<T: Copy> IntensityTable<T> {
    pub const fn new(low: T, medium: T, high: T) -> Self {
        Self { low, medium, high }
    }

    pub fn get(&self, intensity: Intensity) -> T {
        match intensity {
            Intensity::Low => self.low,
            Intensity::Medium => self.medium,
            Intensity::High => self.high,
        }
    }
}

pub const CPU_THREADS: IntensityTable<usize> = IntensityTable::new(2, 4, 8);
/// Allocations per second of requested duration.
pub const MEMORY_CHUNKS_PER_SECOND: IntensityTable<u64> = IntensityTable::new(5_000, 10_000, 20_000);
pub const DISK_SIZE_MB: IntensityTable<u64> = IntensityTable::new(50, 100, 200);
pub const NETWORK_LATENCY_MS: IntensityTable<u64> = IntensityTable::new(100, 500, 1_000);
pub const GENERIC_DELAY_FRACTION: IntensityTable<f64> = IntensityTable::new(0.5, 0.75, 1.0);

/// Workload shape attached to a scenario. Dispatch matches on this exhaustively.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Workload {
    Cpu { threads: IntensityTable<usize> },
    Memory { chunks_per_second: IntensityTable<u64> },
    Disk { size_mb: IntensityTable<u64> },
    Network { latency_ms: IntensityTable<u64> },
    Generic { delay_fraction: IntensityTable<f64> },
}

impl Workload {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Workload::Cpu { .. } => ResourceKind::Cpu,
            Workload::Memory { .. } => ResourceKind::Memory,
            Workload::Disk { .. } => ResourceKind::Disk,
            Workload::Network { .. } => ResourceKind::Network,
            Workload::Generic { .. } => ResourceKind::Generic,
        }
    }

    /// Resolve the intensity table into the concrete plan a worker executes.
    pub fn plan(&self, intensity: Intensity, duration: Duration) -> WorkloadPlan {
        match self {
            Workload::Cpu { threads } => WorkloadPlan::Cpu {
                threads: threads.get(intensity),
                duration,
            },
            Workload::Memory { chunks_per_second } => WorkloadPlan::Memory {
                total_chunks: chunks_per_second
                    .get(intensity)
                    .saturating_mul(duration.as_secs().max(1)),
                duration,
            },
            Workload::Disk { size_mb } => WorkloadPlan::Disk {
                files: size_mb.get(intensity),
                hold: duration,
            },
            Workload::Network { latency_ms } => WorkloadPlan::Network {
                latency: Duration::from_millis(latency_ms.get(intensity)),
                duration,
            },
            Workload::Generic { delay_fraction } => WorkloadPlan::Generic {
                delay: duration.mul_f64(delay_fraction.get(intensity)),
            },
        }
    }
}

/// Concrete, intensity-resolved instructions for one worker run.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkloadPlan {
    Cpu { threads: usize, duration: Duration },
    Memory { total_chunks: u64, duration: Duration },
    /// `files` one-megabyte files held for `hold`.
    Disk { files: u64, hold: Duration },
    Network { latency: Duration, duration: Duration },
    Generic { delay: Duration },
}

impl WorkloadPlan {
    pub fn kind(&self) -> ResourceKind {
        match self {
            WorkloadPlan::Cpu { .. } => ResourceKind::Cpu,
            WorkloadPlan::Memory { .. } => ResourceKind::Memory,
            WorkloadPlan::Disk { .. } => ResourceKind::Disk,
            WorkloadPlan::Network { .. } => ResourceKind::Network,
            WorkloadPlan::Generic { .. } => ResourceKind::Generic,
        }
    }
}

/// Immutable catalogue entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScenarioDescriptor {
    pub id: String,
    /// Human label used in acknowledgements, e.g. "CPU spike".
    pub title: String,
    pub workload: Workload,
}

impl ScenarioDescriptor {
    pub fn new(id: impl Into<String>, title: impl Into<String>, workload: Workload) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            workload,
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.workload.kind()
    }
}

/// Scenarios that only exercise the generic delay workload.
pub const SIMULATION_ONLY: [(&str, &str); 8] = [
    ("network_partition", "Network partition"),
    ("container_restart", "Container restart"),
    ("ssl_certificate_expired", "SSL certificate expiry"),
    ("dns_failure", "DNS failure"),
    ("storage_corruption", "Storage corruption"),
    ("kubernetes_pod_eviction", "Kubernetes pod eviction"),
    ("service_discovery_failure", "Service discovery failure"),
    ("load_balancer_failure", "Load balancer failure"),
];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("scenario '{0}' is already registered")]
    Duplicate(String),
}

/// Maps scenario identifiers to descriptors. Listing order is insertion order
/// and never changes after startup.
#[derive(Debug, Clone, Default)]
pub struct ScenarioRegistry {
    scenarios: IndexMap<String, ScenarioDescriptor>,
}

impl ScenarioRegistry {
    /// Registry without any scenarios.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry holding the built-in catalogue.
    pub fn builtin() -> Self {
        let generic = || Workload::Generic {
            delay_fraction: GENERIC_DELAY_FRACTION,
        };
        let mut registry = Self::empty();
        let builtins = [
            ScenarioDescriptor::new(
                "cpu_spike",
                "CPU spike",
                Workload::Cpu {
                    threads: CPU_THREADS,
                },
            ),
            ScenarioDescriptor::new(
                "memory_leak",
                "Memory leak",
                Workload::Memory {
                    chunks_per_second: MEMORY_CHUNKS_PER_SECOND,
                },
            ),
            ScenarioDescriptor::new(
                "disk_fill",
                "Disk fill",
                Workload::Disk {
                    size_mb: DISK_SIZE_MB,
                },
            ),
            ScenarioDescriptor::new(
                "network_latency",
                "Network latency",
                Workload::Network {
                    latency_ms: NETWORK_LATENCY_MS,
                },
            ),
            ScenarioDescriptor::new("api_timeout", "API timeout", generic()),
            ScenarioDescriptor::new("process_kill", "Process kill", generic()),
            ScenarioDescriptor::new("database_slowdown", "Database slowdown", generic()),
        ];
        for descriptor in builtins
            .into_iter()
            .chain(SIMULATION_ONLY.iter().map(|(id, title)| {
                ScenarioDescriptor::new(*id, format!("{} (simulated)", title), generic())
            }))
        {
            registry.scenarios.insert(descriptor.id.clone(), descriptor);
        }
        registry
    }

    /// Add a scenario; identifiers must be unique.
    pub fn register(&mut self, descriptor: ScenarioDescriptor) -> Result<(), RegistryError> {
        if self.scenarios.contains_key(&descriptor.id) {
            return Err(RegistryError::Duplicate(descriptor.id));
        }
        self.scenarios.insert(descriptor.id.clone(), descriptor);
        Ok(())
    }

    pub fn resolve(&self, scenario_id: &str) -> Option<&ScenarioDescriptor> {
        self.scenarios.get(scenario_id)
    }

    pub fn contains(&self, scenario_id: &str) -> bool {
        self.scenarios.contains_key(scenario_id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.scenarios.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScenarioDescriptor> {
        self.scenarios.values()
    }

    pub fn len(&self) -> usize {
        self.scenarios.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }
}
