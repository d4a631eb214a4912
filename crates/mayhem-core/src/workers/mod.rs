//! ---
//! mayhem_section: "07-fault-injection"
//! mayhem_subsection: "module"
//! mayhem_type: "source"
//! mayhem_scope: "code"
//! mayhem_description: "Resource pressure workers."
//! mayhem_version: "v0.1.0"
//! mayhem_owner: "tbd"
//! ---
//! Blocking routines that put bounded pressure on one host resource.
//!
//! Every worker runs on the calling thread until its plan is exhausted and
//! reports exactly one outcome. Workers own everything they allocate or
//! create and release it before returning, on success and on failure alike.
use std::any::Any;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use mayhem_common::config::EngineConfig;
use serde::Serialize;

use crate::error::WorkloadError;
use crate::scenario::{ResourceKind, WorkloadPlan};

pub mod cpu;
pub mod delay;
pub mod disk;
pub mod memory;

pub use cpu::CpuSpinReport;
pub use delay::{RoundTripReport, StallReport};
pub use disk::{DiskFillPlan, DiskFillReport, OsScratchFs, ScratchFs};
pub use memory::{MemoryPressure, MemoryReport};

/// Host-specific knobs shared by every worker.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub scratch_dir: PathBuf,
    pub memory_chunk_bytes: usize,
    pub max_pacing: Duration,
}

impl From<&EngineConfig> for WorkerSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            scratch_dir: config.scratch_dir.clone(),
            memory_chunk_bytes: config.memory_chunk_bytes,
            max_pacing: config.max_pacing,
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

/// Successful worker outcome.
#[derive(Debug, Clone, Serialize)]
pub struct WorkloadReport {
    pub kind: ResourceKind,
    pub summary: String,
    #[serde(rename = "elapsed_ms", serialize_with = "serialize_millis")]
    pub elapsed: Duration,
}

fn serialize_millis<S: serde::Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(value.as_millis() as u64)
}

/// Execute `plan` on the current thread. `tag` disambiguates on-disk
/// artifacts of concurrently running disk workloads.
pub fn run(
    plan: &WorkloadPlan,
    settings: &WorkerSettings,
    tag: &str,
) -> Result<WorkloadReport, WorkloadError> {
    let started = Instant::now();
    let summary = match plan {
        WorkloadPlan::Cpu { threads, duration } => cpu::spin(*threads, *duration)?.to_string(),
        WorkloadPlan::Memory {
            total_chunks,
            duration,
        } => memory::hold(&MemoryPressure {
            total_chunks: *total_chunks,
            chunk_bytes: settings.memory_chunk_bytes,
            duration: *duration,
            max_pacing: settings.max_pacing,
        })?
        .to_string(),
        WorkloadPlan::Disk { files, hold } => {
            let fill = DiskFillPlan::new(settings.scratch_dir.clone(), tag, *files, *hold);
            disk::fill(&fill, &OsScratchFs)?.to_string()
        }
        WorkloadPlan::Network { latency, duration } => {
            delay::round_trips(*latency, *duration).to_string()
        }
        WorkloadPlan::Generic { delay } => delay::stall(*delay).to_string(),
    };
    Ok(WorkloadReport {
        kind: plan.kind(),
        summary,
        elapsed: started.elapsed(),
    })
}

/// Render a panic payload captured from a worker thread.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_reports_kind_and_summary() {
        let settings = WorkerSettings::default();
        let report = run(
            &WorkloadPlan::Generic {
                delay: Duration::from_millis(10),
            },
            &settings,
            "unit",
        )
        .unwrap();
        assert_eq!(report.kind, ResourceKind::Generic);
        assert!(report.elapsed >= Duration::from_millis(10));
        assert!(report.summary.contains("stalled"));
    }

    #[test]
    fn run_disk_plan_leaves_no_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let settings = WorkerSettings {
            scratch_dir: dir.path().to_path_buf(),
            ..WorkerSettings::default()
        };
        let report = run(
            &WorkloadPlan::Disk {
                files: 2,
                hold: Duration::ZERO,
            },
            &settings,
            "unit",
        )
        .unwrap();
        assert_eq!(report.kind, ResourceKind::Disk);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn panic_payloads_are_rendered() {
        let payload = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(payload), "boom");
    }
}
