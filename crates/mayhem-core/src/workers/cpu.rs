//! ---
//! mayhem_section: "07-fault-injection"
//! mayhem_subsection: "module"
//! mayhem_type: "source"
//! mayhem_scope: "code"
//! mayhem_description: "Resource pressure workers."
//! mayhem_version: "v0.1.0"
//! mayhem_owner: "tbd"
//! ---
use std::fmt;
use std::hint::black_box;
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use super::panic_message;
use crate::error::WorkloadError;

/// Inner loop length between two deadline checks.
const SPIN_BATCH: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuSpinReport {
    pub threads: usize,
    pub batches: u64,
}

impl fmt::Display for CpuSpinReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "spun {} thread(s) for {} busy batches",
            self.threads, self.batches
        )
    }
}

/// Busy-loop `threads` OS threads until `duration` elapses, then join them all.
pub fn spin(threads: usize, duration: Duration) -> Result<CpuSpinReport, WorkloadError> {
    let deadline = Instant::now() + duration;
    let mut handles = Vec::with_capacity(threads);
    let mut spawn_error = None;
    for index in 0..threads {
        let spawned = thread::Builder::new()
            .name(format!("mayhem-cpu-{index}"))
            .spawn(move || spin_until(deadline));
        match spawned {
            Ok(handle) => handles.push(handle),
            Err(err) => {
                spawn_error = Some(err);
                break;
            }
        }
    }

    // Spinners already started stop on their own at the deadline; join them
    // before reporting so no thread outlives the workload.
    let started_threads = handles.len();
    let mut batches = 0u64;
    let mut panicked = None;
    for handle in handles {
        match handle.join() {
            Ok(count) => batches += count,
            Err(payload) => panicked = Some(panic_message(payload)),
        }
    }

    if let Some(err) = spawn_error {
        return Err(WorkloadError::Spawn(err));
    }
    if let Some(message) = panicked {
        return Err(WorkloadError::Panicked(message));
    }
    debug!(threads = started_threads, batches, "cpu spin finished");
    Ok(CpuSpinReport {
        threads: started_threads,
        batches,
    })
}

fn spin_until(deadline: Instant) -> u64 {
    let mut batches = 0u64;
    let mut acc = 0u64;
    while Instant::now() < deadline {
        for i in 0..SPIN_BATCH {
            acc = black_box(acc.wrapping_mul(31).wrapping_add(i));
        }
        batches += 1;
    }
    black_box(acc);
    batches
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spins_requested_threads_until_deadline() {
        let started = Instant::now();
        let report = spin(2, Duration::from_millis(50)).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(report.threads, 2);
        assert!(report.batches > 0);
    }

    #[test]
    fn zero_duration_returns_immediately() {
        let report = spin(1, Duration::ZERO).unwrap();
        assert_eq!(report.threads, 1);
        assert_eq!(report.batches, 0);
    }
}
