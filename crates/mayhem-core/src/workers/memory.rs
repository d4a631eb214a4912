//! ---
//! mayhem_section: "07-fault-injection"
//! mayhem_subsection: "module"
//! mayhem_type: "source"
//! mayhem_scope: "code"
//! mayhem_description: "Resource pressure workers."
//! mayhem_version: "v0.1.0"
//! mayhem_owner: "tbd"
//! ---
use std::collections::TryReserveError;
use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::WorkloadError;

/// Byte pattern written into every chunk so pages are actually committed.
const FILL_BYTE: u8 = 0xA5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryPressure {
    /// Upper bound of chunks allocated during the run.
    pub total_chunks: u64,
    pub chunk_bytes: usize,
    pub duration: Duration,
    pub max_pacing: Duration,
}

impl MemoryPressure {
    /// Delay between two allocations so that `total_chunks` roughly spreads
    /// over `duration`, capped by `max_pacing`.
    pub fn pacing(&self) -> Duration {
        if self.total_chunks == 0 {
            return self.max_pacing;
        }
        let per_chunk = self.duration.as_nanos() / u128::from(self.total_chunks);
        Duration::from_nanos(u64::try_from(per_chunk).unwrap_or(u64::MAX)).min(self.max_pacing)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryReport {
    pub chunks: u64,
    pub bytes: u64,
}

impl fmt::Display for MemoryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "held {} chunk(s), {} KiB in total",
            self.chunks,
            self.bytes / 1024
        )
    }
}

/// Allocate chunks at a paced rate, keep them until the deadline, then drop them.
///
/// Allocation failures are fallible reservations, so exhaustion surfaces as
/// [`WorkloadError::Allocation`] instead of aborting the process. Everything
/// retained so far is released when this function returns.
pub fn hold(pressure: &MemoryPressure) -> Result<MemoryReport, WorkloadError> {
    let deadline = Instant::now() + pressure.duration;
    let pacing = pressure.pacing();
    let mut retained: Vec<Vec<u8>> = Vec::new();
    let mut allocated = 0u64;

    while allocated < pressure.total_chunks && Instant::now() < deadline {
        let exhausted = |source| WorkloadError::Allocation {
            allocated_chunks: allocated,
            source,
        };
        retained.try_reserve(1).map_err(exhausted)?;
        let chunk = allocate_chunk(pressure.chunk_bytes).map_err(exhausted)?;
        retained.push(chunk);
        allocated += 1;
        if !pacing.is_zero() {
            thread::sleep(pacing);
        }
    }

    thread::sleep(deadline.saturating_duration_since(Instant::now()));
    let bytes = allocated.saturating_mul(pressure.chunk_bytes as u64);
    debug!(chunks = allocated, bytes, "releasing memory pressure");
    drop(retained);
    Ok(MemoryReport {
        chunks: allocated,
        bytes,
    })
}

fn allocate_chunk(size: usize) -> Result<Vec<u8>, TryReserveError> {
    let mut chunk = Vec::new();
    chunk.try_reserve_exact(size)?;
    chunk.resize(size, FILL_BYTE);
    Ok(chunk)
}
