//! ---
//! mayhem_section: "07-fault-injection"
//! mayhem_subsection: "module"
//! mayhem_type: "source"
//! mayhem_scope: "code"
//! mayhem_description: "Resource pressure workers."
//! mayhem_version: "v0.1.0"
//! mayhem_owner: "tbd"
//! ---
//! Timing-only workloads: simulated network round trips and plain stalls.
use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundTripReport {
    pub latency: Duration,
    pub round_trips: u64,
}

impl fmt::Display for RoundTripReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "simulated {} round trip(s) at {} ms latency",
            self.round_trips,
            self.latency.as_millis()
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StallReport {
    pub delay: Duration,
}

impl fmt::Display for StallReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stalled for {} ms", self.delay.as_millis())
    }
}

/// Sleep in `latency`-sized steps until `duration` has elapsed. The last step
/// is shortened so the total never overshoots the deadline.
pub fn round_trips(latency: Duration, duration: Duration) -> RoundTripReport {
    let deadline = Instant::now() + duration;
    if latency.is_zero() {
        thread::sleep(duration);
        return RoundTripReport {
            latency,
            round_trips: 0,
        };
    }
    let mut count = 0u64;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        thread::sleep(latency.min(remaining));
        count += 1;
    }
    RoundTripReport {
        latency,
        round_trips: count,
    }
}

pub fn stall(delay: Duration) -> StallReport {
    thread::sleep(delay);
    StallReport { delay }
}
