//! Build phase timing.

use std::fmt;
use std::time::{Duration, Instant};

use tracing::info;

/// How long one build phase took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseTime {
    pub phase: &'static str,
    pub elapsed: Duration,
}

impl fmt::Display for PhaseTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<12} {:>8.2}s", self.phase, self.elapsed.as_secs_f64())
    }
}

/// Measures one build phase.
pub struct Timer {
    phase: &'static str,
    start: Instant,
}

impl Timer {
    pub fn start(phase: &'static str) -> Self {
        Self {
            phase,
            start: Instant::now(),
        }
    }

    /// Stop the clock and log the phase with its duration.
    pub fn finish(self) -> PhaseTime {
        let elapsed = self.start.elapsed();
        info!(
            phase = self.phase,
            elapsed_ms = elapsed.as_millis() as u64,
            "phase finished"
        );
        PhaseTime {
            phase: self.phase,
            elapsed,
        }
    }
}
