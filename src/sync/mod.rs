//! Synchronization module
//! 
//! This module holds the clock filter, the conductor's master clock, the
//! performer's phase reconstructor and the phase-triggered event scheduler.

pub mod filter;
pub mod generator;
pub mod reconstructor;
pub mod scheduler;

pub use self::filter::{ClockFilter, ClockFilterState, ClockSample};
pub use self::generator::MasterClock;
pub use self::reconstructor::{PhaseReconstructor, SyncHealth};
pub use self::scheduler::{Callback, EventId, EventScheduler, FireInfo};

/// Notifications published by either role's clock
#[derive(Debug, Clone, PartialEq)]
pub enum ClockEvent {
    /// Local high-rate phase tick
    PhasorUpdate { phase: f64, cycle_freq: f64 },
    /// The phasor wrapped from near 1 to near 0
    CycleStart { cycle: u64 },
    /// A leader broadcast was applied (performer only)
    SyncUpdate {
        phase: f64,
        cycle_freq: f64,
        error: f64,
        confidence: f64,
    },
    /// No broadcast within the timeout (performer only)
    SyncLost,
    /// Broadcasts resumed after a loss (performer only)
    SyncRestored,
}

impl ClockEvent {
    /// Phase carried by the event, if any
    pub fn phase(&self) -> Option<f64> {
        match self {
            ClockEvent::PhasorUpdate { phase, .. } | ClockEvent::SyncUpdate { phase, .. } => {
                Some(*phase)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_phase() {
        let update = ClockEvent::PhasorUpdate {
            phase: 0.4,
            cycle_freq: 1.0,
        };
        assert_eq!(update.phase(), Some(0.4));
        assert_eq!(ClockEvent::SyncLost.phase(), None);
    }
}
