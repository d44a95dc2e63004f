//! Time sources and timers
//! 
//! Components never sleep. They read the current time from a [`Clock`] and
//! park future work in a [`Timers`] queue that the node's event loop polls.
//! Swapping [`SystemClock`] for [`ManualClock`] makes every cadence
//! (heartbeats, sync broadcasts, election windows, phase ticks) reproducible.

mod clock;
mod timer;

pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::timer::{TimerId, Timers};
