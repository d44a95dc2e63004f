use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::core::{Error, Result};
use crate::protocol::Message;
use crate::time::Timers;
use crate::util::ms_to_secs;
use super::ClockEvent;

#[derive(Debug, Clone, Copy, PartialEq)]
enum GeneratorTimer {
    Tick,
    Broadcast,
}

/// Authoritative phasor on the conductor
///
/// Phase advances by `cycle_freq * elapsed_seconds` measured on the wall
/// clock, so irregular tick timing never accumulates error.
pub struct MasterClock {
    phase: f64,
    cycle_freq: f64,
    running: bool,
    last_advance: Option<f64>,
    started_at: f64,
    cycles: u64,
    tick_ms: f64,
    broadcast_ms: f64,
    timers: Timers<GeneratorTimer>,
    events: broadcast::Sender<ClockEvent>,
}

impl MasterClock {
    /// Creates a stopped generator at phase 0
    pub fn new(tick_interval: Duration, broadcast_interval: Duration) -> Self {
        let (events, _) = broadcast::channel(256);
        MasterClock {
            phase: 0.0,
            cycle_freq: 0.0,
            running: false,
            last_advance: None,
            started_at: 0.0,
            cycles: 0,
            tick_ms: tick_interval.as_secs_f64() * 1000.0,
            broadcast_ms: broadcast_interval.as_secs_f64() * 1000.0,
            timers: Timers::new(),
            events,
        }
    }

    /// Subscribes to phasor notifications
    pub fn subscribe(&self) -> broadcast::Receiver<ClockEvent> {
        self.events.subscribe()
    }

    /// Starts advancing with the given cycle length
    pub fn start(&mut self, cycle_duration_secs: f64, now: f64) -> Result<()> {
        self.cycle_freq = frequency_of(cycle_duration_secs)?;
        if self.running {
            return Ok(());
        }

        info!(cycle_freq = self.cycle_freq, "master clock started");
        self.running = true;
        self.started_at = now;
        self.last_advance = Some(now);
        self.timers.clear();
        self.timers.schedule(now + self.tick_ms, GeneratorTimer::Tick);
        self.timers.schedule(now, GeneratorTimer::Broadcast);
        Ok(())
    }

    /// Freezes the phase and cancels the cadences
    pub fn stop(&mut self) {
        if self.running {
            info!(phase = self.phase, "master clock stopped");
        }
        self.running = false;
        self.last_advance = None;
        self.timers.clear();
    }

    /// Changes the cycle length without a phase discontinuity
    pub fn set_cycle_duration(&mut self, cycle_duration_secs: f64, now: f64) -> Result<()> {
        let freq = frequency_of(cycle_duration_secs)?;
        self.advance(now);
        debug!(from = self.cycle_freq, to = freq, "cycle frequency changed");
        self.cycle_freq = freq;
        Ok(())
    }

    /// Whether the generator is running
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Current phase in [0, 1)
    pub fn phasor(&self) -> f64 {
        self.phase
    }

    /// Cycles per second
    pub fn cycle_freq(&self) -> f64 {
        self.cycle_freq
    }

    /// Completed cycles since start
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Seconds since start, the stand-in audio clock carried in broadcasts
    pub fn audio_time(&self, now: f64) -> f64 {
        if self.running {
            ms_to_secs(now - self.started_at).max(0.0)
        } else {
            0.0
        }
    }

    /// Moves the phase up to `now`, emitting `CycleStart` on wraparound
    pub fn advance(&mut self, now: f64) {
        let Some(last) = self.last_advance else {
            return;
        };
        let elapsed = ms_to_secs(now - last);
        if elapsed <= 0.0 {
            return;
        }
        self.last_advance = Some(now);

        let raw = self.phase + self.cycle_freq * elapsed;
        let wraps = raw.floor();
        self.phase = crate::util::wrap_phase(raw);
        if wraps >= 1.0 {
            self.cycles += wraps as u64;
            let _ = self.events.send(ClockEvent::CycleStart {
                cycle: self.cycles,
            });
        }
    }

    /// Earliest pending cadence deadline
    pub fn next_deadline(&self) -> Option<f64> {
        self.timers.next_deadline()
    }

    /// Runs due cadences; returned messages are sync broadcasts for all ready peers
    pub fn poll(&mut self, now: f64) -> Vec<Message> {
        let mut outgoing = Vec::new();
        for timer in self.timers.poll_expired(now) {
            self.advance(now);
            match timer {
                GeneratorTimer::Tick => {
                    let _ = self.events.send(ClockEvent::PhasorUpdate {
                        phase: self.phase,
                        cycle_freq: self.cycle_freq,
                    });
                    self.timers.schedule(now + self.tick_ms, GeneratorTimer::Tick);
                }
                GeneratorTimer::Broadcast => {
                    outgoing.push(Message::phasor_sync(
                        self.phase,
                        self.cycle_freq,
                        self.audio_time(now),
                        now,
                    ));
                    self.timers
                        .schedule(now + self.broadcast_ms, GeneratorTimer::Broadcast);
                }
            }
        }
        outgoing
    }
}

fn frequency_of(cycle_duration_secs: f64) -> Result<f64> {
    if !cycle_duration_secs.is_finite() || cycle_duration_secs <= 0.0 {
        return Err(Error::timing(format!(
            "cycle duration must be a positive number of seconds, got {}",
            cycle_duration_secs
        )));
    }
    Ok(1.0 / cycle_duration_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock() -> MasterClock {
        MasterClock::new(Duration::from_millis(16), Duration::from_millis(100))
    }

    #[test]
    fn test_advances_by_elapsed_time() {
        let mut gen = clock();
        gen.start(2.0, 1000.0).unwrap();
        assert_eq!(gen.cycle_freq(), 0.5);

        // irregular steps still land on the same phase
        gen.advance(1100.0);
        gen.advance(1137.0);
        gen.advance(1500.0);
        assert!((gen.phasor() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_cycle_start_on_wrap() {
        let mut gen = clock();
        let mut events = gen.subscribe();
        gen.start(1.0, 0.0).unwrap();
        gen.advance(900.0);
        assert!(events.try_recv().is_err());
        gen.advance(1100.0);
        assert_eq!(events.try_recv().unwrap(), ClockEvent::CycleStart { cycle: 1 });
        assert!((gen.phasor() - 0.1).abs() < 1e-9);
        assert_eq!(gen.cycles(), 1);
    }

    #[test]
    fn test_cadences() {
        let mut gen = clock();
        let mut events = gen.subscribe();
        gen.start(2.0, 0.0).unwrap();

        let first = gen.poll(0.0);
        assert!(matches!(first.as_slice(), [Message::PhasorSync(_)]));

        let mut broadcasts = 0;
        let mut t = 0.0;
        while t < 1000.0 {
            t += 4.0;
            broadcasts += gen.poll(t).len();
        }
        assert_eq!(broadcasts, 10);

        let updates = std::iter::from_fn(|| events.try_recv().ok())
            .filter(|e| matches!(e, ClockEvent::PhasorUpdate { .. }))
            .count();
        assert!(updates >= 55 && updates <= 63, "got {} updates", updates);
    }

    #[test]
    fn test_set_cycle_duration_keeps_phase() {
        let mut gen = clock();
        gen.start(2.0, 0.0).unwrap();
        gen.set_cycle_duration(4.0, 1000.0).unwrap();
        assert!((gen.phasor() - 0.5).abs() < 1e-9);
        gen.advance(2000.0);
        assert!((gen.phasor() - 0.75).abs() < 1e-9);
        assert!(gen.set_cycle_duration(0.0, 2000.0).is_err());
    }

    #[test]
    fn test_stop_freezes_phase() {
        let mut gen = clock();
        gen.start(2.0, 0.0).unwrap();
        gen.advance(500.0);
        gen.stop();
        gen.advance(1500.0);
        assert!((gen.phasor() - 0.25).abs() < 1e-9);
        assert!(gen.poll(5000.0).is_empty());
        assert!(gen.next_deadline().is_none());
    }
}
