use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::core::{Error, Result};
use crate::protocol::PhasorSync;
use crate::time::Timers;
use crate::util::{fold_phase_error, is_cycle_boundary, ms_to_secs, wrap_phase};
use super::filter::ClockFilterState;
use super::ClockEvent;

/// Arrival jitter (ms) at which the jitter factor of confidence halves
pub const JITTER_SCALE_MS: f64 = 25.0;

#[derive(Debug, Clone, Copy, PartialEq)]
enum ReconstructorTimer {
    Tick,
    LossCheck,
}

/// Snapshot of follower synchronization health
#[derive(Debug, Clone, PartialEq)]
pub struct SyncHealth {
    pub active: bool,
    pub confidence: f64,
    /// Smoothed arrival jitter (ms)
    pub jitter: f64,
    /// Phase error before the last correction
    pub last_error: f64,
    pub accepted: u64,
    pub stale_dropped: u64,
    /// Milliseconds since the last accepted broadcast
    pub since_last_sync: Option<f64>,
}

/// Leader phase extrapolated to local time `now`.
///
/// Transit is measured against the leader's timestamp mapped onto the local
/// clock through `estimate`; without an estimate both clocks are assumed to
/// share a timebase. Transit is clamped to `[0, max_transit_ms]`.
pub fn extrapolate(
    sync: &PhasorSync,
    estimate: Option<&ClockFilterState>,
    now: f64,
    max_transit_ms: f64,
) -> f64 {
    let sent_local = estimate.map_or(sync.timestamp, |e| e.to_local(sync.timestamp));
    let transit = (now - sent_local).clamp(0.0, max_transit_ms.max(0.0));
    wrap_phase(sync.phasor + sync.cycle_freq * ms_to_secs(transit))
}

/// Follower-side phasor rebuilt from the leader's broadcasts
///
/// Between broadcasts the phase free-runs at the last known frequency. Each
/// broadcast pulls it toward the extrapolated leader phase by a bounded
/// fraction of the error instead of snapping.
pub struct PhaseReconstructor {
    phase: f64,
    cycle_freq: f64,
    correction_factor: f64,
    timeout_ms: f64,
    confidence_threshold: f64,
    tick_ms: f64,
    last_advance: Option<f64>,
    last_sync_local: Option<f64>,
    last_sender_ts: Option<f64>,
    last_audio_time: f64,
    last_target: Option<f64>,
    last_error: f64,
    jitter: f64,
    active: bool,
    lost: bool,
    cycles: u64,
    accepted: u64,
    stale_dropped: u64,
    timers: Timers<ReconstructorTimer>,
    events: broadcast::Sender<ClockEvent>,
}

impl PhaseReconstructor {
    /// Creates an inactive reconstructor at phase 0
    pub fn new(
        correction_factor: f64,
        sync_timeout: Duration,
        tick_interval: Duration,
        confidence_threshold: f64,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        PhaseReconstructor {
            phase: 0.0,
            cycle_freq: 0.0,
            correction_factor: correction_factor.clamp(0.0, 1.0),
            timeout_ms: sync_timeout.as_secs_f64() * 1000.0,
            confidence_threshold,
            tick_ms: tick_interval.as_secs_f64() * 1000.0,
            last_advance: None,
            last_sync_local: None,
            last_sender_ts: None,
            last_audio_time: 0.0,
            last_target: None,
            last_error: 0.0,
            jitter: 0.0,
            active: false,
            lost: false,
            cycles: 0,
            accepted: 0,
            stale_dropped: 0,
            timers: Timers::new(),
            events,
        }
    }

    /// Subscribes to sync and phasor notifications
    pub fn subscribe(&self) -> broadcast::Receiver<ClockEvent> {
        self.events.subscribe()
    }

    /// Starts the local phase cadence
    pub fn start(&mut self, now: f64) {
        self.last_advance.get_or_insert(now);
        self.timers.cancel_where(|t| *t == ReconstructorTimer::Tick);
        self.timers.schedule(now + self.tick_ms, ReconstructorTimer::Tick);
    }

    /// Current reconstructed phase in [0, 1)
    pub fn current_phasor(&self) -> f64 {
        self.phase
    }

    /// Last known leader frequency
    pub fn cycle_freq(&self) -> f64 {
        self.cycle_freq
    }

    /// Leader audio clock carried by the last accepted broadcast
    pub fn last_audio_time(&self) -> f64 {
        self.last_audio_time
    }

    /// Extrapolated leader phase computed for the last accepted broadcast
    pub fn last_target(&self) -> Option<f64> {
        self.last_target
    }

    /// Whether broadcasts are arriving within the timeout
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Trust in the current phase, in [0, 1]
    pub fn confidence(&self, now: f64) -> f64 {
        let Some(last) = self.last_sync_local else {
            return 0.0;
        };
        if !self.active {
            return 0.0;
        }
        let age = (now - last).max(0.0);
        let age_factor = (1.0 - age / self.timeout_ms).clamp(0.0, 1.0);
        let jitter_factor = 1.0 / (1.0 + self.jitter / JITTER_SCALE_MS);
        (age_factor * jitter_factor).clamp(0.0, 1.0)
    }

    /// Whether downstream triggers should act on the phase
    pub fn should_trigger(&self, now: f64) -> bool {
        self.confidence(now) >= self.confidence_threshold
    }

    /// Health snapshot
    pub fn health(&self, now: f64) -> SyncHealth {
        SyncHealth {
            active: self.active,
            confidence: self.confidence(now),
            jitter: self.jitter,
            last_error: self.last_error,
            accepted: self.accepted,
            stale_dropped: self.stale_dropped,
            since_last_sync: self.last_sync_local.map(|t| (now - t).max(0.0)),
        }
    }

    /// Forgets the sender ordering, e.g. after the leader changes
    pub fn reset_source(&mut self) {
        self.last_sender_ts = None;
    }

    /// Applies a leader broadcast.
    ///
    /// Returns `Ok(false)` when the broadcast is older than one already
    /// applied.
    pub fn on_sync(
        &mut self,
        sync: &PhasorSync,
        estimate: Option<&ClockFilterState>,
        now: f64,
    ) -> Result<bool> {
        if !(0.0..=1.0).contains(&sync.phasor) || !(sync.cycle_freq > 0.0) {
            return Err(Error::sync(format!(
                "rejecting phasor {} at {} Hz",
                sync.phasor, sync.cycle_freq
            )));
        }
        if let Some(last_ts) = self.last_sender_ts {
            if sync.timestamp <= last_ts {
                self.stale_dropped += 1;
                debug!(
                    timestamp = sync.timestamp,
                    newest = last_ts,
                    "dropping stale phasor sync"
                );
                return Ok(false);
            }
            if let Some(last_local) = self.last_sync_local {
                let variation = ((now - last_local) - (sync.timestamp - last_ts)).abs();
                self.jitter += (variation - self.jitter) / 16.0;
            }
        }

        self.advance(now);
        let before = self.phase;
        let target = extrapolate(sync, estimate, now, self.timeout_ms);
        let error = fold_phase_error(target - self.phase);

        if self.last_sync_local.is_none() {
            self.phase = target;
        } else {
            let corrected = self.phase + error * self.correction_factor;
            // a cycle already started; hold at the boundary until the leader wraps too
            self.phase = if corrected < 0.0 { 0.0 } else { wrap_phase(corrected) };
        }
        if is_cycle_boundary(before, self.phase) {
            self.cycles += 1;
            let _ = self.events.send(ClockEvent::CycleStart { cycle: self.cycles });
        }

        self.cycle_freq = sync.cycle_freq;
        self.last_sender_ts = Some(sync.timestamp);
        self.last_sync_local = Some(now);
        self.last_audio_time = sync.audio_time;
        self.last_target = Some(target);
        self.last_error = error;
        self.accepted += 1;

        if !self.active {
            self.active = true;
            if self.lost {
                self.lost = false;
                info!("phasor sync restored");
                let _ = self.events.send(ClockEvent::SyncRestored);
            } else {
                info!(phase = self.phase, cycle_freq = self.cycle_freq, "phasor sync acquired");
            }
        }

        self.timers
            .cancel_where(|t| *t == ReconstructorTimer::LossCheck);
        self.timers
            .schedule(now + self.timeout_ms, ReconstructorTimer::LossCheck);

        let _ = self.events.send(ClockEvent::SyncUpdate {
            phase: self.phase,
            cycle_freq: self.cycle_freq,
            error,
            confidence: self.confidence(now),
        });
        Ok(true)
    }

    /// Free-runs the phase up to `now`
    pub fn advance(&mut self, now: f64) {
        let Some(last) = self.last_advance else {
            self.last_advance = Some(now);
            return;
        };
        let elapsed = ms_to_secs(now - last);
        if elapsed <= 0.0 {
            return;
        }
        self.last_advance = Some(now);

        let raw = self.phase + self.cycle_freq * elapsed;
        self.phase = wrap_phase(raw);
        if raw >= 1.0 {
            self.cycles += raw.floor() as u64;
            let _ = self.events.send(ClockEvent::CycleStart { cycle: self.cycles });
        }
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<f64> {
        self.timers.next_deadline()
    }

    /// Runs the phase cadence and the loss check
    pub fn poll(&mut self, now: f64) {
        for timer in self.timers.poll_expired(now) {
            match timer {
                ReconstructorTimer::Tick => {
                    self.advance(now);
                    let _ = self.events.send(ClockEvent::PhasorUpdate {
                        phase: self.phase,
                        cycle_freq: self.cycle_freq,
                    });
                    self.timers.schedule(now + self.tick_ms, ReconstructorTimer::Tick);
                }
                ReconstructorTimer::LossCheck => self.check_loss(now),
            }
        }
    }

    /// Cancels timers; the phase keeps its last value
    pub fn stop(&mut self) {
        self.timers.clear();
    }

    fn check_loss(&mut self, now: f64) {
        let silent_for = self.last_sync_local.map_or(f64::INFINITY, |t| now - t);
        if !self.active || silent_for < self.timeout_ms {
            return;
        }
        self.active = false;
        self.last_sender_ts = None;
        if !self.lost {
            self.lost = true;
            warn!(silent_ms = silent_for, "phasor sync lost, free-running");
            let _ = self.events.send(ClockEvent::SyncLost);
        }
    }
}
