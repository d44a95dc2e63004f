use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use tracing::{debug, error};
use uuid::Uuid;

use crate::core::{Error, Result};
use crate::util::forward_distance;

/// Identifier of a scheduled event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(Uuid);

impl EventId {
    fn new() -> Self {
        EventId(Uuid::new_v4())
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Context handed to a firing callback
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FireInfo {
    pub phase: f64,
    pub target: f64,
    pub event_id: EventId,
    /// Local time the event was scheduled (ms)
    pub scheduled_at: f64,
}

/// Callback run once when its target phase passes
pub type Callback<P> = Box<dyn FnOnce(P, FireInfo) -> Result<()> + Send>;

struct ScheduledEvent<P> {
    id: EventId,
    target: f64,
    tolerance: f64,
    callback: Callback<P>,
    payload: P,
    created_at: f64,
}

/// Whether `current` has reached `target`.
///
/// True inside the wrap-aware tolerance band, or when the forward step from
/// `prev` to `current` (shorter than half a cycle) runs over the target.
pub fn has_passed(prev: Option<f64>, current: f64, target: f64, tolerance: f64) -> bool {
    let diff = (current - target).abs();
    if diff.min(1.0 - diff) <= tolerance {
        return true;
    }
    match prev {
        Some(prev) => {
            let step = forward_distance(prev, current);
            let to_target = forward_distance(prev, target);
            step > 0.0 && step < 0.5 && to_target > 0.0 && to_target <= step
        }
        None => false,
    }
}

/// Fires callbacks at phase positions of any phasor source
pub struct EventScheduler<P = serde_json::Value> {
    events: Vec<ScheduledEvent<P>>,
    default_tolerance: f64,
    last_phase: Option<f64>,
}

impl<P> EventScheduler<P> {
    /// Creates an empty scheduler
    pub fn new(default_tolerance: f64) -> Self {
        EventScheduler {
            events: Vec::new(),
            default_tolerance,
            last_phase: None,
        }
    }

    /// Schedules `callback(payload, info)` for the next time the phase reaches `target`
    pub fn schedule_at_phase<F>(
        &mut self,
        target: f64,
        callback: F,
        payload: P,
        now: f64,
    ) -> Result<EventId>
    where
        F: FnOnce(P, FireInfo) -> Result<()> + Send + 'static,
    {
        self.schedule_at_phase_with_tolerance(target, self.default_tolerance, callback, payload, now)
    }

    /// Like [`schedule_at_phase`](Self::schedule_at_phase) with an explicit tolerance band
    pub fn schedule_at_phase_with_tolerance<F>(
        &mut self,
        target: f64,
        tolerance: f64,
        callback: F,
        payload: P,
        now: f64,
    ) -> Result<EventId>
    where
        F: FnOnce(P, FireInfo) -> Result<()> + Send + 'static,
    {
        if !(0.0..1.0).contains(&target) {
            return Err(Error::scheduler(format!(
                "target phase must be in [0, 1), got {}",
                target
            )));
        }
        if !(0.0..0.5).contains(&tolerance) {
            return Err(Error::scheduler(format!(
                "tolerance must be in [0, 0.5), got {}",
                tolerance
            )));
        }

        let id = EventId::new();
        self.events.push(ScheduledEvent {
            id,
            target,
            tolerance,
            callback: Box::new(callback),
            payload,
            created_at: now,
        });
        debug!(event = %id, target, "scheduled phase event");
        Ok(id)
    }

    /// Cancels a pending event
    pub fn cancel(&mut self, id: EventId) -> bool {
        let before = self.events.len();
        self.events.retain(|e| e.id != id);
        self.events.len() != before
    }

    /// Drops every pending event
    pub fn clear_all(&mut self) {
        self.events.clear();
    }

    /// Number of pending events
    pub fn pending(&self) -> usize {
        self.events.len()
    }

    /// Fires every event the phase has passed at local time `now`; returns
    /// how many fired.
    ///
    /// Each callback runs once and is then discarded. Errors and panics are
    /// logged per event and never stop the others.
    pub fn on_phase(&mut self, phase: f64, now: f64) -> usize {
        let prev = self.last_phase.replace(phase);

        let (due, pending): (Vec<_>, Vec<_>) = self
            .events
            .drain(..)
            .partition(|e| has_passed(prev, phase, e.target, e.tolerance));
        self.events = pending;

        let fired = due.len();
        for event in due {
            let info = FireInfo {
                phase,
                target: event.target,
                event_id: event.id,
                scheduled_at: event.created_at,
            };
            let age_ms = (now - event.created_at).max(0.0);
            let callback = event.callback;
            let payload = event.payload;
            match panic::catch_unwind(AssertUnwindSafe(move || callback(payload, info))) {
                Ok(Ok(())) => debug!(event = %info.event_id, phase, age_ms, "phase event fired"),
                Ok(Err(e)) => error!(event = %info.event_id, error = %e, "phase event callback failed"),
                Err(_) => error!(event = %info.event_id, "phase event callback panicked"),
            }
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder() -> (Arc<Mutex<Vec<(u32, FireInfo)>>>, impl Fn() -> Callback<u32>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let make = move || -> Callback<u32> {
            let sink = sink.clone();
            Box::new(move |payload, info| {
                sink.lock().unwrap().push((payload, info));
                Ok(())
            })
        };
        (log, make)
    }

    #[test]
    fn test_fires_once_crossing_half() {
        let (log, make) = recorder();
        let mut scheduler = EventScheduler::new(0.01);
        let id = scheduler.schedule_at_phase(0.5, make(), 7, 250.0).unwrap();

        let phases = [0.1, 0.2, 0.3, 0.4, 0.45, 0.52, 0.6, 0.8, 0.95, 0.1, 0.3, 0.5, 0.7];
        for (step, phase) in phases.into_iter().enumerate() {
            scheduler.on_phase(phase, 250.0 + step as f64 * 16.0);
        }

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].0, 7);
        assert_eq!(log[0].1.target, 0.5);
        assert_eq!(log[0].1.phase, 0.52);
        assert_eq!(log[0].1.event_id, id);
        assert_eq!(log[0].1.scheduled_at, 250.0);
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_fires_across_wrap_boundary() {
        let (log, make) = recorder();
        let mut scheduler = EventScheduler::new(0.01);
        scheduler
            .schedule_at_phase_with_tolerance(0.99, 0.01, make(), 1, 0.0)
            .unwrap();

        assert_eq!(scheduler.on_phase(0.97, 0.0), 0);
        assert_eq!(scheduler.on_phase(0.995, 0.0), 1);
        assert_eq!(scheduler.on_phase(0.01, 0.0), 0);
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_step_over_wrap_fires() {
        let (log, make) = recorder();
        let mut scheduler = EventScheduler::new(0.001);
        scheduler.schedule_at_phase(0.02, make(), 1, 0.0).unwrap();
        scheduler.on_phase(0.9, 0.0);
        scheduler.on_phase(0.05, 0.0);
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_cancel_and_clear() {
        let (log, make) = recorder();
        let mut scheduler = EventScheduler::new(0.01);
        let a = scheduler.schedule_at_phase(0.25, make(), 1, 0.0).unwrap();
        scheduler.schedule_at_phase(0.5, make(), 2, 0.0).unwrap();
        scheduler.schedule_at_phase(0.75, make(), 3, 0.0).unwrap();

        assert!(scheduler.cancel(a));
        assert!(!scheduler.cancel(a));
        scheduler.on_phase(0.2, 0.0);
        scheduler.on_phase(0.3, 0.0);
        assert!(log.lock().unwrap().is_empty());

        scheduler.clear_all();
        scheduler.on_phase(0.5, 0.0);
        scheduler.on_phase(0.75, 0.0);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_failing_callbacks_are_isolated() {
        let (log, make) = recorder();
        let mut scheduler = EventScheduler::new(0.01);
        scheduler
            .schedule_at_phase(0.5, |_, _| Err(Error::scheduler("boom")), 0, 0.0)
            .unwrap();
        scheduler
            .schedule_at_phase(0.5, |_, _| panic!("callback panic"), 0, 0.0)
            .unwrap();
        scheduler.schedule_at_phase(0.5, make(), 9, 0.0).unwrap();

        assert_eq!(scheduler.on_phase(0.5, 0.0), 3);
        assert_eq!(log.lock().unwrap().len(), 1);
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_rejects_bad_targets() {
        let mut scheduler: EventScheduler<()> = EventScheduler::new(0.01);
        assert!(scheduler.schedule_at_phase(1.0, |_, _| Ok(()), (), 0.0).is_err());
        assert!(scheduler
            .schedule_at_phase_with_tolerance(0.5, 0.6, |_, _| Ok(()), (), 0.0)
            .is_err());
    }

    #[test]
    fn test_backward_correction_does_not_fire() {
        assert!(!has_passed(Some(0.52), 0.48, 0.5, 0.01));
        assert!(has_passed(Some(0.48), 0.52, 0.5, 0.01));
        assert!(has_passed(None, 0.001, 0.995, 0.01));
    }
}
