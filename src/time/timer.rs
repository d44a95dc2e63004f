use std::fmt;

/// Handle to a scheduled timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer-{}", self.0)
    }
}

#[derive(Debug)]
struct Entry<K> {
    id: TimerId,
    deadline: f64,
    key: K,
}

/// Cancelable one-shot timers keyed by a component-specific kind
///
/// Nothing fires on its own: the owner calls `poll_expired(now)` from the
/// event loop, which keeps ordering deterministic. Expired timers come back
/// sorted by deadline, then by scheduling order.
#[derive(Debug)]
pub struct Timers<K> {
    entries: Vec<Entry<K>>,
    next_id: u64,
}

impl<K> Default for Timers<K> {
    fn default() -> Self {
        Timers {
            entries: Vec::new(),
            next_id: 0,
        }
    }
}

impl<K> Timers<K> {
    /// Creates an empty timer set
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `key` to expire at `deadline` (ms)
    pub fn schedule(&mut self, deadline: f64, key: K) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.entries.push(Entry { id, deadline, key });
        id
    }

    /// Cancels a timer, returning whether it was still pending
    pub fn cancel(&mut self, id: TimerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        self.entries.len() != before
    }

    /// Cancels every timer whose key matches, returning how many were removed
    pub fn cancel_where(&mut self, mut pred: impl FnMut(&K) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| !pred(&e.key));
        before - self.entries.len()
    }

    /// Whether any pending timer matches
    pub fn contains(&self, mut pred: impl FnMut(&K) -> bool) -> bool {
        self.entries.iter().any(|e| pred(&e.key))
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<f64> {
        self.entries
            .iter()
            .map(|e| e.deadline)
            .fold(None, |acc: Option<f64>, d| Some(acc.map_or(d, |a| a.min(d))))
    }

    /// Removes and returns every timer due at or before `now`
    pub fn poll_expired(&mut self, now: f64) -> Vec<K> {
        let mut due = Vec::new();
        let mut pending = Vec::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            if entry.deadline <= now {
                due.push(entry);
            } else {
                pending.push(entry);
            }
        }
        self.entries = pending;
        due.sort_by(|a, b| {
            a.deadline
                .total_cmp(&b.deadline)
                .then_with(|| a.id.cmp(&b.id))
        });
        due.into_iter().map(|e| e.key).collect()
    }

    /// Cancels everything
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of pending timers
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no timers are pending
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
