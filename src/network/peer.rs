use std::collections::VecDeque;

use crate::core::{PeerId, Role};
use crate::protocol::Channel;
use crate::sync::{ClockFilter, ClockFilterState, ClockSample};

/// Link lifecycle of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Offer/answer exchange in progress
    Connecting,
    /// Transport link is up
    Connected,
}

/// Rolling health statistics of one peer
#[derive(Debug, Clone)]
pub struct PeerHealth {
    rtt_samples: VecDeque<f64>,
    window: usize,
    /// Pings that timed out without a pong
    pub packet_loss: u64,
    pub pings_sent: u64,
    pub pongs_received: u64,
    /// Local time of the last frame from this peer (ms)
    pub last_seen: Option<f64>,
    filter: ClockFilter,
}

impl PeerHealth {
    /// Creates empty stats keeping `window` RTT samples
    pub fn new(window: usize) -> Self {
        PeerHealth {
            rtt_samples: VecDeque::with_capacity(window),
            window: window.max(1),
            packet_loss: 0,
            pings_sent: 0,
            pongs_received: 0,
            last_seen: None,
            filter: ClockFilter::default(),
        }
    }

    /// Records a ping/pong measurement
    pub fn record(&mut self, sample: ClockSample) {
        if !(sample.rtt >= 0.0) {
            return;
        }
        self.pongs_received += 1;
        if self.rtt_samples.len() == self.window {
            self.rtt_samples.pop_front();
        }
        self.rtt_samples.push_back(sample.rtt);
        self.filter.update(sample);
    }

    /// Mean of the retained RTT samples (ms)
    pub fn average_rtt(&self) -> Option<f64> {
        if self.rtt_samples.is_empty() {
            return None;
        }
        Some(self.rtt_samples.iter().sum::<f64>() / self.rtt_samples.len() as f64)
    }

    /// Retained RTT samples, oldest first
    pub fn rtt_samples(&self) -> impl Iterator<Item = f64> + '_ {
        self.rtt_samples.iter().copied()
    }

    /// Smoothed offset/latency estimate
    pub fn clock_estimate(&self) -> Option<&ClockFilterState> {
        self.filter.state()
    }
}

/// A remote node as seen by the mesh
#[derive(Debug, Clone)]
pub struct Peer {
    pub id: PeerId,
    pub role: Role,
    /// Whether the local side opened the link
    pub initiator: bool,
    pub state: ConnectionState,
    pub health: PeerHealth,
    /// Local time the peer record was created (ms)
    pub created_at: f64,
    link_up: bool,
    sync_open: bool,
    ready: bool,
}

impl Peer {
    /// Creates a peer in `Connecting` state
    pub fn new(id: PeerId, role: Role, initiator: bool, rtt_window: usize, now: f64) -> Self {
        Peer {
            id,
            role,
            initiator,
            state: ConnectionState::Connecting,
            health: PeerHealth::new(rtt_window),
            created_at: now,
            link_up: false,
            sync_open: false,
            ready: false,
        }
    }

    /// Whether the peer has been promoted to ready
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Marks the underlying link up
    pub fn set_link_up(&mut self) {
        self.link_up = true;
        self.state = ConnectionState::Connected;
    }

    /// Marks a channel open or closed; only the sync channel gates readiness
    pub fn set_channel(&mut self, channel: Channel, open: bool) {
        if channel == Channel::Sync {
            self.sync_open = open;
        }
    }

    /// Promotes to ready once link and sync channel are both up.
    ///
    /// Returns true only on the call that performs the promotion.
    pub fn try_promote(&mut self) -> bool {
        if self.ready || !self.link_up || !self.sync_open {
            return false;
        }
        self.ready = true;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::filter::measure;

    #[test]
    fn test_promotion_is_idempotent() {
        let mut peer = Peer::new(PeerId::new("p"), Role::Performer, true, 10, 0.0);
        peer.set_channel(Channel::Control, true);
        peer.set_link_up();
        assert!(!peer.try_promote());
        peer.set_channel(Channel::Sync, true);
        peer.set_channel(Channel::Sync, true);
        peer.set_link_up();
        assert!(peer.try_promote());
        assert!(!peer.try_promote());
        peer.set_link_up();
        assert!(!peer.try_promote());
        assert!(peer.is_ready());
        assert_eq!(peer.state, ConnectionState::Connected);
    }

    #[test]
    fn test_rtt_window() {
        let mut health = PeerHealth::new(3);
        assert!(health.average_rtt().is_none());
        for rtt in [10.0, 20.0, 30.0, 40.0] {
            health.record(measure(0.0, rtt / 2.0, rtt));
        }
        assert_eq!(health.rtt_samples().collect::<Vec<_>>(), vec![20.0, 30.0, 40.0]);
        assert_eq!(health.average_rtt(), Some(30.0));
        assert_eq!(health.pongs_received, 4);
        assert!(health.clock_estimate().is_some());
    }
}
