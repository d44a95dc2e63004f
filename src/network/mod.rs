//! Peer mesh management module
//! 
//! This module owns the per-peer links of a node: topology gating, the
//! bootstrap signal exchange, readiness, heartbeats and removal. Transports
//! and the signaling relay plug in behind the [`Transport`] and
//! [`SignalingRelay`] traits.

mod memory;
mod peer;
mod signaling;
mod socket;
mod transport;

pub use self::memory::MemoryTransport;
pub use self::peer::{ConnectionState, Peer, PeerHealth};
pub use self::signaling::{LocalRelay, LocalRelayHub, RosterEntry, SignalEvent, SignalingRelay};
pub use self::socket::SocketTransport;
pub use self::transport::{LinkEvent, Signal, SignalKind, Transport};

use std::collections::HashMap;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::core::{Config, Error, PeerId, Result, Role};
use crate::protocol::{Channel, Message, PeerSummary, Pong};
use crate::sync::filter::measure;
use crate::sync::ClockFilterState;
use crate::time::{TimerId, Timers};

/// Why a peer left the directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// The link closed
    Disconnected,
    /// The link failed
    Failed,
    /// The relay reported the peer left the room
    Left,
    /// Removed on request
    Kicked,
    /// Local shutdown
    Shutdown,
}

/// Notifications published by [`PeerMesh`]
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    /// Link and sync channel are up; fires once per peer
    PeerConnected { peer: PeerId, role: Role },
    /// The peer left the directory
    PeerRemoved {
        peer: PeerId,
        role: Role,
        reason: RemovalReason,
    },
    /// A validated message other than ping/pong arrived
    Message {
        from: PeerId,
        channel: Channel,
        message: Message,
    },
    /// A ping went unanswered
    PingTimeout { peer: PeerId, packet_loss: u64 },
}

/// Per-peer health as reported outside the mesh
#[derive(Debug, Clone, PartialEq)]
pub struct PeerHealthReport {
    pub peer: PeerId,
    pub role: Role,
    pub average_rtt: Option<f64>,
    pub packet_loss: u64,
    pub last_seen: Option<f64>,
    pub offset: Option<f64>,
    pub jitter: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
enum MeshTimer {
    Heartbeat,
    PingTimeout { peer: PeerId, ping_id: String },
}

#[derive(Debug)]
struct PendingPing {
    peer: PeerId,
    timer: TimerId,
}

/// Directory of live peers and their links
///
/// Only the mesh mutates peer state. Everything it cannot do synchronously
/// (relaying signals, delivering frames) goes through the transport or the
/// outbound signal queue drained by the node.
pub struct PeerMesh<T: Transport> {
    local_id: PeerId,
    role: Role,
    room: String,
    heartbeat_ms: f64,
    ping_timeout_ms: f64,
    rtt_window: usize,
    transport: T,
    peers: HashMap<PeerId, Peer>,
    pending_pings: HashMap<String, PendingPing>,
    outbound_signals: Vec<(PeerId, Signal)>,
    timers: Timers<MeshTimer>,
    events: broadcast::Sender<MeshEvent>,
    connected: bool,
}

impl<T: Transport> PeerMesh<T> {
    /// Creates an empty mesh for the configured identity
    pub fn new(config: &Config, transport: T) -> Self {
        let (events, _) = broadcast::channel(256);
        PeerMesh {
            local_id: config.peer_id.clone(),
            role: config.role,
            room: config.room.clone(),
            heartbeat_ms: config.heartbeat_interval.as_secs_f64() * 1000.0,
            ping_timeout_ms: config.ping_timeout.as_secs_f64() * 1000.0,
            rtt_window: config.rtt_window,
            transport,
            peers: HashMap::new(),
            pending_pings: HashMap::new(),
            outbound_signals: Vec::new(),
            timers: Timers::new(),
            events,
            connected: false,
        }
    }

    /// Subscribes to mesh notifications
    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    /// Whether `connect` ran and `cleanup` has not
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Starts the heartbeat and seeds the directory from the room roster
    pub fn connect(&mut self, roster: &[RosterEntry], now: f64) -> Vec<PeerId> {
        if !self.connected {
            info!(peer = %self.local_id, role = %self.role, room = %self.room, "joining mesh");
            self.connected = true;
            self.timers.schedule(now + self.heartbeat_ms, MeshTimer::Heartbeat);
        }
        for entry in roster {
            if let Err(e) = self.add_peer(entry.peer_id.clone(), entry.role, now) {
                warn!(peer = %entry.peer_id, error = %e, "could not add roster peer");
            }
        }
        self.peers.keys().cloned().collect()
    }

    /// Whether the star topology allows a link with a `role` peer
    pub fn accepts(&self, role: Role) -> bool {
        self.role.links_with(role)
    }

    /// Adds a peer; opens the link when the local side initiates.
    ///
    /// Returns false for self, duplicates and peers the topology excludes.
    pub fn add_peer(&mut self, id: PeerId, role: Role, now: f64) -> Result<bool> {
        if id == self.local_id || self.peers.contains_key(&id) {
            return Ok(false);
        }
        if !self.accepts(role) {
            debug!(peer = %id, %role, "topology excludes peer");
            return Ok(false);
        }

        let initiator = self.role.initiates_to(&self.local_id, role, &id);
        self.peers.insert(
            id.clone(),
            Peer::new(id.clone(), role, initiator, self.rtt_window, now),
        );
        debug!(peer = %id, %role, initiator, "peer added");

        if initiator {
            match self.transport.open(&id) {
                Ok(offer) => self.outbound_signals.push((id, offer)),
                Err(e) => {
                    self.remove_peer(&id, RemovalReason::Failed);
                    return Err(e);
                }
            }
        }
        Ok(true)
    }

    /// Handles a bootstrap signal relayed from `from`
    pub fn handle_signal(&mut self, from: PeerId, role: Role, signal: Signal, now: f64) -> Result<()> {
        if !self.accepts(role) {
            return Err(Error::peer(format!(
                "refusing {} link from {} {}",
                self.role, role, from
            )));
        }
        if !self.peers.contains_key(&from) {
            self.add_peer(from.clone(), role, now)?;
        }

        match self.transport.on_signal(&from, signal) {
            Ok(Some(reply)) => {
                self.outbound_signals.push((from, reply));
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                self.remove_peer(&from, RemovalReason::Failed);
                Err(e)
            }
        }
    }

    /// Signals waiting to be relayed
    pub fn take_outbound_signals(&mut self) -> Vec<(PeerId, Signal)> {
        std::mem::take(&mut self.outbound_signals)
    }

    /// Applies a transport event
    pub fn handle_link_event(&mut self, event: LinkEvent, now: f64) {
        if !self.peers.contains_key(event.peer()) {
            debug!(peer = %event.peer(), "ignoring link event for unknown peer");
            return;
        }

        match event {
            LinkEvent::LinkUp { peer } => {
                if let Some(p) = self.peers.get_mut(&peer) {
                    p.set_link_up();
                }
                self.maybe_promote(&peer);
            }
            LinkEvent::ChannelOpen { peer, channel } => {
                if let Some(p) = self.peers.get_mut(&peer) {
                    p.set_channel(channel, true);
                }
                self.maybe_promote(&peer);
            }
            LinkEvent::ChannelClosed { peer, channel } => {
                debug!(peer = %peer, %channel, "channel closed");
                self.remove_peer(&peer, RemovalReason::Disconnected);
            }
            LinkEvent::LinkDown { peer } => {
                self.remove_peer(&peer, RemovalReason::Disconnected);
            }
            LinkEvent::LinkFailed { peer, reason } => {
                warn!(peer = %peer, reason, "link failed");
                self.remove_peer(&peer, RemovalReason::Failed);
            }
            LinkEvent::Frame { peer, channel, data } => {
                match Message::decode(&data) {
                    Ok(message) => {
                        if let Some(p) = self.peers.get_mut(&peer) {
                            p.health.last_seen = Some(now);
                        }
                        self.handle_message(peer, channel, message, now)
                    }
                    Err(e) => warn!(peer = %peer, %channel, error = %e, "dropping invalid message"),
                }
            }
        }
    }

    /// Removes a peer, cancelling its timers and pending pings
    pub fn remove_peer(&mut self, id: &PeerId, reason: RemovalReason) -> bool {
        let Some(peer) = self.peers.remove(id) else {
            return false;
        };

        self.timers.cancel_where(|t| matches!(t, MeshTimer::PingTimeout { peer, .. } if peer == id));
        self.pending_pings.retain(|_, p| p.peer != *id);
        self.outbound_signals.retain(|(p, _)| p != id);
        self.transport.close(id);

        info!(peer = %id, role = %peer.role, ?reason, "peer removed");
        let _ = self.events.send(MeshEvent::PeerRemoved {
            peer: id.clone(),
            role: peer.role,
            reason,
        });
        true
    }

    /// Removes a peer on request
    pub fn kick_peer(&mut self, id: &PeerId) -> bool {
        self.remove_peer(id, RemovalReason::Kicked)
    }

    /// Sends to one ready peer; false if it is unknown, not ready or the send failed
    pub fn send(&mut self, peer: &PeerId, message: &Message, channel: Channel) -> bool {
        if !self.peers.get(peer).map_or(false, Peer::is_ready) {
            return false;
        }
        match message.encode() {
            Ok(frame) => self.send_frame(peer, channel, frame),
            Err(e) => {
                warn!(error = %e, "could not encode message");
                false
            }
        }
    }

    /// Sends to every ready peer; returns how many sends succeeded
    pub fn broadcast(&mut self, message: &Message, channel: Channel) -> usize {
        self.broadcast_where(message, channel, |_| true)
    }

    /// Sends to every ready peer of `role`
    pub fn broadcast_to_role(&mut self, message: &Message, channel: Channel, role: Role) -> usize {
        self.broadcast_where(message, channel, |p| p.role == role)
    }

    /// Peer record by id
    pub fn peer(&self, id: &PeerId) -> Option<&Peer> {
        self.peers.get(id)
    }

    /// All peers in the directory
    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    /// Peers promoted to ready
    pub fn ready_peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values().filter(|p| p.is_ready())
    }

    /// Smoothed clock estimate of a peer's link
    pub fn clock_estimate(&self, id: &PeerId) -> Option<ClockFilterState> {
        self.peers.get(id).and_then(|p| p.health.clock_estimate().copied())
    }

    /// Ready-peer count and mean RTT, the inputs of a candidacy
    pub fn summary(&self) -> PeerSummary {
        let rtts: Vec<f64> = self
            .ready_peers()
            .filter_map(|p| p.health.average_rtt())
            .collect();
        let average_rtt = if rtts.is_empty() {
            0.0
        } else {
            rtts.iter().sum::<f64>() / rtts.len() as f64
        };
        PeerSummary {
            ready_peers: self.ready_peers().count(),
            average_rtt,
        }
    }

    /// Health of every ready peer
    pub fn health(&self) -> Vec<PeerHealthReport> {
        let mut reports: Vec<_> = self
            .ready_peers()
            .map(|p| {
                let estimate = p.health.clock_estimate();
                PeerHealthReport {
                    peer: p.id.clone(),
                    role: p.role,
                    average_rtt: p.health.average_rtt(),
                    packet_loss: p.health.packet_loss,
                    last_seen: p.health.last_seen,
                    offset: estimate.map(|e| e.offset),
                    jitter: estimate.map(|e| e.jitter),
                }
            })
            .collect();
        reports.sort_by(|a, b| a.peer.cmp(&b.peer));
        reports
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<f64> {
        self.timers.next_deadline()
    }

    /// Runs heartbeats and ping timeouts
    pub fn poll(&mut self, now: f64) {
        for timer in self.timers.poll_expired(now) {
            match timer {
                MeshTimer::Heartbeat => {
                    self.send_pings(now);
                    self.timers.schedule(now + self.heartbeat_ms, MeshTimer::Heartbeat);
                }
                MeshTimer::PingTimeout { peer, ping_id } => {
                    if self.pending_pings.remove(&ping_id).is_none() {
                        continue;
                    }
                    if let Some(p) = self.peers.get_mut(&peer) {
                        p.health.packet_loss += 1;
                        let packet_loss = p.health.packet_loss;
                        warn!(peer = %peer, packet_loss, "ping timed out");
                        let _ = self.events.send(MeshEvent::PingTimeout { peer, packet_loss });
                    }
                }
            }
        }
    }

    /// Cancels all timers, closes every link and clears the directory
    pub fn cleanup(&mut self) {
        self.timers.clear();
        self.pending_pings.clear();
        self.outbound_signals.clear();
        let ids: Vec<PeerId> = self.peers.keys().cloned().collect();
        for id in ids {
            self.remove_peer(&id, RemovalReason::Shutdown);
        }
        self.connected = false;
    }

    fn maybe_promote(&mut self, id: &PeerId) {
        let Some(peer) = self.peers.get_mut(id) else {
            return;
        };
        if peer.try_promote() {
            info!(peer = %id, role = %peer.role, "peer ready");
            let _ = self.events.send(MeshEvent::PeerConnected {
                peer: id.clone(),
                role: peer.role,
            });
        }
    }

    fn handle_message(&mut self, from: PeerId, channel: Channel, message: Message, now: f64) {
        match message {
            Message::Ping(ping) => {
                let pong = Message::pong(&ping, now);
                if let Ok(frame) = pong.encode() {
                    self.send_frame(&from, Channel::Sync, frame);
                }
            }
            Message::Pong(pong) => self.handle_pong(&from, &pong, now),
            message => {
                debug!(from = %from, kind = message.kind(), "message received");
                let _ = self.events.send(MeshEvent::Message {
                    from,
                    channel,
                    message,
                });
            }
        }
    }

    fn handle_pong(&mut self, from: &PeerId, pong: &Pong, now: f64) {
        match self.pending_pings.get(&pong.ping_id) {
            Some(pending) if pending.peer == *from => {}
            _ => {
                debug!(peer = %from, ping = %pong.ping_id, "ignoring unexpected pong");
                return;
            }
        }
        if let Some(pending) = self.pending_pings.remove(&pong.ping_id) {
            self.timers.cancel(pending.timer);
        }

        let sample = measure(pong.ping_timestamp, pong.timestamp, now);
        if let Some(peer) = self.peers.get_mut(from) {
            peer.health.record(sample);
            debug!(peer = %from, rtt = sample.rtt, offset = sample.offset, "pong");
        }
    }

    fn send_pings(&mut self, now: f64) {
        let ready: Vec<PeerId> = self.ready_peers().map(|p| p.id.clone()).collect();
        for id in ready {
            let Message::Ping(ping) = Message::ping(now) else {
                continue;
            };
            let ping_id = ping.id.clone();
            let sent = Message::Ping(ping)
                .encode()
                .map(|frame| self.send_frame(&id, Channel::Sync, frame))
                .unwrap_or(false);
            if let Some(peer) = self.peers.get_mut(&id) {
                peer.health.pings_sent += 1;
            }
            if !sent {
                continue;
            }
            let timer = self.timers.schedule(
                now + self.ping_timeout_ms,
                MeshTimer::PingTimeout {
                    peer: id.clone(),
                    ping_id: ping_id.clone(),
                },
            );
            self.pending_pings.insert(ping_id, PendingPing { peer: id, timer });
        }
    }

    fn broadcast_where(
        &mut self,
        message: &Message,
        channel: Channel,
        filter: impl Fn(&Peer) -> bool,
    ) -> usize {
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "could not encode broadcast");
                return 0;
            }
        };
        let targets: Vec<PeerId> = self
            .ready_peers()
            .filter(|p| filter(p))
            .map(|p| p.id.clone())
            .collect();
        targets
            .iter()
            .filter(|id| self.send_frame(id, channel, frame.clone()))
            .count()
    }

    fn send_frame(&mut self, peer: &PeerId, channel: Channel, frame: bytes::Bytes) -> bool {
        match self.transport.send(peer, channel, frame) {
            Ok(()) => true,
            Err(e) => {
                debug!(peer = %peer, %channel, error = %e, "send failed");
                false
            }
        }
    }
}
