//! Per-process node
//!
//! A [`Node`] owns one mesh, one election, the clock component of its role
//! and a phase scheduler, and routes events between them. It can be driven
//! deterministically through [`Node::poll`] and the `handle_*` methods, or by
//! the async [`Node::run`] loop.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::core::{Config, Error, PeerId, Result, Role};
use crate::network::{
    LinkEvent, MeshEvent, PeerMesh, RemovalReason, SignalEvent, SignalingRelay, Transport,
};
use crate::protocol::{
    Channel, ElectionEvent, LeaderElection, Message, ParameterUpdate, PhasorSync,
};
use crate::sync::{
    ClockEvent, EventId, EventScheduler, FireInfo, MasterClock, PhaseReconstructor, SyncHealth,
};
use crate::time::Clock;

/// Idle wake-up when nothing is scheduled
const IDLE_POLL: Duration = Duration::from_secs(1);

/// Notifications published by a [`Node`]
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    PeerConnected { peer: PeerId, role: Role },
    PeerRemoved { peer: PeerId, role: Role, reason: RemovalReason },
    LeaderElected { leader: PeerId, is_self: bool },
    LeaderLost { leader: PeerId },
    /// Phase and sync notifications of the local clock
    Clock(ClockEvent),
    /// A conductor sent synth parameters
    ParameterUpdate { from: PeerId, update: ParameterUpdate },
}

enum RoleClock {
    Master(MasterClock),
    Follower(PhaseReconstructor),
}

impl RoleClock {
    fn for_config(config: &Config) -> Self {
        match config.role {
            Role::Conductor => RoleClock::Master(MasterClock::new(
                config.phasor_update_interval,
                config.sync_broadcast_interval,
            )),
            Role::Performer => RoleClock::Follower(PhaseReconstructor::new(
                config.correction_factor,
                config.sync_timeout,
                config.phasor_update_interval,
                config.confidence_threshold,
            )),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<ClockEvent> {
        match self {
            RoleClock::Master(clock) => clock.subscribe(),
            RoleClock::Follower(clock) => clock.subscribe(),
        }
    }

    fn next_deadline(&self) -> Option<f64> {
        match self {
            RoleClock::Master(clock) => clock.next_deadline(),
            RoleClock::Follower(clock) => clock.next_deadline(),
        }
    }
}

/// One mesh participant
pub struct Node<T: Transport, R: SignalingRelay> {
    config: Config,
    clock: Arc<dyn Clock>,
    mesh: PeerMesh<T>,
    relay: R,
    election: LeaderElection,
    role_clock: RoleClock,
    scheduler: EventScheduler<Value>,
    mesh_rx: broadcast::Receiver<MeshEvent>,
    election_rx: broadcast::Receiver<ElectionEvent>,
    clock_rx: broadcast::Receiver<ClockEvent>,
    events: broadcast::Sender<NodeEvent>,
    connected: bool,
}

impl<T: Transport, R: SignalingRelay> Node<T, R> {
    /// Builds a node from a validated configuration
    pub fn new(config: Config, transport: T, relay: R, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let mesh = PeerMesh::new(&config, transport);
        let election = LeaderElection::new(
            config.peer_id.clone(),
            config.role,
            config.election_window,
        );
        let role_clock = RoleClock::for_config(&config);
        let (events, _) = broadcast::channel(256);

        Ok(Node {
            mesh_rx: mesh.subscribe(),
            election_rx: election.subscribe(),
            clock_rx: role_clock.subscribe(),
            scheduler: EventScheduler::new(config.scheduler_tolerance),
            config,
            clock,
            mesh,
            relay,
            election,
            role_clock,
            events,
            connected: false,
        })
    }

    /// Subscribes to node notifications
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    pub fn local_id(&self) -> &PeerId {
        &self.config.peer_id
    }

    pub fn role(&self) -> Role {
        self.config.role
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn mesh(&self) -> &PeerMesh<T> {
        &self.mesh
    }

    pub fn transport_mut(&mut self) -> &mut T {
        self.mesh.transport_mut()
    }

    pub fn election(&self) -> &LeaderElection {
        &self.election
    }

    /// Known leader, if any
    pub fn leader(&self) -> Option<&PeerId> {
        self.election.leader()
    }

    pub fn is_leader(&self) -> bool {
        self.election.is_leader()
    }

    /// Local phase: the generator's on a conductor, the reconstruction on a performer
    pub fn phase(&self) -> f64 {
        match &self.role_clock {
            RoleClock::Master(clock) => clock.phasor(),
            RoleClock::Follower(clock) => clock.current_phasor(),
        }
    }

    /// Current cycle frequency (Hz)
    pub fn cycle_freq(&self) -> f64 {
        match &self.role_clock {
            RoleClock::Master(clock) => clock.cycle_freq(),
            RoleClock::Follower(clock) => clock.cycle_freq(),
        }
    }

    /// Sync health of a performer; `None` on a conductor
    pub fn sync_health(&self) -> Option<SyncHealth> {
        match &self.role_clock {
            RoleClock::Master(_) => None,
            RoleClock::Follower(clock) => Some(clock.health(self.clock.now_ms())),
        }
    }

    /// Whether downstream triggers should act on the local phase
    pub fn should_trigger(&self) -> bool {
        match &self.role_clock {
            RoleClock::Master(clock) => clock.is_running(),
            RoleClock::Follower(clock) => clock.should_trigger(self.clock.now_ms()),
        }
    }

    /// Schedules `callback` for the next time the local phase reaches `target`
    pub fn schedule_at_phase<F>(&mut self, target: f64, callback: F, payload: Value) -> Result<EventId>
    where
        F: FnOnce(Value, FireInfo) -> Result<()> + Send + 'static,
    {
        let now = self.clock.now_ms();
        self.scheduler.schedule_at_phase(target, callback, payload, now)
    }

    /// Cancels a scheduled phase event
    pub fn cancel_event(&mut self, id: EventId) -> bool {
        self.scheduler.cancel(id)
    }

    /// Phase events not yet fired
    pub fn pending_events(&self) -> usize {
        self.scheduler.pending()
    }

    /// Joins the room and starts the cadences
    pub fn connect(&mut self) -> Result<()> {
        if self.connected {
            return Ok(());
        }
        let now = self.clock.now_ms();

        self.relay
            .join(&self.config.peer_id, self.config.role, &self.config.room)?;
        self.mesh.connect(&[], now);
        self.election.start(now, self.config.auto_elect);
        match &mut self.role_clock {
            RoleClock::Master(clock) => {
                clock.start(self.config.cycle_duration.as_secs_f64(), now)?
            }
            RoleClock::Follower(clock) => clock.start(now),
        }
        self.connected = true;

        info!(
            peer = %self.config.peer_id,
            role = %self.config.role,
            room = %self.config.room,
            "node connected"
        );
        Ok(())
    }

    /// Applies a relay notification
    pub fn handle_signal_event(&mut self, event: SignalEvent) {
        let now = self.clock.now_ms();
        match event {
            SignalEvent::Roster(entries) => {
                for entry in entries {
                    self.add_peer(entry.peer_id, entry.role, now);
                }
            }
            SignalEvent::PeerJoined(entry) => self.add_peer(entry.peer_id, entry.role, now),
            SignalEvent::PeerLeft(peer) => {
                self.mesh.remove_peer(&peer, RemovalReason::Left);
            }
            SignalEvent::Signal { from, role, signal } => {
                if let Err(e) = self.mesh.handle_signal(from.clone(), role, signal, now) {
                    warn!(from = %from, error = %e, "rejected signal");
                }
            }
        }
        self.settle(now);
    }

    /// Applies a transport notification
    pub fn handle_link_event(&mut self, event: LinkEvent) {
        let now = self.clock.now_ms();
        self.mesh.handle_link_event(event, now);
        self.settle(now);
    }

    /// Runs every due timer
    pub fn poll(&mut self) {
        let now = self.clock.now_ms();

        self.mesh.poll(now);
        let summary = self.mesh.summary();
        for message in self.election.poll(now, summary) {
            self.broadcast_control(&message);
        }

        match &mut self.role_clock {
            RoleClock::Master(clock) => {
                let syncs = clock.poll(now);
                if self.election.is_leader() {
                    for sync in syncs {
                        self.mesh
                            .broadcast_to_role(&sync, Channel::Sync, Role::Performer);
                    }
                }
            }
            RoleClock::Follower(clock) => clock.poll(now),
        }

        self.settle(now);
    }

    /// Earliest deadline across all components
    pub fn next_deadline(&self) -> Option<f64> {
        [
            self.mesh.next_deadline(),
            self.election.next_deadline(),
            self.role_clock.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .reduce(f64::min)
    }

    /// Opens an election now instead of waiting for the startup window
    pub fn start_election(&mut self) -> Result<()> {
        if self.config.role != Role::Conductor {
            return Err(Error::election("performers do not stand for election"));
        }
        let now = self.clock.now_ms();
        let summary = self.mesh.summary();
        if let Some(candidacy) = self.election.start_election(now, summary) {
            self.broadcast_control(&candidacy);
        }
        self.settle(now);
        Ok(())
    }

    /// Takes leadership without an election; a no-op on performers
    pub fn become_leader(&mut self) {
        let now = self.clock.now_ms();
        if let Some(announcement) = self.election.become_leader(now) {
            self.broadcast_control(&announcement);
        }
        self.settle(now);
    }

    /// Changes the cycle length of the master clock
    pub fn set_cycle_duration(&mut self, cycle_duration_secs: f64) -> Result<()> {
        let now = self.clock.now_ms();
        match &mut self.role_clock {
            RoleClock::Master(clock) => clock.set_cycle_duration(cycle_duration_secs, now),
            RoleClock::Follower(_) => Err(Error::invalid_state(
                "only a conductor owns the cycle duration",
            )),
        }
    }

    /// Sends synth parameters to every ready performer; returns how many were reached
    pub fn send_parameters(
        &mut self,
        synth_id: &str,
        parameters: Map<String, Value>,
        envelopes: Value,
    ) -> Result<usize> {
        if self.config.role != Role::Conductor {
            return Err(Error::invalid_state("only a conductor sends parameters"));
        }
        let message =
            Message::parameter_update(synth_id, parameters, envelopes, self.clock.now_ms());
        message.validate()?;
        Ok(self
            .mesh
            .broadcast_to_role(&message, Channel::Control, Role::Performer))
    }

    /// Event loop: connects, then serves link and relay events and timers
    /// until `shutdown` resolves, and cleans up.
    pub async fn run<F>(
        &mut self,
        mut links: mpsc::UnboundedReceiver<LinkEvent>,
        mut signals: mpsc::UnboundedReceiver<SignalEvent>,
        shutdown: F,
    ) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.connect()?;
        tokio::pin!(shutdown);

        loop {
            let wait = match self.next_deadline() {
                Some(deadline) => {
                    Duration::from_secs_f64((deadline - self.clock.now_ms()).max(0.0) / 1000.0)
                }
                None => IDLE_POLL,
            };

            tokio::select! {
                _ = &mut shutdown => break,
                Some(event) = links.recv() => self.handle_link_event(event),
                Some(event) = signals.recv() => self.handle_signal_event(event),
                _ = tokio::time::sleep(wait) => {}
            }
            self.poll();
        }

        self.cleanup();
        Ok(())
    }

    /// Cancels all timers, closes every link, clears the registries and leaves the room
    pub fn cleanup(&mut self) {
        self.mesh.cleanup();
        // teardown notifications must not trigger re-elections
        drain(&mut self.mesh_rx);

        self.scheduler.clear_all();
        self.election.cleanup();
        match &mut self.role_clock {
            RoleClock::Master(clock) => clock.stop(),
            RoleClock::Follower(clock) => clock.stop(),
        }
        drain(&mut self.election_rx);
        drain(&mut self.clock_rx);

        if let Err(e) = self.relay.leave() {
            warn!(error = %e, "failed to leave relay room");
        }
        if self.connected {
            info!(peer = %self.config.peer_id, "node stopped");
        }
        self.connected = false;
    }

    fn add_peer(&mut self, peer: PeerId, role: Role, now: f64) {
        if let Err(e) = self.mesh.add_peer(peer.clone(), role, now) {
            warn!(peer = %peer, error = %e, "could not open link");
        }
    }

    fn broadcast_control(&mut self, message: &Message) {
        let reached = self.mesh.broadcast(message, Channel::Control);
        debug!(kind = message.kind(), reached, "broadcast");
    }

    /// Routes component notifications until none are left, then relays signals
    fn settle(&mut self, now: f64) {
        loop {
            let mut progressed = false;
            while let Some(event) = next(&mut self.mesh_rx) {
                progressed = true;
                self.on_mesh_event(event, now);
            }
            while let Some(event) = next(&mut self.election_rx) {
                progressed = true;
                self.on_election_event(event);
            }
            while let Some(event) = next(&mut self.clock_rx) {
                progressed = true;
                self.on_clock_event(event);
            }
            if !progressed {
                break;
            }
        }
        self.flush_signals();
    }

    fn flush_signals(&mut self) {
        for (peer, signal) in self.mesh.take_outbound_signals() {
            if let Err(e) = self.relay.relay(&peer, signal) {
                warn!(peer = %peer, error = %e, "could not relay signal");
                self.mesh.remove_peer(&peer, RemovalReason::Failed);
            }
        }
    }

    fn on_mesh_event(&mut self, event: MeshEvent, now: f64) {
        match event {
            MeshEvent::PeerConnected { peer, role } => {
                if let Some(message) = self.election.on_peer_ready(role, now) {
                    self.mesh.send(&peer, &message, Channel::Control);
                }
                self.emit(NodeEvent::PeerConnected { peer, role });
            }
            MeshEvent::PeerRemoved { peer, role, reason } => {
                let summary = self.mesh.summary();
                if let Some(candidacy) = self.election.on_peer_removed(&peer, now, summary) {
                    self.broadcast_control(&candidacy);
                }
                self.emit(NodeEvent::PeerRemoved { peer, role, reason });
            }
            MeshEvent::Message { from, message, .. } => self.on_message(from, message, now),
            MeshEvent::PingTimeout { .. } => {}
        }
    }

    fn on_message(&mut self, from: PeerId, message: Message, now: f64) {
        let summary = self.mesh.summary();
        match message {
            Message::LeaderElection(candidacy) => {
                if let Some(reply) = self.election.on_candidacy(&candidacy, now, summary) {
                    self.broadcast_control(&reply);
                }
            }
            Message::LeaderAnnouncement(announcement) => {
                if let Some(reply) = self.election.on_announcement(&announcement, now, summary) {
                    self.broadcast_control(&reply);
                }
            }
            Message::PhasorSync(sync) => self.on_phasor_sync(&from, &sync, now),
            Message::ParameterUpdate(update) => {
                let from_conductor = self
                    .mesh
                    .peer(&from)
                    .map_or(false, |p| p.role == Role::Conductor);
                if from_conductor {
                    self.emit(NodeEvent::ParameterUpdate { from, update });
                } else {
                    warn!(from = %from, "ignoring parameters from a non-conductor");
                }
            }
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    fn on_phasor_sync(&mut self, from: &PeerId, sync: &PhasorSync, now: f64) {
        let RoleClock::Follower(reconstructor) = &mut self.role_clock else {
            debug!(from = %from, "conductor ignores phasor sync");
            return;
        };

        let trusted = match self.election.leader() {
            Some(leader) => leader == from,
            None => self
                .mesh
                .peer(from)
                .map_or(false, |p| p.role == Role::Conductor),
        };
        if !trusted {
            debug!(from = %from, "ignoring phasor sync from a non-leader");
            return;
        }

        let estimate = self.mesh.clock_estimate(from);
        if let Err(e) = reconstructor.on_sync(sync, estimate.as_ref(), now) {
            warn!(from = %from, error = %e, "rejected phasor sync");
        }
    }

    fn on_election_event(&mut self, event: ElectionEvent) {
        match event {
            ElectionEvent::ElectionStarted => {}
            ElectionEvent::LeaderElected { leader, is_self } => {
                if let RoleClock::Follower(reconstructor) = &mut self.role_clock {
                    reconstructor.reset_source();
                }
                self.emit(NodeEvent::LeaderElected { leader, is_self });
            }
            ElectionEvent::LeaderLost { leader } => self.emit(NodeEvent::LeaderLost { leader }),
        }
    }

    fn on_clock_event(&mut self, event: ClockEvent) {
        if let Some(phase) = event.phase() {
            self.scheduler.on_phase(phase, self.clock.now_ms());
        }
        self.emit(NodeEvent::Clock(event));
    }

    fn emit(&self, event: NodeEvent) {
        let _ = self.events.send(event);
    }
}

fn next<E: Clone>(rx: &mut broadcast::Receiver<E>) -> Option<E> {
    loop {
        match rx.try_recv() {
            Ok(event) => return Some(event),
            Err(TryRecvError::Lagged(skipped)) => {
                warn!(skipped, "event receiver lagged");
            }
            Err(_) => return None,
        }
    }
}

fn drain<E: Clone>(rx: &mut broadcast::Receiver<E>) {
    while next(rx).is_some() {}
}
