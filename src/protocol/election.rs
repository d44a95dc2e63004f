use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::core::{PeerId, Role};
use crate::time::Timers;
use super::message::{Announcement, Candidacy, Message};

/// Weight of one ready peer in a candidacy score, in RTT milliseconds
pub const PEER_WEIGHT: f64 = 100.0;

/// Candidacy score: more ready peers and lower average RTT both raise it
pub fn score(ready_peers: usize, average_rtt: f64) -> f64 {
    PEER_WEIGHT * ready_peers as f64 - average_rtt.max(0.0)
}

/// Local view of connectivity used to build a candidacy
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PeerSummary {
    /// Number of ready peers
    pub ready_peers: usize,
    /// Mean RTT across ready peers with at least one sample (ms)
    pub average_rtt: f64,
}

/// A candidate seen during the current election window
#[derive(Debug, Clone, PartialEq)]
pub struct LeadershipCandidate {
    pub peer_id: PeerId,
    pub average_rtt: f64,
    pub score: f64,
}

impl LeadershipCandidate {
    /// Whether `self` beats `other`: strictly higher score, then smaller id
    pub fn beats(&self, other: &LeadershipCandidate) -> bool {
        self.score > other.score || (self.score == other.score && self.peer_id < other.peer_id)
    }
}

impl From<&Candidacy> for LeadershipCandidate {
    fn from(c: &Candidacy) -> Self {
        LeadershipCandidate {
            peer_id: c.peer_id.clone(),
            average_rtt: c.average_rtt,
            score: c.score,
        }
    }
}

/// Election state machine: `idle -> electing -> {leader | follower}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    Idle,
    Electing,
    Leader,
    Follower,
}

/// Notifications published by [`LeaderElection`]
#[derive(Debug, Clone, PartialEq)]
pub enum ElectionEvent {
    /// A local election window opened
    ElectionStarted,
    /// A leader is known
    LeaderElected { leader: PeerId, is_self: bool },
    /// The known leader went away
    LeaderLost { leader: PeerId },
}

#[derive(Debug, Clone, PartialEq)]
enum ElectionTimer {
    AutoElect,
    WindowClose,
    AnnouncementTimeout,
}

/// Leader election among conductor-role nodes
///
/// Performers run the same state machine to track the announced leader but
/// never stand as candidates.
pub struct LeaderElection {
    local_id: PeerId,
    role: Role,
    window_ms: f64,
    state: ElectionState,
    leader: Option<PeerId>,
    own: Option<LeadershipCandidate>,
    candidates: HashMap<PeerId, LeadershipCandidate>,
    timers: Timers<ElectionTimer>,
    events: broadcast::Sender<ElectionEvent>,
}

impl LeaderElection {
    /// Creates an idle election for the local node
    pub fn new(local_id: PeerId, role: Role, window: Duration) -> Self {
        let (events, _) = broadcast::channel(64);
        LeaderElection {
            local_id,
            role,
            window_ms: window.as_secs_f64() * 1000.0,
            state: ElectionState::Idle,
            leader: None,
            own: None,
            candidates: HashMap::new(),
            timers: Timers::new(),
            events,
        }
    }

    /// Subscribes to election notifications
    pub fn subscribe(&self) -> broadcast::Receiver<ElectionEvent> {
        self.events.subscribe()
    }

    /// Current state
    pub fn state(&self) -> ElectionState {
        self.state
    }

    /// Known leader, if any
    pub fn leader(&self) -> Option<&PeerId> {
        self.leader.as_ref()
    }

    /// Whether this node is the leader
    pub fn is_leader(&self) -> bool {
        self.state == ElectionState::Leader
    }

    /// Candidates collected in the current window, own candidacy included
    pub fn candidates(&self) -> Vec<LeadershipCandidate> {
        let mut all: Vec<_> = self.candidates.values().cloned().collect();
        all.extend(self.own.iter().cloned());
        all
    }

    /// Arms the startup auto-election.
    ///
    /// The first window is spent listening so an existing leader can announce
    /// itself before this node stands.
    pub fn start(&mut self, now: f64, auto_elect: bool) {
        if self.role == Role::Conductor && auto_elect && self.leader.is_none() {
            self.timers.cancel_where(|t| *t == ElectionTimer::AutoElect);
            self.timers.schedule(now + self.window_ms, ElectionTimer::AutoElect);
        }
    }

    /// Opens an election window and returns the candidacy to broadcast
    pub fn start_election(&mut self, now: f64, summary: PeerSummary) -> Option<Message> {
        if self.role != Role::Conductor {
            warn!(peer = %self.local_id, "performer cannot stand for election");
            return None;
        }
        if self.state == ElectionState::Electing {
            return self.own_candidacy(now);
        }

        let own = LeadershipCandidate {
            peer_id: self.local_id.clone(),
            average_rtt: summary.average_rtt,
            score: score(summary.ready_peers, summary.average_rtt),
        };
        info!(
            peer = %self.local_id,
            score = own.score,
            ready_peers = summary.ready_peers,
            "starting leader election"
        );

        self.state = ElectionState::Electing;
        self.leader = None;
        self.own = Some(own);
        self.timers.clear();
        self.timers.schedule(now + self.window_ms, ElectionTimer::WindowClose);
        let _ = self.events.send(ElectionEvent::ElectionStarted);
        self.own_candidacy(now)
    }

    /// Takes leadership; returns the announcement to broadcast.
    ///
    /// No-op when already leader. Performers refuse.
    pub fn become_leader(&mut self, now: f64) -> Option<Message> {
        if self.role != Role::Conductor {
            warn!(peer = %self.local_id, "ignoring attempt to make a performer leader");
            return None;
        }
        if self.state == ElectionState::Leader {
            return None;
        }

        info!(peer = %self.local_id, "became leader");
        self.state = ElectionState::Leader;
        self.leader = Some(self.local_id.clone());
        self.own = None;
        self.candidates.clear();
        self.timers.clear();
        let _ = self.events.send(ElectionEvent::LeaderElected {
            leader: self.local_id.clone(),
            is_self: true,
        });
        Some(Message::announcement(self.local_id.clone(), now))
    }

    /// Records a candidacy; a conductor outside a window joins the election.
    ///
    /// A sitting leader keeps its role and answers with its announcement.
    pub fn on_candidacy(
        &mut self,
        candidacy: &Candidacy,
        now: f64,
        summary: PeerSummary,
    ) -> Option<Message> {
        if candidacy.peer_id == self.local_id || self.role != Role::Conductor {
            return None;
        }
        debug!(
            from = %candidacy.peer_id,
            score = candidacy.score,
            "received candidacy"
        );

        if self.state == ElectionState::Leader {
            return Some(Message::announcement(self.local_id.clone(), now));
        }

        let joined = if self.state == ElectionState::Electing {
            None
        } else {
            self.start_election(now, summary)
        };
        self.candidates
            .insert(candidacy.peer_id.clone(), LeadershipCandidate::from(candidacy));
        joined
    }

    /// Accepts a leadership announcement.
    ///
    /// A leader hearing a rival announcement re-runs the election; the
    /// returned candidacy must be broadcast.
    pub fn on_announcement(
        &mut self,
        announcement: &Announcement,
        now: f64,
        summary: PeerSummary,
    ) -> Option<Message> {
        let leader = &announcement.leader_id;
        if *leader == self.local_id {
            return None;
        }

        if self.state == ElectionState::Leader {
            warn!(rival = %leader, "conflicting leadership announcement, re-electing");
            self.state = ElectionState::Idle;
            self.leader = None;
            return self.start_election(now, summary);
        }

        if self.leader.as_ref() == Some(leader) && self.state == ElectionState::Follower {
            return None;
        }

        info!(leader = %leader, "following announced leader");
        self.state = ElectionState::Follower;
        self.leader = Some(leader.clone());
        self.own = None;
        self.candidates.clear();
        self.timers.clear();
        let _ = self.events.send(ElectionEvent::LeaderElected {
            leader: leader.clone(),
            is_self: false,
        });
        None
    }

    /// Reacts to a peer becoming ready; returns a message for that peer only
    pub fn on_peer_ready(&mut self, peer_role: Role, now: f64) -> Option<Message> {
        match self.state {
            ElectionState::Leader => Some(Message::announcement(self.local_id.clone(), now)),
            ElectionState::Electing if peer_role == Role::Conductor => self.own_candidacy(now),
            _ => None,
        }
    }

    /// Forgets a removed peer; losing the leader triggers a new election
    pub fn on_peer_removed(
        &mut self,
        peer: &PeerId,
        now: f64,
        summary: PeerSummary,
    ) -> Option<Message> {
        self.candidates.remove(peer);
        if self.leader.as_ref() != Some(peer) {
            return None;
        }

        warn!(leader = %peer, "leader disconnected");
        self.leader = None;
        self.state = ElectionState::Idle;
        let _ = self.events.send(ElectionEvent::LeaderLost {
            leader: peer.clone(),
        });

        if self.role == Role::Conductor {
            self.start_election(now, summary)
        } else {
            None
        }
    }

    /// Earliest pending election deadline
    pub fn next_deadline(&self) -> Option<f64> {
        self.timers.next_deadline()
    }

    /// Fires due timers; returned messages must be broadcast on `control`
    pub fn poll(&mut self, now: f64, summary: PeerSummary) -> Vec<Message> {
        let mut outgoing = Vec::new();
        for timer in self.timers.poll_expired(now) {
            match timer {
                ElectionTimer::AutoElect => {
                    if self.leader.is_none() && self.state == ElectionState::Idle {
                        outgoing.extend(self.start_election(now, summary));
                    }
                }
                ElectionTimer::WindowClose => outgoing.extend(self.finish_election(now)),
                ElectionTimer::AnnouncementTimeout => {
                    if self.leader.is_none() {
                        warn!("expected winner never announced, re-electing");
                        self.state = ElectionState::Idle;
                        outgoing.extend(self.start_election(now, summary));
                    }
                }
            }
        }
        outgoing
    }

    /// Cancels timers and forgets all state
    pub fn cleanup(&mut self) {
        self.timers.clear();
        self.candidates.clear();
        self.own = None;
        self.leader = None;
        self.state = ElectionState::Idle;
    }

    /// Tallies the window: strictly highest score wins, ties go to the smaller id
    fn finish_election(&mut self, now: f64) -> Option<Message> {
        if self.state != ElectionState::Electing {
            return None;
        }

        let winner = self
            .candidates()
            .into_iter()
            .reduce(|best, c| if c.beats(&best) { c } else { best });

        match winner {
            Some(winner) if winner.peer_id == self.local_id => {
                self.state = ElectionState::Idle;
                self.become_leader(now)
            }
            Some(winner) => {
                info!(winner = %winner.peer_id, "lost election, awaiting announcement");
                self.state = ElectionState::Follower;
                self.own = None;
                self.candidates.clear();
                self.timers
                    .schedule(now + self.window_ms, ElectionTimer::AnnouncementTimeout);
                None
            }
            None => {
                self.state = ElectionState::Idle;
                None
            }
        }
    }

    fn own_candidacy(&self, now: f64) -> Option<Message> {
        self.own.as_ref().map(|own| {
            Message::candidacy(own.peer_id.clone(), own.average_rtt, own.score, now)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(2);

    fn conductor(id: &str) -> LeaderElection {
        LeaderElection::new(PeerId::new(id), Role::Conductor, WINDOW)
    }

    fn summary(ready_peers: usize, average_rtt: f64) -> PeerSummary {
        PeerSummary {
            ready_peers,
            average_rtt,
        }
    }

    fn candidacy_of(message: Option<Message>) -> Candidacy {
        match message {
            Some(Message::LeaderElection(c)) => c,
            other => panic!("expected candidacy, got {:?}", other),
        }
    }

    #[test]
    fn test_score_is_monotonic() {
        assert!(score(3, 20.0) > score(2, 20.0));
        assert!(score(2, 10.0) > score(2, 40.0));
        assert_eq!(score(0, 0.0), 0.0);
    }

    #[test]
    fn test_highest_score_wins() {
        let mut a = conductor("a");
        let mut b = conductor("b");
        let mut c = conductor("c");

        let ca = candidacy_of(a.start_election(0.0, summary(1, 50.0)));
        let cb = candidacy_of(b.start_election(0.0, summary(3, 30.0)));
        let cc = candidacy_of(c.start_election(0.0, summary(2, 5.0)));

        for (node, others) in [
            (&mut a, [&cb, &cc]),
            (&mut b, [&ca, &cc]),
            (&mut c, [&ca, &cb]),
        ] {
            for other in others {
                assert!(node.on_candidacy(other, 10.0, summary(0, 0.0)).is_none());
            }
        }

        let end = 2000.0;
        assert!(a.poll(end, PeerSummary::default()).is_empty());
        assert!(c.poll(end, PeerSummary::default()).is_empty());
        let announced = b.poll(end, PeerSummary::default());
        assert_eq!(announced.len(), 1);
        assert!(b.is_leader());
        assert_eq!(a.state(), ElectionState::Follower);
        assert_eq!(c.state(), ElectionState::Follower);

        let Message::LeaderAnnouncement(announcement) = &announced[0] else {
            panic!("expected announcement");
        };
        a.on_announcement(announcement, end, PeerSummary::default());
        c.on_announcement(announcement, end, PeerSummary::default());
        assert_eq!(a.leader(), Some(&PeerId::new("b")));
        assert_eq!(c.leader(), Some(&PeerId::new("b")));
        assert!(!a.is_leader() && !c.is_leader());
    }

    #[test]
    fn test_tie_broken_by_smallest_id() {
        let mut zed = conductor("zed");
        let mut amy = conductor("amy");
        let cz = candidacy_of(zed.start_election(0.0, summary(2, 10.0)));
        let ca = candidacy_of(amy.start_election(0.0, summary(2, 10.0)));
        zed.on_candidacy(&ca, 1.0, PeerSummary::default());
        amy.on_candidacy(&cz, 1.0, PeerSummary::default());

        assert!(zed.poll(2000.0, PeerSummary::default()).is_empty());
        assert_eq!(amy.poll(2000.0, PeerSummary::default()).len(), 1);
        assert!(amy.is_leader());
        assert!(!zed.is_leader());
    }

    #[test]
    fn test_lone_candidate_wins() {
        let mut a = conductor("a");
        a.start(0.0, true);
        assert!(a.poll(1999.0, PeerSummary::default()).is_empty());
        let started = a.poll(2000.0, PeerSummary::default());
        assert!(matches!(started.as_slice(), [Message::LeaderElection(_)]));
        assert_eq!(a.state(), ElectionState::Electing);
        let done = a.poll(4000.0, PeerSummary::default());
        assert!(matches!(done.as_slice(), [Message::LeaderAnnouncement(_)]));
        assert!(a.is_leader());
    }

    #[test]
    fn test_announcement_cancels_auto_elect() {
        let mut a = conductor("a");
        a.start(0.0, true);
        a.on_announcement(
            &Announcement {
                leader_id: PeerId::new("b"),
                timestamp: 10.0,
            },
            10.0,
            PeerSummary::default(),
        );
        assert_eq!(a.state(), ElectionState::Follower);
        assert!(a.poll(5000.0, PeerSummary::default()).is_empty());
        assert_eq!(a.leader(), Some(&PeerId::new("b")));
    }

    #[test]
    fn test_become_leader_idempotent() {
        let mut a = conductor("a");
        let mut events = a.subscribe();
        assert!(a.become_leader(0.0).is_some());
        assert!(a.become_leader(1.0).is_none());
        assert_eq!(
            events.try_recv().unwrap(),
            ElectionEvent::LeaderElected {
                leader: PeerId::new("a"),
                is_self: true
            }
        );
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_performer_never_leads() {
        let mut p = LeaderElection::new(PeerId::new("p"), Role::Performer, WINDOW);
        assert!(p.become_leader(0.0).is_none());
        assert!(p.start_election(0.0, summary(5, 1.0)).is_none());
        p.start(0.0, true);
        assert!(p.next_deadline().is_none());
        assert_eq!(p.state(), ElectionState::Idle);

        p.on_announcement(
            &Announcement {
                leader_id: PeerId::new("ctrl"),
                timestamp: 1.0,
            },
            1.0,
            PeerSummary::default(),
        );
        assert_eq!(p.leader(), Some(&PeerId::new("ctrl")));
        assert!(!p.is_leader());
    }

    #[test]
    fn test_leader_loss_triggers_election() {
        let mut a = conductor("a");
        let mut events = a.subscribe();
        a.on_announcement(
            &Announcement {
                leader_id: PeerId::new("b"),
                timestamp: 0.0,
            },
            0.0,
            PeerSummary::default(),
        );
        let message = a.on_peer_removed(&PeerId::new("b"), 100.0, summary(1, 10.0));
        assert!(matches!(message, Some(Message::LeaderElection(_))));
        assert_eq!(a.state(), ElectionState::Electing);
        assert!(a.leader().is_none());

        let kinds: Vec<_> = std::iter::from_fn(|| events.try_recv().ok()).collect();
        assert!(kinds.contains(&ElectionEvent::LeaderLost {
            leader: PeerId::new("b")
        }));
    }

    #[test]
    fn test_missing_announcement_restarts_election() {
        let mut a = conductor("b-node");
        a.start_election(0.0, summary(0, 0.0));
        a.on_candidacy(
            &Candidacy {
                peer_id: PeerId::new("a-node"),
                average_rtt: 1.0,
                score: 500.0,
                timestamp: 0.0,
            },
            1.0,
            PeerSummary::default(),
        );
        assert!(a.poll(2000.0, PeerSummary::default()).is_empty());
        assert_eq!(a.state(), ElectionState::Follower);
        let restarted = a.poll(4000.0, PeerSummary::default());
        assert!(matches!(restarted.as_slice(), [Message::LeaderElection(_)]));
    }

    fn announcement_of(messages: Vec<Message>) -> Announcement {
        match messages.as_slice() {
            [Message::LeaderAnnouncement(a)] => a.clone(),
            other => panic!("expected one announcement, got {:?}", other),
        }
    }

    #[test]
    fn test_rival_leaders_reelect_to_one() {
        let mut a = conductor("a");
        let mut b = conductor("b");
        let Some(Message::LeaderAnnouncement(from_a)) = a.become_leader(0.0) else {
            panic!("expected announcement");
        };
        let Some(Message::LeaderAnnouncement(from_b)) = b.become_leader(0.0) else {
            panic!("expected announcement");
        };

        // each hears the other once the link comes up
        let ca = candidacy_of(a.on_announcement(&from_b, 100.0, summary(1, 10.0)));
        let cb = candidacy_of(b.on_announcement(&from_a, 100.0, summary(2, 10.0)));
        assert_eq!(a.state(), ElectionState::Electing);
        assert!(a.leader().is_none() && b.leader().is_none());

        assert!(a.on_candidacy(&cb, 110.0, PeerSummary::default()).is_none());
        assert!(b.on_candidacy(&ca, 110.0, PeerSummary::default()).is_none());

        assert!(a.poll(2100.0, PeerSummary::default()).is_empty());
        let winner = announcement_of(b.poll(2100.0, PeerSummary::default()));
        a.on_announcement(&winner, 2100.0, PeerSummary::default());

        assert!(b.is_leader());
        assert!(!a.is_leader());
        assert_eq!(a.leader(), Some(&PeerId::new("b")));
        assert!(a.poll(10_000.0, PeerSummary::default()).is_empty());
        assert!(b.poll(10_000.0, PeerSummary::default()).is_empty());
    }

    #[test]
    fn test_electing_candidate_follows_announcement() {
        let mut a = conductor("a");
        let mut events = a.subscribe();
        a.start_election(0.0, summary(3, 5.0));
        assert_eq!(a.state(), ElectionState::Electing);

        let reply = a.on_announcement(
            &Announcement {
                leader_id: PeerId::new("c"),
                timestamp: 500.0,
            },
            500.0,
            PeerSummary::default(),
        );
        assert!(reply.is_none());
        assert_eq!(a.state(), ElectionState::Follower);
        assert_eq!(a.leader(), Some(&PeerId::new("c")));
        assert!(a.candidates().is_empty());

        // the abandoned window never closes into a second leader
        assert!(a.poll(5000.0, PeerSummary::default()).is_empty());
        assert!(!a.is_leader());

        let seen: Vec<_> = std::iter::from_fn(|| events.try_recv().ok()).collect();
        assert_eq!(
            seen,
            vec![
                ElectionEvent::ElectionStarted,
                ElectionEvent::LeaderElected {
                    leader: PeerId::new("c"),
                    is_self: false
                },
            ]
        );
    }

    #[test]
    fn test_late_stronger_candidate_keeps_one_leader() {
        let mut a = conductor("a");
        let mut b = conductor("b");

        // a closes its window alone
        a.start_election(0.0, summary(0, 0.0));
        let first = announcement_of(a.poll(2000.0, PeerSummary::default()));
        assert!(a.is_leader());

        // b shows up later with a better score and stands before hearing a
        b.start(3000.0, true);
        let cb = candidacy_of(b.start_election(3000.0, summary(3, 5.0)));
        assert!(cb.score > score(0, 0.0));

        let Some(Message::LeaderAnnouncement(reply)) =
            a.on_candidacy(&cb, 3010.0, summary(1, 5.0))
        else {
            panic!("leader should answer with its announcement");
        };
        assert!(a.is_leader());
        assert_eq!(reply.leader_id, first.leader_id);

        assert!(b.on_announcement(&reply, 3020.0, PeerSummary::default()).is_none());
        assert!(b.poll(10_000.0, PeerSummary::default()).is_empty());
        assert!(a.poll(10_000.0, PeerSummary::default()).is_empty());

        let leaders = [&a, &b].iter().filter(|e| e.is_leader()).count();
        assert_eq!(leaders, 1);
        assert_eq!(b.leader(), Some(&PeerId::new("a")));
    }

    #[test]
    fn test_leader_reannounces_to_new_peer() {
        let mut a = conductor("a");
        a.become_leader(0.0);
        assert!(matches!(
            a.on_peer_ready(Role::Performer, 5.0),
            Some(Message::LeaderAnnouncement(_))
        ));
    }
}
