use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::core::{Error, PeerId, Result, Role};
use super::transport::Signal;

/// A member of a room
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub peer_id: PeerId,
    pub role: Role,
}

/// Inbound notifications from the relay
#[derive(Debug, Clone, PartialEq)]
pub enum SignalEvent {
    /// Members already in the room when we joined
    Roster(Vec<RosterEntry>),
    PeerJoined(RosterEntry),
    PeerLeft(PeerId),
    Signal {
        from: PeerId,
        role: Role,
        signal: Signal,
    },
}

/// Out-of-band broker used only to bootstrap links.
///
/// The roster answering `join` and all later notifications arrive as
/// [`SignalEvent`]s on the receiver paired with the relay.
pub trait SignalingRelay: Send {
    /// Joins `room` as `peer_id`
    fn join(&mut self, peer_id: &PeerId, role: Role, room: &str) -> Result<()>;

    /// Forwards a bootstrap signal to another member
    fn relay(&mut self, target: &PeerId, signal: Signal) -> Result<()>;

    /// Leaves the room
    fn leave(&mut self) -> Result<()>;
}

struct Member {
    role: Role,
    tx: mpsc::UnboundedSender<SignalEvent>,
}

type Rooms = HashMap<String, HashMap<PeerId, Member>>;

/// In-process relay shared by every node of one process
#[derive(Clone, Default)]
pub struct LocalRelayHub {
    rooms: Arc<Mutex<Rooms>>,
}

impl LocalRelayHub {
    /// Creates an empty hub
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a relay endpoint and the receiver for its events
    pub fn endpoint(&self) -> (LocalRelay, mpsc::UnboundedReceiver<SignalEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let relay = LocalRelay {
            hub: self.clone(),
            tx,
            membership: None,
        };
        (relay, rx)
    }

    /// Number of members in a room
    pub fn members(&self, room: &str) -> usize {
        self.rooms
            .lock()
            .map(|rooms| rooms.get(room).map_or(0, |m| m.len()))
            .unwrap_or(0)
    }

    fn with_rooms<R>(&self, f: impl FnOnce(&mut Rooms) -> Result<R>) -> Result<R> {
        let mut rooms = self
            .rooms
            .lock()
            .map_err(|_| Error::network("relay state poisoned"))?;
        f(&mut rooms)
    }
}

/// One node's handle on a [`LocalRelayHub`]
pub struct LocalRelay {
    hub: LocalRelayHub,
    tx: mpsc::UnboundedSender<SignalEvent>,
    membership: Option<(PeerId, Role, String)>,
}

impl SignalingRelay for LocalRelay {
    fn join(&mut self, peer_id: &PeerId, role: Role, room: &str) -> Result<()> {
        if self.membership.is_some() {
            self.leave()?;
        }
        let tx = self.tx.clone();
        self.hub.with_rooms(|rooms| {
            let members = rooms.entry(room.to_string()).or_default();
            if members.contains_key(peer_id) {
                return Err(Error::network(format!(
                    "peer {} already joined room {}",
                    peer_id, room
                )));
            }

            let roster = members
                .iter()
                .map(|(id, m)| RosterEntry {
                    peer_id: id.clone(),
                    role: m.role,
                })
                .collect();
            let joined = RosterEntry {
                peer_id: peer_id.clone(),
                role,
            };
            for member in members.values() {
                let _ = member.tx.send(SignalEvent::PeerJoined(joined.clone()));
            }
            let _ = tx.send(SignalEvent::Roster(roster));
            members.insert(peer_id.clone(), Member { role, tx });
            Ok(())
        })?;

        debug!(peer = %peer_id, %role, room, "joined relay room");
        self.membership = Some((peer_id.clone(), role, room.to_string()));
        Ok(())
    }

    fn relay(&mut self, target: &PeerId, signal: Signal) -> Result<()> {
        let (from, role, room) = self
            .membership
            .clone()
            .ok_or_else(|| Error::invalid_state("relay used before join"))?;
        self.hub.with_rooms(|rooms| {
            let member = rooms
                .get(&room)
                .and_then(|members| members.get(target))
                .ok_or_else(|| Error::network(format!("peer {} is not in room {}", target, room)))?;
            member
                .tx
                .send(SignalEvent::Signal { from, role, signal })
                .map_err(|_| Error::network(format!("peer {} stopped listening", target)))
        })
    }

    fn leave(&mut self) -> Result<()> {
        let Some((peer_id, _, room)) = self.membership.take() else {
            return Ok(());
        };
        self.hub.with_rooms(|rooms| {
            if let Some(members) = rooms.get_mut(&room) {
                members.remove(&peer_id);
                for member in members.values() {
                    let _ = member.tx.send(SignalEvent::PeerLeft(peer_id.clone()));
                }
                if members.is_empty() {
                    rooms.remove(&room);
                }
            }
            Ok(())
        })
    }
}

impl Drop for LocalRelay {
    fn drop(&mut self) {
        let _ = self.leave();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn test_join_roster_and_notifications() {
        let hub = LocalRelayHub::new();
        let (mut ctrl, mut ctrl_rx) = hub.endpoint();
        let (mut synth, mut synth_rx) = hub.endpoint();

        ctrl.join(&PeerId::new("ctrl"), Role::Conductor, "room").unwrap();
        assert_eq!(ctrl_rx.try_recv().unwrap(), SignalEvent::Roster(vec![]));

        synth.join(&PeerId::new("synth"), Role::Performer, "room").unwrap();
        assert_eq!(
            synth_rx.try_recv().unwrap(),
            SignalEvent::Roster(vec![RosterEntry {
                peer_id: PeerId::new("ctrl"),
                role: Role::Conductor
            }])
        );
        assert_eq!(
            ctrl_rx.try_recv().unwrap(),
            SignalEvent::PeerJoined(RosterEntry {
                peer_id: PeerId::new("synth"),
                role: Role::Performer
            })
        );
        assert_eq!(hub.members("room"), 2);

        let offer = Signal::offer(json!({"hello": 1}));
        ctrl.relay(&PeerId::new("synth"), offer.clone()).unwrap();
        assert_eq!(
            synth_rx.try_recv().unwrap(),
            SignalEvent::Signal {
                from: PeerId::new("ctrl"),
                role: Role::Conductor,
                signal: offer
            }
        );

        drop(synth);
        assert_eq!(
            ctrl_rx.try_recv().unwrap(),
            SignalEvent::PeerLeft(PeerId::new("synth"))
        );
        assert_eq!(hub.members("room"), 1);
    }

    #[test]
    fn test_relay_to_unknown_peer_fails() {
        let hub = LocalRelayHub::new();
        let (mut relay, _rx) = hub.endpoint();
        assert!(relay
            .relay(&PeerId::new("x"), Signal::offer(Value::Null))
            .is_err());
        relay.join(&PeerId::new("a"), Role::Conductor, "r").unwrap();
        assert!(relay
            .relay(&PeerId::new("ghost"), Signal::offer(Value::Null))
            .is_err());
    }
}
