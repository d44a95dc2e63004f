use std::collections::HashSet;

use bytes::Bytes;
use serde_json::json;

use crate::core::{Error, PeerId, Result};
use crate::protocol::{Channel, Message};
use super::transport::{Signal, SignalKind, Transport};

/// Transport that records everything and delivers nothing.
///
/// Link progress is simulated by feeding [`LinkEvent`](super::LinkEvent)s to
/// the mesh by hand.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    /// Frames passed to `send`, in order
    pub sent: Vec<(PeerId, Channel, Bytes)>,
    /// Peers passed to `open`
    pub opened: Vec<PeerId>,
    /// Peers passed to `close`
    pub closed: Vec<PeerId>,
    /// Signals passed to `on_signal`
    pub signals: Vec<(PeerId, Signal)>,
    /// Peers whose sends fail
    pub unreachable: HashSet<PeerId>,
}

impl MemoryTransport {
    /// Creates an empty transport
    pub fn new() -> Self {
        Self::default()
    }

    /// Decoded messages sent to `peer`
    pub fn messages_to(&self, peer: &PeerId) -> Vec<(Channel, Message)> {
        self.sent
            .iter()
            .filter(|(p, _, _)| p == peer)
            .filter_map(|(_, channel, data)| Message::decode(data).ok().map(|m| (*channel, m)))
            .collect()
    }

    /// Forgets recorded traffic
    pub fn clear(&mut self) {
        self.sent.clear();
        self.opened.clear();
        self.closed.clear();
        self.signals.clear();
    }
}

impl Transport for MemoryTransport {
    fn open(&mut self, peer: &PeerId) -> Result<Signal> {
        self.opened.push(peer.clone());
        Ok(Signal::offer(json!({ "memory": peer.as_str() })))
    }

    fn on_signal(&mut self, peer: &PeerId, signal: Signal) -> Result<Option<Signal>> {
        let reply = match signal.kind {
            SignalKind::Offer => Some(Signal::answer(json!({ "memory": peer.as_str() }))),
            SignalKind::Answer => None,
        };
        self.signals.push((peer.clone(), signal));
        Ok(reply)
    }

    fn send(&mut self, peer: &PeerId, channel: Channel, frame: Bytes) -> Result<()> {
        if self.unreachable.contains(peer) {
            return Err(Error::network(format!("peer {} unreachable", peer)));
        }
        self.sent.push((peer.clone(), channel, frame));
        Ok(())
    }

    fn close(&mut self, peer: &PeerId) {
        self.closed.push(peer.clone());
    }
}
