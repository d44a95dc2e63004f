use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{PeerId, Result};
use crate::protocol::Channel;

/// Direction of a bootstrap signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
}

/// Transport-specific bootstrap payload carried by the signaling relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub kind: SignalKind,
    pub payload: Value,
}

impl Signal {
    /// Builds an offer
    pub fn offer(payload: Value) -> Self {
        Signal {
            kind: SignalKind::Offer,
            payload,
        }
    }

    /// Builds an answer
    pub fn answer(payload: Value) -> Self {
        Signal {
            kind: SignalKind::Answer,
            payload,
        }
    }
}

/// State changes and inbound frames reported by a transport
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    LinkUp { peer: PeerId },
    LinkDown { peer: PeerId },
    LinkFailed { peer: PeerId, reason: String },
    ChannelOpen { peer: PeerId, channel: Channel },
    ChannelClosed { peer: PeerId, channel: Channel },
    Frame { peer: PeerId, channel: Channel, data: Bytes },
}

impl LinkEvent {
    /// Peer the event concerns
    pub fn peer(&self) -> &PeerId {
        match self {
            LinkEvent::LinkUp { peer }
            | LinkEvent::LinkDown { peer }
            | LinkEvent::LinkFailed { peer, .. }
            | LinkEvent::ChannelOpen { peer, .. }
            | LinkEvent::ChannelClosed { peer, .. }
            | LinkEvent::Frame { peer, .. } => peer,
        }
    }
}

/// Point-to-point links with a `control` (ordered, reliable) and a `sync`
/// (unordered, no retransmission) channel each.
///
/// Implementations report progress as [`LinkEvent`]s on a channel handed out
/// at construction; methods here never block.
pub trait Transport: Send {
    /// Starts an outbound link and returns the offer to relay
    fn open(&mut self, peer: &PeerId) -> Result<Signal>;

    /// Consumes a remote offer or answer; returns a reply to relay, if any
    fn on_signal(&mut self, peer: &PeerId, signal: Signal) -> Result<Option<Signal>>;

    /// Queues a frame on one channel of a link
    fn send(&mut self, peer: &PeerId, channel: Channel, frame: Bytes) -> Result<()>;

    /// Tears down a link and everything pending on it
    fn close(&mut self, peer: &PeerId);
}
