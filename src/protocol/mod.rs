//! Protocol implementation module
//! 
//! This module defines the wire messages, stream framing and the leader
//! election state machine.

pub mod codec;
pub mod election;
pub mod message;

pub use self::codec::FrameCodec;
pub use self::election::{
    ElectionEvent, ElectionState, LeaderElection, LeadershipCandidate, PeerSummary,
};
pub use self::message::{
    Announcement, Candidacy, Channel, Message, ParameterUpdate, PhasorSync, Ping, Pong,
};
