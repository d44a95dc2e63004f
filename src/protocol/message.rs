use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::core::{Error, PeerId, Result, MAX_MESSAGE_SIZE};

/// Logical channel of a peer link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Ordered and reliable
    Control,
    /// Unordered, best-effort, no retransmission
    Sync,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Control => f.write_str("control"),
            Channel::Sync => f.write_str("sync"),
        }
    }
}

/// Health probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ping {
    pub id: String,
    /// Sender's clock when the ping left (ms)
    pub timestamp: f64,
}

/// Answer to a [`Ping`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pong {
    #[serde(rename = "pingId")]
    pub ping_id: String,
    /// Echo of the ping's timestamp, in the pinger's clock
    #[serde(rename = "pingTimestamp")]
    pub ping_timestamp: f64,
    /// Responder's clock when the pong left (ms)
    pub timestamp: f64,
}

/// Candidacy broadcast during an election window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidacy {
    #[serde(rename = "peerId")]
    pub peer_id: PeerId,
    #[serde(rename = "averageRTT")]
    pub average_rtt: f64,
    pub score: f64,
    pub timestamp: f64,
}

/// Winner's announcement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Announcement {
    #[serde(rename = "leaderId")]
    pub leader_id: PeerId,
    pub timestamp: f64,
}

/// Leader's authoritative phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhasorSync {
    /// Phase in [0, 1]
    pub phasor: f64,
    /// Cycles per second
    #[serde(rename = "cycleFreq")]
    pub cycle_freq: f64,
    /// Leader's audio clock (seconds)
    #[serde(rename = "audioTime")]
    pub audio_time: f64,
    /// Leader's clock when the broadcast left (ms)
    pub timestamp: f64,
}

/// Discrete synth parameter change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterUpdate {
    #[serde(rename = "synthId")]
    pub synth_id: String,
    pub parameters: Map<String, Value>,
    pub envelopes: Value,
    pub timestamp: f64,
}

/// Wire message, tagged by `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    Ping(Ping),
    Pong(Pong),
    LeaderElection(Candidacy),
    LeaderAnnouncement(Announcement),
    PhasorSync(PhasorSync),
    ParameterUpdate(ParameterUpdate),
}

impl Message {
    /// Builds a ping with a fresh id
    pub fn ping(now: f64) -> Self {
        Message::Ping(Ping {
            id: Uuid::new_v4().to_string(),
            timestamp: now,
        })
    }

    /// Builds the answer to `ping`
    pub fn pong(ping: &Ping, now: f64) -> Self {
        Message::Pong(Pong {
            ping_id: ping.id.clone(),
            ping_timestamp: ping.timestamp,
            timestamp: now,
        })
    }

    /// Builds a candidacy
    pub fn candidacy(peer_id: PeerId, average_rtt: f64, score: f64, now: f64) -> Self {
        Message::LeaderElection(Candidacy {
            peer_id,
            average_rtt,
            score,
            timestamp: now,
        })
    }

    /// Builds a leadership announcement
    pub fn announcement(leader_id: PeerId, now: f64) -> Self {
        Message::LeaderAnnouncement(Announcement {
            leader_id,
            timestamp: now,
        })
    }

    /// Builds a phasor broadcast
    pub fn phasor_sync(phasor: f64, cycle_freq: f64, audio_time: f64, now: f64) -> Self {
        Message::PhasorSync(PhasorSync {
            phasor,
            cycle_freq,
            audio_time,
            timestamp: now,
        })
    }

    /// Builds a parameter update
    pub fn parameter_update(
        synth_id: impl Into<String>,
        parameters: Map<String, Value>,
        envelopes: Value,
        now: f64,
    ) -> Self {
        Message::ParameterUpdate(ParameterUpdate {
            synth_id: synth_id.into(),
            parameters,
            envelopes,
            timestamp: now,
        })
    }

    /// Wire name of the message type
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::LeaderElection(_) => "leader-election",
            Message::LeaderAnnouncement(_) => "leader-announcement",
            Message::PhasorSync(_) => "phasor-sync",
            Message::ParameterUpdate(_) => "parameter-update",
        }
    }

    /// Channel this message travels on
    pub fn channel(&self) -> Channel {
        match self {
            Message::Ping(_) | Message::Pong(_) | Message::PhasorSync(_) => Channel::Sync,
            Message::LeaderElection(_)
            | Message::LeaderAnnouncement(_)
            | Message::ParameterUpdate(_) => Channel::Control,
        }
    }

    /// Sender timestamp common to every message (ms)
    pub fn timestamp(&self) -> f64 {
        match self {
            Message::Ping(m) => m.timestamp,
            Message::Pong(m) => m.timestamp,
            Message::LeaderElection(m) => m.timestamp,
            Message::LeaderAnnouncement(m) => m.timestamp,
            Message::PhasorSync(m) => m.timestamp,
            Message::ParameterUpdate(m) => m.timestamp,
        }
    }

    /// Decodes and validates an inbound frame
    pub fn decode(frame: &[u8]) -> Result<Self> {
        if frame.len() > MAX_MESSAGE_SIZE {
            return Err(Error::protocol(format!(
                "message of {} bytes exceeds limit of {}",
                frame.len(),
                MAX_MESSAGE_SIZE
            )));
        }
        let message: Message = serde_json::from_slice(frame)
            .map_err(|e| Error::protocol(format!("invalid message: {}", e)))?;
        message.validate()?;
        Ok(message)
    }

    /// Serializes for the wire
    pub fn encode(&self) -> Result<Bytes> {
        let bytes = serde_json::to_vec(self)
            .map_err(|e| Error::protocol(format!("Failed to serialize message: {}", e)))?;
        Ok(Bytes::from(bytes))
    }

    /// Checks value ranges serde cannot express
    pub fn validate(&self) -> Result<()> {
        let kind = self.kind();
        check_time(kind, "timestamp", self.timestamp())?;
        match self {
            Message::Ping(m) => check_id(kind, "id", &m.id),
            Message::Pong(m) => {
                check_id(kind, "pingId", &m.ping_id)?;
                check_time(kind, "pingTimestamp", m.ping_timestamp)
            }
            Message::LeaderElection(m) => {
                check_id(kind, "peerId", m.peer_id.as_str())?;
                if !m.average_rtt.is_finite() || m.average_rtt < 0.0 {
                    return Err(field_error(kind, "averageRTT", "a non-negative number"));
                }
                if !m.score.is_finite() {
                    return Err(field_error(kind, "score", "a finite number"));
                }
                Ok(())
            }
            Message::LeaderAnnouncement(m) => check_id(kind, "leaderId", m.leader_id.as_str()),
            Message::PhasorSync(m) => {
                if !(0.0..=1.0).contains(&m.phasor) {
                    return Err(field_error(kind, "phasor", "in [0, 1]"));
                }
                if !m.cycle_freq.is_finite() || m.cycle_freq <= 0.0 {
                    return Err(field_error(kind, "cycleFreq", "a positive frequency"));
                }
                if !m.audio_time.is_finite() {
                    return Err(field_error(kind, "audioTime", "a finite number"));
                }
                Ok(())
            }
            Message::ParameterUpdate(m) => check_id(kind, "synthId", &m.synth_id),
        }
    }
}

fn field_error(kind: &str, field: &str, expected: &str) -> Error {
    Error::protocol(format!("{} message field `{}` must be {}", kind, field, expected))
}

fn check_id(kind: &str, field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(field_error(kind, field, "a non-empty string"));
    }
    Ok(())
}

fn check_time(kind: &str, field: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(field_error(kind, field, "a non-negative number of milliseconds"));
    }
    Ok(())
}
