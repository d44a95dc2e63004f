use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Error, Result};

/// Node identifier in the mesh
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl PeerId {
    /// Creates a peer id from any string
    pub fn new(id: impl Into<String>) -> Self {
        PeerId(id.into())
    }

    /// Generates a new random peer id
    pub fn random() -> Self {
        PeerId(Uuid::new_v4().to_string())
    }

    /// Returns the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        PeerId(id.to_string())
    }
}

/// Role a node plays in the star topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Eligible time authority
    Conductor,
    /// Follows the leader's phasor
    Performer,
}

impl Role {
    /// Whether a node of this role links to a node of `other` role.
    ///
    /// Performers never link to each other; conductors link to everyone.
    pub fn links_with(self, other: Role) -> bool {
        self == Role::Conductor || other == Role::Conductor
    }

    /// Whether the local side of a `self`/`other` link opens it.
    ///
    /// Conductors dial performers. Between conductors the smaller id dials.
    pub fn initiates_to(self, local: &PeerId, other: Role, remote: &PeerId) -> bool {
        match (self, other) {
            (Role::Conductor, Role::Performer) => true,
            (Role::Conductor, Role::Conductor) => local < remote,
            _ => false,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Conductor => f.write_str("conductor"),
            Role::Performer => f.write_str("performer"),
        }
    }
}

/// Configuration for a mesh node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Local identity
    pub peer_id: PeerId,
    /// Local role
    pub role: Role,
    /// Room joined through the signaling relay
    pub room: String,
    /// Ping cadence for ready peers
    #[serde(serialize_with = "super::serde::serialize_duration_ms")]
    #[serde(deserialize_with = "super::serde::deserialize_duration_ms")]
    pub heartbeat_interval: Duration,
    /// How long a ping may go unanswered before it counts as lost
    #[serde(serialize_with = "super::serde::serialize_duration_ms")]
    #[serde(deserialize_with = "super::serde::deserialize_duration_ms")]
    pub ping_timeout: Duration,
    /// Candidacy collection window
    #[serde(serialize_with = "super::serde::serialize_duration_ms")]
    #[serde(deserialize_with = "super::serde::deserialize_duration_ms")]
    pub election_window: Duration,
    /// Silence after which a performer declares sync lost
    #[serde(serialize_with = "super::serde::serialize_duration_ms")]
    #[serde(deserialize_with = "super::serde::deserialize_duration_ms")]
    pub sync_timeout: Duration,
    /// Local phasor update cadence
    #[serde(serialize_with = "super::serde::serialize_duration_ms")]
    #[serde(deserialize_with = "super::serde::deserialize_duration_ms")]
    pub phasor_update_interval: Duration,
    /// Leader sync broadcast cadence
    #[serde(serialize_with = "super::serde::serialize_duration_ms")]
    #[serde(deserialize_with = "super::serde::deserialize_duration_ms")]
    pub sync_broadcast_interval: Duration,
    /// Initial cycle length of the master clock
    #[serde(serialize_with = "super::serde::serialize_duration_ms")]
    #[serde(deserialize_with = "super::serde::deserialize_duration_ms")]
    pub cycle_duration: Duration,
    /// Fraction of the phase error applied per sync broadcast
    pub correction_factor: f64,
    /// Confidence below which downstream triggers should be suppressed
    pub confidence_threshold: f64,
    /// Start an election automatically on conductor startup
    pub auto_elect: bool,
    /// Default tolerance band for phase-scheduled events
    pub scheduler_tolerance: f64,
    /// Number of RTT samples kept per peer
    pub rtt_window: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            peer_id: PeerId::random(),
            role: Role::Performer,
            room: "default".to_string(),
            heartbeat_interval: Duration::from_secs(1),
            ping_timeout: Duration::from_secs(5),
            election_window: Duration::from_secs(2),
            sync_timeout: Duration::from_secs(5),
            phasor_update_interval: Duration::from_millis(16),
            sync_broadcast_interval: Duration::from_millis(100),
            cycle_duration: Duration::from_secs(2),
            correction_factor: 0.1,
            confidence_threshold: 0.5,
            auto_elect: true,
            scheduler_tolerance: 0.01,
            rtt_window: 10,
        }
    }
}

impl Config {
    /// Creates a default configuration for the given identity
    pub fn new(peer_id: PeerId, role: Role, room: impl Into<String>) -> Self {
        Config {
            peer_id,
            role,
            room: room.into(),
            ..Default::default()
        }
    }

    /// Parses and validates a JSON configuration
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)
            .map_err(|e| Error::config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that every value is usable
    pub fn validate(&self) -> Result<()> {
        if self.peer_id.as_str().is_empty() {
            return Err(Error::config("peer_id must not be empty"));
        }
        if self.room.is_empty() {
            return Err(Error::config("room must not be empty"));
        }
        let non_zero = [
            ("heartbeat_interval", self.heartbeat_interval),
            ("ping_timeout", self.ping_timeout),
            ("election_window", self.election_window),
            ("sync_timeout", self.sync_timeout),
            ("phasor_update_interval", self.phasor_update_interval),
            ("sync_broadcast_interval", self.sync_broadcast_interval),
            ("cycle_duration", self.cycle_duration),
        ];
        for (name, value) in non_zero {
            if value.is_zero() {
                return Err(Error::config(format!("{} must be greater than zero", name)));
            }
        }
        if !(self.correction_factor > 0.0 && self.correction_factor <= 1.0) {
            return Err(Error::config(format!(
                "correction_factor must be in (0, 1], got {}",
                self.correction_factor
            )));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(Error::config(format!(
                "confidence_threshold must be in [0, 1], got {}",
                self.confidence_threshold
            )));
        }
        if !(self.scheduler_tolerance >= 0.0 && self.scheduler_tolerance < 0.5) {
            return Err(Error::config(format!(
                "scheduler_tolerance must be in [0, 0.5), got {}",
                self.scheduler_tolerance
            )));
        }
        if self.rtt_window == 0 {
            return Err(Error::config("rtt_window must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_random() {
        let id1 = PeerId::random();
        let id2 = PeerId::random();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_role_topology() {
        assert!(Role::Conductor.links_with(Role::Performer));
        assert!(Role::Performer.links_with(Role::Conductor));
        assert!(Role::Conductor.links_with(Role::Conductor));
        assert!(!Role::Performer.links_with(Role::Performer));
    }

    #[test]
    fn test_initiator_is_deterministic() {
        let a = PeerId::new("a");
        let b = PeerId::new("b");
        assert!(Role::Conductor.initiates_to(&a, Role::Performer, &b));
        assert!(!Role::Performer.initiates_to(&b, Role::Conductor, &a));
        assert!(Role::Conductor.initiates_to(&a, Role::Conductor, &b));
        assert!(!Role::Conductor.initiates_to(&b, Role::Conductor, &a));
    }

    #[test]
    fn test_config_from_json() {
        let config = Config::from_json_str(
            r#"{"peer_id":"ctrl-1","role":"conductor","room":"studio","sync_timeout":2500}"#,
        )
        .unwrap();
        assert_eq!(config.peer_id, PeerId::new("ctrl-1"));
        assert_eq!(config.role, Role::Conductor);
        assert_eq!(config.sync_timeout, Duration::from_millis(2500));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_config_huge_duration_rejected() {
        let result = Config::from_json_str(r#"{"peer_id":"a","sync_timeout":1e300}"#);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.correction_factor = 0.0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = Config::default();
        config.election_window = Duration::ZERO;
        assert!(config.validate().is_err());
    }
}
