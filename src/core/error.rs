use std::io;
use thiserror::Error;

/// Everything that can go wrong inside a mesh node
#[derive(Error, Debug)]
pub enum Error {
    /// Socket or stream failure
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Malformed JSON in a config, signal payload or hello frame
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A message failed decoding or range validation
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Link setup, relay or send failure
    #[error("Network error: {0}")]
    Network(String),

    /// A peer was refused or is unknown
    #[error("Peer error: {0}")]
    Peer(String),

    /// Bad cycle length or timing parameter
    #[error("Timing error: {0}")]
    Timing(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Election error: {0}")]
    Election(String),

    /// A phasor broadcast could not be applied
    #[error("Sync error: {0}")]
    Sync(String),

    /// A phase event could not be scheduled
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// Operation not valid for the node's role or lifecycle stage
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Crate-wide result
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn network(msg: impl Into<String>) -> Self {
        Error::Network(msg.into())
    }

    pub fn peer(msg: impl Into<String>) -> Self {
        Error::Peer(msg.into())
    }

    pub fn timing(msg: impl Into<String>) -> Self {
        Error::Timing(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn election(msg: impl Into<String>) -> Self {
        Error::Election(msg.into())
    }

    pub fn sync(msg: impl Into<String>) -> Self {
        Error::Sync(msg.into())
    }

    pub fn scheduler(msg: impl Into<String>) -> Self {
        Error::Scheduler(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::protocol("missing field `id`");
        assert!(matches!(err, Error::Protocol(_)));
        assert_eq!(err.to_string(), "Protocol error: missing field `id`");
        assert_eq!(
            Error::sync("rejecting phasor 2").to_string(),
            "Sync error: rejecting phasor 2"
        );
    }

    #[test]
    fn test_error_conversion() {
        let err: Error = io::Error::new(io::ErrorKind::ConnectionReset, "reset").into();
        assert!(matches!(err, Error::Io(_)));

        let err: Error = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, Error::Json(_)));
    }
}
