//! Phasor Mesh: conductor/performer phase synchronization over a peer mesh
//!
//! Nodes form a star-shaped mesh of point-to-point links, elect one conductor
//! as the time authority and keep a shared cyclical clock (the phasor) locked
//! across every performer. A phase-triggered scheduler fires callbacks at
//! positions of the local phasor.
pub mod core;

pub mod network;
pub mod node;
pub mod protocol;
pub mod sync;
pub mod time;
pub mod util;

// Re-export commonly used items
pub use crate::core::{Config, Error, PeerId, Result, Role};
pub use crate::node::{Node, NodeEvent};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
