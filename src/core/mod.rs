//! Core types and traits for the phasor mesh
//! 
//! This module contains the fundamental building blocks used throughout the library.

pub mod error;
pub mod types;
pub mod serde;

pub use self::error::{Error, Result};
pub use self::types::{Config, PeerId, Role};

/// Wire protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum encoded message size in bytes
pub const MAX_MESSAGE_SIZE: usize = 65507; // Maximum UDP payload size
