pub mod config;
pub mod error;
pub mod types;

pub use config::{cell, circuit, flow, handshake, hs, padding, EngineConfig};
pub use error::{Error, Result};
pub use types::{
    Direction, Ed25519Identity, RelayAddr, RelayFingerprint, RelayFlags, RelayInfo, Timestamp,
};
