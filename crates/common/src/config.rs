use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Cell wire-format constants (link protocol v4+)
pub mod cell {
    /// Total size of a fixed-length cell
    pub const CELL_LEN: usize = 514;

    /// Payload size of a fixed-length cell
    pub const PAYLOAD_LEN: usize = 509;

    /// Circuit-ID width in bytes
    pub const CIRCID_LEN: usize = 4;

    /// Relay header: command(1) + recognized(2) + stream(2) + digest(4) + length(2)
    pub const RELAY_HEADER_LEN: usize = 11;

    /// Maximum data bytes inside one relay cell
    pub const RELAY_DATA_MAX: usize = 498;
}

/// Flow-control window constants
pub mod flow {
    /// Initial circuit-level package/deliver window
    pub const CIRCUIT_WINDOW_INITIAL: u16 = 1000;

    /// Circuit window increment per SENDME
    pub const CIRCUIT_WINDOW_INCREMENT: u16 = 100;

    /// A circuit-level SENDME is emitted every this many delivered DATA cells
    pub const CIRCUIT_SENDME_EVERY: u16 = 100;

    /// Initial stream-level window
    pub const STREAM_WINDOW_INITIAL: u16 = 500;

    /// Stream window increment per SENDME
    pub const STREAM_WINDOW_INCREMENT: u16 = 50;
}

/// Circuit-level padding policy constants
pub mod padding {
    /// Default interval between padding cells
    pub const DEFAULT_INTERVAL_SECS: u64 = 5;

    /// Padding fires only when non-padding activity has been quiet for
    /// ACTIVITY_NUM/ACTIVITY_DEN of the interval
    pub const ACTIVITY_NUM: u32 = 4;
    pub const ACTIVITY_DEN: u32 = 5;
}

/// Circuit lifecycle constants
pub mod circuit {
    /// Standard number of hops in a client circuit
    pub const HOPS: usize = 3;

    /// Bounded inbound FIFO of decoded relay cells
    pub const INBOUND_FIFO_CAPACITY: usize = 32;

    /// Drop policy: give up enqueueing an inbound cell after this long
    pub const FIFO_ENQUEUE_TIMEOUT_MS: u64 = 100;

    /// Poll interval for wait_for_count / wait_for_state
    pub const WAIT_POLL_INTERVAL_MS: u64 = 100;

    /// Sliding-window capacity of the per-direction replay guard
    pub const REPLAY_WINDOW: usize = 4096;

    /// Default timeout for a full 3-hop build
    pub const DEFAULT_BUILD_TIMEOUT_SECS: u64 = 60;

    /// Per-step timeout while waiting for CREATED2/EXTENDED2
    pub const HANDSHAKE_STEP_TIMEOUT_SECS: u64 = 20;
}

/// Handshake type codes carried in CREATE2/EXTEND2
pub mod handshake {
    /// Legacy TAP handshake; not supported by this implementation
    pub const TAP: u16 = 0x0000;

    /// ntor handshake
    pub const NTOR: u16 = 0x0002;

    /// Client onionskin: ID(20) + B(32) + X(32)
    pub const NTOR_ONIONSKIN_LEN: usize = 84;

    /// Server reply: Y(32) + AUTH(32)
    pub const NTOR_REPLY_LEN: usize = 64;
}

/// Hidden-service constants
pub mod hs {
    /// Onion address version byte
    pub const ADDRESS_VERSION: u8 = 3;

    /// Base32 length of a v3 onion address (without suffix)
    pub const ADDRESS_BASE32_LEN: usize = 56;

    /// Default descriptor lifetime
    pub const DESCRIPTOR_LIFETIME_SECS: u64 = 3 * 3600;

    /// Introduction points per descriptor
    pub const MIN_INTRO_POINTS: usize = 1;
    pub const MAX_INTRO_POINTS: usize = 10;

    /// Introduction attempts per connect before giving up
    pub const INTRO_RETRY_LIMIT: usize = 3;

    /// Descriptor replicas on the HSDir ring
    pub const REPLICAS: u8 = 2;

    /// Responsible HSDirs per replica
    pub const HSDIR_SPREAD: usize = 3;

    /// Rendezvous cookie length
    pub const REND_COOKIE_LEN: usize = 20;

    /// Time periods are 24 hours, offset by 12 hours
    pub const TIME_PERIOD_LENGTH_SECS: u64 = 86400;
    pub const TIME_PERIOD_OFFSET_SECS: u64 = 43200;
}

/// Tunable knobs of the protocol engine
///
/// Loading these from a file is the embedder's job; the engine only
/// consumes the typed value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Whether circuits emit link padding
    pub padding_enabled: bool,

    /// Interval between padding cells; zero disables padding
    pub padding_interval: Duration,

    /// Timeout for a full 3-hop circuit build
    pub build_timeout: Duration,

    /// Introduction attempts per hidden-service connect
    pub intro_retry_limit: usize,

    /// Lifetime applied to cached descriptors that carry none
    pub descriptor_lifetime: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            padding_enabled: true,
            padding_interval: Duration::from_secs(padding::DEFAULT_INTERVAL_SECS),
            build_timeout: Duration::from_secs(circuit::DEFAULT_BUILD_TIMEOUT_SECS),
            intro_retry_limit: hs::INTRO_RETRY_LIMIT,
            descriptor_lifetime: Duration::from_secs(hs::DESCRIPTOR_LIFETIME_SECS),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_padding(mut self, enabled: bool, interval: Duration) -> Self {
        self.padding_enabled = enabled;
        self.padding_interval = interval;
        self
    }

    pub fn with_build_timeout(mut self, timeout: Duration) -> Self {
        self.build_timeout = timeout;
        self
    }

    pub fn with_intro_retry_limit(mut self, limit: usize) -> Self {
        self.intro_retry_limit = limit;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert!(config.padding_enabled);
        assert_eq!(config.padding_interval, Duration::from_secs(5));
        assert_eq!(config.intro_retry_limit, 3);
    }

    #[test]
    fn test_config_builder() {
        let config = EngineConfig::new()
            .with_padding(false, Duration::from_secs(9))
            .with_build_timeout(Duration::from_secs(30))
            .with_intro_retry_limit(5);

        assert!(!config.padding_enabled);
        assert_eq!(config.padding_interval, Duration::from_secs(9));
        assert_eq!(config.build_timeout, Duration::from_secs(30));
        assert_eq!(config.intro_retry_limit, 5);
    }

    #[test]
    fn test_wire_constants() {
        assert_eq!(cell::CELL_LEN, cell::CIRCID_LEN + 1 + cell::PAYLOAD_LEN);
        assert_eq!(
            cell::RELAY_DATA_MAX,
            cell::PAYLOAD_LEN - cell::RELAY_HEADER_LEN
        );
    }
}
