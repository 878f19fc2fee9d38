use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// SHA-1 identity fingerprint of a relay (20 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelayFingerprint(#[serde(with = "serde_bytes")] pub [u8; 20]);

impl RelayFingerprint {
    pub const LEN: usize = 20;

    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::LEN {
            return Err(Error::protocol(format!(
                "fingerprint must be {} bytes, got {}",
                Self::LEN,
                bytes.len()
            )));
        }
        let mut array = [0u8; 20];
        array.copy_from_slice(bytes);
        Ok(Self(array))
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|_| Error::protocol("invalid fingerprint hex"))?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl std::fmt::Display for RelayFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Ed25519 identity key of a relay (32 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ed25519Identity(#[serde(with = "serde_bytes")] pub [u8; 32]);

impl Ed25519Identity {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for Ed25519Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ed25519:{}", data_encoding::BASE64_NOPAD.encode(&self.0))
    }
}

/// Network address of a relay
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelayAddr {
    /// Standard socket address (IP + port)
    Socket(SocketAddr),
    /// Hostname + port
    Domain { host: String, port: u16 },
}

impl RelayAddr {
    pub fn from_socket(addr: SocketAddr) -> Self {
        Self::Socket(addr)
    }

    pub fn from_domain(host: String, port: u16) -> Self {
        Self::Domain { host, port }
    }

    pub fn port(&self) -> u16 {
        match self {
            Self::Socket(addr) => addr.port(),
            Self::Domain { port, .. } => *port,
        }
    }
}

impl std::fmt::Display for RelayAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Socket(addr) => write!(f, "{}", addr),
            Self::Domain { host, port } => write!(f, "{}:{}", host, port),
        }
    }
}

/// Role flags a relay advertises
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayFlags {
    pub is_guard: bool,
    pub is_exit: bool,
    pub is_hsdir: bool,
}

/// Everything the engine needs to know about one relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayInfo {
    /// Identity fingerprint
    pub fingerprint: RelayFingerprint,

    /// Ed25519 identity, if the relay advertises one
    pub ed_identity: Option<Ed25519Identity>,

    /// Reachable address
    pub addr: RelayAddr,

    /// Curve25519 onion key for the ntor handshake
    #[serde(with = "serde_bytes")]
    pub ntor_onion_key: [u8; 32],

    /// Role flags
    pub flags: RelayFlags,
}

/// Direction of cell flow on a circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client toward exit
    Forward,
    /// Exit toward client
    Backward,
}

impl Direction {
    pub fn flip(self) -> Self {
        match self {
            Self::Forward => Self::Backward,
            Self::Backward => Self::Forward,
        }
    }

    pub fn index(self) -> usize {
        match self {
            Self::Forward => 0,
            Self::Backward => 1,
        }
    }
}

/// Timestamp in Unix epoch seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("System time before Unix epoch");
        Self(duration.as_secs())
    }

    pub fn from_secs(secs: u64) -> Self {
        Self(secs)
    }

    pub fn as_secs(&self) -> u64 {
        self.0
    }

    pub fn elapsed(&self) -> Duration {
        let now = Self::now();
        Duration::from_secs(now.0.saturating_sub(self.0))
    }

    pub fn plus(&self, d: Duration) -> Self {
        Self(self.0.saturating_add(d.as_secs()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_fingerprint_hex_roundtrip() {
        let fp = RelayFingerprint::from_bytes([0xAB; 20]);
        let parsed = RelayFingerprint::from_hex(&fp.to_string()).unwrap();
        assert_eq!(fp, parsed);
    }

    #[test]
    fn test_fingerprint_length_check() {
        assert!(RelayFingerprint::from_slice(&[0u8; 19]).is_err());
        assert!(RelayFingerprint::from_slice(&[0u8; 21]).is_err());
        assert!(RelayFingerprint::from_slice(&[0u8; 20]).is_ok());
    }

    #[test]
    fn test_relay_addr_display() {
        let sock = RelayAddr::from_socket(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
            9001,
        ));
        assert_eq!(sock.to_string(), "192.0.2.1:9001");
        assert_eq!(sock.port(), 9001);

        let dom = RelayAddr::from_domain("relay.example".into(), 443);
        assert_eq!(dom.to_string(), "relay.example:443");
    }

    #[test]
    fn test_direction_flip() {
        assert_eq!(Direction::Forward.flip(), Direction::Backward);
        assert_eq!(Direction::Backward.flip(), Direction::Forward);
        assert_ne!(Direction::Forward.index(), Direction::Backward.index());
    }

    #[test]
    fn test_timestamp_plus() {
        let ts = Timestamp::from_secs(100);
        assert_eq!(ts.plus(Duration::from_secs(50)).as_secs(), 150);
    }

    #[test]
    fn test_relay_info_wire_roundtrip() {
        let info = RelayInfo {
            fingerprint: RelayFingerprint::from_bytes([0x42; 20]),
            ed_identity: Some(Ed25519Identity::from_bytes([0x43; 32])),
            addr: RelayAddr::from_socket(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::new(203, 0, 113, 5)),
                443,
            )),
            ntor_onion_key: [0x44; 32],
            flags: RelayFlags {
                is_guard: true,
                is_exit: false,
                is_hsdir: true,
            },
        };

        let bytes = bincode::serialize(&info).unwrap();
        let decoded: RelayInfo = bincode::deserialize(&bytes).unwrap();
        assert_eq!(info, decoded);
    }
}
