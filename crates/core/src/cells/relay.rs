//! Relay cell sub-codec
//!
//! A relay cell is the 509-byte payload of a RELAY or RELAY_EARLY cell:
//! command(1) | recognized(2) | stream_id(2) | digest(4) | length(2) |
//! data(<=498) | zero padding. Stream ID 0 addresses the circuit itself.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use veilway_common::{cell, Error, Result};

/// Commands multiplexed inside a relay cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayCommand {
    Begin,
    Data,
    End,
    Connected,
    Sendme,
    Extend,
    Extended,
    Truncate,
    Truncated,
    Drop,
    Resolve,
    Resolved,
    BeginDir,
    Extend2,
    Extended2,
    EstablishIntro,
    EstablishRendezvous,
    Introduce1,
    Introduce2,
    Rendezvous1,
    Rendezvous2,
    IntroEstablished,
    RendezvousEstablished,
    IntroduceAck,
    /// Preserved so unrecognized commands can be routed by policy
    Unknown(u8),
}

impl RelayCommand {
    pub fn from_u8(cmd: u8) -> Self {
        match cmd {
            1 => Self::Begin,
            2 => Self::Data,
            3 => Self::End,
            4 => Self::Connected,
            5 => Self::Sendme,
            6 => Self::Extend,
            7 => Self::Extended,
            8 => Self::Truncate,
            9 => Self::Truncated,
            10 => Self::Drop,
            11 => Self::Resolve,
            12 => Self::Resolved,
            13 => Self::BeginDir,
            14 => Self::Extend2,
            15 => Self::Extended2,
            32 => Self::EstablishIntro,
            33 => Self::EstablishRendezvous,
            34 => Self::Introduce1,
            35 => Self::Introduce2,
            36 => Self::Rendezvous1,
            37 => Self::Rendezvous2,
            38 => Self::IntroEstablished,
            39 => Self::RendezvousEstablished,
            40 => Self::IntroduceAck,
            other => Self::Unknown(other),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            Self::Begin => 1,
            Self::Data => 2,
            Self::End => 3,
            Self::Connected => 4,
            Self::Sendme => 5,
            Self::Extend => 6,
            Self::Extended => 7,
            Self::Truncate => 8,
            Self::Truncated => 9,
            Self::Drop => 10,
            Self::Resolve => 11,
            Self::Resolved => 12,
            Self::BeginDir => 13,
            Self::Extend2 => 14,
            Self::Extended2 => 15,
            Self::EstablishIntro => 32,
            Self::EstablishRendezvous => 33,
            Self::Introduce1 => 34,
            Self::Introduce2 => 35,
            Self::Rendezvous1 => 36,
            Self::Rendezvous2 => 37,
            Self::IntroEstablished => 38,
            Self::RendezvousEstablished => 39,
            Self::IntroduceAck => 40,
            Self::Unknown(other) => *other,
        }
    }
}

/// END reason codes
pub mod end_reason {
    pub const MISC: u8 = 1;
    pub const RESOLVEFAILED: u8 = 2;
    pub const CONNECTREFUSED: u8 = 3;
    pub const EXITPOLICY: u8 = 4;
    pub const DESTROY: u8 = 5;
    pub const DONE: u8 = 6;
    pub const TIMEOUT: u8 = 7;
    pub const NOROUTE: u8 = 8;
    pub const HIBERNATING: u8 = 9;
    pub const INTERNAL: u8 = 10;
    pub const RESOURCELIMIT: u8 = 11;
    pub const CONNRESET: u8 = 12;
    pub const TORPROTOCOL: u8 = 13;
    pub const NOTDIRECTORY: u8 = 14;
}

/// A decoded relay cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCell {
    /// Relay command
    pub command: RelayCommand,

    /// Zero when the cell is addressed to this hop
    pub recognized: u16,

    /// Stream ID; 0 for circuit-level commands
    pub stream_id: u16,

    /// Running-digest prefix
    pub digest: [u8; 4],

    /// Data bytes (length field is derived)
    pub data: Vec<u8>,
}

impl RelayCell {
    pub fn new(command: RelayCommand, stream_id: u16, data: Vec<u8>) -> Self {
        Self {
            command,
            recognized: 0,
            stream_id,
            digest: [0; 4],
            data,
        }
    }

    /// Circuit-level SENDME (stream ID 0).
    pub fn circuit_sendme() -> Self {
        Self::new(RelayCommand::Sendme, 0, Vec::new())
    }

    /// Stream-level SENDME.
    pub fn stream_sendme(stream_id: u16) -> Self {
        Self::new(RelayCommand::Sendme, stream_id, Vec::new())
    }

    /// BEGIN carrying "host:port\0" plus a 4-byte flags word.
    pub fn begin(stream_id: u16, host: &str, port: u16, flags: u32) -> Self {
        let mut data = format!("{}:{}", host, port).into_bytes();
        data.push(0);
        data.extend_from_slice(&flags.to_be_bytes());
        Self::new(RelayCommand::Begin, stream_id, data)
    }

    /// END with a reason code.
    pub fn end(stream_id: u16, reason: u8) -> Self {
        Self::new(RelayCommand::End, stream_id, vec![reason])
    }

    pub fn is_circuit_level(&self) -> bool {
        self.stream_id == 0
    }

    /// Encode into a 509-byte relay payload, zero-padded.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.data.len() > cell::RELAY_DATA_MAX {
            return Err(Error::malformed(format!(
                "relay data too long: {} > {}",
                self.data.len(),
                cell::RELAY_DATA_MAX
            )));
        }

        let mut buf = Vec::with_capacity(cell::PAYLOAD_LEN);
        buf.push(self.command.as_u8());
        buf.extend_from_slice(&self.recognized.to_be_bytes());
        buf.extend_from_slice(&self.stream_id.to_be_bytes());
        buf.extend_from_slice(&self.digest);
        buf.extend_from_slice(&(self.data.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.data);
        buf.resize(cell::PAYLOAD_LEN, 0);
        Ok(buf)
    }

    /// Decode from a relay payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < cell::RELAY_HEADER_LEN {
            return Err(Error::malformed("relay cell header truncated"));
        }

        let command = RelayCommand::from_u8(payload[0]);
        let recognized = u16::from_be_bytes([payload[1], payload[2]]);
        let stream_id = u16::from_be_bytes([payload[3], payload[4]]);
        let digest = [payload[5], payload[6], payload[7], payload[8]];
        let length = u16::from_be_bytes([payload[9], payload[10]]) as usize;

        if length > cell::RELAY_DATA_MAX {
            return Err(Error::malformed(format!(
                "relay length field too large: {}",
                length
            )));
        }
        let end = cell::RELAY_HEADER_LEN + length;
        if end > payload.len() {
            return Err(Error::malformed("relay cell data truncated"));
        }

        Ok(Self {
            command,
            recognized,
            stream_id,
            digest,
            data: payload[cell::RELAY_HEADER_LEN..end].to_vec(),
        })
    }

    /// Reason code of an END cell, defaulting to MISC when absent.
    pub fn end_reason(&self) -> u8 {
        self.data.first().copied().unwrap_or(end_reason::MISC)
    }
}

/// Parse a CONNECTED payload into the bound address and TTL.
///
/// Empty payloads (older exits) yield None. IPv6 uses the AF marker form:
/// 4 zero bytes, address type 6, length 16.
pub fn parse_connected(data: &[u8]) -> Option<(IpAddr, u32)> {
    if data.is_empty() {
        return None;
    }
    if data.len() >= 8 && data[..4] != [0, 0, 0, 0] {
        let addr = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
        let ttl = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        return Some((IpAddr::V4(addr), ttl));
    }
    if data.len() >= 26 && data[4] == 6 && data[5] == 16 {
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&data[6..22]);
        let ttl = u32::from_be_bytes([data[22], data[23], data[24], data[25]]);
        return Some((IpAddr::V6(Ipv6Addr::from(octets)), ttl));
    }
    None
}
