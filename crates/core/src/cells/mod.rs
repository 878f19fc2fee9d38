//! Link-level cell codec
//!
//! Cells are the unit of transport on a guard connection. Fixed-length
//! cells are 514 bytes on link protocol v4+; VERSIONS and every command
//! at or above 128 use the variable-length shape with a 2-byte length
//! prefix.

mod extend;
mod relay;
mod resolve;

pub use extend::{Create2Payload, Created2Payload, Extend2Payload, LinkSpec};
pub use relay::{end_reason, parse_connected, RelayCell, RelayCommand};
pub use resolve::{
    encode_hostname_request, encode_ptr_request, parse_resolved, ResolveError, ResolvedAnswer,
    ResolvedRecord,
};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use veilway_common::{cell, Error, Result};

/// Link-level cell commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CellCommand {
    Padding = 0,
    Create = 1,
    Created = 2,
    Relay = 3,
    Destroy = 4,
    CreateFast = 5,
    CreatedFast = 6,
    Versions = 7,
    Netinfo = 8,
    RelayEarly = 9,
    Create2 = 10,
    Created2 = 11,
    PaddingNegotiate = 12,
    Vpadding = 128,
    Certs = 129,
    AuthChallenge = 130,
    Authenticate = 131,
    Authorize = 132,
}

impl CellCommand {
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            0 => Some(Self::Padding),
            1 => Some(Self::Create),
            2 => Some(Self::Created),
            3 => Some(Self::Relay),
            4 => Some(Self::Destroy),
            5 => Some(Self::CreateFast),
            6 => Some(Self::CreatedFast),
            7 => Some(Self::Versions),
            8 => Some(Self::Netinfo),
            9 => Some(Self::RelayEarly),
            10 => Some(Self::Create2),
            11 => Some(Self::Created2),
            12 => Some(Self::PaddingNegotiate),
            128 => Some(Self::Vpadding),
            129 => Some(Self::Certs),
            130 => Some(Self::AuthChallenge),
            131 => Some(Self::Authenticate),
            132 => Some(Self::Authorize),
            _ => None,
        }
    }

    /// Whether a raw command byte selects the variable-length shape.
    pub fn is_variable_length(raw: u8) -> bool {
        raw == Self::Versions as u8 || raw >= 128
    }
}

/// DESTROY reason codes
pub mod destroy_reason {
    pub const NONE: u8 = 0;
    pub const PROTOCOL: u8 = 1;
    pub const INTERNAL: u8 = 2;
    pub const REQUESTED: u8 = 3;
    pub const HIBERNATING: u8 = 4;
    pub const RESOURCELIMIT: u8 = 5;
    pub const CONNECTFAILED: u8 = 6;
    pub const OR_IDENTITY: u8 = 7;
    pub const CHANNEL_CLOSED: u8 = 8;
    pub const FINISHED: u8 = 9;
    pub const TIMEOUT: u8 = 10;
    pub const DESTROYED: u8 = 11;
    pub const NOSUCHSERVICE: u8 = 12;
}

/// Payload of a VERSIONS cell: one big-endian u16 per supported link
/// protocol version.
pub fn encode_versions(versions: &[u16]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(versions.len() * 2);
    for version in versions {
        buf.extend_from_slice(&version.to_be_bytes());
    }
    buf
}

/// Parse a VERSIONS payload.
pub fn parse_versions(payload: &[u8]) -> Result<Vec<u16>> {
    if payload.len() % 2 != 0 {
        return Err(Error::malformed("VERSIONS payload has odd length"));
    }
    Ok(payload
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

/// One cell on the guard link
///
/// The command is kept as the raw byte so cells with commands this
/// implementation does not know are preserved rather than rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    /// Circuit ID (4 bytes on link protocol v4+)
    pub circuit_id: u32,

    /// Raw command byte
    command: u8,

    /// Payload; padded out to 509 bytes on the wire for fixed cells
    pub payload: Vec<u8>,
}

impl Cell {
    pub fn new(circuit_id: u32, command: CellCommand, payload: Vec<u8>) -> Self {
        Self {
            circuit_id,
            command: command as u8,
            payload,
        }
    }

    /// Build a cell from a raw command byte, preserving unknown values.
    pub fn from_raw(circuit_id: u32, command: u8, payload: Vec<u8>) -> Self {
        Self {
            circuit_id,
            command,
            payload,
        }
    }

    pub fn relay(circuit_id: u32, relay_payload: Vec<u8>) -> Self {
        Self::new(circuit_id, CellCommand::Relay, relay_payload)
    }

    pub fn relay_early(circuit_id: u32, relay_payload: Vec<u8>) -> Self {
        Self::new(circuit_id, CellCommand::RelayEarly, relay_payload)
    }

    pub fn padding(circuit_id: u32) -> Self {
        Self::new(circuit_id, CellCommand::Padding, Vec::new())
    }

    pub fn destroy(circuit_id: u32, reason: u8) -> Self {
        Self::new(circuit_id, CellCommand::Destroy, vec![reason])
    }

    /// Decoded command, if the byte is one we know.
    pub fn command(&self) -> Option<CellCommand> {
        CellCommand::from_u8(self.command)
    }

    pub fn raw_command(&self) -> u8 {
        self.command
    }

    pub fn is_variable_length(&self) -> bool {
        CellCommand::is_variable_length(self.command)
    }

    /// Serialize to wire bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if self.is_variable_length() {
            if self.payload.len() > u16::MAX as usize {
                return Err(Error::malformed(format!(
                    "variable cell payload too long: {}",
                    self.payload.len()
                )));
            }
            let mut buf = Vec::with_capacity(7 + self.payload.len());
            buf.extend_from_slice(&self.circuit_id.to_be_bytes());
            buf.push(self.command);
            buf.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
            buf.extend_from_slice(&self.payload);
            Ok(buf)
        } else {
            if self.payload.len() > cell::PAYLOAD_LEN {
                return Err(Error::malformed(format!(
                    "fixed cell payload too long: {}",
                    self.payload.len()
                )));
            }
            let mut buf = Vec::with_capacity(cell::CELL_LEN);
            buf.extend_from_slice(&self.circuit_id.to_be_bytes());
            buf.push(self.command);
            buf.extend_from_slice(&self.payload);
            buf.resize(cell::CELL_LEN, 0);
            Ok(buf)
        }
    }

    /// Parse one cell from a byte slice containing exactly one cell.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 5 {
            return Err(Error::malformed("cell header truncated"));
        }
        let circuit_id = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let command = data[4];

        if CellCommand::is_variable_length(command) {
            if data.len() < 7 {
                return Err(Error::malformed("variable cell length truncated"));
            }
            let length = u16::from_be_bytes([data[5], data[6]]) as usize;
            if data.len() != 7 + length {
                return Err(Error::malformed(format!(
                    "variable cell length mismatch: header says {}, have {}",
                    length,
                    data.len() - 7
                )));
            }
            Ok(Self::from_raw(circuit_id, command, data[7..].to_vec()))
        } else {
            if data.len() != cell::CELL_LEN {
                return Err(Error::malformed(format!(
                    "fixed cell must be {} bytes, got {}",
                    cell::CELL_LEN,
                    data.len()
                )));
            }
            Ok(Self::from_raw(circuit_id, command, data[5..].to_vec()))
        }
    }

    /// Write one cell to an async writer.
    pub async fn encode_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let bytes = self.to_bytes()?;
        writer.write_all(&bytes).await?;
        Ok(())
    }

    /// Read one cell from an async reader.
    pub async fn decode_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut header = [0u8; 5];
        reader.read_exact(&mut header).await?;
        let circuit_id = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let command = header[4];

        let payload = if CellCommand::is_variable_length(command) {
            let mut len_bytes = [0u8; 2];
            reader.read_exact(&mut len_bytes).await?;
            let length = u16::from_be_bytes(len_bytes) as usize;
            let mut payload = vec![0u8; length];
            reader.read_exact(&mut payload).await?;
            payload
        } else {
            let mut payload = vec![0u8; cell::PAYLOAD_LEN];
            reader.read_exact(&mut payload).await?;
            payload
        };

        Ok(Self::from_raw(circuit_id, command, payload))
    }
}
