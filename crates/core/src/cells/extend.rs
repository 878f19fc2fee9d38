//! CREATE2 / CREATED2 / EXTEND2 / EXTENDED2 payload codecs
//!
//! CREATE2 carries the handshake directly in a link cell; EXTEND2 carries
//! the same handshake plus link specifiers inside a relay cell, addressed
//! to the hop that will dial the next relay.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use veilway_common::{handshake, Ed25519Identity, RelayFingerprint, RelayInfo, Error, Result};

/// One link specifier inside an EXTEND2 payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkSpec {
    /// Type 0: IPv4 address and port
    Ipv4(Ipv4Addr, u16),
    /// Type 1: IPv6 address and port
    Ipv6(Ipv6Addr, u16),
    /// Type 2: legacy identity fingerprint
    LegacyId(RelayFingerprint),
    /// Type 3: Ed25519 identity
    Ed25519Id(Ed25519Identity),
    /// Preserved unknown specifier
    Unknown { ls_type: u8, data: Vec<u8> },
}

impl LinkSpec {
    pub fn ls_type(&self) -> u8 {
        match self {
            Self::Ipv4(..) => 0,
            Self::Ipv6(..) => 1,
            Self::LegacyId(_) => 2,
            Self::Ed25519Id(_) => 3,
            Self::Unknown { ls_type, .. } => *ls_type,
        }
    }

    fn data(&self) -> Vec<u8> {
        match self {
            Self::Ipv4(addr, port) => {
                let mut buf = addr.octets().to_vec();
                buf.extend_from_slice(&port.to_be_bytes());
                buf
            }
            Self::Ipv6(addr, port) => {
                let mut buf = addr.octets().to_vec();
                buf.extend_from_slice(&port.to_be_bytes());
                buf
            }
            Self::LegacyId(fp) => fp.as_bytes().to_vec(),
            Self::Ed25519Id(id) => id.as_bytes().to_vec(),
            Self::Unknown { data, .. } => data.clone(),
        }
    }

    /// Append the LSType | LSLen | LSData wire form.
    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        let data = self.data();
        if data.len() > u8::MAX as usize {
            return Err(Error::malformed("link specifier too long"));
        }
        buf.push(self.ls_type());
        buf.push(data.len() as u8);
        buf.extend_from_slice(&data);
        Ok(())
    }

    fn parse(ls_type: u8, data: &[u8]) -> Result<Self> {
        match ls_type {
            0 => {
                if data.len() != 6 {
                    return Err(Error::malformed("IPv4 link specifier must be 6 bytes"));
                }
                let addr = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
                let port = u16::from_be_bytes([data[4], data[5]]);
                Ok(Self::Ipv4(addr, port))
            }
            1 => {
                if data.len() != 18 {
                    return Err(Error::malformed("IPv6 link specifier must be 18 bytes"));
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&data[..16]);
                let port = u16::from_be_bytes([data[16], data[17]]);
                Ok(Self::Ipv6(Ipv6Addr::from(octets), port))
            }
            2 => Ok(Self::LegacyId(RelayFingerprint::from_slice(data)?)),
            3 => {
                if data.len() != 32 {
                    return Err(Error::malformed("ed25519 link specifier must be 32 bytes"));
                }
                let mut id = [0u8; 32];
                id.copy_from_slice(data);
                Ok(Self::Ed25519Id(Ed25519Identity::from_bytes(id)))
            }
            other => Ok(Self::Unknown {
                ls_type: other,
                data: data.to_vec(),
            }),
        }
    }

    /// Link specifiers identifying a relay: address, legacy identity, and
    /// the Ed25519 identity when advertised.
    pub fn for_relay(relay: &RelayInfo) -> Vec<Self> {
        let mut specs = Vec::with_capacity(3);
        match &relay.addr {
            veilway_common::RelayAddr::Socket(SocketAddr::V4(sa)) => {
                specs.push(Self::Ipv4(*sa.ip(), sa.port()));
            }
            veilway_common::RelayAddr::Socket(SocketAddr::V6(sa)) => {
                specs.push(Self::Ipv6(*sa.ip(), sa.port()));
            }
            // Hostnames cannot be expressed as a link specifier; the
            // extending hop needs a literal address.
            veilway_common::RelayAddr::Domain { .. } => {}
        }
        specs.push(Self::LegacyId(relay.fingerprint));
        if let Some(ed) = relay.ed_identity {
            specs.push(Self::Ed25519Id(ed));
        }
        specs
    }
}

/// CREATE2 payload: HType(2) | HLen(2) | HData
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Create2Payload {
    pub htype: u16,
    pub hdata: Vec<u8>,
}

impl Create2Payload {
    pub fn ntor(hdata: Vec<u8>) -> Self {
        Self {
            htype: handshake::NTOR,
            hdata,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.hdata.len());
        buf.extend_from_slice(&self.htype.to_be_bytes());
        buf.extend_from_slice(&(self.hdata.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.hdata);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::malformed("CREATE2 payload truncated"));
        }
        let htype = u16::from_be_bytes([data[0], data[1]]);
        let hlen = u16::from_be_bytes([data[2], data[3]]) as usize;
        if data.len() < 4 + hlen {
            return Err(Error::malformed("CREATE2 handshake data truncated"));
        }
        Ok(Self {
            htype,
            hdata: data[4..4 + hlen].to_vec(),
        })
    }
}

/// CREATED2 / EXTENDED2 payload: HLen(2) | HData
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Created2Payload {
    pub hdata: Vec<u8>,
}

impl Created2Payload {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(2 + self.hdata.len());
        buf.extend_from_slice(&(self.hdata.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.hdata);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 2 {
            return Err(Error::malformed("CREATED2 payload truncated"));
        }
        let hlen = u16::from_be_bytes([data[0], data[1]]) as usize;
        if data.len() < 2 + hlen {
            return Err(Error::malformed("CREATED2 handshake data truncated"));
        }
        Ok(Self {
            hdata: data[2..2 + hlen].to_vec(),
        })
    }
}

/// EXTEND2 payload:
/// NSpec(1) | {LSType(1) | LSLen(1) | LSData}* | HType(2) | HLen(2) | HData
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extend2Payload {
    pub link_specs: Vec<LinkSpec>,
    pub htype: u16,
    pub hdata: Vec<u8>,
}

impl Extend2Payload {
    pub fn ntor(link_specs: Vec<LinkSpec>, hdata: Vec<u8>) -> Self {
        Self {
            link_specs,
            htype: handshake::NTOR,
            hdata,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.link_specs.len() > u8::MAX as usize {
            return Err(Error::malformed("too many link specifiers"));
        }
        let mut buf = Vec::new();
        buf.push(self.link_specs.len() as u8);
        for spec in &self.link_specs {
            spec.encode_into(&mut buf)?;
        }
        buf.extend_from_slice(&self.htype.to_be_bytes());
        buf.extend_from_slice(&(self.hdata.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.hdata);
        Ok(buf)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::malformed("EXTEND2 payload empty"));
        }
        let nspec = data[0] as usize;
        let mut offset = 1;
        let mut link_specs = Vec::with_capacity(nspec);
        for _ in 0..nspec {
            if offset + 2 > data.len() {
                return Err(Error::malformed("link specifier header truncated"));
            }
            let ls_type = data[offset];
            let ls_len = data[offset + 1] as usize;
            offset += 2;
            if offset + ls_len > data.len() {
                return Err(Error::malformed("link specifier data truncated"));
            }
            link_specs.push(LinkSpec::parse(ls_type, &data[offset..offset + ls_len])?);
            offset += ls_len;
        }
        if offset + 4 > data.len() {
            return Err(Error::malformed("EXTEND2 handshake header truncated"));
        }
        let htype = u16::from_be_bytes([data[offset], data[offset + 1]]);
        let hlen = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        offset += 4;
        if offset + hlen > data.len() {
            return Err(Error::malformed("EXTEND2 handshake data truncated"));
        }
        Ok(Self {
            link_specs,
            htype,
            hdata: data[offset..offset + hlen].to_vec(),
        })
    }
}
