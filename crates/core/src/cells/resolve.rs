//! RELAY_RESOLVE / RELAY_RESOLVED codec
//!
//! A RESOLVE request is a NUL-terminated hostname (or a typed address for
//! reverse lookups). The RESOLVED answer is a stream of records:
//! Type(1) | Len(1) | Value(Len) | TTL(4 BE).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use veilway_common::{Error, Result};

/// Answer record type codes
const TYPE_HOSTNAME: u8 = 0x00;
const TYPE_IPV4: u8 = 0x04;
const TYPE_IPV6: u8 = 0x06;
const TYPE_ERROR: u8 = 0xF0;
const TYPE_ERROR_TTL: u8 = 0xF1;

/// Resolution error codes (DNS RCODE values 0-5)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveError {
    NoError,
    FormatError,
    ServerFailure,
    NxDomain,
    NotImplemented,
    Refused,
    /// Codes outside 0-5, preserved
    Other(u8),
}

impl ResolveError {
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Self::NoError,
            1 => Self::FormatError,
            2 => Self::ServerFailure,
            3 => Self::NxDomain,
            4 => Self::NotImplemented,
            5 => Self::Refused,
            other => Self::Other(other),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Self::NoError => 0,
            Self::FormatError => 1,
            Self::ServerFailure => 2,
            Self::NxDomain => 3,
            Self::NotImplemented => 4,
            Self::Refused => 5,
            Self::Other(code) => *code,
        }
    }
}

/// One decoded RESOLVED answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedAnswer {
    Hostname(String),
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Error(ResolveError),
}

/// An answer together with its TTL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRecord {
    pub answer: ResolvedAnswer,
    pub ttl: u32,
}

/// Encode a forward-lookup request for a hostname.
pub fn encode_hostname_request(hostname: &str) -> Vec<u8> {
    let mut buf = hostname.as_bytes().to_vec();
    buf.push(0);
    buf
}

/// Encode a reverse-lookup (PTR) request for an address.
pub fn encode_ptr_request(addr: IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(v4) => {
            let mut buf = vec![TYPE_IPV4, 4];
            buf.extend_from_slice(&v4.octets());
            buf
        }
        IpAddr::V6(v6) => {
            let mut buf = vec![TYPE_IPV6, 16];
            buf.extend_from_slice(&v6.octets());
            buf
        }
    }
}

/// Parse a RESOLVED payload into its answer records.
pub fn parse_resolved(data: &[u8]) -> Result<Vec<ResolvedRecord>> {
    let mut records = Vec::new();
    let mut offset = 0;

    while offset < data.len() {
        if offset + 2 > data.len() {
            return Err(Error::malformed("resolved record header truncated"));
        }
        let rec_type = data[offset];
        let len = data[offset + 1] as usize;
        offset += 2;

        if offset + len + 4 > data.len() {
            return Err(Error::malformed("resolved record value truncated"));
        }
        let value = &data[offset..offset + len];
        offset += len;
        let ttl = u32::from_be_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ]);
        offset += 4;

        let answer = match rec_type {
            TYPE_HOSTNAME => {
                let host = std::str::from_utf8(value)
                    .map_err(|_| Error::malformed("hostname record not UTF-8"))?;
                ResolvedAnswer::Hostname(host.to_string())
            }
            TYPE_IPV4 => {
                if len != 4 {
                    return Err(Error::malformed("IPv4 record must be 4 bytes"));
                }
                ResolvedAnswer::Ipv4(Ipv4Addr::new(value[0], value[1], value[2], value[3]))
            }
            TYPE_IPV6 => {
                if len != 16 {
                    return Err(Error::malformed("IPv6 record must be 16 bytes"));
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(value);
                ResolvedAnswer::Ipv6(Ipv6Addr::from(octets))
            }
            TYPE_ERROR | TYPE_ERROR_TTL => {
                let code = value.first().copied().unwrap_or(0);
                ResolvedAnswer::Error(ResolveError::from_code(code))
            }
            other => {
                return Err(Error::malformed(format!(
                    "unknown resolved record type 0x{:02X}",
                    other
                )));
            }
        };

        records.push(ResolvedRecord { answer, ttl });
    }

    Ok(records)
}
