//! v3 onion addresses
//!
//! base32(pubkey(32) | checksum(2) | version(1)) + ".onion", 56 base32
//! characters, case-insensitive. The checksum is the first two bytes of
//! SHA3-256(".onion checksum" | pubkey | version), so the name
//! authenticates the service key it names.

use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use veilway_common::{hs, Error, Result};

const CHECKSUM_PREFIX: &[u8] = b".onion checksum";

/// A parsed v3 onion address: the service's Ed25519 public key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OnionAddress(#[serde(with = "serde_bytes")] [u8; 32]);

impl OnionAddress {
    pub fn from_pubkey(pubkey: [u8; 32]) -> Self {
        Self(pubkey)
    }

    pub fn pubkey(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse an address, with or without the ".onion" suffix.
    pub fn parse(s: &str) -> Result<Self> {
        let trimmed = s.trim().to_lowercase();
        let body = trimmed.strip_suffix(".onion").unwrap_or(&trimmed);

        if body.len() != hs::ADDRESS_BASE32_LEN {
            return Err(Error::address(format!(
                "expected {} base32 characters, got {}",
                hs::ADDRESS_BASE32_LEN,
                body.len()
            )));
        }

        let bytes = data_encoding::BASE32_NOPAD
            .decode(body.to_uppercase().as_bytes())
            .map_err(|_| Error::address("invalid base32"))?;
        if bytes.len() != 35 {
            return Err(Error::address(format!(
                "decoded to {} bytes, expected 35",
                bytes.len()
            )));
        }

        let mut pubkey = [0u8; 32];
        pubkey.copy_from_slice(&bytes[0..32]);
        let checksum = [bytes[32], bytes[33]];
        let version = bytes[34];

        if version != hs::ADDRESS_VERSION {
            return Err(Error::address(format!("unknown version {}", version)));
        }
        if checksum != Self::checksum(&pubkey, version) {
            return Err(Error::address("checksum mismatch"));
        }

        Ok(Self(pubkey))
    }

    /// Render as "…….onion".
    pub fn encode(&self) -> String {
        let checksum = Self::checksum(&self.0, hs::ADDRESS_VERSION);
        let mut body = [0u8; 35];
        body[0..32].copy_from_slice(&self.0);
        body[32..34].copy_from_slice(&checksum);
        body[34] = hs::ADDRESS_VERSION;

        format!(
            "{}.onion",
            data_encoding::BASE32_NOPAD.encode(&body).to_lowercase()
        )
    }

    fn checksum(pubkey: &[u8; 32], version: u8) -> [u8; 2] {
        let mut hasher = Sha3_256::new();
        hasher.update(CHECKSUM_PREFIX);
        hasher.update(pubkey);
        hasher.update([version]);
        let digest = hasher.finalize();
        [digest[0], digest[1]]
    }

    /// Whether a hostname looks like an onion address.
    pub fn is_onion_hostname(hostname: &str) -> bool {
        hostname.trim().to_lowercase().ends_with(".onion")
    }
}

impl std::fmt::Display for OnionAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.encode())
    }
}

impl std::str::FromStr for OnionAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_pubkey() -> [u8; 32] {
        let mut pubkey = [0u8; 32];
        for (i, byte) in pubkey.iter_mut().enumerate() {
            *byte = i as u8;
        }
        pubkey
    }

    #[test]
    fn test_roundtrip() {
        let address = OnionAddress::from_pubkey(sample_pubkey());
        let encoded = address.encode();

        assert!(encoded.ends_with(".onion"));
        assert_eq!(encoded.len(), hs::ADDRESS_BASE32_LEN + ".onion".len());

        let parsed = OnionAddress::parse(&encoded).unwrap();
        assert_eq!(parsed.pubkey(), &sample_pubkey());
        assert_eq!(parsed, address);
    }

    #[test]
    fn test_case_insensitive() {
        let address = OnionAddress::from_pubkey(sample_pubkey());
        let upper = address.encode().to_uppercase();
        assert_eq!(OnionAddress::parse(&upper).unwrap(), address);
    }

    #[test]
    fn test_parse_without_suffix() {
        let address = OnionAddress::from_pubkey(sample_pubkey());
        let encoded = address.encode();
        let body = encoded.strip_suffix(".onion").unwrap();
        assert_eq!(OnionAddress::parse(body).unwrap(), address);
    }

    #[test]
    fn test_corrupted_checksum_rejected() {
        let address = OnionAddress::from_pubkey(sample_pubkey());
        let encoded = address.encode();

        // Flip one character inside the checksum region (positions 52-55
        // of the base32 body cover the trailing bytes).
        let mut chars: Vec<char> = encoded.chars().collect();
        let i = 53;
        chars[i] = if chars[i] == 'a' { 'b' } else { 'a' };
        let corrupted: String = chars.into_iter().collect();

        assert!(matches!(
            OnionAddress::parse(&corrupted),
            Err(Error::AddressParse(_))
        ));
    }

    #[test]
    fn test_wrong_version_rejected() {
        let pubkey = sample_pubkey();
        let mut body = [0u8; 35];
        body[0..32].copy_from_slice(&pubkey);
        // Correct checksum for version 2, which is still not v3.
        let mut hasher = Sha3_256::new();
        hasher.update(CHECKSUM_PREFIX);
        hasher.update(pubkey);
        hasher.update([2u8]);
        let digest = hasher.finalize();
        body[32] = digest[0];
        body[33] = digest[1];
        body[34] = 2;

        let encoded = format!(
            "{}.onion",
            data_encoding::BASE32_NOPAD.encode(&body).to_lowercase()
        );
        assert!(matches!(
            OnionAddress::parse(&encoded),
            Err(Error::AddressParse(_))
        ));
    }

    #[test]
    fn test_wrong_length_rejected() {
        assert!(matches!(
            OnionAddress::parse("tooshort.onion"),
            Err(Error::AddressParse(_))
        ));
        assert!(matches!(
            OnionAddress::parse("example.com"),
            Err(Error::AddressParse(_))
        ));
    }

    #[test]
    fn test_is_onion_hostname() {
        assert!(OnionAddress::is_onion_hostname("abc.onion"));
        assert!(OnionAddress::is_onion_hostname("ABC.ONION"));
        assert!(!OnionAddress::is_onion_hostname("example.com"));
    }
}
