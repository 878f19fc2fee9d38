//! Hidden-service descriptors, key blinding, and descriptor IDs
//!
//! A service publishes one descriptor per time period under a blinded
//! key; clients recompute the blinding from the onion address and the
//! period, derive the replica descriptor IDs, and fetch from the
//! responsible HSDirs.

use super::address::OnionAddress;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use std::time::Duration;
use veilway_common::{hs, Ed25519Identity, Error, RelayInfo, Result, Timestamp};

const BLIND_PREFIX: &[u8] = b"Derive temporary signing key";

/// Time period for descriptor blinding: 24-hour epochs offset by 12
/// hours, so periods roll over at 12:00 UTC rather than midnight.
pub fn time_period(unix_secs: u64) -> u64 {
    (unix_secs + hs::TIME_PERIOD_OFFSET_SECS) / hs::TIME_PERIOD_LENGTH_SECS
}

/// Blinded public key for a time period.
pub fn blinded_pubkey(pubkey: &[u8; 32], period: u64) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    hasher.update(BLIND_PREFIX);
    hasher.update(pubkey);
    hasher.update(period.to_be_bytes());
    hasher.finalize().into()
}

/// Descriptor ID for one replica of a blinded key.
pub fn descriptor_id(blinded: &[u8; 32], replica: u8) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    hasher.update(blinded);
    hasher.update([replica]);
    hasher.finalize().into()
}

/// One introduction point listed in a descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntroPoint {
    /// Relay acting as the introduction point, including its ntor
    /// onion key and link information
    pub relay: RelayInfo,

    /// Service's authentication key at this introduction point
    pub auth_key: Ed25519Identity,

    /// Curve25519 key the INTRODUCE1 inner payload is sealed toward
    #[serde(with = "serde_bytes")]
    pub enc_key: [u8; 32],
}

/// A fetched hidden-service descriptor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Descriptor {
    /// Descriptor format version (3)
    pub version: u8,

    /// Address the descriptor belongs to
    pub address: OnionAddress,

    /// Blinded key for the descriptor's time period
    #[serde(with = "serde_bytes")]
    pub blinded_pubkey: [u8; 32],

    /// ID the descriptor is stored under on the HSDir ring
    #[serde(with = "serde_bytes")]
    pub descriptor_id: [u8; 32],

    /// Monotone counter; newer revisions supersede older ones
    pub revision_counter: u64,

    /// Introduction points (1 to 10)
    pub intro_points: Vec<IntroPoint>,

    /// How long the descriptor stays valid after fetch
    pub lifetime: Duration,

    /// Descriptor signing key; its certification by the blinded key is
    /// the embedder's concern
    pub signing_pubkey: Ed25519Identity,

    /// Signature by the signing key over `signing_data`
    #[serde(with = "serde_bytes")]
    pub signature: [u8; 64],
}

impl Descriptor {
    /// Assemble an unsigned descriptor for an address at a period.
    pub fn build(
        address: OnionAddress,
        period: u64,
        revision_counter: u64,
        intro_points: Vec<IntroPoint>,
        signing_pubkey: Ed25519Identity,
    ) -> Self {
        let blinded = blinded_pubkey(address.pubkey(), period);
        Self {
            version: 3,
            address,
            blinded_pubkey: blinded,
            descriptor_id: descriptor_id(&blinded, 0),
            revision_counter,
            intro_points,
            lifetime: Duration::from_secs(hs::DESCRIPTOR_LIFETIME_SECS),
            signing_pubkey,
            signature: [0u8; 64],
        }
    }

    /// Wire encoding.
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::internal(format!("descriptor encode: {}", e)))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| Error::protocol(format!("descriptor decode: {}", e)))
    }

    /// Bytes covered by the signature.
    fn signing_data(&self) -> Vec<u8> {
        let mut data = Vec::new();
        data.push(self.version);
        data.extend_from_slice(self.address.pubkey());
        data.extend_from_slice(&self.blinded_pubkey);
        data.extend_from_slice(&self.descriptor_id);
        data.extend_from_slice(&self.revision_counter.to_be_bytes());
        for intro in &self.intro_points {
            data.extend_from_slice(intro.relay.fingerprint.as_bytes());
            data.extend_from_slice(intro.auth_key.as_bytes());
            data.extend_from_slice(&intro.enc_key);
        }
        data.extend_from_slice(&self.lifetime.as_secs().to_be_bytes());
        data.extend_from_slice(self.signing_pubkey.as_bytes());
        data
    }

    pub fn sign(&mut self, key: &SigningKey) {
        self.signing_pubkey = Ed25519Identity::from_bytes(key.verifying_key().to_bytes());
        self.signature = key.sign(&self.signing_data()).to_bytes();
    }

    pub fn verify(&self) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(self.signing_pubkey.as_bytes()) else {
            return false;
        };
        let signature = Signature::from_bytes(&self.signature);
        key.verify(&self.signing_data(), &signature).is_ok()
    }

    /// Full client-side validation against the address and period the
    /// descriptor was fetched for.
    pub fn validate(&self, address: &OnionAddress, period: u64) -> Result<()> {
        if self.version != 3 {
            return Err(Error::protocol(format!(
                "descriptor version {} unsupported",
                self.version
            )));
        }
        if &self.address != address {
            return Err(Error::protocol("descriptor is for another address"));
        }

        let expected_blinded = blinded_pubkey(address.pubkey(), period);
        if self.blinded_pubkey != expected_blinded {
            return Err(Error::protocol("blinded key does not match the period"));
        }

        let replica_ids = [
            descriptor_id(&self.blinded_pubkey, 0),
            descriptor_id(&self.blinded_pubkey, 1),
        ];
        if !replica_ids.contains(&self.descriptor_id) {
            return Err(Error::protocol("descriptor ID matches neither replica"));
        }

        if self.lifetime.is_zero() {
            return Err(Error::DescriptorExpired);
        }
        if self.intro_points.is_empty() {
            return Err(Error::NoIntroductionPoints);
        }
        if self.intro_points.len() > hs::MAX_INTRO_POINTS {
            return Err(Error::protocol(format!(
                "{} introduction points exceeds the maximum",
                self.intro_points.len()
            )));
        }

        if !self.verify() {
            return Err(Error::protocol("descriptor signature invalid"));
        }
        Ok(())
    }

    /// Expiry for a descriptor fetched now.
    pub fn expires_at(&self, fetched_at: Timestamp) -> Timestamp {
        fetched_at.plus(self.lifetime)
    }
}
