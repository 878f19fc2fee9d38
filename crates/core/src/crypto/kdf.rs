//! Key derivation for circuit hops
//!
//! KEY_SEED from the ntor handshake is expanded with HKDF-SHA256 into
//! 72 bytes: Df(20) | Db(20) | Kf(16) | Kb(16). Df/Db seed the forward
//! and backward running digests; Kf/Kb key the AES-128-CTR layer ciphers
//! with a zero counter.

use hkdf::Hkdf;
use sha2::Sha256;
use veilway_common::{Error, Result};
use zeroize::{Zeroize, ZeroizeOnDrop};

const M_EXPAND: &[u8] = b"ntor-curve25519-sha256-1:key_expand";

/// Key material for one hop, zeroized on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct HopKeys {
    /// Forward digest seed
    pub forward_digest_seed: [u8; 20],

    /// Backward digest seed
    pub backward_digest_seed: [u8; 20],

    /// Forward AES-128 key
    pub forward_key: [u8; 16],

    /// Backward AES-128 key
    pub backward_key: [u8; 16],
}

impl std::fmt::Debug for HopKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material never reaches logs.
        f.debug_struct("HopKeys").finish_non_exhaustive()
    }
}

impl HopKeys {
    /// Expand KEY_SEED into the per-hop key material.
    ///
    /// KEY_SEED is already the output of HMAC-SHA256, so the HKDF extract
    /// step is skipped and the seed is used directly as the PRK.
    pub fn derive(key_seed: &[u8; 32]) -> Result<Self> {
        Self::derive_with_info(key_seed, M_EXPAND)
    }

    /// Expand with an explicit info string (the hidden-service rendezvous
    /// handshake uses its own).
    pub fn derive_with_info(key_seed: &[u8; 32], info: &[u8]) -> Result<Self> {
        let hkdf = Hkdf::<Sha256>::from_prk(key_seed)
            .map_err(|_| Error::internal("KEY_SEED has wrong length for HKDF"))?;

        let mut okm = [0u8; 72];
        hkdf.expand(info, &mut okm)
            .map_err(|_| Error::internal("HKDF expansion failed"))?;

        let mut keys = Self {
            forward_digest_seed: [0u8; 20],
            backward_digest_seed: [0u8; 20],
            forward_key: [0u8; 16],
            backward_key: [0u8; 16],
        };
        keys.forward_digest_seed.copy_from_slice(&okm[0..20]);
        keys.backward_digest_seed.copy_from_slice(&okm[20..40]);
        keys.forward_key.copy_from_slice(&okm[40..56]);
        keys.backward_key.copy_from_slice(&okm[56..72]);
        okm.zeroize();

        Ok(keys)
    }
}
