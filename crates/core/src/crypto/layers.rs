//! Per-hop cipher streams and running digests
//!
//! Each hop owns two AES-128-CTR keystreams (forward/backward, zero IV)
//! and two running SHA-1 digests seeded from the KDF output. The digest
//! state is internal: callers only ever see 4-byte prefixes, and
//! comparisons happen in constant time.

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use sha1::{Digest, Sha1};
use subtle::ConstantTimeEq;

use super::kdf::HopKeys;

type Aes128Ctr = Ctr128BE<Aes128>;

/// A stateful AES-128-CTR keystream for one direction of one hop
pub struct LayerCipher {
    cipher: Aes128Ctr,
}

impl LayerCipher {
    /// Counter starts at zero.
    pub fn new(key: &[u8; 16]) -> Self {
        let iv = [0u8; 16];
        Self {
            cipher: Aes128Ctr::new(key.into(), &iv.into()),
        }
    }

    /// Apply the keystream in place. CTR is symmetric, so this both
    /// encrypts and decrypts; the keystream position advances with every
    /// call and must never be rewound or shared.
    pub fn apply(&mut self, data: &mut [u8]) {
        self.cipher.apply_keystream(data);
    }
}

impl std::fmt::Debug for LayerCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerCipher").finish_non_exhaustive()
    }
}

/// A seeded running SHA-1 digest for one direction of one hop
#[derive(Clone)]
pub struct RunningDigest {
    inner: Sha1,
}

impl RunningDigest {
    pub fn seeded(seed: &[u8; 20]) -> Self {
        let mut inner = Sha1::new();
        inner.update(seed);
        Self { inner }
    }

    /// Absorb cell bytes and return the first 4 bytes of the updated
    /// state. Used on the send path after zeroing the digest field.
    pub fn absorb(&mut self, bytes: &[u8]) -> [u8; 4] {
        self.inner.update(bytes);
        self.prefix()
    }

    /// Current 4-byte prefix without changing state.
    pub fn prefix(&self) -> [u8; 4] {
        let snapshot = self.inner.clone();
        let hash = snapshot.finalize();
        let mut prefix = [0u8; 4];
        prefix.copy_from_slice(&hash[..4]);
        prefix
    }

    /// Test whether absorbing `bytes` yields a state whose prefix equals
    /// `expected`; commit the absorb only on a match. The comparison is
    /// constant-time.
    pub fn check_and_commit(&mut self, bytes: &[u8], expected: &[u8; 4]) -> bool {
        let mut candidate = self.inner.clone();
        candidate.update(bytes);
        let hash = candidate.clone().finalize();

        let matched: bool = hash[..4].ct_eq(expected).into();
        if matched {
            self.inner = candidate;
        }
        matched
    }
}

impl std::fmt::Debug for RunningDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Digest state must not be observable, even via Debug.
        f.debug_struct("RunningDigest").finish_non_exhaustive()
    }
}

/// Complete cryptographic state for one hop
#[derive(Debug)]
pub struct HopCrypto {
    pub forward_cipher: LayerCipher,
    pub backward_cipher: LayerCipher,
    pub forward_digest: RunningDigest,
    pub backward_digest: RunningDigest,
}

impl HopCrypto {
    pub fn from_keys(keys: &HopKeys) -> Self {
        Self {
            forward_cipher: LayerCipher::new(&keys.forward_key),
            backward_cipher: LayerCipher::new(&keys.backward_key),
            forward_digest: RunningDigest::seeded(&keys.forward_digest_seed),
            backward_digest: RunningDigest::seeded(&keys.backward_digest_seed),
        }
    }
}
