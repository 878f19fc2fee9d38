//! HSDir ring selection
//!
//! Descriptors live on the relays whose fingerprints are XOR-closest to
//! the descriptor ID. Fingerprints are right-padded with zeros to the
//! 32-byte ID width; distance ties and ordering use lexicographic
//! comparison of the XOR vector, so selection is deterministic and
//! independent of input order.

use super::descriptor::descriptor_id;
use veilway_common::{hs, RelayFingerprint, RelayInfo};

/// XOR distance between a relay fingerprint (right-padded) and a
/// 32-byte descriptor ID.
pub fn xor_distance(fingerprint: &RelayFingerprint, desc_id: &[u8; 32]) -> [u8; 32] {
    let mut padded = [0u8; 32];
    padded[..RelayFingerprint::LEN].copy_from_slice(fingerprint.as_bytes());

    let mut distance = [0u8; 32];
    for (i, byte) in distance.iter_mut().enumerate() {
        *byte = padded[i] ^ desc_id[i];
    }
    distance
}

/// The `spread` HSDir-flagged relays closest to one descriptor ID.
pub fn closest_hsdirs(desc_id: &[u8; 32], relays: &[RelayInfo], spread: usize) -> Vec<RelayInfo> {
    let mut candidates: Vec<&RelayInfo> = relays.iter().filter(|r| r.flags.is_hsdir).collect();
    candidates.sort_by_key(|relay| xor_distance(&relay.fingerprint, desc_id));
    candidates.into_iter().take(spread).cloned().collect()
}

/// Responsible HSDirs for a blinded key: the union of the closest sets
/// for both replicas, first replica first, deduplicated.
pub fn responsible_hsdirs(blinded: &[u8; 32], relays: &[RelayInfo]) -> Vec<RelayInfo> {
    let mut result: Vec<RelayInfo> = Vec::new();
    for replica in 0..hs::REPLICAS {
        let desc_id = descriptor_id(blinded, replica);
        for relay in closest_hsdirs(&desc_id, relays, hs::HSDIR_SPREAD) {
            if !result
                .iter()
                .any(|seen| seen.fingerprint == relay.fingerprint)
            {
                result.push(relay);
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha3::{Digest, Sha3_256};
    use veilway_common::{RelayAddr, RelayFlags};

    fn hsdir(seed: u8) -> RelayInfo {
        RelayInfo {
            fingerprint: RelayFingerprint::from_bytes([seed; 20]),
            ed_identity: None,
            addr: RelayAddr::from_domain(format!("hsdir{}.example", seed), 9001),
            ntor_onion_key: [seed; 32],
            flags: RelayFlags {
                is_guard: false,
                is_exit: false,
                is_hsdir: true,
            },
        }
    }

    /// Fingerprints 0x01.. through 0x05.. (right-padded), per the ring
    /// selection contract: the chosen sets are the XOR-closest three to
    /// SHA3(desc || [0]) and SHA3(desc || [1]).
    #[test]
    fn test_selection_matches_reference_computation() {
        let relays: Vec<RelayInfo> = (1..=5).map(hsdir).collect();
        let blinded = [0x5Au8; 32];

        let selected = responsible_hsdirs(&blinded, &relays);

        // Reference computation, straight from the definition.
        let mut expected: Vec<RelayFingerprint> = Vec::new();
        for replica in 0..2u8 {
            let mut hasher = Sha3_256::new();
            hasher.update(blinded);
            hasher.update([replica]);
            let desc_id: [u8; 32] = hasher.finalize().into();

            let mut by_distance: Vec<&RelayInfo> = relays.iter().collect();
            by_distance.sort_by_key(|r| xor_distance(&r.fingerprint, &desc_id));
            for relay in by_distance.into_iter().take(3) {
                if !expected.contains(&relay.fingerprint) {
                    expected.push(relay.fingerprint);
                }
            }
        }

        let got: Vec<RelayFingerprint> = selected.iter().map(|r| r.fingerprint).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn test_selection_independent_of_input_order() {
        let blinded = [0x33u8; 32];
        let forward: Vec<RelayInfo> = (1..=5).map(hsdir).collect();
        let reversed: Vec<RelayInfo> = (1..=5).rev().map(hsdir).collect();

        let a: Vec<_> = responsible_hsdirs(&blinded, &forward)
            .iter()
            .map(|r| r.fingerprint)
            .collect::<Vec<_>>();
        let b: Vec<_> = responsible_hsdirs(&blinded, &reversed)
            .iter()
            .map(|r| r.fingerprint)
            .collect::<Vec<_>>();
        assert_eq!(a, b);
    }

    #[test]
    fn test_non_hsdir_relays_excluded() {
        let mut relays: Vec<RelayInfo> = (1..=3).map(hsdir).collect();
        let mut plain = hsdir(4);
        plain.flags.is_hsdir = false;
        relays.push(plain);

        let selected = closest_hsdirs(&[0u8; 32], &relays, 4);
        assert_eq!(selected.len(), 3);
        assert!(selected
            .iter()
            .all(|r| r.fingerprint != RelayFingerprint::from_bytes([4; 20])));
    }

    #[test]
    fn test_spread_caps_result() {
        let relays: Vec<RelayInfo> = (1..=5).map(hsdir).collect();
        assert_eq!(closest_hsdirs(&[0u8; 32], &relays, 3).len(), 3);
        assert_eq!(closest_hsdirs(&[0u8; 32], &relays, 10).len(), 5);
    }

    #[test]
    fn test_xor_distance_pads_fingerprint() {
        let fp = RelayFingerprint::from_bytes([0xFF; 20]);
        let distance = xor_distance(&fp, &[0u8; 32]);
        assert_eq!(&distance[..20], &[0xFF; 20]);
        assert_eq!(&distance[20..], &[0u8; 12]);
    }
}
