//! Stream-to-circuit isolation keys
//!
//! Traffic of differing sensitivity must not share a circuit. Each
//! stream request carries a key; a circuit bound to key k is only handed
//! to requests whose key shares with k.

use sha2::{Digest, Sha256};

/// Fingerprint used for stream-to-circuit assignment
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IsolationKey {
    /// No isolation requirement; shares with anything
    None,

    /// Isolate by destination host and port
    Destination { host: String, port: u16 },

    /// Isolate by proxy credential (hashed username)
    Credential([u8; 32]),

    /// Isolate by ingress source port
    SourcePort(u16),

    /// Isolate by session token (hashed)
    Session([u8; 32]),
}

impl IsolationKey {
    pub fn destination(host: &str, port: u16) -> Self {
        Self::Destination {
            host: host.trim_end_matches('.').to_lowercase(),
            port,
        }
    }

    pub fn credential(user: &str) -> Self {
        Self::Credential(Sha256::digest(user.as_bytes()).into())
    }

    pub fn source_port(port: u16) -> Self {
        Self::SourcePort(port)
    }

    pub fn session(token: &[u8]) -> Self {
        Self::Session(Sha256::digest(token).into())
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Whether two streams with these keys may ride the same circuit.
    /// Keys share when equal; the None key always shares.
    pub fn shares_with(&self, other: &Self) -> bool {
        self.is_none() || other.is_none() || self == other
    }
}

impl Default for IsolationKey {
    fn default() -> Self {
        Self::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_keys_share() {
        let a = IsolationKey::destination("Example.COM", 443);
        let b = IsolationKey::destination("example.com", 443);
        assert_eq!(a, b);
        assert!(a.shares_with(&b));
    }

    #[test]
    fn test_different_tags_never_share() {
        let dest = IsolationKey::destination("example.com", 443);
        let port = IsolationKey::source_port(443);
        let cred = IsolationKey::credential("alice");
        let sess = IsolationKey::session(b"token");

        assert!(!dest.shares_with(&port));
        assert!(!cred.shares_with(&sess));
        assert!(!dest.shares_with(&cred));
    }

    #[test]
    fn test_same_tag_different_data_never_share() {
        assert!(!IsolationKey::destination("a.example", 80)
            .shares_with(&IsolationKey::destination("b.example", 80)));
        assert!(!IsolationKey::destination("a.example", 80)
            .shares_with(&IsolationKey::destination("a.example", 81)));
        assert!(!IsolationKey::credential("alice").shares_with(&IsolationKey::credential("bob")));
        assert!(!IsolationKey::source_port(1).shares_with(&IsolationKey::source_port(2)));
    }

    #[test]
    fn test_none_shares_with_everything() {
        let none = IsolationKey::None;
        assert!(none.shares_with(&IsolationKey::destination("example.com", 443)));
        assert!(IsolationKey::session(b"t").shares_with(&none));
        assert!(none.shares_with(&none));
    }

    #[test]
    fn test_credential_hash_hides_user() {
        match IsolationKey::credential("alice") {
            IsolationKey::Credential(hash) => {
                assert_ne!(&hash[..5], b"alice");
            }
            other => panic!("unexpected key: {other:?}"),
        }
    }
}
