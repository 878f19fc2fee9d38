//! Client side of the ntor handshake (handshake type 0x0002)
//!
//! The client sends X = g^x together with the relay's identity
//! fingerprint and ntor onion key B; the relay answers Y = g^y and an
//! AUTH tag. Both sides compute
//! secret_input = EXP(Y,x) | EXP(B,x) | ID | B | X | Y | PROTOID
//! and derive KEY_SEED from it. AUTH is verified in constant time.

use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use veilway_common::{handshake, Error, RelayFingerprint, Result};
use x25519_dalek::{PublicKey, StaticSecret};

type HmacSha256 = Hmac<Sha256>;

const PROTOID: &[u8] = b"ntor-curve25519-sha256-1";
const T_KEY: &[u8] = b"ntor-curve25519-sha256-1:key_extract";
const T_VERIFY: &[u8] = b"ntor-curve25519-sha256-1:verify";
const T_MAC: &[u8] = b"ntor-curve25519-sha256-1:mac";

/// In-progress client handshake for one hop
pub struct NtorClient {
    secret: StaticSecret,
    public: PublicKey,
    relay_id: RelayFingerprint,
    relay_onion_key: PublicKey,
}

impl NtorClient {
    /// Start a handshake toward a relay identified by fingerprint and
    /// ntor onion key.
    pub fn new(relay_id: RelayFingerprint, relay_onion_key: [u8; 32]) -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            secret,
            public,
            relay_id,
            relay_onion_key: PublicKey::from(relay_onion_key),
        }
    }

    /// Deterministic construction for tests and the rendezvous handshake.
    pub fn from_secret(
        secret_bytes: [u8; 32],
        relay_id: RelayFingerprint,
        relay_onion_key: [u8; 32],
    ) -> Self {
        let secret = StaticSecret::from(secret_bytes);
        let public = PublicKey::from(&secret);
        Self {
            secret,
            public,
            relay_id,
            relay_onion_key: PublicKey::from(relay_onion_key),
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// The CREATE2/EXTEND2 onionskin: ID(20) | B(32) | X(32).
    pub fn onionskin(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(handshake::NTOR_ONIONSKIN_LEN);
        data.extend_from_slice(self.relay_id.as_bytes());
        data.extend_from_slice(self.relay_onion_key.as_bytes());
        data.extend_from_slice(self.public.as_bytes());
        data
    }

    /// Complete the handshake with the relay's reply: Y(32) | AUTH(32).
    ///
    /// Consumes the client state; the ephemeral secret is not reusable.
    /// Returns KEY_SEED for the hop-key KDF.
    pub fn complete(self, reply: &[u8]) -> Result<[u8; 32]> {
        if reply.len() < handshake::NTOR_REPLY_LEN {
            return Err(Error::protocol(format!(
                "ntor reply too short: {} < {}",
                reply.len(),
                handshake::NTOR_REPLY_LEN
            )));
        }

        let mut server_public_bytes = [0u8; 32];
        server_public_bytes.copy_from_slice(&reply[0..32]);
        let server_public = PublicKey::from(server_public_bytes);

        let mut server_auth = [0u8; 32];
        server_auth.copy_from_slice(&reply[32..64]);

        // EXP(Y,x) and EXP(B,x)
        let shared_yx = self.secret.diffie_hellman(&server_public);
        let shared_bx = self.secret.diffie_hellman(&self.relay_onion_key);

        let mut secret_input =
            Vec::with_capacity(32 + 32 + 20 + 32 + 32 + 32 + PROTOID.len());
        secret_input.extend_from_slice(shared_yx.as_bytes());
        secret_input.extend_from_slice(shared_bx.as_bytes());
        secret_input.extend_from_slice(self.relay_id.as_bytes());
        secret_input.extend_from_slice(self.relay_onion_key.as_bytes());
        secret_input.extend_from_slice(self.public.as_bytes());
        secret_input.extend_from_slice(server_public.as_bytes());
        secret_input.extend_from_slice(PROTOID);

        let key_seed = hmac_tag(T_KEY, &secret_input)?;
        let verify = hmac_tag(T_VERIFY, &secret_input)?;

        let mut auth_input =
            Vec::with_capacity(32 + 20 + 32 + 32 + 32 + PROTOID.len() + 6);
        auth_input.extend_from_slice(&verify);
        auth_input.extend_from_slice(self.relay_id.as_bytes());
        auth_input.extend_from_slice(self.relay_onion_key.as_bytes());
        auth_input.extend_from_slice(server_public.as_bytes());
        auth_input.extend_from_slice(self.public.as_bytes());
        auth_input.extend_from_slice(PROTOID);
        auth_input.extend_from_slice(b"Server");

        let computed_auth = hmac_tag(T_MAC, &auth_input)?;

        let auth_ok: bool = computed_auth.as_slice().ct_eq(&server_auth).into();
        if !auth_ok {
            return Err(Error::handshake("server AUTH verification failed"));
        }

        Ok(key_seed)
    }
}

impl std::fmt::Debug for NtorClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NtorClient")
            .field("relay_id", &self.relay_id)
            .finish_non_exhaustive()
    }
}

fn hmac_tag(key: &[u8], input: &[u8]) -> Result<[u8; 32]> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|_| Error::internal("HMAC key construction failed"))?;
    mac.update(input);
    let out = mac.finalize().into_bytes();
    let mut tag = [0u8; 32];
    tag.copy_from_slice(&out);
    Ok(tag)
}

/// Server-side completion of an onionskin, used by tests and the
/// loopback relay harness: given the relay's keys and the client's X,
/// produce the reply (Y | AUTH) and KEY_SEED.
pub fn respond(
    relay_id: RelayFingerprint,
    onion_secret: &StaticSecret,
    onionskin: &[u8],
) -> Result<(Vec<u8>, [u8; 32])> {
    if onionskin.len() < handshake::NTOR_ONIONSKIN_LEN {
        return Err(Error::protocol("onionskin too short"));
    }
    let onion_public = PublicKey::from(onion_secret);

    let mut client_public_bytes = [0u8; 32];
    client_public_bytes.copy_from_slice(&onionskin[52..84]);
    let client_public = PublicKey::from(client_public_bytes);

    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let server_public = PublicKey::from(&ephemeral);

    let shared_xy = ephemeral.diffie_hellman(&client_public);
    let shared_xb = onion_secret.diffie_hellman(&client_public);

    let mut secret_input = Vec::new();
    secret_input.extend_from_slice(shared_xy.as_bytes());
    secret_input.extend_from_slice(shared_xb.as_bytes());
    secret_input.extend_from_slice(relay_id.as_bytes());
    secret_input.extend_from_slice(onion_public.as_bytes());
    secret_input.extend_from_slice(client_public.as_bytes());
    secret_input.extend_from_slice(server_public.as_bytes());
    secret_input.extend_from_slice(PROTOID);

    let key_seed = hmac_tag(T_KEY, &secret_input)?;
    let verify = hmac_tag(T_VERIFY, &secret_input)?;

    let mut auth_input = Vec::new();
    auth_input.extend_from_slice(&verify);
    auth_input.extend_from_slice(relay_id.as_bytes());
    auth_input.extend_from_slice(onion_public.as_bytes());
    auth_input.extend_from_slice(server_public.as_bytes());
    auth_input.extend_from_slice(client_public.as_bytes());
    auth_input.extend_from_slice(PROTOID);
    auth_input.extend_from_slice(b"Server");

    let auth = hmac_tag(T_MAC, &auth_input)?;

    let mut reply = Vec::with_capacity(handshake::NTOR_REPLY_LEN);
    reply.extend_from_slice(server_public.as_bytes());
    reply.extend_from_slice(&auth);

    Ok((reply, key_seed))
}
