//! Hidden-service connection orchestration
//!
//! Connecting to a v3 address: resolve the descriptor (cache, then the
//! responsible HSDirs), establish a rendezvous point with a fresh
//! cookie, introduce ourselves through one of the service's
//! introduction points, and complete the handshake that layers
//! end-to-end keys atop the rendezvous circuit.

use super::address::OnionAddress;
use super::cache::DescriptorCache;
use super::descriptor::{blinded_pubkey, descriptor_id, time_period, Descriptor, IntroPoint};
use super::hsdir::closest_hsdirs;
use crate::cells::{LinkSpec, RelayCell, RelayCommand};
use crate::circuit::{Circuit, CircuitBuilder, Path};
use crate::crypto::HopKeys;
use crate::transport::{CellSender, HsDirSource, RelayKeySource};
use aes::Aes128;
use async_trait::async_trait;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use sha3::Sha3_256;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use veilway_common::{
    circuit as circuit_cfg, hs, EngineConfig, Error, RelayInfo, Result, Timestamp,
};
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};

type Aes128Ctr = Ctr128BE<Aes128>;
type HmacSha256 = Hmac<Sha256>;
type HmacSha3 = Hmac<Sha3_256>;

const INTRO_ENC_INFO: &[u8] = b"veilway-introduce1-encryption";
const REND_EXPAND_INFO: &[u8] = b"veilway-rendezvous-key-expand";
const REND_AUTH_KEY: &[u8] = b"veilway-rendezvous-auth";

/// Onion key type code for ntor inside INTRODUCE1
const ONION_KEY_TYPE_NTOR: u8 = 1;

/// Capability to produce an open 3-hop circuit for a path
#[async_trait]
pub trait CircuitLauncher: Send + Sync {
    async fn launch(&self, path: Path) -> Result<Arc<Circuit>>;
}

/// Production launcher: builds circuits on one guard link
pub struct BuilderLauncher {
    builder: Arc<CircuitBuilder>,
    transport: Arc<dyn CellSender>,
}

impl BuilderLauncher {
    pub fn new(builder: Arc<CircuitBuilder>, transport: Arc<dyn CellSender>) -> Self {
        Self { builder, transport }
    }
}

#[async_trait]
impl CircuitLauncher for BuilderLauncher {
    async fn launch(&self, path: Path) -> Result<Arc<Circuit>> {
        self.builder
            .build_default(self.transport.clone(), path)
            .await
    }
}

/// Client side of the v3 rendezvous protocol
pub struct HsClient {
    launcher: Arc<dyn CircuitLauncher>,
    relays: Arc<dyn RelayKeySource>,
    hsdirs: Arc<dyn HsDirSource>,
    cache: DescriptorCache,
    config: EngineConfig,
}

impl HsClient {
    pub fn new(
        launcher: Arc<dyn CircuitLauncher>,
        relays: Arc<dyn RelayKeySource>,
        hsdirs: Arc<dyn HsDirSource>,
        config: EngineConfig,
    ) -> Self {
        Self {
            launcher,
            relays,
            hsdirs,
            cache: DescriptorCache::with_max_lifetime(config.descriptor_lifetime),
            config,
        }
    }

    pub fn cache(&self) -> &DescriptorCache {
        &self.cache
    }

    /// Connect to a hidden service. On success the returned circuit
    /// carries the end-to-end layer and is ready for streams.
    pub async fn connect(
        &self,
        address: &OnionAddress,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<Arc<Circuit>> {
        // Descriptor resolution failure is fatal for the call.
        let descriptor = self.resolve_descriptor(address).await?;
        info!(%address, intro_points = descriptor.intro_points.len(), "descriptor resolved");

        let rend_relay = self
            .relays
            .rendezvous_relay()
            .await
            .ok_or(Error::NoRendezvousPoint)?;
        let rend_path = self
            .relays
            .path_to(&rend_relay)
            .await
            .ok_or(Error::NoRendezvousPoint)?;
        let rend_circuit = self.launcher.launch(rend_path).await?;

        let mut cookie = [0u8; hs::REND_COOKIE_LEN];
        OsRng.fill_bytes(&mut cookie);

        let joined = self
            .rendezvous_and_introduce(&descriptor, &rend_circuit, &rend_relay, &cookie, cancel)
            .await;

        match joined {
            Ok(()) => {
                info!(%address, circuit = %rend_circuit.id(), "hidden service connected");
                Ok(rend_circuit)
            }
            Err(err) => {
                rend_circuit.close().await;
                Err(err)
            }
        }
    }

    /// Cache lookup, then the responsible HSDirs of both replicas in
    /// ring order; first valid descriptor wins.
    pub async fn resolve_descriptor(&self, address: &OnionAddress) -> Result<Descriptor> {
        if let Some(descriptor) = self.cache.get(address).await {
            debug!(%address, "descriptor cache hit");
            return Ok(descriptor);
        }

        let period = time_period(Timestamp::now().as_secs());
        let blinded = blinded_pubkey(address.pubkey(), period);
        let relays = self.relays.hsdir_relays().await;

        let mut tried = HashSet::new();
        for replica in 0..hs::REPLICAS {
            let desc_id = descriptor_id(&blinded, replica);
            for hsdir in closest_hsdirs(&desc_id, &relays, hs::HSDIR_SPREAD) {
                if !tried.insert(hsdir.fingerprint) {
                    continue;
                }
                match self.hsdirs.fetch_descriptor(&hsdir.fingerprint, &desc_id).await {
                    Ok(bytes) => {
                        let checked = Descriptor::decode(&bytes).and_then(|descriptor| {
                            descriptor.validate(address, period)?;
                            Ok(descriptor)
                        });
                        match checked {
                            Ok(descriptor) => {
                                self.cache.put(descriptor.clone()).await;
                                return Ok(descriptor);
                            }
                            Err(err) => {
                                debug!(hsdir = %hsdir.fingerprint, %err, "descriptor rejected")
                            }
                        }
                    }
                    Err(err) => debug!(hsdir = %hsdir.fingerprint, %err, "descriptor fetch failed"),
                }
            }
        }

        Err(Error::DescriptorNotFound(address.to_string()))
    }

    async fn rendezvous_and_introduce(
        &self,
        descriptor: &Descriptor,
        rend_circuit: &Arc<Circuit>,
        rend_relay: &RelayInfo,
        cookie: &[u8; hs::REND_COOKIE_LEN],
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        rend_circuit
            .send_relay_cell(RelayCell::new(
                RelayCommand::EstablishRendezvous,
                0,
                cookie.to_vec(),
            ))
            .await?;
        self.expect_cell(rend_circuit, RelayCommand::RendezvousEstablished, cancel)
            .await?;
        debug!(circuit = %rend_circuit.id(), "rendezvous established");

        let mut attempts = 0;
        for intro in &descriptor.intro_points {
            if attempts >= self.config.intro_retry_limit {
                break;
            }
            attempts += 1;

            match self
                .attempt_introduction(intro, rend_circuit, rend_relay, cookie, cancel)
                .await
            {
                Ok(()) => return Ok(()),
                Err(Error::Canceled) => return Err(Error::Canceled),
                Err(err) => {
                    warn!(intro = %intro.relay.fingerprint, %err, "introduction attempt failed");
                }
            }
        }

        Err(Error::NoIntroductionPoints)
    }

    /// One introduction attempt; the intro circuit is closed whatever
    /// happens.
    async fn attempt_introduction(
        &self,
        intro: &IntroPoint,
        rend_circuit: &Arc<Circuit>,
        rend_relay: &RelayInfo,
        cookie: &[u8; hs::REND_COOKIE_LEN],
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let path = self
            .relays
            .path_to(&intro.relay)
            .await
            .ok_or(Error::NoIntroductionPoints)?;
        let intro_circuit = self.launcher.launch(path).await?;

        let result = self
            .run_introduction(&intro_circuit, intro, rend_circuit, rend_relay, cookie, cancel)
            .await;
        intro_circuit.close().await;
        result
    }

    async fn run_introduction(
        &self,
        intro_circuit: &Arc<Circuit>,
        intro: &IntroPoint,
        rend_circuit: &Arc<Circuit>,
        rend_relay: &RelayInfo,
        cookie: &[u8; hs::REND_COOKIE_LEN],
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let client_secret = StaticSecret::random_from_rng(OsRng);

        let payload = seal_introduce1(intro, cookie, rend_relay, &client_secret)?;
        intro_circuit
            .send_relay_cell(RelayCell::new(RelayCommand::Introduce1, 0, payload))
            .await?;

        let ack = self
            .expect_cell(intro_circuit, RelayCommand::IntroduceAck, cancel)
            .await?;
        let status = ack.data.first().copied().unwrap_or(0xFF);
        if status != 0 {
            return Err(Error::protocol(format!(
                "introduction refused with status {}",
                status
            )));
        }
        debug!(intro = %intro.relay.fingerprint, "introduction acknowledged");

        let rendezvous2 = self
            .expect_cell(rend_circuit, RelayCommand::Rendezvous2, cancel)
            .await?;
        if rendezvous2.data.len() < 64 {
            return Err(Error::protocol("RENDEZVOUS2 payload too short"));
        }
        let mut server_pk = [0u8; 32];
        server_pk.copy_from_slice(&rendezvous2.data[0..32]);
        let mut auth = [0u8; 32];
        auth.copy_from_slice(&rendezvous2.data[32..64]);

        let shared = client_secret.diffie_hellman(&PublicKey::from(server_pk));
        let keys = rendezvous_keys(&shared, cookie, &auth)?;
        rend_circuit.layer_endpoint(&keys).await?;
        Ok(())
    }

    /// Wait for one specific relay command, ignoring DROP padding.
    async fn expect_cell(
        &self,
        circuit: &Arc<Circuit>,
        want: RelayCommand,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<RelayCell> {
        let step = Duration::from_secs(circuit_cfg::HANDSHAKE_STEP_TIMEOUT_SECS);
        loop {
            let cell = circuit.recv_relay_with_cancel(step, cancel).await?;
            if cell.command == want {
                return Ok(cell);
            }
            if cell.command == RelayCommand::Drop {
                continue;
            }
            return Err(Error::protocol(format!(
                "expected {:?}, got {:?}",
                want, cell.command
            )));
        }
    }
}

/// Derive the end-to-end keys from the RENDEZVOUS2 handshake and check
/// the service's auth tag.
fn rendezvous_keys(
    shared: &SharedSecret,
    cookie: &[u8; hs::REND_COOKIE_LEN],
    auth: &[u8; 32],
) -> Result<HopKeys> {
    let mut mac = HmacSha256::new_from_slice(REND_AUTH_KEY)
        .map_err(|_| Error::internal("HMAC key construction failed"))?;
    mac.update(shared.as_bytes());
    mac.update(cookie);
    let expected = mac.finalize().into_bytes();

    let auth_ok: bool = expected.as_slice().ct_eq(auth).into();
    if !auth_ok {
        return Err(Error::handshake("rendezvous auth verification failed"));
    }

    HopKeys::derive_with_info(shared.as_bytes(), REND_EXPAND_INFO)
}

/// Build and seal the INTRODUCE1 payload.
///
/// Outer: auth_key(32) | n_ext(1)=0 | client_pk(32) | enc_len(2) |
/// encrypted | mac(32). Inner plaintext: cookie(20) | n_ext(1)=0 |
/// onion_key_type(1) | onion_key_len(2) | rend ntor key(32) | nspec(1) |
/// rendezvous link specifiers. The inner part is sealed toward the
/// introduction point's enc-key with x25519 + HKDF-SHA256 into an
/// AES-128-CTR key and an HMAC-SHA3-256 MAC key.
fn seal_introduce1(
    intro: &IntroPoint,
    cookie: &[u8; hs::REND_COOKIE_LEN],
    rend_relay: &RelayInfo,
    client_secret: &StaticSecret,
) -> Result<Vec<u8>> {
    let client_pk = PublicKey::from(client_secret);

    let mut inner = Vec::new();
    inner.extend_from_slice(cookie);
    inner.push(0); // extensions
    inner.push(ONION_KEY_TYPE_NTOR);
    inner.extend_from_slice(&32u16.to_be_bytes());
    inner.extend_from_slice(&rend_relay.ntor_onion_key);

    let specs = LinkSpec::for_relay(rend_relay);
    inner.push(specs.len() as u8);
    for spec in &specs {
        spec.encode_into(&mut inner)?;
    }

    let (enc_key, mac_key) = introduce_seal_keys(client_secret, &intro.enc_key)?;

    let mut ciphertext = inner;
    let iv = [0u8; 16];
    let mut cipher = Aes128Ctr::new(&enc_key.into(), &iv.into());
    cipher.apply_keystream(&mut ciphertext);

    let mut outer = Vec::new();
    outer.extend_from_slice(intro.auth_key.as_bytes());
    outer.push(0); // extensions
    outer.extend_from_slice(client_pk.as_bytes());
    outer.extend_from_slice(&(ciphertext.len() as u16).to_be_bytes());
    outer.extend_from_slice(&ciphertext);

    let mut mac = HmacSha3::new_from_slice(&mac_key)
        .map_err(|_| Error::internal("HMAC key construction failed"))?;
    mac.update(&outer);
    outer.extend_from_slice(&mac.finalize().into_bytes());

    if outer.len() > veilway_common::cell::RELAY_DATA_MAX {
        return Err(Error::protocol("INTRODUCE1 payload too large"));
    }
    Ok(outer)
}

fn introduce_seal_keys(
    client_secret: &StaticSecret,
    intro_enc_key: &[u8; 32],
) -> Result<([u8; 16], [u8; 32])> {
    let shared = client_secret.diffie_hellman(&PublicKey::from(*intro_enc_key));
    let hkdf = Hkdf::<Sha256>::new(None, shared.as_bytes());
    let mut okm = [0u8; 48];
    hkdf.expand(INTRO_ENC_INFO, &mut okm)
        .map_err(|_| Error::internal("HKDF expansion failed"))?;

    let mut enc_key = [0u8; 16];
    let mut mac_key = [0u8; 32];
    enc_key.copy_from_slice(&okm[0..16]);
    mac_key.copy_from_slice(&okm[16..48]);
    Ok((enc_key, mac_key))
}

/// Service-side unsealing, used to verify the sealed payload in tests.
#[cfg(test)]
pub(crate) fn unseal_introduce1(
    payload: &[u8],
    intro_enc_secret: &StaticSecret,
) -> Result<(PublicKey, Vec<u8>)> {
    if payload.len() < 32 + 1 + 32 + 2 + 32 {
        return Err(Error::protocol("INTRODUCE1 too short"));
    }
    let mut client_pk_bytes = [0u8; 32];
    client_pk_bytes.copy_from_slice(&payload[33..65]);
    let client_pk = PublicKey::from(client_pk_bytes);

    let enc_len = u16::from_be_bytes([payload[65], payload[66]]) as usize;
    let cipher_start = 67;
    let mac_start = cipher_start + enc_len;
    if payload.len() != mac_start + 32 {
        return Err(Error::protocol("INTRODUCE1 length mismatch"));
    }

    let shared = intro_enc_secret.diffie_hellman(&client_pk);
    let hkdf = Hkdf::<Sha256>::new(None, shared.as_bytes());
    let mut okm = [0u8; 48];
    hkdf.expand(INTRO_ENC_INFO, &mut okm)
        .map_err(|_| Error::internal("HKDF expansion failed"))?;
    let mut enc_key = [0u8; 16];
    let mut mac_key = [0u8; 32];
    enc_key.copy_from_slice(&okm[0..16]);
    mac_key.copy_from_slice(&okm[16..48]);

    let mut mac = HmacSha3::new_from_slice(&mac_key)
        .map_err(|_| Error::internal("HMAC key construction failed"))?;
    mac.update(&payload[..mac_start]);
    let expected = mac.finalize().into_bytes();
    let mac_ok: bool = expected.as_slice().ct_eq(&payload[mac_start..]).into();
    if !mac_ok {
        return Err(Error::handshake("INTRODUCE1 MAC mismatch"));
    }

    let mut inner = payload[cipher_start..mac_start].to_vec();
    let iv = [0u8; 16];
    let mut cipher = Aes128Ctr::new(&enc_key.into(), &iv.into());
    cipher.apply_keystream(&mut inner);

    Ok((client_pk, inner))
}
