//! Shared test fixtures: an in-memory guard link and a relay-side
//! loopback harness with deterministic keys.

use crate::cells::{
    Cell, CellCommand, Create2Payload, Created2Payload, Extend2Payload, RelayCell, RelayCommand,
};
use crate::circuit::{Circuit, CircuitId};
use crate::crypto::{respond, HopKeys, LayerCipher, RunningDigest};
use crate::transport::CellSender;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use veilway_common::{
    handshake, EngineConfig, Ed25519Identity, Error, RelayAddr, RelayFingerprint, RelayFlags,
    RelayInfo, Result,
};
use x25519_dalek::{PublicKey, StaticSecret};

/// In-memory guard link capturing every sent cell
pub struct TestTransport {
    sent: Mutex<Vec<Cell>>,
    feed_tx: mpsc::UnboundedSender<Cell>,
    feed_rx: Mutex<mpsc::UnboundedReceiver<Cell>>,
    closed: AtomicBool,
}

impl TestTransport {
    pub fn new() -> Arc<Self> {
        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            feed_tx,
            feed_rx: Mutex::new(feed_rx),
            closed: AtomicBool::new(false),
        })
    }

    /// Snapshot of everything sent so far.
    pub async fn sent(&self) -> Vec<Cell> {
        self.sent.lock().await.clone()
    }

    /// Await the next sent cell (live feed, single consumer).
    pub async fn next_sent(&self) -> Option<Cell> {
        self.feed_rx.lock().await.recv().await
    }

    pub fn close_called(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CellSender for TestTransport {
    async fn send_cell(&self, cell: Cell) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::transport("link closed"));
        }
        self.sent.lock().await.push(cell.clone());
        let _ = self.feed_tx.send(cell);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Relay-side state for one hop, mirroring what the client installs
pub struct LoopbackHop {
    pub info: RelayInfo,
    pub client_keys: HopKeys,
    pub onion_secret: StaticSecret,
    pub relay_forward_cipher: LayerCipher,
    pub relay_forward_digest: RunningDigest,
    pub relay_backward_cipher: LayerCipher,
    pub relay_backward_digest: RunningDigest,
}

impl LoopbackHop {
    /// Hop with key material derived from the fixed seed, bypassing the
    /// handshake. Client and relay sides share the same keys.
    pub fn deterministic(seed: u8) -> Self {
        let keys = HopKeys::derive(&[seed; 32]).expect("KDF");
        let onion_secret = StaticSecret::from([seed.wrapping_add(100); 32]);
        Self::with_keys(relay_info(seed, &onion_secret), onion_secret, keys)
    }

    pub fn with_keys(info: RelayInfo, onion_secret: StaticSecret, keys: HopKeys) -> Self {
        Self {
            info,
            relay_forward_cipher: LayerCipher::new(&keys.forward_key),
            relay_forward_digest: RunningDigest::seeded(&keys.forward_digest_seed),
            relay_backward_cipher: LayerCipher::new(&keys.backward_key),
            relay_backward_digest: RunningDigest::seeded(&keys.backward_digest_seed),
            client_keys: keys,
            onion_secret,
        }
    }

    /// Forward-direction recognition as the relay would perform it.
    pub fn relay_recognize_forward(&mut self, buf: &[u8]) -> bool {
        if buf[1] != 0 || buf[2] != 0 {
            return false;
        }
        let mut expected = [0u8; 4];
        expected.copy_from_slice(&buf[5..9]);
        let mut zeroed = buf.to_vec();
        zeroed[5..9].fill(0);
        self.relay_forward_digest.check_and_commit(&zeroed, &expected)
    }
}

/// Deterministic relay record for a seed.
pub fn relay_info(seed: u8, onion_secret: &StaticSecret) -> RelayInfo {
    RelayInfo {
        fingerprint: RelayFingerprint::from_bytes([seed; 20]),
        ed_identity: Some(Ed25519Identity::from_bytes([seed; 32])),
        addr: RelayAddr::from_socket(
            format!("10.0.0.{}:9001", seed).parse().expect("socket addr"),
        ),
        ntor_onion_key: *PublicKey::from(onion_secret).as_bytes(),
        flags: RelayFlags {
            is_guard: seed == 1,
            is_exit: seed == 3,
            is_hsdir: false,
        },
    }
}

/// An open 3-hop circuit with deterministic keys on both sides.
pub async fn open_test_circuit(id: u32) -> (Arc<Circuit>, Arc<TestTransport>, Vec<LoopbackHop>) {
    let transport = TestTransport::new();
    let circuit = Circuit::new(CircuitId(id), transport.clone(), EngineConfig::default());

    let mut hops = Vec::new();
    for seed in 1..=3u8 {
        let hop = LoopbackHop::deterministic(seed);
        circuit
            .add_hop(hop.info.clone(), &hop.client_keys)
            .await
            .expect("add hop");
        hops.push(hop);
    }
    circuit.mark_open().await.expect("open");

    (circuit, transport, hops)
}

/// Relay-side sealing of one backward cell at its origin hop: encode
/// with zero digest, absorb into the hop's backward digest, patch the
/// prefix in. Returns the un-encrypted 509-byte payload.
pub fn relay_seal_backward(hop: &mut LoopbackHop, cell: RelayCell) -> Vec<u8> {
    let mut zeroed = cell;
    zeroed.digest = [0u8; 4];
    zeroed.recognized = 0;
    let mut buf = zeroed.encode().expect("encode");
    let digest = hop.relay_backward_digest.absorb(&buf);
    buf[5..9].copy_from_slice(&digest);
    buf
}

/// Encrypt a sealed backward payload through each hop from the origin
/// toward the guard, producing the wire form the client decrypts.
pub fn wrap_backward(hops: &mut [LoopbackHop], origin: usize, sealed: Vec<u8>) -> Vec<u8> {
    let mut buf = sealed;
    for hop in hops[..=origin].iter_mut().rev() {
        hop.relay_backward_cipher.apply(&mut buf);
    }
    buf
}

/// Relay-side forward unwrap: peel layers guard-first until a hop
/// recognizes the cell. Returns the origin hop index and the decrypted
/// payload.
pub fn relay_unwrap_forward(hops: &mut [LoopbackHop], payload: &[u8]) -> Option<(usize, Vec<u8>)> {
    let mut buf = payload.to_vec();
    for (i, hop) in hops.iter_mut().enumerate() {
        hop.relay_forward_cipher.apply(&mut buf);
        if hop.relay_recognize_forward(&buf) {
            return Some((i, buf));
        }
    }
    None
}

/// Drive the relay side of a CREATE2/EXTEND2 build: answers the client's
/// handshakes with real ntor responses so the builder derives matching
/// keys. Returns a handle that finishes when the transport is dropped or
/// a DESTROY is seen.
pub fn spawn_build_responder(
    transport: Arc<TestTransport>,
    circuit: Arc<Circuit>,
    seeds: [u8; 3],
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let secrets: Vec<StaticSecret> = seeds
            .iter()
            .map(|s| StaticSecret::from([s.wrapping_add(100); 32]))
            .collect();
        let fps: Vec<RelayFingerprint> = seeds
            .iter()
            .map(|s| RelayFingerprint::from_bytes([*s; 20]))
            .collect();
        let mut installed: Vec<LoopbackHop> = Vec::new();

        while let Some(cell) = transport.next_sent().await {
            match cell.command() {
                Some(CellCommand::Create2) => {
                    let create2 = Create2Payload::decode(&cell.payload).expect("CREATE2");
                    if create2.htype != handshake::NTOR {
                        let _ = circuit.deliver_control(Cell::destroy(cell.circuit_id, 1)).await;
                        continue;
                    }
                    let (reply, key_seed) =
                        respond(fps[0], &secrets[0], &create2.hdata).expect("respond");
                    let keys = HopKeys::derive(&key_seed).expect("KDF");
                    installed.push(LoopbackHop::with_keys(
                        relay_info(seeds[0], &secrets[0]),
                        secrets[0].clone(),
                        keys,
                    ));
                    let created = Created2Payload { hdata: reply };
                    circuit
                        .deliver_control(Cell::new(
                            cell.circuit_id,
                            CellCommand::Created2,
                            created.encode(),
                        ))
                        .await
                        .expect("deliver CREATED2");
                }
                Some(CellCommand::Relay) | Some(CellCommand::RelayEarly) => {
                    let mut buf = cell.payload.clone();
                    let mut origin = None;
                    for (i, hop) in installed.iter_mut().enumerate() {
                        hop.relay_forward_cipher.apply(&mut buf);
                        if hop.relay_recognize_forward(&buf) {
                            origin = Some(i);
                            break;
                        }
                    }
                    let Some(origin) = origin else { continue };
                    let relay_cell = RelayCell::decode(&buf).expect("relay cell");

                    if relay_cell.command == RelayCommand::Extend2 {
                        let next = installed.len();
                        let extend = Extend2Payload::decode(&relay_cell.data).expect("EXTEND2");
                        let (reply, key_seed) =
                            respond(fps[next], &secrets[next], &extend.hdata).expect("respond");
                        let keys = HopKeys::derive(&key_seed).expect("KDF");

                        let extended = RelayCell::new(
                            RelayCommand::Extended2,
                            0,
                            Created2Payload { hdata: reply }.encode(),
                        );
                        let sealed = relay_seal_backward(&mut installed[origin], extended);
                        let payload = wrap_backward(&mut installed, origin, sealed);

                        installed.push(LoopbackHop::with_keys(
                            relay_info(seeds[next], &secrets[next]),
                            secrets[next].clone(),
                            keys,
                        ));

                        circuit
                            .handle_relay_cell(&payload)
                            .await
                            .expect("deliver EXTENDED2");
                    }
                }
                Some(CellCommand::Destroy) => break,
                _ => {}
            }
        }
    })
}
