//! 3-hop circuit construction
//!
//! CREATE2 establishes the guard hop directly on the link; each EXTEND2
//! rides the circuit as RELAY_EARLY, addressed to the current last hop,
//! which dials the next relay. Builder operations are serialized so
//! concurrent callers never interleave handshakes on one circuit.

use super::manager::CircuitManager;
use super::types::Circuit;
use crate::cells::{
    Cell, CellCommand, Create2Payload, Created2Payload, Extend2Payload, LinkSpec, RelayCell,
    RelayCommand,
};
use crate::crypto::{HopKeys, NtorClient};
use crate::transport::CellSender;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};
use veilway_common::{circuit as circuit_cfg, EngineConfig, Error, RelayInfo, Result};

/// The three relays of a standard client circuit
#[derive(Debug, Clone)]
pub struct Path {
    pub guard: RelayInfo,
    pub middle: RelayInfo,
    pub exit: RelayInfo,
}

impl Path {
    pub fn hops(&self) -> [&RelayInfo; 3] {
        [&self.guard, &self.middle, &self.exit]
    }
}

/// Builds circuits through a guard link
pub struct CircuitBuilder {
    manager: Arc<CircuitManager>,
    config: EngineConfig,
    build_lock: Mutex<()>,
}

impl CircuitBuilder {
    pub fn new(manager: Arc<CircuitManager>, config: EngineConfig) -> Self {
        Self {
            manager,
            config,
            build_lock: Mutex::new(()),
        }
    }

    pub fn manager(&self) -> &Arc<CircuitManager> {
        &self.manager
    }

    /// Build a 3-hop circuit over `transport`, honoring the timeout and
    /// the shutdown signal. Any failure marks the circuit Failed and
    /// closes the transport.
    pub async fn build(
        &self,
        transport: Arc<dyn CellSender>,
        path: Path,
        timeout: Duration,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<Arc<Circuit>> {
        let _serialized = self.build_lock.lock().await;

        let circuit = self.manager.create(transport.clone()).await?;
        info!(circuit = %circuit.id(), exit = %path.exit.fingerprint, "building circuit");

        let result = tokio::select! {
            stepped = tokio::time::timeout(timeout, self.build_inner(&circuit, &transport, &path)) => {
                match stepped {
                    Ok(inner) => inner,
                    Err(_) => Err(Error::Timeout),
                }
            }
            _ = crate::shutdown::cancelled(cancel) => Err(Error::Canceled),
        };

        let finished = match result {
            Ok(()) => circuit.mark_open().await,
            Err(err) => Err(err),
        };
        match finished {
            Ok(()) => {
                info!(circuit = %circuit.id(), "circuit built");
                Ok(circuit)
            }
            Err(err) => {
                warn!(circuit = %circuit.id(), %err, "circuit build failed");
                circuit.mark_failed().await;
                let _ = transport.close().await;
                Err(err)
            }
        }
    }

    /// Convenience wrapper with the configured timeout and no external
    /// shutdown signal.
    pub async fn build_default(
        &self,
        transport: Arc<dyn CellSender>,
        path: Path,
    ) -> Result<Arc<Circuit>> {
        let (_tx, mut cancel) = watch::channel(false);
        self.build(transport, path, self.config.build_timeout, &mut cancel)
            .await
    }

    async fn build_inner(
        &self,
        circuit: &Arc<Circuit>,
        transport: &Arc<dyn CellSender>,
        path: &Path,
    ) -> Result<()> {
        self.create_guard_hop(circuit, transport, &path.guard).await?;
        self.extend_to(circuit, &path.middle).await?;
        self.extend_to(circuit, &path.exit).await?;
        Ok(())
    }

    /// CREATE2 -> CREATED2 with the guard, directly on the link.
    async fn create_guard_hop(
        &self,
        circuit: &Arc<Circuit>,
        transport: &Arc<dyn CellSender>,
        guard: &RelayInfo,
    ) -> Result<()> {
        let ntor = NtorClient::new(guard.fingerprint, guard.ntor_onion_key);
        let payload = Create2Payload::ntor(ntor.onionskin());
        transport
            .send_cell(Cell::new(
                circuit.id().as_u32(),
                CellCommand::Create2,
                payload.encode(),
            ))
            .await?;
        debug!(circuit = %circuit.id(), "CREATE2 sent");

        let reply = circuit.recv_control(self.step_timeout()).await?;
        match reply.command() {
            Some(CellCommand::Created2) => {
                let created = Created2Payload::decode(&reply.payload)?;
                let key_seed = ntor.complete(&created.hdata)?;
                let keys = HopKeys::derive(&key_seed)?;
                circuit.add_hop(guard.clone(), &keys).await
            }
            Some(CellCommand::Destroy) => {
                Err(Error::protocol("guard destroyed the circuit during CREATE2"))
            }
            _ => Err(Error::protocol(format!(
                "unexpected reply to CREATE2: command {}",
                reply.raw_command()
            ))),
        }
    }

    /// EXTEND2 -> EXTENDED2 through the circuit to the next relay.
    async fn extend_to(&self, circuit: &Arc<Circuit>, next: &RelayInfo) -> Result<()> {
        let ntor = NtorClient::new(next.fingerprint, next.ntor_onion_key);
        let extend = Extend2Payload::ntor(LinkSpec::for_relay(next), ntor.onionskin());
        let cell = RelayCell::new(RelayCommand::Extend2, 0, extend.encode()?);
        circuit.send_relay_cell_early(cell).await?;
        debug!(circuit = %circuit.id(), next = %next.fingerprint, "EXTEND2 sent");

        let reply = self.recv_extend_reply(circuit).await?;
        match reply.command {
            RelayCommand::Extended2 => {
                let extended = Created2Payload::decode(&reply.data)?;
                let key_seed = ntor.complete(&extended.hdata)?;
                let keys = HopKeys::derive(&key_seed)?;
                circuit.add_hop(next.clone(), &keys).await
            }
            RelayCommand::Truncated => Err(Error::protocol(format!(
                "extension refused: truncated with reason {}",
                reply.data.first().copied().unwrap_or(0)
            ))),
            other => Err(Error::protocol(format!(
                "unexpected reply to EXTEND2: {:?}",
                other
            ))),
        }
    }

    /// Wait for the EXTENDED2 reply, polling so a DESTROY that fails the
    /// circuit mid-wait is noticed immediately.
    async fn recv_extend_reply(&self, circuit: &Arc<Circuit>) -> Result<RelayCell> {
        let deadline = tokio::time::Instant::now() + self.step_timeout();
        let poll = Duration::from_millis(circuit_cfg::WAIT_POLL_INTERVAL_MS);
        loop {
            match circuit.recv_relay(poll).await {
                Ok(cell) => return Ok(cell),
                Err(Error::Timeout) => {
                    if circuit.state().await.is_terminal() {
                        return Err(Error::CircuitClosed);
                    }
                    if tokio::time::Instant::now() >= deadline {
                        return Err(Error::Timeout);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn step_timeout(&self) -> Duration {
        Duration::from_secs(circuit_cfg::HANDSHAKE_STEP_TIMEOUT_SECS)
    }
}
