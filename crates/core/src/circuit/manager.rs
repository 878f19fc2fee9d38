use super::types::{Circuit, CircuitId, CircuitState};
use crate::cells::{destroy_reason, Cell, CellCommand};
use crate::transport::CellSender;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, warn};
use veilway_common::{circuit as circuit_cfg, EngineConfig, Error, Result};

/// Owner of every circuit on this client
///
/// Assigns circuit IDs, routes inbound link cells to their circuit, and
/// supervises teardown. Lock discipline: the map lock is never held
/// across transport I/O.
pub struct CircuitManager {
    circuits: RwLock<HashMap<CircuitId, Arc<Circuit>>>,
    next_id: Mutex<u32>,
    closed: AtomicBool,
    config: EngineConfig,
}

impl CircuitManager {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            circuits: RwLock::new(HashMap::new()),
            next_id: Mutex::new(0),
            closed: AtomicBool::new(false),
            config,
        }
    }

    /// Allocate an ID and create a circuit on the given guard link.
    pub async fn create(&self, transport: Arc<dyn CellSender>) -> Result<Arc<Circuit>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ManagerClosed);
        }

        let mut circuits = self.circuits.write().await;
        let id = self.allocate_id(&circuits).await?;
        let circuit = Circuit::new(id, transport, self.config.clone());
        circuits.insert(id, circuit.clone());
        debug!(circuit = %id, total = circuits.len(), "circuit created");
        Ok(circuit)
    }

    /// IDs increase monotonically from 1, skip IDs still in use, and
    /// wrap. ID 0 is reserved.
    async fn allocate_id(&self, circuits: &HashMap<CircuitId, Arc<Circuit>>) -> Result<CircuitId> {
        let mut next = self.next_id.lock().await;
        let mut candidate = *next;
        for _ in 0..=circuits.len() + 1 {
            candidate = candidate.wrapping_add(1);
            if candidate == 0 {
                candidate = 1;
            }
            if !circuits.contains_key(&CircuitId(candidate)) {
                *next = candidate;
                return Ok(CircuitId(candidate));
            }
        }
        Err(Error::internal("circuit ID space exhausted"))
    }

    pub async fn get(&self, id: CircuitId) -> Option<Arc<Circuit>> {
        self.circuits.read().await.get(&id).cloned()
    }

    /// Close one circuit, keeping it in the map so state queries still
    /// see it until `cleanup`.
    pub async fn close_one(&self, id: CircuitId) -> bool {
        let circuit = self.circuits.read().await.get(&id).cloned();
        match circuit {
            Some(circuit) => {
                circuit.close().await;
                true
            }
            None => false,
        }
    }

    /// Close every circuit and refuse further creation. Idempotent.
    pub async fn close_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let circuits: Vec<_> = self.circuits.read().await.values().cloned().collect();
        for circuit in circuits {
            circuit.close().await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn count_by_state(&self, state: CircuitState) -> usize {
        let circuits: Vec<_> = self.circuits.read().await.values().cloned().collect();
        let mut count = 0;
        for circuit in circuits {
            if circuit.state().await == state {
                count += 1;
            }
        }
        count
    }

    /// Poll until at least `n` circuits are in `state`.
    pub async fn wait_for_count(
        &self,
        state: CircuitState,
        n: usize,
        timeout: Duration,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let poll = Duration::from_millis(circuit_cfg::WAIT_POLL_INTERVAL_MS);
        loop {
            if self.count_by_state(state).await >= n {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                _ = crate::shutdown::cancelled(cancel) => return Err(Error::Canceled),
            }
        }
    }

    /// Drop circuits that reached a terminal state. Returns how many
    /// were removed.
    pub async fn cleanup(&self) -> usize {
        let snapshot: Vec<_> = self.circuits.read().await.values().cloned().collect();
        let mut remove = Vec::new();
        for circuit in snapshot {
            if circuit.state().await.is_terminal() {
                remove.push(circuit.id());
            }
        }
        let mut circuits = self.circuits.write().await;
        let before = circuits.len();
        for id in remove {
            circuits.remove(&id);
        }
        before - circuits.len()
    }

    /// Single inbound dispatch path: route one link cell to its circuit.
    pub async fn dispatch_cell(&self, cell: Cell) -> Result<()> {
        let id = CircuitId(cell.circuit_id);
        let Some(circuit) = self.get(id).await else {
            warn!(circuit = %id, command = cell.raw_command(), "cell for unknown circuit");
            return Ok(());
        };

        match cell.command() {
            Some(CellCommand::Relay) | Some(CellCommand::RelayEarly) => {
                match circuit.handle_relay_cell(&cell.payload).await {
                    Ok(()) => Ok(()),
                    Err(err) => {
                        // Fatal errors already failed the circuit; queue
                        // overload is the transport layer's cue to drop it.
                        if !err.is_fatal_to_circuit() {
                            circuit.abort(destroy_reason::RESOURCELIMIT).await;
                        }
                        Err(err)
                    }
                }
            }
            Some(CellCommand::Padding) | Some(CellCommand::Vpadding) => Ok(()),
            _ => circuit.deliver_control(cell).await,
        }
    }

    /// One padding wake across all circuits. Each circuit emits at most
    /// one PADDING cell; returns how many were sent. Intended to be
    /// called from a periodic timer owned by the embedder.
    pub async fn padding_tick(&self) -> usize {
        let circuits: Vec<_> = self.circuits.read().await.values().cloned().collect();
        let mut emitted = 0;
        for circuit in circuits {
            match circuit.maybe_send_padding().await {
                Ok(true) => emitted += 1,
                Ok(false) => {}
                Err(err) => debug!(circuit = %circuit.id(), %err, "padding send failed"),
            }
        }
        emitted
    }

    pub async fn stats(&self) -> ManagerStats {
        let circuits: Vec<_> = self.circuits.read().await.values().cloned().collect();
        let mut stats = ManagerStats::default();
        stats.total = circuits.len();
        for circuit in circuits {
            match circuit.state().await {
                CircuitState::Building => stats.building += 1,
                CircuitState::Open => stats.open += 1,
                CircuitState::Closed => stats.closed += 1,
                CircuitState::Failed => stats.failed += 1,
            }
        }
        stats
    }
}

/// Circuit counts by state
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ManagerStats {
    pub total: usize,
    pub building: usize,
    pub open: usize,
    pub closed: usize,
    pub failed: usize,
}
