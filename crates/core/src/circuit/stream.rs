//! Application streams multiplexed over one circuit
//!
//! The stream manager owns the circuit's inbound FIFO: a pump task
//! drains decoded relay cells and routes them by stream ID. Outbound
//! data is chunked into RELAY_DATA cells under the per-stream window on
//! top of the circuit-level window.

use super::types::{Circuit, CircuitState};
use crate::cells::{
    encode_hostname_request, end_reason, parse_resolved, RelayCell, RelayCommand, ResolvedRecord,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tracing::{debug, warn};
use veilway_common::{cell as wire, flow, Error, Result};

struct StreamState {
    data_tx: mpsc::Sender<Vec<u8>>,
    connect_tx: Option<oneshot::Sender<Result<()>>>,
    resolve_tx: Option<oneshot::Sender<Result<Vec<ResolvedRecord>>>>,
    package_window: u16,
    deliver_window: u16,
    delivered_since_sendme: u16,
}

impl StreamState {
    fn new() -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (data_tx, data_rx) = mpsc::channel(32);
        (
            Self {
                data_tx,
                connect_tx: None,
                resolve_tx: None,
                package_window: flow::STREAM_WINDOW_INITIAL,
                deliver_window: flow::STREAM_WINDOW_INITIAL,
                delivered_since_sendme: 0,
            },
            data_rx,
        )
    }
}

/// Multiplexes application streams over one circuit by stream ID
pub struct StreamManager {
    circuit: Arc<Circuit>,
    streams: RwLock<HashMap<u16, StreamState>>,
    next_stream_id: Mutex<u16>,
    shutdown_tx: watch::Sender<bool>,
}

impl StreamManager {
    /// Create the manager and start its pump task.
    pub fn spawn(circuit: Arc<Circuit>) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let manager = Arc::new(Self {
            circuit,
            streams: RwLock::new(HashMap::new()),
            next_stream_id: Mutex::new(0),
            shutdown_tx,
        });

        let pump = manager.clone();
        tokio::spawn(async move {
            pump.run(shutdown_rx).await;
        });

        manager
    }

    pub fn circuit(&self) -> &Arc<Circuit> {
        &self.circuit
    }

    /// Stop the pump. Streams see their data channels close.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.streams.write().await.clear();
    }

    async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            let cell = tokio::select! {
                received = self.circuit.recv_relay(Duration::from_millis(250)) => received,
                _ = crate::shutdown::cancelled(&mut shutdown) => return,
            };
            match cell {
                Ok(cell) => {
                    if let Err(err) = self.route(cell).await {
                        warn!(circuit = %self.circuit.id(), %err, "stream routing error");
                    }
                }
                Err(Error::Timeout) => continue,
                Err(_) => return,
            }
        }
    }

    async fn route(&self, cell: RelayCell) -> Result<()> {
        let stream_id = cell.stream_id;
        match cell.command {
            RelayCommand::Data => self.on_data(stream_id, cell.data).await,
            RelayCommand::Connected => {
                let mut streams = self.streams.write().await;
                if let Some(state) = streams.get_mut(&stream_id) {
                    if let Some(tx) = state.connect_tx.take() {
                        let _ = tx.send(Ok(()));
                    }
                }
                Ok(())
            }
            RelayCommand::End => {
                let reason = cell.end_reason();
                debug!(circuit = %self.circuit.id(), stream_id, reason, "stream ended by peer");
                let mut streams = self.streams.write().await;
                if let Some(mut state) = streams.remove(&stream_id) {
                    if let Some(tx) = state.connect_tx.take() {
                        let _ = tx.send(Err(Error::protocol(format!(
                            "stream refused with END reason {}",
                            reason
                        ))));
                    }
                    if let Some(tx) = state.resolve_tx.take() {
                        let _ = tx.send(Err(Error::protocol("resolve stream ended")));
                    }
                }
                Ok(())
            }
            RelayCommand::Sendme if stream_id != 0 => {
                let mut streams = self.streams.write().await;
                if let Some(state) = streams.get_mut(&stream_id) {
                    state.package_window += flow::STREAM_WINDOW_INCREMENT;
                }
                Ok(())
            }
            RelayCommand::Resolved => {
                let mut streams = self.streams.write().await;
                if let Some(state) = streams.get_mut(&stream_id) {
                    if let Some(tx) = state.resolve_tx.take() {
                        let _ = tx.send(parse_resolved(&cell.data));
                    }
                }
                Ok(())
            }
            other => {
                debug!(circuit = %self.circuit.id(), stream_id, command = ?other, "unhandled relay command");
                Ok(())
            }
        }
    }

    async fn on_data(&self, stream_id: u16, data: Vec<u8>) -> Result<()> {
        let mut send_sendme = false;
        {
            let mut streams = self.streams.write().await;
            let Some(state) = streams.get_mut(&stream_id) else {
                debug!(stream_id, "data for unknown stream dropped");
                return Ok(());
            };

            if state.deliver_window == 0 {
                return Err(Error::protocol("peer overran the stream deliver window"));
            }
            state.deliver_window -= 1;
            state.delivered_since_sendme += 1;
            if state.delivered_since_sendme >= flow::STREAM_WINDOW_INCREMENT {
                state.deliver_window += flow::STREAM_WINDOW_INCREMENT;
                state.delivered_since_sendme = 0;
                send_sendme = true;
            }

            // Slow consumers exert backpressure here rather than growing
            // an unbounded buffer.
            if state.data_tx.send(data).await.is_err() {
                streams.remove(&stream_id);
            }
        }

        if send_sendme {
            self.circuit
                .send_relay_cell(RelayCell::stream_sendme(stream_id))
                .await?;
        }
        Ok(())
    }

    async fn allocate_stream_id(&self) -> Result<u16> {
        let streams = self.streams.read().await;
        let mut next = self.next_stream_id.lock().await;
        let mut candidate = *next;
        for _ in 0..=streams.len() + 1 {
            candidate = candidate.wrapping_add(1);
            if candidate == 0 {
                candidate = 1;
            }
            if !streams.contains_key(&candidate) {
                *next = candidate;
                return Ok(candidate);
            }
        }
        Err(Error::internal("stream ID space exhausted"))
    }

    /// Open a TCP stream through the exit: RELAY_BEGIN -> CONNECTED.
    pub async fn open_stream(
        self: &Arc<Self>,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<CircuitStream> {
        if self.circuit.state().await != CircuitState::Open {
            return Err(Error::CircuitNotOpen);
        }

        let stream_id = self.allocate_stream_id().await?;
        let (connect_tx, connect_rx) = oneshot::channel();
        let data_rx = {
            let (mut state, data_rx) = StreamState::new();
            state.connect_tx = Some(connect_tx);
            self.streams.write().await.insert(stream_id, state);
            data_rx
        };

        let begin = RelayCell::begin(stream_id, host, port, 0);
        if let Err(err) = self.circuit.send_relay_cell(begin).await {
            self.streams.write().await.remove(&stream_id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, connect_rx).await {
            Ok(Ok(Ok(()))) => Ok(CircuitStream {
                stream_id,
                data_rx,
                manager: self.clone(),
            }),
            Ok(Ok(Err(err))) => {
                self.streams.write().await.remove(&stream_id);
                Err(err)
            }
            Ok(Err(_)) => {
                self.streams.write().await.remove(&stream_id);
                Err(Error::CircuitClosed)
            }
            Err(_) => {
                self.streams.write().await.remove(&stream_id);
                Err(Error::Timeout)
            }
        }
    }

    /// Resolve a hostname through the exit: RELAY_RESOLVE -> RESOLVED.
    pub async fn resolve(&self, hostname: &str, timeout: Duration) -> Result<Vec<ResolvedRecord>> {
        if self.circuit.state().await != CircuitState::Open {
            return Err(Error::CircuitNotOpen);
        }

        let stream_id = self.allocate_stream_id().await?;
        let (resolve_tx, resolve_rx) = oneshot::channel();
        {
            let (mut state, _data_rx) = StreamState::new();
            state.resolve_tx = Some(resolve_tx);
            self.streams.write().await.insert(stream_id, state);
        }

        let request = RelayCell::new(
            RelayCommand::Resolve,
            stream_id,
            encode_hostname_request(hostname),
        );
        if let Err(err) = self.circuit.send_relay_cell(request).await {
            self.streams.write().await.remove(&stream_id);
            return Err(err);
        }

        let result = match tokio::time::timeout(timeout, resolve_rx).await {
            Ok(Ok(records)) => records,
            Ok(Err(_)) => Err(Error::CircuitClosed),
            Err(_) => Err(Error::Timeout),
        };
        self.streams.write().await.remove(&stream_id);
        result
    }

    /// Send application bytes on a stream, chunked into RELAY_DATA.
    async fn send_data(&self, stream_id: u16, data: &[u8]) -> Result<()> {
        for chunk in data.chunks(wire::RELAY_DATA_MAX) {
            {
                let mut streams = self.streams.write().await;
                let state = streams
                    .get_mut(&stream_id)
                    .ok_or(Error::CircuitClosed)?;
                if state.package_window == 0 {
                    return Err(Error::FlowControlBlocked);
                }
                state.package_window -= 1;
            }
            self.circuit
                .send_relay_cell(RelayCell::new(
                    RelayCommand::Data,
                    stream_id,
                    chunk.to_vec(),
                ))
                .await?;
        }
        Ok(())
    }

    /// End a stream and forget it.
    async fn close_stream(&self, stream_id: u16) -> Result<()> {
        let removed = self.streams.write().await.remove(&stream_id).is_some();
        if removed && self.circuit.state().await == CircuitState::Open {
            self.circuit
                .send_relay_cell(RelayCell::end(stream_id, end_reason::DONE))
                .await?;
        }
        Ok(())
    }
}

/// One application stream riding a circuit
pub struct CircuitStream {
    stream_id: u16,
    data_rx: mpsc::Receiver<Vec<u8>>,
    manager: Arc<StreamManager>,
}

impl std::fmt::Debug for CircuitStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitStream")
            .field("stream_id", &self.stream_id)
            .finish()
    }
}

impl CircuitStream {
    pub fn stream_id(&self) -> u16 {
        self.stream_id
    }

    /// Send bytes toward the destination.
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        self.manager.send_data(self.stream_id, data).await
    }

    /// Next chunk of bytes from the destination; None when the stream
    /// is over.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.data_rx.recv().await
    }

    /// End the stream with RELAY_END.
    pub async fn close(self) -> Result<()> {
        self.manager.close_stream(self.stream_id).await
    }
}
