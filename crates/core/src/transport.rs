//! Capability interfaces toward the embedding service
//!
//! The engine never owns a socket. It borrows a `CellSender` for the
//! guard link (the transport owns the TLS connection and serializes
//! writes behind its own mutex), a `RelayKeySource` for relay lookup and
//! path construction, and an `HsDirSource` for descriptor fetches.

use async_trait::async_trait;
use veilway_common::{RelayFingerprint, RelayInfo, Result};

use crate::cells::Cell;
use crate::circuit::Path;

/// Write half of a guard link shared by every circuit on it
#[async_trait]
pub trait CellSender: Send + Sync {
    /// Queue one cell for the wire. May block on transport writability.
    async fn send_cell(&self, cell: Cell) -> Result<()>;

    /// Tear the link down. Idempotent.
    async fn close(&self) -> Result<()>;

    /// Whether the link has been closed.
    fn is_closed(&self) -> bool;
}

/// Relay lookup backed by the embedder's consensus database
#[async_trait]
pub trait RelayKeySource: Send + Sync {
    /// Full relay record for a fingerprint.
    async fn relay(&self, fingerprint: &RelayFingerprint) -> Option<RelayInfo>;

    /// Relays carrying the HSDir flag.
    async fn hsdir_relays(&self) -> Vec<RelayInfo>;

    /// A relay suitable as a rendezvous point.
    async fn rendezvous_relay(&self) -> Option<RelayInfo>;

    /// A guard/middle path terminating at the given relay.
    async fn path_to(&self, target: &RelayInfo) -> Option<Path>;
}

/// Hidden-service descriptor fetch from one HSDir
#[async_trait]
pub trait HsDirSource: Send + Sync {
    /// Fetch the raw descriptor stored under `desc_id` at `hsdir`.
    async fn fetch_descriptor(
        &self,
        hsdir: &RelayFingerprint,
        desc_id: &[u8; 32],
    ) -> Result<Vec<u8>>;
}
