//! Circuit pooling and isolation-aware reuse
//!
//! Prebuilt circuits wait here for checkout. A circuit bound to an
//! isolation key is only handed to requests whose key shares with it,
//! so traffic of differing sensitivity never rides the same circuit.

use super::isolation::IsolationKey;
use super::types::Circuit;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

/// Pool tuning knobs
#[derive(Debug, Clone)]
pub struct CircuitPoolConfig {
    /// Circuits the embedder should keep prebuilt
    pub target_pool_size: usize,

    /// Retire circuits older than this
    pub max_circuit_age: Duration,

    /// Retire circuits after this many checkouts
    pub max_reuse_count: usize,
}

impl Default for CircuitPoolConfig {
    fn default() -> Self {
        Self {
            target_pool_size: 3,
            max_circuit_age: Duration::from_secs(600),
            max_reuse_count: 10,
        }
    }
}

struct PooledCircuit {
    circuit: Arc<Circuit>,
    created_at: Instant,
    last_used: Instant,
    reuse_count: usize,
    in_use: bool,
}

/// Holds prebuilt circuits for checkout
pub struct CircuitPool {
    config: CircuitPoolConfig,
    entries: RwLock<Vec<PooledCircuit>>,
}

impl CircuitPool {
    pub fn new(config: CircuitPoolConfig) -> Self {
        Self {
            config,
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Offer a freshly built circuit to the pool.
    pub async fn add(&self, circuit: Arc<Circuit>) {
        let now = Instant::now();
        self.entries.write().await.push(PooledCircuit {
            circuit,
            created_at: now,
            last_used: now,
            reuse_count: 0,
            in_use: false,
        });
    }

    /// Check out a circuit compatible with the isolation key. The
    /// circuit becomes bound to the key.
    pub async fn acquire(&self, isolation: &IsolationKey) -> Option<Arc<Circuit>> {
        let mut entries = self.entries.write().await;
        for entry in entries.iter_mut() {
            if entry.in_use
                || entry.reuse_count >= self.config.max_reuse_count
                || entry.created_at.elapsed() > self.config.max_circuit_age
            {
                continue;
            }
            if !entry.circuit.is_open().await {
                continue;
            }
            if !entry.circuit.bind_isolation(isolation).await {
                continue;
            }

            entry.in_use = true;
            entry.reuse_count += 1;
            entry.last_used = Instant::now();
            debug!(circuit = %entry.circuit.id(), "circuit checked out");
            return Some(entry.circuit.clone());
        }
        None
    }

    /// Return a checked-out circuit.
    pub async fn release(&self, circuit: &Arc<Circuit>) {
        let mut entries = self.entries.write().await;
        for entry in entries.iter_mut() {
            if entry.circuit.id() == circuit.id() {
                entry.in_use = false;
                entry.last_used = Instant::now();
                return;
            }
        }
    }

    /// Retire aged, overused and dead circuits. Retired circuits that
    /// are still open get an orderly close. Returns how many were
    /// dropped.
    pub async fn cleanup(&self) -> usize {
        let mut entries = self.entries.write().await;
        let mut keep = Vec::with_capacity(entries.len());
        let mut retired = Vec::new();

        for entry in entries.drain(..) {
            let expired = entry.created_at.elapsed() > self.config.max_circuit_age;
            let worn = entry.reuse_count >= self.config.max_reuse_count;
            let dead = !entry.circuit.is_open().await;

            if entry.in_use || !(expired || worn || dead) {
                keep.push(entry);
            } else {
                retired.push(entry.circuit);
            }
        }
        *entries = keep;
        drop(entries);

        let count = retired.len();
        for circuit in retired {
            circuit.close().await;
        }
        count
    }

    /// How many circuits are idle and still usable.
    pub async fn idle_count(&self) -> usize {
        let entries = self.entries.read().await;
        let mut count = 0;
        for entry in entries.iter() {
            if !entry.in_use && entry.circuit.is_open().await {
                count += 1;
            }
        }
        count
    }

    /// How many new circuits the embedder should build to hit the
    /// target.
    pub async fn deficit(&self) -> usize {
        self.config
            .target_pool_size
            .saturating_sub(self.idle_count().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::open_test_circuit;

    #[tokio::test]
    async fn test_acquire_release_cycle() {
        let pool = CircuitPool::new(CircuitPoolConfig::default());
        let (circuit, _transport, _hops) = open_test_circuit(30).await;
        pool.add(circuit.clone()).await;

        let none = IsolationKey::None;
        let checked_out = pool.acquire(&none).await.unwrap();
        assert_eq!(checked_out.id(), circuit.id());

        // In use: a second acquire finds nothing.
        assert!(pool.acquire(&none).await.is_none());

        pool.release(&checked_out).await;
        assert!(pool.acquire(&none).await.is_some());
    }

    #[tokio::test]
    async fn test_isolation_keys_never_share() {
        let pool = CircuitPool::new(CircuitPoolConfig::default());
        let (circuit, _transport, _hops) = open_test_circuit(31).await;
        pool.add(circuit.clone()).await;

        let k1 = IsolationKey::destination("a.example", 443);
        let k2 = IsolationKey::destination("b.example", 443);

        let first = pool.acquire(&k1).await.unwrap();
        pool.release(&first).await;

        // Bound to k1 now; a k2 request must not get it.
        assert!(pool.acquire(&k2).await.is_none());
        assert!(pool.acquire(&k1).await.is_some());
    }

    #[tokio::test]
    async fn test_closed_circuits_skipped_and_cleaned() {
        let pool = CircuitPool::new(CircuitPoolConfig::default());
        let (circuit, _transport, _hops) = open_test_circuit(32).await;
        pool.add(circuit.clone()).await;

        circuit.mark_closed().await;
        assert!(pool.acquire(&IsolationKey::None).await.is_none());
        assert_eq!(pool.cleanup().await, 1);
        assert_eq!(pool.idle_count().await, 0);
    }

    #[tokio::test]
    async fn test_reuse_cap() {
        let config = CircuitPoolConfig {
            max_reuse_count: 2,
            ..Default::default()
        };
        let pool = CircuitPool::new(config);
        let (circuit, _transport, _hops) = open_test_circuit(33).await;
        pool.add(circuit.clone()).await;

        for _ in 0..2 {
            let c = pool.acquire(&IsolationKey::None).await.unwrap();
            pool.release(&c).await;
        }
        assert!(pool.acquire(&IsolationKey::None).await.is_none());
    }

    #[tokio::test]
    async fn test_deficit_tracks_target() {
        let pool = CircuitPool::new(CircuitPoolConfig {
            target_pool_size: 2,
            ..Default::default()
        });
        assert_eq!(pool.deficit().await, 2);

        let (circuit, _transport, _hops) = open_test_circuit(34).await;
        pool.add(circuit).await;
        assert_eq!(pool.deficit().await, 1);
    }
}
