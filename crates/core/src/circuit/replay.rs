//! Replay protection for relay cells
//!
//! Each direction keeps a monotone sequence counter and a bounded
//! sliding window of recently seen payload hashes. Seeing the same
//! payload twice in one direction is cell injection and tears the
//! circuit down.

use sha2::{Digest, Sha256};
use std::collections::{HashSet, VecDeque};
use veilway_common::{circuit as circuit_cfg, Direction, Error, Result};

#[derive(Debug, Default)]
struct DirectionWindow {
    order: VecDeque<[u8; 32]>,
    seen: HashSet<[u8; 32]>,
    last_seq: Option<u64>,
}

/// Sliding-window replay guard for one circuit
#[derive(Debug)]
pub struct ReplayGuard {
    windows: [DirectionWindow; 2],
    capacity: usize,
}

impl ReplayGuard {
    pub fn new() -> Self {
        Self::with_capacity(circuit_cfg::REPLAY_WINDOW)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            windows: [DirectionWindow::default(), DirectionWindow::default()],
            capacity,
        }
    }

    /// Record a cell payload for a direction, failing on replay.
    ///
    /// `seq` is the caller's per-direction cell counter and must be
    /// strictly increasing between calls.
    pub fn validate_and_track(
        &mut self,
        direction: Direction,
        seq: u64,
        bytes: &[u8],
    ) -> Result<()> {
        let window = &mut self.windows[direction.index()];

        if let Some(last) = window.last_seq {
            if seq <= last {
                return Err(Error::protocol(format!(
                    "cell sequence went backwards: {} after {}",
                    seq, last
                )));
            }
        }
        window.last_seq = Some(seq);

        let hash: [u8; 32] = Sha256::digest(bytes).into();
        if window.seen.contains(&hash) {
            return Err(Error::ReplayDetected);
        }

        window.order.push_back(hash);
        window.seen.insert(hash);
        while window.order.len() > self.capacity {
            if let Some(evicted) = window.order.pop_front() {
                window.seen.remove(&evicted);
            }
        }

        Ok(())
    }

    /// Forget everything; called on circuit teardown.
    pub fn reset(&mut self) {
        for window in &mut self.windows {
            window.order.clear();
            window.seen.clear();
            window.last_seq = None;
        }
    }

    pub fn tracked(&self, direction: Direction) -> usize {
        self.windows[direction.index()].order.len()
    }
}

impl Default for ReplayGuard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_payload_detected() {
        let mut guard = ReplayGuard::new();
        guard
            .validate_and_track(Direction::Backward, 1, b"cell payload")
            .unwrap();

        assert!(matches!(
            guard.validate_and_track(Direction::Backward, 2, b"cell payload"),
            Err(Error::ReplayDetected)
        ));
    }

    #[test]
    fn test_directions_are_independent() {
        let mut guard = ReplayGuard::new();
        guard
            .validate_and_track(Direction::Forward, 1, b"payload")
            .unwrap();
        guard
            .validate_and_track(Direction::Backward, 1, b"payload")
            .unwrap();
    }

    #[test]
    fn test_window_eviction() {
        let mut guard = ReplayGuard::with_capacity(2);
        guard.validate_and_track(Direction::Forward, 1, b"a").unwrap();
        guard.validate_and_track(Direction::Forward, 2, b"b").unwrap();
        guard.validate_and_track(Direction::Forward, 3, b"c").unwrap();
        assert_eq!(guard.tracked(Direction::Forward), 2);

        // "a" was evicted, so it is no longer treated as a replay.
        guard.validate_and_track(Direction::Forward, 4, b"a").unwrap();
    }

    #[test]
    fn test_sequence_must_increase() {
        let mut guard = ReplayGuard::new();
        guard.validate_and_track(Direction::Forward, 5, b"x").unwrap();
        assert!(guard
            .validate_and_track(Direction::Forward, 5, b"y")
            .is_err());
        assert!(guard
            .validate_and_track(Direction::Forward, 4, b"z")
            .is_err());
    }

    #[test]
    fn test_reset_clears_state() {
        let mut guard = ReplayGuard::new();
        guard.validate_and_track(Direction::Forward, 1, b"a").unwrap();
        guard.reset();
        assert_eq!(guard.tracked(Direction::Forward), 0);
        guard.validate_and_track(Direction::Forward, 1, b"a").unwrap();
    }
}
