use thiserror::Error;

/// Common error type for the Veilway protocol engine
#[derive(Debug, Error)]
pub enum Error {
    #[error("Malformed cell: {0}")]
    MalformedCell(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Relay cell digest mismatch")]
    DigestMismatch,

    #[error("Replayed cell detected")]
    ReplayDetected,

    #[error("Send window exhausted")]
    FlowControlBlocked,

    #[error("Circuit is not open")]
    CircuitNotOpen,

    #[error("Circuit is closed")]
    CircuitClosed,

    #[error("Circuit manager is closed")]
    ManagerClosed,

    #[error("Operation timed out")]
    Timeout,

    #[error("Operation canceled")]
    Canceled,

    #[error("Transport failed: {0}")]
    Transport(String),

    #[error("Invalid onion address: {0}")]
    AddressParse(String),

    #[error("Descriptor not found for {0}")]
    DescriptorNotFound(String),

    #[error("Descriptor expired")]
    DescriptorExpired,

    #[error("No usable introduction points")]
    NoIntroductionPoints,

    #[error("No rendezvous point available")]
    NoRendezvousPoint,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type for Veilway operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedCell(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn handshake(msg: impl Into<String>) -> Self {
        Self::HandshakeFailed(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn address(msg: impl Into<String>) -> Self {
        Self::AddressParse(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error must tear down the circuit it occurred on.
    ///
    /// Digest mismatches and replays indicate an integrity failure or cell
    /// injection and are never masked.
    pub fn is_fatal_to_circuit(&self) -> bool {
        matches!(
            self,
            Self::MalformedCell(_)
                | Self::Protocol(_)
                | Self::HandshakeFailed(_)
                | Self::DigestMismatch
                | Self::ReplayDetected
                | Self::Transport(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(Error::DigestMismatch.is_fatal_to_circuit());
        assert!(Error::ReplayDetected.is_fatal_to_circuit());
        assert!(Error::malformed("short").is_fatal_to_circuit());

        assert!(!Error::FlowControlBlocked.is_fatal_to_circuit());
        assert!(!Error::Timeout.is_fatal_to_circuit());
        assert!(!Error::Canceled.is_fatal_to_circuit());
    }

    #[test]
    fn test_helper_constructors() {
        match Error::protocol("bad htype") {
            Error::Protocol(msg) => assert_eq!(msg, "bad htype"),
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
