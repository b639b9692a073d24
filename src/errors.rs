//! Domain error types for the block engine.
//!
//! Structured errors instead of a String/anyhow mix; `anyhow` stays at the
//! binary's top level only.

use thiserror::Error;

/// Persistence layer errors (I/O or missing key).
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("missing key: {0}")]
    MissingKey(String),

    #[error("failed to decode value at {key}: {reason}")]
    Decode { key: String, reason: String },

    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
}

/// Block validation errors (structural or sequence rules).
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("invalid height: expected {expected}, got {actual}")]
    InvalidHeight { expected: u64, actual: u64 },

    #[error("timestamp {actual} earlier than parent timestamp {parent}")]
    TimestampRegression { actual: u64, parent: u64 },

    #[error("total distance does not extend parent: {0}")]
    TotalDistanceMismatch(String),

    #[error("distance {distance} does not beat difficulty {difficulty}")]
    InsufficientDistance { distance: String, difficulty: String },

    #[error("missing child headers for chain {0}")]
    MissingChildHeaders(String),

    #[error("invalid block sequence: {0}")]
    BrokenSequence(String),
}

/// Mining worker errors (crash or IPC failure).
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("failed to spawn worker: {0}")]
    SpawnFailed(String),

    #[error("worker IPC failure: {0}")]
    Ipc(String),

    #[error("worker crashed with exit code {0:?}")]
    Crashed(Option<i32>),
}

/// Peer RPC protocol errors (bad payload or range).
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error("malformed params: {0}")]
    BadParams(String),

    #[error("range too large: {span} blocks (max {max})")]
    RangeTooLarge { span: u64, max: u64 },

    #[error("range endpoint mismatch at height {height}")]
    EndpointMismatch { height: u64 },

    #[error("transport error: {0}")]
    Transport(String),
}

/// Unified node error.
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for NodeError {
    fn from(e: serde_json::Error) -> Self {
        NodeError::Serialization(e.to_string())
    }
}

impl From<sled::Error> for NodeError {
    fn from(e: sled::Error) -> Self {
        NodeError::Persistence(PersistenceError::Sled(e))
    }
}

/// Result alias for engine operations.
pub type NodeResult<T> = Result<T, NodeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_display() {
        let err = ValidationError::InvalidHeight {
            expected: 5,
            actual: 7,
        };
        assert!(err.to_string().contains("expected 5"));
        assert!(err.to_string().contains("got 7"));
    }

    #[test]
    fn node_error_from_persistence() {
        let err: NodeError = PersistenceError::MissingKey("bc.block.latest".into()).into();
        assert!(matches!(err, NodeError::Persistence(_)));
        assert!(err.to_string().contains("bc.block.latest"));
    }

    #[test]
    fn protocol_error_range() {
        let err = ProtocolError::RangeTooLarge {
            span: 200_000,
            max: 100_000,
        };
        assert!(err.to_string().contains("200000"));
    }
}
