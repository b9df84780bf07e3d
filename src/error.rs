//! Error types for the Medchain library

use crate::types::JoinState;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for Medchain operations
pub type Result<T> = std::result::Result<T, MedchainError>;

/// Main error type for Medchain operations
#[derive(Error, Debug)]
pub enum MedchainError {
    /// Transport-level failures talking to a peer
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Malformed envelope or payload
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A block or chain was rejected
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// The bootstrap node never delivered the chain
    #[error("Join via {bootstrap} timed out after {waited:?}")]
    JoinTimeout { bootstrap: String, waited: Duration },

    /// An application action was attempted before initial sync finished
    #[error("Node is not ready (state: {0})")]
    NotReady(JoinState),

    /// The replication server has not been started
    #[error("Node is not running")]
    NotRunning,

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Network-specific error types
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Failed to bind the listening socket
    #[error("Failed to bind to {addr}: {source}")]
    BindFailed {
        addr: String,
        source: std::io::Error,
    },

    /// Failed to connect to peer
    #[error("Failed to connect to {addr}: {source}")]
    ConnectionFailed {
        addr: String,
        source: std::io::Error,
    },

    /// Failed to write the envelope to a peer
    #[error("Failed to send to {addr}: {source}")]
    SendFailed {
        addr: String,
        source: std::io::Error,
    },

    /// Failed to read from an inbound connection
    #[error("Failed to receive from {addr}: {source}")]
    ReceiveFailed {
        addr: String,
        source: std::io::Error,
    },

    /// Address is not of the form host:port
    #[error("Invalid peer address {addr:?}: {reason}")]
    InvalidAddress { addr: String, reason: String },

    /// Timeout occurred
    #[error("Operation on {addr} timed out after {duration:?}")]
    Timeout { addr: String, duration: Duration },
}

/// Decode failures for envelopes and their nested payloads
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The connection closed without a message
    #[error("Connection closed before a message was received")]
    EmptyMessage,

    /// Line exceeds the configured maximum
    #[error("Message exceeds maximum size of {max_size} bytes")]
    MessageTooLarge { max_size: usize },

    /// The envelope itself could not be decoded
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(#[source] serde_json::Error),

    /// The envelope decoded but its payload did not
    #[error("Invalid {kind} payload: {source}")]
    InvalidPayload {
        kind: &'static str,
        source: serde_json::Error,
    },

    /// Message type code not part of the protocol
    #[error("Unknown message type {0}")]
    UnknownMessageType(String),

    /// Framing failure that is not an I/O error
    #[error("Invalid message framing: {reason}")]
    InvalidFraming { reason: String },
}

/// Reasons a block or chain received from a peer is refused
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Block index does not follow the tip
    #[error("Block index {actual} does not follow tip, expected {expected}")]
    UnexpectedIndex { expected: u64, actual: u64 },

    /// previous_hash does not match the tip's hash
    #[error("Block {index} does not link to the current tip")]
    BrokenLink { index: u64 },

    /// Stored hash is not the block's fingerprint
    #[error("Block {index} hash does not match its content")]
    HashMismatch { index: u64 },

    /// Candidate chain fails validation starting at the given index
    #[error("Chain is invalid from index {index}")]
    InvalidChain { index: u64 },

    /// Candidate chain has no blocks at all
    #[error("Chain is empty")]
    EmptyChain,

    /// Candidate chain starts somewhere other than index 0
    #[error("Chain starts at index {index} instead of a genesis block")]
    MissingGenesis { index: u64 },

    /// Candidate chain lost the fork choice against the local chain
    #[error("Candidate chain (length {candidate}) does not beat local chain (length {local})")]
    NotPreferred { local: usize, candidate: usize },
}

impl MedchainError {
    /// Create a configuration error
    pub fn config<T: Into<String>>(msg: T) -> Self {
        MedchainError::Config(msg.into())
    }

    /// True for failures caused by talking to a peer
    pub fn is_network(&self) -> bool {
        matches!(self, MedchainError::Network(_))
    }
}

impl NetworkError {
    /// Address of the peer involved, if any
    pub fn addr(&self) -> &str {
        match self {
            NetworkError::BindFailed { addr, .. }
            | NetworkError::ConnectionFailed { addr, .. }
            | NetworkError::SendFailed { addr, .. }
            | NetworkError::ReceiveFailed { addr, .. }
            | NetworkError::InvalidAddress { addr, .. }
            | NetworkError::Timeout { addr, .. } => addr,
        }
    }

    /// Whether retrying the same call could succeed
    pub fn is_transient(&self) -> bool {
        !matches!(self, NetworkError::InvalidAddress { .. } | NetworkError::BindFailed { .. })
    }
}
