//! Medchain - a peer-to-peer append-only ledger for medical records
//!
//! Nodes keep a full copy of a hash-linked chain and a view of peer
//! membership. New records are appended locally and pushed to every known
//! peer; new nodes join through one existing member and pull its chain and
//! peer list.

// Modules
pub mod config;
pub mod crypto;
pub mod error;
pub mod ledger;
pub mod membership;
pub mod network;
pub mod node;
pub mod protocol;
pub mod server;
pub mod types;

// Re-exports
pub use config::{ChainPolicy, NodeConfig, RetryPolicy};
pub use error::{MedchainError, NetworkError, ProtocolError, Result, ValidationError};
pub use ledger::{Block, Blockchain};
pub use membership::{MembershipPolicy, MembershipRegistry};
pub use node::{BroadcastReport, Node, NodeBuilder};
pub use protocol::{Envelope, Message, MessageType};
pub use server::ReplicationServer;
pub use types::{JoinState, MedicalRecord, Record};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

/// Default port for Medchain nodes
pub const DEFAULT_PORT: u16 = 9000;

/// Largest envelope line accepted by default (a whole chain travels in one)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
