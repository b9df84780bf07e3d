//! Node configuration, loadable from TOML

use crate::error::{MedchainError, Result};
use crate::membership::MembershipPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// How blocks and chains received from peers are applied
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainPolicy {
    /// Append ADD_BLOCK and overwrite on SET_BLOCKS exactly as received
    #[default]
    Trusting,
    /// Only append blocks that extend the tip; only take chains that are
    /// valid and win the fork choice
    Verified,
}

/// Bounded retry with exponential backoff for outbound calls
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per call, including the first
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 2_000,
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Backoff before retry number `attempt` (1-based), before jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Node configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Address advertised to peers and bound by the server. A port of 0
    /// binds an ephemeral port and advertises the one actually bound.
    pub local_address: String,

    /// Address to bind instead of `local_address`, e.g. `0.0.0.0:9000`
    pub listen_address: Option<String>,

    /// Existing member to join through; `None` starts a new network
    pub bootstrap: Option<String>,

    /// Limit on establishing an outbound connection
    pub connect_timeout_ms: u64,

    /// Limit on writing one envelope to a peer
    pub write_timeout_ms: u64,

    /// Limit on reading one inbound envelope
    pub read_timeout_ms: u64,

    /// How long Join waits for SET_BLOCKS
    pub join_timeout_ms: u64,

    pub retry: RetryPolicy,

    /// Longest accepted line, in bytes
    pub max_message_size: usize,

    pub chain_policy: ChainPolicy,

    pub membership_policy: MembershipPolicy,

    /// Evict a peer after this many consecutive failed deliveries
    pub peer_failure_threshold: Option<u32>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            local_address: format!("127.0.0.1:{}", crate::DEFAULT_PORT),
            listen_address: None,
            bootstrap: None,
            connect_timeout_ms: 3_000,
            write_timeout_ms: 3_000,
            read_timeout_ms: 5_000,
            join_timeout_ms: 10_000,
            retry: RetryPolicy::default(),
            max_message_size: crate::DEFAULT_MAX_MESSAGE_SIZE,
            chain_policy: ChainPolicy::default(),
            membership_policy: MembershipPolicy::default(),
            peer_failure_threshold: None,
        }
    }
}

impl NodeConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: NodeConfig =
            toml::from_str(s).map_err(|e| MedchainError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            MedchainError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        crate::network::validate_address(&self.local_address)
            .map_err(|e| MedchainError::config(e.to_string()))?;
        if let Some(listen) = &self.listen_address {
            crate::network::validate_address(listen)
                .map_err(|e| MedchainError::config(e.to_string()))?;
        }
        if let Some(bootstrap) = &self.bootstrap {
            crate::network::validate_address(bootstrap)
                .map_err(|e| MedchainError::config(e.to_string()))?;
        }
        if self.retry.max_attempts == 0 {
            return Err(MedchainError::config("retry.max_attempts must be at least 1"));
        }
        if self.max_message_size == 0 {
            return Err(MedchainError::config("max_message_size must be positive"));
        }
        if self.peer_failure_threshold == Some(0) {
            return Err(MedchainError::config("peer_failure_threshold must be at least 1"));
        }
        Ok(())
    }

    /// Address the server binds
    pub fn bind_address(&self) -> &str {
        self.listen_address.as_deref().unwrap_or(&self.local_address)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}
