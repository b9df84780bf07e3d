//! Medchain node implementation: owns the shared ledger state, runs the
//! replication server, and drives the join and broadcast client flows.

use crate::{
    config::NodeConfig,
    error::{MedchainError, NetworkError, Result, ValidationError},
    ledger::{Block, Blockchain},
    membership::MembershipRegistry,
    network::{validate_address, PeerClient},
    protocol::{Envelope, Message},
    server::ReplicationServer,
    types::{JoinState, MedicalRecord, Record},
};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What a completed sync reports back to the waiting join flow
pub(crate) type SyncOutcome = std::result::Result<usize, ValidationError>;

/// State shared between the replication server task and the application
/// flow. Every read-modify-write happens under a single lock, and no lock is
/// held across a network call.
pub struct SharedState<R: Record = MedicalRecord> {
    pub(crate) chain: RwLock<Blockchain<R>>,
    pub(crate) membership: RwLock<MembershipRegistry>,
    pub(crate) state: RwLock<JoinState>,
    /// Fired by the server when the SET_BLOCKS for a pending join lands
    pub(crate) sync_waiter: Mutex<Option<oneshot::Sender<SyncOutcome>>>,
    pub(crate) config: NodeConfig,
    pub(crate) client: PeerClient,
}

impl<R: Record> SharedState<R> {
    fn new(config: NodeConfig) -> Self {
        Self {
            chain: RwLock::new(Blockchain::new()),
            membership: RwLock::new(MembershipRegistry::new(config.local_address.clone())),
            state: RwLock::new(JoinState::Uninitialized),
            sync_waiter: Mutex::new(None),
            client: PeerClient::from_config(&config),
            config,
        }
    }

    /// Send every envelope, then account for per-peer outcomes in the
    /// membership registry
    pub(crate) async fn deliver(&self, deliveries: Vec<(String, Envelope)>) -> BroadcastReport {
        let results = self.client.send_all(deliveries).await;

        let mut report = BroadcastReport::default();
        let mut membership = self.membership.write().await;
        for (addr, result) in results {
            match result {
                Ok(()) => {
                    membership.record_success(&addr);
                    report.delivered.push(addr);
                },
                Err(e) => {
                    let failures = membership.record_failure(&addr);
                    warn!("Delivery to {} failed ({} in a row): {}", addr, failures, e);
                    report.failed.push((addr, e));
                },
            }
        }
        if let Some(threshold) = self.config.peer_failure_threshold {
            report.evicted = membership.evict_failing(threshold);
            for addr in &report.evicted {
                info!("Evicted unreachable peer {}", addr);
            }
        }
        report
    }
}

/// Per-peer outcome of a fan-out
#[derive(Debug, Default)]
pub struct BroadcastReport {
    pub delivered: Vec<String>,
    pub failed: Vec<(String, NetworkError)>,
    /// Peers removed because they crossed the failure threshold
    pub evicted: Vec<String>,
}

impl BroadcastReport {
    /// Every peer received the message
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failed_peers(&self) -> Vec<&str> {
        self.failed.iter().map(|(addr, _)| addr.as_str()).collect()
    }
}

struct ServerHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Main node structure for a Medchain network
pub struct Node<R: Record = MedicalRecord> {
    shared: Arc<SharedState<R>>,
    server: Option<ServerHandle>,
}

impl<R: Record> Node<R> {
    /// Create a node from a validated configuration; nothing is bound yet
    pub fn new(config: NodeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(SharedState::new(config)),
            server: None,
        })
    }

    /// Bind the listener and spawn the replication server.
    ///
    /// When the configured port is 0 the node advertises the port that was
    /// actually bound.
    pub async fn start(&mut self) -> Result<()> {
        if self.server.is_some() {
            return Ok(());
        }

        let config = &self.shared.config;
        let listener = ReplicationServer::<R>::bind(config.bind_address()).await?;
        let bound = listener.local_addr()?;

        let advertised = match config.local_address.rsplit_once(':') {
            Some((host, "0")) => format!("{}:{}", host, bound.port()),
            _ => config.local_address.clone(),
        };
        self.shared
            .membership
            .write()
            .await
            .set_local_address(advertised.clone());

        let (shutdown, shutdown_rx) = oneshot::channel();
        let server = ReplicationServer::new(Arc::clone(&self.shared));
        let task = tokio::spawn(server.run(listener, shutdown_rx));
        self.server = Some(ServerHandle { shutdown, task });

        info!("Node {} started (bound {})", advertised, bound);
        Ok(())
    }

    /// Stop the server and wait for its loop to exit
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(handle) = self.server.take() {
            let _ = handle.shutdown.send(());
            if let Err(e) = handle.task.await {
                warn!("Replication server task ended abnormally: {}", e);
            }
            info!("Node {} stopped", self.local_address().await);
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.server
            .as_ref()
            .map(|handle| !handle.task.is_finished())
            .unwrap_or(false)
    }

    /// Join a network through `bootstrap`, or start a new one with `None`.
    ///
    /// With a bootstrap node this sends NEW_HOST and NEW_BLOCK, then waits
    /// up to the configured join timeout for the SET_BLOCKS reply. On any
    /// failure the node is left `Uninitialized`.
    pub async fn join(&self, bootstrap: Option<&str>) -> Result<()> {
        if !self.is_running() {
            return Err(MedchainError::NotRunning);
        }

        let Some(bootstrap) = bootstrap else {
            self.set_state(JoinState::Ready).await;
            info!("No bootstrap node; starting a new network");
            return Ok(());
        };
        validate_address(bootstrap)?;

        let local = self.local_address().await;
        let (tx, rx) = oneshot::channel();
        *self.shared.sync_waiter.lock().await = Some(tx);
        self.set_state(JoinState::AwaitingMembership).await;

        let started = Instant::now();
        let result = self.request_sync(bootstrap, &local, rx).await;
        match result {
            Ok(len) => {
                self.set_state(JoinState::Ready).await;
                info!(
                    "Joined via {} in {:?}: {} blocks, {} peers",
                    bootstrap,
                    started.elapsed(),
                    len,
                    self.shared.membership.read().await.len()
                );
                Ok(())
            },
            Err(e) => {
                self.shared.sync_waiter.lock().await.take();
                self.set_state(JoinState::Uninitialized).await;
                warn!("Join via {} failed: {}", bootstrap, e);
                Err(e)
            },
        }
    }

    async fn request_sync(
        &self,
        bootstrap: &str,
        local: &str,
        synced: oneshot::Receiver<SyncOutcome>,
    ) -> Result<usize> {
        let client = &self.shared.client;
        let new_host = Message::<R>::NewHost {
            address: local.to_string(),
        }
        .to_envelope()?;
        client.send(bootstrap, &new_host).await?;

        let sync = Message::<R>::NewBlock {
            requester: local.to_string(),
        }
        .to_envelope()?;
        client.send(bootstrap, &sync).await?;

        let waited = self.shared.config.join_timeout();
        match tokio::time::timeout(waited, synced).await {
            Ok(Ok(outcome)) => Ok(outcome?),
            Ok(Err(_)) | Err(_) => Err(MedchainError::JoinTimeout {
                bootstrap: bootstrap.to_string(),
                waited,
            }),
        }
    }

    /// Append a record locally and push the new block to every peer.
    ///
    /// Refused with `NotReady` until the node has joined (or started a new
    /// network). Delivery failures do not undo the local append; they are
    /// reported per peer.
    pub async fn append_record(&self, record: R) -> Result<(Block<R>, BroadcastReport)> {
        let state = self.state().await;
        if state != JoinState::Ready {
            return Err(MedchainError::NotReady(state));
        }
        let block = {
            let mut chain = self.shared.chain.write().await;
            if chain.is_empty() {
                return Err(ValidationError::EmptyChain.into());
            }
            chain.append(record)
        };
        debug!("Appended block {} ({})", block.index, block.hash);
        let report = self.broadcast_block(&block).await?;
        Ok((block, report))
    }

    /// Send ADD_BLOCK with `block` to every known peer; no acknowledgement
    pub async fn broadcast_block(&self, block: &Block<R>) -> Result<BroadcastReport> {
        let envelope = Message::AddBlock {
            block: block.clone(),
        }
        .to_envelope()?;
        let peers = self.peers().await;
        let deliveries = peers
            .into_iter()
            .map(|peer| (peer, envelope.clone()))
            .collect();
        let report = self.shared.deliver(deliveries).await;
        info!(
            "Broadcast block {}: {} delivered, {} failed",
            block.index,
            report.delivered.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Snapshot of the whole chain, genesis included
    pub async fn chain(&self) -> Vec<Block<R>> {
        self.shared.chain.read().await.blocks().to_vec()
    }

    /// Records of every block after genesis
    pub async fn records(&self) -> Vec<R> {
        self.shared.chain.read().await.records().cloned().collect()
    }

    pub async fn chain_len(&self) -> usize {
        self.shared.chain.read().await.len()
    }

    pub async fn is_chain_valid(&self) -> bool {
        self.shared.chain.read().await.is_valid()
    }

    pub async fn first_invalid_index(&self) -> Option<u64> {
        self.shared.chain.read().await.first_invalid_index()
    }

    pub async fn peers(&self) -> Vec<String> {
        self.shared.membership.read().await.peers()
    }

    pub async fn local_address(&self) -> String {
        self.shared.membership.read().await.local_address().to_string()
    }

    pub async fn state(&self) -> JoinState {
        *self.shared.state.read().await
    }

    async fn set_state(&self, state: JoinState) {
        *self.shared.state.write().await = state;
    }

    pub fn config(&self) -> &NodeConfig {
        &self.shared.config
    }

    /// Shared state handle, e.g. to drive a [`ReplicationServer`] directly
    pub fn shared(&self) -> Arc<SharedState<R>> {
        Arc::clone(&self.shared)
    }
}

impl Node {
    /// Create a builder for a medical-record node
    pub fn builder() -> NodeBuilder {
        NodeBuilder::new()
    }
}

impl<R: Record> Drop for Node<R> {
    fn drop(&mut self) {
        if let Some(handle) = self.server.take() {
            let _ = handle.shutdown.send(());
        }
    }
}

/// Builder for Medchain nodes
#[derive(Debug, Clone, Default)]
pub struct NodeBuilder {
    config: NodeConfig,
}

impl NodeBuilder {
    /// Create a new node builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the node configuration
    pub fn with_config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the address advertised to peers
    pub fn local_address(mut self, address: impl Into<String>) -> Self {
        self.config.local_address = address.into();
        self
    }

    /// Bind a different address than the advertised one
    pub fn listen_address(mut self, address: impl Into<String>) -> Self {
        self.config.listen_address = Some(address.into());
        self
    }

    /// Set the bootstrap node
    pub fn bootstrap(mut self, address: impl Into<String>) -> Self {
        self.config.bootstrap = Some(address.into());
        self
    }

    pub fn chain_policy(mut self, policy: crate::config::ChainPolicy) -> Self {
        self.config.chain_policy = policy;
        self
    }

    pub fn membership_policy(mut self, policy: crate::membership::MembershipPolicy) -> Self {
        self.config.membership_policy = policy;
        self
    }

    pub fn retry(mut self, retry: crate::config::RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn join_timeout_ms(mut self, ms: u64) -> Self {
        self.config.join_timeout_ms = ms;
        self
    }

    pub fn connect_timeout_ms(mut self, ms: u64) -> Self {
        self.config.connect_timeout_ms = ms;
        self
    }

    pub fn read_timeout_ms(mut self, ms: u64) -> Self {
        self.config.read_timeout_ms = ms;
        self
    }

    pub fn peer_failure_threshold(mut self, threshold: u32) -> Self {
        self.config.peer_failure_threshold = Some(threshold);
        self
    }

    /// Build the node
    pub fn build(self) -> Result<Node> {
        Node::new(self.config)
    }

    /// Build a node carrying a custom record type
    pub fn build_for<R: Record>(self) -> Result<Node<R>> {
        Node::new(self.config)
    }
}
