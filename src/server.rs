//! Replication server: accepts one envelope per connection and applies it
//! to the node's chain and membership registry.

use crate::config::ChainPolicy;
use crate::error::{MedchainError, NetworkError, Result, ValidationError};
use crate::ledger::{check_candidate, Block};
use crate::network::{read_envelope, validate_address};
use crate::node::SharedState;
use crate::protocol::{Envelope, Message};
use crate::types::{JoinState, MedicalRecord, Record};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Dispatches inbound envelopes against a node's shared state
pub struct ReplicationServer<R: Record = MedicalRecord> {
    shared: Arc<SharedState<R>>,
}

impl<R: Record> ReplicationServer<R> {
    pub fn new(shared: Arc<SharedState<R>>) -> Self {
        Self { shared }
    }

    /// Bind the listening socket
    pub async fn bind(addr: &str) -> std::result::Result<TcpListener, NetworkError> {
        TcpListener::bind(addr)
            .await
            .map_err(|source| NetworkError::BindFailed {
                addr: addr.to_string(),
                source,
            })
    }

    /// Accept loop. Each connection is handled to completion before the next
    /// accept; the loop only ends when `shutdown` fires or its sender drops.
    pub async fn run(self, listener: TcpListener, mut shutdown: oneshot::Receiver<()>) {
        let local = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        info!("Replication server listening on {}", local);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Replication server on {} shutting down", local);
                    break;
                },
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.handle_connection(stream, peer.to_string()).await,
                    Err(e) => warn!("Failed to accept connection on {}: {}", local, e),
                },
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream, peer: String) {
        let config = &self.shared.config;
        let envelope =
            match read_envelope(stream, &peer, config.max_message_size, config.read_timeout()).await
            {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!("Dropping connection from {}: {}", peer, e);
                    return;
                },
            };

        let message_type = envelope.message_type;
        if let Err(e) = self.dispatch(&envelope).await {
            warn!("Failed to handle {} from {}: {}", message_type, peer, e);
        }
    }

    /// Decode and apply one envelope. On a decode error nothing is mutated.
    pub async fn dispatch(&self, envelope: &Envelope) -> Result<()> {
        let message = Message::<R>::from_envelope(envelope)?;
        debug!("Received {}", envelope.message_type);
        match message {
            Message::NewHost { address } => self.on_new_host(address).await,
            Message::AddHost { peers } => self.on_add_host(peers).await,
            Message::NewBlock { requester } => self.on_sync_request(requester).await,
            Message::SetBlocks { blocks } => self.on_set_blocks(blocks).await,
            Message::AddBlock { block } => self.on_add_block(block).await,
        }
    }

    /// Star-broadcast of a joiner: the joiner gets the full membership, every
    /// known peer gets a list with the joiner added, then the joiner is
    /// recorded locally.
    async fn on_new_host(&self, joiner: String) -> Result<()> {
        validate_address(&joiner)?;
        info!("NEW_HOST: {}", joiner);

        let deliveries = {
            let membership = self.shared.membership.read().await;
            let reply = Message::<R>::AddHost {
                peers: membership.snapshot_with_self(),
            }
            .to_envelope()?;

            let mut deliveries = vec![(joiner.clone(), reply)];
            for peer in membership.peers() {
                if peer == joiner {
                    continue;
                }
                let update = Message::<R>::AddHost {
                    peers: membership.snapshot_for(&peer, &joiner),
                }
                .to_envelope()?;
                deliveries.push((peer, update));
            }
            deliveries
        };

        self.shared.deliver(deliveries).await;
        self.shared.membership.write().await.add(&joiner);
        Ok(())
    }

    async fn on_add_host(&self, peers: Vec<String>) -> Result<()> {
        debug!("ADD_HOST: {:?}", peers);
        let policy = self.shared.config.membership_policy;
        {
            let mut membership = self.shared.membership.write().await;
            membership.apply_snapshot(&peers, policy);
            debug!("Peers now {:?}", membership.peers());
        }

        let mut state = self.shared.state.write().await;
        if *state == JoinState::AwaitingMembership {
            *state = JoinState::AwaitingChain;
        }
        Ok(())
    }

    async fn on_sync_request(&self, requester: String) -> Result<()> {
        validate_address(&requester)?;
        let blocks = self.shared.chain.read().await.blocks().to_vec();
        info!("Sending {} blocks to {}", blocks.len(), requester);
        let envelope = Message::SetBlocks { blocks }.to_envelope()?;
        self.shared
            .client
            .send(&requester, &envelope)
            .await
            .map_err(MedchainError::from)
    }

    /// Replace the chain. Only a SET_BLOCKS arriving once the membership
    /// snapshot is in (state `AwaitingChain`) completes a pending join; any
    /// earlier one is handled as unsolicited.
    async fn on_set_blocks(&self, blocks: Vec<Block<R>>) -> Result<()> {
        let waiter = {
            let state = self.shared.state.read().await;
            if *state == JoinState::AwaitingChain {
                self.shared.sync_waiter.lock().await.take()
            } else {
                None
            }
        };
        let solicited = waiter.is_some();

        let outcome = {
            let mut chain = self.shared.chain.write().await;
            let check = match self.shared.config.chain_policy {
                // Even a trusting node never gives up its genesis block
                ChainPolicy::Trusting if blocks.is_empty() => Err(ValidationError::EmptyChain),
                ChainPolicy::Trusting => Ok(()),
                ChainPolicy::Verified if solicited => check_candidate(&blocks),
                ChainPolicy::Verified => chain.should_replace_with(&blocks),
            };
            check.map(|()| {
                if let Some(index) = crate::ledger::first_invalid_index(&blocks) {
                    warn!("Received chain is invalid from index {}", index);
                }
                let len = blocks.len();
                chain.replace_all(blocks);
                len
            })
        };

        match &outcome {
            Ok(len) => info!("SET_BLOCKS: chain replaced, {} blocks", len),
            Err(e) => warn!("SET_BLOCKS rejected: {}", e),
        }
        let result = outcome.clone().map(|_| ()).map_err(MedchainError::from);
        if let Some(waiter) = waiter {
            let _ = waiter.send(outcome);
        }
        result
    }

    async fn on_add_block(&self, block: Block<R>) -> Result<()> {
        let index = block.index;
        let mut chain = self.shared.chain.write().await;
        match self.shared.config.chain_policy {
            ChainPolicy::Trusting => chain.push_unchecked(block),
            ChainPolicy::Verified => chain.try_append_block(block)?,
        }
        debug!("ADD_BLOCK: appended block {}, chain length {}", index, chain.len());
        Ok(())
    }
}
