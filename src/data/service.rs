//! Storage node service.
//!
//! Serves token-authorized reads and writes against the local
//! [`ChunkStore`]. Tokens are verified locally with the shared secret; the
//! authority is only contacted for best-effort IO acknowledgements and
//! heartbeats.
//!
//! A node starts UP. A crash takes it DOWN, and on recovery it stays
//! DEGRADED until every chunk the authority asked it to resync has been
//! rewritten by the rebuild.

use super::chunk_store::ChunkStore;
use crate::auth::{IoToken, TokenSigner};
use crate::client::AuthorityApi;
use crate::error::{FlexError, Result};
use crate::types::*;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Acks buffered before new ones are dropped.
const ACK_QUEUE_DEPTH: usize = 4096;

/// Point-in-time view of a storage node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub state: NodeState,
    /// Chunks waiting for a resync.
    pub pending: usize,
    pub chunks: usize,
    pub usage_bytes: u64,
}

/// Local chunk service of one storage node.
pub struct StorageNodeService {
    node_id: NodeId,
    store: Arc<ChunkStore>,
    signer: TokenSigner,
    state: RwLock<NodeState>,
    pending: RwLock<HashSet<ChunkId>>,
    acks: Option<mpsc::Sender<IoAck>>,
}

impl StorageNodeService {
    pub fn new(node_id: NodeId, store: Arc<ChunkStore>, signer: TokenSigner) -> Self {
        Self {
            node_id,
            store,
            signer,
            state: RwLock::new(NodeState::Up),
            pending: RwLock::new(HashSet::new()),
            acks: None,
        }
    }

    /// Forward IO acknowledgements to the authority from a background task.
    pub fn with_acks(mut self, authority: Arc<dyn AuthorityApi>) -> Self {
        let (tx, mut rx) = mpsc::channel::<IoAck>(ACK_QUEUE_DEPTH);
        let node_id = self.node_id;
        tokio::spawn(async move {
            while let Some(ack) = rx.recv().await {
                if let Err(e) = authority.io_ack(ack).await {
                    debug!(node_id, error = %e, "IO ack not delivered");
                }
            }
        });
        self.acks = Some(tx);
        self
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn state(&self) -> NodeState {
        *self.state.read()
    }

    pub fn store(&self) -> &Arc<ChunkStore> {
        &self.store
    }

    pub fn is_pending(&self, chunk_id: ChunkId) -> bool {
        self.pending.read().contains(&chunk_id)
    }

    pub fn status(&self) -> Result<NodeStatus> {
        Ok(NodeStatus {
            node_id: self.node_id,
            state: self.state(),
            pending: self.pending.read().len(),
            chunks: self.store.list_chunks()?.len(),
            usage_bytes: self.store.usage()?,
        })
    }

    /// Stop serving, as if the process had crashed.
    pub fn fail(&self) {
        *self.state.write() = NodeState::Down;
        warn!(node_id = self.node_id, "Storage node stopped serving");
    }

    /// Resume serving. The node stays DEGRADED until catch-up completes.
    pub fn recover(&self) {
        *self.state.write() = NodeState::Degraded;
        info!(node_id = self.node_id, "Storage node recovering");
    }

    /// Apply the authority's verdict on the chunks this node used to hold.
    pub fn apply_recovery(&self, report: &RecoveryReport) -> Result<()> {
        for &chunk_id in &report.dropped {
            self.store.delete(chunk_id)?;
        }
        for &chunk_id in &report.lost {
            warn!(node_id = self.node_id, chunk_id, "Chunk reported lost");
        }
        {
            let mut pending = self.pending.write();
            for chunk_id in &report.healed {
                pending.remove(chunk_id);
            }
            pending.extend(report.resync.iter().copied());
        }
        info!(
            node_id = self.node_id,
            healed = report.healed.len(),
            resync = report.resync.len(),
            dropped = report.dropped.len(),
            lost = report.lost.len(),
            "Recovery report applied"
        );
        self.settle();
        Ok(())
    }

    /// DEGRADED -> UP once nothing is pending.
    fn settle(&self) {
        let empty = self.pending.read().is_empty();
        let mut state = self.state.write();
        if empty && *state == NodeState::Degraded {
            *state = NodeState::Up;
            info!(node_id = self.node_id, "Storage node caught up");
        }
    }

    fn authorize(&self, token: &IoToken, operation: IoOperation) -> Result<()> {
        if self.state() == NodeState::Down {
            return Err(FlexError::ReplicaUnavailable(format!(
                "storage node {} is down",
                self.node_id
            )));
        }
        self.signer.verify(token)?;
        if token.operation != operation {
            return Err(FlexError::TokenInvalid(format!(
                "token for {} presented for {}",
                token.operation, operation
            )));
        }
        Ok(())
    }

    /// Write bytes at `offset` within the token's chunk.
    pub fn handle_write(&self, token: &IoToken, offset: u64, data: &[u8]) -> Result<u64> {
        let started = Instant::now();
        self.authorize(token, IoOperation::Write)?;

        self.store.write_range(token.chunk_id, offset, data)?;
        let bytes = data.len() as u64;

        // The rebuild copies a chunk front to back; the last segment completes it.
        if token.client_id == REBUILD_CLIENT_ID && offset + bytes == CHUNK_SIZE {
            let cleared = self.pending.write().remove(&token.chunk_id);
            if cleared {
                debug!(node_id = self.node_id, chunk_id = token.chunk_id, "Chunk resynced");
                self.settle();
            }
        }

        self.acknowledge(token, bytes, started);
        Ok(bytes)
    }

    /// Read `length` bytes at `offset` within the token's chunk.
    pub fn handle_read(&self, token: &IoToken, offset: u64, length: u64) -> Result<Vec<u8>> {
        let started = Instant::now();
        self.authorize(token, IoOperation::Read)?;

        if self.is_pending(token.chunk_id) {
            return Err(FlexError::ReplicaUnavailable(format!(
                "chunk {} on node {} is awaiting resync",
                token.chunk_id, self.node_id
            )));
        }

        let data = self.store.read_range(token.chunk_id, offset, length)?;
        self.acknowledge(token, length, started);
        Ok(data)
    }

    /// Drop local copies of the chunks named by WRITE tokens.
    pub fn discard(&self, tokens: &[IoToken]) -> Result<usize> {
        let mut removed = 0;
        for token in tokens {
            self.authorize(token, IoOperation::Write)?;
            if self.store.delete(token.chunk_id)? {
                removed += 1;
            }
            self.pending.write().remove(&token.chunk_id);
        }
        self.settle();
        debug!(node_id = self.node_id, removed, "Chunks discarded");
        Ok(removed)
    }

    fn acknowledge(&self, token: &IoToken, bytes: u64, started: Instant) {
        if token.client_id == REBUILD_CLIENT_ID {
            return;
        }
        let Some(acks) = &self.acks else {
            return;
        };
        let ack = IoAck {
            node_id: self.node_id,
            client_id: token.client_id,
            volume_id: token.volume_id,
            chunk_id: token.chunk_id,
            operation: token.operation,
            bytes,
            latency_ms: started.elapsed().as_secs_f64() * 1000.0,
        };
        // Best effort: a lost ack never undoes the IO.
        if acks.try_send(ack).is_err() {
            metrics::counter!("flexblock_acks_dropped_total").increment(1);
        }
    }

    /// Register with the authority and apply any recovery verdict.
    pub async fn register(
        &self,
        authority: &dyn AuthorityApi,
        registration: Registration,
    ) -> Result<NodeId> {
        let (node_id, recovery) = authority.register(registration).await?;
        if let Some(report) = recovery {
            if self.state() == NodeState::Up && !report.resync.is_empty() {
                *self.state.write() = NodeState::Degraded;
            }
            self.apply_recovery(&report)?;
        }
        info!(node_id, "Registered with metadata manager");
        Ok(node_id)
    }

    /// Send heartbeats until shutdown.
    pub async fn run_heartbeat(
        self: Arc<Self>,
        authority: Arc<dyn AuthorityApi>,
        interval: Duration,
        mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
    ) {
        let mut interval = tokio::time::interval(interval);
        info!(node_id = self.node_id, "Heartbeat loop starting");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if self.state() == NodeState::Down {
                        continue;
                    }
                    let heartbeat = Heartbeat {
                        node_id: self.node_id,
                        capabilities: vec![Capability::Sds],
                        timestamp_ms: now_millis(),
                    };
                    match authority.heartbeat(heartbeat).await {
                        Ok(Some(report)) => {
                            if let Err(e) = self.apply_recovery(&report) {
                                warn!(
                                    node_id = self.node_id,
                                    error = %e,
                                    "Failed to apply recovery report"
                                );
                            }
                        }
                        Ok(None) => {}
                        Err(e) => warn!(node_id = self.node_id, error = %e, "Heartbeat failed"),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!(node_id = self.node_id, "Heartbeat loop shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SECRET: &str = "storage-node-test-secret-0123456789";

    fn service() -> (StorageNodeService, TokenSigner, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ChunkStore::new(dir.path(), 1024 * 1024).unwrap());
        let signer = TokenSigner::new(SECRET).unwrap();
        (StorageNodeService::new(1, store, signer.clone()), signer, dir)
    }

    #[test]
    fn test_write_then_read() {
        let (service, signer, _dir) = service();
        let write = signer.sign(1, 10, 50, IoOperation::Write).unwrap();
        let read = signer.sign(1, 10, 50, IoOperation::Read).unwrap();

        assert_eq!(service.handle_write(&write, 512, b"block").unwrap(), 5);
        assert_eq!(service.handle_read(&read, 512, 5).unwrap(), b"block");
    }

    #[test]
    fn test_operation_must_match_token() {
        let (service, signer, _dir) = service();
        let read = signer.sign(1, 10, 50, IoOperation::Read).unwrap();
        assert!(matches!(
            service.handle_write(&read, 0, b"x"),
            Err(FlexError::TokenInvalid(_))
        ));
    }

    #[test]
    fn test_foreign_signature_rejected() {
        let (service, _, _dir) = service();
        let other = TokenSigner::new("a-different-cluster-secret-value-xyz").unwrap();
        let token = other.sign(1, 10, 50, IoOperation::Read).unwrap();
        assert!(matches!(
            service.handle_read(&token, 0, 1),
            Err(FlexError::TokenInvalid(_))
        ));
    }

    #[test]
    fn test_down_node_rejects_io() {
        let (service, signer, _dir) = service();
        service.fail();
        let read = signer.sign(1, 10, 50, IoOperation::Read).unwrap();
        assert!(matches!(
            service.handle_read(&read, 0, 1),
            Err(FlexError::ReplicaUnavailable(_))
        ));
    }

    #[test]
    fn test_recovery_resync_cycle() {
        let (service, signer, _dir) = service();
        let write = signer.sign(1, 10, 50, IoOperation::Write).unwrap();
        service.handle_write(&write, 0, b"old").unwrap();
        let doomed = signer.sign(1, 11, 50, IoOperation::Write).unwrap();
        service.handle_write(&doomed, 0, b"gone").unwrap();

        service.fail();
        service.recover();
        service
            .apply_recovery(&RecoveryReport {
                healed: vec![],
                resync: vec![10],
                dropped: vec![11],
                lost: vec![],
            })
            .unwrap();

        assert_eq!(service.state(), NodeState::Degraded);
        assert!(!service.store().exists(11));

        let read = signer.sign(1, 10, 50, IoOperation::Read).unwrap();
        assert!(matches!(
            service.handle_read(&read, 0, 3),
            Err(FlexError::ReplicaUnavailable(_))
        ));

        // Rebuild rewrites the chunk up to its last byte.
        let rebuild = signer.sign(1, 10, REBUILD_CLIENT_ID, IoOperation::Write).unwrap();
        service
            .handle_write(&rebuild, 0, &vec![7u8; CHUNK_SIZE as usize])
            .unwrap();

        assert_eq!(service.state(), NodeState::Up);
        assert_eq!(service.handle_read(&read, 0, 3).unwrap(), vec![7u8; 3]);
    }

    #[test]
    fn test_recovery_without_resync_goes_up() {
        let (service, _, _dir) = service();
        service.fail();
        service.recover();
        service
            .apply_recovery(&RecoveryReport {
                healed: vec![1, 2],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(service.state(), NodeState::Up);
    }

    #[test]
    fn test_discard() {
        let (service, signer, _dir) = service();
        let write = signer.sign(1, 10, 50, IoOperation::Write).unwrap();
        service.handle_write(&write, 0, b"data").unwrap();

        let read = signer.sign(1, 10, 50, IoOperation::Read).unwrap();
        assert!(service.discard(&[read]).is_err());
        assert_eq!(service.discard(&[write]).unwrap(), 1);
        assert!(!service.store().exists(10));
    }
}
