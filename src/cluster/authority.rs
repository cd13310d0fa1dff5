//! Token authority: issues IO tokens against the current mapping and layout.

use super::store::{ClusterStore, Tables};
use crate::auth::{IoToken, TokenSigner};
use crate::error::{FlexError, Result};
use crate::types::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Where a replica of a chunk can be reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaEndpoint {
    pub node_id: NodeId,
    /// Data-plane address of the node.
    pub address: String,
    pub available: bool,
    pub rebuilding: bool,
    pub latency_ms: f64,
}

/// A token plus the replica set it may be presented to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenGrant {
    pub token: IoToken,
    /// Target copy count of the chunk's pool.
    pub copies: usize,
    pub replicas: Vec<ReplicaEndpoint>,
}

/// What an initiator needs to split IO over a volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeLayout {
    pub volume_id: VolumeId,
    pub size: u64,
    pub provisioning: Provisioning,
    /// Chunk ids in offset order.
    pub chunk_ids: Vec<ChunkId>,
    pub access_mode: AccessMode,
}

/// Issues signed IO tokens.
pub struct TokenAuthority {
    store: Arc<ClusterStore>,
    signer: TokenSigner,
}

impl TokenAuthority {
    pub fn new(store: Arc<ClusterStore>, signer: TokenSigner) -> Self {
        Self { store, signer }
    }

    pub fn signer(&self) -> &TokenSigner {
        &self.signer
    }

    /// Issue a token for `client_id` to run `operation` on one chunk.
    pub fn issue_token(
        &self,
        client_id: ClientId,
        volume_id: VolumeId,
        chunk_id: ChunkId,
        operation: IoOperation,
    ) -> Result<TokenGrant> {
        let (copies, replicas, displaced) = self.store.read(|t| -> Result<_> {
            Self::check_mapping(t, client_id, volume_id, operation)?;
            let (copies, replicas) = Self::chunk_endpoints(t, volume_id, chunk_id)?;
            let displaced = !t.chunk(chunk_id)?.displaced.is_empty();
            Ok((copies, replicas, displaced))
        })?;
        let rebuilding = replicas.iter().any(|r| r.rebuilding);

        // Copies held by DOWN nodes miss this write and can no longer be fast-healed.
        if operation == IoOperation::Write && (displaced || rebuilding) {
            self.store.write(|t| {
                if let Ok(chunk) = t.chunk_mut(chunk_id) {
                    let missed = std::mem::take(&mut chunk.displaced);
                    for node_id in missed {
                        if !chunk.stale.contains(&node_id) {
                            chunk.stale.push(node_id);
                        }
                    }
                    if chunk.replicas.iter().any(|r| r.is_rebuilding) {
                        chunk.write_generation += 1;
                    }
                }
            });
        }

        let token = self.signer.sign(volume_id, chunk_id, client_id, operation)?;
        debug!(client_id, volume_id, chunk_id, op = %operation, "Token issued");
        metrics::counter!("flexblock_tokens_issued_total", "op" => operation.as_str())
            .increment(1);

        Ok(TokenGrant {
            token,
            copies,
            replicas,
        })
    }

    /// Token for the authority's own rebuild traffic. No mapping is needed.
    pub fn issue_internal(
        &self,
        volume_id: VolumeId,
        chunk_id: ChunkId,
        operation: IoOperation,
    ) -> Result<IoToken> {
        self.signer
            .sign(volume_id, chunk_id, REBUILD_CLIENT_ID, operation)
    }

    /// Layout of a volume as seen by a mapped client.
    pub fn volume_layout(&self, client_id: ClientId, volume_id: VolumeId) -> Result<VolumeLayout> {
        self.store.read(|t| {
            let mapping = t.mappings.get(&(volume_id, client_id)).ok_or_else(|| {
                FlexError::AccessDenied(format!(
                    "client {} has no mapping for volume {}",
                    client_id, volume_id
                ))
            })?;
            let volume = t.volume(volume_id)?;
            Ok(VolumeLayout {
                volume_id,
                size: volume.size,
                provisioning: volume.provisioning,
                chunk_ids: volume.chunks.clone(),
                access_mode: mapping.access_mode,
            })
        })
    }

    fn check_mapping(
        t: &Tables,
        client_id: ClientId,
        volume_id: VolumeId,
        operation: IoOperation,
    ) -> Result<()> {
        let mapping = t.mappings.get(&(volume_id, client_id)).ok_or_else(|| {
            FlexError::AccessDenied(format!(
                "client {} has no mapping for volume {}",
                client_id, volume_id
            ))
        })?;
        if !mapping.access_mode.permits(operation) {
            return Err(FlexError::AccessDenied(format!(
                "client {} mapped {:?} on volume {}, cannot {}",
                client_id, mapping.access_mode, volume_id, operation
            )));
        }
        Ok(())
    }

    fn chunk_endpoints(
        t: &Tables,
        volume_id: VolumeId,
        chunk_id: ChunkId,
    ) -> Result<(usize, Vec<ReplicaEndpoint>)> {
        let volume = t.volume(volume_id)?;
        if volume.state == VolumeState::Deleting {
            return Err(FlexError::VolumeUnavailable(format!(
                "volume {} is being deleted",
                volume_id
            )));
        }
        let chunk = t.chunk(chunk_id)?;
        if chunk.volume_id != volume_id {
            return Err(FlexError::InvalidArgument(format!(
                "chunk {} does not belong to volume {}",
                chunk_id, volume_id
            )));
        }
        if chunk.available_count() == 0 {
            return Err(FlexError::VolumeUnavailable(format!(
                "chunk {} of volume {} has no available replica",
                chunk_id, volume_id
            )));
        }
        let copies = t.pool(chunk.pool_id)?.copies;

        let replicas = chunk
            .replicas
            .iter()
            .filter_map(|r| {
                t.nodes.get(&r.node_id).map(|n| ReplicaEndpoint {
                    node_id: r.node_id,
                    address: n.address.clone(),
                    available: r.is_available,
                    rebuilding: r.is_rebuilding,
                    latency_ms: r.average_latency_ms,
                })
            })
            .collect();

        Ok((copies, replicas))
    }
}
