//! Client initiator: turns volume IO into token-authorized chunk IO.
//!
//! A volume request is split on chunk boundaries. Each piece gets its own
//! token. Reads go to the lowest-latency available replica and fail over to
//! the others; writes fan out to every available replica concurrently and
//! complete once a majority acknowledges. Copies being rebuilt receive the
//! write as well, outside the quorum.

use super::transport::{AuthorityApi, DataPlane};
use crate::cluster::{ReplicaEndpoint, TokenGrant, VolumeLayout};
use crate::error::{FlexError, Result};
use crate::observability::record_client_io;
use crate::types::*;
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Initiator configuration.
#[derive(Debug, Clone)]
pub struct InitiatorConfig {
    /// Timeout for each replica request.
    pub io_timeout: Duration,
}

impl Default for InitiatorConfig {
    fn default() -> Self {
        Self {
            io_timeout: Duration::from_secs(2),
        }
    }
}

/// One chunk-aligned piece of a volume request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubIo {
    pub chunk_index: u64,
    /// Offset within the chunk.
    pub chunk_offset: u64,
    pub length: u64,
    /// Offset within the caller's buffer.
    pub buffer_offset: u64,
}

/// Split `offset..offset + length` on chunk boundaries.
pub fn split_range(offset: u64, length: u64) -> Vec<SubIo> {
    let mut pieces = Vec::new();
    let mut position = offset;
    let end = offset + length;
    while position < end {
        let chunk_index = position / CHUNK_SIZE;
        let chunk_offset = position % CHUNK_SIZE;
        let piece = (CHUNK_SIZE - chunk_offset).min(end - position);
        pieces.push(SubIo {
            chunk_index,
            chunk_offset,
            length: piece,
            buffer_offset: position - offset,
        });
        position += piece;
    }
    pieces
}

/// Writes needed for a chunk to count as written.
pub fn write_quorum(copies: usize) -> usize {
    copies.div_ceil(2).max(1)
}

/// Outcome of a volume IO.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IoResult {
    /// Data read. Empty for writes.
    pub data: Vec<u8>,
    pub bytes: u64,
    /// Chunks written with fewer than the pool's copies.
    pub degraded_chunks: Vec<ChunkId>,
}

enum SubOutcome {
    Read(Vec<u8>),
    Written { degraded: bool },
}

/// Per-client IO engine.
pub struct Initiator {
    client_id: ClientId,
    authority: Arc<dyn AuthorityApi>,
    data_plane: Arc<dyn DataPlane>,
    config: InitiatorConfig,
    layouts: RwLock<HashMap<VolumeId, VolumeLayout>>,
}

impl Initiator {
    pub fn new(
        client_id: ClientId,
        authority: Arc<dyn AuthorityApi>,
        data_plane: Arc<dyn DataPlane>,
        config: InitiatorConfig,
    ) -> Self {
        Self {
            client_id,
            authority,
            data_plane,
            config,
            layouts: RwLock::new(HashMap::new()),
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Drop the cached layout of a volume.
    pub fn invalidate(&self, volume_id: VolumeId) {
        self.layouts.write().remove(&volume_id);
    }

    async fn layout(&self, volume_id: VolumeId) -> Result<VolumeLayout> {
        if let Some(layout) = self.layouts.read().get(&volume_id) {
            return Ok(layout.clone());
        }
        let layout = self
            .authority
            .volume_layout(self.client_id, volume_id)
            .await?;
        self.layouts.write().insert(volume_id, layout.clone());
        Ok(layout)
    }

    pub async fn read(&self, volume_id: VolumeId, offset: u64, length: u64) -> Result<Vec<u8>> {
        let started = Instant::now();
        let result = self
            .execute_io(volume_id, offset, length, IoOperation::Read, None)
            .await;
        record_client_io(IoOperation::Read, started.elapsed(), result.is_ok());
        result.map(|r| r.data)
    }

    pub async fn write(&self, volume_id: VolumeId, offset: u64, data: &[u8]) -> Result<IoResult> {
        let started = Instant::now();
        let result = self
            .execute_io(
                volume_id,
                offset,
                data.len() as u64,
                IoOperation::Write,
                Some(data),
            )
            .await;
        record_client_io(IoOperation::Write, started.elapsed(), result.is_ok());
        result
    }

    /// Run one volume IO.
    pub async fn execute_io(
        &self,
        volume_id: VolumeId,
        offset: u64,
        length: u64,
        operation: IoOperation,
        data: Option<&[u8]>,
    ) -> Result<IoResult> {
        if operation == IoOperation::Write {
            let provided = data.map(|d| d.len() as u64);
            if provided != Some(length) {
                return Err(FlexError::InvalidArgument(format!(
                    "write of {} bytes given {:?} bytes of data",
                    length, provided
                )));
            }
        }
        if length == 0 {
            return Ok(IoResult::default());
        }

        let layout = self.layout(volume_id).await?;
        let end = offset.checked_add(length).unwrap_or(u64::MAX);
        if end > layout.size {
            self.invalidate(volume_id);
            return Err(FlexError::InvalidArgument(format!(
                "IO {}+{} beyond volume {} of {} bytes",
                offset, length, volume_id, layout.size
            )));
        }

        let pieces = split_range(offset, length);
        let mut plan = Vec::with_capacity(pieces.len());
        for piece in pieces {
            let chunk_id = layout
                .chunk_ids
                .get(piece.chunk_index as usize)
                .copied()
                .ok_or_else(|| {
                    FlexError::Internal(format!(
                        "volume {} layout has no chunk {}",
                        volume_id, piece.chunk_index
                    ))
                })?;
            plan.push((chunk_id, piece));
        }

        let results = join_all(plan.iter().map(|&(chunk_id, piece)| {
            let payload = data.map(|d| {
                let start = piece.buffer_offset as usize;
                &d[start..start + piece.length as usize]
            });
            self.sub_io(&layout, chunk_id, piece, operation, payload)
        }))
        .await;

        let mut result = IoResult {
            bytes: length,
            ..Default::default()
        };
        if operation == IoOperation::Read {
            result.data = vec![0u8; length as usize];
        }
        let mut quorum_failures = Vec::new();
        let mut first_error = None;

        for ((chunk_id, piece), outcome) in plan.iter().zip(results) {
            match outcome {
                Ok(SubOutcome::Read(bytes)) => {
                    let start = piece.buffer_offset as usize;
                    result.data[start..start + bytes.len()].copy_from_slice(&bytes);
                }
                Ok(SubOutcome::Written { degraded }) => {
                    if degraded {
                        result.degraded_chunks.push(*chunk_id);
                    }
                }
                Err(FlexError::PartialIoFailure(message)) => quorum_failures.push(message),
                Err(e) => {
                    if matches!(e, FlexError::NotFound(_) | FlexError::InvalidArgument(_)) {
                        self.invalidate(volume_id);
                    }
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        if !quorum_failures.is_empty() {
            return Err(FlexError::PartialIoFailure(format!(
                "volume {}: {}",
                volume_id,
                quorum_failures.join("; ")
            )));
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        Ok(result)
    }

    async fn sub_io(
        &self,
        layout: &VolumeLayout,
        chunk_id: ChunkId,
        piece: SubIo,
        operation: IoOperation,
        payload: Option<&[u8]>,
    ) -> Result<SubOutcome> {
        let grant = self
            .authority
            .issue_token(self.client_id, layout.volume_id, chunk_id, operation)
            .await?;

        match (operation, payload) {
            (IoOperation::Read, _) => self
                .read_chunk(chunk_id, piece, grant)
                .await
                .map(SubOutcome::Read),
            (IoOperation::Write, Some(payload)) => {
                if layout.provisioning == Provisioning::Thin {
                    self.authority
                        .reserve_on_write(chunk_id, piece.chunk_offset + piece.length)
                        .await?;
                }
                self.write_chunk(chunk_id, piece, grant, payload).await
            }
            (IoOperation::Write, None) => {
                Err(FlexError::InvalidArgument("write without data".into()))
            }
        }
    }

    /// Available replicas, fastest first.
    fn ranked(replicas: &[ReplicaEndpoint]) -> Vec<&ReplicaEndpoint> {
        let mut ranked: Vec<&ReplicaEndpoint> = replicas.iter().filter(|r| r.available).collect();
        ranked.sort_by(|a, b| {
            a.latency_ms
                .partial_cmp(&b.latency_ms)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.node_id.cmp(&b.node_id))
        });
        ranked
    }

    async fn read_chunk(
        &self,
        chunk_id: ChunkId,
        piece: SubIo,
        grant: TokenGrant,
    ) -> Result<Vec<u8>> {
        let candidates = Self::ranked(&grant.replicas);
        if candidates.is_empty() {
            return Err(FlexError::NoReplicaAvailable(format!(
                "chunk {} has no available replica",
                chunk_id
            )));
        }

        let mut last_error = String::new();
        for replica in &candidates {
            let read = self.data_plane.read(
                replica.node_id,
                &replica.address,
                grant.token.clone(),
                piece.chunk_offset,
                piece.length,
            );
            match tokio::time::timeout(self.config.io_timeout, read).await {
                Ok(Ok(data)) => return Ok(data),
                Ok(Err(e)) if e.allows_failover() => {
                    debug!(chunk_id, node_id = replica.node_id, error = %e, "Read failing over");
                    last_error = e.to_string();
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    warn!(chunk_id, node_id = replica.node_id, "Read timed out");
                    self.report_timeout(replica.node_id).await;
                    last_error = format!("node {} timed out", replica.node_id);
                }
            }
        }

        Err(FlexError::NoReplicaAvailable(format!(
            "chunk {}: all {} replicas failed, last error: {}",
            chunk_id,
            candidates.len(),
            last_error
        )))
    }

    async fn write_chunk(
        &self,
        chunk_id: ChunkId,
        piece: SubIo,
        grant: TokenGrant,
        payload: &[u8],
    ) -> Result<SubOutcome> {
        // Copies being rebuilt take the write too but never count toward quorum.
        let mut targets = Self::ranked(&grant.replicas);
        targets.extend(grant.replicas.iter().filter(|r| !r.available && r.rebuilding));
        let quorum = write_quorum(grant.copies);

        let writes = targets.iter().map(|replica| {
            let write = self.data_plane.write(
                replica.node_id,
                &replica.address,
                grant.token.clone(),
                piece.chunk_offset,
                payload.to_vec(),
            );
            async move {
                let outcome = tokio::time::timeout(self.config.io_timeout, write).await;
                (replica.node_id, replica.available, outcome)
            }
        });

        let mut acked = 0usize;
        let mut missed = Vec::new();
        for (node_id, counted, outcome) in join_all(writes).await {
            match outcome {
                Ok(Ok(())) => {
                    if counted {
                        acked += 1;
                    }
                }
                Ok(Err(e)) => {
                    debug!(chunk_id, node_id, error = %e, "Replica write failed");
                    missed.push(node_id);
                }
                Err(_) => {
                    warn!(chunk_id, node_id, "Replica write timed out");
                    self.report_timeout(node_id).await;
                    missed.push(node_id);
                }
            }
        }

        if acked > 0 && !missed.is_empty() {
            if let Err(e) = self
                .authority
                .report_degraded_write(chunk_id, missed.clone())
                .await
            {
                warn!(chunk_id, error = %e, "Failed to report degraded write");
            }
        }

        if acked < quorum {
            return Err(FlexError::PartialIoFailure(format!(
                "chunk {}: {} of {} required writes acknowledged",
                chunk_id, acked, quorum
            )));
        }
        Ok(SubOutcome::Written {
            degraded: acked < grant.copies,
        })
    }

    async fn report_timeout(&self, node_id: NodeId) {
        if let Err(e) = self.authority.report_io_timeout(node_id).await {
            debug!(node_id, error = %e, "Failed to report IO timeout");
        }
    }
}
