//! Core type definitions for flexblock.
//!
//! This module contains the records owned by the metadata authority
//! (protection domains, pools, storage nodes, client nodes, volumes, chunks
//! and their replicas) together with the identifiers and constants shared by
//! every process role.
//!
//! # Type Aliases
//!
//! Identifiers are plain `u64` aliases. Relations between records are always
//! expressed by id and resolved through the owning store, never by pointer.
//!
//! # Capacity units
//!
//! Capacities are tracked in bytes. Pool and node sizes are usually quoted in
//! decimal units ([`GB`], [`MB`]); chunks are a fixed binary [`CHUNK_SIZE`].
//!
//! ```rust
//! use flexblock::types::{chunk_count, CHUNK_SIZE, MIB};
//!
//! assert_eq!(chunk_count(512 * MIB), 128);
//! assert_eq!(chunk_count(CHUNK_SIZE + 1), 2);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Protection domain identifier.
pub type ProtectionDomainId = u64;

/// Storage pool identifier.
pub type PoolId = u64;

/// Identifier of any registered node (storage or client).
pub type NodeId = u64;

/// Client node identifier.
pub type ClientId = u64;

/// Volume identifier.
pub type VolumeId = u64;

/// Chunk identifier, unique across the cluster.
pub type ChunkId = u64;

/// Wire request identifier.
pub type RequestId = u64;

/// One kibibyte.
pub const KIB: u64 = 1024;
/// One mebibyte.
pub const MIB: u64 = 1024 * KIB;
/// One decimal megabyte.
pub const MB: u64 = 1_000_000;
/// One decimal gigabyte.
pub const GB: u64 = 1_000_000_000;

/// Fixed size of a chunk.
pub const CHUNK_SIZE: u64 = 4 * MIB;

/// Default number of copies kept for every chunk.
pub const DEFAULT_COPIES: usize = 2;

/// Lifetime of an IO token. Not negotiable per request.
pub const TOKEN_TTL: Duration = Duration::from_secs(60);

/// Client id used by the authority for its own rebuild traffic.
pub const REBUILD_CLIENT_ID: ClientId = 0;

/// Number of chunks needed to back `size` bytes.
pub fn chunk_count(size: u64) -> u64 {
    size.div_ceil(CHUNK_SIZE)
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// Pool health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PoolHealth {
    Ok,
    Degraded,
    Failed,
}

/// Pool-level rebuild state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RebuildState {
    Idle,
    InProgress,
    Completed,
}

/// Storage node state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    Up,
    Down,
    Degraded,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Up => "UP",
            NodeState::Down => "DOWN",
            NodeState::Degraded => "DEGRADED",
        }
    }
}

/// Volume provisioning policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Provisioning {
    Thin,
    Thick,
}

/// Volume state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VolumeState {
    Available,
    InUse,
    Degraded,
    Deleting,
}

/// Access granted by a volume mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

impl AccessMode {
    /// Whether this mode allows `op`.
    pub fn permits(&self, op: IoOperation) -> bool {
        match op {
            IoOperation::Read => true,
            IoOperation::Write => matches!(self, AccessMode::ReadWrite),
        }
    }
}

/// Operation carried by an IO token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IoOperation {
    Read,
    Write,
}

impl IoOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            IoOperation::Read => "READ",
            IoOperation::Write => "WRITE",
        }
    }
}

impl std::fmt::Display for IoOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capabilities a node advertises when it registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Capability {
    Sds,
    Sdc,
    MdmEligible,
}

/// Administrative grouping of pools and storage nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectionDomain {
    pub id: ProtectionDomainId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Capacity container backed by storage nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pool {
    pub id: PoolId,
    pub name: String,
    pub protection_domain_id: ProtectionDomainId,
    /// Logical capacity volumes may consume, in bytes.
    pub total_capacity: u64,
    /// Sum of the used capacity of the pool's volumes.
    pub used_capacity: u64,
    /// Capacity held back from allocation (spare for rebuild).
    pub reserved_capacity: u64,
    /// Copies kept for every chunk.
    pub copies: usize,
    pub health: PoolHealth,
    pub rebuild_state: RebuildState,
    /// Rebuild bandwidth ceiling in MiB/s.
    pub rebuild_rate_limit_mbps: u64,
}

impl Pool {
    /// Capacity still available for allocation.
    pub fn allocatable(&self) -> u64 {
        self.total_capacity
            .saturating_sub(self.reserved_capacity)
            .saturating_sub(self.used_capacity)
    }

    pub fn total_capacity_gb(&self) -> f64 {
        self.total_capacity as f64 / GB as f64
    }

    pub fn used_capacity_gb(&self) -> f64 {
        self.used_capacity as f64 / GB as f64
    }

    pub fn reserved_capacity_gb(&self) -> f64 {
        self.reserved_capacity as f64 / GB as f64
    }
}

/// A storage node (SDS) as seen by the authority.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageNode {
    pub id: NodeId,
    pub name: String,
    pub pool_id: PoolId,
    pub protection_domain_id: ProtectionDomainId,
    /// Data-plane address.
    pub address: String,
    pub capacity: u64,
    pub used: u64,
    pub state: NodeState,
    /// Failure domain tag, if any.
    pub fault_set: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl StorageNode {
    pub fn available_space(&self) -> u64 {
        self.capacity.saturating_sub(self.used)
    }

    pub fn usage_percent(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        (self.used as f64 / self.capacity as f64) * 100.0
    }
}

/// A client node (SDC).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientNode {
    pub id: ClientId,
    pub name: String,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// A block volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub id: VolumeId,
    pub name: String,
    pub pool_id: PoolId,
    pub size: u64,
    pub provisioning: Provisioning,
    /// Capacity charged to the pool for this volume.
    pub used_capacity: u64,
    pub state: VolumeState,
    pub mapping_count: u32,
    /// Chunks in offset order.
    pub chunks: Vec<ChunkId>,
    pub created_at: DateTime<Utc>,
}

/// One physical copy of a chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Replica {
    pub node_id: NodeId,
    pub is_available: bool,
    pub is_rebuilding: bool,
    pub average_latency_ms: f64,
}

impl Replica {
    pub fn available(node_id: NodeId) -> Self {
        Self {
            node_id,
            is_available: true,
            is_rebuilding: false,
            average_latency_ms: 0.0,
        }
    }

    pub fn rebuilding(node_id: NodeId) -> Self {
        Self {
            node_id,
            is_available: false,
            is_rebuilding: true,
            average_latency_ms: 0.0,
        }
    }
}

/// Fixed-size unit of a volume's address space.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub volume_id: VolumeId,
    pub pool_id: PoolId,
    /// Position within the volume; the chunk covers `index * CHUNK_SIZE..`.
    pub index: u64,
    pub is_degraded: bool,
    /// Bytes of this chunk charged to the pool (thin volumes grow this on write).
    pub allocated_bytes: u64,
    pub replicas: Vec<Replica>,
    /// Nodes that held an up-to-date replica when they went down.
    #[serde(default)]
    pub displaced: Vec<NodeId>,
    /// Down nodes whose local copy has since missed a write.
    #[serde(default)]
    pub stale: Vec<NodeId>,
    /// Bumped for every WRITE token issued while a copy is being rebuilt.
    #[serde(default)]
    pub write_generation: u64,
}

impl Chunk {
    pub fn offset(&self) -> u64 {
        self.index * CHUNK_SIZE
    }

    pub fn available_count(&self) -> usize {
        self.replicas.iter().filter(|r| r.is_available).count()
    }

    pub fn replica(&self, node_id: NodeId) -> Option<&Replica> {
        self.replicas.iter().find(|r| r.node_id == node_id)
    }

    pub fn replica_mut(&mut self, node_id: NodeId) -> Option<&mut Replica> {
        self.replicas.iter_mut().find(|r| r.node_id == node_id)
    }

    pub fn holds(&self, node_id: NodeId) -> bool {
        self.replicas.iter().any(|r| r.node_id == node_id)
    }
}

/// Grants a client IO eligibility on a volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeMapping {
    pub volume_id: VolumeId,
    pub client_id: ClientId,
    pub access_mode: AccessMode,
    pub mapped_at: DateTime<Utc>,
}

/// Rebuild job lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RebuildJobState {
    InProgress,
    Stalled,
    Completed,
    Cancelled,
    Failed,
}

impl RebuildJobState {
    pub fn is_active(&self) -> bool {
        matches!(self, RebuildJobState::InProgress | RebuildJobState::Stalled)
    }
}

/// Progress record of a pool's rebuild.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebuildJob {
    pub pool_id: PoolId,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub bytes_total: u64,
    pub bytes_done: u64,
    pub state: RebuildJobState,
    /// Copy rate measured over the last poll, bytes per second.
    pub current_rate: f64,
    pub eta_secs: Option<f64>,
}

impl RebuildJob {
    pub fn progress_percent(&self) -> f64 {
        if self.bytes_total == 0 {
            return 100.0;
        }
        (self.bytes_done as f64 / self.bytes_total as f64 * 100.0).min(100.0)
    }
}

/// Node registration advertised over the control channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    pub node_id: NodeId,
    pub name: String,
    pub capabilities: Vec<Capability>,
    /// Data-plane address for storage nodes.
    pub address: Option<String>,
    pub capacity: u64,
    pub pool_id: Option<PoolId>,
    pub fault_set: Option<String>,
}

impl Registration {
    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// Periodic liveness report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub node_id: NodeId,
    pub capabilities: Vec<Capability>,
    pub timestamp_ms: u64,
}

/// Per-IO acknowledgement from a storage node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoAck {
    pub node_id: NodeId,
    pub client_id: ClientId,
    pub volume_id: VolumeId,
    pub chunk_id: ChunkId,
    pub operation: IoOperation,
    pub bytes: u64,
    pub latency_ms: f64,
}

/// Outcome of bringing a storage node back, per chunk it used to hold.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// Replicas marked available again without copying.
    pub healed: Vec<ChunkId>,
    /// Replicas being rewritten in place by the rebuild.
    pub resync: Vec<ChunkId>,
    /// Replicas no longer needed; local data should be discarded.
    pub dropped: Vec<ChunkId>,
    /// Chunks with no available replica anywhere.
    pub lost: Vec<ChunkId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_count() {
        assert_eq!(chunk_count(0), 0);
        assert_eq!(chunk_count(1), 1);
        assert_eq!(chunk_count(CHUNK_SIZE), 1);
        assert_eq!(chunk_count(512 * MIB), 128);
        assert_eq!(chunk_count(800 * MB), 191);
    }

    #[test]
    fn test_access_mode_permits() {
        assert!(AccessMode::ReadOnly.permits(IoOperation::Read));
        assert!(!AccessMode::ReadOnly.permits(IoOperation::Write));
        assert!(AccessMode::ReadWrite.permits(IoOperation::Write));
    }

    #[test]
    fn test_pool_allocatable() {
        let pool = Pool {
            id: 1,
            name: "p".into(),
            protection_domain_id: 1,
            total_capacity: 2 * GB,
            used_capacity: GB,
            reserved_capacity: 200 * MB,
            copies: 2,
            health: PoolHealth::Ok,
            rebuild_state: RebuildState::Idle,
            rebuild_rate_limit_mbps: 100,
        };
        assert_eq!(pool.allocatable(), 800 * MB);
        assert!((pool.used_capacity_gb() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_progress_percent() {
        let mut job = RebuildJob {
            pool_id: 1,
            started_at: Utc::now(),
            finished_at: None,
            bytes_total: 4 * CHUNK_SIZE,
            bytes_done: CHUNK_SIZE,
            state: RebuildJobState::InProgress,
            current_rate: 0.0,
            eta_secs: None,
        };
        assert!((job.progress_percent() - 25.0).abs() < 1e-9);
        job.bytes_total = 0;
        assert_eq!(job.progress_percent(), 100.0);
    }

    #[test]
    fn test_serde_screaming_case() {
        let json = serde_json::to_string(&PoolHealth::Degraded).unwrap();
        assert_eq!(json, "\"DEGRADED\"");
        let op: IoOperation = serde_json::from_str("\"WRITE\"").unwrap();
        assert_eq!(op, IoOperation::Write);
    }
}
