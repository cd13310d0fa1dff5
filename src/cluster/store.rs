//! Authoritative topology store.
//!
//! One table per entity kind, relations by id. Every read and every mutation
//! goes through a closure holding the table lock, so a reader always sees an
//! internally consistent snapshot. Allocation, rebuild planning and replica
//! state changes for one pool additionally serialize on that pool's async
//! lock, which callers hold across their await points.

use crate::error::{FlexError, Result};
use crate::types::*;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;

/// Id counters per entity kind.
#[derive(Debug, Clone)]
struct IdCounters {
    domain: u64,
    pool: u64,
    node: u64,
    volume: u64,
    chunk: u64,
}

impl Default for IdCounters {
    fn default() -> Self {
        Self {
            domain: 1,
            pool: 1,
            node: 1,
            volume: 1,
            chunk: 1,
        }
    }
}

/// All authoritative records.
#[derive(Debug, Clone, Default)]
pub struct Tables {
    pub domains: BTreeMap<ProtectionDomainId, ProtectionDomain>,
    pub pools: BTreeMap<PoolId, Pool>,
    pub nodes: BTreeMap<NodeId, StorageNode>,
    pub clients: BTreeMap<ClientId, ClientNode>,
    pub volumes: BTreeMap<VolumeId, Volume>,
    pub chunks: BTreeMap<ChunkId, Chunk>,
    pub mappings: BTreeMap<(VolumeId, ClientId), VolumeMapping>,
    /// Latest rebuild job per pool.
    pub jobs: BTreeMap<PoolId, RebuildJob>,
    ids: IdCounters,
}

impl Tables {
    pub fn next_domain_id(&mut self) -> ProtectionDomainId {
        let id = self.ids.domain;
        self.ids.domain += 1;
        id
    }

    pub fn next_pool_id(&mut self) -> PoolId {
        let id = self.ids.pool;
        self.ids.pool += 1;
        id
    }

    /// Next free id shared by storage and client nodes.
    pub fn next_node_id(&mut self) -> NodeId {
        while self.nodes.contains_key(&self.ids.node) || self.clients.contains_key(&self.ids.node)
        {
            self.ids.node += 1;
        }
        let id = self.ids.node;
        self.ids.node += 1;
        id
    }

    pub fn next_volume_id(&mut self) -> VolumeId {
        let id = self.ids.volume;
        self.ids.volume += 1;
        id
    }

    pub fn next_chunk_id(&mut self) -> ChunkId {
        let id = self.ids.chunk;
        self.ids.chunk += 1;
        id
    }

    pub fn domain(&self, id: ProtectionDomainId) -> Result<&ProtectionDomain> {
        self.domains
            .get(&id)
            .ok_or_else(|| FlexError::NotFound(format!("protection domain {}", id)))
    }

    pub fn pool(&self, id: PoolId) -> Result<&Pool> {
        self.pools
            .get(&id)
            .ok_or_else(|| FlexError::NotFound(format!("pool {}", id)))
    }

    pub fn pool_mut(&mut self, id: PoolId) -> Result<&mut Pool> {
        self.pools
            .get_mut(&id)
            .ok_or_else(|| FlexError::NotFound(format!("pool {}", id)))
    }

    pub fn node(&self, id: NodeId) -> Result<&StorageNode> {
        self.nodes
            .get(&id)
            .ok_or_else(|| FlexError::NotFound(format!("storage node {}", id)))
    }

    pub fn node_mut(&mut self, id: NodeId) -> Result<&mut StorageNode> {
        self.nodes
            .get_mut(&id)
            .ok_or_else(|| FlexError::NotFound(format!("storage node {}", id)))
    }

    pub fn client(&self, id: ClientId) -> Result<&ClientNode> {
        self.clients
            .get(&id)
            .ok_or_else(|| FlexError::NotFound(format!("client node {}", id)))
    }

    pub fn volume(&self, id: VolumeId) -> Result<&Volume> {
        self.volumes
            .get(&id)
            .ok_or_else(|| FlexError::NotFound(format!("volume {}", id)))
    }

    pub fn volume_mut(&mut self, id: VolumeId) -> Result<&mut Volume> {
        self.volumes
            .get_mut(&id)
            .ok_or_else(|| FlexError::NotFound(format!("volume {}", id)))
    }

    pub fn chunk(&self, id: ChunkId) -> Result<&Chunk> {
        self.chunks
            .get(&id)
            .ok_or_else(|| FlexError::NotFound(format!("chunk {}", id)))
    }

    pub fn chunk_mut(&mut self, id: ChunkId) -> Result<&mut Chunk> {
        self.chunks
            .get_mut(&id)
            .ok_or_else(|| FlexError::NotFound(format!("chunk {}", id)))
    }

    /// Storage nodes serving a pool.
    pub fn pool_nodes(&self, pool_id: PoolId) -> impl Iterator<Item = &StorageNode> {
        self.nodes.values().filter(move |n| n.pool_id == pool_id)
    }

    /// Degraded chunk ids of a pool.
    pub fn degraded_chunk_ids(&self, pool_id: PoolId) -> Vec<ChunkId> {
        self.chunks
            .values()
            .filter(|c| c.pool_id == pool_id && c.is_degraded)
            .map(|c| c.id)
            .collect()
    }

    /// Chunk ids with a replica on `node_id`.
    pub fn node_chunk_ids(&self, node_id: NodeId) -> Vec<ChunkId> {
        self.chunks
            .values()
            .filter(|c| c.holds(node_id))
            .map(|c| c.id)
            .collect()
    }

    /// Replicas held by a node.
    pub fn node_replica_count(&self, node_id: NodeId) -> usize {
        self.chunks.values().filter(|c| c.holds(node_id)).count()
    }

    /// Pools in a protection domain.
    pub fn domain_pool_ids(&self, domain_id: ProtectionDomainId) -> Vec<PoolId> {
        self.pools
            .values()
            .filter(|p| p.protection_domain_id == domain_id)
            .map(|p| p.id)
            .collect()
    }

    /// Move a DEGRADED node back to UP once none of its replicas is catching up.
    /// Returns whether the node changed state.
    pub fn settle_node(&mut self, node_id: NodeId) -> bool {
        let behind = self.chunks.values().any(|c| {
            c.replica(node_id).is_some_and(|r| !r.is_available) || c.stale.contains(&node_id)
        });
        match self.nodes.get_mut(&node_id) {
            Some(node) if node.state == NodeState::Degraded && !behind => {
                node.state = NodeState::Up;
                true
            }
            _ => false,
        }
    }

    /// Derive pool health from its chunks.
    pub fn recompute_pool_health(&mut self, pool_id: PoolId) -> Option<PoolHealth> {
        let mut health = PoolHealth::Ok;
        for chunk in self.chunks.values().filter(|c| c.pool_id == pool_id) {
            if chunk.available_count() == 0 {
                health = PoolHealth::Failed;
                break;
            }
            if chunk.is_degraded {
                health = PoolHealth::Degraded;
            }
        }
        let pool = self.pools.get_mut(&pool_id)?;
        pool.health = health;
        Some(health)
    }

    /// Derive volume state from its chunks and mappings. Deleting is sticky.
    pub fn recompute_volume_state(&mut self, volume_id: VolumeId) -> Option<VolumeState> {
        let volume = self.volumes.get(&volume_id)?;
        if volume.state == VolumeState::Deleting {
            return Some(VolumeState::Deleting);
        }
        let degraded = volume
            .chunks
            .iter()
            .filter_map(|id| self.chunks.get(id))
            .any(|c| c.is_degraded);
        let state = if degraded {
            VolumeState::Degraded
        } else if volume.mapping_count > 0 {
            VolumeState::InUse
        } else {
            VolumeState::Available
        };
        if let Some(volume) = self.volumes.get_mut(&volume_id) {
            volume.state = state;
        }
        Some(state)
    }

    /// Recompute every volume of a pool.
    pub fn recompute_pool_volumes(&mut self, pool_id: PoolId) {
        let ids: Vec<VolumeId> = self
            .volumes
            .values()
            .filter(|v| v.pool_id == pool_id)
            .map(|v| v.id)
            .collect();
        for id in ids {
            self.recompute_volume_state(id);
        }
    }

    /// Sum of volume used capacity in a pool.
    pub fn pool_volume_usage(&self, pool_id: PoolId) -> u64 {
        self.volumes
            .values()
            .filter(|v| v.pool_id == pool_id)
            .map(|v| v.used_capacity)
            .sum()
    }
}

/// Shared, synchronized owner of [`Tables`].
#[derive(Debug, Default)]
pub struct ClusterStore {
    tables: RwLock<Tables>,
    pool_locks: Mutex<HashMap<PoolId, Arc<tokio::sync::Mutex<()>>>>,
}

impl ClusterStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Run `f` against a consistent view.
    pub fn read<R>(&self, f: impl FnOnce(&Tables) -> R) -> R {
        f(&self.tables.read())
    }

    /// Run `f` with exclusive access.
    pub fn write<R>(&self, f: impl FnOnce(&mut Tables) -> R) -> R {
        f(&mut self.tables.write())
    }

    /// Clone of every table.
    pub fn snapshot(&self) -> Tables {
        self.tables.read().clone()
    }

    /// Serialize with other allocation and rebuild work on `pool_id`.
    pub async fn lock_pool(&self, pool_id: PoolId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.pool_locks.lock();
            Arc::clone(locks.entry(pool_id).or_default())
        };
        lock.lock_owned().await
    }

    /// Forget a deleted pool's lock.
    pub fn drop_pool_lock(&self, pool_id: PoolId) {
        self.pool_locks.lock().remove(&pool_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn pool(id: PoolId) -> Pool {
        Pool {
            id,
            name: format!("pool-{}", id),
            protection_domain_id: 1,
            total_capacity: 10 * GB,
            used_capacity: 0,
            reserved_capacity: 0,
            copies: 2,
            health: PoolHealth::Ok,
            rebuild_state: RebuildState::Idle,
            rebuild_rate_limit_mbps: 100,
        }
    }

    fn chunk(id: ChunkId, volume_id: VolumeId, replicas: Vec<Replica>) -> Chunk {
        Chunk {
            id,
            volume_id,
            pool_id: 1,
            index: id - 1,
            is_degraded: false,
            allocated_bytes: 0,
            replicas,
            displaced: vec![],
            stale: vec![],
            write_generation: 0,
        }
    }

    fn volume(id: VolumeId, chunks: Vec<ChunkId>) -> Volume {
        Volume {
            id,
            name: format!("vol-{}", id),
            pool_id: 1,
            size: chunks.len() as u64 * CHUNK_SIZE,
            provisioning: Provisioning::Thin,
            used_capacity: 0,
            state: VolumeState::Available,
            mapping_count: 0,
            chunks,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_id_allocation() {
        let mut tables = Tables::default();
        assert_eq!(tables.next_pool_id(), 1);
        assert_eq!(tables.next_pool_id(), 2);
        assert_eq!(tables.next_chunk_id(), 1);
    }

    #[test]
    fn test_next_node_id_skips_taken() {
        let mut tables = Tables::default();
        tables.clients.insert(
            1,
            ClientNode {
                id: 1,
                name: "c".into(),
                last_heartbeat: None,
            },
        );
        assert_eq!(tables.next_node_id(), 2);
    }

    #[test]
    fn test_lookup_not_found() {
        let tables = Tables::default();
        assert!(matches!(tables.pool(9), Err(FlexError::NotFound(_))));
        assert!(matches!(tables.chunk(9), Err(FlexError::NotFound(_))));
    }

    #[test]
    fn test_pool_health_derivation() {
        let mut tables = Tables::default();
        tables.pools.insert(1, pool(1));
        tables
            .chunks
            .insert(1, chunk(1, 1, vec![Replica::available(1), Replica::available(2)]));
        tables.chunks.insert(2, chunk(2, 1, vec![Replica::available(2)]));

        assert_eq!(tables.recompute_pool_health(1), Some(PoolHealth::Ok));

        tables.chunks.get_mut(&2).unwrap().is_degraded = true;
        assert_eq!(tables.recompute_pool_health(1), Some(PoolHealth::Degraded));

        tables.chunks.get_mut(&2).unwrap().replicas[0].is_available = false;
        assert_eq!(tables.recompute_pool_health(1), Some(PoolHealth::Failed));
    }

    #[test]
    fn test_settle_node_waits_for_catch_up() {
        let mut tables = Tables::default();
        tables.nodes.insert(
            2,
            StorageNode {
                id: 2,
                name: "sds-2".into(),
                pool_id: 1,
                protection_domain_id: 1,
                address: "10.0.0.2:7072".into(),
                capacity: GB,
                used: CHUNK_SIZE,
                state: NodeState::Degraded,
                fault_set: None,
                last_heartbeat: None,
            },
        );
        let mut resync = Replica::available(2);
        resync.is_available = false;
        tables
            .chunks
            .insert(1, chunk(1, 1, vec![Replica::available(1), resync]));

        assert!(!tables.settle_node(2));
        assert_eq!(tables.nodes[&2].state, NodeState::Degraded);

        tables.chunks.get_mut(&1).unwrap().replicas[1].is_available = true;
        assert!(tables.settle_node(2));
        assert_eq!(tables.nodes[&2].state, NodeState::Up);
        assert!(!tables.settle_node(2));
    }

    #[test]
    fn test_volume_state_derivation() {
        let mut tables = Tables::default();
        tables.volumes.insert(1, volume(1, vec![1]));
        tables
            .chunks
            .insert(1, chunk(1, 1, vec![Replica::available(1), Replica::available(2)]));

        assert_eq!(tables.recompute_volume_state(1), Some(VolumeState::Available));

        tables.volumes.get_mut(&1).unwrap().mapping_count = 1;
        assert_eq!(tables.recompute_volume_state(1), Some(VolumeState::InUse));

        tables.chunks.get_mut(&1).unwrap().is_degraded = true;
        assert_eq!(tables.recompute_volume_state(1), Some(VolumeState::Degraded));

        tables.volumes.get_mut(&1).unwrap().state = VolumeState::Deleting;
        assert_eq!(tables.recompute_volume_state(1), Some(VolumeState::Deleting));
    }

    #[tokio::test]
    async fn test_pool_lock_serializes() {
        let store = ClusterStore::new();
        let guard = store.lock_pool(1).await;

        let store2 = Arc::clone(&store);
        let waiter = tokio::spawn(async move {
            let _g = store2.lock_pool(1).await;
        });

        // A different pool is not blocked.
        let _other = store.lock_pool(2).await;

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.await.unwrap();
    }
}
