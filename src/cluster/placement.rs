//! Placement engine for distributing chunk replicas across storage nodes.
//!
//! Candidates for a replica slot are the pool's UP nodes with room for a
//! chunk that do not already hold a copy. They are ranked by fault-set
//! diversity against the copies chosen so far (soft), then by free capacity,
//! then by id so that placement is deterministic.

use super::store::Tables;
use crate::error::{FlexError, Result};
use crate::types::*;
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Placement engine for deciding where chunk replicas live.
#[derive(Debug, Clone, Default)]
pub struct PlacementEngine;

impl PlacementEngine {
    pub fn new() -> Self {
        Self
    }

    /// Choose `count` distinct nodes of `pool_id`.
    ///
    /// `already` are nodes holding (or just chosen for) the same chunk; they
    /// are never chosen and their fault sets count against diversity.
    /// `free` overrides node free capacity for nodes selected earlier in the
    /// same allocation.
    pub fn choose_locations(
        &self,
        tables: &Tables,
        pool_id: PoolId,
        count: usize,
        already: &[NodeId],
        excluded: &HashSet<NodeId>,
        free: &HashMap<NodeId, u64>,
    ) -> Result<Vec<NodeId>> {
        let candidates: Vec<&StorageNode> = tables
            .pool_nodes(pool_id)
            .filter(|n| n.state == NodeState::Up)
            .filter(|n| !excluded.contains(&n.id) && !already.contains(&n.id))
            .filter(|n| Self::free_of(n, free) >= CHUNK_SIZE)
            .collect();

        if candidates.len() < count {
            return Err(FlexError::InsufficientCapacity(format!(
                "Not enough eligible nodes in pool {}: need {}, have {}",
                pool_id,
                count,
                candidates.len()
            )));
        }

        let mut used_sets: HashSet<&str> = already
            .iter()
            .filter_map(|id| tables.nodes.get(id))
            .filter_map(|n| n.fault_set.as_deref())
            .collect();

        let mut chosen: Vec<NodeId> = Vec::with_capacity(count);
        for _ in 0..count {
            let best = candidates
                .iter()
                .filter(|n| !chosen.contains(&n.id))
                .min_by_key(|n| {
                    let shares_set = n
                        .fault_set
                        .as_deref()
                        .map(|s| used_sets.contains(s))
                        .unwrap_or(false);
                    (shares_set, Reverse(Self::free_of(n, free)), n.id)
                })
                .ok_or_else(|| {
                    FlexError::InsufficientCapacity(format!(
                        "No eligible node left in pool {}",
                        pool_id
                    ))
                })?;
            if let Some(set) = best.fault_set.as_deref() {
                used_sets.insert(set);
            }
            chosen.push(best.id);
        }

        Ok(chosen)
    }

    fn free_of(node: &StorageNode, free: &HashMap<NodeId, u64>) -> u64 {
        free.get(&node.id)
            .copied()
            .unwrap_or_else(|| node.available_space())
    }

    /// Create chunk records `from_index..to_index` of a volume with a full
    /// set of replicas each. Nothing is written unless every chunk places.
    ///
    /// Charges node usage per replica and, for THICK volumes, the logical
    /// bytes of the new range to the pool. THIN volumes are charged later by
    /// [`reserve_on_write`](Self::reserve_on_write).
    pub fn allocate_chunks(
        &self,
        tables: &mut Tables,
        volume_id: VolumeId,
        from_index: u64,
        to_index: u64,
    ) -> Result<Vec<ChunkId>> {
        let volume = tables.volume(volume_id)?;
        let pool = tables.pool(volume.pool_id)?;
        let pool_id = pool.id;
        let copies = pool.copies;
        let provisioning = volume.provisioning;
        let size = volume.size;

        let thick_bytes: Vec<u64> = (from_index..to_index)
            .map(|index| Self::logical_chunk_bytes(size, index))
            .collect();

        if provisioning == Provisioning::Thick {
            let needed: u64 = thick_bytes.iter().sum();
            if needed > pool.allocatable() {
                return Err(FlexError::InsufficientCapacity(format!(
                    "Pool {} has {} bytes allocatable, volume {} needs {}",
                    pool_id,
                    pool.allocatable(),
                    volume_id,
                    needed
                )));
            }
        }

        // Plan on a working copy of free capacity.
        let mut free: HashMap<NodeId, u64> = HashMap::new();
        let mut plan: Vec<Vec<NodeId>> = Vec::with_capacity(thick_bytes.len());
        let none = HashSet::new();
        for _ in from_index..to_index {
            let nodes = self.choose_locations(tables, pool_id, copies, &[], &none, &free)?;
            for &node_id in &nodes {
                let current = match free.get(&node_id) {
                    Some(f) => *f,
                    None => tables.node(node_id)?.available_space(),
                };
                free.insert(node_id, current.saturating_sub(CHUNK_SIZE));
            }
            plan.push(nodes);
        }

        let mut created = Vec::with_capacity(plan.len());
        for ((index, nodes), bytes) in (from_index..to_index).zip(plan).zip(thick_bytes) {
            let chunk_id = tables.next_chunk_id();
            for &node_id in &nodes {
                tables.node_mut(node_id)?.used += CHUNK_SIZE;
            }
            let allocated_bytes = match provisioning {
                Provisioning::Thick => bytes,
                Provisioning::Thin => 0,
            };
            tables.chunks.insert(
                chunk_id,
                Chunk {
                    id: chunk_id,
                    volume_id,
                    pool_id,
                    index,
                    is_degraded: false,
                    allocated_bytes,
                    replicas: nodes.into_iter().map(Replica::available).collect(),
                    displaced: Vec::new(),
                    stale: Vec::new(),
                    write_generation: 0,
                },
            );
            created.push(chunk_id);
        }

        if provisioning == Provisioning::Thick {
            let charged: u64 = created
                .iter()
                .filter_map(|id| tables.chunks.get(id))
                .map(|c| c.allocated_bytes)
                .sum();
            tables.pool_mut(pool_id)?.used_capacity += charged;
            tables.volume_mut(volume_id)?.used_capacity += charged;
        }
        tables.volume_mut(volume_id)?.chunks.extend(created.iter().copied());

        debug!(
            volume_id,
            pool_id,
            chunks = created.len(),
            copies,
            "Chunks allocated"
        );
        metrics::counter!("flexblock_chunks_allocated_total").increment(created.len() as u64);

        Ok(created)
    }

    /// Logical bytes of chunk `index` in a volume of `size` bytes.
    pub fn logical_chunk_bytes(size: u64, index: u64) -> u64 {
        size.saturating_sub(index * CHUNK_SIZE).min(CHUNK_SIZE)
    }

    /// Grow a thin chunk's charged bytes to `bytes`. Returns the delta charged.
    pub fn reserve_on_write(
        &self,
        tables: &mut Tables,
        chunk_id: ChunkId,
        bytes: u64,
    ) -> Result<u64> {
        let chunk = tables.chunk(chunk_id)?;
        let volume = tables.volume(chunk.volume_id)?;
        let limit = Self::logical_chunk_bytes(volume.size, chunk.index);
        let target = bytes.min(limit);
        if target <= chunk.allocated_bytes {
            return Ok(0);
        }
        let delta = target - chunk.allocated_bytes;
        let pool_id = chunk.pool_id;
        let volume_id = chunk.volume_id;

        let pool = tables.pool(pool_id)?;
        if pool.used_capacity + delta > pool.total_capacity.saturating_sub(pool.reserved_capacity)
        {
            return Err(FlexError::PoolCapacityExceeded(format!(
                "Pool {} cannot take {} more bytes ({} of {} used)",
                pool_id, delta, pool.used_capacity, pool.total_capacity
            )));
        }

        tables.pool_mut(pool_id)?.used_capacity += delta;
        tables.volume_mut(volume_id)?.used_capacity += delta;
        tables.chunk_mut(chunk_id)?.allocated_bytes = target;
        Ok(delta)
    }

    /// Pick a node for a new copy of `chunk_id`.
    ///
    /// Nodes already holding a replica of the chunk and `excluded` nodes are
    /// never chosen.
    pub fn select_rebuild_target(
        &self,
        tables: &Tables,
        chunk_id: ChunkId,
        excluded: &HashSet<NodeId>,
    ) -> Result<NodeId> {
        let chunk = tables.chunk(chunk_id)?;
        let holders: Vec<NodeId> = chunk.replicas.iter().map(|r| r.node_id).collect();
        let nodes = self.choose_locations(
            tables,
            chunk.pool_id,
            1,
            &holders,
            excluded,
            &HashMap::new(),
        )?;
        nodes
            .into_iter()
            .next()
            .ok_or_else(|| FlexError::InsufficientCapacity("No rebuild target".into()))
    }

    /// Release every node and pool charge held by a chunk and drop it.
    pub fn release_chunk(&self, tables: &mut Tables, chunk_id: ChunkId) -> Result<()> {
        let chunk = match tables.chunks.remove(&chunk_id) {
            Some(c) => c,
            None => return Ok(()),
        };
        for replica in &chunk.replicas {
            if let Some(node) = tables.nodes.get_mut(&replica.node_id) {
                node.used = node.used.saturating_sub(CHUNK_SIZE);
            }
            if !replica.is_available {
                tables.settle_node(replica.node_id);
            }
        }
        if let Some(pool) = tables.pools.get_mut(&chunk.pool_id) {
            pool.used_capacity = pool.used_capacity.saturating_sub(chunk.allocated_bytes);
        }
        if let Some(volume) = tables.volumes.get_mut(&chunk.volume_id) {
            volume.used_capacity = volume.used_capacity.saturating_sub(chunk.allocated_bytes);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn tables_with(nodes: &[(NodeId, u64, Option<&str>)], total: u64) -> Tables {
        let mut tables = Tables::default();
        tables.pools.insert(
            1,
            Pool {
                id: 1,
                name: "p".into(),
                protection_domain_id: 1,
                total_capacity: total,
                used_capacity: 0,
                reserved_capacity: 0,
                copies: 2,
                health: PoolHealth::Ok,
                rebuild_state: RebuildState::Idle,
                rebuild_rate_limit_mbps: 100,
            },
        );
        for &(id, capacity, set) in nodes {
            tables.nodes.insert(
                id,
                StorageNode {
                    id,
                    name: format!("sds-{}", id),
                    pool_id: 1,
                    protection_domain_id: 1,
                    address: format!("127.0.0.1:{}", 7000 + id),
                    capacity,
                    used: 0,
                    state: NodeState::Up,
                    fault_set: set.map(String::from),
                    last_heartbeat: None,
                },
            );
        }
        tables
    }

    fn add_volume(tables: &mut Tables, size: u64, provisioning: Provisioning) -> VolumeId {
        let id = tables.next_volume_id();
        tables.volumes.insert(
            id,
            Volume {
                id,
                name: format!("vol-{}", id),
                pool_id: 1,
                size,
                provisioning,
                used_capacity: 0,
                state: VolumeState::Available,
                mapping_count: 0,
                chunks: vec![],
                created_at: Utc::now(),
            },
        );
        id
    }

    #[test]
    fn test_replicas_never_share_node() {
        let mut tables = tables_with(
            &[(1, 10 * GB, None), (2, 10 * GB, None), (3, 10 * GB, None)],
            10 * GB,
        );
        let vol = add_volume(&mut tables, 64 * MIB, Provisioning::Thin);
        let engine = PlacementEngine::new();

        let chunks = engine.allocate_chunks(&mut tables, vol, 0, 16).unwrap();
        assert_eq!(chunks.len(), 16);
        for id in chunks {
            let chunk = tables.chunk(id).unwrap();
            assert_eq!(chunk.replicas.len(), 2);
            assert_ne!(chunk.replicas[0].node_id, chunk.replicas[1].node_id);
        }
    }

    #[test]
    fn test_most_free_capacity_wins() {
        let mut tables =
            tables_with(&[(1, GB, None), (2, 5 * GB, None), (3, 3 * GB, None)], 10 * GB);
        let engine = PlacementEngine::new();
        let chosen = engine
            .choose_locations(&tables, 1, 2, &[], &HashSet::new(), &HashMap::new())
            .unwrap();
        assert_eq!(chosen, vec![2, 3]);

        tables.nodes.get_mut(&2).unwrap().state = NodeState::Down;
        let chosen = engine
            .choose_locations(&tables, 1, 2, &[], &HashSet::new(), &HashMap::new())
            .unwrap();
        assert_eq!(chosen, vec![3, 1]);
    }

    #[test]
    fn test_fault_set_is_preferred_then_relaxed() {
        let tables = tables_with(
            &[(1, 9 * GB, Some("rack-a")), (2, 8 * GB, Some("rack-a")), (3, GB, Some("rack-b"))],
            10 * GB,
        );
        let engine = PlacementEngine::new();

        let chosen = engine
            .choose_locations(&tables, 1, 2, &[], &HashSet::new(), &HashMap::new())
            .unwrap();
        assert_eq!(chosen, vec![1, 3]);

        // Three copies cannot all be diverse; the constraint relaxes.
        let chosen = engine
            .choose_locations(&tables, 1, 3, &[], &HashSet::new(), &HashMap::new())
            .unwrap();
        assert_eq!(chosen, vec![1, 3, 2]);
    }

    #[test]
    fn test_not_enough_nodes() {
        let mut tables = tables_with(&[(1, 10 * GB, None)], 10 * GB);
        let vol = add_volume(&mut tables, 8 * MIB, Provisioning::Thin);
        let engine = PlacementEngine::new();

        let err = engine.allocate_chunks(&mut tables, vol, 0, 2).unwrap_err();
        assert!(matches!(err, FlexError::InsufficientCapacity(_)));
        assert!(tables.chunks.is_empty());
        assert_eq!(tables.node(1).unwrap().used, 0);
    }

    #[test]
    fn test_thick_allocation_charges_pool() {
        let mut tables = tables_with(&[(1, 4 * GB, None), (2, 4 * GB, None)], 2 * GB);
        let engine = PlacementEngine::new();

        let a = add_volume(&mut tables, 800 * MB, Provisioning::Thick);
        let count = chunk_count(800 * MB);
        engine.allocate_chunks(&mut tables, a, 0, count).unwrap();
        assert_eq!(tables.pool(1).unwrap().used_capacity, 800 * MB);
        assert_eq!(tables.volume(a).unwrap().used_capacity, 800 * MB);

        let b = add_volume(&mut tables, 800 * MB, Provisioning::Thick);
        engine.allocate_chunks(&mut tables, b, 0, count).unwrap();

        let c = add_volume(&mut tables, 800 * MB, Provisioning::Thick);
        let err = engine.allocate_chunks(&mut tables, c, 0, count).unwrap_err();
        assert!(matches!(err, FlexError::InsufficientCapacity(_)));
        assert_eq!(tables.pool(1).unwrap().used_capacity, 1_600 * MB);
    }

    #[test]
    fn test_reserve_on_write() {
        let mut tables = tables_with(&[(1, 4 * GB, None), (2, 4 * GB, None)], 6 * MIB);
        let engine = PlacementEngine::new();
        let vol = add_volume(&mut tables, 8 * MIB, Provisioning::Thin);
        let chunks = engine.allocate_chunks(&mut tables, vol, 0, 2).unwrap();
        assert_eq!(tables.pool(1).unwrap().used_capacity, 0);

        assert_eq!(engine.reserve_on_write(&mut tables, chunks[0], MIB).unwrap(), MIB);
        assert_eq!(engine.reserve_on_write(&mut tables, chunks[0], MIB / 2).unwrap(), 0);
        assert_eq!(
            engine.reserve_on_write(&mut tables, chunks[0], 10 * MIB).unwrap(),
            3 * MIB
        );
        assert_eq!(tables.pool(1).unwrap().used_capacity, 4 * MIB);

        let err = engine
            .reserve_on_write(&mut tables, chunks[1], 3 * MIB)
            .unwrap_err();
        assert!(matches!(err, FlexError::PoolCapacityExceeded(_)));
        assert_eq!(tables.pool(1).unwrap().used_capacity, 4 * MIB);
    }

    #[test]
    fn test_select_rebuild_target_excludes_holders() {
        let mut tables =
            tables_with(&[(1, GB, None), (2, GB, None), (3, GB, None), (4, GB, None)], GB);
        let engine = PlacementEngine::new();
        let vol = add_volume(&mut tables, CHUNK_SIZE, Provisioning::Thin);
        let chunk_id = engine.allocate_chunks(&mut tables, vol, 0, 1).unwrap()[0];
        let holders: Vec<NodeId> = tables
            .chunk(chunk_id)
            .unwrap()
            .replicas
            .iter()
            .map(|r| r.node_id)
            .collect();

        let mut excluded = HashSet::new();
        let target = engine
            .select_rebuild_target(&tables, chunk_id, &excluded)
            .unwrap();
        assert!(!holders.contains(&target));

        excluded.insert(target);
        let second = engine
            .select_rebuild_target(&tables, chunk_id, &excluded)
            .unwrap();
        assert!(!holders.contains(&second));
        assert_ne!(second, target);

        excluded.insert(second);
        assert!(engine
            .select_rebuild_target(&tables, chunk_id, &excluded)
            .is_err());
    }

    #[test]
    fn test_release_chunk() {
        let mut tables = tables_with(&[(1, GB, None), (2, GB, None)], GB);
        let engine = PlacementEngine::new();
        let vol = add_volume(&mut tables, CHUNK_SIZE, Provisioning::Thick);
        let chunk_id = engine.allocate_chunks(&mut tables, vol, 0, 1).unwrap()[0];
        assert_eq!(tables.node(1).unwrap().used, CHUNK_SIZE);

        engine.release_chunk(&mut tables, chunk_id).unwrap();
        assert_eq!(tables.node(1).unwrap().used, 0);
        assert_eq!(tables.pool(1).unwrap().used_capacity, 0);
    }

    #[test]
    fn test_release_last_resync_chunk_brings_node_up() {
        let mut tables = tables_with(&[(1, GB, None), (2, GB, None)], GB);
        let engine = PlacementEngine::new();
        let vol = add_volume(&mut tables, CHUNK_SIZE, Provisioning::Thick);
        let chunk_id = engine.allocate_chunks(&mut tables, vol, 0, 1).unwrap()[0];
        tables.node_mut(2).unwrap().state = NodeState::Degraded;
        tables
            .chunk_mut(chunk_id)
            .unwrap()
            .replica_mut(2)
            .unwrap()
            .is_available = false;

        engine.release_chunk(&mut tables, chunk_id).unwrap();
        assert_eq!(tables.node(2).unwrap().state, NodeState::Up);
        assert_eq!(tables.node(2).unwrap().used, 0);
    }
}
