//! Metrics aggregation and the cluster snapshot query.
//!
//! Storage nodes acknowledge every IO. Acks are folded into per-node and
//! per-volume counters; each aggregation tick turns the counters into rates,
//! publishes gauges through the `metrics` facade, and stores a read-only
//! [`ClusterSnapshot`] that queries return until the next tick.

use super::store::Tables;
use crate::types::*;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;

/// Weight of the newest sample in a replica's latency average.
pub const LATENCY_EMA_ALPHA: f64 = 0.2;

/// Fold a latency sample into a moving average.
pub fn latency_ema(previous: f64, sample: f64) -> f64 {
    if previous <= 0.0 {
        return sample;
    }
    (1.0 - LATENCY_EMA_ALPHA) * previous + LATENCY_EMA_ALPHA * sample
}

/// IO rates over the last aggregation window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct IoStats {
    pub iops: f64,
    pub bandwidth_bps: f64,
    pub latency_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSnapshot {
    #[serde(flatten)]
    pub pool: Pool,
    pub used_capacity_gb: f64,
    pub total_capacity_gb: f64,
    pub volume_count: usize,
    pub degraded_chunks: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeSnapshot {
    pub id: VolumeId,
    pub name: String,
    pub pool_id: PoolId,
    pub size: u64,
    pub provisioning: Provisioning,
    pub used_capacity: u64,
    pub state: VolumeState,
    pub mapping_count: u32,
    pub chunk_count: usize,
    pub io: IoStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub name: String,
    pub pool_id: PoolId,
    pub state: NodeState,
    pub capacity: u64,
    pub used: u64,
    pub fault_set: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub replica_count: usize,
    pub io: IoStats,
}

/// Read-only view of cluster health and performance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    pub taken_at: Option<DateTime<Utc>>,
    pub pools: Vec<PoolSnapshot>,
    pub volumes: Vec<VolumeSnapshot>,
    pub nodes: Vec<NodeSnapshot>,
    pub rebuild_jobs: Vec<RebuildJob>,
}

impl ClusterSnapshot {
    pub fn pool(&self, id: PoolId) -> Option<&PoolSnapshot> {
        self.pools.iter().find(|p| p.pool.id == id)
    }

    pub fn node(&self, id: NodeId) -> Option<&NodeSnapshot> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn volume(&self, id: VolumeId) -> Option<&VolumeSnapshot> {
        self.volumes.iter().find(|v| v.id == id)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Counter {
    ops: u64,
    bytes: u64,
    latency_sum_ms: f64,
}

impl Counter {
    fn add(&mut self, ack: &IoAck) {
        self.ops += 1;
        self.bytes += ack.bytes;
        self.latency_sum_ms += ack.latency_ms;
    }

    fn rates(&self, window_secs: f64) -> IoStats {
        if window_secs <= 0.0 {
            return IoStats::default();
        }
        IoStats {
            iops: self.ops as f64 / window_secs,
            bandwidth_bps: self.bytes as f64 / window_secs,
            latency_ms: if self.ops == 0 {
                0.0
            } else {
                self.latency_sum_ms / self.ops as f64
            },
        }
    }
}

#[derive(Debug, Default)]
struct Window {
    nodes: HashMap<NodeId, Counter>,
    volumes: HashMap<VolumeId, Counter>,
}

/// Folds IO acks into periodic snapshots.
pub struct MetricsAggregator {
    window: Mutex<Window>,
    window_start: Mutex<Instant>,
    latest: RwLock<Arc<ClusterSnapshot>>,
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self {
            window: Mutex::new(Window::default()),
            window_start: Mutex::new(Instant::now()),
            latest: RwLock::new(Arc::new(ClusterSnapshot::default())),
        }
    }

    /// Count one acknowledged IO.
    pub fn record_ack(&self, ack: &IoAck) {
        {
            let mut window = self.window.lock();
            window.nodes.entry(ack.node_id).or_default().add(ack);
            window.volumes.entry(ack.volume_id).or_default().add(ack);
        }
        let op = ack.operation.as_str();
        metrics::counter!("flexblock_io_ops_total", "op" => op).increment(1);
        metrics::counter!("flexblock_io_bytes_total", "op" => op).increment(ack.bytes);
    }

    /// Close the current window and build a snapshot from `tables`.
    pub fn tick(&self, tables: &Tables) -> Arc<ClusterSnapshot> {
        let window = std::mem::take(&mut *self.window.lock());
        let elapsed = {
            let mut start = self.window_start.lock();
            let now = Instant::now();
            let elapsed = now.saturating_duration_since(*start).as_secs_f64();
            *start = now;
            elapsed
        };

        let mut degraded_per_pool: HashMap<PoolId, usize> = HashMap::new();
        let mut replicas_per_node: HashMap<NodeId, usize> = HashMap::new();
        for chunk in tables.chunks.values() {
            if chunk.is_degraded {
                *degraded_per_pool.entry(chunk.pool_id).or_default() += 1;
            }
            for replica in &chunk.replicas {
                *replicas_per_node.entry(replica.node_id).or_default() += 1;
            }
        }

        let pools: Vec<PoolSnapshot> = tables
            .pools
            .values()
            .map(|pool| PoolSnapshot {
                used_capacity_gb: pool.used_capacity_gb(),
                total_capacity_gb: pool.total_capacity_gb(),
                volume_count: tables.volumes.values().filter(|v| v.pool_id == pool.id).count(),
                degraded_chunks: degraded_per_pool.get(&pool.id).copied().unwrap_or(0),
                pool: pool.clone(),
            })
            .collect();

        let volumes = tables
            .volumes
            .values()
            .map(|v| VolumeSnapshot {
                id: v.id,
                name: v.name.clone(),
                pool_id: v.pool_id,
                size: v.size,
                provisioning: v.provisioning,
                used_capacity: v.used_capacity,
                state: v.state,
                mapping_count: v.mapping_count,
                chunk_count: v.chunks.len(),
                io: window
                    .volumes
                    .get(&v.id)
                    .map(|c| c.rates(elapsed))
                    .unwrap_or_default(),
            })
            .collect();

        let nodes: Vec<NodeSnapshot> = tables
            .nodes
            .values()
            .map(|n| NodeSnapshot {
                id: n.id,
                name: n.name.clone(),
                pool_id: n.pool_id,
                state: n.state,
                capacity: n.capacity,
                used: n.used,
                fault_set: n.fault_set.clone(),
                last_heartbeat: n.last_heartbeat,
                replica_count: replicas_per_node.get(&n.id).copied().unwrap_or(0),
                io: window
                    .nodes
                    .get(&n.id)
                    .map(|c| c.rates(elapsed))
                    .unwrap_or_default(),
            })
            .collect();

        for pool in &pools {
            let id = pool.pool.id.to_string();
            let health = match pool.pool.health {
                PoolHealth::Ok => 0.0,
                PoolHealth::Degraded => 1.0,
                PoolHealth::Failed => 2.0,
            };
            metrics::gauge!("flexblock_pool_health", "pool" => id.clone()).set(health);
            metrics::gauge!("flexblock_pool_used_bytes", "pool" => id.clone())
                .set(pool.pool.used_capacity as f64);
            metrics::gauge!("flexblock_pool_degraded_chunks", "pool" => id)
                .set(pool.degraded_chunks as f64);
        }
        for node in &nodes {
            let id = node.id.to_string();
            let up = if node.state == NodeState::Up { 1.0 } else { 0.0 };
            metrics::gauge!("flexblock_node_up", "node" => id.clone()).set(up);
            metrics::gauge!("flexblock_node_iops", "node" => id).set(node.io.iops);
        }

        let snapshot = Arc::new(ClusterSnapshot {
            taken_at: Some(Utc::now()),
            pools,
            volumes,
            nodes,
            rebuild_jobs: tables.jobs.values().cloned().collect(),
        });
        *self.latest.write() = Arc::clone(&snapshot);
        snapshot
    }

    /// Snapshot from the last tick.
    pub fn latest(&self) -> Arc<ClusterSnapshot> {
        Arc::clone(&self.latest.read())
    }
}
