//! Cluster management module for flexblock.
//!
//! This module holds the authoritative topology and everything that acts on
//! it inside the metadata manager:
//! - Topology store with per-pool serialization
//! - Placement engine for replica distribution
//! - Token authority
//! - Health tracking
//! - Rebuild orchestration
//! - Metrics aggregation

mod authority;
mod health;
mod metrics;
mod placement;
mod rebuild;
mod store;

pub use authority::{ReplicaEndpoint, TokenAuthority, TokenGrant, VolumeLayout};
pub use health::{HealthConfig, HealthMonitor, HealthStatus, HealthTracker};
pub use self::metrics::{
    latency_ema, ClusterSnapshot, IoStats, MetricsAggregator, NodeSnapshot, PoolSnapshot,
    VolumeSnapshot,
};
pub use placement::PlacementEngine;
pub use rebuild::{RebuildConfig, RebuildOrchestrator};
pub use store::{ClusterStore, Tables};
