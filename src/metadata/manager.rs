//! The metadata manager: resource lifecycle, node membership and the
//! authority API served to storage and client nodes.

use crate::auth::{IoToken, TokenSigner};
use crate::client::{AuthorityApi, DataPlane};
use crate::cluster::{
    latency_ema, ClusterSnapshot, ClusterStore, HealthConfig, HealthMonitor, HealthTracker,
    MetricsAggregator, PlacementEngine, RebuildConfig, RebuildOrchestrator, TokenAuthority,
    TokenGrant, VolumeLayout,
};
use crate::config::MdmConfig;
use crate::error::{FlexError, Result};
use crate::events::{Event, EventFilter, EventLog, EventType};
use crate::types::*;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const MAX_NAME_LENGTH: usize = 128;

/// Pool creation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePool {
    pub protection_domain_id: ProtectionDomainId,
    pub name: String,
    /// Logical capacity in bytes.
    pub total_capacity: u64,
    #[serde(default)]
    pub reserved_capacity: u64,
    /// Defaults to the manager's configured copy count.
    #[serde(default)]
    pub copies: Option<usize>,
    /// MiB/s; defaults to the configured rebuild rate.
    #[serde(default)]
    pub rebuild_rate_mbps: Option<u64>,
}

/// Volume creation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateVolume {
    pub pool_id: PoolId,
    pub name: String,
    pub size: u64,
    pub provisioning: Provisioning,
}

fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(FlexError::InvalidArgument(format!("{} name is empty", kind)));
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(FlexError::InvalidArgument(format!(
            "{} name longer than {} bytes",
            kind, MAX_NAME_LENGTH
        )));
    }
    Ok(())
}

enum Member {
    Storage(NodeState),
    Client,
}

/// Owns the cluster store and every control-plane component around it.
pub struct MetadataManager {
    store: Arc<ClusterStore>,
    placement: PlacementEngine,
    authority: Arc<TokenAuthority>,
    health: Arc<HealthTracker>,
    rebuild: Arc<RebuildOrchestrator>,
    metrics: Arc<MetricsAggregator>,
    events: Arc<EventLog>,
    data_plane: Arc<dyn DataPlane>,
    /// Recovery reports produced by an administrative recover, delivered
    /// with the node's next heartbeat.
    pending_reports: Mutex<HashMap<NodeId, RecoveryReport>>,
    default_copies: usize,
    default_rebuild_rate_mbps: u64,
    metrics_interval: Duration,
}

impl MetadataManager {
    pub fn new(
        config: &MdmConfig,
        signer: TokenSigner,
        data_plane: Arc<dyn DataPlane>,
    ) -> Arc<Self> {
        let store = ClusterStore::new();
        let events = EventLog::new(config.event_history);
        let authority = Arc::new(TokenAuthority::new(Arc::clone(&store), signer));
        let health = Arc::new(HealthTracker::new(HealthConfig {
            stale_after: config.heartbeat_stale_after,
            sweep_interval: config.sweep_interval,
            io_timeout_threshold: config.io_timeout_threshold,
        }));
        let rebuild = Arc::new(RebuildOrchestrator::new(
            Arc::clone(&store),
            Arc::clone(&authority),
            Arc::clone(&data_plane),
            Arc::clone(&events),
            RebuildConfig {
                poll_interval: config.rebuild_poll_interval,
                ..RebuildConfig::default()
            },
        ));

        Arc::new(Self {
            store,
            placement: PlacementEngine::new(),
            authority,
            health,
            rebuild,
            metrics: Arc::new(MetricsAggregator::new()),
            events,
            data_plane,
            pending_reports: Mutex::new(HashMap::new()),
            default_copies: config.default_copies,
            default_rebuild_rate_mbps: config.default_rebuild_rate_mbps,
            metrics_interval: config.metrics_interval,
        })
    }

    pub fn store(&self) -> &Arc<ClusterStore> {
        &self.store
    }

    pub fn authority(&self) -> &Arc<TokenAuthority> {
        &self.authority
    }

    pub fn health(&self) -> &Arc<HealthTracker> {
        &self.health
    }

    pub fn rebuild(&self) -> &Arc<RebuildOrchestrator> {
        &self.rebuild
    }

    pub fn events(&self) -> &Arc<EventLog> {
        &self.events
    }

    // Protection domains

    pub fn create_protection_domain(&self, name: &str) -> Result<ProtectionDomain> {
        validate_name("protection domain", name)?;
        let domain = self.store.write(|t| -> Result<_> {
            if t.domains.values().any(|d| d.name == name) {
                return Err(FlexError::AlreadyExists(format!(
                    "protection domain '{}'",
                    name
                )));
            }
            let domain = ProtectionDomain {
                id: t.next_domain_id(),
                name: name.to_string(),
                created_at: Utc::now(),
            };
            t.domains.insert(domain.id, domain.clone());
            Ok(domain)
        })?;
        info!(domain_id = domain.id, name, "Protection domain created");
        Ok(domain)
    }

    /// Delete an empty protection domain.
    pub fn delete_protection_domain(&self, domain_id: ProtectionDomainId) -> Result<()> {
        self.store.write(|t| -> Result<_> {
            t.domain(domain_id)?;
            let pools = t.domain_pool_ids(domain_id).len();
            if pools > 0 {
                return Err(FlexError::NotEmpty(format!(
                    "protection domain {} still has {} pools",
                    domain_id, pools
                )));
            }
            t.domains.remove(&domain_id);
            Ok(())
        })?;
        info!(domain_id, "Protection domain deleted");
        Ok(())
    }

    pub fn list_protection_domains(&self) -> Vec<ProtectionDomain> {
        self.store.read(|t| t.domains.values().cloned().collect())
    }

    // Pools

    pub fn create_pool(&self, request: CreatePool) -> Result<Pool> {
        validate_name("pool", &request.name)?;
        let copies = request.copies.unwrap_or(self.default_copies);
        let rate = request
            .rebuild_rate_mbps
            .unwrap_or(self.default_rebuild_rate_mbps);
        if copies == 0 {
            return Err(FlexError::InvalidArgument("pool needs at least one copy".into()));
        }
        if request.total_capacity == 0 {
            return Err(FlexError::InvalidArgument("pool capacity must be non-zero".into()));
        }
        if request.reserved_capacity > request.total_capacity {
            return Err(FlexError::InvalidArgument(
                "reserved capacity exceeds total capacity".into(),
            ));
        }
        if rate == 0 {
            return Err(FlexError::InvalidArgument("rebuild rate must be non-zero".into()));
        }

        let pool = self.store.write(|t| -> Result<_> {
            t.domain(request.protection_domain_id)?;
            let taken = t.pools.values().any(|p| {
                p.protection_domain_id == request.protection_domain_id && p.name == request.name
            });
            if taken {
                return Err(FlexError::AlreadyExists(format!("pool '{}'", request.name)));
            }
            let pool = Pool {
                id: t.next_pool_id(),
                name: request.name.clone(),
                protection_domain_id: request.protection_domain_id,
                total_capacity: request.total_capacity,
                used_capacity: 0,
                reserved_capacity: request.reserved_capacity,
                copies,
                health: PoolHealth::Ok,
                rebuild_state: RebuildState::Idle,
                rebuild_rate_limit_mbps: rate,
            };
            t.pools.insert(pool.id, pool.clone());
            Ok(pool)
        })?;

        info!(
            pool_id = pool.id,
            name = %pool.name,
            total = pool.total_capacity,
            copies,
            "Pool created"
        );
        self.events.publish(
            Event::new(EventType::PoolCreated, format!("pool '{}' created", pool.name))
                .with_pool(pool.id),
        );
        Ok(pool)
    }

    /// Delete a pool that owns no volumes and no storage nodes.
    pub async fn delete_pool(&self, pool_id: PoolId) -> Result<()> {
        self.store.read(|t| t.pool(pool_id).map(|_| ()))?;
        let guard = self.store.lock_pool(pool_id).await;
        self.store.write(|t| -> Result<_> {
            t.pool(pool_id)?;
            let volumes = t.volumes.values().filter(|v| v.pool_id == pool_id).count();
            let nodes = t.pool_nodes(pool_id).count();
            if volumes > 0 || nodes > 0 {
                return Err(FlexError::NotEmpty(format!(
                    "pool {} still owns {} volumes and {} nodes",
                    pool_id, volumes, nodes
                )));
            }
            t.pools.remove(&pool_id);
            t.jobs.remove(&pool_id);
            Ok(())
        })?;
        drop(guard);

        self.rebuild.forget_pool(pool_id);
        self.store.drop_pool_lock(pool_id);
        info!(pool_id, "Pool deleted");
        self.events
            .publish(Event::new(EventType::PoolDeleted, "pool deleted").with_pool(pool_id));
        Ok(())
    }

    pub fn get_pool(&self, pool_id: PoolId) -> Result<Pool> {
        self.store.read(|t| t.pool(pool_id).cloned())
    }

    pub fn list_pools(&self) -> Vec<Pool> {
        self.store.read(|t| t.pools.values().cloned().collect())
    }

    /// Change a pool's rebuild bandwidth, effective from the next round.
    pub fn set_rebuild_rate(&self, pool_id: PoolId, rate_mbps: u64) -> Result<()> {
        if rate_mbps == 0 {
            return Err(FlexError::InvalidArgument("rebuild rate must be non-zero".into()));
        }
        self.store.write(|t| -> Result<_> {
            t.pool_mut(pool_id)?.rebuild_rate_limit_mbps = rate_mbps;
            Ok(())
        })?;
        self.rebuild.set_rate(pool_id, rate_mbps);
        info!(pool_id, rate_mbps, "Rebuild rate changed");
        Ok(())
    }

    // Membership

    /// Register a storage or client node.
    ///
    /// A storage node coming back from DOWN is recovered and gets its
    /// recovery report in the reply.
    pub async fn register(
        &self,
        registration: Registration,
    ) -> Result<(NodeId, Option<RecoveryReport>)> {
        if registration.has(Capability::Sds) {
            self.register_storage_node(registration).await
        } else if registration.has(Capability::Sdc) {
            self.register_client(registration).map(|id| (id, None))
        } else {
            Err(FlexError::InvalidArgument(format!(
                "node {} advertises neither SDS nor SDC",
                registration.node_id
            )))
        }
    }

    async fn register_storage_node(
        &self,
        registration: Registration,
    ) -> Result<(NodeId, Option<RecoveryReport>)> {
        let address = registration.address.clone().ok_or_else(|| {
            FlexError::InvalidArgument("storage node registration needs a data address".into())
        })?;
        let pool_id = registration.pool_id.ok_or_else(|| {
            FlexError::InvalidArgument("storage node registration needs a pool".into())
        })?;
        if registration.capacity == 0 {
            return Err(FlexError::InvalidArgument(
                "storage node capacity must be non-zero".into(),
            ));
        }

        let known = self.store.read(|t| {
            t.nodes
                .get(&registration.node_id)
                .map(|n| (n.pool_id, n.state))
        });

        if let Some((current_pool, state)) = known {
            let node_id = registration.node_id;
            if current_pool != pool_id {
                return Err(FlexError::InvalidState(format!(
                    "storage node {} already serves pool {}",
                    node_id, current_pool
                )));
            }
            self.store.write(|t| -> Result<_> {
                let node = t.node_mut(node_id)?;
                node.address = address;
                node.last_heartbeat = Some(Utc::now());
                Ok(())
            })?;
            self.health.register(node_id);
            if state == NodeState::Down {
                let report = self.rebuild.on_node_recover(node_id).await?;
                self.pending_reports.lock().remove(&node_id);
                return Ok((node_id, Some(report)));
            }
            debug!(node_id, "Storage node re-registered");
            return Ok((node_id, self.pending_reports.lock().remove(&node_id)));
        }

        let node = self.store.write(|t| -> Result<_> {
            let domain_id = t.pool(pool_id)?.protection_domain_id;
            if t.clients.contains_key(&registration.node_id) {
                return Err(FlexError::AlreadyExists(format!(
                    "node id {} belongs to a client",
                    registration.node_id
                )));
            }
            let id = if registration.node_id == REBUILD_CLIENT_ID {
                t.next_node_id()
            } else {
                registration.node_id
            };
            let node = StorageNode {
                id,
                name: registration.name.clone(),
                pool_id,
                protection_domain_id: domain_id,
                address,
                capacity: registration.capacity,
                used: 0,
                state: NodeState::Up,
                fault_set: registration.fault_set.clone(),
                last_heartbeat: Some(Utc::now()),
            };
            t.nodes.insert(id, node.clone());
            Ok(node)
        })?;

        self.health.register(node.id);
        info!(
            node_id = node.id,
            pool_id,
            address = %node.address,
            capacity = node.capacity,
            "Storage node registered"
        );
        self.events.publish(
            Event::new(
                EventType::NodeRegistered,
                format!("storage node '{}' joined pool {}", node.name, pool_id),
            )
            .with_node(node.id)
            .with_pool(pool_id),
        );

        // New capacity may unblock chunks that had no eligible target.
        let degraded = self
            .store
            .read(|t| !t.degraded_chunk_ids(pool_id).is_empty());
        if degraded {
            self.rebuild.start_rebuild(pool_id).await?;
        }
        Ok((node.id, None))
    }

    fn register_client(&self, registration: Registration) -> Result<ClientId> {
        let id = self.store.write(|t| -> Result<_> {
            if t.nodes.contains_key(&registration.node_id) {
                return Err(FlexError::AlreadyExists(format!(
                    "node id {} belongs to a storage node",
                    registration.node_id
                )));
            }
            let id = if registration.node_id == REBUILD_CLIENT_ID {
                t.next_node_id()
            } else {
                registration.node_id
            };
            let client = t.clients.entry(id).or_insert_with(|| ClientNode {
                id,
                name: registration.name.clone(),
                last_heartbeat: None,
            });
            client.name = registration.name.clone();
            client.last_heartbeat = Some(Utc::now());
            Ok(id)
        })?;
        info!(client_id = id, name = %registration.name, "Client registered");
        Ok(id)
    }

    /// Record a heartbeat. A DOWN storage node that heartbeats is recovered.
    pub async fn heartbeat(&self, heartbeat: Heartbeat) -> Result<Option<RecoveryReport>> {
        let node_id = heartbeat.node_id;
        let member = self.store.read(|t| {
            if let Some(node) = t.nodes.get(&node_id) {
                Some(Member::Storage(node.state))
            } else if t.clients.contains_key(&node_id) {
                Some(Member::Client)
            } else {
                None
            }
        });

        match member {
            None => Err(FlexError::NotFound(format!("node {} is not registered", node_id))),
            Some(Member::Client) => {
                self.store.write(|t| {
                    if let Some(client) = t.clients.get_mut(&node_id) {
                        client.last_heartbeat = Some(Utc::now());
                    }
                });
                Ok(None)
            }
            Some(Member::Storage(state)) => {
                self.health.ingest(node_id);
                if state == NodeState::Down {
                    info!(node_id, "Heartbeat from DOWN storage node");
                    let report = self.rebuild.on_node_recover(node_id).await?;
                    self.pending_reports.lock().remove(&node_id);
                    return Ok(Some(report));
                }
                self.store.write(|t| -> Result<_> {
                    t.node_mut(node_id)
                        .map(|node| node.last_heartbeat = Some(Utc::now()))
                })?;
                Ok(self.pending_reports.lock().remove(&node_id))
            }
        }
    }

    /// Remove a storage node that no longer holds any replica.
    pub async fn remove_storage_node(&self, node_id: NodeId) -> Result<()> {
        let pool_id = self.store.read(|t| t.node(node_id).map(|n| n.pool_id))?;
        let guard = self.store.lock_pool(pool_id).await;
        self.store.write(|t| -> Result<_> {
            t.node(node_id)?;
            let replicas = t.node_replica_count(node_id);
            if replicas > 0 {
                return Err(FlexError::NotEmpty(format!(
                    "storage node {} still holds {} replicas",
                    node_id, replicas
                )));
            }
            t.nodes.remove(&node_id);
            for chunk in t.chunks.values_mut() {
                chunk.displaced.retain(|&n| n != node_id);
                chunk.stale.retain(|&n| n != node_id);
            }
            Ok(())
        })?;
        drop(guard);

        self.health.unregister(node_id);
        self.pending_reports.lock().remove(&node_id);
        info!(node_id, pool_id, "Storage node removed");
        self.events.publish(
            Event::new(EventType::NodeRemoved, "storage node removed")
                .with_node(node_id)
                .with_pool(pool_id),
        );
        Ok(())
    }

    pub fn list_storage_nodes(&self) -> Vec<StorageNode> {
        self.store.read(|t| t.nodes.values().cloned().collect())
    }

    pub fn get_storage_node(&self, node_id: NodeId) -> Result<StorageNode> {
        self.store.read(|t| t.node(node_id).cloned())
    }

    pub fn list_clients(&self) -> Vec<ClientNode> {
        self.store.read(|t| t.clients.values().cloned().collect())
    }

    /// Declare a storage node failed and start rebuilding its chunks.
    pub async fn fail_node(&self, node_id: NodeId) -> Result<bool> {
        self.pending_reports.lock().remove(&node_id);
        self.rebuild.on_node_failure(node_id).await
    }

    /// Bring a storage node back without waiting for it to heartbeat.
    ///
    /// The report is also queued for the node's next heartbeat so it can
    /// discard what it no longer needs.
    pub async fn recover_node(&self, node_id: NodeId) -> Result<RecoveryReport> {
        self.store.read(|t| t.node(node_id).map(|_| ()))?;
        let report = self.rebuild.on_node_recover(node_id).await?;
        self.health.register(node_id);
        if report != RecoveryReport::default() {
            self.pending_reports.lock().insert(node_id, report.clone());
        }
        Ok(report)
    }

    // Volumes

    /// Create a volume and allocate every chunk it needs.
    pub async fn create_volume(&self, request: CreateVolume) -> Result<Volume> {
        validate_name("volume", &request.name)?;
        if request.size == 0 {
            return Err(FlexError::InvalidArgument("volume size must be non-zero".into()));
        }
        let pool_id = request.pool_id;
        self.store.read(|t| t.pool(pool_id).map(|_| ()))?;

        let _guard = self.store.lock_pool(pool_id).await;
        let volume = self.store.write(|t| -> Result<_> {
            t.pool(pool_id)?;
            let taken = t
                .volumes
                .values()
                .any(|v| v.pool_id == pool_id && v.name == request.name);
            if taken {
                return Err(FlexError::AlreadyExists(format!("volume '{}'", request.name)));
            }
            let id = t.next_volume_id();
            t.volumes.insert(
                id,
                Volume {
                    id,
                    name: request.name.clone(),
                    pool_id,
                    size: request.size,
                    provisioning: request.provisioning,
                    used_capacity: 0,
                    state: VolumeState::Available,
                    mapping_count: 0,
                    chunks: Vec::new(),
                    created_at: Utc::now(),
                },
            );
            if let Err(e) = self
                .placement
                .allocate_chunks(t, id, 0, chunk_count(request.size))
            {
                t.volumes.remove(&id);
                return Err(e);
            }
            t.volume(id).cloned()
        })?;

        info!(
            volume_id = volume.id,
            pool_id,
            size = volume.size,
            provisioning = ?volume.provisioning,
            chunks = volume.chunks.len(),
            "Volume created"
        );
        self.events.publish(
            Event::new(EventType::VolumeCreated, format!("volume '{}' created", volume.name))
                .with_pool(pool_id)
                .with_volume(volume.id),
        );
        Ok(volume)
    }

    /// Grow a volume to `new_size` bytes.
    pub async fn extend_volume(&self, volume_id: VolumeId, new_size: u64) -> Result<Volume> {
        let pool_id = self.store.read(|t| t.volume(volume_id).map(|v| v.pool_id))?;
        let _guard = self.store.lock_pool(pool_id).await;

        let volume = self.store.write(|t| -> Result<_> {
            let volume = t.volume(volume_id)?;
            if volume.state == VolumeState::Deleting {
                return Err(FlexError::VolumeUnavailable(format!(
                    "volume {} is being deleted",
                    volume_id
                )));
            }
            let old_size = volume.size;
            if new_size <= old_size {
                return Err(FlexError::InvalidArgument(format!(
                    "volume {} is already {} bytes",
                    volume_id, old_size
                )));
            }
            let old_count = chunk_count(old_size);
            let new_count = chunk_count(new_size);
            let thick = volume.provisioning == Provisioning::Thick;
            // The last chunk of a thick volume may be partially charged.
            let tail = volume
                .chunks
                .last()
                .copied()
                .filter(|_| thick && old_count > 0);

            if thick {
                let tail_growth = PlacementEngine::logical_chunk_bytes(new_size, old_count - 1)
                    - PlacementEngine::logical_chunk_bytes(old_size, old_count - 1);
                let fresh: u64 = (old_count..new_count)
                    .map(|i| PlacementEngine::logical_chunk_bytes(new_size, i))
                    .sum();
                let allocatable = t.pool(pool_id)?.allocatable();
                if tail_growth + fresh > allocatable {
                    return Err(FlexError::InsufficientCapacity(format!(
                        "pool {} has {} bytes allocatable, extending volume {} needs {}",
                        pool_id,
                        allocatable,
                        volume_id,
                        tail_growth + fresh
                    )));
                }
            }

            t.volume_mut(volume_id)?.size = new_size;
            if let Err(e) = self
                .placement
                .allocate_chunks(t, volume_id, old_count, new_count)
            {
                t.volume_mut(volume_id)?.size = old_size;
                return Err(e);
            }
            if let Some(tail) = tail {
                self.placement.reserve_on_write(t, tail, CHUNK_SIZE)?;
            }
            t.volume(volume_id).cloned()
        })?;

        info!(volume_id, size = new_size, chunks = volume.chunks.len(), "Volume extended");
        Ok(volume)
    }

    /// Delete an unmapped volume and free everything it holds.
    pub async fn delete_volume(&self, volume_id: VolumeId) -> Result<()> {
        let pool_id = self.store.read(|t| t.volume(volume_id).map(|v| v.pool_id))?;
        let guard = self.store.lock_pool(pool_id).await;

        let chunk_ids = self.store.write(|t| -> Result<_> {
            let volume = t.volume_mut(volume_id)?;
            if volume.mapping_count > 0 {
                return Err(FlexError::VolumeInUse(format!(
                    "volume {} has {} mappings",
                    volume_id, volume.mapping_count
                )));
            }
            volume.state = VolumeState::Deleting;
            Ok(volume.chunks.clone())
        })?;

        self.rebuild.abandon_chunks(pool_id, &chunk_ids);
        let discards = self.discard_plan(volume_id, &chunk_ids)?;

        self.store.write(|t| -> Result<_> {
            for &chunk_id in &chunk_ids {
                self.placement.release_chunk(t, chunk_id)?;
            }
            t.volumes.remove(&volume_id);
            t.recompute_pool_health(pool_id);
            Ok(())
        })?;
        drop(guard);

        for (node_id, (address, tokens)) in discards {
            let count = tokens.len();
            if let Err(e) = self.data_plane.discard(node_id, &address, tokens).await {
                warn!(node_id, chunks = count, error = %e, "Discard failed, data left behind");
            }
        }

        info!(volume_id, pool_id, chunks = chunk_ids.len(), "Volume deleted");
        self.events.publish(
            Event::new(EventType::VolumeDeleted, "volume deleted")
                .with_pool(pool_id)
                .with_volume(volume_id),
        );
        Ok(())
    }

    /// Discard tokens per reachable node holding a replica of the chunks.
    fn discard_plan(
        &self,
        volume_id: VolumeId,
        chunk_ids: &[ChunkId],
    ) -> Result<HashMap<NodeId, (String, Vec<IoToken>)>> {
        let holders: Vec<(ChunkId, NodeId, String)> = self.store.read(|t| {
            chunk_ids
                .iter()
                .filter_map(|id| t.chunks.get(id))
                .flat_map(|chunk| {
                    chunk.replicas.iter().filter_map(move |r| {
                        t.nodes
                            .get(&r.node_id)
                            .filter(|n| n.state != NodeState::Down)
                            .map(|n| (chunk.id, n.id, n.address.clone()))
                    })
                })
                .collect()
        });

        let mut plan: HashMap<NodeId, (String, Vec<IoToken>)> = HashMap::new();
        for (chunk_id, node_id, address) in holders {
            let token = self
                .authority
                .issue_internal(volume_id, chunk_id, IoOperation::Write)?;
            plan.entry(node_id)
                .or_insert_with(|| (address, Vec::new()))
                .1
                .push(token);
        }
        Ok(plan)
    }

    pub fn get_volume(&self, volume_id: VolumeId) -> Result<Volume> {
        self.store.read(|t| t.volume(volume_id).cloned())
    }

    pub fn list_volumes(&self) -> Vec<Volume> {
        self.store.read(|t| t.volumes.values().cloned().collect())
    }

    /// Grant a client IO eligibility on a volume.
    pub fn map_volume(
        &self,
        volume_id: VolumeId,
        client_id: ClientId,
        access_mode: AccessMode,
    ) -> Result<VolumeMapping> {
        let mapping = self.store.write(|t| -> Result<_> {
            let volume = t.volume(volume_id)?;
            if volume.state == VolumeState::Deleting {
                return Err(FlexError::VolumeUnavailable(format!(
                    "volume {} is being deleted",
                    volume_id
                )));
            }
            t.client(client_id)?;
            if t.mappings.contains_key(&(volume_id, client_id)) {
                return Err(FlexError::AlreadyExists(format!(
                    "volume {} is already mapped to client {}",
                    volume_id, client_id
                )));
            }
            let mapping = VolumeMapping {
                volume_id,
                client_id,
                access_mode,
                mapped_at: Utc::now(),
            };
            t.mappings.insert((volume_id, client_id), mapping.clone());
            t.volume_mut(volume_id)?.mapping_count += 1;
            t.recompute_volume_state(volume_id);
            Ok(mapping)
        })?;
        info!(volume_id, client_id, mode = ?access_mode, "Volume mapped");
        self.events.publish(
            Event::new(
                EventType::VolumeMapped,
                format!("volume {} mapped to client {}", volume_id, client_id),
            )
            .with_volume(volume_id),
        );
        Ok(mapping)
    }

    pub fn unmap_volume(&self, volume_id: VolumeId, client_id: ClientId) -> Result<()> {
        self.store.write(|t| -> Result<_> {
            if t.mappings.remove(&(volume_id, client_id)).is_none() {
                return Err(FlexError::NotFound(format!(
                    "mapping of volume {} to client {}",
                    volume_id, client_id
                )));
            }
            let volume = t.volume_mut(volume_id)?;
            volume.mapping_count = volume.mapping_count.saturating_sub(1);
            t.recompute_volume_state(volume_id);
            Ok(())
        })?;
        info!(volume_id, client_id, "Volume unmapped");
        self.events.publish(
            Event::new(
                EventType::VolumeUnmapped,
                format!("volume {} unmapped from client {}", volume_id, client_id),
            )
            .with_volume(volume_id),
        );
        Ok(())
    }

    pub fn list_mappings(&self) -> Vec<VolumeMapping> {
        self.store.read(|t| t.mappings.values().cloned().collect())
    }

    // Data path support

    /// Count an IO timeout against a node; enough in a row fail it.
    pub async fn report_io_timeout(&self, node_id: NodeId) -> Result<()> {
        self.store.read(|t| t.node(node_id).map(|_| ()))?;
        if self.health.record_timeout(node_id) {
            warn!(node_id, "Failing storage node after repeated IO timeouts");
            self.rebuild.on_node_failure(node_id).await?;
        }
        Ok(())
    }

    /// Fold an IO acknowledgement into metrics, latency and health.
    pub fn io_ack(&self, ack: &IoAck) {
        self.metrics.record_ack(ack);
        self.store.write(|t| {
            let replica = t
                .chunks
                .get_mut(&ack.chunk_id)
                .and_then(|c| c.replica_mut(ack.node_id));
            if let Some(replica) = replica {
                replica.average_latency_ms =
                    latency_ema(replica.average_latency_ms, ack.latency_ms);
            }
        });
        self.health.record_success(ack.node_id);
    }

    // Rebuild

    pub async fn start_rebuild(&self, pool_id: PoolId) -> Result<Option<RebuildJob>> {
        self.rebuild.start_rebuild(pool_id).await
    }

    pub async fn cancel_rebuild(&self, pool_id: PoolId) -> Result<bool> {
        self.rebuild.cancel_rebuild(pool_id).await
    }

    /// Latest rebuild job of a pool, finished or not.
    pub fn rebuild_job(&self, pool_id: PoolId) -> Result<Option<RebuildJob>> {
        self.store.read(|t| -> Result<_> {
            t.pool(pool_id)?;
            Ok(t.jobs.get(&pool_id).cloned())
        })
    }

    // Queries

    /// Snapshot from the last aggregation tick, taking one if none exists yet.
    pub fn snapshot(&self) -> Arc<ClusterSnapshot> {
        let latest = self.metrics.latest();
        if latest.taken_at.is_some() {
            return latest;
        }
        self.refresh_snapshot()
    }

    /// Close the current metrics window now.
    pub fn refresh_snapshot(&self) -> Arc<ClusterSnapshot> {
        self.store.read(|t| self.metrics.tick(t))
    }

    pub fn query_events(&self, filter: &EventFilter, limit: usize) -> Vec<Event> {
        self.events.query(filter, limit)
    }

    // Background tasks

    /// Spawn the health sweep, rebuild worker and metrics loop.
    pub fn spawn_background(
        self: &Arc<Self>,
        shutdown_tx: &broadcast::Sender<()>,
    ) -> Vec<JoinHandle<()>> {
        let manager = Arc::clone(self);
        let monitor = HealthMonitor::new(Arc::clone(&self.health)).on_failure(move |node_id| {
            let manager = Arc::clone(&manager);
            Box::pin(async move {
                match manager.fail_node(node_id).await {
                    Ok(true) => info!(node_id, "Stale storage node failed"),
                    Ok(false) => debug!(node_id, "Stale node was already DOWN"),
                    Err(e) => warn!(node_id, error = %e, "Failed to fail stale node"),
                }
            })
        });

        vec![
            tokio::spawn(monitor.run(shutdown_tx.subscribe())),
            tokio::spawn(Arc::clone(&self.rebuild).run(shutdown_tx.subscribe())),
            tokio::spawn(Arc::clone(self).run_metrics_loop(shutdown_tx.subscribe())),
        ]
    }

    async fn run_metrics_loop(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.metrics_interval);
        info!("Metrics aggregation starting");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let snapshot = self.refresh_snapshot();
                    debug!(
                        pools = snapshot.pools.len(),
                        nodes = snapshot.nodes.len(),
                        volumes = snapshot.volumes.len(),
                        "Metrics aggregated"
                    );
                }
                _ = shutdown_rx.recv() => {
                    info!("Metrics aggregation shutting down");
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl AuthorityApi for MetadataManager {
    async fn register(
        &self,
        registration: Registration,
    ) -> Result<(NodeId, Option<RecoveryReport>)> {
        MetadataManager::register(self, registration).await
    }

    async fn heartbeat(&self, heartbeat: Heartbeat) -> Result<Option<RecoveryReport>> {
        MetadataManager::heartbeat(self, heartbeat).await
    }

    async fn volume_layout(
        &self,
        client_id: ClientId,
        volume_id: VolumeId,
    ) -> Result<VolumeLayout> {
        self.authority.volume_layout(client_id, volume_id)
    }

    async fn issue_token(
        &self,
        client_id: ClientId,
        volume_id: VolumeId,
        chunk_id: ChunkId,
        operation: IoOperation,
    ) -> Result<TokenGrant> {
        self.authority
            .issue_token(client_id, volume_id, chunk_id, operation)
    }

    async fn reserve_on_write(&self, chunk_id: ChunkId, bytes: u64) -> Result<u64> {
        self.store
            .write(|t| self.placement.reserve_on_write(t, chunk_id, bytes))
    }

    async fn report_degraded_write(&self, chunk_id: ChunkId, missed: Vec<NodeId>) -> Result<()> {
        self.rebuild.report_degraded_write(chunk_id, &missed).await
    }

    async fn report_io_timeout(&self, node_id: NodeId) -> Result<()> {
        MetadataManager::report_io_timeout(self, node_id).await
    }

    async fn io_ack(&self, ack: IoAck) -> Result<()> {
        MetadataManager::io_ack(self, &ack);
        Ok(())
    }
}
