//! Rebuild orchestration.
//!
//! A failed node's replicas are dropped from their chunks, which become
//! degraded, and the pool gets one rebuild job. Each degraded chunk gets one
//! task: either a fresh replica on a node chosen by the placement engine, or
//! an in-place resync of a stale replica whose node is UP or DEGRADED. A worker
//! advances every active job at a fixed poll interval, copying segments from
//! a surviving replica to the task target under the pool's bandwidth
//! throttle.
//!
//! All planning and replica state changes for a pool run under that pool's
//! lock, so the job has a single writer.
//!
//! Clients keep writing to a copy while it is rebuilt. A segment that overlaps
//! a WRITE token issued for its chunk is copied again.

use super::authority::TokenAuthority;
use super::placement::PlacementEngine;
use super::store::{ClusterStore, Tables};
use crate::client::DataPlane;
use crate::error::{FlexError, Result};
use crate::events::{Event, EventLog, EventType};
use crate::ratelimit::ThrottleRegistry;
use crate::types::*;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Rebuild worker configuration.
#[derive(Debug, Clone)]
pub struct RebuildConfig {
    /// How often active jobs are advanced.
    pub poll_interval: Duration,
    /// Timeout for each segment read or write.
    pub io_timeout: Duration,
}

impl Default for RebuildConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            io_timeout: Duration::from_secs(2),
        }
    }
}

/// Copy work for one chunk.
#[derive(Debug, Clone)]
struct RebuildTask {
    volume_id: VolumeId,
    target: NodeId,
    /// The target already held a (stale) replica.
    in_place: bool,
    /// Bytes of the chunk copied so far.
    copied: u64,
}

/// In-memory state of a pool's active job.
#[derive(Debug)]
struct PoolRebuild {
    tasks: BTreeMap<ChunkId, RebuildTask>,
    /// Targets that failed a copy, per chunk.
    failed_targets: HashMap<ChunkId, HashSet<NodeId>>,
    last_poll: Instant,
    last_decile: u32,
}

impl PoolRebuild {
    fn new() -> Self {
        Self {
            tasks: BTreeMap::new(),
            failed_targets: HashMap::new(),
            last_poll: Instant::now(),
            last_decile: 0,
        }
    }
}

#[derive(Debug, Default)]
struct PlanOutcome {
    added_bytes: u64,
    unplaceable: Vec<ChunkId>,
}

enum SegmentFailure {
    NoSource(String),
    Target(FlexError),
    /// A client write was granted while the segment was in flight.
    Raced,
}

/// Restores redundancy after node failures.
pub struct RebuildOrchestrator {
    store: Arc<ClusterStore>,
    placement: PlacementEngine,
    authority: Arc<TokenAuthority>,
    data_plane: Arc<dyn DataPlane>,
    events: Arc<EventLog>,
    throttles: ThrottleRegistry,
    active: Mutex<HashMap<PoolId, PoolRebuild>>,
    config: RebuildConfig,
}

impl RebuildOrchestrator {
    pub fn new(
        store: Arc<ClusterStore>,
        authority: Arc<TokenAuthority>,
        data_plane: Arc<dyn DataPlane>,
        events: Arc<EventLog>,
        config: RebuildConfig,
    ) -> Self {
        Self {
            store,
            placement: PlacementEngine::new(),
            authority,
            data_plane,
            events,
            throttles: ThrottleRegistry::new(),
            active: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &RebuildConfig {
        &self.config
    }

    /// Pools with an active job.
    pub fn active_pools(&self) -> Vec<PoolId> {
        let mut pools: Vec<PoolId> = self.active.lock().keys().copied().collect();
        pools.sort_unstable();
        pools
    }

    /// Change a pool's rebuild bandwidth.
    pub fn set_rate(&self, pool_id: PoolId, rate_mbps: u64) {
        self.throttles.set_rate(pool_id, rate_mbps);
    }

    pub fn forget_pool(&self, pool_id: PoolId) {
        self.active.lock().remove(&pool_id);
        self.throttles.remove(pool_id);
    }

    fn take_state(&self, pool_id: PoolId) -> Option<PoolRebuild> {
        self.active.lock().remove(&pool_id)
    }

    fn put_state(&self, pool_id: PoolId, state: PoolRebuild) {
        self.active.lock().insert(pool_id, state);
    }

    fn publish(&self, events: Vec<Event>) {
        for event in events {
            self.events.publish(event);
        }
    }

    /// Mark a storage node DOWN and start rebuilding what it held.
    ///
    /// Returns false if the node was already DOWN.
    pub async fn on_node_failure(&self, node_id: NodeId) -> Result<bool> {
        let (pool_id, state) = self
            .store
            .read(|t| t.node(node_id).map(|n| (n.pool_id, n.state)))?;
        if state == NodeState::Down {
            return Ok(false);
        }

        let _guard = self.store.lock_pool(pool_id).await;
        let mut rebuild = self.take_state(pool_id);
        let mut events = Vec::new();

        let affected = self.store.write(|t| -> Result<Option<usize>> {
            let node = t.node_mut(node_id)?;
            if node.state == NodeState::Down {
                return Ok(None);
            }
            node.state = NodeState::Down;

            let chunk_ids = t.node_chunk_ids(node_id);
            for &chunk_id in &chunk_ids {
                let chunk = t.chunk_mut(chunk_id)?;
                if let Some(pos) = chunk.replicas.iter().position(|r| r.node_id == node_id) {
                    let replica = chunk.replicas.remove(pos);
                    if replica.is_available && !chunk.displaced.contains(&node_id) {
                        chunk.displaced.push(node_id);
                    }
                }
                chunk.is_degraded = true;
                if chunk.available_count() == 0 {
                    events.push(
                        Event::new(
                            EventType::ChunkLost,
                            format!("chunk {} has no available replica", chunk_id),
                        )
                        .with_pool(pool_id)
                        .with_volume(chunk.volume_id)
                        .with_chunk(chunk_id),
                    );
                }
            }
            let released = chunk_ids.len() as u64 * CHUNK_SIZE;
            let node = t.node_mut(node_id)?;
            node.used = node.used.saturating_sub(released);

            if let Some(state) = rebuild.as_mut() {
                let dropped: Vec<ChunkId> = state
                    .tasks
                    .iter()
                    .filter(|(_, task)| task.target == node_id)
                    .map(|(id, _)| *id)
                    .collect();
                for chunk_id in dropped {
                    if let Some(task) = state.tasks.remove(&chunk_id) {
                        Self::shrink_job(t, pool_id, CHUNK_SIZE - task.copied);
                    }
                }
            }

            t.recompute_pool_health(pool_id);
            t.recompute_pool_volumes(pool_id);
            Ok(Some(chunk_ids.len()))
        })?;
        let Some(affected) = affected else {
            if let Some(state) = rebuild {
                self.put_state(pool_id, state);
            }
            return Ok(false);
        };

        warn!(node_id, pool_id, affected, "Storage node marked DOWN");
        metrics::counter!("flexblock_node_failures_total").increment(1);
        let mut all = vec![Event::new(
            EventType::SdsStateChange,
            format!("storage node {} DOWN, {} chunks affected", node_id, affected),
        )
        .with_node(node_id)
        .with_pool(pool_id)];
        all.extend(events);
        self.publish(all);

        if let Some(state) = rebuild {
            self.put_state(pool_id, state);
        }
        self.start_rebuild_locked(pool_id)?;
        Ok(true)
    }

    /// Bring a storage node back and fast-heal its displaced replicas.
    ///
    /// Copies that missed a write while the node was down are resynced in
    /// place. The node stays DEGRADED until every one of them has caught up.
    pub async fn on_node_recover(&self, node_id: NodeId) -> Result<RecoveryReport> {
        let pool_id = self.store.read(|t| t.node(node_id).map(|n| n.pool_id))?;
        let _guard = self.store.lock_pool(pool_id).await;
        let mut rebuild = self.take_state(pool_id);
        let mut events = Vec::new();

        let (report, previous, state) = self.store.write(|t| -> Result<_> {
            let copies = t.pool(pool_id)?.copies;
            let node = t.node_mut(node_id)?;
            let previous = node.state;
            node.state = NodeState::Degraded;
            node.last_heartbeat = Some(Utc::now());

            let mut report = RecoveryReport::default();
            let returning: Vec<(ChunkId, bool)> = t
                .chunks
                .values()
                .filter(|c| c.displaced.contains(&node_id) || c.stale.contains(&node_id))
                .map(|c| (c.id, c.stale.contains(&node_id)))
                .collect();

            for (chunk_id, stale) in returning {
                let chunk = t.chunk_mut(chunk_id)?;
                chunk.displaced.retain(|&n| n != node_id);
                chunk.stale.retain(|&n| n != node_id);
                if chunk.holds(node_id) {
                    continue;
                }
                let available = chunk.available_count();
                if available == 0 {
                    report.lost.push(chunk_id);
                    events.push(
                        Event::new(
                            EventType::ChunkLost,
                            format!("chunk {} cannot be healed, no available replica", chunk_id),
                        )
                        .with_pool(pool_id)
                        .with_node(node_id)
                        .with_chunk(chunk_id),
                    );
                    continue;
                }
                if available >= copies {
                    report.dropped.push(chunk_id);
                    continue;
                }

                if stale {
                    let mut replica = Replica::available(node_id);
                    replica.is_available = false;
                    chunk.replicas.push(replica);
                } else {
                    chunk.replicas.push(Replica::available(node_id));
                }
                let superseded = rebuild.as_mut().and_then(|state| {
                    let fresh_copy = state.tasks.get(&chunk_id).map(|task| !task.in_place);
                    if fresh_copy == Some(true) {
                        state.tasks.remove(&chunk_id)
                    } else {
                        None
                    }
                });
                if let Some(task) = &superseded {
                    chunk.replicas.retain(|r| r.node_id != task.target);
                }
                chunk.is_degraded = chunk.available_count() < copies;
                if !stale {
                    report.healed.push(chunk_id);
                }

                t.node_mut(node_id)?.used += CHUNK_SIZE;
                if let Some(task) = superseded {
                    let target = t.node_mut(task.target)?;
                    target.used = target.used.saturating_sub(CHUNK_SIZE);
                    if let Some(job) = t.jobs.get_mut(&pool_id) {
                        job.bytes_done += CHUNK_SIZE - task.copied;
                    }
                    t.settle_node(task.target);
                }
            }

            report.resync = t
                .chunks
                .values()
                .filter(|c| {
                    c.replica(node_id)
                        .map(|r| !r.is_available)
                        .unwrap_or(false)
                })
                .map(|c| c.id)
                .collect();

            t.settle_node(node_id);
            let state = t.node(node_id)?.state;
            t.recompute_pool_health(pool_id);
            t.recompute_pool_volumes(pool_id);
            Ok((report, previous, state))
        })?;

        info!(
            node_id,
            pool_id,
            state = state.as_str(),
            healed = report.healed.len(),
            resync = report.resync.len(),
            dropped = report.dropped.len(),
            lost = report.lost.len(),
            "Storage node recovered"
        );
        if previous != state {
            events.insert(
                0,
                Event::new(
                    EventType::SdsStateChange,
                    format!(
                        "storage node {} {}, {} replicas healed, {} to resync",
                        node_id,
                        state.as_str(),
                        report.healed.len(),
                        report.resync.len()
                    ),
                )
                .with_node(node_id)
                .with_pool(pool_id),
            );
        }
        self.publish(events);

        if let Some(state) = rebuild {
            self.put_state(pool_id, state);
        }
        self.start_rebuild_locked(pool_id)?;
        Ok(report)
    }

    /// A write reached quorum but missed `nodes`; their copies are stale.
    pub async fn report_degraded_write(&self, chunk_id: ChunkId, nodes: &[NodeId]) -> Result<()> {
        let pool_id = self.store.read(|t| t.chunk(chunk_id).map(|c| c.pool_id))?;
        let _guard = self.store.lock_pool(pool_id).await;
        let mut rebuild = self.take_state(pool_id);

        let changed = self.store.write(|t| -> Result<bool> {
            let mut changed = false;
            let mut restarted = Vec::new();
            {
                let chunk = t.chunk_mut(chunk_id)?;
                for &node_id in nodes {
                    // Already DOWN: its copy can no longer be fast-healed.
                    if chunk.displaced.contains(&node_id) {
                        chunk.displaced.retain(|&n| n != node_id);
                        if !chunk.stale.contains(&node_id) {
                            chunk.stale.push(node_id);
                        }
                        changed = true;
                        continue;
                    }
                    let Some(replica) = chunk.replica_mut(node_id) else {
                        continue;
                    };
                    if replica.is_rebuilding {
                        restarted.push(node_id);
                        changed = true;
                    } else if replica.is_available {
                        replica.is_available = false;
                        changed = true;
                    }
                }
            }
            // A copy in flight missed this write; start it over.
            for node_id in restarted {
                let task = rebuild
                    .as_mut()
                    .and_then(|state| state.tasks.get_mut(&chunk_id))
                    .filter(|task| task.target == node_id);
                if let Some(task) = task {
                    let redone = task.copied;
                    task.copied = 0;
                    if let Some(job) = t.jobs.get_mut(&pool_id) {
                        job.bytes_total += redone;
                    }
                }
            }
            if changed {
                let chunk = t.chunk_mut(chunk_id)?;
                for node_id in std::mem::take(&mut chunk.displaced) {
                    if !chunk.stale.contains(&node_id) {
                        chunk.stale.push(node_id);
                    }
                }
                chunk.is_degraded = true;
                t.recompute_pool_health(pool_id);
                t.recompute_pool_volumes(pool_id);
            }
            Ok(changed)
        })?;

        if let Some(state) = rebuild {
            self.put_state(pool_id, state);
        }
        if changed {
            warn!(chunk_id, pool_id, nodes = ?nodes, "Degraded write reported");
            self.events.publish(
                Event::new(
                    EventType::DegradedWrite,
                    format!("chunk {} written without nodes {:?}", chunk_id, nodes),
                )
                .with_pool(pool_id)
                .with_chunk(chunk_id),
            );
            self.start_rebuild_locked(pool_id)?;
        }
        Ok(())
    }

    /// Start (or extend) the pool's rebuild job.
    ///
    /// Returns `None` when there is nothing to rebuild.
    pub async fn start_rebuild(&self, pool_id: PoolId) -> Result<Option<RebuildJob>> {
        self.store.read(|t| t.pool(pool_id).map(|_| ()))?;
        let _guard = self.store.lock_pool(pool_id).await;
        self.start_rebuild_locked(pool_id)
    }

    fn start_rebuild_locked(&self, pool_id: PoolId) -> Result<Option<RebuildJob>> {
        let mut state = self.take_state(pool_id).unwrap_or_else(PoolRebuild::new);
        let mut events = Vec::new();

        let job = self.store.write(|t| -> Result<Option<RebuildJob>> {
            let rate = t.pool(pool_id)?.rebuild_rate_limit_mbps;
            let outcome = self.plan(t, pool_id, &mut state)?;

            let active = t
                .jobs
                .get(&pool_id)
                .map(|j| j.state.is_active())
                .unwrap_or(false);

            if state.tasks.is_empty() {
                if active {
                    // Remaining work was superseded; the next poll finishes the job.
                    return Ok(t.jobs.get(&pool_id).cloned());
                }
                if !outcome.unplaceable.is_empty() {
                    let job = Self::failed_job(pool_id);
                    error!(
                        pool_id,
                        chunks = outcome.unplaceable.len(),
                        "No eligible rebuild target, pool stays degraded"
                    );
                    events.push(
                        Event::new(
                            EventType::RebuildFailed,
                            format!(
                                "no eligible target for {} degraded chunks",
                                outcome.unplaceable.len()
                            ),
                        )
                        .with_pool(pool_id),
                    );
                    t.jobs.insert(pool_id, job.clone());
                    t.pool_mut(pool_id)?.rebuild_state = RebuildState::Idle;
                    t.recompute_pool_health(pool_id);
                    return Ok(Some(job));
                }
                return Ok(None);
            }

            let job = if active {
                let job = t
                    .jobs
                    .get_mut(&pool_id)
                    .ok_or_else(|| FlexError::Internal("active job vanished".into()))?;
                job.bytes_total += outcome.added_bytes;
                job.clone()
            } else {
                let job = RebuildJob {
                    pool_id,
                    started_at: Utc::now(),
                    finished_at: None,
                    bytes_total: outcome.added_bytes,
                    bytes_done: 0,
                    state: RebuildJobState::InProgress,
                    current_rate: 0.0,
                    eta_secs: None,
                };
                state.last_poll = Instant::now();
                state.last_decile = 0;
                t.jobs.insert(pool_id, job.clone());
                info!(
                    pool_id,
                    chunks = state.tasks.len(),
                    bytes_total = job.bytes_total,
                    "Rebuild started"
                );
                events.push(
                    Event::new(
                        EventType::RebuildStarted,
                        format!("rebuilding {} chunks", state.tasks.len()),
                    )
                    .with_pool(pool_id),
                );
                job
            };

            t.pool_mut(pool_id)?.rebuild_state = RebuildState::InProgress;
            t.recompute_pool_health(pool_id);
            t.recompute_pool_volumes(pool_id);
            self.throttles.get_or_create(pool_id, rate);
            Ok(Some(job))
        })?;

        self.publish(events);
        let keep = job.as_ref().map(|j| j.state.is_active()).unwrap_or(false);
        if keep {
            self.put_state(pool_id, state);
        }
        Ok(job)
    }

    fn failed_job(pool_id: PoolId) -> RebuildJob {
        let now = Utc::now();
        RebuildJob {
            pool_id,
            started_at: now,
            finished_at: Some(now),
            bytes_total: 0,
            bytes_done: 0,
            state: RebuildJobState::Failed,
            current_rate: 0.0,
            eta_secs: None,
        }
    }

    /// Create tasks for degraded chunks that have none.
    fn plan(
        &self,
        t: &mut Tables,
        pool_id: PoolId,
        state: &mut PoolRebuild,
    ) -> Result<PlanOutcome> {
        let copies = t.pool(pool_id)?.copies;
        let mut outcome = PlanOutcome::default();

        for chunk_id in t.degraded_chunk_ids(pool_id) {
            if state.tasks.contains_key(&chunk_id) {
                continue;
            }
            let chunk = t.chunk(chunk_id)?;
            let available = chunk.available_count();
            if available == 0 {
                continue;
            }
            if available >= copies {
                t.chunk_mut(chunk_id)?.is_degraded = false;
                continue;
            }
            let volume_id = chunk.volume_id;

            let resync = chunk
                .replicas
                .iter()
                .find(|r| {
                    !r.is_available
                        && t.nodes
                            .get(&r.node_id)
                            .map(|n| matches!(n.state, NodeState::Up | NodeState::Degraded))
                            .unwrap_or(false)
                })
                .map(|r| (r.node_id, !r.is_rebuilding));

            let (target, in_place) = match resync {
                Some((node_id, stale)) => {
                    if let Some(replica) = t.chunk_mut(chunk_id)?.replica_mut(node_id) {
                        replica.is_rebuilding = true;
                    }
                    (node_id, stale)
                }
                None => {
                    let excluded = state
                        .failed_targets
                        .get(&chunk_id)
                        .cloned()
                        .unwrap_or_default();
                    match self.placement.select_rebuild_target(t, chunk_id, &excluded) {
                        Ok(target) => {
                            t.chunk_mut(chunk_id)?
                                .replicas
                                .push(Replica::rebuilding(target));
                            t.node_mut(target)?.used += CHUNK_SIZE;
                            (target, false)
                        }
                        Err(e) => {
                            warn!(chunk_id, pool_id, error = %e, "Cannot place rebuild target");
                            outcome.unplaceable.push(chunk_id);
                            continue;
                        }
                    }
                }
            };

            debug!(chunk_id, target, in_place, "Rebuild task planned");
            state.tasks.insert(
                chunk_id,
                RebuildTask {
                    volume_id,
                    target,
                    in_place,
                    copied: 0,
                },
            );
            outcome.added_bytes += CHUNK_SIZE;
        }

        Ok(outcome)
    }

    /// Forget copy work on chunks that are about to be released.
    ///
    /// The caller must hold the pool lock.
    pub fn abandon_chunks(&self, pool_id: PoolId, chunk_ids: &[ChunkId]) {
        let Some(mut state) = self.take_state(pool_id) else {
            return;
        };
        self.store.write(|t| {
            for chunk_id in chunk_ids {
                state.failed_targets.remove(chunk_id);
                if let Some(task) = state.tasks.remove(chunk_id) {
                    Self::shrink_job(t, pool_id, CHUNK_SIZE - task.copied);
                }
            }
        });
        self.put_state(pool_id, state);
    }

    fn shrink_job(t: &mut Tables, pool_id: PoolId, bytes: u64) {
        if let Some(job) = t.jobs.get_mut(&pool_id) {
            job.bytes_total = job.bytes_total.saturating_sub(bytes);
        }
    }

    /// Cancel the pool's active job.
    ///
    /// Replicas already completed stay; partial copies are dropped. Returns
    /// false if no job was active.
    pub async fn cancel_rebuild(&self, pool_id: PoolId) -> Result<bool> {
        self.store.read(|t| t.pool(pool_id).map(|_| ()))?;
        let _guard = self.store.lock_pool(pool_id).await;
        let state = self.take_state(pool_id);

        let cancelled = self.store.write(|t| -> Result<bool> {
            let active = t
                .jobs
                .get(&pool_id)
                .map(|j| j.state.is_active())
                .unwrap_or(false);
            if !active {
                return Ok(false);
            }
            if let Some(state) = &state {
                for (&chunk_id, task) in &state.tasks {
                    let chunk = t.chunk_mut(chunk_id)?;
                    if task.in_place {
                        if let Some(replica) = chunk.replica_mut(task.target) {
                            replica.is_rebuilding = false;
                        }
                    } else {
                        chunk.replicas.retain(|r| r.node_id != task.target);
                        let target = t.node_mut(task.target)?;
                        target.used = target.used.saturating_sub(CHUNK_SIZE);
                    }
                }
            }
            if let Some(job) = t.jobs.get_mut(&pool_id) {
                job.state = RebuildJobState::Cancelled;
                job.finished_at = Some(Utc::now());
                job.eta_secs = None;
            }
            t.pool_mut(pool_id)?.rebuild_state = RebuildState::Idle;
            t.recompute_pool_health(pool_id);
            t.recompute_pool_volumes(pool_id);
            Ok(true)
        })?;

        if cancelled {
            info!(pool_id, "Rebuild cancelled");
            self.events.publish(
                Event::new(EventType::RebuildCancelled, "rebuild cancelled by request")
                    .with_pool(pool_id),
            );
        }
        Ok(cancelled)
    }

    /// Run one copy round for a pool's active job.
    pub async fn advance(&self, pool_id: PoolId) -> Result<Option<RebuildJob>> {
        let _guard = self.store.lock_pool(pool_id).await;
        let Some(mut state) = self.take_state(pool_id) else {
            return Ok(None);
        };
        let rate = match self.store.read(|t| t.pool(pool_id).map(|p| p.rebuild_rate_limit_mbps)) {
            Ok(rate) => rate,
            Err(e) => {
                // Pool deleted under us.
                self.throttles.remove(pool_id);
                return Err(e);
            }
        };
        let throttle = self.throttles.get_or_create(pool_id, rate);

        let mut progressed = 0u64;
        let mut finished = Vec::new();
        let mut abandoned = Vec::new();

        let chunk_ids: Vec<ChunkId> = state.tasks.keys().copied().collect();
        'tasks: for chunk_id in chunk_ids {
            let Some(task) = state.tasks.get_mut(&chunk_id) else {
                continue;
            };
            while task.copied < CHUNK_SIZE {
                let segment = throttle.segment_size().min(CHUNK_SIZE - task.copied);
                if !throttle.try_acquire(segment) {
                    break 'tasks;
                }
                match self.copy_segment(chunk_id, task, segment).await {
                    Ok(()) => {
                        task.copied += segment;
                        progressed += segment;
                    }
                    Err(SegmentFailure::NoSource(reason)) => {
                        debug!(chunk_id, reason = %reason, "No rebuild source this round");
                        continue 'tasks;
                    }
                    Err(SegmentFailure::Target(e)) => {
                        warn!(
                            chunk_id,
                            target = task.target,
                            error = %e,
                            "Rebuild target failed"
                        );
                        abandoned.push(chunk_id);
                        continue 'tasks;
                    }
                    Err(SegmentFailure::Raced) => {
                        debug!(chunk_id, offset = task.copied, "Segment raced a write, recopying");
                        continue 'tasks;
                    }
                }
            }
            finished.push(chunk_id);
        }

        metrics::counter!("flexblock_rebuild_bytes_total").increment(progressed);

        let mut events = Vec::new();
        let job = self.store.write(|t| -> Result<Option<RebuildJob>> {
            let copies = t.pool(pool_id)?.copies;

            for chunk_id in &finished {
                if let Some(task) = state.tasks.remove(chunk_id) {
                    Self::finish_chunk(t, *chunk_id, &task, copies)?;
                    state.failed_targets.remove(chunk_id);
                }
            }
            for chunk_id in &abandoned {
                if let Some(task) = state.tasks.remove(chunk_id) {
                    let chunk = t.chunk_mut(*chunk_id)?;
                    if task.in_place {
                        if let Some(replica) = chunk.replica_mut(task.target) {
                            replica.is_rebuilding = false;
                        }
                    } else {
                        chunk.replicas.retain(|r| r.node_id != task.target);
                        let target = t.node_mut(task.target)?;
                        target.used = target.used.saturating_sub(CHUNK_SIZE);
                    }
                    Self::shrink_job(t, pool_id, CHUNK_SIZE - task.copied);
                    state
                        .failed_targets
                        .entry(*chunk_id)
                        .or_default()
                        .insert(task.target);
                }
            }

            let outcome = self.plan(t, pool_id, &mut state)?;

            let Some(job) = t.jobs.get_mut(&pool_id) else {
                return Ok(None);
            };
            if !job.state.is_active() {
                return Ok(Some(job.clone()));
            }
            job.bytes_total += outcome.added_bytes;
            job.bytes_done += progressed;

            let now = Instant::now();
            let elapsed = now.saturating_duration_since(state.last_poll).as_secs_f64();
            state.last_poll = now;
            if elapsed > 0.0 {
                job.current_rate = progressed as f64 / elapsed;
            }
            let remaining = job.bytes_total.saturating_sub(job.bytes_done);
            job.eta_secs = if job.current_rate > 0.0 {
                Some(remaining as f64 / job.current_rate)
            } else {
                None
            };

            let progress = job.progress_percent();
            let decile = ((progress / 10.0).floor() as u32).min(10);
            while state.last_decile < decile {
                state.last_decile += 1;
                events.push(
                    Event::new(
                        EventType::RebuildProgress,
                        format!("rebuild {}% complete", state.last_decile * 10),
                    )
                    .with_pool(pool_id),
                );
            }

            if state.tasks.is_empty() {
                let stuck = !outcome.unplaceable.is_empty()
                    || t.chunks
                        .values()
                        .any(|c| c.pool_id == pool_id && c.is_degraded && c.available_count() > 0);
                let job = t
                    .jobs
                    .get_mut(&pool_id)
                    .ok_or_else(|| FlexError::Internal("active job vanished".into()))?;
                job.finished_at = Some(Utc::now());
                job.eta_secs = None;
                if stuck {
                    job.state = RebuildJobState::Failed;
                    events.push(
                        Event::new(EventType::RebuildFailed, "degraded chunks left without target")
                            .with_pool(pool_id),
                    );
                    t.pool_mut(pool_id)?.rebuild_state = RebuildState::Idle;
                } else {
                    job.state = RebuildJobState::Completed;
                    job.bytes_done = job.bytes_total;
                    events.push(
                        Event::new(
                            EventType::RebuildComplete,
                            format!("rebuilt {} bytes", job.bytes_total),
                        )
                        .with_pool(pool_id),
                    );
                    t.pool_mut(pool_id)?.rebuild_state = RebuildState::Completed;
                }
            } else if progressed == 0 {
                if job.state != RebuildJobState::Stalled {
                    warn!(pool_id, bytes_done = job.bytes_done, "Rebuild stalled");
                    events.push(
                        Event::new(
                            EventType::RebuildStalled,
                            format!(
                                "no progress this round, {} of {} bytes rebuilt",
                                job.bytes_done, job.bytes_total
                            ),
                        )
                        .with_pool(pool_id),
                    );
                }
                job.state = RebuildJobState::Stalled;
            } else {
                job.state = RebuildJobState::InProgress;
            }

            let job = t.jobs.get(&pool_id).cloned();
            t.recompute_pool_health(pool_id);
            t.recompute_pool_volumes(pool_id);
            Ok(job)
        })?;

        if let Some(job) = &job {
            debug!(
                pool_id,
                state = ?job.state,
                progress = job.progress_percent(),
                rate = job.current_rate,
                "Rebuild advanced"
            );
            if job.state == RebuildJobState::Completed {
                info!(pool_id, bytes = job.bytes_total, "Rebuild complete");
            }
            if job.state.is_active() {
                self.put_state(pool_id, state);
            }
        }
        self.publish(events);
        Ok(job)
    }

    fn finish_chunk(
        t: &mut Tables,
        chunk_id: ChunkId,
        task: &RebuildTask,
        copies: usize,
    ) -> Result<()> {
        let mut surplus = Vec::new();
        {
            let chunk = t.chunk_mut(chunk_id)?;
            if let Some(replica) = chunk.replica_mut(task.target) {
                replica.is_available = true;
                replica.is_rebuilding = false;
            }
            // Keep at most `copies` available replicas, dropping the slowest.
            while chunk.available_count() > copies {
                let Some(pos) = chunk
                    .replicas
                    .iter()
                    .enumerate()
                    .filter(|(_, r)| r.is_available && r.node_id != task.target)
                    .max_by(|(_, a), (_, b)| {
                        a.average_latency_ms
                            .partial_cmp(&b.average_latency_ms)
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .map(|(i, _)| i)
                else {
                    break;
                };
                surplus.push(chunk.replicas.remove(pos).node_id);
            }
            chunk.is_degraded = chunk.available_count() < copies;
        }
        for node_id in surplus {
            if let Ok(node) = t.node_mut(node_id) {
                node.used = node.used.saturating_sub(CHUNK_SIZE);
            }
        }
        if t.settle_node(task.target) {
            info!(node_id = task.target, "Storage node caught up, UP");
        }
        debug!(chunk_id, target = task.target, "Chunk rebuilt");
        Ok(())
    }

    /// Copy one segment of a chunk to the task target.
    async fn copy_segment(
        &self,
        chunk_id: ChunkId,
        task: &RebuildTask,
        length: u64,
    ) -> std::result::Result<(), SegmentFailure> {
        let (sources, target_addr, generation) = self
            .store
            .read(|t| -> Result<_> {
                let chunk = t.chunk(chunk_id)?;
                let mut sources: Vec<(f64, NodeId, String)> = chunk
                    .replicas
                    .iter()
                    .filter(|r| r.is_available && r.node_id != task.target)
                    .filter_map(|r| {
                        t.nodes
                            .get(&r.node_id)
                            .filter(|n| n.state != NodeState::Down)
                            .map(|n| (r.average_latency_ms, n.id, n.address.clone()))
                    })
                    .collect();
                sources.sort_by(|a, b| {
                    a.0.partial_cmp(&b.0)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then(a.1.cmp(&b.1))
                });
                let target = t.node(task.target)?.address.clone();
                Ok((sources, target, chunk.write_generation))
            })
            .map_err(|e| SegmentFailure::NoSource(e.to_string()))?;

        let read_token = self
            .authority
            .issue_internal(task.volume_id, chunk_id, IoOperation::Read)
            .map_err(|e| SegmentFailure::NoSource(e.to_string()))?;
        let write_token = self
            .authority
            .issue_internal(task.volume_id, chunk_id, IoOperation::Write)
            .map_err(SegmentFailure::Target)?;

        let mut data = None;
        let mut last_error = String::from("no available source replica");
        for (_, node_id, address) in sources {
            let read = self
                .data_plane
                .read(node_id, &address, read_token.clone(), task.copied, length);
            match tokio::time::timeout(self.config.io_timeout, read).await {
                Ok(Ok(bytes)) => {
                    data = Some(bytes);
                    break;
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(e) => last_error = e.to_string(),
            }
        }
        let data = data.ok_or(SegmentFailure::NoSource(last_error))?;

        let write = self
            .data_plane
            .write(task.target, &target_addr, write_token, task.copied, data);
        match tokio::time::timeout(self.config.io_timeout, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(SegmentFailure::Target(e)),
            Err(e) => return Err(SegmentFailure::Target(e.into())),
        }

        let current = self
            .store
            .read(|t| t.chunk(chunk_id).map(|c| c.write_generation))
            .map_err(|e| SegmentFailure::NoSource(e.to_string()))?;
        if current != generation {
            return Err(SegmentFailure::Raced);
        }
        Ok(())
    }

    /// Advance every active job at the configured poll interval.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: tokio::sync::broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        info!("Rebuild worker starting");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    for pool_id in self.active_pools() {
                        if let Err(e) = self.advance(pool_id).await {
                            warn!(pool_id, error = %e, "Rebuild round failed");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Rebuild worker shutting down");
                    break;
                }
            }
        }
    }
}
