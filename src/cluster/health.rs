//! Membership and health tracking.
//!
//! Two signals declare a storage node failed: no heartbeat for longer than
//! the stale threshold, or a run of consecutive IO timeouts reported by
//! initiators. Both are evaluated here; the reaction (marking the node DOWN
//! and starting a rebuild) belongs to the caller.

use crate::types::NodeId;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Configuration for the health tracker.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Silence after which a node is stale.
    pub stale_after: Duration,
    /// How often staleness is evaluated.
    pub sweep_interval: Duration,
    /// Consecutive IO timeouts that fail a node.
    pub io_timeout_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(10),
            io_timeout_threshold: 3,
        }
    }
}

#[derive(Debug, Clone)]
struct Liveness {
    last_seen: Instant,
    consecutive_timeouts: u32,
    /// Set once the node has been reported stale; cleared by a heartbeat.
    reported: bool,
}

impl Liveness {
    fn new(now: Instant) -> Self {
        Self {
            last_seen: now,
            consecutive_timeouts: 0,
            reported: false,
        }
    }
}

/// Status summary.
#[derive(Debug, Clone, Default)]
pub struct HealthStatus {
    pub tracked: usize,
    pub stale: usize,
}

/// Heartbeat and timeout bookkeeping per node.
pub struct HealthTracker {
    config: HealthConfig,
    records: RwLock<HashMap<NodeId, Liveness>>,
}

impl HealthTracker {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            records: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Start tracking a node as freshly seen.
    pub fn register(&self, node_id: NodeId) {
        self.records
            .write()
            .insert(node_id, Liveness::new(Instant::now()));
        debug!(node_id, "Node registered with health tracker");
    }

    pub fn unregister(&self, node_id: NodeId) {
        self.records.write().remove(&node_id);
    }

    /// Record a heartbeat. Returns true if the node had been reported stale.
    pub fn ingest(&self, node_id: NodeId) -> bool {
        self.ingest_at(node_id, Instant::now())
    }

    pub fn ingest_at(&self, node_id: NodeId, now: Instant) -> bool {
        let mut records = self.records.write();
        let record = records
            .entry(node_id)
            .or_insert_with(|| Liveness::new(now));
        let was_reported = record.reported;
        record.last_seen = now;
        record.reported = false;
        was_reported
    }

    /// Nodes that just went stale. Each stale period is reported once.
    pub fn sweep(&self) -> Vec<NodeId> {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> Vec<NodeId> {
        let mut records = self.records.write();
        let mut stale = Vec::new();
        for (&node_id, record) in records.iter_mut() {
            if record.reported {
                continue;
            }
            if now.saturating_duration_since(record.last_seen) > self.config.stale_after {
                record.reported = true;
                stale.push(node_id);
            }
        }
        stale.sort_unstable();
        stale
    }

    /// Count an IO timeout. Returns true when the threshold is reached.
    pub fn record_timeout(&self, node_id: NodeId) -> bool {
        let mut records = self.records.write();
        let record = records
            .entry(node_id)
            .or_insert_with(|| Liveness::new(Instant::now()));
        record.consecutive_timeouts += 1;
        if record.consecutive_timeouts >= self.config.io_timeout_threshold {
            record.consecutive_timeouts = 0;
            warn!(node_id, "IO timeout threshold reached");
            return true;
        }
        false
    }

    /// A successful IO resets the timeout run.
    pub fn record_success(&self, node_id: NodeId) {
        if let Some(record) = self.records.write().get_mut(&node_id) {
            record.consecutive_timeouts = 0;
        }
    }

    pub fn consecutive_timeouts(&self, node_id: NodeId) -> u32 {
        self.records
            .read()
            .get(&node_id)
            .map(|r| r.consecutive_timeouts)
            .unwrap_or(0)
    }

    pub fn status(&self) -> HealthStatus {
        let records = self.records.read();
        HealthStatus {
            tracked: records.len(),
            stale: records.values().filter(|r| r.reported).count(),
        }
    }
}

type FailureCallback = Box<dyn Fn(NodeId) -> BoxFuture<'static, ()> + Send + Sync>;

/// Periodic staleness sweep run as a background task.
pub struct HealthMonitor {
    tracker: Arc<HealthTracker>,
    on_failure: Option<FailureCallback>,
}

impl HealthMonitor {
    pub fn new(tracker: Arc<HealthTracker>) -> Self {
        Self {
            tracker,
            on_failure: None,
        }
    }

    /// Set a callback for nodes detected as stale.
    pub fn on_failure<F>(mut self, callback: F) -> Self
    where
        F: Fn(NodeId) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        self.on_failure = Some(Box::new(callback));
        self
    }

    /// Run the monitor until shutdown.
    pub async fn run(self, mut shutdown_rx: tokio::sync::broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.tracker.config().sweep_interval);

        info!("Health monitor starting");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    for node_id in self.tracker.sweep() {
                        warn!(node_id, "Node heartbeat is stale");
                        if let Some(ref callback) = self.on_failure {
                            callback(node_id).await;
                        }
                    }
                    let status = self.tracker.status();
                    debug!(
                        tracked = status.tracked,
                        stale = status.stale,
                        "Health sweep completed"
                    );
                }
                _ = shutdown_rx.recv() => {
                    info!("Health monitor shutting down");
                    break;
                }
            }
        }
    }
}
