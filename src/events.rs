//! Cluster event log for flexblock.
//!
//! Node state changes, rebuild lifecycle and data-loss notices are recorded
//! in a bounded in-memory history and broadcast to live subscribers (the
//! admin API and tests).

use crate::types::{ChunkId, NodeId, PoolId, VolumeId};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    // Membership
    SdsStateChange,
    NodeRegistered,
    NodeRemoved,

    // Rebuild
    RebuildStarted,
    RebuildProgress,
    RebuildStalled,
    RebuildComplete,
    RebuildCancelled,
    RebuildFailed,

    // Data
    ChunkLost,
    DegradedWrite,

    // Configuration
    PoolCreated,
    PoolDeleted,
    VolumeCreated,
    VolumeDeleted,
    VolumeMapped,
    VolumeUnmapped,
}

impl EventType {
    /// Whether this event belongs to the rebuild lifecycle.
    pub fn is_rebuild(&self) -> bool {
        matches!(
            self,
            EventType::RebuildStarted
                | EventType::RebuildProgress
                | EventType::RebuildStalled
                | EventType::RebuildComplete
                | EventType::RebuildCancelled
                | EventType::RebuildFailed
        )
    }
}

/// A single event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique event ID.
    pub id: String,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool_id: Option<PoolId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_id: Option<VolumeId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<ChunkId>,
    pub message: String,
}

impl Event {
    /// Create a new event.
    pub fn new(event_type: EventType, message: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type,
            timestamp: Utc::now(),
            pool_id: None,
            node_id: None,
            volume_id: None,
            chunk_id: None,
            message: message.into(),
        }
    }

    pub fn with_pool(mut self, pool_id: PoolId) -> Self {
        self.pool_id = Some(pool_id);
        self
    }

    pub fn with_node(mut self, node_id: NodeId) -> Self {
        self.node_id = Some(node_id);
        self
    }

    pub fn with_volume(mut self, volume_id: VolumeId) -> Self {
        self.volume_id = Some(volume_id);
        self
    }

    pub fn with_chunk(mut self, chunk_id: ChunkId) -> Self {
        self.chunk_id = Some(chunk_id);
        self
    }
}

/// History query filter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    /// Event types to include (empty = all).
    #[serde(default)]
    pub event_types: HashSet<EventType>,
    /// Restrict to one pool.
    #[serde(default)]
    pub pool_id: Option<PoolId>,
    /// Restrict to one node.
    #[serde(default)]
    pub node_id: Option<NodeId>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_types(mut self, types: impl IntoIterator<Item = EventType>) -> Self {
        self.event_types = types.into_iter().collect();
        self
    }

    pub fn pool(mut self, pool_id: PoolId) -> Self {
        self.pool_id = Some(pool_id);
        self
    }

    pub fn node(mut self, node_id: NodeId) -> Self {
        self.node_id = Some(node_id);
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        if !self.event_types.is_empty() && !self.event_types.contains(&event.event_type) {
            return false;
        }
        if let Some(pool_id) = self.pool_id {
            if event.pool_id != Some(pool_id) {
                return false;
            }
        }
        if let Some(node_id) = self.node_id {
            if event.node_id != Some(node_id) {
                return false;
            }
        }
        true
    }
}

/// Event log statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventLogStats {
    pub events_published: u64,
    pub history_len: usize,
    pub subscriber_count: usize,
}

/// Bounded event history with live broadcast.
pub struct EventLog {
    history_size: usize,
    history: RwLock<VecDeque<Event>>,
    broadcast: broadcast::Sender<Event>,
    published: AtomicU64,
}

impl EventLog {
    /// Create a new event log keeping at most `history_size` events.
    pub fn new(history_size: usize) -> Arc<Self> {
        let (broadcast, _) = broadcast::channel(1024);
        Arc::new(Self {
            history_size: history_size.max(1),
            history: RwLock::new(VecDeque::new()),
            broadcast,
            published: AtomicU64::new(0),
        })
    }

    /// Publish an event.
    pub fn publish(&self, event: Event) {
        self.published.fetch_add(1, Ordering::Relaxed);
        debug!(event_type = ?event.event_type, event_id = %event.id, "Event published");

        {
            let mut history = self.history.write();
            if history.len() >= self.history_size {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        // No receivers is fine.
        let _ = self.broadcast.send(event);
    }

    /// Live event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.broadcast.subscribe()
    }

    /// Most recent events, newest first.
    pub fn history(&self, limit: usize) -> Vec<Event> {
        let history = self.history.read();
        history.iter().rev().take(limit).cloned().collect()
    }

    /// Events matching a filter, newest first.
    pub fn query(&self, filter: &EventFilter, limit: usize) -> Vec<Event> {
        let history = self.history.read();
        history
            .iter()
            .rev()
            .filter(|e| filter.matches(e))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Count of events of a given type still in history.
    pub fn count(&self, event_type: EventType) -> usize {
        self.history
            .read()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn stats(&self) -> EventLogStats {
        EventLogStats {
            events_published: self.published.load(Ordering::Relaxed),
            history_len: self.history.read().len(),
            subscriber_count: self.broadcast.receiver_count(),
        }
    }
}
