//! Seams between the initiator, storage nodes and the metadata manager.
//!
//! [`AuthorityApi`] is what storage nodes and initiators need from the
//! metadata manager; [`DataPlane`] is how IO reaches a storage node. Each has
//! an in-process and a TCP implementation.

use crate::auth::IoToken;
use crate::cluster::{TokenGrant, VolumeLayout};
use crate::data::StorageNodeService;
use crate::error::{FlexError, Result};
use crate::protocol::{
    Connection, ControlRequest, ControlResponse, DataRequest, DataResponse, Operation,
};
use crate::types::*;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Operations the metadata manager serves to nodes.
#[async_trait]
pub trait AuthorityApi: Send + Sync {
    /// Register a node. Returning storage nodes get their recovery report.
    async fn register(&self, registration: Registration)
        -> Result<(NodeId, Option<RecoveryReport>)>;

    async fn heartbeat(&self, heartbeat: Heartbeat) -> Result<Option<RecoveryReport>>;

    async fn volume_layout(&self, client_id: ClientId, volume_id: VolumeId)
        -> Result<VolumeLayout>;

    async fn issue_token(
        &self,
        client_id: ClientId,
        volume_id: VolumeId,
        chunk_id: ChunkId,
        operation: IoOperation,
    ) -> Result<TokenGrant>;

    /// Charge a thin chunk for bytes about to be written. Returns the delta.
    async fn reserve_on_write(&self, chunk_id: ChunkId, bytes: u64) -> Result<u64>;

    async fn report_degraded_write(&self, chunk_id: ChunkId, missed: Vec<NodeId>) -> Result<()>;

    async fn report_io_timeout(&self, node_id: NodeId) -> Result<()>;

    async fn io_ack(&self, ack: IoAck) -> Result<()>;
}

/// Carries token-authorized IO to storage nodes.
#[async_trait]
pub trait DataPlane: Send + Sync {
    async fn write(
        &self,
        node_id: NodeId,
        address: &str,
        token: IoToken,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<()>;

    async fn read(
        &self,
        node_id: NodeId,
        address: &str,
        token: IoToken,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>>;

    async fn discard(&self, node_id: NodeId, address: &str, tokens: Vec<IoToken>) -> Result<()>;
}

/// In-process data plane over registered storage node services.
#[derive(Default)]
pub struct LocalDataPlane {
    nodes: RwLock<HashMap<NodeId, Arc<StorageNodeService>>>,
    unreachable: RwLock<HashSet<NodeId>>,
    delays: RwLock<HashMap<NodeId, Duration>>,
}

impl LocalDataPlane {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn attach(&self, service: Arc<StorageNodeService>) {
        self.nodes.write().insert(service.node_id(), service);
    }

    /// Make a node unreachable (`true`) or reachable again.
    pub fn set_unreachable(&self, node_id: NodeId, unreachable: bool) {
        let mut set = self.unreachable.write();
        if unreachable {
            set.insert(node_id);
        } else {
            set.remove(&node_id);
        }
    }

    /// Delay every request to a node.
    pub fn set_delay(&self, node_id: NodeId, delay: Option<Duration>) {
        let mut delays = self.delays.write();
        match delay {
            Some(delay) => delays.insert(node_id, delay),
            None => delays.remove(&node_id),
        };
    }

    async fn service(&self, node_id: NodeId) -> Result<Arc<StorageNodeService>> {
        let delay = self.delays.read().get(&node_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.unreachable.read().contains(&node_id) {
            return Err(FlexError::Network(format!("storage node {} unreachable", node_id)));
        }
        self.nodes
            .read()
            .get(&node_id)
            .cloned()
            .ok_or_else(|| FlexError::Network(format!("storage node {} unknown", node_id)))
    }
}

#[async_trait]
impl DataPlane for LocalDataPlane {
    async fn write(
        &self,
        node_id: NodeId,
        _address: &str,
        token: IoToken,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<()> {
        self.service(node_id)
            .await?
            .handle_write(&token, offset, &data)
            .map(|_| ())
    }

    async fn read(
        &self,
        node_id: NodeId,
        _address: &str,
        token: IoToken,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>> {
        self.service(node_id)
            .await?
            .handle_read(&token, offset, length)
    }

    async fn discard(&self, node_id: NodeId, _address: &str, tokens: Vec<IoToken>) -> Result<()> {
        self.service(node_id).await?.discard(&tokens).map(|_| ())
    }
}

/// Data plane over TCP, one connection per storage node address.
pub struct TcpDataPlane {
    connections: Mutex<HashMap<String, Arc<Connection>>>,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl TcpDataPlane {
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            connect_timeout,
            request_timeout,
        }
    }

    fn connection(&self, address: &str) -> Arc<Connection> {
        let mut connections = self.connections.lock();
        let connection = connections.entry(address.to_string()).or_insert_with(|| {
            Arc::new(Connection::with_timeouts(
                address,
                self.connect_timeout,
                self.request_timeout,
            ))
        });
        Arc::clone(connection)
    }

    async fn call(&self, address: &str, request: DataRequest) -> Result<DataResponse> {
        match self.connection(address).call(request).await? {
            DataResponse::Error(wire) => Err(FlexError::from_wire(wire)),
            response => Ok(response),
        }
    }
}

impl Default for TcpDataPlane {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(30))
    }
}

fn unexpected(operation: &str) -> FlexError {
    FlexError::Protocol(format!("unexpected response {}", operation))
}

#[async_trait]
impl DataPlane for TcpDataPlane {
    async fn write(
        &self,
        _node_id: NodeId,
        address: &str,
        token: IoToken,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<()> {
        match self
            .call(address, DataRequest::Write { token, offset, data })
            .await?
        {
            DataResponse::Written { .. } => Ok(()),
            other => Err(unexpected(other.operation())),
        }
    }

    async fn read(
        &self,
        _node_id: NodeId,
        address: &str,
        token: IoToken,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>> {
        match self
            .call(address, DataRequest::Read { token, offset, length })
            .await?
        {
            DataResponse::Data(data) => Ok(data),
            other => Err(unexpected(other.operation())),
        }
    }

    async fn discard(&self, _node_id: NodeId, address: &str, tokens: Vec<IoToken>) -> Result<()> {
        match self.call(address, DataRequest::Discard { tokens }).await? {
            DataResponse::Discarded { .. } => Ok(()),
            other => Err(unexpected(other.operation())),
        }
    }
}

/// The metadata manager reached over its control channel.
pub struct RemoteAuthority {
    connection: Connection,
}

impl RemoteAuthority {
    pub fn new(
        addr: impl Into<String>,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            connection: Connection::with_timeouts(addr, connect_timeout, request_timeout),
        }
    }

    pub fn addr(&self) -> &str {
        self.connection.addr()
    }

    async fn call(&self, request: ControlRequest) -> Result<ControlResponse> {
        match self.connection.call(request).await? {
            ControlResponse::Error(wire) => Err(FlexError::from_wire(wire)),
            response => Ok(response),
        }
    }

    async fn call_ok(&self, request: ControlRequest) -> Result<()> {
        match self.call(request).await? {
            ControlResponse::Ok => Ok(()),
            other => Err(unexpected(other.operation())),
        }
    }
}

#[async_trait]
impl AuthorityApi for RemoteAuthority {
    async fn register(
        &self,
        registration: Registration,
    ) -> Result<(NodeId, Option<RecoveryReport>)> {
        match self.call(ControlRequest::Register(registration)).await? {
            ControlResponse::Registered { node_id, recovery } => Ok((node_id, recovery)),
            other => Err(unexpected(other.operation())),
        }
    }

    async fn heartbeat(&self, heartbeat: Heartbeat) -> Result<Option<RecoveryReport>> {
        match self.call(ControlRequest::Heartbeat(heartbeat)).await? {
            ControlResponse::HeartbeatAck { recovery } => Ok(recovery),
            other => Err(unexpected(other.operation())),
        }
    }

    async fn volume_layout(
        &self,
        client_id: ClientId,
        volume_id: VolumeId,
    ) -> Result<VolumeLayout> {
        match self
            .call(ControlRequest::VolumeLayout {
                client_id,
                volume_id,
            })
            .await?
        {
            ControlResponse::Layout(layout) => Ok(layout),
            other => Err(unexpected(other.operation())),
        }
    }

    async fn issue_token(
        &self,
        client_id: ClientId,
        volume_id: VolumeId,
        chunk_id: ChunkId,
        operation: IoOperation,
    ) -> Result<TokenGrant> {
        match self
            .call(ControlRequest::IssueToken {
                client_id,
                volume_id,
                chunk_id,
                operation,
            })
            .await?
        {
            ControlResponse::Token(grant) => Ok(grant),
            other => Err(unexpected(other.operation())),
        }
    }

    async fn reserve_on_write(&self, chunk_id: ChunkId, bytes: u64) -> Result<u64> {
        match self
            .call(ControlRequest::ReserveOnWrite { chunk_id, bytes })
            .await?
        {
            ControlResponse::Reserved { bytes } => Ok(bytes),
            other => Err(unexpected(other.operation())),
        }
    }

    async fn report_degraded_write(&self, chunk_id: ChunkId, missed: Vec<NodeId>) -> Result<()> {
        self.call_ok(ControlRequest::ReportDegradedWrite { chunk_id, missed })
            .await
    }

    async fn report_io_timeout(&self, node_id: NodeId) -> Result<()> {
        self.call_ok(ControlRequest::ReportIoTimeout { node_id }).await
    }

    async fn io_ack(&self, ack: IoAck) -> Result<()> {
        self.call_ok(ControlRequest::IoAck(ack)).await
    }
}
