//! Network surfaces of the metadata manager: the framed control channel
//! used by storage and client nodes, and the JSON admin API.

use super::manager::{CreatePool, CreateVolume, MetadataManager};
use crate::cluster::ClusterSnapshot;
use crate::error::{FlexError, Result};
use crate::events::{Event, EventFilter, EventType};
use crate::protocol::{
    read_frame, write_frame, ControlRequest, ControlResponse, Envelope, Operation,
};
use crate::types::*;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Accepts control-channel connections for a metadata manager.
pub struct ControlServer {
    listener: TcpListener,
    manager: Arc<MetadataManager>,
}

impl ControlServer {
    pub async fn bind(addr: SocketAddr, manager: Arc<MetadataManager>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| FlexError::Network(format!("Failed to bind {}: {}", addr, e)))?;
        Ok(Self { listener, manager })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve connections until shutdown.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let addr = self.local_addr()?;
        info!(addr = %addr, "Control server listening");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "New control connection");
                        let manager = Arc::clone(&self.manager);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, manager).await {
                                warn!(peer = %peer, error = %e, "Control connection error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "Accept error"),
                },
                _ = shutdown_rx.recv() => {
                    info!(addr = %addr, "Control server shutting down");
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream, manager: Arc<MetadataManager>) -> Result<()> {
    stream.set_nodelay(true)?;
    while let Some(envelope) = read_frame::<_, ControlRequest>(&mut stream).await? {
        let response = dispatch_control(&manager, envelope.body).await;
        let reply = Envelope::new(envelope.request_id, response.operation(), response);
        write_frame(&mut stream, &reply).await?;
    }
    debug!("Control connection closed");
    Ok(())
}

/// Execute one control request.
pub async fn dispatch_control(
    manager: &MetadataManager,
    request: ControlRequest,
) -> ControlResponse {
    let result = match request {
        ControlRequest::Register(registration) => manager
            .register(registration)
            .await
            .map(|(node_id, recovery)| ControlResponse::Registered { node_id, recovery }),
        ControlRequest::Heartbeat(heartbeat) => manager
            .heartbeat(heartbeat)
            .await
            .map(|recovery| ControlResponse::HeartbeatAck { recovery }),
        ControlRequest::IssueToken {
            client_id,
            volume_id,
            chunk_id,
            operation,
        } => manager
            .authority()
            .issue_token(client_id, volume_id, chunk_id, operation)
            .map(ControlResponse::Token),
        ControlRequest::VolumeLayout {
            client_id,
            volume_id,
        } => manager
            .authority()
            .volume_layout(client_id, volume_id)
            .map(ControlResponse::Layout),
        ControlRequest::ReserveOnWrite { chunk_id, bytes } => {
            crate::client::AuthorityApi::reserve_on_write(manager, chunk_id, bytes)
                .await
                .map(|bytes| ControlResponse::Reserved { bytes })
        }
        ControlRequest::ReportDegradedWrite { chunk_id, missed } => manager
            .rebuild()
            .report_degraded_write(chunk_id, &missed)
            .await
            .map(|_| ControlResponse::Ok),
        ControlRequest::ReportIoTimeout { node_id } => manager
            .report_io_timeout(node_id)
            .await
            .map(|_| ControlResponse::Ok),
        ControlRequest::IoAck(ack) => {
            manager.io_ack(&ack);
            Ok(ControlResponse::Ok)
        }
    };
    result.unwrap_or_else(|e| ControlResponse::Error(e.to_wire()))
}

/// [`FlexError`] as an HTTP response.
pub struct ApiError(FlexError);

impl From<FlexError> for ApiError {
    fn from(e: FlexError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            warn!(error = %self.0, "Admin request failed");
        }
        (status, Json(self.0.to_wire())).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Serialize, Deserialize)]
pub struct CreateDomainRequest {
    pub name: String,
}

#[derive(Serialize, Deserialize)]
pub struct RebuildRateRequest {
    pub rate_mbps: u64,
}

#[derive(Serialize, Deserialize)]
pub struct ExtendVolumeRequest {
    pub size: u64,
}

#[derive(Serialize, Deserialize)]
pub struct MapVolumeRequest {
    pub client_id: ClientId,
    pub access_mode: AccessMode,
}

#[derive(Serialize, Deserialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

#[derive(Serialize, Deserialize)]
pub struct FailResponse {
    /// False if the node was already DOWN.
    pub failed: bool,
}

#[derive(Deserialize, Default)]
struct SnapshotQuery {
    #[serde(default)]
    fresh: bool,
}

#[derive(Deserialize)]
struct EventsQuery {
    #[serde(default = "default_event_limit")]
    limit: usize,
    pool: Option<PoolId>,
    node: Option<NodeId>,
    #[serde(default)]
    rebuild_only: bool,
}

fn default_event_limit() -> usize {
    100
}

/// Build the admin API router.
pub fn admin_router(manager: Arc<MetadataManager>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/snapshot", get(get_snapshot))
        .route("/events", get(get_events))
        .route("/domains", get(list_domains).post(create_domain))
        .route("/domains/:id", delete(delete_domain))
        .route("/pools", get(list_pools).post(create_pool))
        .route("/pools/:id", get(get_pool).delete(delete_pool))
        .route("/pools/:id/rebuild", get(get_rebuild).post(start_rebuild))
        .route("/pools/:id/rebuild/cancel", post(cancel_rebuild))
        .route("/pools/:id/rebuild-rate", put(set_rebuild_rate))
        .route("/nodes", get(list_nodes))
        .route("/nodes/:id", get(get_node).delete(remove_node))
        .route("/nodes/:id/fail", post(fail_node))
        .route("/nodes/:id/recover", post(recover_node))
        .route("/clients", get(list_clients))
        .route("/volumes", get(list_volumes).post(create_volume))
        .route("/volumes/:id", get(get_volume).delete(delete_volume))
        .route("/volumes/:id/extend", post(extend_volume))
        .route("/volumes/:id/map", post(map_volume))
        .route("/volumes/:id/map/:client_id", delete(unmap_volume))
        .route("/mappings", get(list_mappings))
        .with_state(manager)
}

/// Serve the admin API until shutdown.
pub async fn run_admin_server(
    addr: SocketAddr,
    manager: Arc<MetadataManager>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Admin API listening");

    axum::serve(listener, admin_router(manager))
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await
        .map_err(|e| FlexError::Network(e.to_string()))?;

    info!("Admin API stopped");
    Ok(())
}

type Manager = State<Arc<MetadataManager>>;

async fn health_check() -> &'static str {
    "OK"
}

async fn get_snapshot(
    State(manager): Manager,
    Query(query): Query<SnapshotQuery>,
) -> Json<ClusterSnapshot> {
    let snapshot = if query.fresh {
        manager.refresh_snapshot()
    } else {
        manager.snapshot()
    };
    Json(snapshot.as_ref().clone())
}

async fn get_events(State(manager): Manager, Query(query): Query<EventsQuery>) -> Json<Vec<Event>> {
    let mut filter = EventFilter::new();
    if let Some(pool_id) = query.pool {
        filter = filter.pool(pool_id);
    }
    if let Some(node_id) = query.node {
        filter = filter.node(node_id);
    }
    if query.rebuild_only {
        filter = filter.event_types([
            EventType::RebuildStarted,
            EventType::RebuildProgress,
            EventType::RebuildStalled,
            EventType::RebuildComplete,
            EventType::RebuildCancelled,
            EventType::RebuildFailed,
        ]);
    }
    Json(manager.query_events(&filter, query.limit))
}

async fn list_domains(State(manager): Manager) -> Json<Vec<ProtectionDomain>> {
    Json(manager.list_protection_domains())
}

async fn create_domain(
    State(manager): Manager,
    Json(request): Json<CreateDomainRequest>,
) -> ApiResult<(StatusCode, Json<ProtectionDomain>)> {
    let domain = manager.create_protection_domain(&request.name)?;
    Ok((StatusCode::CREATED, Json(domain)))
}

async fn delete_domain(
    State(manager): Manager,
    Path(id): Path<ProtectionDomainId>,
) -> ApiResult<StatusCode> {
    manager.delete_protection_domain(id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_pools(State(manager): Manager) -> Json<Vec<Pool>> {
    Json(manager.list_pools())
}

async fn create_pool(
    State(manager): Manager,
    Json(request): Json<CreatePool>,
) -> ApiResult<(StatusCode, Json<Pool>)> {
    let pool = manager.create_pool(request)?;
    Ok((StatusCode::CREATED, Json(pool)))
}

async fn get_pool(State(manager): Manager, Path(id): Path<PoolId>) -> ApiResult<Json<Pool>> {
    Ok(Json(manager.get_pool(id)?))
}

async fn delete_pool(State(manager): Manager, Path(id): Path<PoolId>) -> ApiResult<StatusCode> {
    manager.delete_pool(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_rebuild(
    State(manager): Manager,
    Path(id): Path<PoolId>,
) -> ApiResult<Json<Option<RebuildJob>>> {
    Ok(Json(manager.rebuild_job(id)?))
}

async fn start_rebuild(
    State(manager): Manager,
    Path(id): Path<PoolId>,
) -> ApiResult<Json<Option<RebuildJob>>> {
    Ok(Json(manager.start_rebuild(id).await?))
}

async fn cancel_rebuild(
    State(manager): Manager,
    Path(id): Path<PoolId>,
) -> ApiResult<Json<CancelResponse>> {
    let cancelled = manager.cancel_rebuild(id).await?;
    Ok(Json(CancelResponse { cancelled }))
}

async fn set_rebuild_rate(
    State(manager): Manager,
    Path(id): Path<PoolId>,
    Json(request): Json<RebuildRateRequest>,
) -> ApiResult<StatusCode> {
    manager.set_rebuild_rate(id, request.rate_mbps)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_nodes(State(manager): Manager) -> Json<Vec<StorageNode>> {
    Json(manager.list_storage_nodes())
}

async fn get_node(State(manager): Manager, Path(id): Path<NodeId>) -> ApiResult<Json<StorageNode>> {
    Ok(Json(manager.get_storage_node(id)?))
}

async fn remove_node(State(manager): Manager, Path(id): Path<NodeId>) -> ApiResult<StatusCode> {
    manager.remove_storage_node(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn fail_node(
    State(manager): Manager,
    Path(id): Path<NodeId>,
) -> ApiResult<Json<FailResponse>> {
    let failed = manager.fail_node(id).await?;
    Ok(Json(FailResponse { failed }))
}

async fn recover_node(
    State(manager): Manager,
    Path(id): Path<NodeId>,
) -> ApiResult<Json<RecoveryReport>> {
    Ok(Json(manager.recover_node(id).await?))
}

async fn list_clients(State(manager): Manager) -> Json<Vec<ClientNode>> {
    Json(manager.list_clients())
}

async fn list_volumes(State(manager): Manager) -> Json<Vec<Volume>> {
    Json(manager.list_volumes())
}

async fn create_volume(
    State(manager): Manager,
    Json(request): Json<CreateVolume>,
) -> ApiResult<(StatusCode, Json<Volume>)> {
    let volume = manager.create_volume(request).await?;
    Ok((StatusCode::CREATED, Json(volume)))
}

async fn get_volume(State(manager): Manager, Path(id): Path<VolumeId>) -> ApiResult<Json<Volume>> {
    Ok(Json(manager.get_volume(id)?))
}

async fn delete_volume(State(manager): Manager, Path(id): Path<VolumeId>) -> ApiResult<StatusCode> {
    manager.delete_volume(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn extend_volume(
    State(manager): Manager,
    Path(id): Path<VolumeId>,
    Json(request): Json<ExtendVolumeRequest>,
) -> ApiResult<Json<Volume>> {
    Ok(Json(manager.extend_volume(id, request.size).await?))
}

async fn map_volume(
    State(manager): Manager,
    Path(id): Path<VolumeId>,
    Json(request): Json<MapVolumeRequest>,
) -> ApiResult<(StatusCode, Json<VolumeMapping>)> {
    let mapping = manager.map_volume(id, request.client_id, request.access_mode)?;
    Ok((StatusCode::CREATED, Json(mapping)))
}

async fn unmap_volume(
    State(manager): Manager,
    Path((id, client_id)): Path<(VolumeId, ClientId)>,
) -> ApiResult<StatusCode> {
    manager.unmap_volume(id, client_id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_mappings(State(manager): Manager) -> Json<Vec<VolumeMapping>> {
    Json(manager.list_mappings())
}
