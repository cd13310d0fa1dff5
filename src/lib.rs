//! flexblock - replicated block storage.
//!
//! A flexblock cluster pools the local disks of storage nodes into
//! replicated volumes that client hosts read and write directly.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Metadata manager: Token Authority | Placement | Rebuild    │
//! │                    Health Tracker  | Metrics   | Admin API  │
//! ├──────────────────────── control channel ────────────────────┤
//! │  Client initiator          │  Storage node service          │
//! │  (split, route, failover)  │  (token check, chunk store)    │
//! └──────────────────────── data channel ───────────────────────┘
//! ```
//!
//! The manager never sits on the data path: clients fetch a signed token per
//! chunk and send IO straight to the replica holders.
//!
//! # Quick Start
//!
//! ```no_run
//! use flexblock::config::FlexConfig;
//!
//! #[tokio::main]
//! async fn main() -> flexblock::Result<()> {
//!     let config = FlexConfig::development();
//!     flexblock::run(config).await
//! }
//! ```

pub mod config;
pub mod error;
pub mod types;

pub mod auth;
pub mod cluster;
pub mod data;
pub mod events;
pub mod metadata;
pub mod protocol;
pub mod ratelimit;
pub mod shutdown;

pub mod cli;
pub mod client;
pub mod observability;

// Re-exports
pub use error::{FlexError, Result};
pub use types::*;

use auth::TokenSigner;
use client::{AuthorityApi, RemoteAuthority, TcpDataPlane};
use config::{FlexConfig, NodeRole};
use data::{ChunkStore, DataServer, StorageNodeService};
use metadata::{ControlServer, MetadataManager};
use shutdown::{ShutdownCoordinator, SignalHandler};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Attempts to reach the metadata manager before giving up at startup.
const REGISTER_ATTEMPTS: u32 = 10;

/// Run a flexblock process in the role named by the configuration.
pub async fn run(config: FlexConfig) -> Result<()> {
    observability::init(&config.observability)?;
    config.validate()?;

    info!(
        node = %config.node.name,
        role = ?config.node.role,
        "Starting flexblock node"
    );

    let coordinator = ShutdownCoordinator::new();

    let signal_coordinator = coordinator.clone();
    tokio::spawn(async move {
        SignalHandler::new(signal_coordinator).run().await;
    });

    let mut handles = match config.node.role {
        NodeRole::Mdm => start_mdm(&config, &coordinator).await?,
        NodeRole::Sds => start_sds(&config, &coordinator).await?,
        NodeRole::Sdc => start_sdc(&config, &coordinator).await?,
    };

    if config.observability.metrics_enabled {
        let addr = config.observability.metrics_addr;
        handles.push(spawn_logged(
            "metrics",
            observability::run_metrics_server(addr, coordinator.subscribe()),
        ));
    }

    coordinator.wait_for_shutdown().await;
    info!("Shutting down flexblock gracefully");

    coordinator.drain(handles).await;

    info!("flexblock shutdown complete");
    Ok(())
}

fn spawn_logged<F>(service: &'static str, task: F) -> JoinHandle<()>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = task.await {
            error!(service, error = %e, "Service failed");
        }
    })
}

async fn start_mdm(
    config: &FlexConfig,
    coordinator: &ShutdownCoordinator,
) -> Result<Vec<JoinHandle<()>>> {
    let signer = TokenSigner::new(&config.security.token_secret)?;
    let data_plane = Arc::new(TcpDataPlane::new(
        config.network.connect_timeout,
        config.network.request_timeout,
    ));
    let manager = MetadataManager::new(&config.mdm, signer, data_plane);

    let control = ControlServer::bind(config.mdm.control_addr, Arc::clone(&manager)).await?;
    let mut handles = vec![
        spawn_logged("control", control.run(coordinator.subscribe())),
        spawn_logged(
            "admin",
            metadata::run_admin_server(
                config.mdm.admin_addr,
                Arc::clone(&manager),
                coordinator.subscribe(),
            ),
        ),
    ];
    handles.extend(manager.spawn_background(coordinator.sender()));
    Ok(handles)
}

async fn start_sds(
    config: &FlexConfig,
    coordinator: &ShutdownCoordinator,
) -> Result<Vec<JoinHandle<()>>> {
    std::fs::create_dir_all(&config.storage.data_dir)?;

    let signer = TokenSigner::new(&config.security.token_secret)?;
    let store = Arc::new(ChunkStore::new(
        &config.storage.data_dir,
        config.storage.cache_size,
    )?);
    let authority: Arc<dyn AuthorityApi> = Arc::new(RemoteAuthority::new(
        config.sds.mdm_addr.clone(),
        config.network.connect_timeout,
        config.network.request_timeout,
    ));
    let service = Arc::new(
        StorageNodeService::new(config.node.id, store, signer).with_acks(Arc::clone(&authority)),
    );

    let server = DataServer::bind(config.sds.data_addr, Arc::clone(&service)).await?;
    let address = match &config.sds.advertise_addr {
        Some(addr) => addr.clone(),
        None => server.local_addr()?.to_string(),
    };

    let registration = Registration {
        node_id: config.node.id,
        name: config.node.name.clone(),
        capabilities: config.node.role.capabilities(),
        address: Some(address),
        capacity: config.sds.capacity,
        pool_id: Some(config.sds.pool_id),
        fault_set: config.sds.fault_set.clone(),
    };
    register_with_retry(coordinator, || {
        let service = Arc::clone(&service);
        let authority = Arc::clone(&authority);
        let registration = registration.clone();
        async move { service.register(authority.as_ref(), registration).await }
    })
    .await?;

    Ok(vec![
        spawn_logged("data", server.run(coordinator.subscribe())),
        tokio::spawn(Arc::clone(&service).run_heartbeat(
            authority,
            config.sds.heartbeat_interval,
            coordinator.subscribe(),
        )),
    ])
}

async fn start_sdc(
    config: &FlexConfig,
    coordinator: &ShutdownCoordinator,
) -> Result<Vec<JoinHandle<()>>> {
    let authority: Arc<dyn AuthorityApi> = Arc::new(RemoteAuthority::new(
        config.sdc.mdm_addr.clone(),
        config.network.connect_timeout,
        config.network.request_timeout,
    ));

    let registration = Registration {
        node_id: config.node.id,
        name: config.node.name.clone(),
        capabilities: config.node.role.capabilities(),
        address: None,
        capacity: 0,
        pool_id: None,
        fault_set: None,
    };
    let client_id = register_with_retry(coordinator, || {
        let authority = Arc::clone(&authority);
        let registration = registration.clone();
        async move { authority.register(registration).await.map(|(id, _)| id) }
    })
    .await?;

    let interval = config.sdc.heartbeat_interval;
    let mut shutdown_rx = coordinator.subscribe();
    Ok(vec![tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let heartbeat = Heartbeat {
                        node_id: client_id,
                        capabilities: vec![Capability::Sdc],
                        timestamp_ms: now_millis(),
                    };
                    if let Err(e) = authority.heartbeat(heartbeat).await {
                        warn!(client_id, error = %e, "Heartbeat failed");
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    })])
}

/// Register with the manager, retrying while it is unreachable.
async fn register_with_retry<F, Fut>(
    coordinator: &ShutdownCoordinator,
    mut attempt: F,
) -> Result<NodeId>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<NodeId>>,
{
    let mut delay = Duration::from_millis(500);
    for n in 1..=REGISTER_ATTEMPTS {
        match attempt().await {
            Ok(node_id) => return Ok(node_id),
            Err(e) if e.is_retryable() && n < REGISTER_ATTEMPTS => {
                warn!(attempt = n, error = %e, "Registration failed, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = coordinator.wait_for_shutdown() => {
                        return Err(FlexError::Network("shutdown during registration".into()));
                    }
                }
                delay = (delay * 2).min(Duration::from_secs(10));
            }
            Err(e) => return Err(e),
        }
    }
    Err(FlexError::Network("metadata manager unreachable".into()))
}
