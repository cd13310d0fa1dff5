//! Networked integration tests
//!
//! A metadata manager, storage nodes and a client initiator talking over
//! loopback TCP: the framed control and data channels plus the admin API.

#[allow(dead_code)]
mod common;

use common::{find_available_port, TestDataGenerator, TestEnv, SECRET};
use flexblock::auth::TokenSigner;
use flexblock::client::{
    AdminClient, AuthorityApi, Initiator, InitiatorConfig, RemoteAuthority, TcpDataPlane,
};
use flexblock::config::MdmConfig;
use flexblock::data::{ChunkStore, DataServer, StorageNodeService};
use flexblock::metadata::{
    run_admin_server, ControlServer, CreatePool, CreateVolume, MetadataManager,
};
use flexblock::types::*;
use flexblock::FlexError;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

struct NetCluster {
    env: TestEnv,
    manager: Arc<MetadataManager>,
    control_addr: SocketAddr,
    admin: AdminClient,
    shutdown_tx: broadcast::Sender<()>,
}

impl NetCluster {
    async fn start() -> Self {
        let env = TestEnv::new();
        let (shutdown_tx, _) = broadcast::channel(4);
        let signer = TokenSigner::new(SECRET).unwrap();
        let data_plane = Arc::new(TcpDataPlane::new(CONNECT_TIMEOUT, REQUEST_TIMEOUT));
        let manager = MetadataManager::new(&MdmConfig::default(), signer, data_plane);

        let control = ControlServer::bind("127.0.0.1:0".parse().unwrap(), Arc::clone(&manager))
            .await
            .unwrap();
        let control_addr = control.local_addr().unwrap();
        tokio::spawn(control.run(shutdown_tx.subscribe()));

        let admin_addr: SocketAddr = format!("127.0.0.1:{}", find_available_port())
            .parse()
            .unwrap();
        tokio::spawn(run_admin_server(
            admin_addr,
            Arc::clone(&manager),
            shutdown_tx.subscribe(),
        ));
        let admin =
            AdminClient::with_timeouts(&admin_addr.to_string(), CONNECT_TIMEOUT, REQUEST_TIMEOUT);
        for _ in 0..50 {
            if admin.health().await.unwrap_or(false) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        Self {
            env,
            manager,
            control_addr,
            admin,
            shutdown_tx,
        }
    }

    fn remote_authority(&self) -> Arc<dyn AuthorityApi> {
        Arc::new(RemoteAuthority::new(
            self.control_addr.to_string(),
            CONNECT_TIMEOUT,
            REQUEST_TIMEOUT,
        ))
    }

    /// Start a storage node process-equivalent and register it over TCP.
    async fn start_sds(&self, node_id: NodeId, pool_id: PoolId) -> Arc<StorageNodeService> {
        let dir = self.env.subdir(&format!("sds-{}", node_id));
        let store = Arc::new(ChunkStore::new(dir, 8 * MIB as usize).unwrap());
        let authority = self.remote_authority();
        let service = Arc::new(
            StorageNodeService::new(node_id, store, TokenSigner::new(SECRET).unwrap())
                .with_acks(Arc::clone(&authority)),
        );
        let server = DataServer::bind("127.0.0.1:0".parse().unwrap(), Arc::clone(&service))
            .await
            .unwrap();
        let address = server.local_addr().unwrap().to_string();
        tokio::spawn(server.run(self.shutdown_tx.subscribe()));

        service
            .register(
                authority.as_ref(),
                Registration {
                    node_id,
                    name: format!("sds-{}", node_id),
                    capabilities: vec![Capability::Sds],
                    address: Some(address),
                    capacity: 10 * GB,
                    pool_id: Some(pool_id),
                    fault_set: None,
                },
            )
            .await
            .unwrap();
        service
    }

    async fn initiator(&self, client_id: ClientId) -> Initiator {
        let authority = self.remote_authority();
        let (id, report) = authority
            .register(Registration {
                node_id: client_id,
                name: format!("sdc-{}", client_id),
                capabilities: vec![Capability::Sdc],
                address: None,
                capacity: 0,
                pool_id: None,
                fault_set: None,
            })
            .await
            .unwrap();
        assert_eq!(id, client_id);
        assert!(report.is_none());
        Initiator::new(
            client_id,
            authority,
            Arc::new(TcpDataPlane::new(CONNECT_TIMEOUT, REQUEST_TIMEOUT)),
            InitiatorConfig::default(),
        )
    }
}

impl Drop for NetCluster {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

#[tokio::test]
async fn test_admin_api_builds_cluster() {
    let cluster = NetCluster::start().await;
    let admin = &cluster.admin;
    assert!(admin.health().await.unwrap());

    let domain = admin.create_protection_domain("pd1").await.unwrap();
    let pool = admin
        .create_pool(&CreatePool {
            protection_domain_id: domain.id,
            name: "pool1".into(),
            total_capacity: 2 * GB,
            reserved_capacity: 0,
            copies: None,
            rebuild_rate_mbps: None,
        })
        .await
        .unwrap();
    assert_eq!(pool.copies, DEFAULT_COPIES);

    // Duplicate names come back as typed errors.
    let err = admin.create_protection_domain("pd1").await.unwrap_err();
    assert!(matches!(err, FlexError::AlreadyExists(_)));

    cluster.start_sds(1, pool.id).await;
    cluster.start_sds(2, pool.id).await;
    assert_eq!(admin.list_storage_nodes().await.unwrap().len(), 2);

    let volume = admin
        .create_volume(&CreateVolume {
            pool_id: pool.id,
            name: "db".into(),
            size: 800 * MB,
            provisioning: Provisioning::Thick,
        })
        .await
        .unwrap();
    assert_eq!(volume.chunks.len(), 191);

    let err = admin
        .create_volume(&CreateVolume {
            pool_id: pool.id,
            name: "too-big".into(),
            size: 1_500 * MB,
            provisioning: Provisioning::Thick,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, FlexError::InsufficientCapacity(_)));

    let snapshot = admin.snapshot(true).await.unwrap();
    let pool_view = snapshot.pool(pool.id).unwrap();
    assert!((pool_view.used_capacity_gb - 0.8).abs() < 1e-9);
    assert_eq!(pool_view.volume_count, 1);
    assert_eq!(snapshot.nodes.len(), 2);

    let events = admin.events(100, Some(pool.id)).await.unwrap();
    assert!(!events.is_empty());

    // A mapped volume cannot be deleted.
    cluster.initiator(100).await;
    admin
        .map_volume(volume.id, 100, AccessMode::ReadWrite)
        .await
        .unwrap();
    let err = admin.delete_volume(volume.id).await.unwrap_err();
    assert!(matches!(err, FlexError::VolumeInUse(_)));
    admin.unmap_volume(volume.id, 100).await.unwrap();
    admin.delete_volume(volume.id).await.unwrap();
    assert!(admin.list_volumes().await.unwrap().is_empty());
    assert_eq!(admin.get_pool(pool.id).await.unwrap().used_capacity, 0);
}

#[tokio::test]
async fn test_io_over_tcp() {
    let cluster = NetCluster::start().await;
    let domain = cluster.manager.create_protection_domain("pd1").unwrap();
    let pool = cluster
        .manager
        .create_pool(CreatePool {
            protection_domain_id: domain.id,
            name: "pool1".into(),
            total_capacity: 10 * GB,
            reserved_capacity: 0,
            copies: None,
            rebuild_rate_mbps: None,
        })
        .unwrap();
    for node_id in 1..=3 {
        cluster.start_sds(node_id, pool.id).await;
    }

    let initiator = cluster.initiator(100).await;
    let volume = cluster
        .manager
        .create_volume(CreateVolume {
            pool_id: pool.id,
            name: "net".into(),
            size: 3 * CHUNK_SIZE,
            provisioning: Provisioning::Thin,
        })
        .await
        .unwrap();
    cluster
        .manager
        .map_volume(volume.id, 100, AccessMode::ReadWrite)
        .unwrap();

    let data = TestDataGenerator::new(3).random_bytes(CHUNK_SIZE as usize + 4096);
    let offset = CHUNK_SIZE / 2;
    let result = initiator.write(volume.id, offset, &data).await.unwrap();
    assert!(result.degraded_chunks.is_empty());

    let read = initiator
        .read(volume.id, offset, data.len() as u64)
        .await
        .unwrap();
    assert_eq!(read, data);

    // Thin capacity was charged through the control channel, up to the
    // high-water mark of each chunk.
    let used = cluster.manager.get_volume(volume.id).unwrap().used_capacity;
    assert_eq!(used, CHUNK_SIZE + CHUNK_SIZE / 2 + 4096);

    // Errors keep their kind across the wire.
    let stranger = cluster.initiator(200).await;
    let err = stranger.read(volume.id, 0, 16).await.unwrap_err();
    assert!(matches!(err, FlexError::AccessDenied(_)));
}

#[tokio::test]
async fn test_admin_fail_and_recover_node() {
    let cluster = NetCluster::start().await;
    let admin = &cluster.admin;
    let domain = admin.create_protection_domain("pd1").await.unwrap();
    let pool = admin
        .create_pool(&CreatePool {
            protection_domain_id: domain.id,
            name: "pool1".into(),
            total_capacity: 10 * GB,
            reserved_capacity: 0,
            copies: None,
            rebuild_rate_mbps: Some(1),
        })
        .await
        .unwrap();
    for node_id in 1..=3 {
        cluster.start_sds(node_id, pool.id).await;
    }
    admin
        .create_volume(&CreateVolume {
            pool_id: pool.id,
            name: "v".into(),
            size: 4 * CHUNK_SIZE,
            provisioning: Provisioning::Thick,
        })
        .await
        .unwrap();

    assert!(admin.fail_node(1).await.unwrap());
    assert!(!admin.fail_node(1).await.unwrap());
    let job = admin.rebuild_status(pool.id).await.unwrap().unwrap();
    assert!(job.state.is_active());
    assert_eq!(admin.get_pool(pool.id).await.unwrap().health, PoolHealth::Degraded);

    let report = admin.recover_node(1).await.unwrap();
    assert!(!report.healed.is_empty());
    assert!(report.lost.is_empty());
    assert_eq!(admin.get_pool(pool.id).await.unwrap().health, PoolHealth::Ok);

    admin.set_rebuild_rate(pool.id, 50).await.unwrap();
    assert_eq!(
        admin.get_pool(pool.id).await.unwrap().rebuild_rate_limit_mbps,
        50
    );
}
