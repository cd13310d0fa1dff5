//! Common test utilities for integration tests.

use flexblock::auth::TokenSigner;
use flexblock::client::{AuthorityApi, Initiator, InitiatorConfig, LocalDataPlane};
use flexblock::config::MdmConfig;
use flexblock::data::{ChunkStore, StorageNodeService};
use flexblock::metadata::{CreatePool, CreateVolume, MetadataManager};
use flexblock::types::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;

pub const SECRET: &str = "integration-test-secret-integration-test";

/// Find an available port for testing.
pub fn find_available_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind to port");
    listener.local_addr().unwrap().port()
}

/// Test environment that manages temporary directories and cleanup.
pub struct TestEnv {
    pub temp_dir: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        Self { temp_dir }
    }

    /// Creates a sub-directory in the temp dir
    pub fn subdir(&self, name: &str) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        std::fs::create_dir_all(&path).expect("Failed to create subdir");
        path
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// Deterministic random data generator for reproducible tests
pub struct TestDataGenerator {
    rng: StdRng,
}

impl TestDataGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn random_bytes(&mut self, len: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; len];
        self.rng.fill(&mut bytes[..]);
        bytes
    }
}

/// Builder for an in-process cluster: one manager, N storage nodes.
pub struct ClusterBuilder {
    nodes: u64,
    node_capacity: u64,
    pool_capacity: u64,
    copies: Option<usize>,
    rebuild_rate_mbps: Option<u64>,
    mdm: MdmConfig,
}

impl ClusterBuilder {
    pub fn new() -> Self {
        Self {
            nodes: 3,
            node_capacity: 10 * GB,
            pool_capacity: 10 * GB,
            copies: None,
            rebuild_rate_mbps: None,
            mdm: MdmConfig {
                rebuild_poll_interval: Duration::from_millis(100),
                ..MdmConfig::default()
            },
        }
    }

    pub fn nodes(mut self, nodes: u64) -> Self {
        self.nodes = nodes;
        self
    }

    pub fn node_capacity(mut self, capacity: u64) -> Self {
        self.node_capacity = capacity;
        self
    }

    pub fn pool_capacity(mut self, capacity: u64) -> Self {
        self.pool_capacity = capacity;
        self
    }

    pub fn copies(mut self, copies: usize) -> Self {
        self.copies = Some(copies);
        self
    }

    pub fn rebuild_rate(mut self, rate_mbps: u64) -> Self {
        self.rebuild_rate_mbps = Some(rate_mbps);
        self
    }

    pub async fn build(self) -> TestCluster {
        let env = TestEnv::new();
        let signer = TokenSigner::new(SECRET).unwrap();
        let data_plane = LocalDataPlane::new();
        let manager = MetadataManager::new(&self.mdm, signer.clone(), data_plane.clone());

        let domain = manager.create_protection_domain("pd1").unwrap();
        let pool = manager
            .create_pool(CreatePool {
                protection_domain_id: domain.id,
                name: "pool1".into(),
                total_capacity: self.pool_capacity,
                reserved_capacity: 0,
                copies: self.copies,
                rebuild_rate_mbps: self.rebuild_rate_mbps,
            })
            .unwrap();

        let (shutdown_tx, _) = broadcast::channel(1);
        let mut cluster = TestCluster {
            env,
            signer,
            manager,
            data_plane,
            nodes: BTreeMap::new(),
            pool_id: pool.id,
            node_capacity: self.node_capacity,
            shutdown_tx,
        };
        for node_id in 1..=self.nodes {
            cluster.add_node(node_id).await;
        }
        cluster
    }
}

impl Default for ClusterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// An in-process cluster wired over `LocalDataPlane`.
pub struct TestCluster {
    pub env: TestEnv,
    pub signer: TokenSigner,
    pub manager: Arc<MetadataManager>,
    pub data_plane: Arc<LocalDataPlane>,
    pub nodes: BTreeMap<NodeId, Arc<StorageNodeService>>,
    pub pool_id: PoolId,
    node_capacity: u64,
    shutdown_tx: broadcast::Sender<()>,
}

impl TestCluster {
    pub fn authority(&self) -> Arc<dyn AuthorityApi> {
        self.manager.clone()
    }

    fn registration(&self, node_id: NodeId) -> Registration {
        Registration {
            node_id,
            name: format!("sds-{}", node_id),
            capabilities: vec![Capability::Sds],
            address: Some(format!("local:{}", node_id)),
            capacity: self.node_capacity,
            pool_id: Some(self.pool_id),
            fault_set: None,
        }
    }

    /// Start a storage node and register it with the manager.
    pub async fn add_node(&mut self, node_id: NodeId) -> Arc<StorageNodeService> {
        let dir = self.env.subdir(&format!("sds-{}", node_id));
        let store = Arc::new(ChunkStore::new(dir, 16 * 1024 * 1024).unwrap());
        let service = Arc::new(
            StorageNodeService::new(node_id, store, self.signer.clone())
                .with_acks(self.authority()),
        );
        self.data_plane.attach(Arc::clone(&service));
        service
            .register(self.authority().as_ref(), self.registration(node_id))
            .await
            .unwrap();
        self.nodes.insert(node_id, Arc::clone(&service));
        service
    }

    pub fn node(&self, node_id: NodeId) -> &Arc<StorageNodeService> {
        &self.nodes[&node_id]
    }

    /// Register a client node and return an initiator for it.
    pub async fn client(&self, client_id: ClientId) -> Initiator {
        self.manager
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
        Initiator::new(
            client_id,
            self.authority(),
            self.data_plane.clone(),
            InitiatorConfig {
                io_timeout: Duration::from_secs(2),
            },
        )
    }

    pub async fn create_volume(&self, name: &str, size: u64, provisioning: Provisioning) -> Volume {
        self.manager
            .create_volume(CreateVolume {
                pool_id: self.pool_id,
                name: name.into(),
                size,
                provisioning,
            })
            .await
            .unwrap()
    }

    /// Create a volume and map it read-write to `client_id`.
    pub async fn mapped_volume(
        &self,
        name: &str,
        size: u64,
        provisioning: Provisioning,
        client_id: ClientId,
    ) -> Volume {
        let volume = self.create_volume(name, size, provisioning).await;
        self.manager
            .map_volume(volume.id, client_id, AccessMode::ReadWrite)
            .unwrap();
        volume
    }

    /// Crash a storage node and have the manager declare it DOWN.
    pub async fn fail_node(&self, node_id: NodeId) {
        self.data_plane.set_unreachable(node_id, true);
        self.node(node_id).fail();
        self.manager.fail_node(node_id).await.unwrap();
    }

    /// Restart a crashed node; it re-registers and applies the recovery verdict.
    pub async fn restart_node(&self, node_id: NodeId) {
        let service = self.node(node_id);
        service.recover();
        self.data_plane.set_unreachable(node_id, false);
        service
            .register(self.authority().as_ref(), self.registration(node_id))
            .await
            .unwrap();
    }

    /// Run the rebuild worker until the cluster is dropped.
    pub fn start_rebuild_worker(&self) {
        let rebuild = Arc::clone(self.manager.rebuild());
        tokio::spawn(rebuild.run(self.shutdown_tx.subscribe()));
    }

    /// Poll until the pool's job leaves the active states.
    pub async fn wait_for_rebuild(&self, timeout: Duration) -> RebuildJob {
        let manager = Arc::clone(&self.manager);
        let pool_id = self.pool_id;
        tokio::time::timeout(timeout, async move {
            loop {
                if let Some(job) = manager.rebuild_job(pool_id).unwrap() {
                    if !job.state.is_active() {
                        return job;
                    }
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("rebuild did not finish in time")
    }

    pub fn pool(&self) -> Pool {
        self.manager.get_pool(self.pool_id).unwrap()
    }

    pub fn chunk(&self, chunk_id: ChunkId) -> Chunk {
        self.manager
            .store()
            .read(|t| t.chunk(chunk_id).cloned())
            .unwrap()
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Assert that no chunk in the pool has two replicas on one node.
pub fn assert_replicas_distinct(cluster: &TestCluster) {
    cluster.manager.store().read(|t| {
        for chunk in t.chunks.values() {
            let mut nodes: Vec<NodeId> = chunk.replicas.iter().map(|r| r.node_id).collect();
            nodes.sort_unstable();
            let before = nodes.len();
            nodes.dedup();
            assert_eq!(before, nodes.len(), "chunk {} has colocated replicas", chunk.id);
        }
    });
}
