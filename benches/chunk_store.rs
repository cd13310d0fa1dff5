//! Benchmarks for the storage node chunk store and the client IO path.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use flexblock::auth::TokenSigner;
use flexblock::client::{Initiator, InitiatorConfig, LocalDataPlane};
use flexblock::config::MdmConfig;
use flexblock::data::{ChunkStore, StorageNodeService};
use flexblock::metadata::{CreatePool, CreateVolume, MetadataManager};
use flexblock::types::*;
use std::sync::Arc;
use tempfile::TempDir;

const SECRET: &str = "benchmark-secret-benchmark-secret";

fn create_store(cache_size: usize) -> (ChunkStore, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let store = ChunkStore::new(temp_dir.path(), cache_size).unwrap();
    (store, temp_dir)
}

fn bench_write_range(c: &mut Criterion) {
    let (store, _temp) = create_store(64 * 1024 * 1024);
    let mut group = c.benchmark_group("chunk_write_range");

    for size in [4096usize, 65536, 1048576] {
        let data = vec![0xA5u8; size];
        let mut chunk_id = 0u64;

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                chunk_id += 1;
                store.write_range(black_box(chunk_id), black_box(0), black_box(&data))
            })
        });
    }
    group.finish();
}

fn bench_read_range(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunk_read_range");

    // A cache too small for a chunk forces every read to disk.
    for (label, cache_size) in [("cached", 64 * 1024 * 1024), ("uncached", 0)] {
        let (store, _temp) = create_store(cache_size);
        store
            .write_range(1, 0, &vec![0x5Au8; CHUNK_SIZE as usize])
            .unwrap();

        for size in [4096u64, 65536, 1048576] {
            group.throughput(Throughput::Bytes(size));
            group.bench_with_input(BenchmarkId::new(label, size), &size, |b, &size| {
                b.iter(|| store.read_range(black_box(1), black_box(CHUNK_SIZE / 2), size))
            });
        }
    }
    group.finish();
}

fn bench_token(c: &mut Criterion) {
    let signer = TokenSigner::new(SECRET).unwrap();
    let token = signer.sign(1, 1, 100, IoOperation::Write).unwrap();

    c.bench_function("token_sign", |b| {
        b.iter(|| signer.sign(black_box(1), black_box(1), black_box(100), IoOperation::Write))
    });
    c.bench_function("token_verify", |b| b.iter(|| signer.verify(black_box(&token))));
}

/// One manager, three in-process storage nodes and a mapped thick volume.
async fn setup_initiator(dir: &TempDir) -> (Initiator, VolumeId) {
    let signer = TokenSigner::new(SECRET).unwrap();
    let data_plane = LocalDataPlane::new();
    let manager = MetadataManager::new(&MdmConfig::default(), signer.clone(), data_plane.clone());
    let domain = manager.create_protection_domain("bench").unwrap();
    let pool = manager
        .create_pool(CreatePool {
            protection_domain_id: domain.id,
            name: "bench".into(),
            total_capacity: 10 * GB,
            reserved_capacity: 0,
            copies: None,
            rebuild_rate_mbps: None,
        })
        .unwrap();

    for node_id in 1..=3u64 {
        let store = Arc::new(
            ChunkStore::new(dir.path().join(format!("sds-{}", node_id)), 64 * 1024 * 1024)
                .unwrap(),
        );
        let service = Arc::new(StorageNodeService::new(node_id, store, signer.clone()));
        data_plane.attach(Arc::clone(&service));
        service
            .register(
                manager.as_ref(),
                Registration {
                    node_id,
                    name: format!("sds-{}", node_id),
                    capabilities: vec![Capability::Sds],
                    address: Some(format!("local:{}", node_id)),
                    capacity: 10 * GB,
                    pool_id: Some(pool.id),
                    fault_set: None,
                },
            )
            .await
            .unwrap();
    }

    let volume = manager
        .create_volume(CreateVolume {
            pool_id: pool.id,
            name: "bench".into(),
            size: 16 * CHUNK_SIZE,
            provisioning: Provisioning::Thick,
        })
        .await
        .unwrap();
    manager
        .register(Registration {
            node_id: 100,
            name: "sdc-100".into(),
            capabilities: vec![Capability::Sdc],
            address: None,
            capacity: 0,
            pool_id: None,
            fault_set: None,
        })
        .await
        .unwrap();
    manager
        .map_volume(volume.id, 100, AccessMode::ReadWrite)
        .unwrap();

    let initiator = Initiator::new(100, manager, data_plane, InitiatorConfig::default());
    (initiator, volume.id)
}

fn bench_initiator(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let dir = TempDir::new().unwrap();
    let (initiator, volume_id) = runtime.block_on(setup_initiator(&dir));
    let data = vec![0x3Cu8; 65536];
    runtime
        .block_on(initiator.write(volume_id, 0, &data))
        .unwrap();

    let mut group = c.benchmark_group("initiator");
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("write_64k", |b| {
        b.to_async(&runtime)
            .iter(|| initiator.write(black_box(volume_id), black_box(0), &data))
    });
    group.bench_function("read_64k", |b| {
        b.to_async(&runtime)
            .iter(|| initiator.read(black_box(volume_id), black_box(0), data.len() as u64))
    });
    // Straddles a chunk boundary: two tokens, two replica sets.
    group.bench_function("write_64k_split", |b| {
        b.to_async(&runtime).iter(|| {
            initiator.write(black_box(volume_id), black_box(CHUNK_SIZE - 32768), &data)
        })
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_write_range,
    bench_read_range,
    bench_token,
    bench_initiator
);
criterion_main!(benches);
