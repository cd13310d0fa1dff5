//! Rebuild and recovery integration tests
//!
//! Node failure under client IO, throttled rebuild, fast heal of a node that
//! returns early, cancellation and the no-target failure mode. Time is
//! paused so the throttle runs on the virtual clock.

#[allow(dead_code)]
mod common;

use common::{ClusterBuilder, TestCluster, TestDataGenerator};
use flexblock::events::{EventFilter, EventType};
use flexblock::types::*;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const CLIENT: ClientId = 100;

/// Run copy rounds a second apart until the pool's job leaves the active states.
async fn drive_rebuild(cluster: &TestCluster) -> RebuildJob {
    let rebuild = cluster.manager.rebuild();
    for _ in 0..64 {
        let job = rebuild.advance(cluster.pool_id).await.unwrap().unwrap();
        if !job.state.is_active() {
            return job;
        }
        tokio::time::advance(Duration::from_secs(1)).await;
    }
    panic!("rebuild still active after 64 rounds");
}

/// Chunks of the pool that have a replica on `node_id`.
fn chunks_on(cluster: &TestCluster, node_id: NodeId) -> Vec<ChunkId> {
    cluster.manager.store().read(|t| {
        t.chunks
            .values()
            .filter(|c| c.holds(node_id))
            .map(|c| c.id)
            .collect()
    })
}

#[tokio::test(start_paused = true)]
async fn test_node_failure_rebuilds_without_read_errors() {
    let cluster = ClusterBuilder::new()
        .nodes(4)
        .rebuild_rate(16)
        .build()
        .await;
    cluster.start_rebuild_worker();
    let initiator = Arc::new(cluster.client(CLIENT).await);
    let volume = cluster
        .mapped_volume("busy", 128 * MIB, Provisioning::Thick, CLIENT)
        .await;

    let mut generator = TestDataGenerator::new(42);
    let blocks: Vec<(u64, Vec<u8>)> = (0..volume.chunks.len() as u64)
        .map(|i| (i * CHUNK_SIZE + 512, generator.random_bytes(4096)))
        .collect();
    for (offset, data) in &blocks {
        initiator.write(volume.id, *offset, data).await.unwrap();
    }

    // Readers keep going through the failure and the rebuild.
    let stop = Arc::new(AtomicBool::new(false));
    let failures = Arc::new(AtomicU64::new(0));
    let reads = Arc::new(AtomicU64::new(0));
    let reader = {
        let initiator = Arc::clone(&initiator);
        let stop = Arc::clone(&stop);
        let failures = Arc::clone(&failures);
        let reads = Arc::clone(&reads);
        let blocks = blocks.clone();
        let volume_id = volume.id;
        tokio::spawn(async move {
            let mut i = 0usize;
            while !stop.load(Ordering::Relaxed) {
                let (offset, expected) = &blocks[i % blocks.len()];
                match initiator.read(volume_id, *offset, expected.len() as u64).await {
                    Ok(data) if &data == expected => {}
                    _ => {
                        failures.fetch_add(1, Ordering::Relaxed);
                    }
                }
                reads.fetch_add(1, Ordering::Relaxed);
                i += 1;
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
    };

    tokio::time::sleep(Duration::from_millis(200)).await;
    let affected = chunks_on(&cluster, 1);
    assert!(!affected.is_empty());
    let failed_at = Instant::now();
    cluster.fail_node(1).await;

    let job = cluster.manager.rebuild_job(cluster.pool_id).unwrap().unwrap();
    assert_eq!(job.state, RebuildJobState::InProgress);
    assert_eq!(job.bytes_total, affected.len() as u64 * CHUNK_SIZE);
    assert_eq!(cluster.pool().health, PoolHealth::Degraded);

    let job = cluster.wait_for_rebuild(Duration::from_secs(60)).await;
    let elapsed = failed_at.elapsed();
    stop.store(true, Ordering::Relaxed);
    reader.await.unwrap();

    assert_eq!(job.state, RebuildJobState::Completed);
    assert_eq!(job.bytes_done, job.bytes_total);
    let bound = Duration::from_secs_f64(job.bytes_total as f64 / (16 * MIB) as f64)
        + Duration::from_secs(1);
    assert!(elapsed <= bound, "rebuild took {:?}, bound {:?}", elapsed, bound);

    assert!(reads.load(Ordering::Relaxed) > 0);
    assert_eq!(failures.load(Ordering::Relaxed), 0);

    let pool = cluster.pool();
    assert_eq!(pool.health, PoolHealth::Ok);
    assert_eq!(pool.rebuild_state, RebuildState::Completed);
    for chunk_id in &affected {
        let chunk = cluster.chunk(*chunk_id);
        assert!(!chunk.is_degraded);
        assert_eq!(chunk.available_count(), 2);
        assert!(!chunk.holds(1));
    }

    // The rebuilt copies hold the data: read each block with the surviving
    // original holder cut off.
    for (index, chunk_id) in volume.chunks.iter().enumerate() {
        if !affected.contains(chunk_id) {
            continue;
        }
        let chunk = cluster.chunk(*chunk_id);
        let (offset, expected) = &blocks[index];
        let store_offset = offset % CHUNK_SIZE;
        for replica in &chunk.replicas {
            let stored = cluster
                .node(replica.node_id)
                .store()
                .read_range(*chunk_id, store_offset, expected.len() as u64)
                .unwrap();
            assert_eq!(&stored, expected);
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_rebuild_throttle_bounds_progress() {
    let cluster = ClusterBuilder::new()
        .nodes(3)
        .rebuild_rate(4)
        .build()
        .await;
    cluster
        .create_volume("slow", 32 * MIB, Provisioning::Thick)
        .await;
    cluster.fail_node(1).await;
    let total = cluster
        .manager
        .rebuild_job(cluster.pool_id)
        .unwrap()
        .unwrap()
        .bytes_total;
    assert!(total > 8 * MIB);

    // One second of burst, then the refill rate.
    let rebuild = cluster.manager.rebuild();
    rebuild.advance(cluster.pool_id).await.unwrap();
    tokio::time::advance(Duration::from_secs(1)).await;
    let job = rebuild.advance(cluster.pool_id).await.unwrap().unwrap();
    assert!(job.bytes_done <= 8 * MIB, "copied {} bytes", job.bytes_done);
    assert!(job.bytes_done >= 4 * MIB);
    assert!(job.state.is_active());
}

// =============================================================================
// Recovery of a returning node
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_node_back_before_rebuild_is_fast_healed() {
    let cluster = ClusterBuilder::new().nodes(3).rebuild_rate(1).build().await;
    let initiator = cluster.client(CLIENT).await;
    let volume = cluster
        .mapped_volume("heal", 8 * CHUNK_SIZE, Provisioning::Thick, CLIENT)
        .await;
    let held = chunks_on(&cluster, 1);
    let first = held[0];
    let index = volume.chunks.iter().position(|&c| c == first).unwrap() as u64;
    let data = vec![0x5Au8; 4096];
    initiator
        .write(volume.id, index * CHUNK_SIZE, &data)
        .await
        .unwrap();

    cluster.fail_node(1).await;
    for chunk_id in &held {
        let chunk = cluster.chunk(*chunk_id);
        assert!(!chunk.holds(1));
        assert!(chunk.displaced.contains(&1));
    }

    cluster.restart_node(1).await;

    assert_eq!(cluster.node(1).state(), NodeState::Up);
    for chunk_id in &held {
        let chunk = cluster.chunk(*chunk_id);
        assert!(chunk.replica(1).unwrap().is_available);
        assert!(!chunk.is_degraded);
        assert!(chunk.replicas.iter().all(|r| !r.is_rebuilding));
        assert_eq!(chunk.replicas.len(), 2);
    }

    // Nothing left to copy; the next round closes the job.
    let job = cluster
        .manager
        .rebuild()
        .advance(cluster.pool_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.state, RebuildJobState::Completed);
    assert_eq!(cluster.pool().health, PoolHealth::Ok);

    // The healed copy serves reads on its own.
    for replica in &cluster.chunk(first).replicas {
        if replica.node_id != 1 {
            cluster.data_plane.set_unreachable(replica.node_id, true);
        }
    }
    let read = initiator
        .read(volume.id, index * CHUNK_SIZE, data.len() as u64)
        .await
        .unwrap();
    assert_eq!(read, data);
}

#[tokio::test(start_paused = true)]
async fn test_chunk_written_while_node_down_is_not_healed() {
    let cluster = ClusterBuilder::new().nodes(3).rebuild_rate(1).build().await;
    let initiator = cluster.client(CLIENT).await;
    let volume = cluster
        .mapped_volume("moved", 4 * CHUNK_SIZE, Provisioning::Thick, CLIENT)
        .await;
    let held = chunks_on(&cluster, 1);
    let written = held[0];
    let index = volume.chunks.iter().position(|&c| c == written).unwrap() as u64;

    cluster.fail_node(1).await;
    initiator
        .write(volume.id, index * CHUNK_SIZE, &[9u8; 512])
        .await
        .unwrap();
    assert_eq!(cluster.chunk(written).stale, vec![1]);
    cluster.restart_node(1).await;

    // The written chunk is resynced in place, the others are healed.
    let chunk = cluster.chunk(written);
    let replica = chunk.replica(1).unwrap();
    assert!(!replica.is_available);
    assert!(replica.is_rebuilding);
    assert!(chunk.stale.is_empty());
    for chunk_id in held.iter().filter(|&&c| c != written) {
        assert!(cluster.chunk(*chunk_id).replica(1).unwrap().is_available);
    }
    assert_eq!(cluster.node(1).state(), NodeState::Degraded);
    let node = cluster.manager.get_storage_node(1).unwrap();
    assert_eq!(node.state, NodeState::Degraded);
    let job = cluster.manager.rebuild_job(cluster.pool_id).unwrap().unwrap();
    assert!(job.state.is_active());

    let job = drive_rebuild(&cluster).await;
    assert_eq!(job.state, RebuildJobState::Completed);
    let chunk = cluster.chunk(written);
    assert!(chunk.replica(1).unwrap().is_available);
    assert_eq!(chunk.replicas.len(), 2);
    assert!(!chunk.is_degraded);
    assert_eq!(cluster.node(1).state(), NodeState::Up);
    let node = cluster.manager.get_storage_node(1).unwrap();
    assert_eq!(node.state, NodeState::Up);
    assert_eq!(node.used, chunks_on(&cluster, 1).len() as u64 * CHUNK_SIZE);

    let stored = cluster
        .node(1)
        .store()
        .read_range(written, 0, 512)
        .unwrap();
    assert_eq!(stored, vec![9u8; 512]);
}

#[tokio::test(start_paused = true)]
async fn test_write_missing_a_node_as_it_fails_blocks_fast_heal() {
    let cluster = ClusterBuilder::new().nodes(2).rebuild_rate(1).build().await;
    let initiator = Arc::new(cluster.client(CLIENT).await);
    let volume = cluster
        .mapped_volume("inflight", CHUNK_SIZE, Provisioning::Thick, CLIENT)
        .await;
    let chunk_id = volume.chunks[0];
    initiator.write(volume.id, 0, &[0xAAu8; 4096]).await.unwrap();

    // Node 1 is declared DOWN while a write to it is still in flight.
    cluster.data_plane.set_delay(1, Some(Duration::from_secs(1)));
    let pending = {
        let initiator = Arc::clone(&initiator);
        let volume_id = volume.id;
        tokio::spawn(async move { initiator.write(volume_id, 0, &[0xBBu8; 4096]).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    cluster.fail_node(1).await;
    assert_eq!(cluster.chunk(chunk_id).displaced, vec![1]);
    pending.await.unwrap().unwrap();

    let chunk = cluster.chunk(chunk_id);
    assert!(chunk.displaced.is_empty());
    assert_eq!(chunk.stale, vec![1]);

    cluster.data_plane.set_delay(1, None);
    cluster.restart_node(1).await;

    assert!(!cluster.chunk(chunk_id).replica(1).unwrap().is_available);
    assert_eq!(cluster.node(1).state(), NodeState::Degraded);
    // Node 2 is the only copy serving reads until the resync lands.
    assert_eq!(
        initiator.read(volume.id, 0, 4096).await.unwrap(),
        vec![0xBBu8; 4096]
    );

    let job = drive_rebuild(&cluster).await;
    assert_eq!(job.state, RebuildJobState::Completed);
    assert_eq!(cluster.node(1).state(), NodeState::Up);

    cluster.data_plane.set_unreachable(2, true);
    assert_eq!(
        initiator.read(volume.id, 0, 4096).await.unwrap(),
        vec![0xBBu8; 4096]
    );
}

#[tokio::test(start_paused = true)]
async fn test_write_during_rebuild_reaches_the_new_copy() {
    let cluster = ClusterBuilder::new().nodes(3).rebuild_rate(1).build().await;
    let initiator = cluster.client(CLIENT).await;
    let volume = cluster
        .mapped_volume("racing", CHUNK_SIZE, Provisioning::Thick, CLIENT)
        .await;
    let chunk_id = volume.chunks[0];
    initiator.write(volume.id, 0, &[0xAAu8; 4096]).await.unwrap();
    let holders: Vec<NodeId> = cluster
        .chunk(chunk_id)
        .replicas
        .iter()
        .map(|r| r.node_id)
        .collect();
    let (failed, survivor) = (holders[0], holders[1]);

    cluster.fail_node(failed).await;
    // The first segment, holding offset 0, is copied before the write.
    let job = cluster
        .manager
        .rebuild()
        .advance(cluster.pool_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.bytes_done, MIB);
    let target = cluster
        .chunk(chunk_id)
        .replicas
        .iter()
        .find(|r| r.is_rebuilding)
        .map(|r| r.node_id)
        .unwrap();

    let result = initiator.write(volume.id, 0, &[0xBBu8; 4096]).await.unwrap();
    assert_eq!(result.degraded_chunks, vec![chunk_id]);
    assert_eq!(cluster.chunk(chunk_id).write_generation, 1);
    let stored = cluster
        .node(target)
        .store()
        .read_range(chunk_id, 0, 4096)
        .unwrap();
    assert_eq!(stored, vec![0xBBu8; 4096]);

    let job = drive_rebuild(&cluster).await;
    assert_eq!(job.state, RebuildJobState::Completed);
    assert!(cluster.chunk(chunk_id).replica(target).unwrap().is_available);

    // The rebuilt copy alone serves the latest data.
    cluster.fail_node(survivor).await;
    assert_eq!(
        initiator.read(volume.id, 0, 4096).await.unwrap(),
        vec![0xBBu8; 4096]
    );
}

#[tokio::test(start_paused = true)]
async fn test_node_back_after_rebuild_drops_its_copies() {
    let cluster = ClusterBuilder::new().nodes(3).rebuild_rate(64).build().await;
    cluster.start_rebuild_worker();
    let initiator = cluster.client(CLIENT).await;
    let volume = cluster
        .mapped_volume("dropped", 4 * CHUNK_SIZE, Provisioning::Thick, CLIENT)
        .await;
    let held = chunks_on(&cluster, 1);
    for chunk_id in &held {
        let index = volume.chunks.iter().position(|c| c == chunk_id).unwrap() as u64;
        initiator
            .write(volume.id, index * CHUNK_SIZE, &[1u8; 128])
            .await
            .unwrap();
        assert!(cluster.node(1).store().exists(*chunk_id));
    }

    cluster.fail_node(1).await;
    let job = cluster.wait_for_rebuild(Duration::from_secs(30)).await;
    assert_eq!(job.state, RebuildJobState::Completed);

    cluster.restart_node(1).await;

    for chunk_id in &held {
        assert!(!cluster.chunk(*chunk_id).holds(1));
        assert!(!cluster.node(1).store().exists(*chunk_id));
    }
    assert_eq!(cluster.node(1).state(), NodeState::Up);
    let node = cluster.manager.get_storage_node(1).unwrap();
    assert_eq!(node.state, NodeState::Up);
    assert_eq!(node.used, chunks_on(&cluster, 1).len() as u64 * CHUNK_SIZE);
}


#[tokio::test(start_paused = true)]
async fn test_rebuild_stalls_and_reports_progress() {
    let cluster = ClusterBuilder::new().nodes(3).rebuild_rate(1).build().await;
    cluster
        .create_volume("paced", 4 * CHUNK_SIZE, Provisioning::Thick)
        .await;
    cluster.fail_node(1).await;
    let rebuild = cluster.manager.rebuild();

    let job = rebuild.advance(cluster.pool_id).await.unwrap().unwrap();
    assert_eq!(job.state, RebuildJobState::InProgress);
    assert_eq!(job.bytes_done, MIB);
    let total = job.bytes_total;
    assert!(total >= CHUNK_SIZE);

    // The burst is spent and no time has passed.
    let job = rebuild.advance(cluster.pool_id).await.unwrap().unwrap();
    assert_eq!(job.state, RebuildJobState::Stalled);
    assert_eq!(job.bytes_done, MIB);
    let stalls = EventFilter::new()
        .event_types([EventType::RebuildStalled])
        .pool(cluster.pool_id);
    assert_eq!(cluster.manager.query_events(&stalls, 100).len(), 1);

    // Staying stalled is reported once.
    rebuild.advance(cluster.pool_id).await.unwrap();
    assert_eq!(cluster.manager.query_events(&stalls, 100).len(), 1);

    tokio::time::advance(Duration::from_secs(1)).await;
    let job = rebuild.advance(cluster.pool_id).await.unwrap().unwrap();
    assert_eq!(job.state, RebuildJobState::InProgress);
    assert_eq!(job.bytes_done, 2 * MIB);
    assert!((job.current_rate - MIB as f64).abs() < 1.0);
    let expected_eta = (total - 2 * MIB) as f64 / MIB as f64;
    let eta = job.eta_secs.unwrap();
    assert!((eta - expected_eta).abs() < 0.01, "eta {} != {}", eta, expected_eta);

    tokio::time::advance(Duration::from_secs(1)).await;
    let job = drive_rebuild(&cluster).await;
    assert_eq!(job.state, RebuildJobState::Completed);
    assert_eq!(job.bytes_done, total);
    assert!(job.eta_secs.is_none());

    let progress = EventFilter::new()
        .event_types([EventType::RebuildProgress])
        .pool(cluster.pool_id);
    assert_eq!(cluster.manager.query_events(&progress, 100).len(), 10);
}

// =============================================================================
// Job lifecycle
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_cancel_rebuild_drops_partial_copies() {
    let cluster = ClusterBuilder::new().nodes(3).rebuild_rate(1).build().await;
    cluster
        .create_volume("cancel", 8 * CHUNK_SIZE, Provisioning::Thick)
        .await;
    cluster.fail_node(1).await;
    cluster
        .manager
        .rebuild()
        .advance(cluster.pool_id)
        .await
        .unwrap();

    assert!(cluster.manager.cancel_rebuild(cluster.pool_id).await.unwrap());
    assert!(!cluster.manager.cancel_rebuild(cluster.pool_id).await.unwrap());

    let job = cluster.manager.rebuild_job(cluster.pool_id).unwrap().unwrap();
    assert_eq!(job.state, RebuildJobState::Cancelled);
    assert!(job.finished_at.is_some());
    let pool = cluster.pool();
    assert_eq!(pool.rebuild_state, RebuildState::Idle);
    assert_eq!(pool.health, PoolHealth::Degraded);
    cluster.manager.store().read(|t| {
        assert!(t
            .chunks
            .values()
            .all(|c| c.replicas.iter().all(|r| !r.is_rebuilding)));
    });

    // A new request starts over.
    let job = cluster
        .manager
        .start_rebuild(cluster.pool_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.state, RebuildJobState::InProgress);
    assert_eq!(job.bytes_done, 0);
}

#[tokio::test(start_paused = true)]
async fn test_rebuild_fails_without_target_until_capacity_joins() {
    let mut cluster = ClusterBuilder::new().nodes(2).rebuild_rate(64).build().await;
    cluster.start_rebuild_worker();
    cluster
        .create_volume("stuck", 2 * CHUNK_SIZE, Provisioning::Thick)
        .await;

    cluster.fail_node(1).await;
    let job = cluster.manager.rebuild_job(cluster.pool_id).unwrap().unwrap();
    assert_eq!(job.state, RebuildJobState::Failed);
    assert_eq!(cluster.pool().health, PoolHealth::Degraded);

    cluster.add_node(3).await;
    let job = cluster.wait_for_rebuild(Duration::from_secs(30)).await;
    assert_eq!(job.state, RebuildJobState::Completed);
    assert_eq!(cluster.pool().health, PoolHealth::Ok);
    assert_eq!(chunks_on(&cluster, 3).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_losing_every_copy_fails_the_pool() {
    let cluster = ClusterBuilder::new().nodes(2).build().await;
    let volume = cluster
        .create_volume("lost", CHUNK_SIZE, Provisioning::Thick)
        .await;

    cluster.fail_node(1).await;
    cluster.fail_node(2).await;

    assert_eq!(cluster.pool().health, PoolHealth::Failed);
    assert_eq!(cluster.chunk(volume.chunks[0]).available_count(), 0);

    // Recovery cannot heal a chunk nobody holds any more.
    let report = cluster.manager.recover_node(1).await.unwrap();
    assert_eq!(report.lost, vec![volume.chunks[0]]);
    assert!(report.healed.is_empty());
}
