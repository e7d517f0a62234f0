//! Integration tests for the repair worker loop
//!
//! These tests drive `RepairService` against a repair queue and an in-memory
//! cluster: draining, retry with back-off, permanent failure, cancellation
//! on shutdown and the fatal-error stop.


use ed25519_dalek::VerifyingKey;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use test_helpers::*;

use segment_repair::metadata_store::PointerStore;
use segment_repair::orders::{OrderSigner, SigningError};
use segment_repair::repair_queue::{
    MemoryRepairQueue, QueueConfig, RepairQueue, RepairQueueEntry, SqliteRepairQueue,
};
use segment_repair::repair_service::{RepairObserver, RepairService, ServiceError};
use segment_repair::repairer::{RepairConfig, RepairOutcome, RepairResult};
use segment_repair::segment::NodeId;
use segment_repair::shutdown::Shutdown;
use segment_repair::transport::NodeBehavior;

/// Observer that keeps every record it is handed
#[derive(Default)]
struct RecordingObserver {
    attempts: Mutex<Vec<RepairResult>>,
    permanent_failures: Mutex<Vec<RepairQueueEntry>>,
}

impl RepairObserver for RecordingObserver {
    fn on_attempt(&self, result: &RepairResult) {
        self.attempts.lock().push(result.clone());
    }

    fn on_permanent_failure(&self, entry: &RepairQueueEntry, _result: &RepairResult) {
        self.permanent_failures.lock().push(entry.clone());
    }
}

/// Signer whose key has gone missing
struct BrokenSigner {
    satellite_id: NodeId,
    verifying_key: VerifyingKey,
}

impl OrderSigner for BrokenSigner {
    fn satellite_id(&self) -> NodeId {
        self.satellite_id
    }

    fn verifying_key(&self) -> VerifyingKey {
        self.verifying_key
    }

    fn sign(&self, _digest: &[u8]) -> Result<Vec<u8>, SigningError> {
        Err(SigningError::KeyUnavailable {
            reason: "hardware key removed".to_string(),
        })
    }
}

fn create_test_queue() -> Arc<MemoryRepairQueue> {
    Arc::new(
        MemoryRepairQueue::new(QueueConfig {
            poll_interval: Duration::from_millis(20),
            ..Default::default()
        })
        .unwrap(),
    )
}

fn spawn_service(
    service: Arc<RepairService>,
    shutdown: &Shutdown,
) -> tokio::task::JoinHandle<Result<(), ServiceError>> {
    let shutdown = shutdown.clone();
    tokio::spawn(async move { service.run(&shutdown).await })
}

#[tokio::test]
async fn test_service_drains_damaged_segments() {
    init_tracing();
    let cluster = TestCluster::new(30);
    let holders = cluster.nodes[..10].to_vec();
    let queue = create_test_queue();

    let mut keys = Vec::new();
    for i in 0..6 {
        let segment = cluster
            .upload_segment(&format!("bucket/drain/s{}", i), create_test_scheme(), &random_data(2048), &holders)
            .await
            .unwrap();
        queue.push(segment.key.clone()).await.unwrap();
        keys.push(segment.key);
    }
    let healthy = cluster
        .upload_segment("bucket/drain/healthy", create_test_scheme(), &random_data(2048), &cluster.nodes[20..30])
        .await
        .unwrap();
    queue.push(healthy.key.clone()).await.unwrap();

    for node_id in &holders[5..] {
        cluster.fail_node(node_id);
    }

    let (repairer, _chore) = cluster.repairer().build().unwrap();
    let service = Arc::new(RepairService::new(queue.clone(), repairer));
    let shutdown = Shutdown::new();
    let handle = spawn_service(service.clone(), &shutdown);

    wait_until(Duration::from_secs(10), || service.stats().attempted == 7)
        .await
        .unwrap();
    shutdown.trigger();
    handle.await.unwrap().unwrap();

    let stats = service.stats();
    assert_eq!(stats.repaired, 6);
    assert_eq!(stats.not_damaged, 1);
    assert_eq!(stats.pieces_placed, 6 * 4);
    assert_eq!(queue.len().await.unwrap(), 0);

    for key in &keys {
        let segment = cluster.pointers.get(key).await.unwrap().unwrap();
        assert!(cluster.healthy_pieces(&segment).await.unwrap().len() >= 6);
    }
}

#[tokio::test]
async fn test_failures_are_retried_until_permanent() {
    init_tracing();
    // Every node already holds a piece: nowhere to place new ones
    let cluster = TestCluster::new(10);
    let holders = cluster.nodes.clone();
    let segment = cluster
        .upload_segment("bucket/retry/s0", create_test_scheme(), &random_data(2048), &holders)
        .await
        .unwrap();
    for node_id in &holders[5..] {
        cluster.fail_node(node_id);
    }

    let queue = create_test_queue();
    queue.push(segment.key.clone()).await.unwrap();

    let config = RepairConfig {
        max_attempts: 3,
        ..create_test_repair_config()
    };
    let (repairer, _chore) = cluster.repairer().config(config).build().unwrap();
    let observer = Arc::new(RecordingObserver::default());
    let service = Arc::new(RepairService::with_observer(
        queue.clone(),
        repairer,
        observer.clone(),
    ));

    let shutdown = Shutdown::new();
    let handle = spawn_service(service.clone(), &shutdown);
    wait_until(Duration::from_secs(10), || service.stats().permanently_failed == 1)
        .await
        .unwrap();
    shutdown.trigger();
    handle.await.unwrap().unwrap();

    let stats = service.stats();
    assert_eq!(stats.attempted, 3);
    assert_eq!(stats.failed_transient, 3);
    assert_eq!(queue.len().await.unwrap(), 0);

    let attempts = observer.attempts.lock();
    assert!(attempts
        .iter()
        .all(|result| matches!(result.outcome, RepairOutcome::Failed(_))));
    let failures = observer.permanent_failures.lock();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].segment_key, segment.key);
    assert_eq!(failures[0].attempts, 3);
}

#[tokio::test]
async fn test_failed_attempt_is_requeued_with_backoff() {
    init_tracing();
    let cluster = TestCluster::new(10);
    let holders = cluster.nodes.clone();
    let segment = cluster
        .upload_segment("bucket/backoff/s0", create_test_scheme(), &random_data(2048), &holders)
        .await
        .unwrap();
    for node_id in &holders[5..] {
        cluster.fail_node(node_id);
    }

    let queue = create_test_queue();
    queue.push(segment.key.clone()).await.unwrap();

    let config = RepairConfig {
        retry_backoff: Duration::from_secs(3600),
        max_retry_backoff: Duration::from_secs(3600),
        ..create_test_repair_config()
    };
    let (repairer, _chore) = cluster.repairer().config(config).build().unwrap();
    let service = Arc::new(RepairService::new(queue.clone(), repairer));

    let shutdown = Shutdown::new();
    let handle = spawn_service(service.clone(), &shutdown);
    wait_until(Duration::from_secs(10), || service.stats().attempted == 1)
        .await
        .unwrap();
    shutdown.trigger();
    handle.await.unwrap().unwrap();

    // Still queued, but hidden behind its back-off delay
    assert_eq!(queue.len().await.unwrap(), 1);
    assert!(queue.try_pop().await.unwrap().is_none());
    assert_eq!(service.stats().attempted, 1);
}

#[tokio::test]
async fn test_shutdown_requeues_in_flight_repairs() {
    init_tracing();
    let cluster = TestCluster::new(20);
    let holders = cluster.nodes[..10].to_vec();
    let segment = cluster
        .upload_segment("bucket/inflight/s0", create_test_scheme(), &random_data(2048), &holders)
        .await
        .unwrap();
    for node_id in &holders[5..] {
        cluster.fail_node(node_id);
    }
    for node_id in &holders[..5] {
        cluster.network.set_behavior(node_id, NodeBehavior::Stall);
    }

    let queue = create_test_queue();
    queue.push(segment.key.clone()).await.unwrap();

    let config = RepairConfig {
        node_timeout: Duration::from_secs(60),
        segment_timeout: Duration::from_secs(120),
        ..create_test_repair_config()
    };
    let (repairer, _chore) = cluster.repairer().config(config).build().unwrap();
    let service = Arc::new(RepairService::new(queue.clone(), repairer));

    let shutdown = Shutdown::new();
    let handle = spawn_service(service.clone(), &shutdown);

    let network = cluster.network.clone();
    wait_until(Duration::from_secs(5), || network.download_count() >= 5)
        .await
        .unwrap();
    shutdown.trigger();

    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    // Cancelled attempts are not counted and go straight back to the queue
    assert_eq!(service.stats().attempted, 0);
    let entry = queue.try_pop().await.unwrap().unwrap();
    assert_eq!(entry.segment_key, segment.key);
    assert_eq!(entry.attempts, 2);
}

#[tokio::test]
async fn test_fatal_error_stops_service() {
    init_tracing();
    let cluster = TestCluster::new(20);
    let holders = cluster.nodes[..10].to_vec();
    let segment = cluster
        .upload_segment("bucket/fatal/s0", create_test_scheme(), &random_data(2048), &holders)
        .await
        .unwrap();
    for node_id in &holders[5..] {
        cluster.fail_node(node_id);
    }

    let queue = Arc::new(
        SqliteRepairQueue::in_memory(QueueConfig {
            poll_interval: Duration::from_millis(20),
            ..Default::default()
        })
        .unwrap(),
    );
    queue.push(segment.key.clone()).await.unwrap();

    let signer = Arc::new(BrokenSigner {
        satellite_id: NodeId::new(),
        verifying_key: cluster.signer.verifying_key(),
    });
    let (repairer, _chore) = cluster.repairer().signer(signer).build().unwrap();
    let service = RepairService::new(queue.clone(), repairer);

    let result = tokio::time::timeout(Duration::from_secs(5), service.run(&Shutdown::new()))
        .await
        .unwrap();
    match result {
        Err(ServiceError::Fatal { key, .. }) => assert_eq!(key, segment.key),
        other => panic!("Expected fatal error, got {:?}", other),
    }

    // The segment is not lost
    assert_eq!(queue.len().await.unwrap(), 1);
    assert_eq!(
        cluster.pointers.get(&segment.key).await.unwrap().unwrap(),
        segment
    );
}
