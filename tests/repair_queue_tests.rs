//! Integration tests for the repair queue
//!
//! These tests exercise both queue backends under concurrent workers and the
//! SQLite backend across a restart.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use segment_repair::repair_queue::{MemoryRepairQueue, QueueConfig, RepairQueue, SqliteRepairQueue};
use segment_repair::segment::SegmentKey;
use segment_repair::shutdown::Shutdown;

fn create_test_config() -> QueueConfig {
    QueueConfig {
        lease_timeout: Duration::from_secs(60),
        poll_interval: Duration::from_millis(20),
    }
}

fn create_test_queues(temp_dir: &TempDir) -> Vec<Arc<dyn RepairQueue>> {
    vec![
        Arc::new(MemoryRepairQueue::new(create_test_config()).unwrap()),
        Arc::new(
            SqliteRepairQueue::new(temp_dir.path().join("queue.db"), create_test_config()).unwrap(),
        ),
    ]
}

#[tokio::test]
async fn test_concurrent_workers_never_share_an_entry() {
    let temp_dir = TempDir::new().unwrap();
    for queue in create_test_queues(&temp_dir) {
        for i in 0..50 {
            queue.push(SegmentKey::new(format!("bucket/obj/s{}", i))).await.unwrap();
        }

        let mut workers = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let queue = queue.clone();
            workers.spawn(async move {
                let mut claimed = Vec::new();
                while let Some(entry) = queue.try_pop().await.unwrap() {
                    claimed.push(entry.segment_key.clone());
                    tokio::task::yield_now().await;
                    queue.mark_done(&entry).await.unwrap();
                }
                claimed
            });
        }

        let mut all = Vec::new();
        while let Some(claimed) = workers.join_next().await {
            all.extend(claimed.unwrap());
        }

        let unique: HashSet<SegmentKey> = all.iter().cloned().collect();
        assert_eq!(all.len(), 50);
        assert_eq!(unique.len(), 50);
        assert_eq!(queue.len().await.unwrap(), 0);
    }
}

#[tokio::test]
async fn test_pop_wakes_on_push() {
    let temp_dir = TempDir::new().unwrap();
    for queue in create_test_queues(&temp_dir) {
        let shutdown = Shutdown::new();
        let waiter = {
            let queue = queue.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { queue.pop(&shutdown).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.push("bucket/late/s0".into()).await.unwrap();

        let entry = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(entry.segment_key, SegmentKey::from("bucket/late/s0"));
        queue.mark_done(&entry).await.unwrap();
    }
}

#[tokio::test]
async fn test_blocked_pop_released_by_shutdown() {
    let queue = MemoryRepairQueue::new(create_test_config()).unwrap();
    let shutdown = Shutdown::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.trigger();
    });

    let popped = tokio::time::timeout(Duration::from_secs(2), queue.pop(&shutdown))
        .await
        .unwrap()
        .unwrap();
    assert!(popped.is_none());
}

#[tokio::test]
async fn test_sqlite_queue_survives_restart() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("queue.db");

    {
        let queue = SqliteRepairQueue::new(&db_path, create_test_config()).unwrap();
        for key in ["a", "b", "c"] {
            queue.push(key.into()).await.unwrap();
        }
        let a = queue.try_pop().await.unwrap().unwrap();
        queue.requeue(&a, Duration::from_secs(3600)).await.unwrap();
        let b = queue.try_pop().await.unwrap().unwrap();
        queue.mark_done(&b).await.unwrap();
    }

    let queue = SqliteRepairQueue::new(&db_path, create_test_config()).unwrap();
    assert_eq!(queue.len().await.unwrap(), 2);

    // "a" is still backing off, so "c" comes next
    let c = queue.try_pop().await.unwrap().unwrap();
    assert_eq!(c.segment_key, SegmentKey::from("c"));
    assert_eq!(c.attempts, 1);
    assert!(queue.try_pop().await.unwrap().is_none());
}

#[tokio::test]
async fn test_sqlite_claim_survives_restart_until_lease_expires() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("queue.db");
    let config = QueueConfig {
        lease_timeout: Duration::from_millis(100),
        poll_interval: Duration::from_millis(10),
    };

    {
        let queue = SqliteRepairQueue::new(&db_path, config.clone()).unwrap();
        queue.push("a".into()).await.unwrap();
        // Claimed by a worker that then crashes
        queue.try_pop().await.unwrap().unwrap();
    }

    let queue = SqliteRepairQueue::new(&db_path, config).unwrap();
    assert!(queue.try_pop().await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(150)).await;
    let entry = queue.try_pop().await.unwrap().unwrap();
    assert_eq!(entry.segment_key, SegmentKey::from("a"));
    assert_eq!(entry.attempts, 2);
}
