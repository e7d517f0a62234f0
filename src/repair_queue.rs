//! Repair Queue Module
//!
//! Durable work queue of damaged-segment references. Entries are keyed by
//! segment identity, so pushing a segment that is already queued only bumps
//! its `updated_at`. Workers claim entries with a lease: a claimed entry is
//! invisible to other poppers until it is marked done, requeued with a delay,
//! or its lease runs out (the worker crashed). Dispatch order is
//! oldest-inserted-first among entries that are neither delayed nor claimed.

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Result as SqliteResult, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use crate::segment::SegmentKey;
use crate::shutdown::Shutdown;

/// Errors that can occur during queue operations
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Claim on {key} is no longer held")]
    StaleClaim { key: SegmentKey },

    #[error("Invalid queue row: {reason}")]
    InvalidRow { reason: String },

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },
}

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

/// Configuration for the repair queue
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// How long a claimed entry stays invisible before another worker may take it
    #[serde(with = "humantime_serde")]
    pub lease_timeout: Duration,
    /// Fallback wake-up for blocked poppers (delayed entries, expired leases)
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_timeout: Duration::from_secs(30 * 60),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> QueueResult<()> {
        if self.lease_timeout.is_zero() {
            return Err(QueueError::Configuration {
                reason: "lease_timeout must be greater than 0".to_string(),
            });
        }
        if self.poll_interval.is_zero() {
            return Err(QueueError::Configuration {
                reason: "poll_interval must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

/// A queued reference to a damaged segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairQueueEntry {
    pub segment_key: SegmentKey,
    pub inserted_at: SystemTime,
    /// Last time a checker reported the segment
    pub updated_at: SystemTime,
    pub last_attempted_at: Option<SystemTime>,
    /// Number of times the entry has been dispatched, including the current one
    pub attempts: u32,
    /// Token identifying the current claim
    pub claim: Uuid,
}

/// Repair queue capability
#[async_trait]
pub trait RepairQueue: Send + Sync {
    /// Insert a segment, or bump its recency if already queued.
    /// Returns true when a new entry was created.
    async fn push(&self, key: SegmentKey) -> QueueResult<bool>;

    /// Claim the next available entry without waiting
    async fn try_pop(&self) -> QueueResult<Option<RepairQueueEntry>>;

    /// Remove a claimed entry after a terminal outcome
    async fn mark_done(&self, entry: &RepairQueueEntry) -> QueueResult<()>;

    /// Release a claimed entry, hidden from `pop` for `delay`
    async fn requeue(&self, entry: &RepairQueueEntry, delay: Duration) -> QueueResult<()>;

    /// Number of live entries, claimed or not
    async fn len(&self) -> QueueResult<usize>;

    /// Signalled whenever an entry may have become available
    fn notify(&self) -> &Notify;

    fn poll_interval(&self) -> Duration;

    /// Claim the next entry, waiting until one is available.
    /// Returns `None` once `shutdown` fires.
    async fn pop(&self, shutdown: &Shutdown) -> QueueResult<Option<RepairQueueEntry>> {
        loop {
            if shutdown.is_triggered() {
                return Ok(None);
            }
            if let Some(entry) = self.try_pop().await? {
                return Ok(Some(entry));
            }

            tokio::select! {
                _ = self.notify().notified() => {}
                _ = tokio::time::sleep(self.poll_interval()) => {}
                _ = shutdown.triggered() => return Ok(None),
            }
        }
    }
}

#[derive(Debug)]
struct Slot {
    entry: RepairQueueEntry,
    available_at: Instant,
    claimed_until: Option<Instant>,
}

/// In-memory repair queue
pub struct MemoryRepairQueue {
    slots: Mutex<Vec<Slot>>,
    config: QueueConfig,
    notify: Notify,
}

impl MemoryRepairQueue {
    pub fn new(config: QueueConfig) -> QueueResult<Self> {
        config.validate()?;
        Ok(Self {
            slots: Mutex::new(Vec::new()),
            config,
            notify: Notify::new(),
        })
    }
}

#[async_trait]
impl RepairQueue for MemoryRepairQueue {
    async fn push(&self, key: SegmentKey) -> QueueResult<bool> {
        let now = SystemTime::now();
        let inserted = {
            let mut slots = self.slots.lock();
            match slots.iter_mut().find(|slot| slot.entry.segment_key == key) {
                Some(slot) => {
                    slot.entry.updated_at = now;
                    false
                }
                None => {
                    slots.push(Slot {
                        entry: RepairQueueEntry {
                            segment_key: key,
                            inserted_at: now,
                            updated_at: now,
                            last_attempted_at: None,
                            attempts: 0,
                            claim: Uuid::nil(),
                        },
                        available_at: Instant::now(),
                        claimed_until: None,
                    });
                    true
                }
            }
        };

        if inserted {
            self.notify.notify_one();
        }
        Ok(inserted)
    }

    async fn try_pop(&self) -> QueueResult<Option<RepairQueueEntry>> {
        let now = Instant::now();
        let mut slots = self.slots.lock();

        let slot = slots.iter_mut().find(|slot| {
            slot.available_at <= now && slot.claimed_until.map_or(true, |until| until <= now)
        });

        Ok(slot.map(|slot| {
            slot.entry.claim = Uuid::new_v4();
            slot.entry.attempts += 1;
            slot.entry.last_attempted_at = Some(SystemTime::now());
            slot.claimed_until = Some(now + self.config.lease_timeout);
            slot.entry.clone()
        }))
    }

    async fn mark_done(&self, entry: &RepairQueueEntry) -> QueueResult<()> {
        let mut slots = self.slots.lock();
        let position = slots.iter().position(|slot| {
            slot.entry.segment_key == entry.segment_key
                && slot.entry.claim == entry.claim
                && slot.claimed_until.is_some()
        });

        match position {
            Some(index) => {
                slots.remove(index);
                Ok(())
            }
            None => Err(QueueError::StaleClaim {
                key: entry.segment_key.clone(),
            }),
        }
    }

    async fn requeue(&self, entry: &RepairQueueEntry, delay: Duration) -> QueueResult<()> {
        {
            let mut slots = self.slots.lock();
            let slot = slots
                .iter_mut()
                .find(|slot| {
                    slot.entry.segment_key == entry.segment_key
                        && slot.entry.claim == entry.claim
                        && slot.claimed_until.is_some()
                })
                .ok_or_else(|| QueueError::StaleClaim {
                    key: entry.segment_key.clone(),
                })?;

            slot.claimed_until = None;
            slot.available_at = Instant::now() + delay;
        }

        if delay.is_zero() {
            self.notify.notify_one();
        }
        Ok(())
    }

    async fn len(&self) -> QueueResult<usize> {
        Ok(self.slots.lock().len())
    }

    fn notify(&self) -> &Notify {
        &self.notify
    }

    fn poll_interval(&self) -> Duration {
        self.config.poll_interval
    }
}

/// Helper functions for time conversion
fn system_time_to_micros(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as i64
}

fn micros_to_system_time(micros: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_micros(micros.max(0) as u64)
}

/// Helper function to parse a queue entry from a database row
fn parse_queue_entry(row: &Row) -> SqliteResult<RepairQueueEntry> {
    let claim = match row.get::<_, Option<String>>("claim")? {
        Some(text) => Uuid::parse_str(&text).map_err(|_| {
            rusqlite::Error::InvalidColumnType(5, "claim".to_string(), rusqlite::types::Type::Text)
        })?,
        None => Uuid::nil(),
    };

    Ok(RepairQueueEntry {
        segment_key: SegmentKey(row.get("segment_key")?),
        inserted_at: micros_to_system_time(row.get("inserted_at")?),
        updated_at: micros_to_system_time(row.get("updated_at")?),
        last_attempted_at: row
            .get::<_, Option<i64>>("last_attempted_at")?
            .map(micros_to_system_time),
        attempts: row.get::<_, i64>("attempts")? as u32,
        claim,
    })
}

/// Repair queue backed by SQLite. Entries, claims and delays survive restarts.
pub struct SqliteRepairQueue {
    conn: Mutex<Connection>,
    config: QueueConfig,
    notify: Notify,
}

impl SqliteRepairQueue {
    /// Create or open a queue database at the specified path
    pub fn new<P: AsRef<Path>>(db_path: P, config: QueueConfig) -> QueueResult<Self> {
        Self::with_connection(Connection::open(db_path)?, config)
    }

    /// Open a private in-memory queue database
    pub fn in_memory(config: QueueConfig) -> QueueResult<Self> {
        Self::with_connection(Connection::open_in_memory()?, config)
    }

    fn with_connection(conn: Connection, config: QueueConfig) -> QueueResult<Self> {
        config.validate()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS repair_queue (
                segment_key TEXT PRIMARY KEY,
                inserted_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                last_attempted_at INTEGER,
                attempts INTEGER NOT NULL DEFAULT 0,
                claim TEXT,
                claimed_until INTEGER,
                available_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_repair_queue_order
                ON repair_queue(inserted_at);
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            config,
            notify: Notify::new(),
        })
    }
}

#[async_trait]
impl RepairQueue for SqliteRepairQueue {
    async fn push(&self, key: SegmentKey) -> QueueResult<bool> {
        let now = system_time_to_micros(SystemTime::now());
        let inserted = {
            let mut conn = self.conn.lock();
            let tx = conn.transaction()?;

            let exists = tx
                .query_row(
                    "SELECT 1 FROM repair_queue WHERE segment_key = ?1",
                    [key.as_str()],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();

            if exists {
                tx.execute(
                    "UPDATE repair_queue SET updated_at = ?2 WHERE segment_key = ?1",
                    (key.as_str(), now),
                )?;
            } else {
                tx.execute(
                    r#"
                    INSERT INTO repair_queue (
                        segment_key, inserted_at, updated_at, attempts, available_at
                    ) VALUES (?1, ?2, ?2, 0, ?2)
                    "#,
                    (key.as_str(), now),
                )?;
            }
            tx.commit()?;
            !exists
        };

        if inserted {
            debug!("Queued {} for repair", key);
            self.notify.notify_one();
        }
        Ok(inserted)
    }

    async fn try_pop(&self) -> QueueResult<Option<RepairQueueEntry>> {
        let now_time = SystemTime::now();
        let now = system_time_to_micros(now_time);
        let lease_until = system_time_to_micros(now_time + self.config.lease_timeout);

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let entry = tx
            .query_row(
                r#"
                SELECT segment_key, inserted_at, updated_at, last_attempted_at, attempts, claim
                FROM repair_queue
                WHERE available_at <= ?1 AND (claimed_until IS NULL OR claimed_until <= ?1)
                ORDER BY inserted_at, rowid
                LIMIT 1
                "#,
                [now],
                parse_queue_entry,
            )
            .optional()?;

        let Some(mut entry) = entry else {
            return Ok(None);
        };

        entry.claim = Uuid::new_v4();
        entry.attempts += 1;
        entry.last_attempted_at = Some(micros_to_system_time(now));

        tx.execute(
            r#"
            UPDATE repair_queue
            SET claim = ?2, claimed_until = ?3, attempts = ?4, last_attempted_at = ?5
            WHERE segment_key = ?1
            "#,
            (
                entry.segment_key.as_str(),
                entry.claim.to_string(),
                lease_until,
                entry.attempts as i64,
                now,
            ),
        )?;
        tx.commit()?;

        Ok(Some(entry))
    }

    async fn mark_done(&self, entry: &RepairQueueEntry) -> QueueResult<()> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            r#"
            DELETE FROM repair_queue
            WHERE segment_key = ?1 AND claim = ?2 AND claimed_until IS NOT NULL
            "#,
            (entry.segment_key.as_str(), entry.claim.to_string()),
        )?;

        if rows == 0 {
            return Err(QueueError::StaleClaim {
                key: entry.segment_key.clone(),
            });
        }
        Ok(())
    }

    async fn requeue(&self, entry: &RepairQueueEntry, delay: Duration) -> QueueResult<()> {
        let available_at = system_time_to_micros(SystemTime::now() + delay);
        let rows = {
            let conn = self.conn.lock();
            conn.execute(
                r#"
                UPDATE repair_queue
                SET claim = NULL, claimed_until = NULL, available_at = ?3
                WHERE segment_key = ?1 AND claim = ?2 AND claimed_until IS NOT NULL
                "#,
                (
                    entry.segment_key.as_str(),
                    entry.claim.to_string(),
                    available_at,
                ),
            )?
        };

        if rows == 0 {
            return Err(QueueError::StaleClaim {
                key: entry.segment_key.clone(),
            });
        }

        if delay.is_zero() {
            self.notify.notify_one();
        }
        Ok(())
    }

    async fn len(&self) -> QueueResult<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM repair_queue", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn notify(&self) -> &Notify {
        &self.notify
    }

    fn poll_interval(&self) -> Duration {
        self.config.poll_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_config() -> QueueConfig {
        QueueConfig {
            lease_timeout: Duration::from_millis(100),
            poll_interval: Duration::from_millis(10),
        }
    }

    fn create_test_queues() -> Vec<Box<dyn RepairQueue>> {
        vec![
            Box::new(MemoryRepairQueue::new(create_test_config()).unwrap()),
            Box::new(SqliteRepairQueue::in_memory(create_test_config()).unwrap()),
        ]
    }

    #[tokio::test]
    async fn test_push_deduplicates() {
        for queue in create_test_queues() {
            assert!(queue.push("a".into()).await.unwrap());
            assert!(!queue.push("a".into()).await.unwrap());
            assert_eq!(queue.len().await.unwrap(), 1);

            let entry = queue.try_pop().await.unwrap().unwrap();
            assert_eq!(entry.segment_key, SegmentKey::from("a"));
            assert_eq!(entry.attempts, 1);
            assert!(entry.updated_at >= entry.inserted_at);
            assert!(queue.try_pop().await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_oldest_inserted_first_and_bump_keeps_position() {
        for queue in create_test_queues() {
            for key in ["first", "second", "third"] {
                queue.push(key.into()).await.unwrap();
            }
            // Re-reporting does not move an entry to the back
            queue.push("first".into()).await.unwrap();

            let order: Vec<String> = {
                let mut keys = Vec::new();
                while let Some(entry) = queue.try_pop().await.unwrap() {
                    keys.push(entry.segment_key.0);
                }
                keys
            };
            assert_eq!(order, vec!["first", "second", "third"]);
        }
    }

    #[tokio::test]
    async fn test_requeue_with_delay_hides_entry() {
        for queue in create_test_queues() {
            queue.push("a".into()).await.unwrap();
            queue.push("b".into()).await.unwrap();

            let a = queue.try_pop().await.unwrap().unwrap();
            queue.requeue(&a, Duration::from_millis(50)).await.unwrap();

            // Delayed entry is skipped in favour of the next one
            let b = queue.try_pop().await.unwrap().unwrap();
            assert_eq!(b.segment_key, SegmentKey::from("b"));
            assert!(queue.try_pop().await.unwrap().is_none());

            tokio::time::sleep(Duration::from_millis(70)).await;
            let again = queue.try_pop().await.unwrap().unwrap();
            assert_eq!(again.segment_key, SegmentKey::from("a"));
            assert_eq!(again.attempts, 2);

            // The released claim can no longer complete the entry
            assert!(matches!(
                queue.mark_done(&a).await,
                Err(QueueError::StaleClaim { .. })
            ));
            queue.mark_done(&again).await.unwrap();
            queue.mark_done(&b).await.unwrap();
            assert_eq!(queue.len().await.unwrap(), 0);
        }
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimable() {
        for queue in create_test_queues() {
            queue.push("a".into()).await.unwrap();
            let first = queue.try_pop().await.unwrap().unwrap();
            assert!(queue.try_pop().await.unwrap().is_none());

            tokio::time::sleep(Duration::from_millis(150)).await;
            let second = queue.try_pop().await.unwrap().unwrap();
            assert_ne!(first.claim, second.claim);

            assert!(matches!(
                queue.requeue(&first, Duration::ZERO).await,
                Err(QueueError::StaleClaim { .. })
            ));
            queue.mark_done(&second).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_pop_returns_none_on_shutdown() {
        for queue in create_test_queues() {
            let shutdown = Shutdown::new();
            shutdown.trigger();
            queue.push("a".into()).await.unwrap();
            assert!(queue.pop(&shutdown).await.unwrap().is_none());
        }
    }

    #[test]
    fn test_invalid_configuration() {
        let config = QueueConfig {
            lease_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(
            MemoryRepairQueue::new(config),
            Err(QueueError::Configuration { .. })
        ));
    }
}
