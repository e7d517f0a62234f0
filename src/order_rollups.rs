//! Order Rollups Module
//!
//! Asynchronous settlement of repair bandwidth. The order authorizer pushes a
//! `UsageRecord` for every completed transfer onto a channel; this chore
//! aggregates them per (node, action) and periodically writes the rollups to
//! the orders database. A failed write is logged and the batch is kept for the
//! next flush, so accounting trouble never reaches the repair path.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::orders::{Action, OrdersConfig, UsageRecord};
use crate::segment::NodeId;
use crate::shutdown::Shutdown;

/// Errors that can occur while persisting bandwidth rollups
#[derive(Error, Debug)]
pub enum OrdersDbError {
    #[error("Orders database unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Result type for orders database operations
pub type OrdersDbResult<T> = Result<T, OrdersDbError>;

/// Aggregated bandwidth for one node and action
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BandwidthRollup {
    pub node_id: NodeId,
    pub action: Action,
    pub bytes: u64,
    /// Number of transfers folded into this rollup
    pub count: u64,
    pub interval_start: SystemTime,
}

/// Durable bandwidth accounting capability
#[async_trait]
pub trait OrdersDb: Send + Sync {
    /// Add the rollups to the stored totals
    async fn update_bandwidth_rollups(&self, rollups: &[BandwidthRollup]) -> OrdersDbResult<()>;
}

/// In-memory orders database, with a switch to simulate outages
#[derive(Debug, Default)]
pub struct MemoryOrdersDb {
    totals: Mutex<HashMap<(NodeId, Action), (u64, u64)>>,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
    write_attempts: AtomicUsize,
}

impl MemoryOrdersDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent writes fail until switched off again
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Settled bytes for a node and action
    pub fn total_bytes(&self, node_id: &NodeId, action: Action) -> u64 {
        self.totals
            .lock()
            .get(&(*node_id, action))
            .map(|(bytes, _)| *bytes)
            .unwrap_or(0)
    }

    /// Settled bytes across all nodes for an action
    pub fn action_bytes(&self, action: Action) -> u64 {
        self.totals
            .lock()
            .iter()
            .filter(|((_, a), _)| *a == action)
            .map(|(_, (bytes, _))| *bytes)
            .sum()
    }

    /// Number of successful writes
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of writes attempted, failed ones included
    pub fn write_attempts(&self) -> usize {
        self.write_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OrdersDb for MemoryOrdersDb {
    async fn update_bandwidth_rollups(&self, rollups: &[BandwidthRollup]) -> OrdersDbResult<()> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(OrdersDbError::Unavailable {
                reason: "simulated outage".to_string(),
            });
        }

        let mut totals = self.totals.lock();
        for rollup in rollups {
            let entry = totals.entry((rollup.node_id, rollup.action)).or_insert((0, 0));
            entry.0 += rollup.bytes;
            entry.1 += rollup.count;
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Background chore batching usage records into bandwidth rollups
pub struct UsageRollupChore {
    db: Arc<dyn OrdersDb>,
    config: OrdersConfig,
    rx: mpsc::UnboundedReceiver<UsageRecord>,
    pending: BTreeMap<(NodeId, Action), BandwidthRollup>,
    pending_records: usize,
    /// Set after a failed write; batch-size flushes wait for the next tick
    flush_failed: bool,
}

impl UsageRollupChore {
    /// Create the chore and the sender the order authorizer reports usage on
    pub fn new(db: Arc<dyn OrdersDb>, config: OrdersConfig) -> (Self, mpsc::UnboundedSender<UsageRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let chore = Self {
            db,
            config,
            rx,
            pending: BTreeMap::new(),
            pending_records: 0,
            flush_failed: false,
        };
        (chore, tx)
    }

    fn add(&mut self, record: UsageRecord) {
        let rollup = self
            .pending
            .entry((record.node_id, record.action))
            .or_insert_with(|| BandwidthRollup {
                node_id: record.node_id,
                action: record.action,
                bytes: 0,
                count: 0,
                interval_start: record.recorded_at,
            });
        rollup.bytes += record.bytes;
        rollup.count += 1;
        rollup.interval_start = rollup.interval_start.min(record.recorded_at);
        self.pending_records += 1;
    }

    async fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }

        let rollups: Vec<BandwidthRollup> = self.pending.values().cloned().collect();
        match self.db.update_bandwidth_rollups(&rollups).await {
            Ok(()) => {
                debug!(
                    "Flushed {} usage records as {} bandwidth rollups",
                    self.pending_records,
                    rollups.len()
                );
                self.pending.clear();
                self.pending_records = 0;
                self.flush_failed = false;
            }
            Err(e) => {
                self.flush_failed = true;
                warn!(
                    "Failed to flush {} bandwidth rollups, keeping them for the next flush: {}",
                    rollups.len(),
                    e
                );
            }
        }
    }

    /// Run until `shutdown` fires or every sender is dropped, then flush
    /// whatever is still buffered.
    pub async fn run(mut self, shutdown: Shutdown) {
        let mut ticker = tokio::time::interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.triggered() => break,
                record = self.rx.recv() => match record {
                    Some(record) => {
                        self.add(record);
                        if !self.flush_failed && self.pending_records >= self.config.flush_batch_size {
                            self.flush().await;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => self.flush().await,
            }
        }

        while let Ok(record) = self.rx.try_recv() {
            self.add(record);
        }
        self.flush().await;

        if !self.pending.is_empty() {
            warn!(
                "Usage rollup chore stopped with {} unsettled rollups",
                self.pending.len()
            );
        } else {
            info!("Usage rollup chore stopped");
        }
    }
}
