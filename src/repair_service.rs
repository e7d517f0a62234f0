//! Repair Service Module
//!
//! The worker loop that drains the repair queue. A fixed number of slots each
//! pop an entry, run the segment repairer on it and settle the entry:
//! terminal outcomes remove it, failed attempts are requeued with exponential
//! back-off until `max_attempts` is reached, after which the segment is
//! reported as permanently failed.
//!
//! A coordinator ticks every `interval`, reaps slots that ended and respawns
//! missing ones. A fatal repair error stops every slot, waits for in-flight
//! attempts to unwind and is returned from `run`.

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::repair_queue::{RepairQueue, RepairQueueEntry};
use crate::repairer::{
    ErrorKind, FailureKind, RepairConfig, RepairError, RepairOutcome, RepairResult, SegmentRepairer,
};
use crate::segment::SegmentKey;
use crate::shutdown::Shutdown;

/// Errors that stop the repair service
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Fatal error repairing {key}: {source}")]
    Fatal {
        key: SegmentKey,
        #[source]
        source: RepairError,
    },
}

/// Counters over every attempt the service has made
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairStats {
    pub attempted: u64,
    pub repaired: u64,
    pub not_damaged: u64,
    pub irreparable: u64,
    pub failed_transient: u64,
    pub failed_consistency: u64,
    pub permanently_failed: u64,
    pub pieces_fetched: u64,
    pub pieces_placed: u64,
}

impl RepairStats {
    fn record(&mut self, result: &RepairResult) {
        self.attempted += 1;
        self.pieces_fetched += result.pieces_fetched as u64;
        self.pieces_placed += result.pieces_placed as u64;
        match result.outcome {
            RepairOutcome::Repaired => self.repaired += 1,
            RepairOutcome::NotDamaged => self.not_damaged += 1,
            RepairOutcome::Irreparable => self.irreparable += 1,
            RepairOutcome::Failed(FailureKind::Transient) => self.failed_transient += 1,
            RepairOutcome::Failed(FailureKind::Consistency) => self.failed_consistency += 1,
        }
    }
}

/// Receives a record of every repair attempt
pub trait RepairObserver: Send + Sync {
    fn on_attempt(&self, result: &RepairResult);

    /// A segment exhausted its attempts and was removed from the queue
    fn on_permanent_failure(&self, _entry: &RepairQueueEntry, _result: &RepairResult) {}
}

/// Observer that writes attempt records to the log
#[derive(Debug, Default)]
pub struct LoggingObserver;

impl RepairObserver for LoggingObserver {
    fn on_attempt(&self, result: &RepairResult) {
        debug!(
            segment = %result.segment_key,
            outcome = ?result.outcome,
            duration_ms = result.duration.as_millis() as u64,
            fetched = result.pieces_fetched,
            placed = result.pieces_placed,
            "repair attempt"
        );
    }
}

/// State shared by all slots
struct SlotContext {
    queue: Arc<dyn RepairQueue>,
    repairer: Arc<SegmentRepairer>,
    config: RepairConfig,
    stats: RwLock<RepairStats>,
    observer: Arc<dyn RepairObserver>,
}

impl SlotContext {
    /// Record the attempt and settle the queue entry
    async fn settle(&self, entry: &RepairQueueEntry, result: RepairResult) {
        self.stats.write().record(&result);
        self.observer.on_attempt(&result);

        let settled = if result.outcome.is_terminal() {
            self.queue.mark_done(entry).await
        } else if entry.attempts >= self.config.max_attempts {
            self.stats.write().permanently_failed += 1;
            error!(
                "Segment {} permanently failed after {} attempts: {}",
                entry.segment_key,
                entry.attempts,
                result.reason.as_deref().unwrap_or("unknown")
            );
            self.observer.on_permanent_failure(entry, &result);
            self.queue.mark_done(entry).await
        } else {
            let delay = self.config.backoff_for(entry.attempts);
            debug!(
                "Requeueing {} after attempt {} with {:?} delay",
                entry.segment_key, entry.attempts, delay
            );
            self.queue.requeue(entry, delay).await
        };

        if let Err(e) = settled {
            warn!("Failed to settle queue entry {}: {}", entry.segment_key, e);
        }
    }

    /// Hand an interrupted entry straight back to the queue
    async fn release(&self, entry: &RepairQueueEntry) {
        if let Err(e) = self.queue.requeue(entry, Duration::ZERO).await {
            warn!("Failed to release queue entry {}: {}", entry.segment_key, e);
        }
    }
}

/// One worker slot: pop, repair, settle, until shutdown or a fatal error
async fn run_slot(ctx: Arc<SlotContext>, shutdown: Shutdown) -> Result<(), ServiceError> {
    loop {
        let entry = match ctx.queue.pop(&shutdown).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!("Repair queue error: {}", e);
                tokio::select! {
                    _ = tokio::time::sleep(ctx.config.interval) => continue,
                    _ = shutdown.triggered() => return Ok(()),
                }
            }
        };

        match ctx.repairer.repair(&entry.segment_key, &shutdown).await {
            Ok(result) => ctx.settle(&entry, result).await,
            Err(e) if e.kind() == ErrorKind::Cancelled => {
                ctx.release(&entry).await;
                return Ok(());
            }
            Err(e) => {
                ctx.release(&entry).await;
                return Err(ServiceError::Fatal {
                    key: entry.segment_key,
                    source: e,
                });
            }
        }
    }
}

/// Bounded-concurrency worker loop over the repair queue
pub struct RepairService {
    ctx: Arc<SlotContext>,
}

impl RepairService {
    pub fn new(queue: Arc<dyn RepairQueue>, repairer: Arc<SegmentRepairer>) -> Self {
        Self::with_observer(queue, repairer, Arc::new(LoggingObserver))
    }

    pub fn with_observer(
        queue: Arc<dyn RepairQueue>,
        repairer: Arc<SegmentRepairer>,
        observer: Arc<dyn RepairObserver>,
    ) -> Self {
        let config = repairer.config().clone();
        Self {
            ctx: Arc::new(SlotContext {
                queue,
                repairer,
                config,
                stats: RwLock::new(RepairStats::default()),
                observer,
            }),
        }
    }

    /// Snapshot of the attempt counters
    pub fn stats(&self) -> RepairStats {
        self.ctx.stats.read().clone()
    }

    /// Run until `shutdown` fires or a slot hits a fatal error. In-flight
    /// attempts are drained before returning.
    pub async fn run(&self, shutdown: &Shutdown) -> Result<(), ServiceError> {
        let slots_shutdown = shutdown.child();
        let width = self.ctx.config.max_concurrent_repairs;
        let mut slots: JoinSet<Result<(), ServiceError>> = JoinSet::new();
        let mut fatal: Option<ServiceError> = None;

        let mut ticker = tokio::time::interval(self.ctx.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Repair service starting with {} slots", width);

        loop {
            tokio::select! {
                _ = slots_shutdown.triggered() => break,
                _ = ticker.tick() => {
                    let missing = width.saturating_sub(slots.len());
                    if missing > 0 {
                        debug!("Spawning {} repair slots", missing);
                    }
                    for _ in 0..missing {
                        slots.spawn(run_slot(self.ctx.clone(), slots_shutdown.clone()));
                    }
                }
                Some(joined) = slots.join_next() => {
                    if let Some(e) = reap(joined) {
                        error!("Stopping repair service: {}", e);
                        fatal.get_or_insert(e);
                        slots_shutdown.trigger();
                    }
                }
            }
        }

        debug!("Draining {} repair slots", slots.len());
        while let Some(joined) = slots.join_next().await {
            if let Some(e) = reap(joined) {
                error!("Repair slot failed during shutdown: {}", e);
                fatal.get_or_insert(e);
            }
        }

        info!("Repair service stopped: {:?}", self.stats());
        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Fatal error from a finished slot, if any
fn reap(joined: Result<Result<(), ServiceError>, tokio::task::JoinError>) -> Option<ServiceError> {
    match joined {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e),
        Err(e) => {
            error!("Repair slot ended abnormally: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_stats_record_outcomes() {
        let mut stats = RepairStats::default();
        let mut result = RepairResult {
            segment_key: "k".into(),
            outcome: RepairOutcome::Repaired,
            pieces_fetched: 5,
            pieces_placed: 3,
            duplicates_dropped: 0,
            duration: Duration::from_millis(5),
            reason: None,
        };
        stats.record(&result);

        result.outcome = RepairOutcome::Failed(FailureKind::Consistency);
        result.pieces_placed = 0;
        stats.record(&result);

        assert_eq!(stats.attempted, 2);
        assert_eq!(stats.repaired, 1);
        assert_eq!(stats.failed_consistency, 1);
        assert_eq!(stats.pieces_fetched, 10);
        assert_eq!(stats.pieces_placed, 3);
    }
}
