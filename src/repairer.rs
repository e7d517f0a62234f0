//! Segment Repairer Module
//!
//! This module implements the repair protocol for a single damaged segment:
//!
//! 1. Evaluating: load the pointer, ask the overlay which piece holders are
//!    still healthy and apply the redundancy policy.
//! 2. Fetching: download the healthy pieces in parallel under GET_REPAIR
//!    order limits, verifying each against its hash and size.
//! 3. Reconstructing: decode the segment from at least `k` shares and
//!    re-encode it to produce the missing piece numbers.
//! 4. Placing: select fresh nodes outside the segment's current holders and
//!    upload the new pieces under PUT_REPAIR order limits.
//! 5. Finalizing: rewrite the piece list and persist it with a single
//!    version-checked pointer write.
//!
//! Only fatal errors and cancellation escape `repair` as `Err`; every other
//! problem ends the attempt with a `Failed` outcome the worker loop can retry.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::erasure_coding::{missing_piece_numbers, ErasureCoder, ErasureError};
use crate::fanout::{BoundedTaskGroup, TaskOutcome};
use crate::metadata_store::{PointerStore, PointerStoreError};
use crate::orders::{AddressedOrderLimit, OrdersError, OrdersService};
use crate::overlay::{Node, OverlayError, OverlayService, Subnet};
use crate::redundancy::{HealthVerdict, RedundancyPolicy, DEFAULT_EXCESS_RATE_OPTIMAL_THRESHOLD};
use crate::segment::{NodeId, Piece, PieceHash, Segment, SegmentError, SegmentKey};
use crate::shutdown::Shutdown;
use crate::transport::{DownloadResponse, PieceTransport, TransferError, UploadResponse};

/// Configuration for segment repair and the worker loop driving it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairConfig {
    /// Number of segments repaired concurrently
    pub max_concurrent_repairs: usize,
    /// Worker loop cycle: capacity re-check and back-off after queue errors
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Per-node contact timeout for a single download or upload
    #[serde(with = "humantime_serde")]
    pub node_timeout: Duration,
    /// Upper bound on one whole repair attempt
    #[serde(with = "humantime_serde")]
    pub segment_timeout: Duration,
    /// Attempts before a segment is reported as permanently failed
    pub max_attempts: u32,
    /// Delay before the first retry, doubled on every further attempt
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub max_retry_backoff: Duration,
    /// Fraction of the success threshold uploaded on top of it
    pub excess_rate_optimal_threshold: f64,
    /// Replaces every segment's repair threshold when set
    pub repair_override: Option<usize>,
    /// Maximum concurrent transfers within one attempt
    pub max_transfer_fan_out: usize,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            max_concurrent_repairs: 5,
            interval: Duration::from_secs(10),
            node_timeout: Duration::from_secs(30),
            segment_timeout: Duration::from_secs(5 * 60),
            max_attempts: 5,
            retry_backoff: Duration::from_secs(30),
            max_retry_backoff: Duration::from_secs(60 * 60),
            excess_rate_optimal_threshold: DEFAULT_EXCESS_RATE_OPTIMAL_THRESHOLD,
            repair_override: None,
            max_transfer_fan_out: 16,
        }
    }
}

impl RepairConfig {
    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), RepairError> {
        let invalid = |reason: &str| {
            Err(RepairError::Configuration {
                reason: reason.to_string(),
            })
        };

        if self.max_concurrent_repairs == 0 {
            return invalid("max_concurrent_repairs must be greater than 0");
        }
        if self.interval.is_zero() {
            return invalid("interval must be greater than 0");
        }
        if self.node_timeout.is_zero() || self.segment_timeout.is_zero() {
            return invalid("node_timeout and segment_timeout must be greater than 0");
        }
        if self.max_attempts == 0 {
            return invalid("max_attempts must be greater than 0");
        }
        if !(self.excess_rate_optimal_threshold >= 0.0) {
            return invalid("excess_rate_optimal_threshold must not be negative");
        }
        if self.repair_override == Some(0) {
            return invalid("repair_override must be greater than 0");
        }
        if self.max_transfer_fan_out == 0 {
            return invalid("max_transfer_fan_out must be greater than 0");
        }
        if self.max_retry_backoff < self.retry_backoff {
            return invalid("max_retry_backoff must not be smaller than retry_backoff");
        }
        Ok(())
    }

    /// Redundancy policy derived from the override and excess rate
    pub fn policy(&self) -> RedundancyPolicy {
        RedundancyPolicy::new(self.repair_override, self.excess_rate_optimal_threshold)
    }

    /// Requeue delay after the given number of attempts
    pub fn backoff_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(16);
        self.retry_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_retry_backoff)
    }
}

/// Classification of repair errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retry later with back-off
    Transient,
    /// Abort the attempt without touching the pointer; a fresh retry is safe
    Consistency,
    /// No attempt can succeed; stop the worker loop
    Fatal,
    /// Shutdown interrupted the attempt
    Cancelled,
}

/// Errors that can occur while repairing a segment
#[derive(Error, Debug)]
pub enum RepairError {
    #[error("Pointer store error: {0}")]
    PointerStore(#[from] PointerStoreError),

    #[error("Overlay error: {0}")]
    Overlay(#[from] OverlayError),

    #[error("Orders error: {0}")]
    Orders(#[from] OrdersError),

    #[error("Erasure coding error: {0}")]
    Erasure(#[from] ErasureError),

    #[error("Segment error: {0}")]
    Segment(#[from] SegmentError),

    #[error("Fetched only {fetched} of {needed} pieces needed for {key}")]
    InsufficientPieces {
        key: SegmentKey,
        needed: usize,
        fetched: usize,
    },

    #[error("Placed {placed} pieces for {key}, healthy total {healthy} is below repair threshold {needed}")]
    InsufficientPlacements {
        key: SegmentKey,
        placed: usize,
        healthy: usize,
        needed: usize,
    },

    #[error("Fetched piece {piece_num} of {key} disagrees with the reconstruction")]
    InconsistentShares { key: SegmentKey, piece_num: u16 },

    #[error("Repair of {key} exceeded {timeout:?}")]
    Timeout { key: SegmentKey, timeout: Duration },

    #[error("Repair of {key} cancelled")]
    Cancelled { key: SegmentKey },

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },
}

impl RepairError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RepairError::PointerStore(PointerStoreError::VersionConflict { .. }) => {
                ErrorKind::Consistency
            }
            RepairError::PointerStore(PointerStoreError::InvalidPointer { .. }) => {
                ErrorKind::Consistency
            }
            RepairError::PointerStore(_) => ErrorKind::Transient,
            RepairError::Overlay(OverlayError::Configuration { .. }) => ErrorKind::Fatal,
            RepairError::Overlay(_) => ErrorKind::Transient,
            RepairError::Orders(e) if e.is_fatal() => ErrorKind::Fatal,
            RepairError::Orders(_) => ErrorKind::Transient,
            RepairError::Erasure(ErasureError::InvalidConfiguration { .. }) => ErrorKind::Fatal,
            RepairError::Erasure(_) => ErrorKind::Consistency,
            RepairError::Segment(SegmentError::InvalidScheme { .. }) => ErrorKind::Fatal,
            RepairError::Segment(_) => ErrorKind::Consistency,
            RepairError::InsufficientPieces { .. } => ErrorKind::Transient,
            RepairError::InsufficientPlacements { .. } => ErrorKind::Transient,
            RepairError::InconsistentShares { .. } => ErrorKind::Consistency,
            RepairError::Timeout { .. } => ErrorKind::Transient,
            RepairError::Cancelled { .. } => ErrorKind::Cancelled,
            RepairError::Configuration { .. } => ErrorKind::Fatal,
        }
    }
}

/// Why a retryable attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    Transient,
    Consistency,
}

/// Terminal outcome of one repair attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepairOutcome {
    /// Pointer rewritten with enough healthy pieces
    Repaired,
    /// Nothing to do: healthy, expired or deleted
    NotDamaged,
    /// Fewer than `k` healthy pieces remain
    Irreparable,
    Failed(FailureKind),
}

impl RepairOutcome {
    /// Whether the queue entry is finished with
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RepairOutcome::Failed(_))
    }
}

/// Record of one repair attempt
#[derive(Debug, Clone)]
pub struct RepairResult {
    pub segment_key: SegmentKey,
    pub outcome: RepairOutcome,
    pub pieces_fetched: usize,
    pub pieces_placed: usize,
    pub duplicates_dropped: usize,
    pub duration: Duration,
    pub reason: Option<String>,
}

/// Shares downloaded during Fetching and the pieces they came from
struct FetchedShares {
    /// One slot per piece number
    shares: Vec<Option<Vec<u8>>>,
    /// Pieces whose bytes arrived and passed verification
    verified: Vec<Piece>,
}

#[derive(Debug, Default)]
struct AttemptProgress {
    fetched: usize,
    placed: usize,
    duplicates_dropped: usize,
    reason: Option<String>,
}

/// Repairs one segment at a time; shared by all worker slots
pub struct SegmentRepairer {
    pointers: Arc<dyn PointerStore>,
    overlay: Arc<OverlayService>,
    orders: Arc<OrdersService>,
    transport: Arc<dyn PieceTransport>,
    coder: Arc<dyn ErasureCoder>,
    policy: RedundancyPolicy,
    config: RepairConfig,
}

impl SegmentRepairer {
    pub fn new(
        pointers: Arc<dyn PointerStore>,
        overlay: Arc<OverlayService>,
        orders: Arc<OrdersService>,
        transport: Arc<dyn PieceTransport>,
        coder: Arc<dyn ErasureCoder>,
        config: RepairConfig,
    ) -> Result<Self, RepairError> {
        config.validate()?;
        Ok(Self {
            pointers,
            overlay,
            orders,
            transport,
            coder,
            policy: config.policy(),
            config,
        })
    }

    pub fn config(&self) -> &RepairConfig {
        &self.config
    }

    /// Run one repair attempt for `key`.
    ///
    /// Returns `Err` only for fatal errors and cancellation; every other
    /// failure is reported as `RepairOutcome::Failed`.
    pub async fn repair(&self, key: &SegmentKey, shutdown: &Shutdown) -> Result<RepairResult, RepairError> {
        let started = Instant::now();
        let mut progress = AttemptProgress::default();

        let result = tokio::select! {
            result = tokio::time::timeout(
                self.config.segment_timeout,
                self.attempt(key, shutdown, &mut progress),
            ) => match result {
                Ok(result) => result,
                Err(_) => Err(RepairError::Timeout {
                    key: key.clone(),
                    timeout: self.config.segment_timeout,
                }),
            },
            _ = shutdown.triggered() => Err(RepairError::Cancelled { key: key.clone() }),
        };

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => match e.kind() {
                ErrorKind::Fatal => {
                    error!("Fatal error repairing {}: {}", key, e);
                    return Err(e);
                }
                ErrorKind::Cancelled => {
                    info!("Repair of {} cancelled", key);
                    return Err(e);
                }
                ErrorKind::Transient => {
                    progress.reason = Some(e.to_string());
                    RepairOutcome::Failed(FailureKind::Transient)
                }
                ErrorKind::Consistency => {
                    error!("Consistency fault repairing {}: {}", key, e);
                    progress.reason = Some(e.to_string());
                    RepairOutcome::Failed(FailureKind::Consistency)
                }
            },
        };

        let attempt = RepairResult {
            segment_key: key.clone(),
            outcome,
            pieces_fetched: progress.fetched,
            pieces_placed: progress.placed,
            duplicates_dropped: progress.duplicates_dropped,
            duration: started.elapsed(),
            reason: progress.reason,
        };

        match attempt.outcome {
            RepairOutcome::Failed(kind) => warn!(
                "Repair of {} failed ({:?}) after {:?}: fetched {}, placed {}: {}",
                key,
                kind,
                attempt.duration,
                attempt.pieces_fetched,
                attempt.pieces_placed,
                attempt.reason.as_deref().unwrap_or("unknown")
            ),
            outcome => info!(
                "Repair of {} finished as {:?} in {:?}: fetched {}, placed {}",
                key, outcome, attempt.duration, attempt.pieces_fetched, attempt.pieces_placed
            ),
        }

        Ok(attempt)
    }

    async fn attempt(
        &self,
        key: &SegmentKey,
        shutdown: &Shutdown,
        progress: &mut AttemptProgress,
    ) -> Result<RepairOutcome, RepairError> {
        // Evaluating
        let Some(segment) = self.pointers.get(key).await? else {
            debug!("Segment {} no longer exists, nothing to repair", key);
            return Ok(RepairOutcome::NotDamaged);
        };

        let now = SystemTime::now();
        if segment.is_expired(now) {
            debug!("Segment {} expired, skipping repair", key);
            return Ok(RepairOutcome::NotDamaged);
        }
        segment.validate()?;

        let healthy_nodes = self.overlay.healthy_nodes(&segment.node_ids()).await?;
        let healthy_ids: HashSet<NodeId> = healthy_nodes.keys().copied().collect();
        let evaluation = self.policy.evaluate(&segment, &healthy_ids, now);

        match evaluation.verdict {
            HealthVerdict::Healthy | HealthVerdict::Gone => {
                debug!(
                    "Segment {} has {} healthy pieces (threshold {}), no repair needed",
                    key,
                    evaluation.healthy_count(),
                    evaluation.repair_threshold
                );
                return Ok(RepairOutcome::NotDamaged);
            }
            HealthVerdict::Irreparable => {
                let reason = format!(
                    "{} healthy pieces, {} required to reconstruct",
                    evaluation.healthy_count(),
                    segment.scheme.data_shares
                );
                error!("Segment {} is irreparable: {}", key, reason);
                progress.reason = Some(reason);
                return Ok(RepairOutcome::Irreparable);
            }
            HealthVerdict::NeedsRepair => {}
        }

        info!(
            "Repairing {}: {} healthy, {} unhealthy, repair threshold {}, target {}",
            key,
            evaluation.healthy_count(),
            evaluation.unhealthy.len(),
            evaluation.repair_threshold,
            evaluation.placement_target
        );

        // Fetching
        let FetchedShares { shares, verified } = self
            .fetch(&segment, &evaluation.healthy, &healthy_nodes, shutdown, progress)
            .await?;

        // Pieces that could not be downloaded and verified count as lost
        let unverified = evaluation.healthy_count() - verified.len();
        if unverified > 0 {
            warn!(
                "{} of {} healthy pieces of {} could not be verified and will be replaced",
                unverified,
                evaluation.healthy_count(),
                key
            );
        }

        // Reconstructing
        let data = self.coder.decode(&shares, &segment.scheme, segment.size as usize)?;
        let encoded = self.coder.encode(&data, &segment.scheme)?;
        for (piece_num, share) in shares.iter().enumerate() {
            if let Some(share) = share {
                if encoded.get(piece_num) != Some(share) {
                    return Err(RepairError::InconsistentShares {
                        key: key.clone(),
                        piece_num: piece_num as u16,
                    });
                }
            }
        }

        // Placing
        let healthy_count = verified.len();
        let missing = missing_piece_numbers(
            verified.iter().map(|piece| piece.piece_num),
            &segment.scheme,
        );
        let wanted = evaluation
            .placement_target
            .saturating_sub(healthy_count)
            .min(missing.len());

        let exclude_nodes = evaluation.holders();
        let exclude_subnets: HashSet<Subnet> = if self.overlay.config().distinct_subnets {
            healthy_nodes.values().map(|node| node.last_net.clone()).collect()
        } else {
            HashSet::new()
        };

        let destinations = match self
            .overlay
            .select_for_repair(wanted, &exclude_nodes, &exclude_subnets)
            .await
        {
            Ok(nodes) => nodes,
            Err(OverlayError::InsufficientNodes { available, .. })
                if available > 0 && healthy_count + available >= evaluation.repair_threshold =>
            {
                warn!(
                    "Only {} of {} wanted nodes available for {}, placing a partial repair",
                    available, wanted, key
                );
                self.overlay
                    .select_for_repair(available, &exclude_nodes, &exclude_subnets)
                    .await?
            }
            Err(e) => return Err(e.into()),
        };

        let assignments: Vec<(u16, Node)> = missing.iter().copied().zip(destinations).collect();
        let placed = self
            .place(&segment, &assignments, &encoded, shutdown)
            .await?;
        progress.placed = placed.len();

        if healthy_count + placed.len() < evaluation.repair_threshold {
            return Err(RepairError::InsufficientPlacements {
                key: key.clone(),
                placed: placed.len(),
                healthy: healthy_count,
                needed: evaluation.repair_threshold,
            });
        }

        // Finalizing
        if !evaluation.duplicates.is_empty() {
            warn!(
                "Dropping {} duplicate piece entries from {}",
                evaluation.duplicates.len(),
                key
            );
        }
        let (pieces, dropped) = merge_pieces(verified, placed);
        progress.duplicates_dropped = evaluation.duplicates.len() + dropped;

        let mut updated = segment.clone();
        updated.pieces = pieces;
        updated.validate()?;

        let version = self.pointers.put(key, updated, segment.version).await?;
        debug!("Segment {} pointer updated to version {}", key, version);

        Ok(RepairOutcome::Repaired)
    }

    /// Download healthy pieces, one per node, verifying each against its
    /// hash and size. A node holding several pieces serves only one of them.
    async fn fetch(
        &self,
        segment: &Segment,
        healthy: &[Piece],
        healthy_nodes: &HashMap<NodeId, Node>,
        shutdown: &Shutdown,
        progress: &mut AttemptProgress,
    ) -> Result<FetchedShares, RepairError> {
        let mut seen = HashSet::new();
        let sources: Vec<(Piece, Node)> = healthy
            .iter()
            .filter(|piece| seen.insert(piece.node_id))
            .filter_map(|piece| {
                healthy_nodes
                    .get(&piece.node_id)
                    .map(|node| (piece.clone(), node.clone()))
            })
            .collect();

        let limits = self.orders.create_get_order_limits(segment, &sources)?;
        let share_size = segment.share_size();
        let mut by_number: HashMap<u16, Piece> = sources
            .iter()
            .map(|(piece, _)| (piece.piece_num, piece.clone()))
            .collect();

        let mut group: BoundedTaskGroup<u16, (AddressedOrderLimit, DownloadResponse), TransferError> =
            BoundedTaskGroup::new(self.config.max_transfer_fan_out, self.config.node_timeout);
        for (piece, node) in sources {
            let Some(limit) = limits.get(&node.id).cloned() else {
                continue;
            };
            let transport = self.transport.clone();
            group.spawn(piece.piece_num, async move {
                let response = transport.download(&limit).await?;
                if response.data.len() != share_size {
                    return Err(TransferError::Corrupted {
                        node_id: node.id,
                        reason: format!(
                            "piece {} is {} bytes, expected {}",
                            piece.piece_num,
                            response.data.len(),
                            share_size
                        ),
                    });
                }
                if let Some(hash) = piece.hash {
                    if !hash.matches(&response.data) {
                        return Err(TransferError::Corrupted {
                            node_id: node.id,
                            reason: format!("piece {} does not match hash {}", piece.piece_num, hash),
                        });
                    }
                }
                Ok((limit, response))
            });
        }

        let results = group.join_all(shutdown).await;
        if results.cancelled {
            return Err(RepairError::Cancelled {
                key: segment.key.clone(),
            });
        }

        let mut shares: Vec<Option<Vec<u8>>> = vec![None; segment.scheme.total_shares];
        let mut verified = Vec::with_capacity(results.outcomes.len());
        for (piece_num, outcome) in results.outcomes {
            match outcome {
                TaskOutcome::Completed((limit, response)) => {
                    self.orders
                        .record_usage(&limit.limit, response.bytes_transferred);
                    shares[piece_num as usize] = Some(response.data);
                    verified.extend(by_number.remove(&piece_num));
                    progress.fetched += 1;
                }
                TaskOutcome::Failed(e) => {
                    warn!("Failed to download piece {} of {}: {}", piece_num, segment.key, e);
                }
                TaskOutcome::TimedOut => {
                    warn!(
                        "Download of piece {} of {} timed out after {:?}",
                        piece_num, segment.key, self.config.node_timeout
                    );
                }
            }
        }

        if progress.fetched < segment.scheme.data_shares {
            return Err(RepairError::InsufficientPieces {
                key: segment.key.clone(),
                needed: segment.scheme.data_shares,
                fetched: progress.fetched,
            });
        }

        debug!(
            "Fetched {} pieces of {} from {} sources",
            progress.fetched,
            segment.key,
            limits.len()
        );
        Ok(FetchedShares { shares, verified })
    }

    /// Upload new pieces; returns the pieces that were stored and confirmed
    async fn place(
        &self,
        segment: &Segment,
        assignments: &[(u16, Node)],
        encoded: &[Vec<u8>],
        shutdown: &Shutdown,
    ) -> Result<Vec<Piece>, RepairError> {
        let limits = self.orders.create_put_order_limits(segment, assignments)?;

        let mut group: BoundedTaskGroup<
            (u16, NodeId),
            (AddressedOrderLimit, UploadResponse, PieceHash),
            TransferError,
        > = BoundedTaskGroup::new(self.config.max_transfer_fan_out, self.config.node_timeout);

        for (piece_num, node) in assignments {
            let (Some(limit), Some(data)) = (
                limits.get(&node.id).cloned(),
                encoded.get(*piece_num as usize).cloned(),
            ) else {
                continue;
            };
            let transport = self.transport.clone();
            let node_id = node.id;
            let piece_num = *piece_num;
            group.spawn((piece_num, node_id), async move {
                let expected = PieceHash::of(&data);
                let response = transport.upload(&limit, data).await?;
                if response.hash != expected {
                    return Err(TransferError::Corrupted {
                        node_id,
                        reason: format!(
                            "node stored piece {} with hash {}, expected {}",
                            piece_num, response.hash, expected
                        ),
                    });
                }
                Ok((limit, response, expected))
            });
        }

        let results = group.join_all(shutdown).await;
        if results.cancelled {
            return Err(RepairError::Cancelled {
                key: segment.key.clone(),
            });
        }

        let mut placed = Vec::with_capacity(results.outcomes.len());
        for ((piece_num, node_id), outcome) in results.outcomes {
            match outcome {
                TaskOutcome::Completed((limit, response, hash)) => {
                    self.orders
                        .record_usage(&limit.limit, response.bytes_transferred);
                    placed.push(Piece::new(piece_num, node_id, Some(hash)));
                }
                TaskOutcome::Failed(e) => {
                    warn!(
                        "Failed to upload piece {} of {} to {}: {}",
                        piece_num, segment.key, node_id, e
                    );
                }
                TaskOutcome::TimedOut => {
                    warn!(
                        "Upload of piece {} of {} to {} timed out after {:?}",
                        piece_num, segment.key, node_id, self.config.node_timeout
                    );
                }
            }
        }

        Ok(placed)
    }
}

/// Combine kept and newly placed pieces into a piece list ordered by piece
/// number. Where two entries share a number, the one with the lowest
/// `created_at` wins. Returns the list and the number of entries dropped.
fn merge_pieces(kept: Vec<Piece>, placed: Vec<Piece>) -> (Vec<Piece>, usize) {
    let mut pieces: Vec<Piece> = kept.into_iter().chain(placed).collect();
    pieces.sort_by(|a, b| {
        a.piece_num
            .cmp(&b.piece_num)
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.node_id.cmp(&b.node_id))
    });

    let before = pieces.len();
    pieces.dedup_by(|later, earlier| later.piece_num == earlier.piece_num);
    let dropped = before - pieces.len();
    (pieces, dropped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_pieces_orders_and_dedups() {
        let node_a = NodeId::new();
        let node_b = NodeId::new();
        let node_c = NodeId::new();

        let mut old = Piece::new(2, node_a, None);
        old.created_at -= Duration::from_secs(60);
        let kept = vec![Piece::new(5, node_b, None), old.clone()];
        let placed = vec![Piece::new(2, node_c, None), Piece::new(0, node_c, None)];

        let (pieces, dropped) = merge_pieces(kept, placed);
        assert_eq!(dropped, 1);
        let nums: Vec<u16> = pieces.iter().map(|p| p.piece_num).collect();
        assert_eq!(nums, vec![0, 2, 5]);
        assert_eq!(pieces[1].node_id, node_a);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = RepairConfig {
            retry_backoff: Duration::from_secs(30),
            max_retry_backoff: Duration::from_secs(100),
            ..Default::default()
        };
        assert_eq!(config.backoff_for(1), Duration::from_secs(30));
        assert_eq!(config.backoff_for(2), Duration::from_secs(60));
        assert_eq!(config.backoff_for(3), Duration::from_secs(100));
        assert_eq!(config.backoff_for(40), Duration::from_secs(100));
    }

    #[test]
    fn test_config_validation() {
        assert!(RepairConfig::default().validate().is_ok());

        let invalid = [
            RepairConfig {
                max_concurrent_repairs: 0,
                ..Default::default()
            },
            RepairConfig {
                max_attempts: 0,
                ..Default::default()
            },
            RepairConfig {
                excess_rate_optimal_threshold: -0.1,
                ..Default::default()
            },
            RepairConfig {
                repair_override: Some(0),
                ..Default::default()
            },
            RepairConfig {
                node_timeout: Duration::ZERO,
                ..Default::default()
            },
        ];
        for config in invalid {
            assert!(matches!(
                config.validate(),
                Err(RepairError::Configuration { .. })
            ));
        }
    }

    #[test]
    fn test_error_classification() {
        let key = SegmentKey::from("k");

        let conflict = RepairError::from(PointerStoreError::VersionConflict {
            key: key.clone(),
            expected: 1,
            actual: 2,
        });
        assert_eq!(conflict.kind(), ErrorKind::Consistency);

        let scheme = RepairError::from(SegmentError::InvalidScheme {
            reason: "bad".to_string(),
        });
        assert_eq!(scheme.kind(), ErrorKind::Fatal);

        let duplicate = RepairError::from(SegmentError::TooManyPieces {
            count: 11,
            total_shares: 10,
        });
        assert_eq!(duplicate.kind(), ErrorKind::Consistency);

        let nodes = RepairError::from(OverlayError::InsufficientNodes {
            requested: 3,
            available: 1,
        });
        assert_eq!(nodes.kind(), ErrorKind::Transient);

        let key_missing = RepairError::from(OrdersError::from(
            crate::orders::SigningError::KeyUnavailable {
                reason: "gone".to_string(),
            },
        ));
        assert_eq!(key_missing.kind(), ErrorKind::Fatal);

        let expired = RepairError::from(OrdersError::SegmentExpired { key: key.clone() });
        assert_eq!(expired.kind(), ErrorKind::Transient);

        assert_eq!(
            RepairError::Cancelled { key }.kind(),
            ErrorKind::Cancelled
        );
    }
}
