//! Redundancy Policy Module
//!
//! Pure evaluation of a segment's current health against its redundancy
//! scheme. The policy partitions the piece list into healthy, unhealthy and
//! duplicate entries given the set of nodes the overlay still considers
//! reachable, and derives the verdict from the number of distinct healthy
//! piece numbers:
//!
//! - `Healthy`: at or above the (effective) repair threshold
//! - `NeedsRepair`: below the repair threshold but at least `k`
//! - `Irreparable`: below `k`
//! - `Gone`: the segment expired, nothing to keep alive

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::SystemTime;

use crate::segment::{NodeId, Piece, RedundancyScheme, Segment};

/// Default fraction of the success threshold uploaded on top of it
pub const DEFAULT_EXCESS_RATE_OPTIMAL_THRESHOLD: f64 = 0.05;

/// Health classification of a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthVerdict {
    Healthy,
    NeedsRepair,
    Irreparable,
    /// Expired (or otherwise scheduled for deletion) before repair started
    Gone,
}

/// Result of evaluating one segment
#[derive(Debug, Clone)]
pub struct HealthEvaluation {
    pub verdict: HealthVerdict,
    /// One piece per distinct piece number, held by a reachable node
    pub healthy: Vec<Piece>,
    /// Pieces held by nodes that are unreachable, disqualified or suspended
    pub unhealthy: Vec<Piece>,
    /// Healthy pieces that repeat a piece number already counted
    pub duplicates: Vec<Piece>,
    /// Repair threshold after applying any override
    pub repair_threshold: usize,
    /// Number of healthy pieces a repair should aim for
    pub placement_target: usize,
}

impl HealthEvaluation {
    pub fn healthy_count(&self) -> usize {
        self.healthy.len()
    }

    /// Nodes that should not receive another piece of this segment
    pub fn holders(&self) -> HashSet<NodeId> {
        self.healthy
            .iter()
            .chain(&self.unhealthy)
            .chain(&self.duplicates)
            .map(|piece| piece.node_id)
            .collect()
    }
}

/// Thresholds applied on top of each segment's own scheme
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RedundancyPolicy {
    repair_override: Option<usize>,
    excess_rate_optimal_threshold: f64,
}

impl Default for RedundancyPolicy {
    fn default() -> Self {
        Self {
            repair_override: None,
            excess_rate_optimal_threshold: DEFAULT_EXCESS_RATE_OPTIMAL_THRESHOLD,
        }
    }
}

impl RedundancyPolicy {
    pub fn new(repair_override: Option<usize>, excess_rate_optimal_threshold: f64) -> Self {
        Self {
            repair_override,
            excess_rate_optimal_threshold: excess_rate_optimal_threshold.max(0.0),
        }
    }

    /// Effective repair threshold, clamped to `[k, n]`
    pub fn repair_threshold(&self, scheme: &RedundancyScheme) -> usize {
        self.repair_override
            .unwrap_or(scheme.repair_threshold)
            .clamp(scheme.data_shares, scheme.total_shares)
    }

    /// Healthy piece count a repair aims for: `s` raised by the excess rate,
    /// capped at `n` and never below the repair threshold.
    pub fn placement_target(&self, scheme: &RedundancyScheme) -> usize {
        let raised = (scheme.success_threshold as f64 * (1.0 + self.excess_rate_optimal_threshold))
            .ceil() as usize;
        raised
            .min(scheme.total_shares)
            .max(self.repair_threshold(scheme))
    }

    /// Classify `segment` given the nodes that are currently reachable.
    ///
    /// When several reachable nodes claim the same piece number, the entry
    /// with the lowest `created_at` is kept (ties broken by node id) and the
    /// rest are reported as duplicates.
    pub fn evaluate(
        &self,
        segment: &Segment,
        healthy_nodes: &HashSet<NodeId>,
        now: SystemTime,
    ) -> HealthEvaluation {
        let repair_threshold = self.repair_threshold(&segment.scheme);
        let placement_target = self.placement_target(&segment.scheme);

        let mut by_number: BTreeMap<u16, Vec<Piece>> = BTreeMap::new();
        let mut unhealthy = Vec::new();
        for piece in &segment.pieces {
            if healthy_nodes.contains(&piece.node_id) {
                by_number.entry(piece.piece_num).or_default().push(piece.clone());
            } else {
                unhealthy.push(piece.clone());
            }
        }

        let mut healthy = Vec::with_capacity(by_number.len());
        let mut duplicates = Vec::new();
        for (_, mut claims) in by_number {
            claims.sort_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a.node_id.cmp(&b.node_id))
            });
            let mut claims = claims.into_iter();
            if let Some(first) = claims.next() {
                healthy.push(first);
            }
            duplicates.extend(claims);
        }

        let verdict = if segment.is_expired(now) {
            HealthVerdict::Gone
        } else if healthy.len() < segment.scheme.data_shares {
            HealthVerdict::Irreparable
        } else if healthy.len() < repair_threshold {
            HealthVerdict::NeedsRepair
        } else {
            HealthVerdict::Healthy
        };

        HealthEvaluation {
            verdict,
            healthy,
            unhealthy,
            duplicates,
            repair_threshold,
            placement_target,
        }
    }
}
