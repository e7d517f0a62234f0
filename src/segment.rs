//! Segment Data Model Module
//!
//! This module defines the identifiers and metadata records the repair pipeline
//! reads from and writes back to the pointer store: segments, their redundancy
//! scheme and the erasure-coded pieces held by remote storage nodes.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;
use std::time::SystemTime;
use thiserror::Error;
use uuid::Uuid;

/// Upper bound on total shares supported by the GF(2^8) erasure code
pub const MAX_TOTAL_SHARES: usize = 255;

/// Identity of a storage node
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub Uuid);

impl NodeId {
    /// Create a new random node identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Raw identity bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable path identifying a segment in the pointer store
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SegmentKey(pub String);

impl SegmentKey {
    pub fn new<S: Into<String>>(key: S) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SegmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SegmentKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// SHA-256 digest of a piece's bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PieceHash(pub [u8; 32]);

impl PieceHash {
    /// Hash piece bytes
    pub fn of(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// Check piece bytes against this hash
    pub fn matches(&self, data: &[u8]) -> bool {
        Self::of(data) == *self
    }
}

impl fmt::Display for PieceHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Errors describing a structurally invalid segment or scheme
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SegmentError {
    #[error("Invalid redundancy scheme: {reason}")]
    InvalidScheme { reason: String },

    #[error("Piece number {piece_num} out of range for {total_shares} total shares")]
    PieceNumberOutOfRange { piece_num: u16, total_shares: usize },

    #[error("Segment holds {count} pieces but the scheme allows at most {total_shares}")]
    TooManyPieces { count: usize, total_shares: usize },
}

/// Result type for segment validation
pub type SegmentResult<T> = Result<T, SegmentError>;

/// Redundancy thresholds governing when repair triggers and when it is complete
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedundancyScheme {
    /// Number of pieces required to reconstruct (k)
    pub data_shares: usize,
    /// Below this many healthy pieces the segment needs repair (r)
    pub repair_threshold: usize,
    /// Healthy piece count considered fully durable (s)
    pub success_threshold: usize,
    /// Total number of distinct piece numbers the code can produce (n)
    pub total_shares: usize,
}

impl RedundancyScheme {
    /// Create a validated redundancy scheme
    pub fn new(
        data_shares: usize,
        repair_threshold: usize,
        success_threshold: usize,
        total_shares: usize,
    ) -> SegmentResult<Self> {
        let scheme = Self {
            data_shares,
            repair_threshold,
            success_threshold,
            total_shares,
        };
        scheme.validate()?;
        Ok(scheme)
    }

    /// Check `1 <= k <= r <= s <= n <= 255`
    pub fn validate(&self) -> SegmentResult<()> {
        if self.data_shares == 0 {
            return Err(SegmentError::InvalidScheme {
                reason: "data_shares must be greater than 0".to_string(),
            });
        }

        if self.data_shares > self.repair_threshold
            || self.repair_threshold > self.success_threshold
            || self.success_threshold > self.total_shares
        {
            return Err(SegmentError::InvalidScheme {
                reason: format!(
                    "thresholds must satisfy k <= r <= s <= n, got k={} r={} s={} n={}",
                    self.data_shares,
                    self.repair_threshold,
                    self.success_threshold,
                    self.total_shares
                ),
            });
        }

        if self.total_shares > MAX_TOTAL_SHARES {
            return Err(SegmentError::InvalidScheme {
                reason: format!(
                    "total shares ({}) cannot exceed {}",
                    self.total_shares, MAX_TOTAL_SHARES
                ),
            });
        }

        Ok(())
    }

    /// Number of parity shares (n - k)
    pub fn parity_shares(&self) -> usize {
        self.total_shares - self.data_shares
    }

    /// Size of each piece for a segment of `segment_size` bytes
    pub fn share_size(&self, segment_size: u64) -> usize {
        (segment_size as usize).div_ceil(self.data_shares).max(1)
    }
}

/// One erasure-coded fragment of a segment, held by one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Piece {
    /// Position in the code, within `[0, n)`
    pub piece_num: u16,
    pub node_id: NodeId,
    pub hash: Option<PieceHash>,
    pub created_at: SystemTime,
}

impl Piece {
    pub fn new(piece_num: u16, node_id: NodeId, hash: Option<PieceHash>) -> Self {
        Self {
            piece_num,
            node_id,
            hash,
            created_at: SystemTime::now(),
        }
    }
}

/// Segment pointer as held by metadata storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub key: SegmentKey,
    pub scheme: RedundancyScheme,
    pub pieces: Vec<Piece>,
    pub expires_at: Option<SystemTime>,
    /// Size of the segment data in bytes (before erasure coding)
    pub size: u64,
    /// Optimistic concurrency version maintained by the pointer store (0 = never stored)
    #[serde(default)]
    pub version: u64,
}

impl Segment {
    /// Create a new, not yet stored segment pointer
    pub fn new(key: SegmentKey, scheme: RedundancyScheme, size: u64) -> Self {
        Self {
            key,
            scheme,
            pieces: Vec::new(),
            expires_at: None,
            size,
            version: 0,
        }
    }

    /// Set the expiry time
    pub fn with_expiry(mut self, expires_at: SystemTime) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Set the piece list
    pub fn with_pieces(mut self, pieces: Vec<Piece>) -> Self {
        self.pieces = pieces;
        self
    }

    /// Whether the segment has expired at `now`
    pub fn is_expired(&self, now: SystemTime) -> bool {
        matches!(self.expires_at, Some(expires_at) if expires_at <= now)
    }

    /// Distinct node identities holding pieces of this segment
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut seen = HashSet::new();
        self.pieces
            .iter()
            .filter(|piece| seen.insert(piece.node_id))
            .map(|piece| piece.node_id)
            .collect()
    }

    /// Size of each piece of this segment
    pub fn share_size(&self) -> usize {
        self.scheme.share_size(self.size)
    }

    /// Structural validation of the scheme and piece list
    pub fn validate(&self) -> SegmentResult<()> {
        self.scheme.validate()?;

        if self.pieces.len() > self.scheme.total_shares {
            return Err(SegmentError::TooManyPieces {
                count: self.pieces.len(),
                total_shares: self.scheme.total_shares,
            });
        }

        for piece in &self.pieces {
            if piece.piece_num as usize >= self.scheme.total_shares {
                return Err(SegmentError::PieceNumberOutOfRange {
                    piece_num: piece.piece_num,
                    total_shares: self.scheme.total_shares,
                });
            }
        }

        Ok(())
    }
}
