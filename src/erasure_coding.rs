//! Erasure Coding Module
//!
//! This module provides the pluggable encode/decode primitive used during
//! reconstruction, with a Reed-Solomon implementation backed by the
//! reed-solomon-erasure crate. A segment of `size` bytes is padded to
//! `k * share_size` and split into `k` data shares followed by `n - k` parity
//! shares; piece number `i` is share `i`.

use crate::segment::RedundancyScheme;
use reed_solomon_erasure::galois_8::ReedSolomon;
use reed_solomon_erasure::Error as ReedSolomonError;
use thiserror::Error;

/// Errors that can occur during erasure coding operations
#[derive(Error, Debug)]
pub enum ErasureError {
    #[error("Invalid configuration: {reason}")]
    InvalidConfiguration { reason: String },

    #[error("Insufficient shares for reconstruction: need {needed}, have {available}")]
    InsufficientShares { needed: usize, available: usize },

    #[error("Share size mismatch: expected {expected}, got {actual}")]
    ShareSizeMismatch { expected: usize, actual: usize },

    #[error("Reed-Solomon error: {0}")]
    ReedSolomon(#[from] ReedSolomonError),

    #[error("Invalid data: {reason}")]
    InvalidData { reason: String },
}

/// Result type for erasure coding operations
pub type ErasureResult<T> = Result<T, ErasureError>;

/// Encode/decode primitive with configurable data/parity share counts
pub trait ErasureCoder: Send + Sync {
    /// Split `data` into `n` shares (data shares first, then parity shares)
    fn encode(&self, data: &[u8], scheme: &RedundancyScheme) -> ErasureResult<Vec<Vec<u8>>>;

    /// Recover the original `original_size` bytes from at least `k` shares.
    /// `shares` has one slot per piece number; missing shares are `None`.
    fn decode(
        &self,
        shares: &[Option<Vec<u8>>],
        scheme: &RedundancyScheme,
        original_size: usize,
    ) -> ErasureResult<Vec<u8>>;
}

/// Reed-Solomon erasure coder over GF(2^8)
#[derive(Debug, Clone, Copy, Default)]
pub struct ReedSolomonCoder;

impl ReedSolomonCoder {
    pub fn new() -> Self {
        Self
    }

    fn codec(scheme: &RedundancyScheme) -> ErasureResult<ReedSolomon> {
        if scheme.parity_shares() == 0 {
            return Err(ErasureError::InvalidConfiguration {
                reason: "scheme has no parity shares".to_string(),
            });
        }
        Ok(ReedSolomon::new(scheme.data_shares, scheme.parity_shares())?)
    }
}

impl ErasureCoder for ReedSolomonCoder {
    fn encode(&self, data: &[u8], scheme: &RedundancyScheme) -> ErasureResult<Vec<Vec<u8>>> {
        if data.is_empty() {
            return Err(ErasureError::InvalidData {
                reason: "input data cannot be empty".to_string(),
            });
        }

        let rs = Self::codec(scheme)?;
        let shard_size = scheme.share_size(data.len() as u64);

        // Pad data to align with shard boundaries
        let mut padded = data.to_vec();
        padded.resize(shard_size * scheme.data_shares, 0);

        let mut shards: Vec<Vec<u8>> = padded
            .chunks(shard_size)
            .map(|chunk| chunk.to_vec())
            .collect();
        shards.resize(scheme.total_shares, vec![0u8; shard_size]);

        rs.encode(&mut shards)?;
        Ok(shards)
    }

    fn decode(
        &self,
        shares: &[Option<Vec<u8>>],
        scheme: &RedundancyScheme,
        original_size: usize,
    ) -> ErasureResult<Vec<u8>> {
        if shares.len() != scheme.total_shares {
            return Err(ErasureError::InvalidData {
                reason: format!(
                    "shares length ({}) doesn't match total shares ({})",
                    shares.len(),
                    scheme.total_shares
                ),
            });
        }

        let available = shares.iter().filter(|share| share.is_some()).count();
        if available < scheme.data_shares {
            return Err(ErasureError::InsufficientShares {
                needed: scheme.data_shares,
                available,
            });
        }

        let expected = scheme.share_size(original_size as u64);
        for share in shares.iter().flatten() {
            if share.len() != expected {
                return Err(ErasureError::ShareSizeMismatch {
                    expected,
                    actual: share.len(),
                });
            }
        }

        let rs = Self::codec(scheme)?;
        let mut shards = shares.to_vec();
        rs.reconstruct_data(&mut shards)?;

        let mut data = Vec::with_capacity(expected * scheme.data_shares);
        for shard in shards.iter().take(scheme.data_shares) {
            match shard {
                Some(bytes) => data.extend_from_slice(bytes),
                None => {
                    return Err(ErasureError::InvalidData {
                        reason: "data shard missing after reconstruction".to_string(),
                    })
                }
            }
        }

        if original_size > data.len() {
            return Err(ErasureError::InvalidData {
                reason: format!(
                    "original_size ({}) exceeds reconstructed data length ({})",
                    original_size,
                    data.len()
                ),
            });
        }

        data.truncate(original_size);
        Ok(data)
    }
}

/// Piece numbers in `[0, n)` that are not in `present`
pub fn missing_piece_numbers(
    present: impl IntoIterator<Item = u16>,
    scheme: &RedundancyScheme,
) -> Vec<u16> {
    let mut have = vec![false; scheme.total_shares];
    for piece_num in present {
        if let Some(slot) = have.get_mut(piece_num as usize) {
            *slot = true;
        }
    }

    have.iter()
        .enumerate()
        .filter(|(_, present)| !**present)
        .map(|(i, _)| i as u16)
        .collect()
}
