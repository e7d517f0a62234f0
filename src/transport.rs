//! Piece Transport Module
//!
//! This module defines the point-to-point transfer capability the repairer
//! uses to move piece bytes to and from storage nodes. Every request carries
//! a signed order limit; the node checks it before serving or accepting data
//! and reports back how many bytes actually moved.
//!
//! `MemoryNetwork` is an in-process network of storage nodes that enforces the
//! same order-limit checks a real node does, with per-node fault injection.

use async_trait::async_trait;
use ed25519_dalek::VerifyingKey;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::debug;

use crate::orders::{Action, AddressedOrderLimit, OrderLimit};
use crate::segment::{NodeId, PieceHash, SegmentKey};

/// Errors a single piece transfer can end with
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("Node {node_id} is unreachable")]
    Unreachable { node_id: NodeId },

    #[error("Transfer with node {node_id} timed out")]
    Timeout { node_id: NodeId },

    #[error("Node {node_id} does not hold piece {piece_num}")]
    NotFound { node_id: NodeId, piece_num: u16 },

    #[error("Node {node_id} refused the order limit: {reason}")]
    Unauthorized { node_id: NodeId, reason: String },

    #[error("Node {node_id} transfer of {requested} bytes exceeds the {limit} byte limit")]
    LimitExceeded {
        node_id: NodeId,
        limit: u64,
        requested: u64,
    },

    #[error("Node {node_id} rejected the upload: {reason}")]
    Rejected { node_id: NodeId, reason: String },

    #[error("Piece from node {node_id} failed verification: {reason}")]
    Corrupted { node_id: NodeId, reason: String },
}

/// Result type for transfer operations
pub type TransferResult<T> = Result<T, TransferError>;

/// Piece bytes served by a node
#[derive(Debug, Clone)]
pub struct DownloadResponse {
    pub data: Vec<u8>,
    pub bytes_transferred: u64,
}

/// Acknowledgement of a stored piece
#[derive(Debug, Clone)]
pub struct UploadResponse {
    pub bytes_transferred: u64,
    /// Hash of the bytes as the node stored them
    pub hash: PieceHash,
}

/// Authenticated point-to-point piece transfer
#[async_trait]
pub trait PieceTransport: Send + Sync {
    /// Fetch the piece named by a GET_REPAIR limit
    async fn download(&self, limit: &AddressedOrderLimit) -> TransferResult<DownloadResponse>;

    /// Store `data` as the piece named by a PUT_REPAIR limit
    async fn upload(&self, limit: &AddressedOrderLimit, data: Vec<u8>) -> TransferResult<UploadResponse>;
}

/// Fault injected into an in-memory storage node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeBehavior {
    #[default]
    Healthy,
    /// Every request fails as unreachable
    Offline,
    /// Requests hang until the caller gives up
    Stall,
    /// Served and stored bytes are silently altered
    CorruptPieces,
    /// Downloads work, uploads are refused
    RejectUploads,
}

#[derive(Debug, Default)]
struct StorageNodeState {
    behavior: NodeBehavior,
    pieces: HashMap<(SegmentKey, u16), Vec<u8>>,
}

/// In-memory network of storage nodes
pub struct MemoryNetwork {
    verifying_key: VerifyingKey,
    nodes: RwLock<HashMap<NodeId, StorageNodeState>>,
    stall: Duration,
    downloads: AtomicUsize,
    uploads: AtomicUsize,
}

impl MemoryNetwork {
    /// Create a network whose nodes trust limits signed by `verifying_key`
    pub fn new(verifying_key: VerifyingKey) -> Self {
        Self {
            verifying_key,
            nodes: RwLock::new(HashMap::new()),
            stall: Duration::from_secs(3600),
            downloads: AtomicUsize::new(0),
            uploads: AtomicUsize::new(0),
        }
    }

    pub fn add_node(&self, node_id: NodeId) {
        self.nodes.write().entry(node_id).or_default();
    }

    pub fn set_behavior(&self, node_id: &NodeId, behavior: NodeBehavior) {
        self.nodes.write().entry(*node_id).or_default().behavior = behavior;
    }

    /// Place piece bytes on a node directly, bypassing order limits
    pub fn store_piece(&self, node_id: &NodeId, key: &SegmentKey, piece_num: u16, data: Vec<u8>) {
        self.nodes
            .write()
            .entry(*node_id)
            .or_default()
            .pieces
            .insert((key.clone(), piece_num), data);
    }

    pub fn piece(&self, node_id: &NodeId, key: &SegmentKey, piece_num: u16) -> Option<Vec<u8>> {
        self.nodes
            .read()
            .get(node_id)
            .and_then(|node| node.pieces.get(&(key.clone(), piece_num)).cloned())
    }

    pub fn remove_piece(&self, node_id: &NodeId, key: &SegmentKey, piece_num: u16) -> bool {
        self.nodes
            .write()
            .get_mut(node_id)
            .map(|node| node.pieces.remove(&(key.clone(), piece_num)).is_some())
            .unwrap_or(false)
    }

    /// Current fault mode of a node, if it is registered
    pub fn node_behavior(&self, node_id: &NodeId) -> Option<NodeBehavior> {
        self.nodes.read().get(node_id).map(|node| node.behavior)
    }

    /// Download requests received, including refused ones
    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    /// Upload requests received, including refused ones
    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn reset_counters(&self) {
        self.downloads.store(0, Ordering::SeqCst);
        self.uploads.store(0, Ordering::SeqCst);
    }

    fn behavior(&self, node_id: &NodeId) -> TransferResult<NodeBehavior> {
        self.nodes
            .read()
            .get(node_id)
            .map(|node| node.behavior)
            .ok_or(TransferError::Unreachable { node_id: *node_id })
    }

    fn authorize(&self, limit: &OrderLimit, action: Action) -> TransferResult<()> {
        let node_id = limit.storage_node_id;
        let unauthorized = |reason: String| TransferError::Unauthorized { node_id, reason };

        limit
            .verify(&self.verifying_key)
            .map_err(|e| unauthorized(e.to_string()))?;
        limit
            .check_expiration(SystemTime::now())
            .map_err(|e| unauthorized(e.to_string()))?;
        if limit.action != action {
            return Err(unauthorized(format!(
                "expected {} limit, got {}",
                action, limit.action
            )));
        }
        Ok(())
    }

    async fn stall(&self, node_id: NodeId) -> TransferError {
        tokio::time::sleep(self.stall).await;
        TransferError::Timeout { node_id }
    }
}

fn corrupt(mut data: Vec<u8>) -> Vec<u8> {
    if let Some(byte) = data.first_mut() {
        *byte ^= 0xFF;
    }
    data
}

#[async_trait]
impl PieceTransport for MemoryNetwork {
    async fn download(&self, limit: &AddressedOrderLimit) -> TransferResult<DownloadResponse> {
        let limit = &limit.limit;
        let node_id = limit.storage_node_id;
        self.downloads.fetch_add(1, Ordering::SeqCst);

        match self.behavior(&node_id)? {
            NodeBehavior::Offline => return Err(TransferError::Unreachable { node_id }),
            NodeBehavior::Stall => return Err(self.stall(node_id).await),
            _ => {}
        }

        self.authorize(limit, Action::GetRepair)?;

        let data = self
            .piece(&node_id, &limit.segment_key, limit.piece_num)
            .ok_or(TransferError::NotFound {
                node_id,
                piece_num: limit.piece_num,
            })?;

        if data.len() as u64 > limit.limit {
            return Err(TransferError::LimitExceeded {
                node_id,
                limit: limit.limit,
                requested: data.len() as u64,
            });
        }

        let data = match self.behavior(&node_id)? {
            NodeBehavior::CorruptPieces => corrupt(data),
            _ => data,
        };

        debug!(
            "Node {} served piece {} of {} ({} bytes)",
            node_id,
            limit.piece_num,
            limit.segment_key,
            data.len()
        );
        Ok(DownloadResponse {
            bytes_transferred: data.len() as u64,
            data,
        })
    }

    async fn upload(&self, limit: &AddressedOrderLimit, data: Vec<u8>) -> TransferResult<UploadResponse> {
        let limit = &limit.limit;
        let node_id = limit.storage_node_id;
        self.uploads.fetch_add(1, Ordering::SeqCst);

        let behavior = self.behavior(&node_id)?;
        match behavior {
            NodeBehavior::Offline => return Err(TransferError::Unreachable { node_id }),
            NodeBehavior::Stall => return Err(self.stall(node_id).await),
            NodeBehavior::RejectUploads => {
                return Err(TransferError::Rejected {
                    node_id,
                    reason: "node is not accepting uploads".to_string(),
                })
            }
            _ => {}
        }

        self.authorize(limit, Action::PutRepair)?;

        if data.len() as u64 > limit.limit {
            return Err(TransferError::LimitExceeded {
                node_id,
                limit: limit.limit,
                requested: data.len() as u64,
            });
        }

        let stored = match behavior {
            NodeBehavior::CorruptPieces => corrupt(data),
            _ => data,
        };
        let bytes_transferred = stored.len() as u64;
        let hash = PieceHash::of(&stored);
        self.store_piece(&node_id, &limit.segment_key, limit.piece_num, stored);

        Ok(UploadResponse {
            bytes_transferred,
            hash,
        })
    }
}
