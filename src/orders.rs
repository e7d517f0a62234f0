//! Order Authorization Module
//!
//! This module issues the signed, time-bounded order limits that authorize a
//! storage node to serve (GET_REPAIR) or accept (PUT_REPAIR) one piece of one
//! segment, and reports the bandwidth actually used so it can be settled.
//!
//! A limit is signed with Ed25519 over a SHA-256 digest of a domain tag
//! followed by the canonical encoding of every field except the signature.
//! Receivers check the signature, that the limit is addressed to them, and
//! that it has not expired.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::overlay::Node;
use crate::segment::{NodeId, Piece, Segment, SegmentKey};

/// Domain separation tag mixed into every order limit digest
const ORDER_LIMIT_DOMAIN: &[u8] = b"segment-repair/order-limit/v1";

/// Kind of transfer an order limit authorizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Action {
    /// Storage node sends a piece to the repairer
    GetRepair,
    /// Storage node receives a reconstructed piece
    PutRepair,
}

impl Action {
    fn tag(self) -> u8 {
        match self {
            Action::GetRepair => 1,
            Action::PutRepair => 2,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::GetRepair => f.write_str("GET_REPAIR"),
            Action::PutRepair => f.write_str("PUT_REPAIR"),
        }
    }
}

/// Errors raised by an order signer
#[derive(Error, Debug, Clone)]
pub enum SigningError {
    /// No attempt can succeed without a key
    #[error("Signing key unavailable: {reason}")]
    KeyUnavailable { reason: String },

    #[error("Clock error: {reason}")]
    Clock { reason: String },
}

/// Errors that can occur during order operations
#[derive(Error, Debug)]
pub enum OrdersError {
    #[error("Signing error: {0}")]
    Signing(#[from] SigningError),

    #[error("Segment {key} expires before an order could be used")]
    SegmentExpired { key: SegmentKey },

    #[error("Order limit {serial_number} expired")]
    LimitExpired { serial_number: Uuid },

    #[error("Order limit verification failed: {reason}")]
    Verification { reason: String },

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },
}

impl OrdersError {
    /// Whether the error means no further order can be issued at all
    pub fn is_fatal(&self) -> bool {
        matches!(self, OrdersError::Signing(SigningError::KeyUnavailable { .. }))
    }
}

/// Result type for order operations
pub type OrdersResult<T> = Result<T, OrdersError>;

fn unix_micros(time: SystemTime) -> Result<u64, SigningError> {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .map_err(|e| SigningError::Clock {
            reason: format!("time before unix epoch: {}", e),
        })
}

/// Signed authorization for one piece transfer with one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLimit {
    pub serial_number: Uuid,
    pub satellite_id: NodeId,
    pub storage_node_id: NodeId,
    pub segment_key: SegmentKey,
    pub piece_num: u16,
    pub action: Action,
    /// Maximum number of bytes the transfer may move
    pub limit: u64,
    pub order_creation: SystemTime,
    pub order_expiration: SystemTime,
    pub signature: Vec<u8>,
}

impl OrderLimit {
    /// Digest covered by the signature
    pub fn signing_digest(&self) -> Result<[u8; 32], SigningError> {
        let mut hasher = Sha256::new();
        hasher.update(ORDER_LIMIT_DOMAIN);
        hasher.update(self.serial_number.as_bytes());
        hasher.update(self.satellite_id.as_bytes());
        hasher.update(self.storage_node_id.as_bytes());
        hasher.update((self.segment_key.as_str().len() as u64).to_be_bytes());
        hasher.update(self.segment_key.as_str().as_bytes());
        hasher.update(self.piece_num.to_be_bytes());
        hasher.update([self.action.tag()]);
        hasher.update(self.limit.to_be_bytes());
        hasher.update(unix_micros(self.order_creation)?.to_be_bytes());
        hasher.update(unix_micros(self.order_expiration)?.to_be_bytes());

        let mut digest = [0u8; 32];
        digest.copy_from_slice(&hasher.finalize());
        Ok(digest)
    }

    /// Check the signature against the issuer's public key
    pub fn verify(&self, key: &VerifyingKey) -> OrdersResult<()> {
        let signature =
            Signature::from_slice(&self.signature).map_err(|e| OrdersError::Verification {
                reason: format!("malformed signature: {}", e),
            })?;
        let digest = self.signing_digest()?;
        key.verify(&digest, &signature)
            .map_err(|e| OrdersError::Verification {
                reason: format!("bad signature on {}: {}", self.serial_number, e),
            })
    }

    /// Reject the limit once `now` has reached its expiration
    pub fn check_expiration(&self, now: SystemTime) -> OrdersResult<()> {
        if now >= self.order_expiration {
            return Err(OrdersError::LimitExpired {
                serial_number: self.serial_number,
            });
        }
        Ok(())
    }
}

/// An order limit together with the address of the node it is for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressedOrderLimit {
    pub limit: OrderLimit,
    pub address: SocketAddr,
}

/// Signs order limits on behalf of the issuing peer
pub trait OrderSigner: Send + Sync {
    /// Identity embedded in every issued limit
    fn satellite_id(&self) -> NodeId;

    /// Public key receivers use to verify limits
    fn verifying_key(&self) -> VerifyingKey;

    fn sign(&self, digest: &[u8]) -> Result<Vec<u8>, SigningError>;
}

/// Ed25519 order signer
pub struct Ed25519OrderSigner {
    satellite_id: NodeId,
    key: SigningKey,
}

impl Ed25519OrderSigner {
    pub fn new(satellite_id: NodeId, key: SigningKey) -> Self {
        Self { satellite_id, key }
    }

    /// Generate a signer with a fresh random key
    pub fn generate(satellite_id: NodeId) -> Self {
        Self::new(satellite_id, SigningKey::generate(&mut rand::rngs::OsRng))
    }

    /// Load a 32-byte secret key stored as hex text
    pub fn from_key_file<P: AsRef<Path>>(satellite_id: NodeId, path: P) -> Result<Self, SigningError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| SigningError::KeyUnavailable {
            reason: format!("failed to read {}: {}", path.display(), e),
        })?;

        let bytes = hex::decode(text.trim()).map_err(|e| SigningError::KeyUnavailable {
            reason: format!("{} is not valid hex: {}", path.display(), e),
        })?;

        let secret: [u8; 32] = bytes.as_slice().try_into().map_err(|_| SigningError::KeyUnavailable {
            reason: format!(
                "{} holds {} bytes, expected 32",
                path.display(),
                bytes.len()
            ),
        })?;

        Ok(Self::new(satellite_id, SigningKey::from_bytes(&secret)))
    }

    /// Write the secret key as hex text
    pub fn save_key_file<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        std::fs::write(path, hex::encode(self.key.to_bytes()))
    }
}

impl fmt::Debug for Ed25519OrderSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ed25519OrderSigner")
            .field("satellite_id", &self.satellite_id)
            .finish_non_exhaustive()
    }
}

impl OrderSigner for Ed25519OrderSigner {
    fn satellite_id(&self) -> NodeId {
        self.satellite_id
    }

    fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    fn sign(&self, digest: &[u8]) -> Result<Vec<u8>, SigningError> {
        Ok(self.key.sign(digest).to_bytes().to_vec())
    }
}

/// Configuration for order issuance and usage settlement
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrdersConfig {
    /// How long an issued limit stays valid
    #[serde(with = "humantime_serde")]
    pub order_expiration: Duration,
    /// How often buffered usage is flushed to the orders database
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
    /// Flush early once this many usage records are buffered
    pub flush_batch_size: usize,
}

impl Default for OrdersConfig {
    fn default() -> Self {
        Self {
            order_expiration: Duration::from_secs(60 * 60),
            flush_interval: Duration::from_secs(60),
            flush_batch_size: 1000,
        }
    }
}

impl OrdersConfig {
    pub fn validate(&self) -> OrdersResult<()> {
        if self.order_expiration.is_zero() {
            return Err(OrdersError::Configuration {
                reason: "order_expiration must be greater than 0".to_string(),
            });
        }
        if self.flush_interval.is_zero() {
            return Err(OrdersError::Configuration {
                reason: "flush_interval must be greater than 0".to_string(),
            });
        }
        if self.flush_batch_size == 0 {
            return Err(OrdersError::Configuration {
                reason: "flush_batch_size must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

/// Bandwidth actually moved under one order limit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageRecord {
    pub serial_number: Uuid,
    pub node_id: NodeId,
    pub action: Action,
    pub bytes: u64,
    pub recorded_at: SystemTime,
}

/// Repair-facing order authorizer
pub struct OrdersService {
    signer: Arc<dyn OrderSigner>,
    config: OrdersConfig,
    usage: mpsc::UnboundedSender<UsageRecord>,
}

impl OrdersService {
    /// Create the service; usage records are sent to `usage` for batching
    pub fn new(
        signer: Arc<dyn OrderSigner>,
        config: OrdersConfig,
        usage: mpsc::UnboundedSender<UsageRecord>,
    ) -> OrdersResult<Self> {
        config.validate()?;
        Ok(Self {
            signer,
            config,
            usage,
        })
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signer.verifying_key()
    }

    /// Expiration for limits issued now: the configured lifetime, cut short by
    /// the segment's own expiry.
    fn expiration_for(&self, segment: &Segment, now: SystemTime) -> OrdersResult<SystemTime> {
        let mut expiration = now + self.config.order_expiration;
        if let Some(expires_at) = segment.expires_at {
            expiration = expiration.min(expires_at);
        }
        if expiration <= now {
            return Err(OrdersError::SegmentExpired {
                key: segment.key.clone(),
            });
        }
        Ok(expiration)
    }

    fn sign_limit(
        &self,
        segment: &Segment,
        node: &Node,
        piece_num: u16,
        action: Action,
        now: SystemTime,
        expiration: SystemTime,
    ) -> OrdersResult<AddressedOrderLimit> {
        let mut limit = OrderLimit {
            serial_number: Uuid::new_v4(),
            satellite_id: self.signer.satellite_id(),
            storage_node_id: node.id,
            segment_key: segment.key.clone(),
            piece_num,
            action,
            limit: segment.share_size() as u64,
            order_creation: now,
            order_expiration: expiration,
            signature: Vec::new(),
        };
        let digest = limit.signing_digest()?;
        limit.signature = self.signer.sign(&digest)?;

        Ok(AddressedOrderLimit {
            limit,
            address: node.address,
        })
    }

    /// One download authorization per source node, scoped to that node's piece
    pub fn create_get_order_limits(
        &self,
        segment: &Segment,
        sources: &[(Piece, Node)],
    ) -> OrdersResult<BTreeMap<NodeId, AddressedOrderLimit>> {
        let now = SystemTime::now();
        let expiration = self.expiration_for(segment, now)?;

        let mut limits = BTreeMap::new();
        for (piece, node) in sources {
            let limit = self.sign_limit(segment, node, piece.piece_num, Action::GetRepair, now, expiration)?;
            limits.insert(node.id, limit);
        }

        debug!(
            "Created {} GET_REPAIR order limits for {}",
            limits.len(),
            segment.key
        );
        Ok(limits)
    }

    /// One upload authorization per destination node for its new piece number
    pub fn create_put_order_limits(
        &self,
        segment: &Segment,
        destinations: &[(u16, Node)],
    ) -> OrdersResult<BTreeMap<NodeId, AddressedOrderLimit>> {
        let now = SystemTime::now();
        let expiration = self.expiration_for(segment, now)?;

        let mut limits = BTreeMap::new();
        for (piece_num, node) in destinations {
            let limit = self.sign_limit(segment, node, *piece_num, Action::PutRepair, now, expiration)?;
            limits.insert(node.id, limit);
        }

        debug!(
            "Created {} PUT_REPAIR order limits for {}",
            limits.len(),
            segment.key
        );
        Ok(limits)
    }

    /// Queue settled bandwidth for asynchronous accounting. Never blocks and
    /// never fails the caller.
    pub fn record_usage(&self, limit: &OrderLimit, bytes: u64) {
        if bytes == 0 {
            return;
        }

        let record = UsageRecord {
            serial_number: limit.serial_number,
            node_id: limit.storage_node_id,
            action: limit.action,
            bytes,
            recorded_at: SystemTime::now(),
        };

        if let Err(e) = self.usage.send(record) {
            warn!(
                "Dropping {} bytes of {} usage for node {}: accounting channel closed",
                e.0.bytes, e.0.action, e.0.node_id
            );
        }
    }
}
