//! Repairer Peer Module
//!
//! Wires the repair pipeline together: the order authorizer and its usage
//! rollup chore, the overlay selector, the segment repairer and the worker
//! loop. External capabilities (pointer store, queue, node catalog, piece
//! transport, orders database) are injected through `RepairerDeps`; the peer
//! owns their lifecycle only as far as startup and drain order go.
//!
//! Shutdown order: the worker loop drains in-flight repairs first, then the
//! rollup chore flushes the usage those repairs produced.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::erasure_coding::{ErasureCoder, ReedSolomonCoder};
use crate::metadata_store::{MemoryPointerStore, PointerStore, PointerStoreError, SqlitePointerStore};
use crate::order_rollups::{OrdersDb, UsageRollupChore};
use crate::orders::{Ed25519OrderSigner, OrderSigner, OrdersConfig, OrdersError, OrdersService, SigningError};
use crate::overlay::{NodeCatalog, OverlayConfig, OverlayError, OverlayService};
use crate::repair_queue::{MemoryRepairQueue, QueueConfig, QueueError, RepairQueue, SqliteRepairQueue};
use crate::repair_service::{RepairObserver, RepairService, RepairStats, ServiceError};
use crate::repairer::{RepairConfig, RepairError, SegmentRepairer};
use crate::segment::NodeId;
use crate::shutdown::Shutdown;
use crate::transport::PieceTransport;

/// Errors that can occur while building or running the repairer peer
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Configuration(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {reason}")]
    InvalidConfiguration { reason: String },

    #[error("Repair error: {0}")]
    Repair(#[from] RepairError),

    #[error("Orders error: {0}")]
    Orders(#[from] OrdersError),

    #[error("Signing error: {0}")]
    Signing(#[from] SigningError),

    #[error("Overlay error: {0}")]
    Overlay(#[from] OverlayError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Pointer store error: {0}")]
    PointerStore(#[from] PointerStoreError),

    #[error("Repair service error: {0}")]
    Service(#[from] ServiceError),
}

/// Result type for peer operations
pub type PeerResult<T> = Result<T, PeerError>;

/// Configuration for the repairer peer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairerPeerConfig {
    /// Identity the order limits are issued under
    pub satellite_id: NodeId,
    /// Hex-encoded ed25519 secret used when no signer is injected
    pub signing_key_path: Option<PathBuf>,
    /// SQLite pointer database; in-memory when unset
    pub pointer_db_path: Option<PathBuf>,
    /// SQLite repair queue database; in-memory when unset
    pub queue_db_path: Option<PathBuf>,
    pub repair: RepairConfig,
    pub queue: QueueConfig,
    pub overlay: OverlayConfig,
    pub orders: OrdersConfig,
}

impl Default for RepairerPeerConfig {
    fn default() -> Self {
        Self {
            satellite_id: NodeId::new(),
            signing_key_path: None,
            pointer_db_path: None,
            queue_db_path: None,
            repair: RepairConfig::default(),
            queue: QueueConfig::default(),
            overlay: OverlayConfig::default(),
            orders: OrdersConfig::default(),
        }
    }
}

impl RepairerPeerConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> PeerResult<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> PeerResult<()> {
        let content = serde_yaml::to_string(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> PeerResult<()> {
        self.repair.validate()?;
        self.queue.validate()?;
        self.overlay.validate()?;
        self.orders.validate()?;

        // A lease shorter than an attempt would let a second worker claim a
        // segment that is still being repaired.
        if self.queue.lease_timeout <= self.repair.segment_timeout {
            return Err(PeerError::InvalidConfiguration {
                reason: format!(
                    "queue lease_timeout {:?} must exceed repair segment_timeout {:?}",
                    self.queue.lease_timeout, self.repair.segment_timeout
                ),
            });
        }

        Ok(())
    }

    /// Open the configured pointer store
    pub fn open_pointer_store(&self) -> PeerResult<Arc<dyn PointerStore>> {
        let store: Arc<dyn PointerStore> = match &self.pointer_db_path {
            Some(path) => {
                debug!("Opening pointer database: {:?}", path);
                Arc::new(SqlitePointerStore::new(path)?)
            }
            None => Arc::new(MemoryPointerStore::new()),
        };
        Ok(store)
    }

    /// Open the configured repair queue
    pub fn open_queue(&self) -> PeerResult<Arc<dyn RepairQueue>> {
        let queue: Arc<dyn RepairQueue> = match &self.queue_db_path {
            Some(path) => {
                debug!("Opening repair queue database: {:?}", path);
                Arc::new(SqliteRepairQueue::new(path, self.queue.clone())?)
            }
            None => Arc::new(MemoryRepairQueue::new(self.queue.clone())?),
        };
        Ok(queue)
    }

    /// Load the order signer from `signing_key_path`
    pub fn load_signer(&self) -> PeerResult<Arc<dyn OrderSigner>> {
        let path = self
            .signing_key_path
            .as_ref()
            .ok_or_else(|| PeerError::InvalidConfiguration {
                reason: "signing_key_path is required when no signer is provided".to_string(),
            })?;
        Ok(Arc::new(Ed25519OrderSigner::from_key_file(
            self.satellite_id,
            path,
        )?))
    }
}

/// External capabilities the repairer runs against
pub struct RepairerDeps {
    pub pointers: Arc<dyn PointerStore>,
    pub queue: Arc<dyn RepairQueue>,
    pub catalog: Arc<dyn NodeCatalog>,
    pub orders_db: Arc<dyn OrdersDb>,
    pub transport: Arc<dyn PieceTransport>,
    /// Loaded from `signing_key_path` when unset
    pub signer: Option<Arc<dyn OrderSigner>>,
    /// Reed-Solomon when unset
    pub coder: Option<Arc<dyn ErasureCoder>>,
    pub observer: Option<Arc<dyn RepairObserver>>,
}

/// The assembled repair subsystem
pub struct RepairerPeer {
    config: RepairerPeerConfig,
    queue: Arc<dyn RepairQueue>,
    orders: Arc<OrdersService>,
    service: RepairService,
    chore: UsageRollupChore,
}

impl RepairerPeer {
    pub fn new(config: RepairerPeerConfig, deps: RepairerDeps) -> PeerResult<Self> {
        config.validate()?;

        info!("Initializing repairer for satellite {}", config.satellite_id);

        let signer = match deps.signer {
            Some(signer) => signer,
            None => config.load_signer()?,
        };
        let coder: Arc<dyn ErasureCoder> = match deps.coder {
            Some(coder) => coder,
            None => Arc::new(ReedSolomonCoder::new()),
        };

        let (chore, usage) = UsageRollupChore::new(deps.orders_db, config.orders.clone());
        let orders = Arc::new(OrdersService::new(signer, config.orders.clone(), usage)?);
        let overlay = Arc::new(OverlayService::new(deps.catalog, config.overlay.clone())?);

        let repairer = Arc::new(SegmentRepairer::new(
            deps.pointers,
            overlay,
            orders.clone(),
            deps.transport,
            coder,
            config.repair.clone(),
        )?);

        let service = match deps.observer {
            Some(observer) => RepairService::with_observer(deps.queue.clone(), repairer, observer),
            None => RepairService::new(deps.queue.clone(), repairer),
        };

        Ok(Self {
            config,
            queue: deps.queue,
            orders,
            service,
            chore,
        })
    }

    pub fn config(&self) -> &RepairerPeerConfig {
        &self.config
    }

    pub fn queue(&self) -> Arc<dyn RepairQueue> {
        self.queue.clone()
    }

    pub fn orders(&self) -> Arc<OrdersService> {
        self.orders.clone()
    }

    pub fn stats(&self) -> RepairStats {
        self.service.stats()
    }

    /// Run until `shutdown` fires or the worker loop hits a fatal error.
    /// Usage recorded by drained repairs is flushed before returning.
    pub async fn run(self, shutdown: Shutdown) -> PeerResult<RepairStats> {
        let RepairerPeer { service, chore, .. } = self;

        let chore_shutdown = Shutdown::new();
        let chore_task = tokio::spawn(chore.run(chore_shutdown.clone()));

        info!("Repairer running");
        let result = service.run(&shutdown).await;

        chore_shutdown.trigger();
        if let Err(e) = chore_task.await {
            error!("Usage rollup chore ended abnormally: {}", e);
        }

        let stats = service.stats();
        info!("Repairer stopped: {:?}", stats);
        result?;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_config_yaml_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("repairer.yaml");

        let mut config = RepairerPeerConfig::default();
        config.repair.max_concurrent_repairs = 3;
        config.repair.repair_override = Some(7);
        config.queue.lease_timeout = Duration::from_secs(3600);
        config.overlay.distinct_subnets = false;
        config.save_to_file(&path).unwrap();

        let loaded = RepairerPeerConfig::from_file(&path).unwrap();
        assert_eq!(loaded.satellite_id, config.satellite_id);
        assert_eq!(loaded.repair.max_concurrent_repairs, 3);
        assert_eq!(loaded.repair.repair_override, Some(7));
        assert_eq!(loaded.queue.lease_timeout, Duration::from_secs(3600));
        assert!(!loaded.overlay.distinct_subnets);
        assert!(loaded.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "repair:\n  max_concurrent_repairs: 2\n  segment_timeout: 90s\n";
        let config: RepairerPeerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.repair.max_concurrent_repairs, 2);
        assert_eq!(config.repair.segment_timeout, Duration::from_secs(90));
        assert_eq!(config.repair.max_attempts, RepairConfig::default().max_attempts);
        assert!(config.overlay.distinct_subnets);
    }

    #[test]
    fn test_lease_must_outlast_attempt() {
        let mut config = RepairerPeerConfig::default();
        config.queue.lease_timeout = Duration::from_secs(60);
        config.repair.segment_timeout = Duration::from_secs(120);
        assert!(matches!(
            config.validate(),
            Err(PeerError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn test_load_signer_from_key_file() {
        let temp_dir = TempDir::new().unwrap();
        let key_path = temp_dir.path().join("satellite.key");

        let mut config = RepairerPeerConfig::default();
        assert!(matches!(
            config.load_signer(),
            Err(PeerError::InvalidConfiguration { .. })
        ));

        let signer = Ed25519OrderSigner::generate(config.satellite_id);
        signer.save_key_file(&key_path).unwrap();
        config.signing_key_path = Some(key_path);

        let loaded = config.load_signer().unwrap();
        assert_eq!(loaded.satellite_id(), config.satellite_id);
        assert_eq!(loaded.verifying_key(), signer.verifying_key());
    }
}
