//! Overlay Selection Module
//!
//! This module implements the repair-facing slice of the node overlay: a
//! catalog of storage nodes with their reachability, vetting and reputation
//! state, and the selection strategy that picks destinations for newly
//! reconstructed pieces. Selection never returns an excluded node or a
//! duplicate, and spreads picks across subnets so a single network outage
//! cannot take out more than one new piece.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::segment::NodeId;

/// Subnet grouping of a node's address: /24 for IPv4, /64 for IPv6
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Subnet(pub String);

impl Subnet {
    pub fn of(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => {
                let o = v4.octets();
                Self(format!("{}.{}.{}.0/24", o[0], o[1], o[2]))
            }
            IpAddr::V6(v6) => {
                let s = v6.segments();
                Self(format!("{:x}:{:x}:{:x}:{:x}::/64", s[0], s[1], s[2], s[3]))
            }
        }
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Selection-relevant snapshot of a storage node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub address: SocketAddr,
    pub last_net: Subnet,
    pub online: bool,
    pub vetted: bool,
    pub reputation: f64,
    pub disqualified: bool,
    pub suspended: bool,
}

impl Node {
    /// Create an online, vetted node with full reputation
    pub fn new(id: NodeId, address: SocketAddr) -> Self {
        Self {
            id,
            address,
            last_net: Subnet::of(address.ip()),
            online: true,
            vetted: true,
            reputation: 1.0,
            disqualified: false,
            suspended: false,
        }
    }

    /// Whether pieces held by this node count toward redundancy
    pub fn is_healthy(&self) -> bool {
        self.online && !self.disqualified && !self.suspended
    }
}

/// Errors that can occur during overlay operations
#[derive(Error, Debug)]
pub enum OverlayError {
    #[error("Insufficient nodes: requested {requested}, available {available}")]
    InsufficientNodes { requested: usize, available: usize },

    #[error("Node catalog error: {reason}")]
    Catalog { reason: String },

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },
}

/// Result type for overlay operations
pub type OverlayResult<T> = Result<T, OverlayError>;

/// Configuration for the overlay selector
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    /// Never place two new pieces (or a new piece next to a healthy one) in the same subnet
    pub distinct_subnets: bool,
    /// Nodes below this reputation are never selected
    pub minimum_reputation: f64,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            distinct_subnets: true,
            minimum_reputation: 0.0,
        }
    }
}

impl OverlayConfig {
    pub fn validate(&self) -> OverlayResult<()> {
        if !(0.0..=1.0).contains(&self.minimum_reputation) {
            return Err(OverlayError::Configuration {
                reason: format!(
                    "minimum_reputation must be within [0, 1], got {}",
                    self.minimum_reputation
                ),
            });
        }
        Ok(())
    }
}

/// Read access to the node catalog
#[async_trait]
pub trait NodeCatalog: Send + Sync {
    /// Snapshots of the requested nodes; unknown ids are omitted
    async fn get_nodes(&self, ids: &[NodeId]) -> OverlayResult<Vec<Node>>;

    /// Snapshots of every known node
    async fn all_nodes(&self) -> OverlayResult<Vec<Node>>;
}

/// In-memory node catalog
#[derive(Debug, Default)]
pub struct MemoryNodeCatalog {
    nodes: RwLock<HashMap<NodeId, Node>>,
}

impl MemoryNodeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, node: Node) {
        self.nodes.write().insert(node.id, node);
    }

    pub fn set_online(&self, id: &NodeId, online: bool) {
        if let Some(node) = self.nodes.write().get_mut(id) {
            node.online = online;
        }
    }

    pub fn disqualify(&self, id: &NodeId) {
        if let Some(node) = self.nodes.write().get_mut(id) {
            node.disqualified = true;
        }
    }

    pub fn suspend(&self, id: &NodeId) {
        if let Some(node) = self.nodes.write().get_mut(id) {
            node.suspended = true;
        }
    }

    pub fn set_reputation(&self, id: &NodeId, reputation: f64) {
        if let Some(node) = self.nodes.write().get_mut(id) {
            node.reputation = reputation;
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }
}

#[async_trait]
impl NodeCatalog for MemoryNodeCatalog {
    async fn get_nodes(&self, ids: &[NodeId]) -> OverlayResult<Vec<Node>> {
        let nodes = self.nodes.read();
        Ok(ids.iter().filter_map(|id| nodes.get(id).cloned()).collect())
    }

    async fn all_nodes(&self) -> OverlayResult<Vec<Node>> {
        Ok(self.nodes.read().values().cloned().collect())
    }
}

/// Order candidates: higher reputation first, then vetted, then by id
fn sort_by_preference(candidates: &mut [Node]) {
    candidates.sort_by(|a, b| {
        b.reputation
            .partial_cmp(&a.reputation)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.vetted.cmp(&a.vetted))
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Pick up to `count` nodes from preference-ordered `candidates`.
///
/// With `distinct_subnets`, a first pass takes at most one node per subnet
/// (skipping `exclude_subnets`); if that leaves the request short, remaining
/// candidates fill in, since sharing a subnet beats not placing at all.
pub fn select_diverse(
    candidates: &[Node],
    count: usize,
    distinct_subnets: bool,
    exclude_subnets: &HashSet<Subnet>,
) -> Vec<Node> {
    if !distinct_subnets {
        return candidates.iter().take(count).cloned().collect();
    }

    let mut selected: Vec<Node> = Vec::with_capacity(count);
    let mut used_subnets: HashSet<&Subnet> = HashSet::new();
    let mut picked: HashSet<NodeId> = HashSet::new();

    for node in candidates {
        if selected.len() == count {
            break;
        }
        if exclude_subnets.contains(&node.last_net) || used_subnets.contains(&node.last_net) {
            continue;
        }
        used_subnets.insert(&node.last_net);
        picked.insert(node.id);
        selected.push(node.clone());
    }

    if selected.len() < count {
        debug!(
            "Only {} distinct subnets available for {} requested nodes; relaxing diversity",
            selected.len(),
            count
        );
        for node in candidates {
            if selected.len() == count {
                break;
            }
            if picked.insert(node.id) {
                selected.push(node.clone());
            }
        }
    }

    selected
}

/// Repair-facing overlay service
pub struct OverlayService {
    catalog: Arc<dyn NodeCatalog>,
    config: OverlayConfig,
}

impl OverlayService {
    pub fn new(catalog: Arc<dyn NodeCatalog>, config: OverlayConfig) -> OverlayResult<Self> {
        config.validate()?;
        Ok(Self { catalog, config })
    }

    pub fn config(&self) -> &OverlayConfig {
        &self.config
    }

    /// Subset of `node_ids` the catalog still considers reachable and in good standing
    pub async fn find_healthy_nodes_for(&self, node_ids: &[NodeId]) -> OverlayResult<HashSet<NodeId>> {
        Ok(self.healthy_nodes(node_ids).await?.into_keys().collect())
    }

    /// Snapshots of the healthy nodes among `node_ids`, keyed by id
    pub async fn healthy_nodes(&self, node_ids: &[NodeId]) -> OverlayResult<HashMap<NodeId, Node>> {
        let nodes = self.catalog.get_nodes(node_ids).await?;
        Ok(nodes
            .into_iter()
            .filter(Node::is_healthy)
            .map(|node| (node.id, node))
            .collect())
    }

    /// Select `count` distinct nodes to receive new pieces.
    ///
    /// Fails with `InsufficientNodes` (reporting how many eligible nodes do
    /// exist) when the catalog cannot satisfy the whole request; the caller
    /// decides whether a smaller placement is acceptable.
    pub async fn select_for_repair(
        &self,
        count: usize,
        exclude_nodes: &HashSet<NodeId>,
        exclude_subnets: &HashSet<Subnet>,
    ) -> OverlayResult<Vec<Node>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let mut candidates: Vec<Node> = self
            .catalog
            .all_nodes()
            .await?
            .into_iter()
            .filter(|node| node.is_healthy())
            .filter(|node| node.reputation >= self.config.minimum_reputation)
            .filter(|node| !exclude_nodes.contains(&node.id))
            .collect();

        // Excluded subnets are hard constraints only when diversity is enforced
        if self.config.distinct_subnets {
            candidates.retain(|node| !exclude_subnets.contains(&node.last_net));
        }

        if candidates.len() < count {
            warn!(
                "Insufficient nodes for repair: requested {}, eligible {}",
                count,
                candidates.len()
            );
            return Err(OverlayError::InsufficientNodes {
                requested: count,
                available: candidates.len(),
            });
        }

        sort_by_preference(&mut candidates);
        let selected = select_diverse(
            &candidates,
            count,
            self.config.distinct_subnets,
            exclude_subnets,
        );

        let subnets: BTreeMap<&Subnet, usize> =
            selected.iter().fold(BTreeMap::new(), |mut acc, node| {
                *acc.entry(&node.last_net).or_insert(0) += 1;
                acc
            });
        debug!(
            "Selected {} nodes for repair across {} subnets",
            selected.len(),
            subnets.len()
        );

        Ok(selected)
    }
}
