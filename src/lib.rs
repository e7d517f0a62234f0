//! Library entrypoint for segment-repair.
//!
//! The repair pipeline of an erasure-coded storage network: a durable queue of
//! damaged segments, a worker loop draining it, and the per-segment repairer
//! that downloads surviving pieces, reconstructs the missing ones and places
//! them on fresh storage nodes.

pub mod erasure_coding;
pub mod fanout;
pub mod metadata_store;
pub mod order_rollups;
pub mod orders;
pub mod overlay;
pub mod peer;
pub mod redundancy;
pub mod repair_queue;
pub mod repair_service;
pub mod repairer;
pub mod segment;
pub mod shutdown;
pub mod transport;

pub use erasure_coding::{ErasureCoder, ReedSolomonCoder};
pub use metadata_store::{MemoryPointerStore, PointerStore, SqlitePointerStore};
pub use peer::{RepairerDeps, RepairerPeer, RepairerPeerConfig};
pub use repair_queue::{MemoryRepairQueue, RepairQueue, RepairQueueEntry, SqliteRepairQueue};
pub use repair_service::{RepairService, RepairStats};
pub use repairer::{RepairConfig, RepairOutcome, RepairResult, SegmentRepairer};
pub use segment::{NodeId, Piece, RedundancyScheme, Segment, SegmentKey};
pub use shutdown::Shutdown;
