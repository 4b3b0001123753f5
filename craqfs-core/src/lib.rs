//! Craqfs Core - Core library for a CRAQ-replicated block storage node
//!
//! A fixed-topology block replica using:
//! - Chain Replication with Apportioned Queries (writes head to tail, reads anywhere)
//! - Per-block version ledger with dirty/clean state
//! - 256-way sharded local block store with SHA256 checksums
//! - Pluggable transport (in-process or JSON over HTTP)

pub mod chain;
pub mod coordinator;
pub mod error;
pub mod storage;

pub use chain::{
    AppendOutcome, Block, BlockLedger, BlockVersion, CHAIN_MESSAGE_PATH, ChainManager,
    ChainMessage, ChainNode, ChainSettings, ChainStats, ChainTopology,
    DEFAULT_PROPAGATION_TIMEOUT, HttpTransport, LinkFault, LocalTransport,
    MessageHandler, NodeRole, Session, Transport, VersionSummary, VersionedBlock, WriteReceipt,
};
pub use coordinator::{BlockCoordinator, NodeStats};
pub use error::{CraqError, Result};
pub use storage::{
    BlockMetadata, LocalBlockStore, SHARD_COUNT, StoredBlock, WriteOutcome, compute_hash,
    shard_for, validate_block_id, verify_hash,
};
