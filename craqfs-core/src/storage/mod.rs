//! Storage modules for Craqfs
//!
//! Provides the sharded local block store and the block metadata envelope.

pub mod block_store;
pub mod metadata;

pub use block_store::{
    LocalBlockStore, SHARD_COUNT, StoredBlock, WriteOutcome, shard_for, validate_block_id,
};
pub use metadata::{BlockMetadata, compute_hash, verify_hash};
