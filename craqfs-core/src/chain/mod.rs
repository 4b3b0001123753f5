//! Chain replication (CRAQ)
//!
//! Topology, per-block version ledger, protocol messages, the transport seam
//! and the chain manager driving writes, apportioned reads and deletes.

pub mod ledger;
pub mod manager;
pub mod message;
pub mod topology;
pub mod transport;

pub use ledger::{AppendOutcome, Block, BlockLedger, BlockVersion, VersionSummary};
pub use manager::{
    ChainManager, ChainSettings, ChainStats, DEFAULT_PROPAGATION_TIMEOUT, VersionedBlock,
    WriteReceipt,
};
pub use message::ChainMessage;
pub use topology::{ChainNode, ChainTopology, NodeRole};
pub use transport::{
    CHAIN_MESSAGE_PATH, HttpTransport, LinkFault, LocalTransport, MessageHandler,
    Session, Transport,
};
