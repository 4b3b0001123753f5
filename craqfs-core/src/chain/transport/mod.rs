//! Transport module for chain messaging
//!
//! Provides a trait-based abstraction over the byte pipe between chain nodes
//! (in-process for tests, JSON over HTTP for deployments).

pub mod http;
pub mod local;

use crate::chain::message::ChainMessage;
use crate::error::Result;
use async_trait::async_trait;
use ulid::Ulid;

pub use http::{CHAIN_MESSAGE_PATH, HttpTransport};
pub use local::{LinkFault, LocalTransport};

/// An open channel to one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    id: String,
    address: String,
}

impl Session {
    pub fn new(address: &str) -> Self {
        Self {
            id: Ulid::new().to_string(),
            address: address.to_string(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

/// Trait for transport implementations
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a session to the peer listening on `address`
    async fn connect(&self, address: &str) -> Result<Session>;

    /// Send a request and wait for the peer's reply. A `Failure` reply is
    /// returned as the error it carries.
    async fn send(&self, session: &Session, message: ChainMessage) -> Result<ChainMessage>;

    /// Release a session
    async fn disconnect(&self, session: &Session) -> Result<()>;
}

/// Receiving side of a transport: what a node exposes to its peers.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: ChainMessage) -> Result<ChainMessage>;
}

