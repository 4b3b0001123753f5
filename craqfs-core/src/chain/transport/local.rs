use super::{MessageHandler, Session, Transport};
use crate::chain::message::ChainMessage;
use crate::error::{CraqError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::RwLock;

/// Fault applied to every message sent to one address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkFault {
    /// Connects and sends fail immediately.
    Unreachable,
    /// The request is lost; the sender waits forever.
    DropRequest,
    /// The peer handles the request but its reply is lost.
    DropReply,
    Delay(Duration),
}

/// In-process hub routing messages between nodes of one process by address.
///
/// Handlers are held weakly so a node owning an `Arc` of this hub does not
/// keep itself alive through it.
#[derive(Default)]
pub struct LocalTransport {
    handlers: RwLock<HashMap<String, Weak<dyn MessageHandler>>>,
    faults: RwLock<HashMap<String, LinkFault>>,
    sessions: RwLock<HashMap<String, String>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, address: &str, handler: &Arc<dyn MessageHandler>) {
        self.handlers
            .write()
            .await
            .insert(address.to_string(), Arc::downgrade(handler));
    }

    pub async fn set_fault(&self, address: &str, fault: LinkFault) {
        self.faults
            .write()
            .await
            .insert(address.to_string(), fault);
    }

    pub async fn clear_fault(&self, address: &str) {
        self.faults.write().await.remove(address);
    }

    pub async fn open_sessions(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn fault(&self, address: &str) -> Option<LinkFault> {
        self.faults.read().await.get(address).copied()
    }

    async fn handler(&self, address: &str) -> Result<Arc<dyn MessageHandler>> {
        self.handlers
            .read()
            .await
            .get(address)
            .and_then(Weak::upgrade)
            .ok_or_else(|| CraqError::PeerUnreachable(address.to_string()))
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn connect(&self, address: &str) -> Result<Session> {
        if self.fault(address).await == Some(LinkFault::Unreachable) {
            return Err(CraqError::PeerUnreachable(address.to_string()));
        }
        self.handler(address).await?;

        let session = Session::new(address);
        self.sessions
            .write()
            .await
            .insert(session.id().to_string(), address.to_string());
        Ok(session)
    }

    async fn send(&self, session: &Session, message: ChainMessage) -> Result<ChainMessage> {
        if !self.sessions.read().await.contains_key(session.id()) {
            return Err(CraqError::PeerUnreachable(format!(
                "session {} to {} is closed",
                session.id(),
                session.address()
            )));
        }

        let fault = self.fault(session.address()).await;
        match fault {
            Some(LinkFault::Unreachable) => {
                return Err(CraqError::PeerUnreachable(session.address().to_string()));
            }
            Some(LinkFault::DropRequest) => {
                tracing::debug!("Dropping {} to {}", message.kind(), session.address());
                std::future::pending::<()>().await;
            }
            Some(LinkFault::Delay(delay)) => tokio::time::sleep(delay).await,
            Some(LinkFault::DropReply) | None => {}
        }

        let handler = self.handler(session.address()).await?;
        let reply = match handler.handle(message).await {
            Ok(reply) => reply,
            Err(error) => ChainMessage::failure(&error),
        };

        if fault == Some(LinkFault::DropReply) {
            tracing::debug!("Dropping {} from {}", reply.kind(), session.address());
            std::future::pending::<()>().await;
        }

        reply.into_result()
    }

    async fn disconnect(&self, session: &Session) -> Result<()> {
        self.sessions.write().await.remove(session.id());
        Ok(())
    }
}
