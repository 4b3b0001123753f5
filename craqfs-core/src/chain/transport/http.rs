use super::{Session, Transport};
use crate::chain::message::ChainMessage;
use crate::error::{CraqError, Result};
use async_trait::async_trait;
use reqwest::{Client, header};
use std::collections::HashMap;
use tokio::sync::RwLock;

pub const CHAIN_MESSAGE_PATH: &str = "/internal/v1/chain/messages";

/// JSON over HTTP to the peer's internal chain endpoint.
///
/// Sessions are bookkeeping only; the underlying client pools connections.
#[derive(Default)]
pub struct HttpTransport {
    client: Client,
    sessions: RwLock<HashMap<String, String>>,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message_url(address: &str) -> String {
        let address = address.trim_end_matches('/');
        if address.starts_with("http://") || address.starts_with("https://") {
            format!("{}{}", address, CHAIN_MESSAGE_PATH)
        } else {
            format!("http://{}{}", address, CHAIN_MESSAGE_PATH)
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn connect(&self, address: &str) -> Result<Session> {
        if address.trim().is_empty() {
            return Err(CraqError::Validation(
                "peer address cannot be empty".to_string(),
            ));
        }

        let session = Session::new(address);
        self.sessions
            .write()
            .await
            .insert(session.id().to_string(), address.to_string());
        tracing::debug!("Opened session {} to {}", session.id(), address);
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

        let response = self
            .client
            .post(Self::message_url(session.address()))
            .header(header::CONTENT_TYPE, "application/json")
            .json(&message)
            .send()
            .await
            .map_err(|error| {
                if error.is_connect() {
                    CraqError::PeerUnreachable(format!("{}: {}", session.address(), error))
                } else {
                    CraqError::Http(error.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(CraqError::Http(format!(
                "chain message {} failed: peer={} status={}",
                message.kind(),
                session.address(),
                response.status()
            )));
        }

        let reply: ChainMessage = response
            .json()
            .await
            .map_err(|error| CraqError::Http(error.to_string()))?;
        reply.into_result()
    }

    async fn disconnect(&self, session: &Session) -> Result<()> {
        self.sessions.write().await.remove(session.id());
        Ok(())
    }
}
