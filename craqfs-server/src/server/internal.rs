use super::ServerState;
use axum::{Json, extract::State};
use craqfs_core::{ChainMessage, CraqError, MessageHandler};
use std::sync::Arc;

/// Peer-facing chain endpoint. Protocol failures travel back as a `Failure`
/// message with a 200 status so the sender can rebuild the error.
pub(crate) async fn chain_message(
    State(state): State<Arc<ServerState>>,
    Json(message): Json<ChainMessage>,
) -> Json<ChainMessage> {
    let Some(chain) = state.coordinator.chain() else {
        return Json(ChainMessage::failure(&CraqError::Internal(
            "node has no chain configured".to_string(),
        )));
    };

    let kind = message.kind();
    match chain.handle(message).await {
        Ok(reply) => Json(reply),
        Err(error) => {
            tracing::debug!("Chain {} failed: {}", kind, error);
            Json(ChainMessage::failure(&error))
        }
    }
}
