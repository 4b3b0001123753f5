mod internal;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
};
use craqfs_core::{BlockCoordinator, CHAIN_MESSAGE_PATH, CraqError};
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub struct ServerState {
    pub coordinator: Arc<BlockCoordinator>,
}

impl ServerState {
    pub fn new(coordinator: Arc<BlockCoordinator>) -> Self {
        Self { coordinator }
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    node_id: Option<String>,
    role: Option<String>,
}

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/blocks/:block_id",
            get(get_block).put(put_block).delete(delete_block),
        )
        .route("/blocks/:block_id/metadata", get(get_block_metadata))
        .route("/stats", get(get_stats))
        .route(CHAIN_MESSAGE_PATH, post(internal::chain_message))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub(crate) fn response_error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

pub(crate) fn status_for(error: &CraqError) -> StatusCode {
    match error {
        CraqError::NotFound(_) => StatusCode::NOT_FOUND,
        CraqError::NotReady(_) | CraqError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        CraqError::Validation(_) => StatusCode::BAD_REQUEST,
        CraqError::CapacityExceeded { .. } => StatusCode::INSUFFICIENT_STORAGE,
        CraqError::PeerUnreachable(_) => StatusCode::BAD_GATEWAY,
        CraqError::PropagationTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Maps a failed block operation to a response. Mutations sent to a node
/// other than the head are redirected there.
fn block_error(block_id: &str, error: CraqError) -> Response {
    if let CraqError::NotHead { head_address, .. } = &error {
        return Redirect::temporary(&head_location(head_address, block_id)).into_response();
    }

    let status = status_for(&error);
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!("Block {} operation failed: {}", block_id, error);
    }
    response_error(status, error.to_string())
}

fn head_location(head_address: &str, block_id: &str) -> String {
    let head_address = head_address.trim_end_matches('/');
    if head_address.starts_with("http://") || head_address.starts_with("https://") {
        format!("{}/blocks/{}", head_address, block_id)
    } else {
        format!("http://{}/blocks/{}", head_address, block_id)
    }
}

async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let (node_id, role) = match state.coordinator.chain() {
        Some(chain) => {
            let role = chain.role().await.ok().map(|role| format!("{:?}", role).to_lowercase());
            (Some(chain.local_node_id().to_string()), role)
        }
        None => (None, None),
    };

    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok",
            node_id,
            role,
        }),
    )
}

async fn put_block(
    State(state): State<Arc<ServerState>>,
    Path(block_id): Path<String>,
    body: Bytes,
) -> Response {
    match state.coordinator.write_block(&block_id, body).await {
        Ok(metadata) => (StatusCode::OK, Json(metadata)).into_response(),
        Err(error) => block_error(&block_id, error),
    }
}

async fn get_block(State(state): State<Arc<ServerState>>, Path(block_id): Path<String>) -> Response {
    match state.coordinator.read_block(&block_id).await {
        Ok(data) => {
            let mut response = (StatusCode::OK, data).into_response();
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            );
            response
        }
        Err(error) => block_error(&block_id, error),
    }
}

async fn get_block_metadata(
    State(state): State<Arc<ServerState>>,
    Path(block_id): Path<String>,
) -> Response {
    match state.coordinator.read_block_metadata(&block_id).await {
        Ok(metadata) => (StatusCode::OK, Json(metadata)).into_response(),
        Err(error) => block_error(&block_id, error),
    }
}

async fn delete_block(
    State(state): State<Arc<ServerState>>,
    Path(block_id): Path<String>,
) -> Response {
    match state.coordinator.delete_block(&block_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(error) => block_error(&block_id, error),
    }
}

async fn get_stats(State(state): State<Arc<ServerState>>) -> Response {
    match state.coordinator.stats().await {
        Ok(stats) => (StatusCode::OK, Json(stats.metrics())).into_response(),
        Err(error) => response_error(status_for(&error), error.to_string()),
    }
}
