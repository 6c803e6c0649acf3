//! HTTP handlers for the flow API, health check and WebSocket upgrade.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Path, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use tracing::{debug, info};

use flowrelay_core::{FlowDocument, FlowId};
use flowrelay_store::{StoreError, ValidationReport};

use crate::error::ApiError;
use crate::server::AppState;
use crate::session::{self, SessionConfig};

pub const SAVE_OK: &str = "Flow saved successfully";

/// `POST /api/flow`: overwrite the current flow.
pub async fn save_flow(
    State(state): State<AppState>,
    payload: Result<Json<FlowDocument>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(flow) = payload?;
    let empty = flow.is_empty();
    let ack = state.store.save(flow);
    info!(flow_id = %ack.id, revision = ack.revision, empty, "Flow saved");
    Ok(Json(json!({ "message": SAVE_OK })))
}

/// `GET /api/flow/{flow_id}`
pub async fn load_flow(
    State(state): State<AppState>,
    Path(flow_id): Path<String>,
) -> Result<Json<Arc<FlowDocument>>, ApiError> {
    state.store.load(&flow_id).map(Json).map_err(|e| match e {
        StoreError::NotFound(id) => {
            debug!(flow_id = %id, "Flow not found");
            ApiError::FlowNotFound {
                id,
                strict: state.config.strict_not_found,
            }
        }
    })
}

/// `POST /api/validate`
pub async fn validate_flow(
    State(state): State<AppState>,
    payload: Result<Json<FlowDocument>, JsonRejection>,
) -> Result<Json<ValidationReport>, ApiError> {
    let Json(flow) = payload?;
    Ok(Json(state.validator.validate(&flow)))
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "connections": state.hub.count(),
        "flows": state.store.len(),
        "current_flow": state.store.contains(FlowId::CURRENT),
        "last_saved_at": state.store.last_saved_at(),
    }))
}

/// `GET /ws`: upgrade and hand the socket to the hub.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    let session_config = SessionConfig::from(state.config.as_ref());
    let hub = Arc::clone(&state.hub);
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| session::run_session(socket, hub, Some(peer), session_config))
}
