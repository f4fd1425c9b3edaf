//! REST endpoints for access gateways.
//!
//! - `GET  /api/gateways`                 list link status
//! - `POST /api/gateways/{id}/reconnect`  drop and redial one link

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};

use super::{api_error, ApiResult};
use crate::gateway::GatewayError;
use crate::AppState;

/// `GET /api/gateways`: status of every configured gateway, sorted by id.
pub async fn list_gateways(State(state): State<AppState>) -> Json<Value> {
    let gateways = state.gateways.list().await;
    Json(json!({ "gateways": gateways }))
}

/// `POST /api/gateways/{id}/reconnect`: redial a gateway and report the
/// result. A failed dial is not an error here; it shows up in `message`.
pub async fn reconnect_gateway(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult {
    match state.gateways.reconnect(&id).await {
        Ok(status) => Ok(Json(json!(status))),
        Err(GatewayError::NotFound(_)) => Err(api_error(
            StatusCode::NOT_FOUND,
            "GATEWAY_NOT_FOUND",
            format!("Gateway {id} not found"),
        )),
        Err(e) => Err(api_error(
            StatusCode::BAD_GATEWAY,
            "GATEWAY_UNAVAILABLE",
            e.to_string(),
        )),
    }
}
