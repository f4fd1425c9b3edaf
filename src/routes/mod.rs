//! HTTP route handlers.
//!
//! Each sub-module corresponds to an API endpoint group. All handlers except
//! [`health`] require authentication via the [`crate::auth::require_api_key`]
//! middleware; the session WebSockets in [`crate::ws`] check `?token=`
//! themselves.

pub mod gateways;
pub mod health;
pub mod sessions;

use axum::{
    http::StatusCode,
    middleware,
    routing::{get, post},
    Extension, Json, Router,
};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::auth::{self, ApiKey};
use crate::{ws, AppState};

/// Handler result: JSON on success, `(status, {"error", "code"})` otherwise.
pub type ApiResult<T = Json<Value>> = Result<T, (StatusCode, Json<Value>)>;

pub fn api_error(status: StatusCode, code: &str, message: impl Into<String>) -> (StatusCode, Json<Value>) {
    (status, Json(json!({"error": message.into(), "code": code})))
}

/// The full application router.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new().route("/api/health", get(health::health));

    let authed_routes = Router::new()
        .route(
            "/api/sessions",
            get(sessions::list_sessions).post(sessions::create_session),
        )
        .route(
            "/api/sessions/{id}",
            get(sessions::get_session).delete(sessions::delete_sessions),
        )
        .route("/api/sessions/{id}/connect", post(sessions::connect_session))
        .route("/api/sessions/{id}/resize", post(sessions::resize_session))
        .route(
            "/api/sessions/{id}/disconnect",
            post(sessions::disconnect_sessions),
        )
        .route("/api/sessions/{id}/recording", get(sessions::get_recording))
        .route("/api/gateways", get(gateways::list_gateways))
        .route(
            "/api/gateways/{id}/reconnect",
            post(gateways::reconnect_gateway),
        )
        .layer(middleware::from_fn(auth::require_api_key));

    let ws_routes = Router::new()
        .route("/api/sessions/{id}/tunnel", get(ws::subject_upgrade))
        .route("/api/sessions/{id}/tunnel-monitor", get(ws::observer_upgrade));

    Router::new()
        .merge(public_routes)
        .merge(authed_routes)
        .merge(ws_routes)
        .layer(Extension(ApiKey(state.config.auth.api_key.clone())))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
