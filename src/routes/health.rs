//! Unauthenticated health-check endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

/// `GET /api/health`: liveness probe.
///
/// Returns status, uptime, version, the number of live sessions and how many
/// access gateways are currently connected. Does not dial any gateway.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    let live_sessions = state.registry.len().await;
    let gateways = state.gateways.list().await;
    let connected = gateways.iter().filter(|g| g.connected).count();

    Json(json!({
        "status": "ok",
        "uptime_secs": uptime,
        "version": env!("CARGO_PKG_VERSION"),
        "live_sessions": live_sessions,
        "gateways": {
            "configured": gateways.len(),
            "connected": connected,
        },
    }))
}
