//! Pre-shared API key authentication.
//!
//! REST endpoints other than `/api/health` require `Authorization: Bearer <key>`.
//! The session WebSockets take the key as `?token=` instead and check it with
//! [`constant_time_eq`] before upgrading.

use axum::{
    extract::Request,
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Expected API key, injected as a router extension so [`require_api_key`]
/// does not need the application state.
#[derive(Clone)]
pub struct ApiKey(pub String);

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

fn reject(status: StatusCode, code: &str, message: &str) -> Response {
    (status, Json(json!({"error": message, "code": code}))).into_response()
}

/// Reject requests without a valid bearer token.
///
/// - `401 Unauthorized`: header missing or not a bearer token
/// - `403 Forbidden`: wrong key
/// - `500 Internal Server Error`: no [`ApiKey`] extension on the router
pub async fn require_api_key(request: Request, next: Next) -> Response {
    let Some(ApiKey(expected)) = request.extensions().get::<ApiKey>().cloned() else {
        return reject(
            StatusCode::INTERNAL_SERVER_ERROR,
            "SERVER_MISCONFIGURED",
            "Server configuration error",
        );
    };
    let Some(provided) = bearer_token(request.headers()) else {
        return reject(
            StatusCode::UNAUTHORIZED,
            "UNAUTHORIZED",
            "Missing or invalid Authorization header",
        );
    };
    if !constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
        return reject(StatusCode::FORBIDDEN, "FORBIDDEN", "Invalid API key");
    }
    next.run(request).await
}

/// Compare without an early exit. Always walks the full length of `expected`,
/// so response time does not reveal how much of the key matched or its length.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, e) in expected.iter().enumerate() {
        diff |= e ^ provided.get(i).copied().unwrap_or(0xff);
    }
    diff == 0
}
