//! REST endpoints for session descriptors.
//!
//! - `POST   /api/sessions`                  create from an asset
//! - `GET    /api/sessions`                  filtered, paged list
//! - `GET    /api/sessions/{id}`             one descriptor
//! - `POST   /api/sessions/{id}/connect`     mark connected
//! - `POST   /api/sessions/{id}/resize`      record display size
//! - `POST   /api/sessions/{ids}/disconnect` force-close, comma-separated ids
//! - `DELETE /api/sessions/{ids}`            delete descriptors and recordings
//! - `GET    /api/sessions/{id}/recording`   download the recording file

use std::path::{Path as FsPath, PathBuf};

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::{api_error, ApiResult};
use crate::sessions::endpoint::CloseCode;
use crate::store::{SessionFilter, SessionStatus, StoreError};
use crate::util::split_ids;
use crate::AppState;

/// File guacd writes inside a session's recording directory.
const RECORDING_FILE: &str = "recording";

fn not_found(id: &str) -> (StatusCode, Json<Value>) {
    api_error(
        StatusCode::NOT_FOUND,
        "SESSION_NOT_FOUND",
        format!("Session {id} not found"),
    )
}

/// Best-effort client address: first `X-Forwarded-For` hop, then `X-Real-IP`.
fn client_ip(headers: &HeaderMap) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    forwarded
        .or_else(|| headers.get("x-real-ip").and_then(|v| v.to_str().ok()))
        .unwrap_or_default()
        .to_string()
}

fn recording_file(recording: &str) -> PathBuf {
    FsPath::new(recording).join(RECORDING_FILE)
}

// ─── Create ──────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateSessionRequest {
    pub asset_id: String,
    #[serde(default)]
    pub creator: String,
}

/// `POST /api/sessions`: create a `no_connect` descriptor for an asset.
pub async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateSessionRequest>,
) -> ApiResult {
    let session = state
        .store
        .create_session(&payload.asset_id, &payload.creator, &client_ip(&headers))
        .await
        .map_err(|e| match e {
            StoreError::AssetNotFound(_) => {
                api_error(StatusCode::NOT_FOUND, "ASSET_NOT_FOUND", e.to_string())
            }
            StoreError::CredentialNotFound(_) => api_error(
                StatusCode::UNPROCESSABLE_ENTITY,
                "CREDENTIAL_NOT_FOUND",
                e.to_string(),
            ),
            StoreError::SessionNotFound(_) => {
                api_error(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", e.to_string())
            }
        })?;
    info!(session_id = %session.id, asset_id = %session.asset_id, "Session created");
    Ok(Json(json!(session)))
}

// ─── List / get ──────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub protocol: Option<String>,
    pub creator: Option<String>,
    pub client_ip: Option<String>,
    pub asset_id: Option<String>,
    #[serde(default)]
    pub page_index: usize,
    #[serde(default)]
    pub page_size: usize,
}

/// `GET /api/sessions`: most recently connected first. Disconnected sessions
/// carry `recording_available`, true when the recording file is on disk.
pub async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult {
    let status = match query.status.as_deref().filter(|s| !s.is_empty()) {
        Some(s) => Some(s.parse::<SessionStatus>().map_err(|()| {
            api_error(
                StatusCode::BAD_REQUEST,
                "INVALID_STATUS",
                format!("Unknown session status {s:?}"),
            )
        })?),
        None => None,
    };
    let filter = SessionFilter {
        status,
        protocol: query.protocol,
        creator: query.creator,
        client_ip: query.client_ip,
        asset_id: query.asset_id,
        page_index: query.page_index,
        page_size: query.page_size,
    };
    let page = state.store.list_sessions(&filter).await;

    let mut items = Vec::with_capacity(page.items.len());
    for session in page.items {
        let available = match (&session.status, &session.recording) {
            (SessionStatus::Disconnected, Some(recording)) => {
                tokio::fs::try_exists(recording_file(recording))
                    .await
                    .unwrap_or(false)
            }
            _ => false,
        };
        let mut item = json!(session);
        item["recording_available"] = json!(available);
        items.push(item);
    }

    Ok(Json(json!({
        "total": page.total,
        "items": items,
    })))
}

/// `GET /api/sessions/{id}`: one descriptor, secrets omitted.
pub async fn get_session(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let session = state.store.get_session(&id).await.ok_or_else(|| not_found(&id))?;
    Ok(Json(json!(session)))
}

// ─── Connect / resize ────────────────────────────────────────────────────────

/// `POST /api/sessions/{id}/connect`: mark the session connected.
pub async fn connect_session(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    state
        .store
        .mark_connected(&id)
        .await
        .map_err(|_| not_found(&id))?;
    Ok(Json(json!({"ok": true, "session_id": id})))
}

#[derive(Deserialize)]
pub struct ResizeQuery {
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// `POST /api/sessions/{id}/resize?width=&height=`: record the display size
/// observers will join with. Both dimensions are required.
pub async fn resize_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ResizeQuery>,
) -> ApiResult {
    let (Some(width), Some(height)) = (query.width, query.height) else {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "INVALID_SIZE",
            "width and height are required",
        ));
    };
    let found = state
        .store
        .update_session(&id, |s| {
            s.width = width;
            s.height = height;
        })
        .await;
    if !found {
        return Err(not_found(&id));
    }
    Ok(Json(json!({"ok": true, "session_id": id, "width": width, "height": height})))
}

// ─── Disconnect / delete ─────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct DisconnectQuery {
    pub reason: Option<String>,
}

/// `POST /api/sessions/{ids}/disconnect[?reason=]`: force-close every listed
/// session. Unknown ids are reported, not rejected.
pub async fn disconnect_sessions(
    State(state): State<AppState>,
    Path(ids): Path<String>,
    Query(query): Query<DisconnectQuery>,
) -> ApiResult {
    let reason = query
        .reason
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| "forced disconnect".to_string());
    let mut results = Vec::new();
    for id in split_ids(&ids) {
        let outcome = state
            .registry
            .close_session(id, CloseCode::ForcedDisconnect, &reason)
            .await;
        info!(session_id = id, was_live = outcome.was_live, "Forced disconnect");
        results.push(json!({
            "session_id": id,
            "was_live": outcome.was_live,
        }));
    }
    Ok(Json(json!({"ok": true, "sessions": results})))
}

/// `DELETE /api/sessions/{ids}`: remove each recording directory, then the
/// descriptor.
pub async fn delete_sessions(State(state): State<AppState>, Path(ids): Path<String>) -> ApiResult {
    let recording_dir = FsPath::new(&state.config.guacd.recording_dir);
    let mut deleted = Vec::new();
    for id in split_ids(&ids) {
        let dir = recording_dir.join(id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(session_id = id, "Failed to remove {}: {e}", dir.display());
                return Err(api_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "IO_ERROR",
                    format!("Failed to remove recording for {id}: {e}"),
                ));
            }
        }
        if state.store.delete_session(id).await.is_some() {
            deleted.push(id.to_string());
        }
    }
    Ok(Json(json!({"ok": true, "deleted": deleted})))
}

// ─── Recording ───────────────────────────────────────────────────────────────

/// `GET /api/sessions/{id}/recording`: the raw guacd recording.
pub async fn get_recording(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, (StatusCode, Json<Value>)> {
    let session = state.store.get_session(&id).await.ok_or_else(|| not_found(&id))?;
    let missing = || {
        api_error(
            StatusCode::NOT_FOUND,
            "RECORDING_NOT_FOUND",
            format!("Session {id} has no recording"),
        )
    };
    let recording = session.recording.as_deref().ok_or_else(missing)?;
    let data = tokio::fs::read(recording_file(recording))
        .await
        .map_err(|_| missing())?;
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], data).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::Asset;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    const TOKEN: &str = "secret";

    fn state(recording_dir: &str) -> AppState {
        let mut config = Config::default();
        config.auth.api_key = TOKEN.to_string();
        config.guacd.recording_dir = recording_dir.to_string();
        config.assets = vec![Asset {
            id: "web".to_string(),
            ip: "10.0.0.5".to_string(),
            port: 3389,
            protocol: "rdp".to_string(),
            active: true,
            ..Asset::default()
        }];
        AppState::new(config)
    }

    async fn call(state: &AppState, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder()
            .method(method)
            .uri(uri)
            .header("authorization", format!("Bearer {TOKEN}"))
            .header("x-forwarded-for", "192.0.2.7, 10.0.0.1");
        let body = match body {
            Some(v) => {
                request = request.header("content-type", "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let response = crate::routes::router(state.clone())
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("gatekeep-{name}-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_create_get_connect_resize() {
        let state = state("/nonexistent");
        let (status, created) = call(
            &state,
            "POST",
            "/api/sessions",
            Some(json!({"asset_id": "web", "creator": "u1"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(created["status"], "no_connect");
        assert_eq!(created["client_ip"], "192.0.2.7");
        assert!(created.get("password").is_none());
        let id = created["id"].as_str().unwrap().to_string();

        let (status, _) = call(&state, "POST", &format!("/api/sessions/{id}/connect"), None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = call(&state, "POST", &format!("/api/sessions/{id}/resize?width=1280"), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = call(
            &state,
            "POST",
            &format!("/api/sessions/{id}/resize?width=1280&height=720"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, got) = call(&state, "GET", &format!("/api/sessions/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(got["status"], "connected");
        assert_eq!(got["width"], 1280);
        assert_eq!(got["height"], 720);
    }

    #[tokio::test]
    async fn test_errors() {
        let state = state("/nonexistent");
        let (status, body) = call(&state, "POST", "/api/sessions", Some(json!({"asset_id": "nope"}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "ASSET_NOT_FOUND");

        let (status, body) = call(&state, "GET", "/api/sessions/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "SESSION_NOT_FOUND");

        let (status, body) = call(&state, "GET", "/api/sessions?status=bogus", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_STATUS");
    }

    #[tokio::test]
    async fn test_requires_bearer_token() {
        let state = state("/nonexistent");
        let response = crate::routes::router(state)
            .oneshot(Request::builder().uri("/api/sessions").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_forced_disconnect_marks_descriptor() {
        let state = state("/nonexistent");
        let a = state.store.create_session("web", "u1", "").await.unwrap().id;
        let b = state.store.create_session("web", "u1", "").await.unwrap().id;
        state.store.mark_connected(&a).await.unwrap();

        let (status, body) = call(
            &state,
            "POST",
            &format!("/api/sessions/{a},{b}/disconnect?reason=maintenance"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["sessions"].as_array().unwrap().len(), 2);

        let a = state.store.get_session(&a).await.unwrap();
        assert_eq!(a.status, SessionStatus::Disconnected);
        assert_eq!(a.code, Some(802));
        assert_eq!(a.message.as_deref(), Some("maintenance"));
        let b = state.store.get_session(&b).await.unwrap();
        assert_eq!(b.status, SessionStatus::Disconnected);
        assert_eq!(b.code, Some(802));
    }

    #[tokio::test]
    async fn test_list_flags_recordings() {
        let dir = temp_dir("list");
        let state = state(dir.to_str().unwrap());
        let with = state.store.create_session("web", "u1", "").await.unwrap().id;
        let without = state.store.create_session("web", "u1", "").await.unwrap().id;
        for (id, file) in [(&with, true), (&without, false)] {
            let recording = dir.join(id);
            std::fs::create_dir_all(&recording).unwrap();
            if file {
                std::fs::write(recording.join(RECORDING_FILE), b"4.sync,1.1;").unwrap();
            }
            let path = recording.to_string_lossy().into_owned();
            state
                .store
                .update_session(id, |s| {
                    s.status = SessionStatus::Disconnected;
                    s.recording = Some(path);
                })
                .await;
        }

        let (status, body) = call(&state, "GET", "/api/sessions?status=disconnected", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 2);
        for item in body["items"].as_array().unwrap() {
            assert_eq!(item["recording_available"], item["id"] == with.as_str());
        }

        let response = crate::routes::router(state.clone())
            .oneshot(
                Request::builder()
                    .uri(format!("/api/sessions/{with}/recording"))
                    .header("authorization", format!("Bearer {TOKEN}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"4.sync,1.1;");

        let (status, _) = call(&state, "GET", &format!("/api/sessions/{without}/recording"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_delete_removes_recordings() {
        let dir = temp_dir("delete");
        let state = state(dir.to_str().unwrap());
        let a = state.store.create_session("web", "u1", "").await.unwrap().id;
        let b = state.store.create_session("web", "u1", "").await.unwrap().id;
        std::fs::create_dir_all(dir.join(&a)).unwrap();
        std::fs::write(dir.join(&a).join(RECORDING_FILE), b"x").unwrap();

        let (status, body) = call(&state, "DELETE", &format!("/api/sessions/{a},{b},nope"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["deleted"].as_array().unwrap().len(), 2);
        assert!(!dir.join(&a).exists());
        assert!(state.store.get_session(&a).await.is_none());
        assert!(state.store.get_session(&b).await.is_none());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
