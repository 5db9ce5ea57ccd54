//! Minimal reference sync server: a dumb encrypted
//! blob store keyed by `X-Sync-Key-Hash`, implementing exactly the HTTP
//! contract `protocol::SyncClient` speaks. This exists to exercise the
//! wire contract in tests and from `askesis-cli serve`; it is not a
//! production deployment (no persistence beyond process lifetime, no
//! rate limiting, no real account provisioning).
//!
//! Follows an axum usage pattern (`Router` + shared `Arc<Mutex<...>>`
//! app state, typed JSON extractors), generalized from a local dev-proxy
//! server to this sync contract.

use crate::sync::protocol::{SyncBlob, SYNC_KEY_HASH_HEADER};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tower_http::cors::{Any, CorsLayer};

const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

#[derive(Default)]
struct ServerState {
    blobs: Mutex<HashMap<String, SyncBlob>>,
}

#[derive(Debug, Deserialize)]
struct AnalyzeRequest {
    prompt: String,
    #[allow(dead_code)]
    system_instruction: String,
}

#[derive(Debug, Serialize)]
struct AnalyzeResponse {
    answer: String,
}

pub fn router() -> Router {
    let state = Arc::new(ServerState::default());
    // The sync relay is called directly by each device's own client, not
    // from a browser page on another origin, but the reference server is
    // also used from local dev tooling on a different port; a permissive
    // CORS layer keeps that path open without gating on an origin allowlist
    // the blob store has no concept of.
    let cors = CorsLayer::new().allow_methods(Any).allow_headers(Any).allow_origin(Any);
    Router::new()
        .route("/api/sync", axum::routing::get(pull).post(push))
        .route("/api/analyze", post(analyze))
        .with_state(state)
        .layer(cors)
}

fn key_hash(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SYNC_KEY_HASH_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

async fn pull(State(state): State<Arc<ServerState>>, headers: HeaderMap) -> Response {
    let Some(key) = key_hash(&headers) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    let blobs = state.blobs.lock().unwrap();
    match blobs.get(&key) {
        Some(blob) => Json(blob.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// `POST /api/sync`: 200 on accept, 304 if `lastModified` equals the
/// server's, 409 with the server's current blob if the client is stale
///. Shards the client omits (a delta push) are preserved from
/// the stored blob, not dropped.
async fn push(State(state): State<Arc<ServerState>>, headers: HeaderMap, body: axum::body::Bytes) -> Response {
    let Some(key) = key_hash(&headers) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    if body.len() > MAX_BODY_BYTES {
        return StatusCode::PAYLOAD_TOO_LARGE.into_response();
    }
    let req: SyncBlob = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };

    let mut blobs = state.blobs.lock().unwrap();
    match blobs.get(&key) {
        Some(existing) if req.last_modified == existing.last_modified => StatusCode::NOT_MODIFIED.into_response(),
        Some(existing) if req.last_modified < existing.last_modified => {
            (StatusCode::CONFLICT, Json(existing.clone())).into_response()
        }
        Some(existing) => {
            let mut merged_shards = existing.shards.clone();
            merged_shards.extend(req.shards);
            let merged = SyncBlob { last_modified: req.last_modified, shards: merged_shards };
            blobs.insert(key, merged);
            StatusCode::OK.into_response()
        }
        None => {
            blobs.insert(key, req);
            StatusCode::OK.into_response()
        }
    }
}

/// Placeholder AI bridge: this crate implements no AI logic itself
///; the reference server just echoes the prompt length
/// so integration tests can assert the request shape reaches the server.
async fn analyze(Json(req): Json<AnalyzeRequest>) -> Response {
    Json(AnalyzeResponse {
        answer: format!("received prompt of {} chars", req.prompt.len()),
    })
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn sync_request(method: &str, key: Option<&str>, body: serde_json::Value) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri("/api/sync").header("content-type", "application/json");
        if let Some(k) = key {
            builder = builder.header(SYNC_KEY_HASH_HEADER, k);
        }
        builder.body(Body::from(serde_json::to_vec(&body).unwrap())).unwrap()
    }

    #[tokio::test]
    async fn pull_without_header_is_unauthorized() {
        let app = router();
        let resp = app
            .oneshot(Request::builder().uri("/api/sync").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn pull_missing_account_returns_404() {
        let app = router();
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/sync")
                    .header(SYNC_KEY_HASH_HEADER, "acct1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn push_then_pull_round_trips_all_shards() {
        let app = router();
        let body = serde_json::json!({
            "lastModified": 10,
            "shards": {"core": "aaaa", "logs:2024-01": "bbbb"},
        });
        let push_resp = app.clone().oneshot(sync_request("POST", Some("acct1"), body)).await.unwrap();
        assert_eq!(push_resp.status(), StatusCode::OK);

        let pull_resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/sync")
                    .header(SYNC_KEY_HASH_HEADER, "acct1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(pull_resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(pull_resp.into_body(), usize::MAX).await.unwrap();
        let blob: SyncBlob = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(blob.shards.len(), 2);
    }

    #[tokio::test]
    async fn equal_last_modified_returns_304() {
        let app = router();
        let body = serde_json::json!({"lastModified": 5, "shards": {"core": "aa"}});
        app.clone().oneshot(sync_request("POST", Some("acct1"), body.clone())).await.unwrap();
        let resp = app.oneshot(sync_request("POST", Some("acct1"), body)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_MODIFIED);
    }

    #[tokio::test]
    async fn stale_push_returns_409_with_current_blob() {
        let app = router();
        let first = serde_json::json!({"lastModified": 10, "shards": {"core": "aa"}});
        app.clone().oneshot(sync_request("POST", Some("acct1"), first)).await.unwrap();

        let stale = serde_json::json!({"lastModified": 5, "shards": {"core": "bb"}});
        let resp = app.oneshot(sync_request("POST", Some("acct1"), stale)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let blob: SyncBlob = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(blob.last_modified, 10);
    }

    #[tokio::test]
    async fn delta_push_preserves_shards_omitted_from_the_request() {
        let app = router();
        let first = serde_json::json!({"lastModified": 10, "shards": {"core": "aa", "logs:2024-01": "bb"}});
        app.clone().oneshot(sync_request("POST", Some("acct1"), first)).await.unwrap();

        let delta = serde_json::json!({"lastModified": 20, "shards": {"core": "cc"}});
        app.clone().oneshot(sync_request("POST", Some("acct1"), delta)).await.unwrap();

        let pull_resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/sync")
                    .header(SYNC_KEY_HASH_HEADER, "acct1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(pull_resp.into_body(), usize::MAX).await.unwrap();
        let blob: SyncBlob = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(blob.shards.get("core").unwrap(), "cc");
        assert_eq!(blob.shards.get("logs:2024-01").unwrap(), "bb");
    }
}
