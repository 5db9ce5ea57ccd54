//! HTTP wire contract for the sync server. The server is a
//! dumb encrypted-blob store: it authenticates by `X-Sync-Key-Hash`
//! (`sha256(syncKey)`, never the key or derived encryption key itself)
//! and arbitrates conflicts purely by comparing the `lastModified` the
//! client claims against the one it has on file. A single request moves
//! every shard at once — `{lastModified, shards: {...}}` — not one
//! round trip per shard.
//!
//! Follows an `api_client` reqwest usage pattern (timeout,
//! retry-with-backoff, typed response envelopes), adapted from an LLM
//! HTTP API client to this crate's own blob-sync endpoint.

use crate::config::Config;
use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub const SYNC_KEY_HASH_HEADER: &str = "X-Sync-Key-Hash";

/// The wire shape of both the pull response and the push request body,
/// shards keyed by name (`"core"` or `"logs:YYYY-MM"`) with
/// base64-encoded ciphertext values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncBlob {
    pub last_modified: i64,
    pub shards: HashMap<String, String>,
}

/// Outcome of a push: accepted, no-op (already current), or
/// stale-client conflict carrying the server's actual blob.
pub enum PushOutcome {
    Accepted,
    NoChange,
    Conflict(SyncBlob),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeRequest<'a> {
    prompt: &'a str,
    system_instruction: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalyzeResponse {
    pub answer: String,
}

pub struct SyncClient {
    http: reqwest::Client,
    base_url: String,
    retries: u32,
    backoff_base: Duration,
}

impl SyncClient {
    pub fn new(cfg: &Config) -> AppResult<Option<Self>> {
        let Some(base_url) = cfg.sync_url.clone() else {
            return Ok(None);
        };
        let http = reqwest::Client::builder()
            .timeout(cfg.network_timeout)
            .build()
            .map_err(|e| AppError::Network(e.to_string()))?;
        Ok(Some(SyncClient {
            http,
            base_url,
            retries: cfg.network_retries,
            backoff_base: cfg.network_backoff_base,
        }))
    }

    /// `GET /api/sync`, header `X-Sync-Key-Hash`. 200 -> the full shard
    /// map; 404 -> no data for this key yet (`None`); 401 -> the header
    /// was missing or rejected.
    pub async fn pull(&self, key_hash: &str) -> AppResult<Option<SyncBlob>> {
        self.with_retries(|| async {
            let resp = self
                .http
                .get(format!("{}/api/sync", self.base_url))
                .header(SYNC_KEY_HASH_HEADER, key_hash)
                .send()
                .await
                .map_err(|e| AppError::Network(e.to_string()))?;
            match resp.status().as_u16() {
                200 => Ok(Some(
                    resp.json::<SyncBlob>()
                        .await
                        .map_err(|e| AppError::Network(e.to_string()))?,
                )),
                404 => Ok(None),
                401 => Err(AppError::Unauthorized),
                status => Err(AppError::Network(format!("unexpected pull status {status}"))),
            }
        })
        .await
    }

    /// `POST /api/sync`, header `X-Sync-Key-Hash`, body
    /// `{lastModified, shards}`. A `409` response body is the server's
    /// current blob, so the caller can pull-merge-retry instead of
    /// clobbering a concurrent write.
    pub async fn push(&self, key_hash: &str, blob: &SyncBlob, cfg: &Config) -> AppResult<PushOutcome> {
        let body_bytes = serde_json::to_vec(blob)?;
        if body_bytes.len() > cfg.max_upload_bytes {
            return Err(AppError::Validation(format!(
                "payload {} bytes exceeds max_upload_bytes {}",
                body_bytes.len(),
                cfg.max_upload_bytes
            )));
        }
        self.with_retries(|| async {
            let resp = self
                .http
                .post(format!("{}/api/sync", self.base_url))
                .header(SYNC_KEY_HASH_HEADER, key_hash)
                .json(blob)
                .send()
                .await
                .map_err(|e| AppError::Network(e.to_string()))?;
            match resp.status().as_u16() {
                200 => Ok(PushOutcome::Accepted),
                304 => Ok(PushOutcome::NoChange),
                401 => Err(AppError::Unauthorized),
                409 => {
                    let server_blob = resp
                        .json::<SyncBlob>()
                        .await
                        .map_err(|e| AppError::Network(e.to_string()))?;
                    Ok(PushOutcome::Conflict(server_blob))
                }
                413 => Err(AppError::Validation("payload too large".to_string())),
                status => Err(AppError::Network(format!("unexpected push status {status}"))),
            }
        })
        .await
    }

    /// `POST /api/analyze`: forwards an already-built prompt (never raw
    /// habit data) to the external AI collaborator, through the server so
    /// the API key never lives on the client.
    pub async fn analyze(&self, prompt: &str, system_instruction: &str) -> AppResult<String> {
        let body = AnalyzeRequest { prompt, system_instruction };
        let resp = self
            .http
            .post(format!("{}/api/analyze", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::Network(e.to_string()))?;
        match resp.status().as_u16() {
            200 => Ok(resp
                .json::<AnalyzeResponse>()
                .await
                .map_err(|e| AppError::Network(e.to_string()))?
                .answer),
            401 => Err(AppError::Unauthorized),
            status => Err(AppError::Network(format!("unexpected analyze status {status}"))),
        }
    }

    async fn with_retries<F, Fut, T>(&self, mut op: F) -> AppResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = AppResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(AppError::Network(msg)) if attempt < self.retries => {
                    log::warn!("sync request failed ({msg}), retrying (attempt {attempt})");
                    tokio::time::sleep(self.backoff_base * 2u32.pow(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
