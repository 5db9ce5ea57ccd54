//! Background crypto/archive task runner. Sync payloads are
//! encrypted/decrypted off the caller's task, on a `spawn_blocking` pool,
//! communicating through request/response envelopes over an mpsc channel
//! so the action layer never blocks its own task on AES-GCM or gzip work.
//!
//! Key derivation: HKDF-SHA256 over the user's `syncKey`, info string
//! `b"askesis-sync-v1"`, feeding a 256-bit key into AES-256-GCM. Follows
//! the `aes-gcm`/`hkdf`/`sha2`/`hmac` stack used for at-rest secrets in
//! `Sczr0-Next-Phi-Backend`; the worker-loop/channel shape is an
//! `agent::session_actor` mpsc command-loop pattern, generalized from a
//! long-lived actor to a one-shot-per-task pool.

use crate::error::{AppError, AppResult};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

const HKDF_INFO: &[u8] = b"askesis-sync-v1";
const NONCE_LEN: usize = 12;

/// Derives a 256-bit AES key from the user's raw sync passphrase/key.
pub fn derive_key(sync_key: &str) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(None, sync_key.as_bytes());
    let mut out = [0u8; 32];
    hk.expand(HKDF_INFO, &mut out)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    out
}

/// `encrypt(plaintext)`: random 96-bit nonce prefixed to the ciphertext.
pub fn encrypt(key: &[u8; 32], plaintext: &[u8]) -> AppResult<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| AppError::Crypto(e.to_string()))?;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, Payload { msg: plaintext, aad: &[] })
        .map_err(|e| AppError::Crypto(e.to_string()))?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// `decrypt(blob)`: inverse of `encrypt`.
pub fn decrypt(key: &[u8; 32], blob: &[u8]) -> AppResult<Vec<u8>> {
    if blob.len() < NONCE_LEN {
        return Err(AppError::Crypto("ciphertext shorter than nonce".to_string()));
    }
    let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| AppError::Crypto(e.to_string()))?;
    let nonce = Nonce::from_slice(nonce_bytes);
    cipher
        .decrypt(nonce, Payload { msg: ciphertext, aad: &[] })
        .map_err(|e| AppError::Crypto(e.to_string()))
}

/// `sha256Hex(syncKey)`: the server-facing account identifier, so the
/// dumb blob store never sees the key or derived encryption key itself.
pub fn sync_key_id(sync_key: &str) -> String {
    use sha2::Digest;
    let digest = Sha256::digest(sync_key.as_bytes());
    hex::encode(digest)
}

fn compress_bytes(bytes: &[u8]) -> AppResult<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).map_err(|e| AppError::Storage(e.to_string()))?;
    encoder.finish().map_err(|e| AppError::Storage(e.to_string()))
}

/// Gzip-compresses a JSON value, for archived-year blobs (spec.md
/// §4.4/§4.5).
pub(crate) fn compress_json(value: &serde_json::Value) -> AppResult<Vec<u8>> {
    compress_bytes(&serde_json::to_vec(value)?)
}

/// Inverse of `compress_json`.
pub(crate) fn decompress_json(bytes: &[u8]) -> AppResult<serde_json::Value> {
    use flate2::read::GzDecoder;
    use std::io::Read;
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).map_err(|e| AppError::Storage(e.to_string()))?;
    Ok(serde_json::from_slice(&out)?)
}

#[derive(Debug, Clone)]
pub enum CryptoTask {
    Encrypt { key: [u8; 32], plaintext: Vec<u8> },
    Decrypt { key: [u8; 32], ciphertext: Vec<u8> },
    ArchiveYear { json: Vec<u8> },
    /// Walk every archived year, strip `habit_id`'s entries out of each
    /// day, and recompress. A year whose archive is empty after the
    /// strip comes back with an empty `Vec<u8>`, which the caller reads
    /// as "delete this year entry" (spec.md §4.4 "prune-habit").
    PruneHabit { habit_id: String, archives: HashMap<i32, Vec<u8>> },
    BuildAiPrompt { context_json: Vec<u8> },
}

#[derive(Debug, Clone)]
pub enum CryptoOutput {
    Bytes(Vec<u8>),
    /// Only the years whose archive actually changed; an empty `Vec<u8>`
    /// value means "remove this year from `archives`".
    PrunedArchives(HashMap<i32, Vec<u8>>),
    Prompt(String),
}

pub struct TaskEnvelope {
    pub id: Uuid,
    pub task: CryptoTask,
    reply: oneshot::Sender<AppResult<CryptoOutput>>,
}

/// Handle held by the action layer to submit work and await results.
#[derive(Clone)]
pub struct CryptoWorker {
    tx: mpsc::Sender<TaskEnvelope>,
    cancelled: Arc<Mutex<HashSet<Uuid>>>,
}

impl CryptoWorker {
    /// Spawns the worker loop on the current tokio runtime. Each task is
    /// run via `spawn_blocking` so AES-GCM/gzip CPU work never stalls the
    /// async executor's reactor thread.
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::channel::<TaskEnvelope>(64);
        let cancelled = Arc::new(Mutex::new(HashSet::new()));
        let cancelled_loop = cancelled.clone();
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let TaskEnvelope { id, task, reply } = envelope;
                let cancelled = cancelled_loop.clone();
                tokio::spawn(async move {
                    let result = tokio::task::spawn_blocking(move || run_task(task))
                        .await
                        .unwrap_or_else(|e| Err(AppError::Crypto(format!("worker task panicked: {e}"))));
                    if cancelled.lock().unwrap().remove(&id) {
                        return;
                    }
                    let _ = reply.send(result);
                });
            }
        });
        CryptoWorker { tx, cancelled }
    }

    /// Submits a task and awaits its result. Returns `AppError::Crypto`
    /// if the worker loop has shut down.
    pub async fn submit(&self, task: CryptoTask) -> AppResult<CryptoOutput> {
        let id = Uuid::new_v4();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(TaskEnvelope { id, task, reply: reply_tx })
            .await
            .map_err(|_| AppError::Crypto("crypto worker channel closed".to_string()))?;
        reply_rx
            .await
            .unwrap_or_else(|_| Err(AppError::Crypto("crypto worker dropped the request".to_string())))
    }

    /// Marks a request id as cancelled: if its result arrives after this
    /// call, the reply is discarded instead of delivered.
    pub fn cancel(&self, id: Uuid) {
        self.cancelled.lock().unwrap().insert(id);
    }
}

fn run_task(task: CryptoTask) -> AppResult<CryptoOutput> {
    match task {
        CryptoTask::Encrypt { key, plaintext } => encrypt(&key, &plaintext).map(CryptoOutput::Bytes),
        CryptoTask::Decrypt { key, ciphertext } => decrypt(&key, &ciphertext).map(CryptoOutput::Bytes),
        CryptoTask::ArchiveYear { json } => compress_bytes(&json).map(CryptoOutput::Bytes),
        CryptoTask::PruneHabit { habit_id, archives } => {
            let mut updated = HashMap::new();
            for (year, bytes) in archives {
                let Ok(value) = decompress_json(&bytes) else {
                    log::warn!("[crypto_worker] dropping unparsable archive for year {year} during prune");
                    continue;
                };
                let mut by_date = value.as_object().cloned().unwrap_or_default();
                let mut changed = false;
                for day in by_date.values_mut() {
                    if let Some(by_habit) = day.as_object_mut() {
                        if by_habit.remove(&habit_id).is_some() {
                            changed = true;
                        }
                    }
                }
                by_date.retain(|_, day| day.as_object().map(|o| !o.is_empty()).unwrap_or(true));
                if !changed {
                    continue;
                }
                if by_date.is_empty() {
                    updated.insert(year, Vec::new());
                } else {
                    let compressed = compress_json(&serde_json::Value::Object(by_date))?;
                    updated.insert(year, compressed);
                }
            }
            Ok(CryptoOutput::PrunedArchives(updated))
        }
        CryptoTask::BuildAiPrompt { context_json } => {
            let value: serde_json::Value =
                serde_json::from_slice(&context_json).map_err(|e| AppError::Crypto(e.to_string()))?;
            Ok(CryptoOutput::Prompt(format!(
                "Summarize the following habit-tracking context and suggest one actionable insight:\n{value}"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_then_decrypt_roundtrips() {
        let key = derive_key("correct-horse-battery-staple");
        let plaintext = b"hello habit tracker";
        let ciphertext = encrypt(&key, plaintext).unwrap();
        assert_ne!(ciphertext, plaintext.to_vec());
        let decrypted = decrypt(&key, &ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn decrypt_rejects_tampered_ciphertext() {
        let key = derive_key("s3cret");
        let mut ciphertext = encrypt(&key, b"payload").unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xFF;
        assert!(decrypt(&key, &ciphertext).is_err());
    }

    #[test]
    fn different_keys_derive_different_material() {
        let a = derive_key("key-a");
        let b = derive_key("key-b");
        assert_ne!(a, b);
    }

    #[test]
    fn sync_key_id_is_stable_and_not_the_raw_key() {
        let id1 = sync_key_id("my-passphrase");
        let id2 = sync_key_id("my-passphrase");
        assert_eq!(id1, id2);
        assert_ne!(id1, "my-passphrase");
        assert_eq!(id1.len(), 64);
    }

    #[tokio::test]
    async fn worker_round_trips_encrypt_task() {
        let worker = CryptoWorker::spawn();
        let key = derive_key("passphrase");
        let out = worker
            .submit(CryptoTask::Encrypt { key, plaintext: b"data".to_vec() })
            .await
            .unwrap();
        let CryptoOutput::Bytes(ciphertext) = out else { panic!("expected bytes") };
        let decrypted = decrypt(&key, &ciphertext).unwrap();
        assert_eq!(decrypted, b"data");
    }
}
