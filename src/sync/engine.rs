//! Sync orchestration: one GET fetches every shard at once;
//! each pulled shard is decrypted and merged against local state with
//! its own merge rule (`core` vs `logs:YYYY-MM`); one POST pushes every
//! shard back under a single top-level `lastModified`. Push is gated on
//! `initialSyncDone` so a pull-merge is never raced by a concurrent push
//! of a half-merged snapshot.

use super::merge::{self, CoreShard, LogsShard, CORE_SHARD};
use super::protocol::{PushOutcome, SyncBlob, SyncClient};
use crate::config::Config;
use crate::crypto_worker::{derive_key, sync_key_id, CryptoOutput, CryptoTask, CryptoWorker};
use crate::error::{AppError, AppResult};
use crate::models::AppState;
use std::collections::{BTreeSet, HashMap};

pub struct SyncEngine {
    client: SyncClient,
    worker: CryptoWorker,
    key: [u8; 32],
    key_hash: String,
}

#[derive(Debug, Default)]
pub struct SyncReport {
    pub shards_pushed: Vec<String>,
    pub shards_pulled: Vec<String>,
    pub conflicts_resolved: Vec<String>,
}

impl SyncEngine {
    pub fn new(cfg: &Config, worker: CryptoWorker) -> AppResult<Option<Self>> {
        let (Some(client), Some(sync_key)) = (SyncClient::new(cfg)?, cfg.sync_key.clone()) else {
            return Ok(None);
        };
        Ok(Some(SyncEngine {
            client,
            worker,
            key: derive_key(&sync_key),
            key_hash: sync_key_id(&sync_key),
        }))
    }

    /// One full sync pass:
    /// 1. Pull the combined shard map (one request for every shard).
    /// 2. Decrypt and merge each shard against local state: `core` via
    ///    per-id/per-cell LWW, each `logs:YYYY-MM` via whole-shard LWW.
    /// 3. Encrypt the merged state back into a shard map and push it in
    ///    one request. A `409` means the server's clock moved past ours
    ///    mid-flight; pull-merge-retry instead of clobbering it.
    pub async fn sync(&self, state: &mut AppState, cfg: &Config) -> AppResult<SyncReport> {
        let mut report = SyncReport::default();
        self.pull_and_merge(state, &mut report).await?;
        self.push_all(state, cfg, &mut report).await?;
        state.initial_sync_done = true;
        Ok(report)
    }

    async fn pull_and_merge(&self, state: &mut AppState, report: &mut SyncReport) -> AppResult<()> {
        let Some(remote) = self.client.pull(&self.key_hash).await? else {
            return Ok(());
        };
        self.merge_remote_blob(state, remote, report).await
    }

    async fn merge_remote_blob(&self, state: &mut AppState, remote: SyncBlob, report: &mut SyncReport) -> AppResult<()> {
        let remote_ts = remote.last_modified;
        for (shard_name, ciphertext_b64) in remote.shards {
            let local_ts = state.shard_watermarks.get(&shard_name).copied().unwrap_or(0);
            if remote_ts <= local_ts {
                continue;
            }
            report.shards_pulled.push(shard_name.clone());
            let plaintext = self.decrypt_b64(&ciphertext_b64).await?;
            if shard_name == CORE_SHARD {
                let remote_core: CoreShard = serde_json::from_slice(&plaintext)?;
                let local_core = merge::extract_core(state);
                report.conflicts_resolved.push(shard_name.clone());
                let merged = merge::merge_core(local_core, local_ts, remote_core, remote_ts);
                merge::apply_core(state, merged);
            } else if let Some(month) = merge::month_from_shard(&shard_name) {
                let remote_logs: LogsShard = serde_json::from_slice(&plaintext)?;
                let local_logs = merge::extract_logs_shard(state, month);
                report.conflicts_resolved.push(shard_name.clone());
                let (winner, _) = merge::resolve_logs_shard((local_logs, local_ts), (remote_logs, remote_ts));
                merge::apply_logs_shard(state, month, winner);
            }
            state.shard_watermarks.insert(shard_name, remote_ts);
        }
        Ok(())
    }

    /// Shards whose `shard_last_changed` stamp is ahead of their
    /// `shard_watermarks` entry (or that have never been synced at all) —
    /// the set a push actually needs to re-encrypt and upload.
    fn shards_pending_push(&self, state: &AppState) -> BTreeSet<String> {
        merge::shard_names(state)
            .into_iter()
            .filter(|shard| {
                let changed = state.shard_last_changed.get(shard).copied().unwrap_or(0);
                let synced = state.shard_watermarks.get(shard).copied().unwrap_or(-1);
                changed > synced
            })
            .collect()
    }

    /// Encrypts and pushes only the shards that changed since their last
    /// confirmed sync, under one combined `lastModified`. On `409`, merges
    /// the server's blob in and retries once with the bumped clock.
    async fn push_all(&self, state: &mut AppState, cfg: &Config, report: &mut SyncReport) -> AppResult<()> {
        let pending = self.shards_pending_push(state);
        if pending.is_empty() {
            return Ok(());
        }
        let blob = self.build_push_blob(state, &pending).await?;
        match self.client.push(&self.key_hash, &blob, cfg).await? {
            PushOutcome::Accepted => {
                for shard in blob.shards.keys() {
                    state.shard_watermarks.insert(shard.clone(), blob.last_modified);
                    report.shards_pushed.push(shard.clone());
                }
            }
            PushOutcome::NoChange => {}
            PushOutcome::Conflict(server_blob) => {
                self.merge_remote_blob(state, server_blob, report).await?;
                let pending = self.shards_pending_push(state);
                if pending.is_empty() {
                    return Ok(());
                }
                let retry_blob = self.build_push_blob(state, &pending).await?;
                if let PushOutcome::Accepted = self.client.push(&self.key_hash, &retry_blob, cfg).await? {
                    for shard in retry_blob.shards.keys() {
                        state.shard_watermarks.insert(shard.clone(), retry_blob.last_modified);
                        report.shards_pushed.push(shard.clone());
                    }
                }
            }
        }
        Ok(())
    }

    async fn build_push_blob(&self, state: &AppState, pending: &BTreeSet<String>) -> AppResult<SyncBlob> {
        let mut shards = HashMap::new();
        if pending.contains(CORE_SHARD) {
            let core = merge::extract_core(state);
            shards.insert(CORE_SHARD.to_string(), self.encrypt_b64(&serde_json::to_vec(&core)?).await?);
        }
        for shard_name in pending {
            if shard_name == CORE_SHARD {
                continue;
            }
            let Some(month) = merge::month_from_shard(shard_name) else { continue };
            let logs = merge::extract_logs_shard(state, month);
            shards.insert(shard_name.clone(), self.encrypt_b64(&serde_json::to_vec(&logs)?).await?);
        }
        Ok(SyncBlob { last_modified: state.last_modified, shards })
    }

    async fn encrypt_b64(&self, plaintext: &[u8]) -> AppResult<String> {
        use base64::Engine;
        let output = self
            .worker
            .submit(CryptoTask::Encrypt { key: self.key, plaintext: plaintext.to_vec() })
            .await?;
        let CryptoOutput::Bytes(ciphertext) = output else {
            return Err(AppError::Crypto("crypto worker returned unexpected output for encrypt".to_string()));
        };
        Ok(base64::engine::general_purpose::STANDARD.encode(ciphertext))
    }

    async fn decrypt_b64(&self, ciphertext_b64: &str) -> AppResult<Vec<u8>> {
        use base64::Engine;
        let ciphertext = base64::engine::general_purpose::STANDARD
            .decode(ciphertext_b64)
            .map_err(|e| AppError::Crypto(e.to_string()))?;
        let output = self
            .worker
            .submit(CryptoTask::Decrypt { key: self.key, ciphertext })
            .await?;
        let CryptoOutput::Bytes(plaintext) = output else {
            return Err(AppError::Crypto("crypto worker returned unexpected output for decrypt".to_string()));
        };
        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto_worker::CryptoWorker;
    use crate::models::{Habit, HabitSchedule, Frequency, Goal, Time as T};

    async fn spawn_reference_server() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = crate::sync::server::router();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn test_config(sync_url: String) -> Config {
        let mut cfg = Config::default();
        cfg.sync_url = Some(sync_url);
        cfg.sync_key = Some("shared-device-sync-key".to_string());
        cfg
    }

    fn habit_with_name(id: &str, name: &str, created: &str, last_modified: i64) -> Habit {
        Habit {
            id: id.to_string(),
            created_on: crate::models::parse_date(created).unwrap(),
            deleted_on: None,
            deleted_name: None,
            graduated_on: None,
            schedule_history: vec![HabitSchedule {
                start_date: crate::models::parse_date(created).unwrap(),
                end_date: None,
                name: Some(name.to_string()),
                name_key: None,
                icon: "<svg/>".to_string(),
                color: "#111111".to_string(),
                goal: Goal::Check,
                times: [T::Morning].into_iter().collect(),
                frequency: Frequency::Daily,
                schedule_anchor: crate::models::parse_date(created).unwrap(),
            }],
            last_modified,
        }
    }

    /// S3: two devices mutate offline, then both converge through the
    /// real wire protocol.
    #[tokio::test]
    async fn offline_devices_converge_through_the_real_server() {
        let sync_url = spawn_reference_server().await;
        let cfg = test_config(sync_url);

        let mut device_a = AppState::default();
        device_a.habits.push(habit_with_name("h1", "Meditate", "2024-01-01", 1));
        crate::bitlog::set_status(&mut device_a.monthly_logs, "h1", "2024-01-01", T::Morning, crate::models::Status::Done);
        device_a.last_modified = 1000;

        let mut device_b = AppState::default();
        device_b.habits.push(habit_with_name("h2", "Walk", "2024-01-01", 1));
        device_b.last_modified = 1001;

        let engine_a = SyncEngine::new(&cfg, CryptoWorker::spawn()).unwrap().unwrap();
        let engine_b = SyncEngine::new(&cfg, CryptoWorker::spawn()).unwrap().unwrap();

        engine_a.sync(&mut device_a, &cfg).await.unwrap();
        engine_b.sync(&mut device_b, &cfg).await.unwrap();
        engine_a.sync(&mut device_a, &cfg).await.unwrap();

        let ids: std::collections::BTreeSet<_> = device_a.habits.iter().map(|h| h.id.clone()).collect();
        assert!(ids.contains("h1"));
        assert!(ids.contains("h2"));
        assert_eq!(
            crate::bitlog::get_status(&device_a.monthly_logs, &device_a.daily_data, "h1", "2024-01-01", T::Morning),
            crate::models::Status::Done
        );
    }

    /// S4: remote's later `lastModified` wins a conflicting cell.
    #[tokio::test]
    async fn remote_with_later_clock_wins_a_conflicting_habit() {
        let sync_url = spawn_reference_server().await;
        let cfg = test_config(sync_url);
        let engine_a = SyncEngine::new(&cfg, CryptoWorker::spawn()).unwrap().unwrap();
        let engine_b = SyncEngine::new(&cfg, CryptoWorker::spawn()).unwrap().unwrap();

        let mut device_a = AppState::default();
        device_a.habits.push(habit_with_name("h1", "Read", "2024-01-01", 1000));
        device_a.last_modified = 1000;
        engine_a.sync(&mut device_a, &cfg).await.unwrap();

        let mut device_b = device_a.clone();
        device_b.habits[0].schedule_history[0].name = Some("Read Daily".to_string());
        device_b.habits[0].schedule_history[0].start_date = crate::models::parse_date("2024-02-01").unwrap();
        device_b.habits[0].last_modified = 2000;
        device_b.last_modified = 2000;
        engine_b.sync(&mut device_b, &cfg).await.unwrap();

        engine_a.sync(&mut device_a, &cfg).await.unwrap();
        assert_eq!(device_a.habits[0].latest_name(), Some("Read Daily"));
    }
}
