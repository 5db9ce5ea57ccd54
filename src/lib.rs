//! `askesis_core`: durable-state engine for an offline-first habit
//! tracker. Owns the bitmask habit log, schema migration, split
//! persistence, and end-to-end-encrypted multi-device sync; exposes a
//! single `Engine` entry point that a CLI or future UI drives.

pub mod actions;
pub mod bitlog;
pub mod config;
pub mod crypto_worker;
pub mod error;
pub mod migrations;
pub mod models;
pub mod selectors;
pub mod storage;
pub mod sync;

use crate::actions::ActionContext;
use crate::config::Config;
use crate::crypto_worker::CryptoWorker;
use crate::error::AppResult;
use crate::storage::StateStore;
use crate::sync::SyncEngine;
use std::sync::Arc;

/// Wires config, storage, the crypto worker, the sync engine, and the
/// action layer into one handle. This is the only type a host binary
/// needs to hold.
pub struct Engine {
    pub actions: Arc<ActionContext>,
    pub config: Config,
    pub crypto: CryptoWorker,
    pub sync: Option<SyncEngine>,
}

impl Engine {
    /// Boots the engine: opens the local store, migrates/loads state,
    /// and starts the crypto worker. Does not perform a sync pull —
    /// call `Engine::sync()` once a tokio runtime is driving it, which
    /// also clears the boot lock on success.
    pub fn open(config: Config) -> AppResult<Self> {
        let store = StateStore::open(&config)?;
        let state = store.load_state()?;
        let sync_configured = config.sync_url.is_some() && config.sync_key.is_some();
        let crypto = CryptoWorker::spawn();
        let sync = SyncEngine::new(&config, crypto.clone())?;
        let actions = Arc::new(ActionContext::new(store, state, sync_configured, crypto.clone()));
        Ok(Engine { actions, config, crypto, sync })
    }

    /// Runs one full sync pass, updating `initial_sync_done` on the
    /// in-memory state once it completes so the boot lock releases.
    pub async fn sync(&self) -> AppResult<sync::SyncReport> {
        let Some(engine) = &self.sync else {
            return Ok(sync::SyncReport::default());
        };
        let mut state = self.actions.snapshot();
        let report = engine.sync(&mut state, &self.config).await?;
        self.actions.replace_after_sync(state)?;
        Ok(report)
    }
}
