//! Split hot/cold persistence. State lives in an embedded
//! `sled` database under two keys in one tree: a JSON document (habits,
//! `dailyData`, metadata) and a binary document (packed `BitLog` bytes,
//! which churn far more often and would bloat JSON churn-diffing).
//! Archived years are gzip-compressed JSON blobs, written once a year's
//! `dailyData` ages past the configured threshold.
//!
//! Grounded on the embedded-KV pattern in `knhk-lockchain::storage`
//! (tree-per-concern, explicit flush, reopen-on-failure) generalized
//! from a lockchain's append log to a debounced document store.

use crate::bitlog::{self, BitBuffer};
use crate::config::Config;
use crate::crypto_worker::{compress_json, decompress_json};
use crate::error::{AppError, AppResult};
use crate::migrations;
use crate::models::AppState;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const TREE_STATE: &str = "state";
const KEY_JSON: &str = "state.json";
const KEY_BINARY: &str = "state.bin";
const KEY_LEGACY: &str = "state.legacy.json";

pub struct StateStore {
    db: sled::Db,
    last_save: Mutex<Option<Instant>>,
    debounce: Duration,
}

impl StateStore {
    /// Opens (creating if absent) the database at `dir`, retrying with
    /// backoff since a prior process may still be releasing its file
    /// lock.
    pub fn open(cfg: &Config) -> AppResult<Self> {
        std::fs::create_dir_all(&cfg.data_dir)?;
        let db = open_with_retries(&cfg.data_dir.join("db"), 3)?;
        Ok(StateStore {
            db,
            last_save: Mutex::new(None),
            debounce: cfg.save_debounce,
        })
    }

    fn tree(&self) -> AppResult<sled::Tree> {
        Ok(self.db.open_tree(TREE_STATE)?)
    }

    /// `loadState()`: JSON doc -> migrate -> hydrate BitLog bytes from the
    /// binary doc, falling back to the legacy combined key if the split
    /// layout has never been written (first run after an upgrade).
    pub fn load_state(&self) -> AppResult<AppState> {
        let tree = self.tree()?;
        let raw_json = match tree.get(KEY_JSON)? {
            Some(bytes) => bytes.to_vec(),
            None => match tree.get(KEY_LEGACY)? {
                Some(bytes) => bytes.to_vec(),
                None => return Ok(AppState::default()),
            },
        };
        let value: serde_json::Value = serde_json::from_slice(&raw_json)?;
        let logs_raw = tree.get(KEY_BINARY)?;
        let packed: HashMap<String, Vec<u8>> = match logs_raw {
            Some(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            None => HashMap::new(),
        };
        let mut state = migrations::migrate_state(Some(value), crate::models::CURRENT_SCHEMA_VERSION)?;
        state.monthly_logs = bitlog::unpack_binary_logs(packed);
        prune_orphan_daily_data(&mut state);
        Ok(state)
    }

    /// `saveState()`: synchronous, immediate write (the 500ms debounce is
    /// the caller's responsibility via `should_save_now`; this method
    /// always flushes so a forced save — e.g. before exit — is safe).
    /// The JSON doc, binary doc, and legacy-key removal commit as a single
    /// `sled` transaction, so a crash mid-save never leaves the two
    /// documents at different versions.
    pub fn save_state(&self, state: &AppState) -> AppResult<()> {
        let tree = self.tree()?;
        let json_bytes = serde_json::to_vec(state)?;
        let packed = bitlog::pack_binary_logs(&state.monthly_logs);
        let bin_bytes = serde_json::to_vec(&packed)?;
        tree.transaction(|tx| -> Result<(), ConflictableTransactionError<AppError>> {
            tx.insert(KEY_JSON, json_bytes.clone())?;
            tx.insert(KEY_BINARY, bin_bytes.clone())?;
            tx.remove(KEY_LEGACY)?;
            Ok(())
        })
        .map_err(|e| match e {
            TransactionError::Abort(err) => err,
            TransactionError::Storage(se) => AppError::from(se),
        })?;
        self.db.flush()?;
        *self.last_save.lock().unwrap() = Some(Instant::now());
        Ok(())
    }

    /// Debounce gate: callers schedule a save and check this before
    /// actually writing, so a burst of toggles within `save_debounce`
    /// collapses to a single flush.
    pub fn should_save_now(&self) -> bool {
        let guard = self.last_save.lock().unwrap();
        match *guard {
            None => true,
            Some(last) => last.elapsed() >= self.debounce,
        }
    }

    /// `archiveOldData()`: move whole-year `dailyData` entries older than
    /// `archive_days_threshold` into gzip-compressed JSON blobs, keyed by
    /// year, keeping the hot JSON document small.
    pub fn archive_old_data(&self, state: &mut AppState, cfg: &Config, today: chrono::NaiveDate) -> AppResult<()> {
        let cutoff = today - chrono::Duration::days(cfg.archive_days_threshold);
        let mut by_year: HashMap<i32, serde_json::Map<String, serde_json::Value>> = HashMap::new();
        let stale_dates: Vec<String> = state
            .daily_data
            .keys()
            .filter(|d| crate::models::parse_date(d).map(|nd| nd < cutoff).unwrap_or(false))
            .cloned()
            .collect();
        for date in &stale_dates {
            if let Some(year) = date.get(0..4).and_then(|y| y.parse::<i32>().ok()) {
                if let Some(entry) = state.daily_data.remove(date) {
                    let value = serde_json::to_value(&entry).unwrap_or(serde_json::Value::Null);
                    by_year.entry(year).or_default().insert(date.clone(), value);
                }
            }
        }
        for (year, entries) in by_year {
            let mut existing = self.read_archive_year(state, year)?;
            for (k, v) in entries {
                existing.insert(k, v);
            }
            let compressed = compress_json(&serde_json::Value::Object(existing))?;
            state.archives.insert(year, compressed);
        }
        Ok(())
    }

    fn read_archive_year(
        &self,
        state: &AppState,
        year: i32,
    ) -> AppResult<serde_json::Map<String, serde_json::Value>> {
        match state.archives.get(&year) {
            Some(bytes) => {
                let value = decompress_json(bytes)?;
                Ok(value.as_object().cloned().unwrap_or_default())
            }
            None => Ok(serde_json::Map::new()),
        }
    }

    /// `readArchiveYear(year)`: decompress one archived year for display
    /// (e.g. a yearly calendar review), without mutating `state`.
    pub fn read_archive_year_public(
        &self,
        state: &AppState,
        year: i32,
    ) -> AppResult<serde_json::Map<String, serde_json::Value>> {
        self.read_archive_year(state, year)
    }
}

/// Drop `dailyData`/`monthlyLogs` entries referencing a habit id no
/// longer present in `habits`,
/// and any `dailyData` entry left empty after the drop.
fn prune_orphan_daily_data(state: &mut AppState) {
    let live: std::collections::HashSet<&str> = state.habits.iter().map(|h| h.id.as_str()).collect();
    for by_habit in state.daily_data.values_mut() {
        by_habit.retain(|habit_id, _| live.contains(habit_id.as_str()));
    }
    state.daily_data.retain(|_, by_habit| !by_habit.is_empty());
    let live_owned: std::collections::HashSet<String> = live.iter().map(|s| s.to_string()).collect();
    state
        .monthly_logs
        .retain(|key, _| live_owned.iter().any(|id| key.starts_with(&format!("{id}_"))));
}

fn open_with_retries(path: &Path, attempts: u32) -> AppResult<sled::Db> {
    let mut last_err = None;
    for attempt in 0..attempts {
        match sled::open(path) {
            Ok(db) => return Ok(db),
            Err(e) => {
                log::warn!("sled::open attempt {attempt} failed: {e}");
                last_err = Some(e);
                std::thread::sleep(Duration::from_millis(100 * (attempt as u64 + 1)));
            }
        }
    }
    Err(last_err.unwrap().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{bitlog_key, Habit, HabitSchedule, Frequency, Goal, Time as T};

    fn test_config() -> (Config, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Config::default();
        cfg.data_dir = dir.path().to_path_buf();
        (cfg, dir)
    }

    #[test]
    fn round_trips_state_through_store() {
        let (cfg, _dir) = test_config();
        let store = StateStore::open(&cfg).unwrap();
        let mut state = AppState::default();
        state.habits.push(Habit {
            id: "h1".to_string(),
            created_on: crate::models::parse_date("2024-01-01").unwrap(),
            deleted_on: None,
            deleted_name: None,
            graduated_on: None,
            schedule_history: vec![HabitSchedule {
                start_date: crate::models::parse_date("2024-01-01").unwrap(),
                end_date: None,
                name: Some("Read".to_string()),
                name_key: None,
                icon: "i".to_string(),
                color: "#000".to_string(),
                goal: Goal::Check,
                times: [T::Morning].into_iter().collect(),
                frequency: Frequency::Daily,
                schedule_anchor: crate::models::parse_date("2024-01-01").unwrap(),
            }],
            last_modified: 1,
        });
        bitlog::set_status(&mut state.monthly_logs, "h1", "2024-01-05", T::Morning, crate::models::Status::Done);

        store.save_state(&state).unwrap();
        let reloaded = store.load_state().unwrap();
        assert_eq!(reloaded.habits.len(), 1);
        assert!(reloaded.monthly_logs.contains_key(&bitlog_key("h1", "2024-01")));
    }

    #[test]
    fn loading_empty_db_returns_default_state() {
        let (cfg, _dir) = test_config();
        let store = StateStore::open(&cfg).unwrap();
        let state = store.load_state().unwrap();
        assert_eq!(state.habits.len(), 0);
        assert_eq!(state.version, crate::models::CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn orphaned_daily_data_is_pruned_on_load() {
        let (cfg, _dir) = test_config();
        let store = StateStore::open(&cfg).unwrap();
        let mut state = AppState::default();
        let mut by_habit = HashMap::new();
        by_habit.insert("ghost".to_string(), crate::models::HabitDayEntry::default());
        state.daily_data.insert("2024-01-01".to_string(), by_habit);
        store.save_state(&state).unwrap();
        let reloaded = store.load_state().unwrap();
        assert!(reloaded.daily_data.is_empty());
    }

    #[test]
    fn archive_moves_stale_year_into_compressed_blob() {
        let (cfg, _dir) = test_config();
        let store = StateStore::open(&cfg).unwrap();
        let mut state = AppState::default();
        state.habits.push(Habit {
            id: "h1".to_string(),
            created_on: crate::models::parse_date("2020-01-01").unwrap(),
            deleted_on: None,
            deleted_name: None,
            graduated_on: None,
            schedule_history: vec![],
            last_modified: 0,
        });
        let mut by_habit = HashMap::new();
        by_habit.insert("h1".to_string(), crate::models::HabitDayEntry::default());
        state.daily_data.insert("2020-01-01".to_string(), by_habit);

        store
            .archive_old_data(&mut state, &cfg, crate::models::parse_date("2024-01-01").unwrap())
            .unwrap();

        assert!(!state.daily_data.contains_key("2020-01-01"));
        assert!(state.archives.contains_key(&2020));
        let year = store.read_archive_year_public(&state, 2020).unwrap();
        assert!(year.contains_key("2020-01-01"));
    }
}
