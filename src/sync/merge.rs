//! `mergeStates()`: last-writer-wins conflict resolution.
//!
//! The wire shards are exactly two: a single `core` shard (everything
//! except the BitLog, habits, `dailyData`, archives, AI quota, language)
//! and one `logs:YYYY-MM` shard per month of `monthlyLogs`. Merge
//! granularity differs by field: `habits` union by id with a per-habit
//! tiebreak, `dailyData` unions cell-wise, `archives` merge year-by-year,
//! but `monthlyLogs` is deliberately *not* bit-merged. The shard with
//! the greater watermark wins wholesale, because mixing two devices'
//! bits at sub-month granularity risks resurrecting a status the user
//! deleted.

use crate::models::{AppState, Archives, DateKey, Habit, HabitId};
use std::collections::{BTreeMap, BTreeSet, HashMap};

pub const CORE_SHARD: &str = "core";

pub fn logs_shard_name(month: &str) -> String {
    format!("logs:{month}")
}

pub fn month_from_shard(shard: &str) -> Option<&str> {
    shard.strip_prefix("logs:")
}

/// Every shard name touched by `state` (always includes `core`).
pub fn shard_names(state: &AppState) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    names.insert(CORE_SHARD.to_string());
    for key in state.monthly_logs.keys() {
        if let Some(month) = key.split('_').nth(1) {
            names.insert(logs_shard_name(month));
        }
    }
    names
}

/// The `core` shard: "structured state minus logs" — habits, the `dailyData` overlay, archives, and metadata.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreShard {
    pub habits: Vec<Habit>,
    pub daily_data: BTreeMap<DateKey, HashMap<HabitId, crate::models::HabitDayEntry>>,
    pub archives: Archives,
    pub ai_quota: crate::models::AiQuota,
    pub language: String,
    pub onboarding_complete: bool,
}

pub fn extract_core(state: &AppState) -> CoreShard {
    CoreShard {
        habits: state.habits.clone(),
        daily_data: state.daily_data.clone(),
        archives: state.archives.clone(),
        ai_quota: state.ai_quota.clone(),
        language: state.language.clone(),
        onboarding_complete: state.onboarding_complete,
    }
}

pub fn apply_core(state: &mut AppState, core: CoreShard) {
    state.habits = core.habits;
    state.daily_data = core.daily_data;
    state.archives = core.archives;
    state.ai_quota = core.ai_quota;
    state.language = core.language;
    state.onboarding_complete = core.onboarding_complete;
}

/// A single `logs:YYYY-MM` shard: only that month's packed `BitLog`
/// entries, hex-encoded for the wire" — `dailyData` is not
/// part of this shard, it lives in `core`).
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogsShard {
    pub monthly_logs_hex: Vec<(String, String)>,
}

pub fn extract_logs_shard(state: &AppState, month: &str) -> LogsShard {
    let monthly_logs: HashMap<String, crate::bitlog::BitBuffer> = state
        .monthly_logs
        .iter()
        .filter(|(key, _)| key.split('_').nth(1) == Some(month))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    LogsShard {
        monthly_logs_hex: crate::bitlog::serialize_logs_for_cloud(&monthly_logs),
    }
}

pub fn apply_logs_shard(state: &mut AppState, month: &str, shard: LogsShard) {
    state
        .monthly_logs
        .retain(|key, _| key.split('_').nth(1) != Some(month));
    for (k, buf) in crate::bitlog::deserialize_logs_from_cloud(shard.monthly_logs_hex) {
        state.monthly_logs.insert(k, buf);
    }
}

/// `monthlyLogs` shard resolution: whichever side's watermark is
/// strictly greater wins wholesale; a draw keeps the copy already on
/// disk rather than thrashing.
pub fn resolve_logs_shard(local: (LogsShard, i64), remote: (LogsShard, i64)) -> (LogsShard, i64) {
    let (local_val, local_ts) = local;
    let (remote_val, remote_ts) = remote;
    if remote_ts > local_ts {
        (remote_val, remote_ts)
    } else {
        (local_val, local_ts)
    }
}

/// `habits`: union by id. Conflicting pairs keep the one whose most
/// recent schedule entry has the greater `startDate` (falling back to
/// `lastModified` when neither has an open schedule to compare, e.g.
/// two tombstones); a tombstone always wins over a live habit with an
/// equal-or-older timestamp.
fn merge_habit_pair(local: Habit, remote: Habit) -> (Habit, bool) {
    let local_tombstone = local.is_tombstone();
    let remote_tombstone = remote.is_tombstone();
    if local_tombstone != remote_tombstone {
        let (tomb, live) = if local_tombstone { (&local, &remote) } else { (&remote, &local) };
        if live.last_modified > tomb.last_modified {
            let remote_won = std::ptr::eq(live, &remote);
            return (live.clone(), remote_won);
        }
        let remote_won = std::ptr::eq(tomb, &remote);
        return (tomb.clone(), remote_won);
    }
    let local_anchor = local.schedule_history.last().map(|s| s.start_date);
    let remote_anchor = remote.schedule_history.last().map(|s| s.start_date);
    match (local_anchor, remote_anchor) {
        (Some(l), Some(r)) if l != r => {
            if r > l {
                (remote, true)
            } else {
                (local, false)
            }
        }
        _ => {
            if remote.last_modified > local.last_modified {
                (remote, true)
            } else {
                (local, false)
            }
        }
    }
}

/// Returns the merged habit list plus the set of ids whose winning
/// record came from `remote`, so `dailyData` cell conflicts for that
/// habit resolve the same way.
fn merge_habits(local: Vec<Habit>, remote: Vec<Habit>) -> (Vec<Habit>, std::collections::HashSet<HabitId>) {
    let mut by_id: BTreeMap<HabitId, Habit> = BTreeMap::new();
    let mut remote_won: std::collections::HashSet<HabitId> = std::collections::HashSet::new();
    for h in local {
        by_id.insert(h.id.clone(), h);
    }
    for h in remote {
        match by_id.remove(&h.id) {
            Some(existing) => {
                let (winner, is_remote) = merge_habit_pair(existing, h);
                if is_remote {
                    remote_won.insert(winner.id.clone());
                }
                by_id.insert(winner.id.clone(), winner);
            }
            None => {
                remote_won.insert(h.id.clone());
                by_id.insert(h.id.clone(), h);
            }
        }
    }
    (by_id.into_values().collect(), remote_won)
}

/// `dailyData`: union by `(date, habitId, time)`. There is no
/// per-instance clock in the data model, so a conflicting cell's winner
/// is decided by the clock of the habit that owns it, the best
/// available proxy for "the writer with the higher lastModified" given
/// the state model only timestamps habits, not individual instances.
/// See `merge_daily_data_by_habit_winner`.
fn merge_day_entry(
    local: crate::models::HabitDayEntry,
    remote: crate::models::HabitDayEntry,
    prefer_remote: bool,
) -> crate::models::HabitDayEntry {
    let mut out = if prefer_remote { remote.clone() } else { local.clone() };
    out.daily_schedule = match (local.daily_schedule, remote.daily_schedule) {
        (Some(l), Some(r)) => Some(if prefer_remote { r } else { l }),
        (Some(l), None) => Some(l),
        (None, Some(r)) => Some(r),
        (None, None) => None,
    };
    let mut instances = local.instances;
    for (time, remote_inst) in remote.instances {
        match instances.remove(&time) {
            Some(local_inst) => {
                instances.insert(time, if prefer_remote { remote_inst } else { local_inst });
            }
            None => {
                instances.insert(time, remote_inst);
            }
        }
    }
    out.instances = instances;
    out
}

/// `archives`: year-by-year, later wins. There is no per-year clock on
/// `Archives` itself, so this is arbitrated by the same `lastModified`
/// comparison used to pick the winning `core` shard as a whole — an
/// entire year's archive is an atomic compressed blob, so there is no
/// finer grain to merge at.
fn merge_archives(local: Archives, remote: Archives, remote_wins: bool) -> Archives {
    let mut merged = local;
    for (year, blob) in remote {
        if remote_wins || !merged.contains_key(&year) {
            merged.insert(year, blob);
        }
    }
    merged
}

/// `mergeStates(local, remote)` restricted to the `core` shard's fields
///: habits union by id, `dailyData` union cell-wise,
/// `archives` year-by-year, scalar metadata last-writer-wins by the
/// shard-level clock passed in by the caller.
pub fn merge_core(local: CoreShard, local_ts: i64, remote: CoreShard, remote_ts: i64) -> CoreShard {
    let remote_wins_scalars = remote_ts > local_ts;
    let (merged_habits, remote_won_habits) = merge_habits(local.habits, remote.habits);
    // A cell's winner is the side whose copy of the owning habit survived
    // the union above; if the habit itself came from local, local's
    // instance data for it wins too, and vice versa — this keeps cell
    // resolution consistent with the habit-level decision already made.
    let daily_data =
        merge_daily_data_by_habit_winner(local.daily_data, remote.daily_data, &remote_won_habits);

    CoreShard {
        habits: merged_habits,
        daily_data,
        archives: merge_archives(local.archives, remote.archives, remote_wins_scalars),
        ai_quota: if remote_wins_scalars { remote.ai_quota } else { local.ai_quota },
        language: if remote_wins_scalars { remote.language } else { local.language },
        onboarding_complete: if remote_wins_scalars {
            remote.onboarding_complete
        } else {
            local.onboarding_complete
        },
    }
}

/// Resolves `dailyData` cell conflicts using, for each habit, whichever
/// side (local or remote) the habit-union above declared the winner for
/// that habit id — keeps cell resolution consistent with the
/// already-made habit-level decision instead of re-arbitrating blind.
fn merge_daily_data_by_habit_winner(
    local: BTreeMap<DateKey, HashMap<HabitId, crate::models::HabitDayEntry>>,
    remote: BTreeMap<DateKey, HashMap<HabitId, crate::models::HabitDayEntry>>,
    remote_won: &std::collections::HashSet<HabitId>,
) -> BTreeMap<DateKey, HashMap<HabitId, crate::models::HabitDayEntry>> {
    let mut merged = local;
    for (date, remote_by_habit) in remote {
        let local_by_habit = merged.entry(date).or_default();
        for (habit_id, remote_entry) in remote_by_habit {
            match local_by_habit.remove(&habit_id) {
                Some(local_entry) => {
                    let prefer_remote = remote_won.contains(&habit_id);
                    let merged_entry = merge_day_entry(local_entry, remote_entry, prefer_remote);
                    local_by_habit.insert(habit_id, merged_entry);
                }
                None => {
                    local_by_habit.insert(habit_id, remote_entry);
                }
            }
        }
    }
    merged.retain(|_, by_habit| !by_habit.is_empty());
    merged
}
