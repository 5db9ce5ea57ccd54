//! Business-logic mutation layer. Every state-changing
//! operation in the crate funnels through `ActionContext`: single
//! in-flight mutation at a time, a boot lock that no-ops writes until
//! the first sync pull lands, and a monotone logical clock stamped onto
//! every touched habit/state so `sync::merge` can arbitrate later.
//!
//! Follows an "one mutation in flight, queue/reject the rest"
//! discipline, adapted from an actor mailbox to a synchronous
//! mutex-guarded action dispatcher since this crate's state mutations
//! are themselves synchronous (only sync/crypto are async).

use crate::bitlog;
use crate::crypto_worker::{CryptoOutput, CryptoTask, CryptoWorker};
use crate::error::{AppError, AppResult};
use crate::models::{
    today_key, AppState, DateKey, Frequency, Goal, Habit, HabitId, HabitSchedule, Status, Time,
};
use crate::selectors::{self, SelectorCaches};
use crate::storage::StateStore;
use crate::sync::merge;
use chrono::NaiveDate;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, TryLockError};

/// Observers the host (CLI, future UI) registers to learn about state
/// changes without polling. All methods are infallible and must not
/// block — notification is fire-and-forget.
pub trait ChangeNotifier: Send + Sync {
    fn notify_state_changed(&self) {}
    fn notify_celebration(&self, _celebration: &Celebration) {}
}

/// Default notifier for headless/test use: observes nothing.
pub struct NullNotifier;
impl ChangeNotifier for NullNotifier {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Celebration {
    pub habit_id: HabitId,
    pub date: DateKey,
    pub message: String,
}

/// Owns the single in-memory `AppState`, the persistence handle, the
/// selector caches, and the mutation lock. One `ActionContext` per
/// running process.
pub struct ActionContext {
    state: Mutex<AppState>,
    store: StateStore,
    caches: Mutex<SelectorCaches>,
    notifier: Arc<dyn ChangeNotifier>,
    in_flight: Mutex<()>,
    clock: AtomicI64,
    celebrations: Mutex<Vec<Celebration>>,
    sync_configured: bool,
    crypto: CryptoWorker,
}

impl ActionContext {
    pub fn new(store: StateStore, initial: AppState, sync_configured: bool, crypto: CryptoWorker) -> Self {
        let clock_start = initial.last_modified;
        ActionContext {
            state: Mutex::new(initial),
            store,
            caches: Mutex::new(SelectorCaches::default()),
            notifier: Arc::new(NullNotifier),
            in_flight: Mutex::new(()),
            clock: AtomicI64::new(clock_start),
            celebrations: Mutex::new(Vec::new()),
            sync_configured,
            crypto,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn ChangeNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    fn tick(&self) -> i64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Acquires the single-flight lock or rejects immediately: a "one
    /// command in flight" guard so two racing UI calls never interleave
    /// mutations of the same state.
    fn begin(&self) -> AppResult<std::sync::MutexGuard<'_, ()>> {
        match self.in_flight.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::WouldBlock) => {
                Err(AppError::Validation("an action is already in flight".to_string()))
            }
            Err(TryLockError::Poisoned(_)) => {
                Err(AppError::Validation("action lock poisoned by a prior panic".to_string()))
            }
        }
    }

    /// The boot lock: once sync is configured, every
    /// mutating action is a no-op until the first sync pull completes,
    /// so a second device never overwrites not-yet-pulled remote edits.
    fn check_boot_lock(&self, state: &AppState) -> AppResult<()> {
        if self.sync_configured && !state.initial_sync_done {
            return Err(AppError::Validation(
                "writes are locked until the initial sync completes".to_string(),
            ));
        }
        Ok(())
    }

    fn persist(&self, state: &AppState) -> AppResult<()> {
        if self.store.should_save_now() {
            self.store.save_state(state)?;
        }
        Ok(())
    }

    fn mutate<F, R>(&self, f: F) -> AppResult<R>
    where
        F: FnOnce(&mut AppState, i64) -> AppResult<R>,
    {
        let _lock = self.begin()?;
        let mut state = self.state.lock().unwrap();
        self.check_boot_lock(&state)?;
        let clock = self.tick();
        let result = f(&mut state, clock)?;
        state.last_modified = clock;
        state.shard_last_changed.insert(merge::CORE_SHARD.to_string(), clock);
        self.persist(&state)?;
        self.notifier.notify_state_changed();
        Ok(result)
    }

    pub fn snapshot(&self) -> AppState {
        self.state.lock().unwrap().clone()
    }

    pub fn flush(&self) -> AppResult<()> {
        let state = self.state.lock().unwrap();
        self.store.save_state(&state)
    }

    /// Installs the state produced by a completed sync pass. Bypasses
    /// the boot lock deliberately: this call is what releases it.
    pub fn replace_after_sync(&self, state: AppState) -> AppResult<()> {
        let _lock = self.begin()?;
        {
            let mut guard = self.state.lock().unwrap();
            *guard = state;
            self.store.save_state(&guard)?;
        }
        self.caches.lock().unwrap().clear_all();
        self.notifier.notify_state_changed();
        Ok(())
    }

    // -- selectors, exposed read-only through the same lock --

    pub fn day_summary(&self, date: &str) -> selectors::DaySummary {
        let state = self.state.lock().unwrap();
        let mut caches = self.caches.lock().unwrap();
        selectors::calculate_day_summary_cached(&mut caches, &state, date)
    }

    pub fn streak(&self, habit_id: &str, on: NaiveDate) -> AppResult<u32> {
        let state = self.state.lock().unwrap();
        let habit = state.habit(habit_id).ok_or(AppError::NotFound)?;
        Ok(selectors::calculate_habit_streak(&state, habit, on))
    }

    // -- actions --

    /// `toggleHabitStatus`: cycles NULL -> DONE -> DEFERRED -> NULL.
    /// `DONE_PLUS` is reached only through `setGoalOverride` exceeding a
    /// habit's goal total; a single tap never produces it.
    pub fn toggle_habit_status(&self, habit_id: &str, date: &str, time: Time) -> AppResult<()> {
        let habit_id = habit_id.to_string();
        let date = date.to_string();
        let celebration = self.mutate(|state, clock| {
            state.habit(&habit_id).ok_or(AppError::NotFound)?;
            let current = bitlog::get_status(&state.monthly_logs, &state.daily_data, &habit_id, &date, time);
            let next = match current {
                Status::Null => Status::Done,
                Status::Done => Status::Deferred,
                Status::DonePlus | Status::Deferred => Status::Null,
            };
            bitlog::set_status(&mut state.monthly_logs, &habit_id, &date, time, next);
            touch_month_shard(state, &date, clock);
            if let Some(h) = state.habit_mut(&habit_id) {
                h.last_modified = clock;
            }
            let celebration = next.is_complete().then(|| build_celebration(state, &habit_id, &date)).flatten();
            Ok(celebration)
        })?;
        if let Some(c) = celebration {
            self.push_celebration(c);
        }
        Ok(())
    }

    /// `setDeferred`: explicit snooze action.
    pub fn set_deferred(&self, habit_id: &str, date: &str, time: Time) -> AppResult<()> {
        let habit_id = habit_id.to_string();
        let date = date.to_string();
        self.mutate(|state, clock| {
            state.habit(&habit_id).ok_or(AppError::NotFound)?;
            bitlog::set_status(&mut state.monthly_logs, &habit_id, &date, time, Status::Deferred);
            touch_month_shard(state, &date, clock);
            if let Some(h) = state.habit_mut(&habit_id) {
                h.last_modified = clock;
            }
            Ok(())
        })
    }

    /// `markAllHabitsForDate`: marks every scheduled time of every
    /// active habit DONE for `date`.
    pub fn mark_all_habits_for_date(&self, date: &str) -> AppResult<()> {
        let date = date.to_string();
        self.mutate(|state, clock| {
            let habit_ids: Vec<HabitId> = state.active_habits().map(|h| h.id.clone()).collect();
            for habit_id in habit_ids {
                let Some(habit) = state.habit(&habit_id) else { continue };
                let Some(d) = crate::models::parse_date(&date) else { continue };
                if !selectors::should_habit_appear_on_date(habit, d) {
                    continue;
                }
                let times = selectors::get_effective_schedule_for_habit_on_date(state, habit, &date);
                for t in times {
                    bitlog::set_status(&mut state.monthly_logs, &habit_id, &date, t, Status::Done);
                }
                touch_month_shard(state, &date, clock);
                if let Some(h) = state.habit_mut(&habit_id) {
                    h.last_modified = clock;
                }
            }
            Ok(())
        })?;
        let mut caches = self.caches.lock().unwrap();
        caches.invalidate_for_date(&date);
        Ok(())
    }

    /// `setGoalOverride`: per-(habit, date, time) goal override, e.g. "do
    /// 10 pages today instead of the usual 5". `DONE_PLUS` is this
    /// crate's only route to that status: if the override exceeds the
    /// schedule's numeric goal total and the instance is already marked
    /// `DONE`, it is promoted to `DONE_PLUS`; it is demoted back to
    /// `DONE` if a later override no longer exceeds the total. A `check`
    /// goal has no total to exceed, so it is left untouched.
    pub fn set_goal_override(&self, habit_id: &str, date: &str, time: Time, goal_override: Option<u32>) -> AppResult<()> {
        let habit_id = habit_id.to_string();
        let date = date.to_string();
        self.mutate(|state, clock| {
            let habit = state.habit(&habit_id).ok_or(AppError::NotFound)?;
            let goal_total = crate::models::parse_date(&date)
                .and_then(|d| selectors::get_schedule_for_date(habit, d))
                .and_then(|s| match &s.goal {
                    Goal::Check => None,
                    Goal::Pages { total, .. } | Goal::Minutes { total, .. } => Some(*total),
                });

            let entry = state
                .daily_data
                .entry(date.clone())
                .or_default()
                .entry(habit_id.clone())
                .or_default();
            let inst = entry.instances.entry(time).or_default();
            inst.goal_override = goal_override;

            if let Some(total) = goal_total {
                let current = bitlog::get_status(&state.monthly_logs, &state.daily_data, &habit_id, &date, time);
                let exceeded = goal_override.map(|v| v > total).unwrap_or(false);
                let next = match (current, exceeded) {
                    (Status::Done, true) => Some(Status::DonePlus),
                    (Status::DonePlus, false) => Some(Status::Done),
                    _ => None,
                };
                if let Some(next) = next {
                    bitlog::set_status(&mut state.monthly_logs, &habit_id, &date, time, next);
                }
            }
            touch_month_shard(state, &date, clock);

            if let Some(h) = state.habit_mut(&habit_id) {
                h.last_modified = clock;
            }
            Ok(())
        })
    }

    /// `handleHabitDrop`: moves one scheduled time to another within the
    /// same day via a per-day schedule override, without touching the
    /// habit's permanent `scheduleHistory`.
    pub fn handle_habit_drop(&self, habit_id: &str, date: &str, from: Time, to: Time) -> AppResult<()> {
        let habit_id = habit_id.to_string();
        let date = date.to_string();
        self.mutate(|state, clock| {
            let habit = state.habit(&habit_id).ok_or(AppError::NotFound)?;
            let mut times = selectors::get_effective_schedule_for_habit_on_date(state, habit, &date)
                .into_iter()
                .collect::<std::collections::BTreeSet<_>>();
            times.remove(&from);
            times.insert(to);
            let status = bitlog::get_status(&state.monthly_logs, &state.daily_data, &habit_id, &date, from);
            bitlog::set_status(&mut state.monthly_logs, &habit_id, &date, from, Status::Null);
            bitlog::set_status(&mut state.monthly_logs, &habit_id, &date, to, status);
            touch_month_shard(state, &date, clock);
            state
                .daily_data
                .entry(date.clone())
                .or_default()
                .entry(habit_id.clone())
                .or_default()
                .daily_schedule = Some(times);
            if let Some(h) = state.habit_mut(&habit_id) {
                h.last_modified = clock;
            }
            Ok(())
        })
    }

    /// `reorderHabit`: repositions a habit within the display order.
    pub fn reorder_habit(&self, habit_id: &str, new_index: usize) -> AppResult<()> {
        let habit_id = habit_id.to_string();
        self.mutate(|state, _clock| {
            let current_index = state
                .habits
                .iter()
                .position(|h| h.id == habit_id)
                .ok_or(AppError::NotFound)?;
            let habit = state.habits.remove(current_index);
            let clamped = new_index.min(state.habits.len());
            state.habits.insert(clamped, habit);
            Ok(())
        })?;
        self.caches.lock().unwrap().clear_all();
        Ok(())
    }

    /// `saveHabitFromModal`: create a new habit, or close the current
    /// open schedule entry and append a new one effective `effective_date`.
    pub fn save_habit_from_modal(
        &self,
        habit_id: Option<&str>,
        effective_date: NaiveDate,
        schedule: HabitSchedule,
    ) -> AppResult<HabitId> {
        if let Some(name) = schedule.display_name() {
            let duplicate = {
                let state = self.state.lock().unwrap();
                selectors::is_habit_name_duplicate(&state, name, habit_id)
            };
            if duplicate {
                return Err(AppError::Validation(format!("a habit named \"{name}\" already exists")));
            }
        }

        let resolved_id = habit_id.map(|s| s.to_string());
        let mut new_id = resolved_id.clone();
        self.mutate(|state, clock| {
            match &resolved_id {
                Some(id) => {
                    if let Some(existing) = try_resurrect(state, id, effective_date, clock) {
                        new_id = Some(existing);
                        return Ok(());
                    }
                    let habit = state.habit_mut(id).ok_or(AppError::NotFound)?;
                    request_future_schedule_change(habit, effective_date, schedule.clone());
                    habit.graduated_on = None;
                    habit.last_modified = clock;
                }
                None => {
                    if let Some(resurrected_name) = schedule.display_name() {
                        if let Some(existing_id) = find_resurrection_candidate(state, resurrected_name) {
                            resurrect(state, &existing_id, effective_date, clock, schedule.clone());
                            new_id = Some(existing_id);
                            return Ok(());
                        }
                    }
                    let id = uuid::Uuid::new_v4().to_string();
                    let mut first = schedule.clone();
                    first.start_date = effective_date;
                    state.habits.push(Habit {
                        id: id.clone(),
                        created_on: effective_date,
                        deleted_on: None,
                        deleted_name: None,
                        graduated_on: None,
                        schedule_history: vec![first],
                        last_modified: clock,
                    });
                    new_id = Some(id);
                }
            }
            Ok(())
        })?;
        self.caches.lock().unwrap().clear_all();
        new_id.ok_or(AppError::Validation("habit was not created".to_string()))
    }

    /// `requestHabitEndingFromModal`: closes the habit's currently open
    /// schedule entry at `end_date` without tombstoning the habit (a
    /// habit with a closed schedule and no newer entry simply stops
    /// appearing, per `shouldHabitAppearOnDate`).
    pub fn request_habit_ending_from_modal(&self, habit_id: &str, end_date: NaiveDate) -> AppResult<()> {
        let habit_id = habit_id.to_string();
        self.mutate(|state, clock| {
            let habit = state.habit_mut(&habit_id).ok_or(AppError::NotFound)?;
            let open = habit.current_schedule_mut().ok_or_else(|| {
                AppError::Validation("habit has no open schedule entry to end".to_string())
            })?;
            open.end_date = Some(end_date);
            habit.last_modified = clock;
            Ok(())
        })?;
        self.caches.lock().unwrap().clear_all();
        Ok(())
    }

    /// `requestHabitPermanentDeletion`: full tombstone. Clears
    /// `scheduleHistory`, drops every live `BitLog` entry and `dailyData`
    /// record for the habit, then offloads a prune-habit task to the
    /// crypto worker so the habit's entries are stripped out of every
    /// archived year's compressed blob too — otherwise a "permanently"
    /// deleted habit's history would still be recoverable from
    /// `state.archives`.
    pub async fn request_habit_permanent_deletion(&self, habit_id: &str) -> AppResult<()> {
        let habit_id = habit_id.to_string();
        self.mutate(|state, clock| {
            let habit = state.habit_mut(&habit_id).ok_or(AppError::NotFound)?;
            let name = habit.latest_name().map(|s| s.to_string());
            habit.deleted_name = name;
            habit.deleted_on = Some(today_key_date());
            habit.schedule_history.clear();
            habit.last_modified = clock;

            bitlog::prune_logs_for_habit(&mut state.monthly_logs, &habit_id);
            for by_habit in state.daily_data.values_mut() {
                by_habit.remove(&habit_id);
            }
            state.daily_data.retain(|_, by_habit| !by_habit.is_empty());
            Ok(())
        })?;
        self.caches.lock().unwrap().clear_all();

        let archives_snapshot = self.state.lock().unwrap().archives.clone();
        if !archives_snapshot.is_empty() {
            let output = self
                .crypto
                .submit(CryptoTask::PruneHabit { habit_id: habit_id.clone(), archives: archives_snapshot })
                .await?;
            if let CryptoOutput::PrunedArchives(updated) = output {
                if !updated.is_empty() {
                    let _lock = self.begin()?;
                    let mut state = self.state.lock().unwrap();
                    for (year, bytes) in updated {
                        if bytes.is_empty() {
                            state.archives.remove(&year);
                        } else {
                            state.archives.insert(year, bytes);
                        }
                    }
                    let clock = self.tick();
                    state.last_modified = clock;
                    state.shard_last_changed.insert(merge::CORE_SHARD.to_string(), clock);
                    self.store.save_state(&state)?;
                }
            }
        }
        Ok(())
    }

    /// `requestHabitTimeRemoval`: drops a single time slot from a day's
    /// effective schedule without touching the permanent schedule.
    pub fn request_habit_time_removal(&self, habit_id: &str, date: &str, time: Time) -> AppResult<()> {
        let habit_id = habit_id.to_string();
        let date = date.to_string();
        self.mutate(|state, clock| {
            let habit = state.habit(&habit_id).ok_or(AppError::NotFound)?;
            let mut times = selectors::get_effective_schedule_for_habit_on_date(state, habit, &date)
                .into_iter()
                .collect::<std::collections::BTreeSet<_>>();
            times.remove(&time);
            bitlog::set_status(&mut state.monthly_logs, &habit_id, &date, time, Status::Null);
            touch_month_shard(state, &date, clock);
            state
                .daily_data
                .entry(date.clone())
                .or_default()
                .entry(habit_id.clone())
                .or_default()
                .daily_schedule = Some(times);
            if let Some(h) = state.habit_mut(&habit_id) {
                h.last_modified = clock;
            }
            Ok(())
        })
    }

    /// `graduateHabit`: marks a habit as "mastered" from `date` onward;
    /// it stops appearing in the active checklist but its history is
    /// preserved (distinct from permanent deletion).
    pub fn graduate_habit(&self, habit_id: &str, date: NaiveDate) -> AppResult<()> {
        let habit_id = habit_id.to_string();
        self.mutate(|state, clock| {
            let habit = state.habit_mut(&habit_id).ok_or(AppError::NotFound)?;
            habit.graduated_on = Some(date);
            habit.last_modified = clock;
            Ok(())
        })?;
        self.caches.lock().unwrap().clear_all();
        Ok(())
    }

    /// `resetApplicationData`: wipes all local state back to a fresh
    /// install (does not touch the remote sync copy).
    pub fn reset_application_data(&self) -> AppResult<()> {
        self.mutate(|state, clock| {
            *state = AppState::default();
            state.last_modified = clock;
            touch_all_shards(state, clock);
            Ok(())
        })?;
        self.caches.lock().unwrap().clear_all();
        Ok(())
    }

    /// `exportData`: the structured state (`monthlyLogs` serializes as an
    /// empty map) plus a `monthlyLogsSerialized` array of
    /// `[key, hexString]` pairs carrying the actual `BitLog` content.
    pub fn export_data(&self) -> AppResult<Vec<u8>> {
        let state = self.state.lock().unwrap();
        let mut value = serde_json::to_value(&*state)?;
        let logs = bitlog::serialize_logs_for_cloud(&state.monthly_logs);
        value["monthlyLogsSerialized"] = serde_json::to_value(logs)?;
        Ok(serde_json::to_vec_pretty(&value)?)
    }

    /// `importData`: replaces local state wholesale with a migrated
    /// parse of `bytes`, produced by `exportData` (possibly from an
    /// older schema version). Re-inflates `monthlyLogsSerialized` into
    /// the `monthlyLogs` shape migrations expect before hydrating.
    pub fn import_data(&self, bytes: &[u8]) -> AppResult<()> {
        let mut value: serde_json::Value = serde_json::from_slice(bytes)?;
        if let Some(obj) = value.as_object_mut() {
            if let Some(serialized) = obj.remove("monthlyLogsSerialized") {
                if let Ok(pairs) = serde_json::from_value::<Vec<(String, String)>>(serialized) {
                    let logs_obj: serde_json::Map<String, serde_json::Value> = pairs
                        .into_iter()
                        .map(|(k, hex_str)| (k, serde_json::Value::String(hex_str)))
                        .collect();
                    obj.insert("monthlyLogs".to_string(), serde_json::Value::Object(logs_obj));
                }
            }
        }
        self.mutate(|state, clock| {
            let mut imported = crate::migrations::migrate_state(Some(value), crate::models::CURRENT_SCHEMA_VERSION)?;
            for habit in &mut imported.habits {
                for schedule in &mut habit.schedule_history {
                    schedule.sanitize_untrusted_fields();
                }
            }
            imported.last_modified = clock;
            *state = imported;
            touch_all_shards(state, clock);
            Ok(())
        })?;
        self.caches.lock().unwrap().clear_all();
        Ok(())
    }

    /// `handleDayTransition`: called once when the wall-clock date
    /// advances while the process stays resident, clearing every
    /// day-scoped cache so tomorrow's checklist isn't served from
    /// yesterday's memo.
    pub fn handle_day_transition(&self, new_today: &str) -> AppResult<()> {
        self.caches.lock().unwrap().clear_all();
        let _ = new_today;
        Ok(())
    }

    /// `consumeAndFormatCelebrations`: drains the celebration queue
    /// accumulated by completed-habit mutations, notifying the host as
    /// it does.
    pub fn consume_and_format_celebrations(&self) -> Vec<String> {
        let mut queue = self.celebrations.lock().unwrap();
        queue
            .drain(..)
            .map(|c| {
                self.notifier.notify_celebration(&c);
                c.message
            })
            .collect()
    }

    fn push_celebration(&self, celebration: Celebration) {
        self.celebrations.lock().unwrap().push(celebration);
    }
}

/// Marks the `logs:YYYY-MM` shard covering `date` as changed at `clock`,
/// so the next sync push's delta computation picks it up.
fn touch_month_shard(state: &mut AppState, date: &str, clock: i64) {
    let shard = merge::logs_shard_name(crate::models::month_of(date));
    state.shard_last_changed.insert(shard, clock);
}

/// Marks every shard the state currently touches as changed at `clock`,
/// used after a wholesale state replacement (reset, import) where every
/// shard must be treated as dirty.
fn touch_all_shards(state: &mut AppState, clock: i64) {
    let shards: Vec<String> = merge::shard_names(state).into_iter().collect();
    for shard in shards {
        state.shard_last_changed.insert(shard, clock);
    }
}

/// Builds the celebration message for a just-completed habit, if any.
/// `Goal::Check` habits celebrate on every DONE; numeric goals celebrate
/// the same way here since per-instance progress tracking toward a
/// numeric total is out of scope.
fn build_celebration(state: &AppState, habit_id: &str, date: &str) -> Option<Celebration> {
    let habit = state.habits.iter().find(|h| h.id == habit_id)?;
    let schedule = selectors::get_schedule_for_date(habit, crate::models::parse_date(date).unwrap_or(habit.created_on))?;
    let name = schedule.display_name().unwrap_or("Habit");
    let message = match &schedule.goal {
        Goal::Check => format!("{name} complete for {date}"),
        Goal::Pages { total, .. } => format!("{name} pages goal ({total}) reached for {date}"),
        Goal::Minutes { total, .. } => format!("{name} minutes goal ({total}) reached for {date}"),
    };
    Some(Celebration {
        habit_id: habit_id.to_string(),
        date: date.to_string(),
        message,
    })
}

/// `_requestFutureScheduleChange(habitId, targetDate, update)`: splits `scheduleHistory` so the new configuration applies from
/// `target_date` onward without altering the past. `new_schedule` plays
/// the role of `update(entry)` — its non-date fields become the new
/// entry's content, but the date fields are derived here per the split
/// rule rather than taken from the caller.
fn request_future_schedule_change(habit: &mut Habit, target_date: NaiveDate, new_schedule: HabitSchedule) {
    let covering_index = habit
        .schedule_history
        .iter()
        .position(|s| s.covers(target_date));

    if let Some(idx) = covering_index {
        if habit.schedule_history[idx].start_date == target_date {
            let end_date = habit.schedule_history[idx].end_date;
            habit.schedule_history[idx] = new_schedule;
            habit.schedule_history[idx].start_date = target_date;
            habit.schedule_history[idx].end_date = end_date;
        } else {
            habit.schedule_history[idx].end_date = Some(target_date);
            let mut next = new_schedule;
            next.start_date = target_date;
            next.end_date = None;
            habit.schedule_history.insert(idx + 1, next);
        }
    } else if habit
        .schedule_history
        .first()
        .map(|s| target_date < s.start_date)
        .unwrap_or(true)
    {
        let old_earliest = habit.schedule_history.first().map(|s| s.start_date);
        let mut prepended = new_schedule;
        prepended.start_date = target_date;
        prepended.end_date = old_earliest;
        prepended.schedule_anchor = target_date;
        habit.schedule_history.insert(0, prepended);
    } else {
        let mut appended = new_schedule;
        appended.start_date = target_date;
        if let Some(open) = habit.current_schedule_mut() {
            open.end_date = Some(target_date);
        }
        habit.schedule_history.push(appended);
    }

    habit
        .schedule_history
        .sort_by(|a, b| a.start_date.cmp(&b.start_date));
}

/// Resurrection:
/// if `habit_id` still exists as a tombstone whose `deletedOn` is today,
/// editing it again un-deletes it instead of erroring as NotFound.
fn try_resurrect(state: &mut AppState, habit_id: &str, effective_date: NaiveDate, clock: i64) -> Option<HabitId> {
    let habit = state.habits.iter_mut().find(|h| h.id == habit_id)?;
    if habit.is_tombstone() && habit.deleted_on == Some(effective_date) {
        habit.deleted_on = None;
        habit.deleted_name = None;
        habit.last_modified = clock;
        return Some(habit.id.clone());
    }
    None
}

/// A habit's name for resurrection-matching purposes: its most recent
/// schedule name if it still has one, else its tombstoned `deletedName`.
fn resurrection_match_name(h: &Habit) -> Option<&str> {
    h.latest_name().or(h.deleted_name.as_deref())
}

/// Locates a tombstoned or ended habit to reuse instead of creating a
/// duplicate: any habit whose most recent
/// schedule name (case-insensitive, trimmed) equals `name`. Priority:
/// a soft-ended habit (schedule history intact, not hard-deleted) over
/// a hard-deleted tombstone (empty history); ties broken by the later
/// schedule start date.
fn find_resurrection_candidate(state: &AppState, name: &str) -> Option<HabitId> {
    let needle = name.trim().to_lowercase();
    state
        .habits
        .iter()
        .filter(|h| resurrection_match_name(h).map(|n| n.trim().to_lowercase()) == Some(needle.clone()))
        .max_by_key(|h| {
            let tier = if h.is_tombstone() { 0 } else { 1 };
            let start = h.schedule_history.last().map(|s| s.start_date).unwrap_or(h.created_on);
            (tier, start)
        })
        .map(|h| h.id.clone())
}

/// Applies the 5-step resurrection algorithm to `habit_id`.
fn resurrect(state: &mut AppState, habit_id: &str, target_date: NaiveDate, clock: i64, new_schedule: HabitSchedule) {
    let Some(habit) = state.habit_mut(habit_id) else { return };

    habit.deleted_on = None;
    habit.graduated_on = None;
    habit.deleted_name = None;

    if habit.created_on > target_date {
        habit.created_on = target_date;
    }

    if habit.schedule_history.is_empty() {
        let mut entry = new_schedule;
        entry.start_date = target_date;
        entry.end_date = None;
        habit.schedule_history.push(entry);
    } else {
        request_future_schedule_change(habit, target_date, new_schedule);
        if let Some(entry) = habit.schedule_history.iter_mut().find(|s| s.start_date == target_date) {
            entry.end_date = None;
        }
    }

    habit
        .schedule_history
        .retain(|s| !(s.start_date > target_date || (s.start_date == target_date && s.end_date.is_some())));

    habit.last_modified = clock;
}

fn today_key_date() -> NaiveDate {
    crate::models::parse_date(&today_key()).unwrap_or_else(|| chrono::Utc::now().date_naive())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::models::{Goal, Time as T};

    fn test_context() -> (ActionContext, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Config::default();
        cfg.data_dir = dir.path().to_path_buf();
        let store = StateStore::open(&cfg).unwrap();
        let state = store.load_state().unwrap();
        (ActionContext::new(store, state, false, CryptoWorker::spawn()), dir)
    }

    fn schedule(name: &str, anchor: &str) -> HabitSchedule {
        HabitSchedule {
            start_date: crate::models::parse_date(anchor).unwrap(),
            end_date: None,
            name: Some(name.to_string()),
            name_key: None,
            icon: "<svg/>".to_string(),
            color: "#111111".to_string(),
            goal: Goal::Check,
            times: [T::Morning].into_iter().collect(),
            frequency: Frequency::Daily,
            schedule_anchor: crate::models::parse_date(anchor).unwrap(),
        }
    }

    #[tokio::test]
    async fn creating_a_habit_assigns_an_id_and_appears_active() {
        let (ctx, _dir) = test_context();
        let id = ctx
            .save_habit_from_modal(None, crate::models::parse_date("2024-01-01").unwrap(), schedule("Read", "2024-01-01"))
            .unwrap();
        let snap = ctx.snapshot();
        assert_eq!(snap.habit(&id).unwrap().latest_name(), Some("Read"));
    }

    #[tokio::test]
    async fn duplicate_habit_name_is_rejected() {
        let (ctx, _dir) = test_context();
        ctx.save_habit_from_modal(None, crate::models::parse_date("2024-01-01").unwrap(), schedule("Read", "2024-01-01"))
            .unwrap();
        let result = ctx.save_habit_from_modal(
            None,
            crate::models::parse_date("2024-01-02").unwrap(),
            schedule("read", "2024-01-02"),
        );
        assert!(result.is_err());
    }

    /// Re-adding a hard-deleted habit by name resurrects its id instead
    /// of creating a duplicate, and heals the stale closed entry an
    /// earlier "end habit" action left behind.
    #[tokio::test]
    async fn readding_a_hard_deleted_habit_by_name_resurrects_it() {
        let (ctx, _dir) = test_context();
        let id = ctx
            .save_habit_from_modal(None, crate::models::parse_date("2025-01-10").unwrap(), schedule("Exercise", "2025-01-10"))
            .unwrap();
        ctx.request_habit_ending_from_modal(&id, crate::models::parse_date("2025-01-15").unwrap())
            .unwrap();
        ctx.request_habit_permanent_deletion(&id).await.unwrap();

        let reused_id = ctx
            .save_habit_from_modal(None, crate::models::parse_date("2025-01-12").unwrap(), schedule("Exercise", "2025-01-12"))
            .unwrap();

        assert_eq!(reused_id, id);
        let snap = ctx.snapshot();
        let habit = snap.habit(&id).unwrap();
        assert!(habit.deleted_on.is_none());
        assert_eq!(habit.schedule_history.len(), 1);
        assert_eq!(habit.schedule_history[0].start_date, crate::models::parse_date("2025-01-12").unwrap());
        assert_eq!(habit.schedule_history[0].end_date, None);
    }

    #[tokio::test]
    async fn editing_habit_for_a_future_date_splits_history_without_altering_the_past() {
        let (ctx, _dir) = test_context();
        let id = ctx
            .save_habit_from_modal(None, crate::models::parse_date("2024-01-01").unwrap(), schedule("Read", "2024-01-01"))
            .unwrap();

        let mut evening = schedule("Read", "2024-02-01");
        evening.times = [T::Evening].into_iter().collect();
        ctx.save_habit_from_modal(Some(&id), crate::models::parse_date("2024-02-01").unwrap(), evening)
            .unwrap();

        let snap = ctx.snapshot();
        let habit = snap.habit(&id).unwrap();
        assert_eq!(habit.schedule_history.len(), 2);
        assert_eq!(habit.schedule_history[0].start_date, crate::models::parse_date("2024-01-01").unwrap());
        assert_eq!(habit.schedule_history[0].end_date, crate::models::parse_date("2024-02-01"));
        assert_eq!(habit.schedule_history[0].times, [T::Morning].into_iter().collect());
        assert_eq!(habit.schedule_history[1].start_date, crate::models::parse_date("2024-02-01").unwrap());
        assert_eq!(habit.schedule_history[1].end_date, None);
        assert_eq!(habit.schedule_history[1].times, [T::Evening].into_iter().collect());
    }

    #[tokio::test]
    async fn editing_habit_before_the_earliest_entry_prepends_a_new_entry() {
        let (ctx, _dir) = test_context();
        let id = ctx
            .save_habit_from_modal(None, crate::models::parse_date("2024-01-10").unwrap(), schedule("Read", "2024-01-10"))
            .unwrap();

        ctx.save_habit_from_modal(Some(&id), crate::models::parse_date("2024-01-05").unwrap(), schedule("Read", "2024-01-05"))
            .unwrap();

        let snap = ctx.snapshot();
        let habit = snap.habit(&id).unwrap();
        assert_eq!(habit.schedule_history.len(), 2);
        assert_eq!(habit.schedule_history[0].start_date, crate::models::parse_date("2024-01-05").unwrap());
        assert_eq!(habit.schedule_history[0].end_date, crate::models::parse_date("2024-01-10"));
        assert_eq!(habit.schedule_history[1].start_date, crate::models::parse_date("2024-01-10").unwrap());
        assert_eq!(habit.schedule_history[1].end_date, None);
    }

    #[tokio::test]
    async fn editing_habit_at_the_current_entrys_start_updates_it_in_place() {
        let (ctx, _dir) = test_context();
        let id = ctx
            .save_habit_from_modal(None, crate::models::parse_date("2024-01-01").unwrap(), schedule("Read", "2024-01-01"))
            .unwrap();

        let mut renamed = schedule("Reading", "2024-01-01");
        renamed.times = [T::Evening].into_iter().collect();
        ctx.save_habit_from_modal(Some(&id), crate::models::parse_date("2024-01-01").unwrap(), renamed)
            .unwrap();

        let snap = ctx.snapshot();
        let habit = snap.habit(&id).unwrap();
        assert_eq!(habit.schedule_history.len(), 1);
        assert_eq!(habit.latest_name(), Some("Reading"));
        assert_eq!(habit.schedule_history[0].times, [T::Evening].into_iter().collect());
    }

    #[tokio::test]
    async fn toggle_cycles_null_done_deferred_null() {
        let (ctx, _dir) = test_context();
        let id = ctx
            .save_habit_from_modal(None, crate::models::parse_date("2024-01-01").unwrap(), schedule("Read", "2024-01-01"))
            .unwrap();
        ctx.toggle_habit_status(&id, "2024-01-01", T::Morning).unwrap();
        let snap = ctx.snapshot();
        assert_eq!(
            bitlog::get_status(&snap.monthly_logs, &snap.daily_data, &id, "2024-01-01", T::Morning),
            Status::Done
        );
        ctx.toggle_habit_status(&id, "2024-01-01", T::Morning).unwrap();
        let snap = ctx.snapshot();
        assert_eq!(
            bitlog::get_status(&snap.monthly_logs, &snap.daily_data, &id, "2024-01-01", T::Morning),
            Status::Deferred
        );
        ctx.toggle_habit_status(&id, "2024-01-01", T::Morning).unwrap();
        let snap = ctx.snapshot();
        assert_eq!(
            bitlog::get_status(&snap.monthly_logs, &snap.daily_data, &id, "2024-01-01", T::Morning),
            Status::Null
        );
    }

    #[tokio::test]
    async fn goal_override_exceeding_total_promotes_done_to_done_plus() {
        let (ctx, _dir) = test_context();
        let mut pages = schedule("Read", "2024-01-01");
        pages.goal = Goal::Pages { total: 10, unit_key: "pages".to_string() };
        let id = ctx.save_habit_from_modal(None, crate::models::parse_date("2024-01-01").unwrap(), pages).unwrap();

        ctx.toggle_habit_status(&id, "2024-01-01", T::Morning).unwrap();
        ctx.set_goal_override(&id, "2024-01-01", T::Morning, Some(15)).unwrap();
        let snap = ctx.snapshot();
        assert_eq!(
            bitlog::get_status(&snap.monthly_logs, &snap.daily_data, &id, "2024-01-01", T::Morning),
            Status::DonePlus
        );

        ctx.set_goal_override(&id, "2024-01-01", T::Morning, Some(5)).unwrap();
        let snap = ctx.snapshot();
        assert_eq!(
            bitlog::get_status(&snap.monthly_logs, &snap.daily_data, &id, "2024-01-01", T::Morning),
            Status::Done
        );
    }

    #[tokio::test]
    async fn goal_override_on_check_goal_never_promotes_status() {
        let (ctx, _dir) = test_context();
        let id = ctx
            .save_habit_from_modal(None, crate::models::parse_date("2024-01-01").unwrap(), schedule("Read", "2024-01-01"))
            .unwrap();
        ctx.toggle_habit_status(&id, "2024-01-01", T::Morning).unwrap();
        ctx.set_goal_override(&id, "2024-01-01", T::Morning, Some(999)).unwrap();
        let snap = ctx.snapshot();
        assert_eq!(
            bitlog::get_status(&snap.monthly_logs, &snap.daily_data, &id, "2024-01-01", T::Morning),
            Status::Done
        );
    }

    #[tokio::test]
    async fn permanent_deletion_leaves_no_orphan_ghosts() {
        let (ctx, _dir) = test_context();
        let id = ctx
            .save_habit_from_modal(None, crate::models::parse_date("2024-01-01").unwrap(), schedule("Read", "2024-01-01"))
            .unwrap();
        ctx.toggle_habit_status(&id, "2024-01-01", T::Morning).unwrap();
        ctx.request_habit_permanent_deletion(&id).await.unwrap();
        let snap = ctx.snapshot();
        assert!(crate::migrations::no_orphan_ghosts(&snap));
        assert!(snap.monthly_logs.keys().all(|k| !k.starts_with(&format!("{id}_"))));
    }

    #[tokio::test]
    async fn export_then_import_round_trips_habits() {
        let (ctx, _dir) = test_context();
        ctx.save_habit_from_modal(None, crate::models::parse_date("2024-01-01").unwrap(), schedule("Read", "2024-01-01"))
            .unwrap();
        let bytes = ctx.export_data().unwrap();

        let (ctx2, _dir2) = test_context();
        ctx2.import_data(&bytes).unwrap();
        assert_eq!(ctx2.snapshot().habits.len(), 1);
    }

    #[tokio::test]
    async fn import_sanitizes_untrusted_icon_and_color_fields() {
        let (ctx, _dir) = test_context();
        let mut bad = schedule("Read", "2024-01-01");
        bad.icon = "javascript:alert(1)".to_string();
        bad.color = "not-a-color".to_string();
        ctx.save_habit_from_modal(None, crate::models::parse_date("2024-01-01").unwrap(), bad)
            .unwrap();
        let bytes = ctx.export_data().unwrap();

        let (ctx2, _dir2) = test_context();
        ctx2.import_data(&bytes).unwrap();
        let snap = ctx2.snapshot();
        let entry = &snap.habits[0].schedule_history[0];
        assert_eq!(entry.icon, crate::models::SANITIZED_ICON_SENTINEL);
        assert_eq!(entry.color, crate::models::DEFAULT_HABIT_COLOR);
    }

    #[tokio::test]
    async fn single_flight_lock_rejects_reentrant_mutation() {
        let (ctx, _dir) = test_context();
        let _guard = ctx.in_flight.try_lock().unwrap();
        let result = ctx.reset_application_data();
        assert!(result.is_err());
    }
}
