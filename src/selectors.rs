//! Pure, memoized queries over `AppState`. Every selector is
//! a plain function; memoization lives in `SelectorCaches`, a sibling
//! object the `actions` layer owns and clears on structural/day-scoped
//! mutations — selectors never clear their own caches.

use crate::bitlog;
use crate::models::{
    AppState, DateKey, Frequency, Habit, HabitId, HabitSchedule, IntervalUnit, Status, Time,
};
use chrono::{Datelike, NaiveDate};
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Default)]
pub struct SelectorCaches {
    schedule_cache: HashMap<(HabitId, DateKey), Option<usize>>,
    active_habits_cache: HashMap<DateKey, Vec<HabitId>>,
    streaks_cache: HashMap<(HabitId, DateKey), u32>,
    day_summary_cache: HashMap<DateKey, DaySummary>,
}

impl SelectorCaches {
    /// `clearSelectorInternalCaches()`: called on any structural change
    /// (add/remove/edit habit).
    pub fn clear_all(&mut self) {
        self.schedule_cache.clear();
        self.active_habits_cache.clear();
        self.streaks_cache.clear();
        self.day_summary_cache.clear();
    }

    /// `invalidateCachesForDateChange(date)`: scoped invalidation after a
    /// per-day mutation.
    pub fn invalidate_for_date(&mut self, date: &str) {
        self.active_habits_cache.remove(date);
        self.day_summary_cache.remove(date);
        self.streaks_cache.retain(|(_, d), _| d != date);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DaySummary {
    pub total: u32,
    pub completed: u32,
    pub snoozed: u32,
    pub pending: u32,
    pub show_plus_indicator: bool,
}

fn days_between(a: NaiveDate, b: NaiveDate) -> i64 {
    (b - a).num_days()
}

/// `getScheduleForDate(habit, date)`: binary search on `scheduleHistory`
/// (sorted ascending by `startDate`) for the entry covering `date`.
pub fn get_schedule_for_date<'h>(habit: &'h Habit, date: NaiveDate) -> Option<&'h HabitSchedule> {
    if habit.is_tombstone() {
        return None;
    }
    if let Some(graduated) = habit.graduated_on {
        if graduated <= date {
            return None;
        }
    }
    if date < habit.created_on {
        return None;
    }
    // partition_point: first index whose start_date > date.
    let idx = habit
        .schedule_history
        .partition_point(|s| s.start_date <= date);
    if idx == 0 {
        return None;
    }
    let candidate = &habit.schedule_history[idx - 1];
    candidate.covers(date).then_some(candidate)
}

pub fn get_schedule_for_date_cached<'h>(
    caches: &mut SelectorCaches,
    habit: &'h Habit,
    date: NaiveDate,
) -> Option<&'h HabitSchedule> {
    let key = (habit.id.clone(), crate::models::format_date(date));
    let idx = *caches.schedule_cache.entry(key).or_insert_with(|| {
        get_schedule_for_date(habit, date).map(|s| {
            habit
                .schedule_history
                .iter()
                .position(|x| std::ptr::eq(x, s))
                .unwrap()
        })
    });
    idx.map(|i| &habit.schedule_history[i])
}

/// `getEffectiveScheduleForHabitOnDate(habit, date)`.
pub fn get_effective_schedule_for_habit_on_date(
    state: &AppState,
    habit: &Habit,
    date: &str,
) -> Vec<Time> {
    if let Some(day_entry) = state
        .daily_data
        .get(date)
        .and_then(|by_habit| by_habit.get(&habit.id))
    {
        if let Some(override_times) = &day_entry.daily_schedule {
            return override_times.iter().copied().collect();
        }
    }
    let Some(d) = crate::models::parse_date(date) else {
        return Vec::new();
    };
    get_schedule_for_date(habit, d)
        .map(|s| s.times.iter().copied().collect())
        .unwrap_or_default()
}

/// `shouldHabitAppearOnDate(habit, date)`.
pub fn should_habit_appear_on_date(habit: &Habit, date: NaiveDate) -> bool {
    if habit.deleted_on.map(|d| d <= date).unwrap_or(false) {
        return false;
    }
    if habit.graduated_on.map(|d| d <= date).unwrap_or(false) {
        return false;
    }
    if date < habit.created_on {
        return false;
    }
    let Some(schedule) = get_schedule_for_date(habit, date) else {
        return false;
    };
    match &schedule.frequency {
        Frequency::Daily => true,
        Frequency::Interval { amount, unit } => {
            let unit_days = match unit {
                IntervalUnit::Days => 1,
                IntervalUnit::Weeks => 7,
            };
            let span = (*amount as i64) * unit_days;
            if span <= 0 {
                return true;
            }
            days_between(schedule.schedule_anchor, date).rem_euclid(span) == 0
        }
        Frequency::SpecificDaysOfWeek { days } => {
            // chrono: Monday=0..Sunday=6; the stored 0..6 convention is
            // Sunday=0, matching JS `Date.getDay()`.
            let js_day = (date.weekday().num_days_from_sunday()) as u8;
            days.contains(&js_day)
        }
    }
}

/// `calculateHabitStreak(habit, date)`: count consecutive *scheduled*
/// days ending at `date` where every scheduled time is DONE/DONE_PLUS.
/// Unscheduled days are skipped without breaking the streak; the first
/// scheduled-but-incomplete day stops the count.
pub fn calculate_habit_streak(state: &AppState, habit: &Habit, date: NaiveDate) -> u32 {
    let mut streak = 0u32;
    let mut day = date;
    loop {
        if day < habit.created_on {
            break;
        }
        if should_habit_appear_on_date(habit, day) {
            let date_key = crate::models::format_date(day);
            let times = get_effective_schedule_for_habit_on_date(state, habit, &date_key);
            if times.is_empty() {
                break;
            }
            let all_done = times.iter().all(|&t| {
                bitlog::get_status(&state.monthly_logs, &state.daily_data, &habit.id, &date_key, t)
                    .is_complete()
            });
            if !all_done {
                break;
            }
            streak += 1;
        }
        match day.pred_opt() {
            Some(prev) => day = prev,
            None => break,
        }
    }
    streak
}

/// Ambient counterpart to `calculateHabitStreak`, matching
/// `compute_streaks` which always returns both current and longest
/// together (`storage::claude_usage::compute_streaks`).
pub fn calculate_longest_streak(state: &AppState, habit: &Habit, up_to: NaiveDate) -> u32 {
    let mut longest = 0u32;
    let mut current = 0u32;
    let mut day = habit.created_on;
    while day <= up_to {
        if should_habit_appear_on_date(habit, day) {
            let date_key = crate::models::format_date(day);
            let times = get_effective_schedule_for_habit_on_date(state, habit, &date_key);
            let all_done = !times.is_empty()
                && times.iter().all(|&t| {
                    bitlog::get_status(&state.monthly_logs, &state.daily_data, &habit.id, &date_key, t)
                        .is_complete()
                });
            if all_done {
                current += 1;
                longest = longest.max(current);
            } else {
                current = 0;
            }
        }
        day = day.succ_opt().unwrap_or(up_to + chrono::Duration::days(1));
        if day > up_to {
            break;
        }
    }
    longest
}

/// `calculateDaySummary(date)`.
pub fn calculate_day_summary(state: &AppState, date: &str) -> DaySummary {
    let Some(d) = crate::models::parse_date(date) else {
        return DaySummary::default();
    };
    let mut summary = DaySummary::default();
    for habit in state.active_habits() {
        if !should_habit_appear_on_date(habit, d) {
            continue;
        }
        let times = get_effective_schedule_for_habit_on_date(state, habit, date);
        for t in times {
            let status = bitlog::get_status(&state.monthly_logs, &state.daily_data, &habit.id, date, t);
            summary.total += 1;
            match status {
                Status::Done => summary.completed += 1,
                Status::DonePlus => {
                    summary.completed += 1;
                    summary.show_plus_indicator = true;
                }
                Status::Deferred => summary.snoozed += 1,
                Status::Null => summary.pending += 1,
            }
        }
    }
    summary
}

pub fn calculate_day_summary_cached(
    caches: &mut SelectorCaches,
    state: &AppState,
    date: &str,
) -> DaySummary {
    *caches
        .day_summary_cache
        .entry(date.to_string())
        .or_insert_with(|| calculate_day_summary(state, date))
}

/// `isHabitNameDuplicate(name, ignoredHabitId?)`: case-insensitive
/// trimmed match against any active habit's current schedule name.
pub fn is_habit_name_duplicate(state: &AppState, name: &str, ignored_habit_id: Option<&str>) -> bool {
    let needle = name.trim().to_lowercase();
    if needle.is_empty() {
        return false;
    }
    state.active_habits().any(|h| {
        if Some(h.id.as_str()) == ignored_habit_id {
            return false;
        }
        h.latest_name()
            .map(|n| n.trim().to_lowercase() == needle)
            .unwrap_or(false)
    })
}

/// Active habits for a date (scheduled today, non-tombstoned), used by
/// the action layer to drive the day's checklist.
pub fn active_habits_for_date<'s>(state: &'s AppState, date: NaiveDate) -> Vec<&'s Habit> {
    state
        .active_habits()
        .filter(|h| should_habit_appear_on_date(h, date))
        .collect()
}

pub fn active_habit_ids_for_date_cached(
    caches: &mut SelectorCaches,
    state: &AppState,
    date: &str,
) -> Vec<HabitId> {
    if let Some(cached) = caches.active_habits_cache.get(date) {
        return cached.clone();
    }
    let Some(d) = crate::models::parse_date(date) else {
        return Vec::new();
    };
    let ids: Vec<HabitId> = active_habits_for_date(state, d).into_iter().map(|h| h.id.clone()).collect();
    caches.active_habits_cache.insert(date.to_string(), ids.clone());
    ids
}

pub fn habit_times_union(state: &AppState, date: &str) -> BTreeSet<Time> {
    let Some(d) = crate::models::parse_date(date) else {
        return BTreeSet::new();
    };
    active_habits_for_date(state, d)
        .into_iter()
        .flat_map(|h| get_effective_schedule_for_habit_on_date(state, h, date))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::*;

    fn base_habit(id: &str, created: &str) -> Habit {
        Habit {
            id: id.to_string(),
            created_on: parse_date(created).unwrap(),
            deleted_on: None,
            deleted_name: None,
            graduated_on: None,
            schedule_history: vec![HabitSchedule {
                start_date: parse_date(created).unwrap(),
                end_date: None,
                name: Some("Exercise".to_string()),
                name_key: None,
                icon: "<svg/>".to_string(),
                color: "#111111".to_string(),
                goal: Goal::Check,
                times: [Time::Morning].into_iter().collect(),
                frequency: Frequency::Daily,
                schedule_anchor: parse_date(created).unwrap(),
            }],
            last_modified: 0,
        }
    }

    #[test]
    fn schedule_lookup_finds_covering_entry() {
        let habit = base_habit("h1", "2024-01-10");
        let sched = get_schedule_for_date(&habit, parse_date("2024-01-15").unwrap());
        assert!(sched.is_some());
        let none = get_schedule_for_date(&habit, parse_date("2024-01-01").unwrap());
        assert!(none.is_none());
    }

    #[test]
    fn daily_frequency_always_appears_after_creation() {
        let habit = base_habit("h1", "2024-01-10");
        assert!(should_habit_appear_on_date(&habit, parse_date("2024-01-10").unwrap()));
        assert!(should_habit_appear_on_date(&habit, parse_date("2024-06-01").unwrap()));
        assert!(!should_habit_appear_on_date(&habit, parse_date("2024-01-09").unwrap()));
    }

    #[test]
    fn tombstoned_habit_never_appears() {
        let mut habit = base_habit("h1", "2024-01-10");
        habit.deleted_on = Some(parse_date("2024-01-10").unwrap());
        habit.schedule_history.clear();
        assert!(!should_habit_appear_on_date(&habit, parse_date("2024-06-01").unwrap()));
    }

    #[test]
    fn interval_frequency_matches_phase() {
        let mut habit = base_habit("h1", "2024-01-01");
        habit.schedule_history[0].frequency = Frequency::Interval { amount: 2, unit: IntervalUnit::Days };
        habit.schedule_history[0].schedule_anchor = parse_date("2024-01-01").unwrap();
        assert!(should_habit_appear_on_date(&habit, parse_date("2024-01-01").unwrap()));
        assert!(!should_habit_appear_on_date(&habit, parse_date("2024-01-02").unwrap()));
        assert!(should_habit_appear_on_date(&habit, parse_date("2024-01-03").unwrap()));
    }

    #[test]
    fn streak_counts_consecutive_complete_scheduled_days() {
        let habit = base_habit("h1", "2024-01-01");
        let mut state = AppState::default();
        state.habits.push(habit.clone());
        for d in ["2024-01-01", "2024-01-02", "2024-01-03"] {
            bitlog::set_status(&mut state.monthly_logs, "h1", d, Time::Morning, Status::Done);
        }
        let streak = calculate_habit_streak(&state, &habit, parse_date("2024-01-03").unwrap());
        assert_eq!(streak, 3);
    }

    #[test]
    fn streak_stops_at_first_incomplete_day() {
        let habit = base_habit("h1", "2024-01-01");
        let mut state = AppState::default();
        state.habits.push(habit.clone());
        bitlog::set_status(&mut state.monthly_logs, "h1", "2024-01-01", Time::Morning, Status::Done);
        // 2024-01-02 left NULL.
        bitlog::set_status(&mut state.monthly_logs, "h1", "2024-01-03", Time::Morning, Status::Done);
        let streak = calculate_habit_streak(&state, &habit, parse_date("2024-01-03").unwrap());
        assert_eq!(streak, 1);
    }

    #[test]
    fn name_duplicate_is_case_insensitive_and_trimmed() {
        let mut state = AppState::default();
        state.habits.push(base_habit("h1", "2024-01-01"));
        assert!(is_habit_name_duplicate(&state, "  exercise  ", None));
        assert!(is_habit_name_duplicate(&state, "EXERCISE", None));
        assert!(!is_habit_name_duplicate(&state, "Exercise", Some("h1")));
        assert!(!is_habit_name_duplicate(&state, "Reading", None));
    }

    #[test]
    fn day_summary_counts_by_status() {
        let mut state = AppState::default();
        let habit = base_habit("h1", "2024-01-01");
        state.habits.push(habit);
        bitlog::set_status(&mut state.monthly_logs, "h1", "2024-01-05", Time::Morning, Status::Done);
        let summary = calculate_day_summary(&state, "2024-01-05");
        assert_eq!(summary.total, 1);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.pending, 0);
    }
}
