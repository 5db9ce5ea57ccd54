//! The persistable state model: habits, schedules, per-day
//! overlays, archives, and the root `AppState`. Dates are kept as
//! `chrono::NaiveDate` internally and as `YYYY-MM-DD` strings at the
//! JSON boundary.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

pub const CURRENT_SCHEMA_VERSION: u32 = 10;

pub type HabitId = String;
/// `YYYY-MM-DD`.
pub type DateKey = String;

pub fn today_key() -> DateKey {
    chrono::Utc::now().date_naive().format("%Y-%m-%d").to_string()
}

pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()
}

pub fn format_date(d: NaiveDate) -> DateKey {
    d.format("%Y-%m-%d").to_string()
}

/// One of the three daily time slots. The discriminant is the
/// `time_offset` used in the BitLog bit-position formula.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Time {
    Morning = 0,
    Afternoon = 1,
    Evening = 2,
}

impl Time {
    pub const ALL: [Time; 3] = [Time::Morning, Time::Afternoon, Time::Evening];

    pub fn offset(self) -> u32 {
        self as u32
    }

    pub fn from_offset(offset: u32) -> Option<Time> {
        match offset {
            0 => Some(Time::Morning),
            1 => Some(Time::Afternoon),
            2 => Some(Time::Evening),
            _ => None,
        }
    }
}

/// Instance status packed 3 bits/slot in BitLog. 4-7 reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Status {
    Null = 0,
    Done = 1,
    Deferred = 2,
    DonePlus = 3,
}

impl Status {
    pub fn from_bits(bits: u8) -> Status {
        match bits & 0b111 {
            1 => Status::Done,
            2 => Status::Deferred,
            3 => Status::DonePlus,
            // 0 and any reserved 4-7 value decode as NULL.
            _ => Status::Null,
        }
    }

    pub fn to_bits(self) -> u8 {
        self as u8
    }

    pub fn is_complete(self) -> bool {
        matches!(self, Status::Done | Status::DonePlus)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Goal {
    Check,
    Pages { total: u32, unit_key: String },
    Minutes { total: u32, unit_key: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalUnit {
    Days,
    Weeks,
}

impl IntervalUnit {
    pub fn unit_days(self) -> i64 {
        match self {
            IntervalUnit::Days => 1,
            IntervalUnit::Weeks => 7,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frequency {
    Daily,
    Interval { amount: u32, unit: IntervalUnit },
    SpecificDaysOfWeek { days: BTreeSet<u8> },
}

/// A time-bounded configuration slice of a habit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HabitSchedule {
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub name: Option<String>,
    pub name_key: Option<String>,
    pub icon: String,
    pub color: String,
    pub goal: Goal,
    pub times: BTreeSet<Time>,
    pub frequency: Frequency,
    pub schedule_anchor: NaiveDate,
}

impl HabitSchedule {
    /// `name` takes precedence over `nameKey`.
    pub fn display_name(&self) -> Option<&str> {
        self.name.as_deref().or(self.name_key.as_deref())
    }

    pub fn covers(&self, date: NaiveDate) -> bool {
        self.start_date <= date && self.end_date.map(|e| date < e).unwrap_or(true)
    }

    /// Imported `icon`/`color` are untrusted: an icon failing the basic
    /// `<svg ...>` prefix check is replaced with a sentinel character, and
    /// a color not matching `#[0-9a-fA-F]{3,8}` is reset.
    pub fn sanitize_untrusted_fields(&mut self) {
        if !is_plausible_svg(&self.icon) {
            self.icon = SANITIZED_ICON_SENTINEL.to_string();
        }
        if !is_plausible_hex_color(&self.color) {
            self.color = DEFAULT_HABIT_COLOR.to_string();
        }
    }
}

pub const SANITIZED_ICON_SENTINEL: &str = "\u{2753}";
pub const DEFAULT_HABIT_COLOR: &str = "#6366f1";

fn is_plausible_svg(icon: &str) -> bool {
    icon.trim_start().starts_with("<svg")
}

fn is_plausible_hex_color(color: &str) -> bool {
    let Some(hex) = color.strip_prefix('#') else {
        return false;
    };
    matches!(hex.len(), 3..=8) && hex.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Per-(habit, date, time) note and goal override.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceData {
    pub note: Option<String>,
    pub goal_override: Option<u32>,
    /// Pre-BitLog status string (`"completed"` / `"snoozed"`), read only as
    /// a fallback by `bitlog::get_status` on a BitLog miss.
    pub legacy_status: Option<String>,
}

/// The mutable per-day overlay for one habit (status itself lives in BitLog).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HabitDayEntry {
    pub daily_schedule: Option<BTreeSet<Time>>,
    pub instances: HashMap<Time, InstanceData>,
}

impl HabitDayEntry {
    pub fn is_empty(&self) -> bool {
        self.daily_schedule.is_none() && self.instances.is_empty()
    }
}

/// A user-defined practice with versioned scheduling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Habit {
    pub id: HabitId,
    pub created_on: NaiveDate,
    pub deleted_on: Option<NaiveDate>,
    pub deleted_name: Option<String>,
    pub graduated_on: Option<NaiveDate>,
    pub schedule_history: Vec<HabitSchedule>,
    /// Logical-clock timestamp of this habit's most recent mutation, used
    /// by `sync::merge` to arbitrate conflicting copies of the same id.
    pub last_modified: i64,
}

impl Habit {
    pub fn is_tombstone(&self) -> bool {
        self.deleted_on.is_some() && self.schedule_history.is_empty()
    }

    /// The open-ended "current" schedule entry, if any.
    pub fn current_schedule(&self) -> Option<&HabitSchedule> {
        self.schedule_history.last().filter(|s| s.end_date.is_none())
    }

    pub fn current_schedule_mut(&mut self) -> Option<&mut HabitSchedule> {
        if self.schedule_history.last().map(|s| s.end_date.is_none()) == Some(true) {
            self.schedule_history.last_mut()
        } else {
            None
        }
    }

    pub fn latest_name(&self) -> Option<&str> {
        self.schedule_history.last().and_then(|s| s.display_name())
    }

    pub fn assert_schedule_history_sorted(&self) {
        debug_assert!(self
            .schedule_history
            .windows(2)
            .all(|w| w[0].start_date < w[1].start_date));
    }
}

/// Cold storage: one compressed JSON blob per year of archived `dailyData`.
pub type Archives = HashMap<i32, Vec<u8>>;

/// AI-analysis quota bookkeeping. No AI logic lives in this crate; these
/// fields are carried losslessly so the external AI collaborator can read
/// and write them through the same `AppState`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiQuota {
    pub ai_daily_count: u32,
    pub ai_quota_date: Option<DateKey>,
    pub last_ai_context_hash: Option<String>,
}

/// The single persistable root object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppState {
    pub version: u32,
    pub habits: Vec<Habit>,
    pub daily_data: BTreeMap<DateKey, HashMap<HabitId, HabitDayEntry>>,
    pub archives: Archives,
    /// `{habitId}_{YYYY-MM}` -> packed bit buffer. Lives in the binary
    /// storage key, not the JSON one.
    #[serde(skip)]
    pub monthly_logs: HashMap<String, crate::bitlog::BitBuffer>,
    pub ai_quota: AiQuota,
    pub language: String,
    pub onboarding_complete: bool,
    /// Boot lock: write actions are no-ops until the first sync pull
    /// completes.
    pub initial_sync_done: bool,
    /// Monotone logical clock, advanced on every committed mutation.
    pub last_modified: i64,
    /// Per-shard watermarks for delta sync push: the `lastModified`
    /// value last confirmed synced (by push or pull) for each shard.
    pub shard_watermarks: HashMap<String, i64>,
    /// Per-shard "last mutated at" logical-clock stamps, kept locally
    /// and compared against `shard_watermarks` so a push only
    /// re-encrypts and uploads shards that actually changed since the
    /// last confirmed sync of that shard.
    pub shard_last_changed: HashMap<String, i64>,
}

impl Default for AppState {
    fn default() -> Self {
        AppState {
            version: CURRENT_SCHEMA_VERSION,
            habits: Vec::new(),
            daily_data: BTreeMap::new(),
            archives: HashMap::new(),
            monthly_logs: HashMap::new(),
            ai_quota: AiQuota::default(),
            language: "en".to_string(),
            onboarding_complete: false,
            initial_sync_done: false,
            last_modified: 0,
            shard_watermarks: HashMap::new(),
            shard_last_changed: HashMap::new(),
        }
    }
}

impl AppState {
    pub fn habit(&self, id: &str) -> Option<&Habit> {
        self.habits.iter().find(|h| h.id == id)
    }

    pub fn habit_mut(&mut self, id: &str) -> Option<&mut Habit> {
        self.habits.iter_mut().find(|h| h.id == id)
    }

    /// Active (non-tombstoned, non-hard-deleted) habits.
    pub fn active_habits(&self) -> impl Iterator<Item = &Habit> {
        self.habits.iter().filter(|h| !h.is_tombstone())
    }
}

/// The month-key slice of a `YYYY-MM-DD` date string. Migrations
/// depend on this exact layout.
pub fn month_of(date: &str) -> &str {
    &date[0..7.min(date.len())]
}

pub fn bitlog_key(habit_id: &str, month: &str) -> String {
    format!("{habit_id}_{month}")
}
