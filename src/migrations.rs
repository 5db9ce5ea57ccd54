//! Sequential schema-version transforms over persisted blobs.
//!
//! Past schema versions do not share a Rust type with the current
//! `AppState` (the v6 migration reshapes the habit graph entirely, v9
//! rewrites the bit width of every `monthlyLogs` entry), so migrations
//! operate on a loosely-typed `serde_json::Value` staging representation
//! and only the final, fully-migrated blob is deserialized into the
//! typed `AppState`. This mirrors the one-shot
//! `migrate_platform_credentials` pattern in `storage::settings::load`,
//! generalized from a single idempotent pass into an ordered chain.

use crate::bitlog::BitBuffer;
use crate::error::{AppError, AppResult};
use crate::models::{AppState, CURRENT_SCHEMA_VERSION};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};

/// `migrateState(loadedState | null | undefined, targetVersion)`.
///
/// Rule 1: `None` -> fresh default state at `target_version`.
/// Rule 2-4: apply every migration whose version is in
/// `(loaded.version, target_version]`, in the fixed compile-time order
/// below, then set `state.version = target_version` unconditionally.
pub fn migrate_state(loaded: Option<Value>, target_version: u32) -> AppResult<AppState> {
    let Some(mut raw) = loaded else {
        let mut fresh = AppState::default();
        fresh.version = target_version;
        return Ok(fresh);
    };
    if raw.is_null() || (raw.is_object() && raw.as_object().unwrap().is_empty()) {
        let mut fresh = AppState::default();
        fresh.version = target_version;
        return Ok(fresh);
    }

    let from_version = raw.get("version").and_then(|v| v.as_u64()).unwrap_or(0) as u32;

    if from_version < 6 && target_version >= 6 {
        raw = migrate_to_v6(raw);
    }
    if from_version < 9 && target_version >= 9 {
        raw = migrate_to_v9(raw);
    }
    if from_version < 10 && target_version >= 10 {
        raw = migrate_to_v10(raw);
    }

    raw["version"] = json!(target_version);

    let monthly_logs_raw = raw
        .as_object_mut()
        .and_then(|o| o.remove("monthlyLogs"))
        .unwrap_or(Value::Null);

    let mut state: AppState = serde_json::from_value(raw).map_err(AppError::from)?;
    state.version = target_version;
    state.monthly_logs = hydrate_monthly_logs(monthly_logs_raw);
    Ok(state)
}

/// Hydration of `monthlyLogs`: accepts a map of key -> hex string,
/// `{__type:'bigint', val}`, or a raw byte array. Per-entry parse
/// failures are dropped with a warning, never aborting the migration.
pub fn hydrate_monthly_logs(raw: Value) -> HashMap<String, BitBuffer> {
    let mut out = HashMap::new();
    let Some(obj) = raw.as_object() else {
        return out;
    };
    for (key, value) in obj {
        match hydrate_one_log(value) {
            Some(buf) => {
                out.insert(key.clone(), buf);
            }
            None => {
                log::warn!("[migrations] dropping unparsable monthlyLogs entry for key {key}");
            }
        }
    }
    out
}

fn hydrate_one_log(value: &Value) -> Option<BitBuffer> {
    match value {
        Value::String(hex_str) => hex::decode(hex_str).ok().map(BitBuffer::from_bytes),
        Value::Array(bytes) => {
            let mut out = Vec::with_capacity(bytes.len());
            for b in bytes {
                out.push(b.as_u64()? as u8);
            }
            Some(BitBuffer::from_bytes(out))
        }
        Value::Object(o) if o.get("__type").and_then(|t| t.as_str()) == Some("bigint") => {
            let val = o.get("val")?.as_str()?;
            bigint_decimal_to_le_bytes(val)
        }
        _ => None,
    }
}

/// Decode a base-10 bigint string into little-endian bytes without an
/// external bigint crate: repeated divmod-by-256 on a decimal digit
/// string.
fn bigint_decimal_to_le_bytes(decimal: &str) -> Option<Vec<u8>> {
    let mut digits: Vec<u8> = decimal
        .trim()
        .bytes()
        .map(|b| {
            if b.is_ascii_digit() {
                Ok(b - b'0')
            } else {
                Err(())
            }
        })
        .collect::<Result<Vec<u8>, ()>>()
        .ok()?;
    if digits.is_empty() {
        return None;
    }
    let mut bytes = Vec::new();
    while !(digits.len() == 1 && digits[0] == 0) {
        let mut remainder: u32 = 0;
        let mut next_digits = Vec::with_capacity(digits.len());
        for &d in &digits {
            let acc = remainder * 10 + d as u32;
            let q = acc / 256;
            remainder = acc % 256;
            if !next_digits.is_empty() || q != 0 {
                next_digits.push(q as u8);
            }
        }
        bytes.push(remainder as u8);
        if next_digits.is_empty() {
            break;
        }
        digits = next_digits;
    }
    if bytes.is_empty() {
        bytes.push(0);
    }
    Some(bytes)
}

/// **-> v6**: schedule-history consolidation. Pre-v6 data stored each
/// schedule edit as a standalone habit record linked to its ancestor via
/// `previousVersionId`. Treat habits as an undirected graph (edge =
/// `previousVersionId`) and BFS, never recursion, since chains may be
/// long enough to blow the stack, to find connected components; each
/// component becomes one consolidated habit.
fn migrate_to_v6(mut raw: Value) -> Value {
    let Some(habits) = raw.get("habits").and_then(|h| h.as_array()).cloned() else {
        return raw;
    };

    let mut adjacency: HashMap<usize, Vec<usize>> = HashMap::new();
    let mut id_to_index: HashMap<String, usize> = HashMap::new();
    for (i, h) in habits.iter().enumerate() {
        if let Some(id) = h.get("id").and_then(|v| v.as_str()) {
            id_to_index.insert(id.to_string(), i);
        }
    }
    for (i, h) in habits.iter().enumerate() {
        if let Some(prev) = h.get("previousVersionId").and_then(|v| v.as_str()) {
            if let Some(&j) = id_to_index.get(prev) {
                adjacency.entry(i).or_default().push(j);
                adjacency.entry(j).or_default().push(i);
            }
        }
    }

    let mut visited = vec![false; habits.len()];
    let mut consolidated = Vec::new();
    for start in 0..habits.len() {
        if visited[start] {
            continue;
        }
        let mut component = Vec::new();
        let mut queue = VecDeque::new();
        queue.push_back(start);
        visited[start] = true;
        while let Some(node) = queue.pop_front() {
            component.push(node);
            for &next in adjacency.get(&node).into_iter().flatten() {
                if !visited[next] {
                    visited[next] = true;
                    queue.push_back(next);
                }
            }
        }
        consolidated.push(consolidate_component(&habits, component));
    }

    // Remap dailyData keys from superseded ids to each component's
    // consolidated id, merging `instances` with the later record winning.
    let id_remap: HashMap<String, String> = consolidated
        .iter()
        .flat_map(|c| {
            let new_id = c.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string();
            c.get("_memberIds")
                .and_then(|v| v.as_array())
                .into_iter()
                .flatten()
                .filter_map(|v| v.as_str())
                .map(move |old| (old.to_string(), new_id.clone()))
                .collect::<Vec<_>>()
        })
        .collect();

    for c in &mut consolidated {
        if let Some(obj) = c.as_object_mut() {
            obj.remove("_memberIds");
        }
    }

    if let Some(daily_data) = raw.get_mut("dailyData").and_then(|v| v.as_object_mut()) {
        for (_date, by_habit) in daily_data.iter_mut() {
            if let Some(by_habit_obj) = by_habit.as_object_mut() {
                let mut remapped: serde_json::Map<String, Value> = serde_json::Map::new();
                for (old_id, entry) in by_habit_obj.iter() {
                    let new_id = id_remap.get(old_id).cloned().unwrap_or_else(|| old_id.clone());
                    match remapped.get_mut(&new_id) {
                        // Later (iteration-order) record wins on instance collision.
                        Some(existing) => merge_json_objects_later_wins(existing, entry),
                        None => {
                            remapped.insert(new_id, entry.clone());
                        }
                    }
                }
                *by_habit_obj = remapped;
            }
        }
    }

    raw["habits"] = Value::Array(consolidated);
    raw
}

fn merge_json_objects_later_wins(existing: &mut Value, later: &Value) {
    if let (Some(e), Some(l)) = (existing.as_object_mut(), later.as_object()) {
        for (k, v) in l {
            e.insert(k.clone(), v.clone());
        }
    }
}

/// Build one consolidated habit from a connected component of legacy
/// per-version records: sorted ascending by `createdOn`, keeping the id
/// of the newest version, and mapping each old version into a
/// `HabitSchedule` whose `endDate` is the next version's `createdOn`
/// (or the final version's `endedOn`).
fn consolidate_component(habits: &[Value], component: Vec<usize>) -> Value {
    let mut members: Vec<&Value> = component.iter().map(|&i| &habits[i]).collect();
    members.sort_by_key(|h| h.get("createdOn").and_then(|v| v.as_str()).unwrap_or("").to_string());

    let newest = members.last().unwrap();
    let consolidated_id = newest.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let created_on = members.first().unwrap().get("createdOn").cloned().unwrap_or(Value::Null);

    let mut schedule_history = Vec::new();
    for (i, m) in members.iter().enumerate() {
        let end_date = if i + 1 < members.len() {
            members[i + 1].get("createdOn").cloned().unwrap_or(Value::Null)
        } else {
            m.get("endedOn").cloned().unwrap_or(Value::Null)
        };
        let start_date = m.get("createdOn").cloned().unwrap_or(Value::Null);
        let schedule_anchor = m.get("scheduleAnchor").cloned().unwrap_or_else(|| start_date.clone());
        schedule_history.push(json!({
            "startDate": start_date,
            "endDate": if end_date.is_null() { Value::Null } else { end_date },
            "name": m.get("name").cloned().unwrap_or(Value::Null),
            "nameKey": m.get("nameKey").cloned().unwrap_or(Value::Null),
            "icon": m.get("icon").cloned().unwrap_or(json!("")),
            "color": m.get("color").cloned().unwrap_or(json!("#6366f1")),
            "goal": m.get("goal").cloned().unwrap_or(json!({"type": "check"})),
            "times": m.get("times").cloned().unwrap_or(json!(["morning"])),
            "frequency": m.get("frequency").cloned().unwrap_or(json!({"type": "daily"})),
            "scheduleAnchor": schedule_anchor,
        }));
    }

    let deleted_on = newest.get("deletedOn").cloned().unwrap_or(Value::Null);
    let deleted_name = newest.get("deletedName").cloned().unwrap_or(Value::Null);
    let graduated_on = newest.get("graduatedOn").cloned().unwrap_or(Value::Null);
    let last_modified = newest.get("lastModified").and_then(|v| v.as_i64()).unwrap_or(0);

    let member_ids: Vec<Value> = members
        .iter()
        .filter_map(|m| m.get("id").cloned())
        .collect();

    json!({
        "id": consolidated_id,
        "createdOn": created_on,
        "deletedOn": deleted_on,
        "deletedName": deleted_name,
        "graduatedOn": graduated_on,
        "scheduleHistory": schedule_history,
        "lastModified": last_modified,
        "_memberIds": member_ids,
    })
}

/// **-> v9**: bitmask widening 2-bit -> 3-bit slots. v8 packed 6
/// bits/day (2 bits/slot); re-emit every slot at its new 9-bits/day (3
/// bits/slot) position.
fn migrate_to_v9(mut raw: Value) -> Value {
    let Some(logs) = raw.get("monthlyLogs").and_then(|v| v.as_object()).cloned() else {
        return raw;
    };
    let mut widened = serde_json::Map::new();
    for (key, value) in logs {
        if let Some(old_buf) = hydrate_one_log(&value) {
            let mut new_buf = BitBuffer::default();
            for day in 1..=31u32 {
                for offset in 0..3u32 {
                    let old_pos = (day - 1) * 6 + 2 * offset;
                    let new_pos = (day - 1) * 9 + 3 * offset;
                    let v = old_buf.read_slot_width(old_pos, 2);
                    if v != 0 {
                        new_buf.write_slot_width(new_pos, v, 3);
                    }
                }
            }
            widened.insert(key, Value::String(hex::encode(new_buf.trimmed_bytes())));
        } else {
            log::warn!("[migrations] dropping unparsable v8 monthlyLogs entry for key {key}");
        }
    }
    raw["monthlyLogs"] = Value::Object(widened);
    raw
}

/// **-> v10**: add AI quota fields if missing.
fn migrate_to_v10(mut raw: Value) -> Value {
    let obj = raw.as_object_mut().expect("raw state is always an object by this point");
    if !obj.contains_key("aiQuota") {
        obj.insert(
            "aiQuota".to_string(),
            json!({
                "aiDailyCount": 0,
                "aiQuotaDate": crate::models::today_key(),
                "lastAiContextHash": Value::Null,
            }),
        );
    }
    if !obj.contains_key("language") {
        obj.insert("language".to_string(), json!("en"));
    }
    if !obj.contains_key("onboardingComplete") {
        obj.insert("onboardingComplete".to_string(), json!(false));
    }
    if !obj.contains_key("initialSyncDone") {
        obj.insert("initialSyncDone".to_string(), json!(false));
    }
    if !obj.contains_key("lastModified") {
        obj.insert("lastModified".to_string(), json!(0));
    }
    if !obj.contains_key("shardWatermarks") {
        obj.insert("shardWatermarks".to_string(), json!({}));
    }
    if !obj.contains_key("archives") {
        obj.insert("archives".to_string(), json!({}));
    }
    if !obj.contains_key("dailyData") {
        obj.insert("dailyData".to_string(), json!({}));
    }
    if !obj.contains_key("habits") {
        obj.insert("habits".to_string(), json!([]));
    }
    raw
}

/// Re-running migration over an already-migrated state at the same
/// target version is a no-op.
pub fn is_idempotent_noop(state: &Value, target_version: u32) -> bool {
    state.get("version").and_then(|v| v.as_u64()) == Some(target_version as u64)
}

pub fn current_version() -> u32 {
    CURRENT_SCHEMA_VERSION
}

/// Every habit id must not appear both as a live habit and only as a
/// ghost key in `dailyData` with no corresponding habit record.
pub fn no_orphan_ghosts(state: &AppState) -> bool {
    let ids: HashSet<&str> = state.habits.iter().map(|h| h.id.as_str()).collect();
    state
        .daily_data
        .values()
        .flat_map(|by_habit| by_habit.keys())
        .all(|id| ids.contains(id.as_str()))
}
