//! `BitLog`: O(1) read/write of a habit's status for any (habit, date,
//! time) and efficient bulk serialization.
//!
//! Each month's log is a flat little-endian bit buffer rather than an
//! arbitrary-precision integer; this keeps the dependency stack free of
//! a bigint crate, in the byte-oriented style of
//! `sombra-pager`/`sombra-checksum`'s fixed-offset structures.

use crate::models::{month_of, DateKey, HabitDayEntry, HabitId, Status, Time};
use std::collections::HashMap;

/// 9 bits/day (3 bits * 3 times), 31 days/month worst case -> 279 bits
/// -> 35 bytes max, but buffers grow lazily and trim on serialize.
const BITS_PER_DAY: u32 = 9;
const BITS_PER_SLOT: u32 = 3;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BitBuffer(Vec<u8>);

impl BitBuffer {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        BitBuffer(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Trimmed copy: drop trailing zero bytes.
    pub fn trimmed_bytes(&self) -> Vec<u8> {
        let mut end = self.0.len();
        while end > 0 && self.0[end - 1] == 0 {
            end -= 1;
        }
        self.0[..end].to_vec()
    }

    fn ensure_byte(&mut self, index: usize) {
        if self.0.len() <= index {
            self.0.resize(index + 1, 0);
        }
    }

    /// Read the 3-bit slot at `bit_pos`. Out-of-range reads return 0.
    fn read_slot(&self, bit_pos: u32) -> u8 {
        self.read_slot_width(bit_pos, 3)
    }

    /// Clear the 3-bit slot at `bit_pos` then OR in `value`.
    fn write_slot(&mut self, bit_pos: u32, value: u8) {
        self.write_slot_width(bit_pos, value, 3)
    }

    /// Generalized slot read, used by `migrations` to read legacy
    /// narrower-width (e.g. 2-bit) encodings during schema upgrades.
    pub fn read_slot_width(&self, bit_pos: u32, width: u32) -> u8 {
        let byte_idx = (bit_pos / 8) as usize;
        let bit_off = bit_pos % 8;
        let lo = self.0.get(byte_idx).copied().unwrap_or(0) as u16;
        let hi = self.0.get(byte_idx + 1).copied().unwrap_or(0) as u16;
        let combined = lo | (hi << 8);
        let mask: u16 = (1 << width) - 1;
        ((combined >> bit_off) & mask) as u8
    }

    /// Generalized slot write at an arbitrary bit width.
    pub fn write_slot_width(&mut self, bit_pos: u32, value: u8, width: u32) {
        let byte_idx = (bit_pos / 8) as usize;
        let bit_off = bit_pos % 8;
        self.ensure_byte(byte_idx + 1);
        let mask: u16 = ((1u16 << width) - 1) << bit_off;
        let lo = self.0[byte_idx] as u16;
        let hi = self.0[byte_idx + 1] as u16;
        let mut combined = lo | (hi << 8);
        combined &= !mask;
        combined |= ((value as u16) & ((1 << width) - 1)) << bit_off;
        self.0[byte_idx] = (combined & 0xFF) as u8;
        self.0[byte_idx + 1] = (combined >> 8) as u8;
    }
}

pub fn bit_position(day: u32, time: Time) -> u32 {
    (day - 1) * BITS_PER_DAY + BITS_PER_SLOT * time.offset()
}

fn day_of(date: &str) -> Option<u32> {
    date.get(8..10)?.parse().ok()
}

/// Legacy fallback: the pre-BitLog `dailyData[date][habitId].instances[time]`
/// mapping (`completed -> Done`, `snoozed -> Deferred`, else `Null`).
fn legacy_status(
    daily_data: &std::collections::BTreeMap<DateKey, HashMap<HabitId, HabitDayEntry>>,
    habit_id: &str,
    date: &str,
    time: Time,
) -> Status {
    daily_data
        .get(date)
        .and_then(|by_habit| by_habit.get(habit_id))
        .and_then(|entry| entry.instances.get(&time))
        .and_then(|inst| inst.legacy_status.as_deref())
        .map(|note| match note {
            "completed" => Status::Done,
            "snoozed" => Status::Deferred,
            _ => Status::Null,
        })
        .unwrap_or(Status::Null)
}

/// `getStatus(habitId, dateISO, time)`. Falls back to the legacy
/// `dailyData` instance mapping on a BitLog miss.
pub fn get_status(
    monthly_logs: &HashMap<String, BitBuffer>,
    daily_data: &std::collections::BTreeMap<DateKey, HashMap<HabitId, HabitDayEntry>>,
    habit_id: &str,
    date: &str,
    time: Time,
) -> Status {
    let Some(day) = day_of(date) else {
        return Status::Null;
    };
    let key = crate::models::bitlog_key(habit_id, month_of(date));
    match monthly_logs.get(&key) {
        Some(buf) => Status::from_bits(buf.read_slot(bit_position(day, time))),
        None => legacy_status(daily_data, habit_id, date, time),
    }
}

/// `setStatus(habitId, dateISO, time, status)`.
pub fn set_status(
    monthly_logs: &mut HashMap<String, BitBuffer>,
    habit_id: &str,
    date: &str,
    time: Time,
    status: Status,
) {
    let Some(day) = day_of(date) else { return };
    let key = crate::models::bitlog_key(habit_id, month_of(date));
    let buf = monthly_logs.entry(key).or_default();
    buf.write_slot(bit_position(day, time), status.to_bits());
}

/// `packBinaryLogs()`: zero-copy-ish snapshot of the in-memory map as
/// trimmed little-endian bytes per month, for the binary storage key.
pub fn pack_binary_logs(monthly_logs: &HashMap<String, BitBuffer>) -> HashMap<String, Vec<u8>> {
    monthly_logs
        .iter()
        .map(|(k, v)| (k.clone(), v.trimmed_bytes()))
        .collect()
}

/// `unpackBinaryLogs(map)`: restores in place.
pub fn unpack_binary_logs(bytes: HashMap<String, Vec<u8>>) -> HashMap<String, BitBuffer> {
    bytes
        .into_iter()
        .map(|(k, v)| (k, BitBuffer::from_bytes(v)))
        .collect()
}

/// `serializeLogsForCloud()`: text form for sync/export.
pub fn serialize_logs_for_cloud(monthly_logs: &HashMap<String, BitBuffer>) -> Vec<(String, String)> {
    monthly_logs
        .iter()
        .map(|(k, v)| (k.clone(), hex::encode(v.trimmed_bytes())))
        .collect()
}

/// `deserializeLogsFromCloud(list)`: inverse of the above.
pub fn deserialize_logs_from_cloud(pairs: Vec<(String, String)>) -> HashMap<String, BitBuffer> {
    pairs
        .into_iter()
        .filter_map(|(k, hex_str)| hex::decode(hex_str).ok().map(|b| (k, BitBuffer::from_bytes(b))))
        .collect()
}

/// `pruneLogsForHabit(habitId)`: removes every entry keyed `habitId_*`.
pub fn prune_logs_for_habit(monthly_logs: &mut HashMap<String, BitBuffer>, habit_id: &str) {
    let prefix = format!("{habit_id}_");
    monthly_logs.retain(|k, _| !k.starts_with(&prefix));
}

#[cfg(test)]
mod proptests {
    use super::*;
    use crate::models::Time::*;
    use proptest::prelude::*;

    fn arb_time() -> impl Strategy<Value = crate::models::Time> {
        prop_oneof![Just(Morning), Just(Afternoon), Just(Evening)]
    }

    proptest! {
        /// Any sequence of (day, time, status) writes leaves every slot
        /// readable back as exactly what was last written to it, and
        /// never perturbs a slot nobody wrote to.
        #[test]
        fn arbitrary_writes_never_cross_contaminate_slots(
            day in 1u32..=28,
            time in arb_time(),
            status in 0u8..=3,
            other_day in 1u32..=28,
            other_time in arb_time(),
        ) {
            prop_assume!((day, time) != (other_day, other_time));
            let mut buf = BitBuffer::default();
            let status = Status::from_bits(status);
            buf.write_slot(bit_position(day, time), status.to_bits());
            prop_assert_eq!(Status::from_bits(buf.read_slot(bit_position(day, time))), status);
            prop_assert_eq!(Status::from_bits(buf.read_slot(bit_position(other_day, other_time))), Status::Null);
        }

        /// `bit_position` is injective over the (day, time) domain used by
        /// a single month: no two distinct slots ever collide.
        #[test]
        fn bit_position_is_injective_within_a_month(
            day_a in 1u32..=31, time_a in arb_time(),
            day_b in 1u32..=31, time_b in arb_time(),
        ) {
            prop_assume!((day_a, time_a) != (day_b, time_b));
            prop_assert_ne!(bit_position(day_a, time_a), bit_position(day_b, time_b));
        }

        /// Round-tripping through the trimmed hex cloud encoding never
        /// loses a written status.
        #[test]
        fn cloud_hex_roundtrip_preserves_status(day in 1u32..=28, time in arb_time(), status in 1u8..=3) {
            let mut logs = HashMap::new();
            let date = format!("2024-01-{day:02}");
            set_status(&mut logs, "h1", &date, time, Status::from_bits(status));
            let serialized = serialize_logs_for_cloud(&logs);
            let restored = deserialize_logs_from_cloud(serialized);
            let daily_data = Default::default();
            prop_assert_eq!(get_status(&restored, &daily_data, "h1", &date, time), Status::from_bits(status));
        }
    }
}
