use chrono::{NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;

const FIRST_START: u32 = 7 * 3600;
const FIRST_END: u32 = 15 * 3600 + 25 * 60;
const SECOND_START: u32 = 15 * 3600 + 30 * 60;
const SECOND_END: u32 = 23 * 3600 + 59 * 60 + 59;

/// Work period a submission falls into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Shift {
    /// 07:00:00 through 15:25:00
    First,
    /// 15:30:00 through 23:59:59
    Second,
    /// Shift changeover gap and overnight hours
    Off,
}

impl Shift {
    pub fn as_str(&self) -> &'static str {
        match self {
            Shift::First => "First",
            Shift::Second => "Second",
            Shift::Off => "Off",
        }
    }
}

impl fmt::Display for Shift {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shift label plus the `{date}_{shift}` bucket used to partition exports
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShiftInfo {
    pub shift: Shift,
    pub bucket_id: String,
}

impl ShiftInfo {
    /// Export sheet name for a record type tag, e.g. `2024-06-01_First_production`
    pub fn sheet_name(&self, tag: &str) -> String {
        format!("{}_{}", self.bucket_id, tag)
    }
}

/// Resolve the shift bucket for a submitted timestamp.
///
/// The timestamp is taken as local factory time; no timezone conversion is
/// applied. Range ends are inclusive to the exact second, so any fractional
/// part past 15:25:00 or 23:59:59 lands in `Off`.
pub fn resolve(timestamp: NaiveDateTime) -> ShiftInfo {
    let time = timestamp.time();
    let shift = if within(&time, FIRST_START, FIRST_END) {
        Shift::First
    } else if within(&time, SECOND_START, SECOND_END) {
        Shift::Second
    } else {
        Shift::Off
    };

    ShiftInfo {
        shift,
        bucket_id: format!("{}_{}", timestamp.format("%Y-%m-%d"), shift),
    }
}

fn within(time: &impl Timelike, start: u32, end: u32) -> bool {
    let secs = time.num_seconds_from_midnight();
    if secs < start || secs > end {
        return false;
    }
    // Leap-second representation also counts as past the end
    secs < end || time.nanosecond() == 0
}
