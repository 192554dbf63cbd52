//! Reporting clocks: wall-clock timestamps in unix milliseconds plus a
//! monotonic correction so a clock jump during a run cannot invert the
//! reported interval.

use chrono::{DateTime, Local, Offset, Utc};

use crate::types::RepeatType;

/// Unix timestamp in milliseconds, the `currentTime=` wire format.
pub fn to_accurate_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

pub fn accurate_now_millis() -> i64 {
    to_accurate_millis(Utc::now())
}

/// Clamp `end` so it never precedes `start`: `start + max(0, end - start)`.
pub fn stable_elapsed(end: DateTime<Utc>, start: DateTime<Utc>) -> DateTime<Utc> {
    if end < start { start } else { end }
}

/// Current wall clock with its UTC offset in seconds and IANA timezone name.
pub fn now_with_timezone() -> (DateTime<Utc>, i32, String) {
    let now = Local::now();
    let offset = now.offset().fix().local_minus_utc();
    let name = iana_time_zone::get_timezone().unwrap_or_else(|_| "UTC".to_string());
    (now.with_timezone(&Utc), offset, name)
}

/// Extra query parameters appended to outgoing reports: the wall clock for
/// rate tasks, plus offset and timezone name for cron tasks. The query layer
/// URL-encodes the timezone name.
pub fn wall_clock_query(repeat: RepeatType) -> Vec<(&'static str, String)> {
    match repeat {
        RepeatType::Rate => vec![("currentTime", accurate_now_millis().to_string())],
        RepeatType::Period => {
            let (now, offset, name) = now_with_timezone();
            vec![
                ("currentTime", to_accurate_millis(now).to_string()),
                ("offset", offset.to_string()),
                ("timeZone", name),
            ]
        }
        _ => Vec::new(),
    }
}
