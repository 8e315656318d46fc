//! Date parsing for upstream exports.
//!
//! Accepted encodings:
//! - spreadsheet serial day-counts (30000 < v < 50000, epoch 1899-12-30)
//! - `DD-MM-YYYY[ HH:MM[:SS]]` and `DD/MM/YYYY`
//! - `YYYY-MM-DD[ HH:MM[:SS]]`, with `T` or space separator
//! - RFC3339 with offset (the local wall time is kept)
//!
//! Textual dates with a year outside [2000, 2030] are rejected. Nothing here
//! panics or errors; unparseable input is `None`.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime};

const MIN_YEAR: i32 = 2000;
const MAX_YEAR: i32 = 2030;
const SERIAL_MIN: f64 = 30_000.0;
const SERIAL_MAX: f64 = 50_000.0;
const MILLIS_PER_DAY: f64 = 86_400_000.0;

/// Parse a timestamp in any supported encoding.
pub fn parse_date(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(serial) = raw.replace(',', ".").parse::<f64>() {
        return from_serial(serial);
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_local()).filter(|d| year_in_range(d.date()));
    }

    let (date_part, time_part) = match raw.find([' ', 'T']) {
        Some(idx) => (&raw[..idx], Some(raw[idx + 1..].trim())),
        None => (raw, None),
    };

    let date = parse_calendar_date(date_part)?;
    let time = match time_part.filter(|t| !t.is_empty()) {
        Some(t) => parse_time(t)?,
        None => NaiveTime::MIN,
    };
    Some(date.and_time(time))
}

/// Parse and keep only the calendar day.
pub fn parse_day(raw: &str) -> Option<NaiveDate> {
    parse_date(raw).map(|dt| dt.date())
}

/// Whole days from `earlier` to `now`, floored. Future timestamps are 0.
pub fn days_between(earlier: NaiveDateTime, now: NaiveDateTime) -> i64 {
    (now - earlier).num_days().max(0)
}

fn from_serial(serial: f64) -> Option<NaiveDateTime> {
    if !serial.is_finite() || serial <= SERIAL_MIN || serial >= SERIAL_MAX {
        return None;
    }
    let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?.and_time(NaiveTime::MIN);
    let millis = (serial * MILLIS_PER_DAY).round() as i64;
    epoch.checked_add_signed(Duration::milliseconds(millis))
}

fn parse_calendar_date(part: &str) -> Option<NaiveDate> {
    let pieces: Vec<&str> = part.split(['-', '/']).collect();
    if pieces.len() != 3 {
        return None;
    }
    let numbers: Vec<u32> = pieces
        .iter()
        .map(|p| p.trim().parse::<u32>().ok())
        .collect::<Option<_>>()?;

    let (year, month, day) = if pieces[0].trim().len() == 4 {
        (numbers[0], numbers[1], numbers[2])
    } else {
        (numbers[2], numbers[1], numbers[0])
    };

    let date = NaiveDate::from_ymd_opt(i32::try_from(year).ok()?, month, day)?;
    Some(date).filter(|d| year_in_range(*d))
}

fn parse_time(part: &str) -> Option<NaiveTime> {
    // Drop fractional seconds and a trailing zone designator.
    let part = part.trim_end_matches('Z');
    let part = part.split('.').next().unwrap_or(part);
    let mut pieces = part.split(':');
    let hour = pieces.next()?.trim().parse::<u32>().ok()?;
    let minute = pieces.next().map(|m| m.trim().parse::<u32>()).unwrap_or(Ok(0)).ok()?;
    let second = pieces.next().map(|s| s.trim().parse::<u32>()).unwrap_or(Ok(0)).ok()?;
    NaiveTime::from_hms_opt(hour, minute, second)
}

fn year_in_range(date: NaiveDate) -> bool {
    use chrono::Datelike;
    (MIN_YEAR..=MAX_YEAR).contains(&date.year())
}
