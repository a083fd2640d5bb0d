//! Spreadsheet date serials.
//!
//! A serial counts days since 1899-12-30, with the fractional part holding the
//! time of day. The Unix epoch is serial 25569.

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};

use crate::engine::ErrorCode;

pub const UNIX_EPOCH_SERIAL: f64 = 25569.0;
pub const MS_PER_DAY: f64 = 86_400_000.0;

fn serial_base() -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(1899, 12, 30)
}

/// Serial for a calendar date.
pub fn date_to_serial(date: NaiveDate) -> Option<f64> {
    Some((date - serial_base()?).num_days() as f64)
}

/// DATE(month, day, year). Months and days outside their range roll over.
pub fn date(month: i64, day: i64, year: i64) -> Result<f64, ErrorCode> {
    let month = month.checked_sub(1).ok_or(ErrorCode::Value)?;
    let year = year
        .checked_add(month.div_euclid(12))
        .ok_or(ErrorCode::Value)?;
    let month = month.rem_euclid(12) + 1;
    let first = i32::try_from(year)
        .ok()
        .and_then(|y| NaiveDate::from_ymd_opt(y, month as u32, 1))
        .ok_or(ErrorCode::Value)?;
    let offset = day
        .checked_sub(1)
        .and_then(TimeDelta::try_days)
        .ok_or(ErrorCode::Value)?;
    let date = first.checked_add_signed(offset).ok_or(ErrorCode::Value)?;
    date_to_serial(date).ok_or(ErrorCode::Value)
}

/// DATEVALUE(text): accepts `M/D/YYYY` and ISO `YYYY-MM-DD`.
pub fn date_value(text: &str) -> Result<f64, ErrorCode> {
    let text = text.trim();
    let date = NaiveDate::parse_from_str(text, "%m/%d/%Y")
        .or_else(|_| NaiveDate::parse_from_str(text, "%Y-%m-%d"))
        .map_err(|_| ErrorCode::Value)?;
    date_to_serial(date).ok_or(ErrorCode::Value)
}

pub fn ms_to_serial(ms: i64) -> f64 {
    ms as f64 / MS_PER_DAY + UNIX_EPOCH_SERIAL
}

pub fn serial_to_ms(serial: f64) -> i64 {
    ((serial - UNIX_EPOCH_SERIAL) * MS_PER_DAY).round() as i64
}

/// JSONTIME2EXCEL: ISO-8601 timestamp to serial.
pub fn json_time_to_serial(text: &str) -> Result<f64, ErrorCode> {
    let parsed = DateTime::parse_from_rfc3339(text.trim()).map_err(|_| ErrorCode::Value)?;
    Ok(ms_to_serial(parsed.timestamp_millis()))
}

/// EXCEL2JSONTIME: serial to ISO-8601 with milliseconds and a `Z` suffix.
pub fn serial_to_json_time(serial: f64) -> Result<String, ErrorCode> {
    if !serial.is_finite() {
        return Err(ErrorCode::Value);
    }
    let time: DateTime<Utc> =
        DateTime::from_timestamp_millis(serial_to_ms(serial)).ok_or(ErrorCode::Value)?;
    Ok(time.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
}
