//! Local-calendar day arithmetic.
//!
//! Every timestamp is epoch milliseconds. Day boundaries are computed on the
//! local calendar of the configured zone, never by stepping fixed 24h blocks,
//! so DST days (23h / 25h) split correctly.

use chrono::{DateTime, Days, NaiveDate, TimeDelta, TimeZone, Utc};
use std::collections::BTreeSet;

pub const DEFAULT_RETENTION_DAYS: u32 = 7;

/// Zones the engine can run in (`chrono::Local`, `chrono_tz::Tz`, `FixedOffset`, `Utc`).
pub trait LocalZone: TimeZone + Send + Sync + 'static {}

impl<T> LocalZone for T where T: TimeZone + Send + Sync + 'static {}

#[derive(Debug, Clone)]
pub struct DayCalendar<Tz: TimeZone> {
    tz: Tz,
}

impl<Tz: LocalZone> DayCalendar<Tz> {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    /// Local date of `ts_ms`; instants beyond chrono's range pin to its ends.
    pub fn local_date(&self, ts_ms: i64) -> NaiveDate {
        representable(ts_ms).with_timezone(&self.tz).date_naive()
    }

    /// `YYYY-MM-DD` of the local calendar day containing `ts_ms`.
    pub fn day_key(&self, ts_ms: i64) -> String {
        format_day_key(self.local_date(ts_ms))
    }

    /// First instant of the local calendar day after the one containing `ts_ms`.
    pub fn next_local_midnight(&self, ts_ms: i64) -> i64 {
        let today = self.local_date(ts_ms);
        let Some(tomorrow) = today.succ_opt() else {
            return i64::MAX;
        };
        self.start_of_day(tomorrow).max(ts_ms.saturating_add(1))
    }

    /// Day-keys for the reference day and the `days - 1` local days before it.
    pub fn trailing_window_keys(&self, reference_ms: i64, days: u32) -> BTreeSet<String> {
        let today = self.local_date(reference_ms);
        (0..days.max(1))
            .filter_map(|i| today.checked_sub_days(Days::new(u64::from(i))))
            .map(format_day_key)
            .collect()
    }

    /// First instant of the oldest day in the trailing `days`-day window.
    pub fn window_start_ms(&self, reference_ms: i64, days: u32) -> i64 {
        let today = self.local_date(reference_ms);
        let back = u64::from(days.max(1) - 1);
        let oldest = today.checked_sub_days(Days::new(back)).unwrap_or(today);
        self.start_of_day(oldest).min(reference_ms)
    }

    /// Day-key `n` local calendar days before the one containing `reference_ms`.
    pub fn day_key_days_ago(&self, reference_ms: i64, n: u32) -> String {
        let today = self.local_date(reference_ms);
        format_day_key(today.checked_sub_days(Days::new(u64::from(n))).unwrap_or(today))
    }

    fn start_of_day(&self, date: NaiveDate) -> i64 {
        let Some(midnight) = date.and_hms_opt(0, 0, 0) else {
            return i64::MAX;
        };
        let mut local = midnight;
        // A DST gap can swallow 00:00; take the first local time that exists.
        for _ in 0..(24 * 4) {
            if let Some(dt) = self.tz.from_local_datetime(&local).earliest() {
                return dt.timestamp_millis();
            }
            local += TimeDelta::minutes(15);
        }
        midnight.and_utc().timestamp_millis()
    }
}

// One day of slack keeps every zone's local time inside chrono's range.
fn representable(ts_ms: i64) -> DateTime<Utc> {
    let lo = DateTime::<Utc>::MIN_UTC + TimeDelta::days(1);
    let hi = DateTime::<Utc>::MAX_UTC - TimeDelta::days(1);
    match DateTime::<Utc>::from_timestamp_millis(ts_ms) {
        Some(dt) => dt.clamp(lo, hi),
        None if ts_ms < 0 => lo,
        None => hi,
    }
}

pub fn format_day_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub fn parse_day_key(key: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(key, "%Y-%m-%d").ok()
}
