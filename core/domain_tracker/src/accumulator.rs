//! Splits elapsed intervals at local midnight and credits each piece to its
//! day bucket.

use serde::Serialize;
use tracing::debug;

use crate::calendar::{DayCalendar, LocalZone};
use crate::error::Result;
use crate::retention::RetentionStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Credit {
    pub day: String,
    pub domain: String,
    pub ms: u64,
}

/// `(day_key, ms)` pieces of `[start_ms, end_ms)`, one per local day touched.
/// Empty when `end_ms <= start_ms`.
pub fn split_interval<Tz: LocalZone>(
    calendar: &DayCalendar<Tz>,
    start_ms: i64,
    end_ms: i64,
) -> Vec<(String, u64)> {
    let mut out = Vec::new();
    if end_ms <= start_ms {
        return out;
    }
    let mut start = start_ms;
    let end_day = calendar.day_key(end_ms);
    loop {
        let day = calendar.day_key(start);
        if day == end_day {
            break;
        }
        let midnight = calendar.next_local_midnight(start).min(end_ms);
        out.push((day, midnight.abs_diff(start)));
        start = midnight;
    }
    if end_ms > start {
        out.push((end_day, end_ms.abs_diff(start)));
    }
    out
}

/// Credits `[start_ms, end_ms)` to `domain`, one read-modify-write per local
/// day, each followed by a retention pass at `now_ms`.
///
/// Zero-length and inverted intervals are ignored. The interval is clipped to
/// the retention window ending today, so time on days outside it is dropped.
pub async fn add_interval<Tz: LocalZone>(
    store: &RetentionStore<Tz>,
    domain: &str,
    start_ms: i64,
    end_ms: i64,
    now_ms: i64,
) -> Result<Vec<Credit>> {
    let mut credits = Vec::new();
    if domain.is_empty() {
        return Ok(credits);
    }
    let calendar = store.calendar();
    let start_ms = start_ms.max(calendar.window_start_ms(now_ms, store.retention_days()));
    let end_ms = end_ms.min(calendar.next_local_midnight(now_ms));
    for (day, ms) in split_interval(calendar, start_ms, end_ms) {
        if let Some(c) = credit_day(store, domain, &day, ms, now_ms).await? {
            credits.push(c);
        }
    }
    Ok(credits)
}

async fn credit_day<Tz: LocalZone>(
    store: &RetentionStore<Tz>,
    domain: &str,
    day: &str,
    delta_ms: u64,
    now_ms: i64,
) -> Result<Option<Credit>> {
    if delta_ms == 0 {
        return Ok(None);
    }
    if !store.allowed_keys(now_ms).contains(day) {
        debug!("dropping {delta_ms}ms for {domain} on {day}: outside retention window");
        return Ok(None);
    }

    let mut index = store.read_index().await?;
    let mut bucket = store.read_bucket(day).await?;
    let total = bucket.entry(domain.to_string()).or_insert(0);
    *total = total.saturating_add(delta_ms);
    if !index.iter().any(|k| k == day) {
        index.push(day.to_string());
    }

    store.write_bucket_and_index(day, &bucket, &index).await?;
    store.retain_window(index, now_ms).await?;

    debug!("credited {delta_ms}ms to {domain} on {day}");
    Ok(Some(Credit {
        day: day.to_string(),
        domain: domain.to_string(),
        ms: delta_ms,
    }))
}
