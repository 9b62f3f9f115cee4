//! Aggregates over stored day buckets for the stats views and exports.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::retention::{DayBucket, DaysSnapshot};

pub const OTHER_LABEL: &str = "Other";
pub const DEFAULT_TOP_N: usize = 7;
pub const DEFAULT_MIN_MS: u64 = 60_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainTotal {
    pub domain: String,
    pub ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyTotal {
    pub day: String,
    pub ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DayReport {
    pub day: String,
    pub total_ms: u64,
    pub total_human: String,
    pub domains: Vec<DomainTotal>,
    pub top: Vec<DomainTotal>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Report {
    pub days: Vec<String>,
    pub overall: Vec<DomainTotal>,
    pub overall_top: Vec<DomainTotal>,
    pub daily: Vec<DailyTotal>,
    pub per_day: Vec<DayReport>,
}

/// Index days, newest first.
pub fn days_newest_first(snapshot: &DaysSnapshot) -> Vec<String> {
    let mut days = snapshot.day_index.clone();
    days.sort();
    days.reverse();
    days
}

/// A bucket's entries sorted by time, largest first (ties by name).
pub fn domain_totals(bucket: &DayBucket) -> Vec<DomainTotal> {
    sorted_desc(bucket.iter().map(|(d, ms)| (d.clone(), *ms)))
}

pub fn overall_totals(snapshot: &DaysSnapshot) -> BTreeMap<String, u64> {
    let mut totals = BTreeMap::new();
    for day in &snapshot.day_index {
        if let Some(bucket) = snapshot.buckets.get(day) {
            for (domain, ms) in bucket {
                *totals.entry(domain.clone()).or_insert(0u64) += ms;
            }
        }
    }
    totals
}

pub fn daily_totals(snapshot: &DaysSnapshot) -> Vec<DailyTotal> {
    days_newest_first(snapshot)
        .into_iter()
        .map(|day| {
            let ms = snapshot
                .buckets
                .get(&day)
                .map(|b| b.values().sum())
                .unwrap_or(0);
            DailyTotal { day, ms }
        })
        .collect()
}

/// One domain's time per day, newest first; days without it read as 0.
pub fn domain_series(snapshot: &DaysSnapshot, domain: &str) -> Vec<DailyTotal> {
    days_newest_first(snapshot)
        .into_iter()
        .map(|day| {
            let ms = snapshot
                .buckets
                .get(&day)
                .and_then(|b| b.get(domain).copied())
                .unwrap_or(0);
            DailyTotal { day, ms }
        })
        .collect()
}

/// Entries under `min_ms` are dropped, the `n` largest kept and the rest
/// summed into a trailing `"Other"` entry.
pub fn top_n_with_other(totals: &BTreeMap<String, u64>, n: usize, min_ms: u64) -> Vec<DomainTotal> {
    let mut entries = sorted_desc(
        totals
            .iter()
            .filter(|(_, ms)| **ms >= min_ms)
            .map(|(d, ms)| (d.clone(), *ms)),
    );
    let rest: u64 = entries.iter().skip(n).map(|e| e.ms).sum();
    entries.truncate(n);
    if rest > 0 {
        entries.push(DomainTotal {
            domain: OTHER_LABEL.to_string(),
            ms: rest,
        });
    }
    entries
}

pub fn build_report(snapshot: &DaysSnapshot, top_n: usize, min_ms: u64) -> Report {
    let overall_map = overall_totals(snapshot);
    let per_day = days_newest_first(snapshot)
        .into_iter()
        .map(|day| {
            let bucket = snapshot.buckets.get(&day).cloned().unwrap_or_default();
            let total_ms = bucket.values().sum();
            DayReport {
                total_human: format_duration(total_ms),
                domains: domain_totals(&bucket),
                top: top_n_with_other(&bucket, top_n, min_ms),
                day,
                total_ms,
            }
        })
        .collect();

    Report {
        days: days_newest_first(snapshot),
        overall: sorted_desc(overall_map.iter().map(|(d, ms)| (d.clone(), *ms))),
        overall_top: top_n_with_other(&overall_map, top_n, min_ms),
        daily: daily_totals(snapshot),
        per_day,
    }
}

/// `1h 2m 3s`, or `2m 3s` under an hour.
pub fn format_duration(ms: u64) -> String {
    let total = ms / 1000;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    if h > 0 {
        format!("{h}h {m}m {s}s")
    } else {
        format!("{m}m {s}s")
    }
}

/// `day,domain,ms` rows, newest day first.
pub fn export_csv(snapshot: &DaysSnapshot) -> String {
    let mut out = String::new();
    out.push_str("day,domain,ms\n");
    for day in days_newest_first(snapshot) {
        let Some(bucket) = snapshot.buckets.get(&day) else {
            continue;
        };
        for t in domain_totals(bucket) {
            out.push_str(&format!("{},{},{}\n", day, csv_escape(&t.domain), t.ms));
        }
    }
    out
}

fn csv_escape(s: &str) -> String {
    if s.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

fn sorted_desc(entries: impl Iterator<Item = (String, u64)>) -> Vec<DomainTotal> {
    let mut out: Vec<DomainTotal> = entries
        .map(|(domain, ms)| DomainTotal { domain, ms })
        .collect();
    out.sort_by(|a, b| b.ms.cmp(&a.ms).then_with(|| a.domain.cmp(&b.domain)));
    out
}
