//! Day-bucketed persistence with a rolling retention window.
//!
//! Layout in the key-value store:
//! - `dayIndex` → JSON array of day-keys
//! - `day:<YYYY-MM-DD>` → JSON object `{domain: ms}`
//!
//! Every key in the index has a bucket. Writes go bucket-before-index and
//! evictions go index-before-bucket, so a crash can only ever orphan a bucket,
//! never leave a referenced key without one.

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::calendar::{DayCalendar, LocalZone, DEFAULT_RETENTION_DAYS};
use crate::error::Result;
use crate::store::KeyValueStore;

pub const INDEX_KEY: &str = "dayIndex";
pub const BUCKET_PREFIX: &str = "day:";

/// Domain → accumulated milliseconds for one local day.
pub type DayBucket = BTreeMap<String, u64>;

pub fn bucket_key(day: &str) -> String {
    format!("{BUCKET_PREFIX}{day}")
}

/// Keys touched by a successful write or removal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageChange {
    pub keys: Vec<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    pub kept: Vec<String>,
    pub evicted: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub healed: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub orphans_removed: Vec<String>,
}

/// The index plus every bucket it references.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct DaysSnapshot {
    #[serde(rename = "dayIndex")]
    pub day_index: Vec<String>,
    pub buckets: BTreeMap<String, DayBucket>,
}

pub struct RetentionStore<Tz: LocalZone> {
    store: Arc<dyn KeyValueStore>,
    calendar: DayCalendar<Tz>,
    retention_days: u32,
    changes: broadcast::Sender<StorageChange>,
}

impl<Tz: LocalZone> RetentionStore<Tz> {
    pub fn new(store: Arc<dyn KeyValueStore>, calendar: DayCalendar<Tz>) -> Self {
        Self::with_retention(store, calendar, DEFAULT_RETENTION_DAYS)
    }

    pub fn with_retention(
        store: Arc<dyn KeyValueStore>,
        calendar: DayCalendar<Tz>,
        retention_days: u32,
    ) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            store,
            calendar,
            retention_days: retention_days.max(1),
            changes,
        }
    }

    pub fn calendar(&self) -> &DayCalendar<Tz> {
        &self.calendar
    }

    pub fn retention_days(&self) -> u32 {
        self.retention_days
    }

    pub fn allowed_keys(&self, now_ms: i64) -> BTreeSet<String> {
        self.calendar
            .trailing_window_keys(now_ms, self.retention_days)
    }

    /// Storage-change notifications, for readers that re-render on updates.
    pub fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.changes.subscribe()
    }

    /// Bucket for `day`; missing or corrupt buckets read as empty.
    pub async fn read_bucket(&self, day: &str) -> Result<DayBucket> {
        Ok(self.load_bucket(day).await?.unwrap_or_default())
    }

    /// `None` when the bucket is absent or not a plain object.
    async fn load_bucket(&self, day: &str) -> Result<Option<DayBucket>> {
        let key = bucket_key(day);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(None);
        };
        let decoded = decode_bucket(&raw);
        if decoded.is_none() {
            warn!("bucket {key} has a corrupt shape; treating as empty");
        }
        Ok(decoded)
    }

    /// Known day-keys; a missing or non-array index reads as empty.
    pub async fn read_index(&self) -> Result<Vec<String>> {
        let raw = self.store.get(INDEX_KEY).await?;
        Ok(match raw {
            Some(Value::Array(items)) => dedup_keys(items.iter().filter_map(Value::as_str)),
            Some(other) => {
                warn!("dayIndex has a corrupt shape ({}); treating as empty", type_name(&other));
                Vec::new()
            }
            None => Vec::new(),
        })
    }

    pub async fn write_bucket_and_index(
        &self,
        day: &str,
        bucket: &DayBucket,
        index: &[String],
    ) -> Result<()> {
        let key = bucket_key(day);
        self.store
            .set_many(vec![
                (key.clone(), encode_bucket(bucket)),
                (INDEX_KEY.to_string(), encode_index(index)),
            ])
            .await?;
        self.notify(vec![key, INDEX_KEY.to_string()]);
        Ok(())
    }

    /// Deletes one bucket. Idempotent.
    pub async fn evict(&self, day: &str) -> Result<()> {
        let key = bucket_key(day);
        self.store.remove(&key).await?;
        self.notify(vec![key]);
        Ok(())
    }

    /// Shrinks the index to the retention window and deletes what fell out.
    pub async fn enforce_retention(&self, now_ms: i64) -> Result<RetentionReport> {
        let index = self.read_index().await?;
        self.retain_window(index, now_ms).await
    }

    /// Eviction pass over a known index value (saves a read after a write).
    pub(crate) async fn retain_window(
        &self,
        index: Vec<String>,
        now_ms: i64,
    ) -> Result<RetentionReport> {
        let today = self.calendar.day_key(now_ms);
        let allowed = self.allowed_keys(now_ms);

        let mut kept: Vec<String> = index
            .iter()
            .filter(|k| allowed.contains(k.as_str()))
            .cloned()
            .collect();
        let evicted: Vec<String> = index
            .iter()
            .filter(|k| !allowed.contains(k.as_str()))
            .cloned()
            .collect();

        let mut healed = Vec::new();
        if !kept.contains(&today) {
            // The bucket must exist before the index references it.
            if self.load_bucket(&today).await?.is_none() {
                self.write_bucket(&today, &DayBucket::new()).await?;
                healed.push(today.clone());
            }
            kept.push(today);
        }

        if kept != index {
            self.store
                .set_many(vec![(INDEX_KEY.to_string(), encode_index(&kept))])
                .await?;
            self.notify(vec![INDEX_KEY.to_string()]);
        }

        for day in &evicted {
            self.evict(day).await?;
        }
        if !evicted.is_empty() {
            info!("evicted {} day bucket(s): {}", evicted.len(), evicted.join(", "));
        }

        Ok(RetentionReport {
            kept,
            evicted,
            healed,
            orphans_removed: Vec::new(),
        })
    }

    /// Startup pass: eviction, lazy creation of today's bucket, healing of
    /// referenced buckets that are missing or corrupt, and removal of
    /// unreferenced `day:*` leftovers.
    pub async fn initialize(&self, now_ms: i64) -> Result<RetentionReport> {
        // A corrupt index reads as empty, so the pass below always rewrites it.
        let index = self.read_index().await?;
        let mut report = self.retain_window(index, now_ms).await?;

        for day in &report.kept {
            if report.healed.contains(day) {
                continue;
            }
            if self.load_bucket(day).await?.is_none() {
                self.write_bucket(day, &DayBucket::new()).await?;
                report.healed.push(day.clone());
            }
        }
        if !report.healed.is_empty() {
            warn!("healed day bucket(s): {}", report.healed.join(", "));
        }

        let referenced: BTreeSet<String> = report.kept.iter().map(|d| bucket_key(d)).collect();
        for key in self.store.keys().await? {
            if key.starts_with(BUCKET_PREFIX) && !referenced.contains(&key) {
                self.store.remove(&key).await?;
                self.notify(vec![key.clone()]);
                report.orphans_removed.push(key);
            }
        }
        if !report.orphans_removed.is_empty() {
            info!(
                "removed {} orphaned bucket(s): {}",
                report.orphans_removed.len(),
                report.orphans_removed.join(", ")
            );
        }

        Ok(report)
    }

    /// Index plus every referenced bucket, as the visualization reads it.
    pub async fn snapshot(&self) -> Result<DaysSnapshot> {
        let day_index = self.read_index().await?;
        let mut buckets = BTreeMap::new();
        for day in &day_index {
            buckets.insert(day.clone(), self.read_bucket(day).await?);
        }
        Ok(DaysSnapshot { day_index, buckets })
    }

    /// Every `day:*` key physically present, referenced or not.
    pub async fn stored_bucket_keys(&self) -> Result<Vec<String>> {
        Ok(self
            .store
            .keys()
            .await?
            .into_iter()
            .filter(|k| k.starts_with(BUCKET_PREFIX))
            .collect())
    }

    /// Writes whole buckets and registers their days in the index, with no
    /// retention pass. Used to seed history.
    pub async fn seed(&self, days: Vec<(String, DayBucket)>) -> Result<Vec<String>> {
        let mut index = self.read_index().await?;
        let mut entries = Vec::with_capacity(days.len() + 1);
        let mut keys = Vec::with_capacity(days.len() + 1);
        for (day, bucket) in days {
            if !index.contains(&day) {
                index.push(day.clone());
            }
            keys.push(bucket_key(&day));
            entries.push((bucket_key(&day), encode_bucket(&bucket)));
        }
        entries.push((INDEX_KEY.to_string(), encode_index(&index)));
        keys.push(INDEX_KEY.to_string());
        self.store.set_many(entries).await?;
        self.notify(keys);
        Ok(index)
    }

    /// Drops everything in the backing store.
    pub async fn reset(&self) -> Result<()> {
        let keys = self.store.keys().await?;
        self.store.clear().await?;
        self.notify(keys);
        Ok(())
    }

    async fn write_bucket(&self, day: &str, bucket: &DayBucket) -> Result<()> {
        let key = bucket_key(day);
        self.store
            .set_many(vec![(key.clone(), encode_bucket(bucket))])
            .await?;
        self.notify(vec![key]);
        Ok(())
    }

    fn notify(&self, keys: Vec<String>) {
        // No subscribers is fine.
        let _ = self.changes.send(StorageChange { keys });
    }
}

fn decode_bucket(raw: &Value) -> Option<DayBucket> {
    let Value::Object(map) = raw else {
        return None;
    };
    let mut out = DayBucket::new();
    for (domain, ms) in map {
        let ms = ms
            .as_u64()
            .or_else(|| ms.as_f64().filter(|f| f.is_finite() && *f >= 0.0).map(|f| f as u64));
        if let Some(ms) = ms {
            out.insert(domain.clone(), ms);
        }
    }
    Some(out)
}

fn encode_bucket(bucket: &DayBucket) -> Value {
    Value::Object(
        bucket
            .iter()
            .map(|(d, ms)| (d.clone(), Value::from(*ms)))
            .collect::<Map<String, Value>>(),
    )
}

fn encode_index(index: &[String]) -> Value {
    Value::Array(index.iter().cloned().map(Value::String).collect())
}

fn dedup_keys<'a>(keys: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    keys.filter(|k| seen.insert(*k)).map(String::from).collect()
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn at(y: i32, m: u32, d: u32, h: u32) -> i64 {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap().timestamp_millis()
    }

    fn fixture() -> (Arc<MemoryStore>, RetentionStore<Utc>) {
        let mem = Arc::new(MemoryStore::new());
        let store = RetentionStore::new(mem.clone(), DayCalendar::new(Utc));
        (mem, store)
    }

    fn days(keys: &[&str]) -> Vec<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    #[tokio::test]
    async fn first_run_creates_today() {
        let (mem, store) = fixture();
        let report = store.initialize(at(2026, 2, 15, 9)).await.unwrap();

        assert_eq!(report.kept, days(&["2026-02-15"]));
        assert_eq!(mem.get(INDEX_KEY).await.unwrap(), Some(json!(["2026-02-15"])));
        assert_eq!(mem.get("day:2026-02-15").await.unwrap(), Some(json!({})));
    }

    #[tokio::test]
    async fn eviction_keeps_window_and_deletes_the_rest() {
        let (mem, store) = fixture();
        let seeded = ["2026-02-01", "2026-02-08", "2026-02-09", "2026-02-14", "2026-02-15"];
        store
            .seed(
                seeded
                    .iter()
                    .map(|d| (d.to_string(), DayBucket::from([("a.com".to_string(), 1)])))
                    .collect(),
            )
            .await
            .unwrap();

        let report = store.enforce_retention(at(2026, 2, 15, 9)).await.unwrap();
        assert_eq!(report.kept, days(&["2026-02-09", "2026-02-14", "2026-02-15"]));
        assert_eq!(report.evicted, days(&["2026-02-01", "2026-02-08"]));

        assert_eq!(
            store.read_index().await.unwrap(),
            days(&["2026-02-09", "2026-02-14", "2026-02-15"])
        );
        assert_eq!(mem.get("day:2026-02-01").await.unwrap(), None);
        assert_eq!(mem.get("day:2026-02-08").await.unwrap(), None);
        for d in ["2026-02-09", "2026-02-14", "2026-02-15"] {
            assert!(mem.get(&bucket_key(d)).await.unwrap().is_some(), "{d} must survive");
        }
    }

    #[tokio::test]
    async fn failed_delete_leaves_index_already_shrunk() {
        let (mem, store) = fixture();
        let seeded = ["2026-02-01", "2026-02-08", "2026-02-14", "2026-02-15"];
        store
            .seed(
                seeded
                    .iter()
                    .map(|d| (d.to_string(), DayBucket::from([("a.com".to_string(), 1)])))
                    .collect(),
            )
            .await
            .unwrap();

        mem.fail_removes(true);
        let now = at(2026, 2, 15, 9);
        assert!(store.enforce_retention(now).await.is_err());

        // The index never points at a deleted bucket.
        let index = store.read_index().await.unwrap();
        assert_eq!(index, days(&["2026-02-14", "2026-02-15"]));
        for d in &index {
            assert!(mem.get(&bucket_key(d)).await.unwrap().is_some(), "{d} must survive");
        }
        assert!(mem.get("day:2026-02-01").await.unwrap().is_some());

        mem.fail_removes(false);
        let report = store.initialize(now).await.unwrap();
        assert_eq!(report.orphans_removed.len(), 2);
        assert_eq!(mem.get("day:2026-02-01").await.unwrap(), None);
        assert_eq!(mem.get("day:2026-02-08").await.unwrap(), None);
    }

    #[tokio::test]
    async fn eviction_appends_today_with_a_bucket() {
        let (mem, store) = fixture();
        store
            .seed(vec![("2026-02-14".to_string(), DayBucket::new())])
            .await
            .unwrap();

        let report = store.enforce_retention(at(2026, 2, 15, 0)).await.unwrap();
        assert_eq!(report.kept, days(&["2026-02-14", "2026-02-15"]));
        assert_eq!(report.healed, days(&["2026-02-15"]));
        assert_eq!(mem.get("day:2026-02-15").await.unwrap(), Some(json!({})));
    }

    #[tokio::test]
    async fn eviction_is_a_noop_when_index_is_current() {
        let (mem, store) = fixture();
        store.initialize(at(2026, 2, 15, 9)).await.unwrap();
        let writes = mem.write_count();

        store.enforce_retention(at(2026, 2, 15, 10)).await.unwrap();
        assert_eq!(mem.write_count(), writes);
    }

    #[tokio::test]
    async fn corrupt_shapes_are_healed_on_startup() {
        let (mem, store) = fixture();
        mem.set_many(vec![
            (INDEX_KEY.to_string(), json!({"not": "an array"})),
            ("day:2026-02-15".to_string(), json!([1, 2, 3])),
        ])
        .await
        .unwrap();

        assert!(store.read_index().await.unwrap().is_empty());
        assert!(store.read_bucket("2026-02-15").await.unwrap().is_empty());

        store.initialize(at(2026, 2, 15, 9)).await.unwrap();
        assert_eq!(mem.get(INDEX_KEY).await.unwrap(), Some(json!(["2026-02-15"])));
        assert_eq!(mem.get("day:2026-02-15").await.unwrap(), Some(json!({})));
    }

    #[tokio::test]
    async fn startup_heals_missing_buckets_and_drops_orphans() {
        let (mem, store) = fixture();
        mem.set_many(vec![
            (INDEX_KEY.to_string(), json!(["2026-02-13", "2026-02-15"])),
            ("day:2026-02-15".to_string(), json!({"a.com": 10})),
            ("day:2026-01-02".to_string(), json!({"old.com": 10})),
        ])
        .await
        .unwrap();

        let report = store.initialize(at(2026, 2, 15, 9)).await.unwrap();
        assert_eq!(report.healed, days(&["2026-02-13"]));
        assert_eq!(report.orphans_removed, days(&["day:2026-01-02"]));
        assert_eq!(mem.get("day:2026-02-13").await.unwrap(), Some(json!({})));
        assert_eq!(
            store.stored_bucket_keys().await.unwrap(),
            days(&["day:2026-02-13", "day:2026-02-15"])
        );
    }

    #[tokio::test]
    async fn index_duplicates_and_non_strings_are_dropped() {
        let (mem, store) = fixture();
        mem.set_many(vec![(
            INDEX_KEY.to_string(),
            json!(["2026-02-15", 7, "2026-02-14", "2026-02-15"]),
        )])
        .await
        .unwrap();
        assert_eq!(
            store.read_index().await.unwrap(),
            days(&["2026-02-15", "2026-02-14"])
        );
    }

    #[tokio::test]
    async fn writes_publish_storage_changes() {
        let (_mem, store) = fixture();
        let mut rx = store.subscribe();

        let bucket = DayBucket::from([("a.com".to_string(), 5)]);
        store
            .write_bucket_and_index("2026-02-15", &bucket, &days(&["2026-02-15"]))
            .await
            .unwrap();

        let change = rx.recv().await.unwrap();
        assert_eq!(change.keys, days(&["day:2026-02-15", "dayIndex"]));
    }

    #[tokio::test]
    async fn failed_write_surfaces_error() {
        let (mem, store) = fixture();
        mem.fail_writes(true);
        let err = store
            .write_bucket_and_index("2026-02-15", &DayBucket::new(), &days(&["2026-02-15"]))
            .await;
        assert!(err.is_err());
        assert!(store.read_index().await.unwrap().is_empty());
    }
}
