//! Single-owner loop: one task holds the `Tracker` and processes commands in
//! arrival order, so no two handlers or storage read-modify-writes interleave.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::accumulator::Credit;
use crate::browser::{BrowserMirror, MirrorUpdate};
use crate::calendar::LocalZone;
use crate::error::{Result, TrackerError};
use crate::retention::{DayBucket, DaysSnapshot, RetentionReport};
use crate::session::{FlushOutcome, Signal, TraceRow, Tracker, TrackerSnapshot};

const QUEUE_DEPTH: usize = 256;

enum Command {
    Signal {
        updates: Vec<MirrorUpdate>,
        signal: Signal,
        reply: oneshot::Sender<Result<()>>,
    },
    Startup {
        updates: Vec<MirrorUpdate>,
        reply: oneshot::Sender<Result<RetentionReport>>,
    },
    Flush(oneshot::Sender<Result<FlushOutcome>>),
    AddInterval {
        domain: String,
        start_ms: i64,
        end_ms: i64,
        reply: oneshot::Sender<Result<Vec<Credit>>>,
    },
    Days(oneshot::Sender<Result<DaysSnapshot>>),
    StoredKeys(oneshot::Sender<Result<Vec<String>>>),
    Today(oneshot::Sender<Result<(String, DayBucket)>>),
    Seed(Vec<u32>, oneshot::Sender<Result<Vec<String>>>),
    Reset(oneshot::Sender<Result<()>>),
    Snapshot(oneshot::Sender<TrackerSnapshot>),
    Trace(oneshot::Sender<Vec<TraceRow>>),
}

/// Cheap, cloneable sender side of the tracker loop.
#[derive(Clone)]
pub struct TrackerHandle {
    tx: mpsc::Sender<Command>,
}

pub fn spawn<Tz: LocalZone>(tracker: Tracker<Tz>) -> (TrackerHandle, JoinHandle<()>) {
    start(tracker, None)
}

/// Like [`spawn`], but the loop also owns writes to `mirror`: updates sent
/// with a signal are applied in queue order, right before that signal.
pub fn spawn_with_mirror<Tz: LocalZone>(
    tracker: Tracker<Tz>,
    mirror: Arc<BrowserMirror>,
) -> (TrackerHandle, JoinHandle<()>) {
    start(tracker, Some(mirror))
}

fn start<Tz: LocalZone>(
    tracker: Tracker<Tz>,
    mirror: Option<Arc<BrowserMirror>>,
) -> (TrackerHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
    let join = tokio::spawn(run(tracker, mirror, rx));
    (TrackerHandle { tx }, join)
}

async fn apply_updates(mirror: Option<&BrowserMirror>, updates: Vec<MirrorUpdate>) {
    if updates.is_empty() {
        return;
    }
    let Some(mirror) = mirror else {
        warn!("dropping {} mirror update(s): loop has no mirror", updates.len());
        return;
    };
    for update in updates {
        mirror.apply(update).await;
    }
}

async fn run<Tz: LocalZone>(
    mut tracker: Tracker<Tz>,
    mirror: Option<Arc<BrowserMirror>>,
    mut rx: mpsc::Receiver<Command>,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Signal {
                updates,
                signal,
                reply,
            } => {
                apply_updates(mirror.as_deref(), updates).await;
                let kind = signal.kind();
                let res = tracker.handle(signal).await;
                if let Err(e) = &res {
                    error!("{kind} failed: {e}");
                }
                let _ = reply.send(res);
            }
            Command::Startup { updates, reply } => {
                apply_updates(mirror.as_deref(), updates).await;
                let res = tracker.startup().await;
                match &res {
                    Ok(report) => info!(
                        "startup: {} day(s) kept, {} evicted",
                        report.kept.len(),
                        report.evicted.len()
                    ),
                    Err(e) => error!("startup failed: {e}"),
                }
                let _ = reply.send(res);
            }
            Command::Flush(reply) => {
                let res = tracker.flush().await;
                if let Err(e) = &res {
                    error!("flush failed: {e}");
                }
                let _ = reply.send(res);
            }
            Command::AddInterval {
                domain,
                start_ms,
                end_ms,
                reply,
            } => {
                let res = tracker.add_interval(&domain, start_ms, end_ms).await;
                let _ = reply.send(res);
            }
            Command::Days(reply) => {
                let _ = reply.send(tracker.store().snapshot().await);
            }
            Command::StoredKeys(reply) => {
                let _ = reply.send(tracker.store().stored_bucket_keys().await);
            }
            Command::Today(reply) => {
                let _ = reply.send(tracker.today().await);
            }
            Command::Seed(days_ago, reply) => {
                let _ = reply.send(tracker.seed_days_ago(&days_ago).await);
            }
            Command::Reset(reply) => {
                let _ = reply.send(tracker.store().reset().await);
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(tracker.snapshot());
            }
            Command::Trace(reply) => {
                let _ = reply.send(tracker.trace());
            }
        }
    }
    info!("tracker loop stopped");
}

impl TrackerHandle {
    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| TrackerError::Closed)?;
        rx.await.map_err(|_| TrackerError::Closed)
    }

    pub async fn signal(&self, signal: Signal) -> Result<()> {
        self.signal_with(Vec::new(), signal).await
    }

    /// Applies `updates` to the loop's mirror, then handles `signal`.
    pub async fn signal_with(&self, updates: Vec<MirrorUpdate>, signal: Signal) -> Result<()> {
        self.call(|reply| Command::Signal {
            updates,
            signal,
            reply,
        })
        .await?
    }

    pub async fn startup(&self) -> Result<RetentionReport> {
        self.startup_with(Vec::new()).await
    }

    pub async fn startup_with(&self, updates: Vec<MirrorUpdate>) -> Result<RetentionReport> {
        self.call(|reply| Command::Startup { updates, reply }).await?
    }

    pub async fn flush(&self) -> Result<FlushOutcome> {
        self.call(Command::Flush).await?
    }

    pub async fn add_interval(&self, domain: &str, start_ms: i64, end_ms: i64) -> Result<Vec<Credit>> {
        let domain = domain.to_string();
        self.call(|reply| Command::AddInterval {
            domain,
            start_ms,
            end_ms,
            reply,
        })
        .await?
    }

    pub async fn days(&self) -> Result<DaysSnapshot> {
        self.call(Command::Days).await?
    }

    pub async fn stored_keys(&self) -> Result<Vec<String>> {
        self.call(Command::StoredKeys).await?
    }

    pub async fn today(&self) -> Result<(String, DayBucket)> {
        self.call(Command::Today).await?
    }

    pub async fn seed_days_ago(&self, days_ago: Vec<u32>) -> Result<Vec<String>> {
        self.call(|r| Command::Seed(days_ago, r)).await?
    }

    pub async fn reset(&self) -> Result<()> {
        self.call(Command::Reset).await?
    }

    pub async fn snapshot(&self) -> Result<TrackerSnapshot> {
        self.call(Command::Snapshot).await
    }

    pub async fn trace(&self) -> Result<Vec<TraceRow>> {
        self.call(Command::Trace).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::{BrowserMirror, Tab};
    use crate::calendar::DayCalendar;
    use crate::clock::ManualClock;
    use crate::config::TrackerConfig;
    use crate::retention::RetentionStore;
    use crate::store::MemoryStore;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    const MIN: i64 = 60_000;

    #[tokio::test]
    async fn signals_are_processed_in_order() {
        let t0 = Utc.with_ymd_and_hms(2026, 2, 15, 10, 0, 0).unwrap().timestamp_millis();
        let mem = Arc::new(MemoryStore::new());
        let store = Arc::new(RetentionStore::new(mem.clone(), DayCalendar::new(Utc)));
        let mirror = Arc::new(BrowserMirror::new());
        let clock = Arc::new(ManualClock::new(t0));
        mirror
            .upsert_tab(Tab {
                id: 1,
                window_id: 1,
                url: Some("https://a.com".to_string()),
                active: true,
            })
            .await;
        mirror.focus(Some(1)).await;

        let tracker = Tracker::new(store, mirror, clock.clone(), TrackerConfig::default());
        let (handle, _join) = spawn(tracker);
        handle.startup().await.unwrap();

        clock.advance(2 * MIN);
        let flushed = handle.flush().await.unwrap();
        assert_eq!(flushed.credited_ms, (2 * MIN) as u64);

        handle
            .signal(Signal::TabRemoved { tab_id: 1 })
            .await
            .unwrap();
        let snap = handle.snapshot().await.unwrap();
        assert!(snap.session.is_idle());

        let days = handle.days().await.unwrap();
        assert_eq!(days.buckets["2026-02-15"]["a.com"], (2 * MIN) as u64);
        assert!(!handle.trace().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn mirror_updates_apply_in_queue_order() {
        let t0 = Utc.with_ymd_and_hms(2026, 2, 15, 10, 0, 0).unwrap().timestamp_millis();
        let store = Arc::new(RetentionStore::new(
            Arc::new(MemoryStore::new()),
            DayCalendar::new(Utc),
        ));
        let mirror = Arc::new(BrowserMirror::new());
        let clock = Arc::new(ManualClock::new(t0));
        let tracker = Tracker::new(store, mirror.clone(), clock, TrackerConfig::default());
        let (handle, _join) = spawn_with_mirror(tracker, mirror);

        let a = Tab {
            id: 1,
            window_id: 1,
            url: Some("https://a.com".to_string()),
            active: true,
        };
        let b = Tab {
            id: 2,
            url: Some("https://b.com".to_string()),
            ..a.clone()
        };
        handle
            .startup_with(vec![MirrorUpdate::Focus(Some(1))])
            .await
            .unwrap();

        // Both requests are queued before either runs; each activation must
        // see only the tab posted with it.
        let first = handle.signal_with(
            vec![MirrorUpdate::UpsertTab(a)],
            Signal::TabActivated {
                tab_id: 1,
                window_id: 1,
            },
        );
        let second = handle.signal_with(
            vec![MirrorUpdate::UpsertTab(b)],
            Signal::TabActivated {
                tab_id: 2,
                window_id: 1,
            },
        );
        let (r1, r2) = tokio::join!(first, second);
        r1.unwrap();
        r2.unwrap();

        let trace = handle.trace().await.unwrap();
        let started: Vec<String> = trace
            .iter()
            .filter(|r| r.evt == "start")
            .map(|r| r.detail["domain"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(started, vec!["a.com".to_string(), "b.com".to_string()]);
    }

    #[tokio::test]
    async fn storage_errors_reach_the_caller() {
        let mem = Arc::new(MemoryStore::new());
        let store = Arc::new(RetentionStore::new(mem.clone(), DayCalendar::new(Utc)));
        let tracker = Tracker::new(
            store,
            Arc::new(BrowserMirror::new()),
            Arc::new(ManualClock::new(0)),
            TrackerConfig::default(),
        );
        let (handle, _join) = spawn(tracker);

        mem.fail_writes(true);
        assert!(handle.startup().await.is_err());
        mem.fail_writes(false);
        assert!(handle.startup().await.is_ok());
    }
}
