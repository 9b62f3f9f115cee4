//! Session state machine.
//!
//! One `Tracker` owns the single active session (tab, window, domain, start)
//! and reacts to browser signals. Every handler runs to completion before the
//! next one starts; `dispatch` guarantees that by owning the tracker inside a
//! single task.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::accumulator::{self, Credit};
use crate::browser::{BrowserPlatform, Tab, TabId, WindowId};
use crate::calendar::LocalZone;
use crate::classify::{classify, Classification};
use crate::clock::Clock;
use crate::config::TrackerConfig;
use crate::error::Result;
use crate::retention::{DayBucket, RetentionReport, RetentionStore};

const SEED_DOMAIN: &str = "example.com";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub tab_id: TabId,
    pub window_id: WindowId,
    pub domain: String,
    pub started_at_ms: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    Active(Session),
}

impl SessionState {
    pub fn session(&self) -> Option<&Session> {
        match self {
            SessionState::Idle => None,
            SessionState::Active(s) => Some(s),
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, SessionState::Idle)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdleState {
    Active,
    Idle,
    Locked,
}

/// Inbound browser signals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    TabActivated {
        tab_id: TabId,
        window_id: WindowId,
    },
    TabUpdated {
        tab_id: TabId,
        url: Option<String>,
        tab: Tab,
    },
    /// `None`: every browser window lost focus.
    WindowFocusChanged { window_id: Option<WindowId> },
    TabRemoved { tab_id: TabId },
    IdleStateChanged(IdleState),
}

impl Signal {
    pub fn kind(&self) -> &'static str {
        match self {
            Signal::TabActivated { .. } => "tab_activated",
            Signal::TabUpdated { .. } => "tab_updated",
            Signal::WindowFocusChanged { .. } => "window_focus_changed",
            Signal::TabRemoved { .. } => "tab_removed",
            Signal::IdleStateChanged(_) => "idle_state_changed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeReason {
    TabSwitch,
    BecameUntrackable,
    DomainChange,
    LostFocus,
    FocusChanged,
    TabClosed,
    UserIdle,
    Restart,
}

impl FinalizeReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FinalizeReason::TabSwitch => "tab switch",
            FinalizeReason::BecameUntrackable => "became untrackable",
            FinalizeReason::DomainChange => "domain change",
            FinalizeReason::LostFocus => "lost focus",
            FinalizeReason::FocusChanged => "focus changed",
            FinalizeReason::TabClosed => "tab closed",
            FinalizeReason::UserIdle => "user idle",
            FinalizeReason::Restart => "restart",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceRow {
    pub t: i64,
    pub evt: &'static str,
    pub detail: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerSnapshot {
    pub session: SessionState,
    pub browser_focused: bool,
    pub user_idle: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushOutcome {
    pub credited_ms: u64,
    pub credits: Vec<Credit>,
}

pub struct Tracker<Tz: LocalZone> {
    state: SessionState,
    browser_focused: bool,
    user_idle: bool,
    store: Arc<RetentionStore<Tz>>,
    browser: Arc<dyn BrowserPlatform>,
    clock: Arc<dyn Clock>,
    trace: VecDeque<TraceRow>,
    trace_capacity: usize,
}

impl<Tz: LocalZone> Tracker<Tz> {
    pub fn new(
        store: Arc<RetentionStore<Tz>>,
        browser: Arc<dyn BrowserPlatform>,
        clock: Arc<dyn Clock>,
        config: TrackerConfig,
    ) -> Self {
        let config = config.normalized();
        Self {
            state: SessionState::Idle,
            browser_focused: true,
            user_idle: false,
            store,
            browser,
            clock,
            trace: VecDeque::with_capacity(config.trace_capacity),
            trace_capacity: config.trace_capacity,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn store(&self) -> &Arc<RetentionStore<Tz>> {
        &self.store
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        TrackerSnapshot {
            session: self.state.clone(),
            browser_focused: self.browser_focused,
            user_idle: self.user_idle,
        }
    }

    pub fn trace(&self) -> Vec<TraceRow> {
        self.trace.iter().cloned().collect()
    }

    /// Process start (or browser startup/install): retention pass, then resume
    /// from the last-focused window if it still has focus.
    pub async fn startup(&mut self) -> Result<RetentionReport> {
        self.finalize(FinalizeReason::Restart).await?;
        let report = self.store.initialize(self.clock.now_ms()).await?;
        self.user_idle = false;

        let window = self.browser.last_focused_window().await?;
        self.record("startup", json!({ "window": window.map(|w| w.id) }));
        match window {
            Some(w) if w.focused => {
                self.browser_focused = true;
                self.resume_from_window(w.id).await?;
            }
            _ => self.browser_focused = false,
        }
        Ok(report)
    }

    pub async fn handle(&mut self, signal: Signal) -> Result<()> {
        self.record("signal", json!({ "kind": signal.kind() }));
        match signal {
            Signal::TabActivated { tab_id, window_id } => {
                self.on_tab_activated(tab_id, window_id).await
            }
            Signal::TabUpdated { tab_id, url, tab } => self.on_tab_updated(tab_id, url, tab).await,
            Signal::WindowFocusChanged { window_id } => self.on_focus_changed(window_id).await,
            Signal::TabRemoved { tab_id } => self.on_tab_removed(tab_id).await,
            Signal::IdleStateChanged(idle) => self.on_idle_changed(idle).await,
        }
    }

    async fn on_tab_activated(&mut self, tab_id: TabId, window_id: WindowId) -> Result<()> {
        self.finalize(FinalizeReason::TabSwitch).await?;
        match self.browser.get_tab(tab_id).await? {
            Some(tab) => {
                self.try_start(&tab);
            }
            None => self.record(
                "start_blocked",
                json!({ "why": "unknown tab", "tabId": tab_id, "windowId": window_id }),
            ),
        }
        Ok(())
    }

    async fn on_tab_updated(&mut self, tab_id: TabId, url: Option<String>, tab: Tab) -> Result<()> {
        let Some(url) = url.filter(|u| !u.is_empty()) else {
            return Ok(());
        };
        let Some(domain) = classify(&url).into_domain() else {
            return self.finalize(FinalizeReason::BecameUntrackable).await;
        };
        let tracked = self.state.session().map(|s| s.domain.clone());
        let tab = Tab {
            id: tab_id,
            url: Some(url),
            ..tab
        };

        match tracked {
            Some(current) if current != domain => {
                self.finalize(FinalizeReason::DomainChange).await?;
                self.try_start(&tab);
            }
            Some(_) => {}
            // Recovers tracking when the active tab leaves an untrackable page.
            None if tab.active => {
                self.try_start(&tab);
            }
            None => {}
        }
        Ok(())
    }

    async fn on_focus_changed(&mut self, window_id: Option<WindowId>) -> Result<()> {
        match window_id {
            None => {
                self.browser_focused = false;
                self.finalize(FinalizeReason::LostFocus).await
            }
            Some(w) => {
                self.browser_focused = true;
                self.finalize(FinalizeReason::FocusChanged).await?;
                self.resume_from_window(w).await
            }
        }
    }

    async fn on_tab_removed(&mut self, tab_id: TabId) -> Result<()> {
        if self.state.session().is_some_and(|s| s.tab_id == tab_id) {
            self.finalize(FinalizeReason::TabClosed).await?;
        }
        Ok(())
    }

    async fn on_idle_changed(&mut self, idle: IdleState) -> Result<()> {
        match idle {
            IdleState::Idle | IdleState::Locked => {
                self.user_idle = true;
                self.finalize(FinalizeReason::UserIdle).await
            }
            IdleState::Active => {
                self.user_idle = false;
                if !self.state.is_idle() || !self.browser_focused {
                    return Ok(());
                }
                match self.browser.last_focused_window().await? {
                    Some(w) if w.focused => self.resume_from_window(w.id).await,
                    _ => Ok(()),
                }
            }
        }
    }

    /// Checkpoint: commits the elapsed time and keeps the session running from
    /// now. A no-op while idle.
    pub async fn flush(&mut self) -> Result<FlushOutcome> {
        let Some(session) = self.state.session().cloned() else {
            return Ok(FlushOutcome::default());
        };
        let now = self.clock.now_ms();
        let credits = accumulator::add_interval(
            &self.store,
            &session.domain,
            session.started_at_ms,
            now,
            now,
        )
        .await?;

        if let SessionState::Active(s) = &mut self.state {
            s.started_at_ms = s.started_at_ms.max(now);
        }
        let credited_ms = credits.iter().map(|c| c.ms).sum();
        self.record(
            "checkpoint",
            json!({ "domain": session.domain, "deltaMs": credited_ms }),
        );
        Ok(FlushOutcome {
            credited_ms,
            credits,
        })
    }

    /// Credits an arbitrary interval without touching the session.
    pub async fn add_interval(
        &mut self,
        domain: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Credit>> {
        let now = self.clock.now_ms();
        accumulator::add_interval(&self.store, domain, start_ms, end_ms, now).await
    }

    /// Today's day-key and bucket.
    pub async fn today(&self) -> Result<(String, DayBucket)> {
        let day = self.store.calendar().day_key(self.clock.now_ms());
        let bucket = self.store.read_bucket(&day).await?;
        Ok((day, bucket))
    }

    /// Seeds one bucket per entry of `days_ago` with a recognizable
    /// `example.com` total, bypassing retention so eviction can be observed.
    pub async fn seed_days_ago(&mut self, days_ago: &[u32]) -> Result<Vec<String>> {
        let now = self.clock.now_ms();
        let calendar = self.store.calendar();
        let days = days_ago
            .iter()
            .map(|d| {
                let bucket = DayBucket::from([(
                    SEED_DOMAIN.to_string(),
                    u64::from(*d) * 1000 + 123,
                )]);
                (calendar.day_key_days_ago(now, *d), bucket)
            })
            .collect();
        let index = self.store.seed(days).await?;
        self.record("seed", json!({ "days": index }));
        Ok(index)
    }

    /// Ends the session and commits its time. The session is cleared before
    /// the write, so a failed write loses the interval but never leaves a
    /// stale session behind.
    async fn finalize(&mut self, reason: FinalizeReason) -> Result<()> {
        let SessionState::Active(session) = std::mem::take(&mut self.state) else {
            return Ok(());
        };
        let now = self.clock.now_ms();
        let delta = now - session.started_at_ms;
        debug!(
            "finalize ({}): {} for {}ms",
            reason.as_str(),
            session.domain,
            delta.max(0)
        );
        self.record(
            "finalize",
            json!({ "reason": reason.as_str(), "domain": session.domain, "deltaMs": delta }),
        );

        if let Err(e) =
            accumulator::add_interval(&self.store, &session.domain, session.started_at_ms, now, now)
                .await
        {
            warn!(
                "dropping {}ms for {} after failed write: {e}",
                delta.max(0),
                session.domain
            );
            return Err(e);
        }
        Ok(())
    }

    async fn resume_from_window(&mut self, window_id: WindowId) -> Result<()> {
        if !self.browser_focused || self.user_idle {
            return Ok(());
        }
        if let Some(tab) = self.browser.active_tab(window_id).await? {
            self.try_start(&tab);
        }
        Ok(())
    }

    /// Starts a session for `tab` when the browser is focused, the user is
    /// present and the tab's URL is trackable.
    fn try_start(&mut self, tab: &Tab) -> bool {
        let blocked = if !self.browser_focused {
            Some("not focused")
        } else if self.user_idle {
            Some("idle")
        } else {
            None
        };
        if let Some(why) = blocked {
            self.record("start_blocked", json!({ "why": why, "tabId": tab.id }));
            return false;
        }
        let Some(url) = tab.url.as_deref().filter(|u| !u.is_empty()) else {
            self.record("start_blocked", json!({ "why": "no url", "tabId": tab.id }));
            return false;
        };
        let Some(domain) = classify(url).into_domain() else {
            self.record("start_blocked", json!({ "why": "untrackable", "tabId": tab.id }));
            return false;
        };

        let started_at_ms = self.clock.now_ms();
        debug!("session start: {domain} (tab {})", tab.id);
        self.record("start", json!({ "domain": domain, "tabId": tab.id }));
        self.state = SessionState::Active(Session {
            tab_id: tab.id,
            window_id: tab.window_id,
            domain,
            started_at_ms,
        });
        true
    }

    fn record(&mut self, evt: &'static str, detail: Value) {
        if self.trace.len() >= self.trace_capacity {
            self.trace.pop_front();
        }
        self.trace.push_back(TraceRow {
            t: self.clock.now_ms(),
            evt,
            detail,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::BrowserMirror;
    use crate::calendar::DayCalendar;
    use crate::clock::ManualClock;
    use crate::store::{KeyValueStore, MemoryStore};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    const MIN: i64 = 60_000;

    struct Harness {
        mem: Arc<MemoryStore>,
        mirror: Arc<BrowserMirror>,
        clock: Arc<ManualClock>,
        tracker: Tracker<Utc>,
    }

    fn at(y: i32, m: u32, d: u32, h: u32, mi: u32) -> i64 {
        Utc.with_ymd_and_hms(y, m, d, h, mi, 0).unwrap().timestamp_millis()
    }

    fn tab(id: TabId, window_id: WindowId, url: &str) -> Tab {
        Tab {
            id,
            window_id,
            url: Some(url.to_string()),
            active: true,
        }
    }

    fn harness(now: i64) -> Harness {
        let mem = Arc::new(MemoryStore::new());
        let store = Arc::new(RetentionStore::new(mem.clone(), DayCalendar::new(Utc)));
        let mirror = Arc::new(BrowserMirror::new());
        let clock = Arc::new(ManualClock::new(now));
        let tracker = Tracker::new(
            store,
            mirror.clone(),
            clock.clone(),
            TrackerConfig::default(),
        );
        Harness {
            mem,
            mirror,
            clock,
            tracker,
        }
    }

    /// Window 1 focused with `url` in its active tab 7, tracker started.
    async fn active_on(url: &str, now: i64) -> Harness {
        let mut h = harness(now);
        h.mirror.upsert_tab(tab(7, 1, url)).await;
        h.mirror.focus(Some(1)).await;
        h.tracker.startup().await.unwrap();
        h
    }

    async fn bucket(h: &Harness, day: &str) -> Option<Value> {
        h.mem.get(&format!("day:{day}")).await.unwrap()
    }

    #[tokio::test]
    async fn startup_resumes_focused_window() {
        let t0 = at(2026, 2, 15, 10, 0);
        let h = active_on("https://mail.google.com/inbox", t0).await;
        assert_eq!(
            h.tracker.state(),
            &SessionState::Active(Session {
                tab_id: 7,
                window_id: 1,
                domain: "google.com".to_string(),
                started_at_ms: t0,
            })
        );
    }

    #[tokio::test]
    async fn startup_without_focus_stays_idle() {
        let mut h = harness(at(2026, 2, 15, 10, 0));
        h.mirror.upsert_tab(tab(7, 1, "https://a.com")).await;
        h.mirror.focus(Some(1)).await;
        h.mirror.focus(None).await;

        h.tracker.startup().await.unwrap();
        assert!(h.tracker.state().is_idle());
        assert!(!h.tracker.snapshot().browser_focused);
        assert_eq!(bucket(&h, "2026-02-15").await, Some(json!({})));
    }

    #[tokio::test]
    async fn unfocused_browser_blocks_activation() {
        let mut h = active_on("https://a.com", at(2026, 2, 15, 10, 0)).await;
        h.tracker
            .handle(Signal::WindowFocusChanged { window_id: None })
            .await
            .unwrap();
        h.mirror.upsert_tab(tab(8, 1, "https://b.com")).await;

        h.tracker
            .handle(Signal::TabActivated {
                tab_id: 8,
                window_id: 1,
            })
            .await
            .unwrap();
        assert!(h.tracker.state().is_idle());
        assert!(h
            .tracker
            .trace()
            .iter()
            .any(|r| r.evt == "start_blocked" && r.detail["why"] == "not focused"));
    }

    #[tokio::test]
    async fn domain_change_credits_old_domain_and_starts_new() {
        let t0 = at(2026, 2, 15, 10, 0);
        let mut h = active_on("https://a.com/", t0).await;

        let t1 = t0 + 5 * MIN;
        h.clock.set(t1);
        h.tracker
            .handle(Signal::TabUpdated {
                tab_id: 7,
                url: Some("https://b.com/page".to_string()),
                tab: tab(7, 1, "https://b.com/page"),
            })
            .await
            .unwrap();

        assert_eq!(bucket(&h, "2026-02-15").await, Some(json!({"a.com": 5 * MIN})));
        let s = h.tracker.state().session().unwrap();
        assert_eq!(s.domain, "b.com");
        assert_eq!(s.started_at_ms, t1);
    }

    #[tokio::test]
    async fn same_domain_navigation_keeps_session() {
        let t0 = at(2026, 2, 15, 10, 0);
        let mut h = active_on("https://www.a.com/", t0).await;
        h.clock.advance(MIN);
        h.tracker
            .handle(Signal::TabUpdated {
                tab_id: 7,
                url: Some("https://docs.a.com/x".to_string()),
                tab: tab(7, 1, "https://docs.a.com/x"),
            })
            .await
            .unwrap();
        assert_eq!(h.tracker.state().session().unwrap().started_at_ms, t0);
    }

    #[tokio::test]
    async fn untrackable_navigation_ends_then_recovers() {
        let t0 = at(2026, 2, 15, 10, 0);
        let mut h = active_on("https://a.com/", t0).await;

        h.clock.advance(2 * MIN);
        h.tracker
            .handle(Signal::TabUpdated {
                tab_id: 7,
                url: Some("about:blank".to_string()),
                tab: tab(7, 1, "about:blank"),
            })
            .await
            .unwrap();
        assert!(h.tracker.state().is_idle());
        assert_eq!(bucket(&h, "2026-02-15").await, Some(json!({"a.com": 2 * MIN})));

        h.clock.advance(MIN);
        h.tracker
            .handle(Signal::TabUpdated {
                tab_id: 7,
                url: Some("https://c.org/".to_string()),
                tab: tab(7, 1, "https://c.org/"),
            })
            .await
            .unwrap();
        assert_eq!(h.tracker.state().session().unwrap().domain, "c.org");
    }

    #[tokio::test]
    async fn background_untrackable_navigation_ends_session() {
        let t0 = at(2026, 2, 15, 10, 0);
        let mut h = active_on("https://a.com/", t0).await;

        h.clock.advance(3 * MIN);
        let mut background = tab(9, 1, "about:blank");
        background.active = false;
        h.tracker
            .handle(Signal::TabUpdated {
                tab_id: 9,
                url: Some("about:blank".to_string()),
                tab: background,
            })
            .await
            .unwrap();

        assert!(h.tracker.state().is_idle());
        assert_eq!(bucket(&h, "2026-02-15").await, Some(json!({"a.com": 3 * MIN})));
        assert!(h
            .tracker
            .trace()
            .iter()
            .any(|r| r.evt == "finalize" && r.detail["reason"] == "became untrackable"));
    }

    #[tokio::test]
    async fn background_domain_change_moves_session_to_that_tab() {
        let t0 = at(2026, 2, 15, 10, 0);
        let mut h = active_on("https://a.com/", t0).await;

        let t1 = t0 + 4 * MIN;
        h.clock.set(t1);
        let mut background = tab(9, 1, "https://b.com/");
        background.active = false;
        h.tracker
            .handle(Signal::TabUpdated {
                tab_id: 9,
                url: Some("https://b.com/".to_string()),
                tab: background,
            })
            .await
            .unwrap();

        assert_eq!(bucket(&h, "2026-02-15").await, Some(json!({"a.com": 4 * MIN})));
        let s = h.tracker.state().session().unwrap();
        assert_eq!((s.tab_id, s.domain.as_str(), s.started_at_ms), (9, "b.com", t1));
    }

    #[tokio::test]
    async fn background_navigation_does_not_start_from_idle() {
        let mut h = harness(at(2026, 2, 15, 10, 0));
        h.mirror.focus(Some(1)).await;
        h.tracker.startup().await.unwrap();
        assert!(h.tracker.state().is_idle());

        let mut background = tab(9, 1, "https://b.com/");
        background.active = false;
        h.tracker
            .handle(Signal::TabUpdated {
                tab_id: 9,
                url: Some("https://b.com/".to_string()),
                tab: background,
            })
            .await
            .unwrap();
        assert!(h.tracker.state().is_idle());
    }

    #[tokio::test]
    async fn manual_interval_with_extreme_bounds_stays_in_window() {
        let mut h = harness(at(2026, 2, 15, 10, 0));
        assert!(h.tracker.add_interval("a.com", i64::MIN, 0).await.unwrap().is_empty());

        let credits = h.tracker.add_interval("a.com", 0, i64::MAX).await.unwrap();
        assert_eq!(credits.len(), 7);
        assert_eq!(bucket(&h, "1970-01-01").await, None);
        assert_eq!(h.tracker.today().await.unwrap().0, "2026-02-15");
    }

    #[tokio::test]
    async fn updates_without_url_are_ignored() {
        let mut h = active_on("https://a.com/", at(2026, 2, 15, 10, 0)).await;
        h.tracker
            .handle(Signal::TabUpdated {
                tab_id: 7,
                url: None,
                tab: tab(7, 1, "https://a.com/"),
            })
            .await
            .unwrap();
        assert!(!h.tracker.state().is_idle());
    }

    #[tokio::test]
    async fn tab_switch_finalizes_and_starts_new_tab() {
        let t0 = at(2026, 2, 15, 10, 0);
        let mut h = active_on("https://a.com/", t0).await;
        h.mirror.upsert_tab(tab(8, 1, "https://b.com/")).await;

        h.clock.advance(3 * MIN);
        h.tracker
            .handle(Signal::TabActivated {
                tab_id: 8,
                window_id: 1,
            })
            .await
            .unwrap();

        assert_eq!(bucket(&h, "2026-02-15").await, Some(json!({"a.com": 3 * MIN})));
        assert_eq!(h.tracker.state().session().unwrap().tab_id, 8);
    }

    #[tokio::test]
    async fn focus_moves_to_other_window() {
        let t0 = at(2026, 2, 15, 10, 0);
        let mut h = active_on("https://a.com/", t0).await;
        h.mirror.upsert_tab(tab(20, 2, "https://b.com/")).await;

        h.clock.advance(MIN);
        h.tracker
            .handle(Signal::WindowFocusChanged { window_id: Some(2) })
            .await
            .unwrap();

        assert_eq!(bucket(&h, "2026-02-15").await, Some(json!({"a.com": MIN})));
        let s = h.tracker.state().session().unwrap();
        assert_eq!((s.tab_id, s.window_id, s.domain.as_str()), (20, 2, "b.com"));
    }

    #[tokio::test]
    async fn closing_tracked_tab_finalizes_but_others_do_not() {
        let mut h = active_on("https://a.com/", at(2026, 2, 15, 10, 0)).await;
        h.tracker
            .handle(Signal::TabRemoved { tab_id: 99 })
            .await
            .unwrap();
        assert!(!h.tracker.state().is_idle());

        h.clock.advance(MIN);
        h.tracker
            .handle(Signal::TabRemoved { tab_id: 7 })
            .await
            .unwrap();
        assert!(h.tracker.state().is_idle());
        assert_eq!(bucket(&h, "2026-02-15").await, Some(json!({"a.com": MIN})));
    }

    #[tokio::test]
    async fn finalize_when_idle_writes_nothing() {
        let mut h = harness(at(2026, 2, 15, 10, 0));
        h.tracker.startup().await.unwrap();
        let writes = h.mem.write_count();

        h.tracker
            .handle(Signal::WindowFocusChanged { window_id: None })
            .await
            .unwrap();
        h.tracker
            .handle(Signal::IdleStateChanged(IdleState::Locked))
            .await
            .unwrap();
        assert_eq!(h.mem.write_count(), writes);
        assert!(h.tracker.state().is_idle());
    }

    #[tokio::test]
    async fn flush_is_a_checkpoint() {
        let t0 = at(2026, 2, 15, 10, 0);
        let mut h = active_on("https://a.com/", t0).await;

        h.clock.advance(4 * MIN);
        let first = h.tracker.flush().await.unwrap();
        assert_eq!(first.credited_ms, (4 * MIN) as u64);

        let second = h.tracker.flush().await.unwrap();
        assert_eq!(second.credited_ms, 0);

        let s = h.tracker.state().session().unwrap();
        assert_eq!(s.started_at_ms, t0 + 4 * MIN);
        assert_eq!(bucket(&h, "2026-02-15").await, Some(json!({"a.com": 4 * MIN})));
    }

    #[tokio::test]
    async fn flush_while_idle_is_a_noop() {
        let mut h = harness(at(2026, 2, 15, 10, 0));
        let out = h.tracker.flush().await.unwrap();
        assert_eq!(out, FlushOutcome::default());
        assert_eq!(h.mem.write_count(), 0);
    }

    #[tokio::test]
    async fn cross_midnight_session() {
        let t0 = at(2026, 2, 15, 23, 50);
        let mut h = active_on("https://a.com/", t0).await;

        h.clock.set(at(2026, 2, 16, 0, 10));
        h.tracker
            .handle(Signal::TabRemoved { tab_id: 7 })
            .await
            .unwrap();

        assert_eq!(bucket(&h, "2026-02-15").await, Some(json!({"a.com": 10 * MIN})));
        assert_eq!(bucket(&h, "2026-02-16").await, Some(json!({"a.com": 10 * MIN})));
        let index = h.tracker.store().read_index().await.unwrap();
        assert!(index.contains(&"2026-02-15".to_string()));
        assert!(index.contains(&"2026-02-16".to_string()));
    }

    #[tokio::test]
    async fn failed_write_still_clears_session() {
        let mut h = active_on("https://a.com/", at(2026, 2, 15, 10, 0)).await;
        h.clock.advance(MIN);
        h.mem.fail_writes(true);

        let res = h.tracker.handle(Signal::TabRemoved { tab_id: 7 }).await;
        assert!(res.is_err());
        assert!(h.tracker.state().is_idle());
    }

    #[tokio::test]
    async fn failed_flush_keeps_start() {
        let t0 = at(2026, 2, 15, 10, 0);
        let mut h = active_on("https://a.com/", t0).await;
        h.clock.advance(MIN);
        h.mem.fail_writes(true);

        assert!(h.tracker.flush().await.is_err());
        assert_eq!(h.tracker.state().session().unwrap().started_at_ms, t0);
    }

    #[tokio::test]
    async fn idle_pauses_and_active_resumes() {
        let t0 = at(2026, 2, 15, 10, 0);
        let mut h = active_on("https://a.com/", t0).await;

        h.clock.advance(MIN);
        h.tracker
            .handle(Signal::IdleStateChanged(IdleState::Idle))
            .await
            .unwrap();
        assert!(h.tracker.state().is_idle());

        // Activation while idle is gated.
        h.tracker
            .handle(Signal::TabActivated {
                tab_id: 7,
                window_id: 1,
            })
            .await
            .unwrap();
        assert!(h.tracker.state().is_idle());

        h.clock.advance(10 * MIN);
        h.tracker
            .handle(Signal::IdleStateChanged(IdleState::Active))
            .await
            .unwrap();
        let s = h.tracker.state().session().unwrap();
        assert_eq!(s.started_at_ms, t0 + 11 * MIN);
        assert_eq!(bucket(&h, "2026-02-15").await, Some(json!({"a.com": MIN})));
    }

    #[tokio::test]
    async fn seeded_history_is_evicted_on_next_write() {
        let t0 = at(2026, 2, 15, 10, 0);
        let mut h = active_on("https://a.com/", t0).await;
        let index = h.tracker.seed_days_ago(&[1, 6, 7, 20]).await.unwrap();
        assert!(index.contains(&"2026-01-26".to_string()));
        assert_eq!(bucket(&h, "2026-02-08").await, Some(json!({"example.com": 7123})));

        h.clock.advance(MIN);
        h.tracker.flush().await.unwrap();

        let mut kept = h.tracker.store().read_index().await.unwrap();
        kept.sort();
        assert_eq!(kept, vec!["2026-02-09", "2026-02-14", "2026-02-15"]);
        assert_eq!(bucket(&h, "2026-02-08").await, None);
        assert_eq!(bucket(&h, "2026-01-26").await, None);

        let (day, today) = h.tracker.today().await.unwrap();
        assert_eq!(day, "2026-02-15");
        assert_eq!(today.get("a.com"), Some(&(MIN as u64)));
    }

    #[tokio::test]
    async fn trace_is_bounded() {
        let mem = Arc::new(MemoryStore::new());
        let store = Arc::new(RetentionStore::new(mem, DayCalendar::new(Utc)));
        let mut tracker = Tracker::new(
            store,
            Arc::new(BrowserMirror::new()),
            Arc::new(ManualClock::new(0)),
            TrackerConfig {
                trace_capacity: 3,
                ..TrackerConfig::default()
            },
        );
        for id in 0..10 {
            tracker
                .handle(Signal::TabRemoved { tab_id: id })
                .await
                .unwrap();
        }
        assert_eq!(tracker.trace().len(), 3);
    }
}
