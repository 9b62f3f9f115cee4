//! The browser as seen by the engine: tabs, windows and the three queries the
//! session machine needs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::error::Result;

pub type TabId = i64;
pub type WindowId = i64;

/// `windows.WINDOW_ID_NONE`: focus left every browser window.
pub const WINDOW_ID_NONE: WindowId = -1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tab {
    pub id: TabId,
    pub window_id: WindowId,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub id: WindowId,
    pub focused: bool,
}

/// A window and its tabs, as reported by a full browser snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSnapshot {
    pub id: WindowId,
    #[serde(default)]
    pub focused: bool,
    #[serde(default)]
    pub tabs: Vec<Tab>,
}

#[async_trait]
pub trait BrowserPlatform: Send + Sync {
    async fn get_tab(&self, tab_id: TabId) -> Result<Option<Tab>>;

    async fn active_tab(&self, window_id: WindowId) -> Result<Option<Tab>>;

    async fn last_focused_window(&self) -> Result<Option<Window>>;
}

/// One change to the mirror, carried through the tracker queue so it lands
/// right before the signal it came with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorUpdate {
    LoadSnapshot(Vec<WindowSnapshot>),
    UpsertTab(Tab),
    Activate { tab_id: TabId, window_id: WindowId },
    Focus(Option<WindowId>),
    RemoveTab(TabId),
}

#[derive(Debug, Default)]
struct MirrorState {
    tabs: HashMap<TabId, Tab>,
    focused: Option<WindowId>,
    last_focused: Option<WindowId>,
}

/// Local copy of browser tab/window state, fed from the payloads the
/// extension posts alongside each signal.
#[derive(Debug, Default)]
pub struct BrowserMirror {
    inner: Mutex<MirrorState>,
}

impl BrowserMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn apply(&self, update: MirrorUpdate) {
        match update {
            MirrorUpdate::LoadSnapshot(windows) => self.load_snapshot(&windows).await,
            MirrorUpdate::UpsertTab(tab) => self.upsert_tab(tab).await,
            MirrorUpdate::Activate { tab_id, window_id } => self.activate(tab_id, window_id).await,
            MirrorUpdate::Focus(window_id) => self.focus(window_id).await,
            MirrorUpdate::RemoveTab(tab_id) => self.remove_tab(tab_id).await,
        }
    }

    /// Replaces everything with a full snapshot.
    pub async fn load_snapshot(&self, windows: &[WindowSnapshot]) {
        let mut st = self.inner.lock().await;
        st.tabs.clear();
        st.focused = None;
        for w in windows {
            for t in &w.tabs {
                let mut tab = t.clone();
                tab.window_id = w.id;
                st.tabs.insert(tab.id, tab);
            }
            if w.focused {
                st.focused = Some(w.id);
                st.last_focused = Some(w.id);
            }
        }
        if st.last_focused.is_none() {
            st.last_focused = windows.first().map(|w| w.id);
        }
    }

    pub async fn upsert_tab(&self, tab: Tab) {
        let mut st = self.inner.lock().await;
        if tab.active {
            deactivate_window(&mut st, tab.window_id, tab.id);
        }
        st.tabs.insert(tab.id, tab);
    }

    pub async fn activate(&self, tab_id: TabId, window_id: WindowId) {
        let mut st = self.inner.lock().await;
        deactivate_window(&mut st, window_id, tab_id);
        let entry = st.tabs.entry(tab_id).or_insert(Tab {
            id: tab_id,
            window_id,
            url: None,
            active: true,
        });
        entry.window_id = window_id;
        entry.active = true;
    }

    pub async fn set_url(&self, tab_id: TabId, url: &str) {
        let mut st = self.inner.lock().await;
        if let Some(tab) = st.tabs.get_mut(&tab_id) {
            tab.url = Some(url.to_string());
        }
    }

    pub async fn remove_tab(&self, tab_id: TabId) {
        self.inner.lock().await.tabs.remove(&tab_id);
    }

    /// `None` means focus left the browser.
    pub async fn focus(&self, window_id: Option<WindowId>) {
        let mut st = self.inner.lock().await;
        st.focused = window_id;
        if window_id.is_some() {
            st.last_focused = window_id;
        }
    }
}

fn deactivate_window(st: &mut MirrorState, window_id: WindowId, except: TabId) {
    for t in st.tabs.values_mut() {
        if t.window_id == window_id && t.id != except {
            t.active = false;
        }
    }
}

#[async_trait]
impl BrowserPlatform for BrowserMirror {
    async fn get_tab(&self, tab_id: TabId) -> Result<Option<Tab>> {
        Ok(self.inner.lock().await.tabs.get(&tab_id).cloned())
    }

    async fn active_tab(&self, window_id: WindowId) -> Result<Option<Tab>> {
        let st = self.inner.lock().await;
        Ok(st
            .tabs
            .values()
            .find(|t| t.window_id == window_id && t.active)
            .cloned())
    }

    async fn last_focused_window(&self) -> Result<Option<Window>> {
        let st = self.inner.lock().await;
        Ok(st.last_focused.map(|id| Window {
            id,
            focused: st.focused == Some(id),
        }))
    }
}
