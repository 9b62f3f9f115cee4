//! HTTP bridge between the browser extension and the tracker loop.
//!
//! The extension forwards each browser event to `POST /signal`, carrying the
//! tab object where it has one; the tracker loop applies the payload to the
//! `BrowserMirror` right before the signal reaches the session machine.

use axum::{
    extract::{Query, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::cors::CorsLayer;

use crate::browser::{MirrorUpdate, Tab, TabId, WindowId, WindowSnapshot, WINDOW_ID_NONE};
use crate::dispatch::TrackerHandle;
use crate::error::TrackerError;
use crate::report::{self, DEFAULT_MIN_MS, DEFAULT_TOP_N};
use crate::retention::DayBucket;
use crate::session::{IdleState, Signal};

pub const FLUSH_MESSAGE: &str = "FLUSH_SESSION";

#[derive(Clone)]
pub struct AppState {
    pub tracker: TrackerHandle,
}

#[derive(Serialize)]
struct OkResponse<T: Serialize> {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

#[derive(Serialize)]
struct ErrResponse {
    ok: bool,
    error: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ChangeInfo {
    #[serde(default)]
    pub url: Option<String>,
}

/// What the extension posts for each browser event.
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalPayload {
    TabActivated {
        #[serde(rename = "tabId")]
        tab_id: TabId,
        #[serde(rename = "windowId")]
        window_id: WindowId,
        #[serde(default)]
        tab: Option<Tab>,
    },
    TabUpdated {
        #[serde(rename = "tabId")]
        tab_id: TabId,
        #[serde(rename = "changeInfo", default)]
        change_info: ChangeInfo,
        tab: Tab,
    },
    WindowFocusChanged {
        #[serde(rename = "windowId")]
        window_id: WindowId,
    },
    TabRemoved {
        #[serde(rename = "tabId")]
        tab_id: TabId,
    },
    IdleStateChanged {
        state: IdleState,
    },
    Startup {
        #[serde(default)]
        windows: Vec<WindowSnapshot>,
    },
    Installed {
        #[serde(default)]
        windows: Vec<WindowSnapshot>,
    },
}

#[derive(Debug, Deserialize)]
struct ExtensionMessage {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Deserialize)]
struct TraceQuery {
    #[serde(default = "default_trace_limit")]
    limit: usize,
}

fn default_trace_limit() -> usize {
    50
}

#[derive(Deserialize)]
struct ReportQuery {
    #[serde(default = "default_top")]
    top: usize,
    #[serde(default = "default_min_ms")]
    min_ms: u64,
    #[serde(default)]
    domain: Option<String>,
}

fn default_top() -> usize {
    DEFAULT_TOP_N
}

fn default_min_ms() -> u64 {
    DEFAULT_MIN_MS
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddIntervalRequest {
    domain: String,
    start_ms: i64,
    end_ms: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SeedRequest {
    #[serde(default = "default_seed_days")]
    days_ago: Vec<u32>,
}

fn default_seed_days() -> Vec<u32> {
    vec![0, 1, 2, 3, 4, 5, 6, 7, 10, 20]
}

#[derive(Serialize)]
struct TodayView {
    day: String,
    bucket: DayBucket,
}

#[derive(Serialize)]
struct HealthInfo {
    service: &'static str,
    version: &'static str,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(HeaderValue::from_static("*"))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(health))
        .route("/signal", post(post_signal).options(options_ok))
        .route("/message", post(post_message).options(options_ok))
        .route("/flush", post(post_flush).options(options_ok))
        .route("/days", get(get_days))
        .route("/days/today", get(get_today))
        .route("/keys", get(get_keys))
        .route("/state", get(get_state))
        .route("/trace", get(get_trace))
        .route("/report", get(get_report))
        .route("/export/csv", get(get_export_csv))
        .route("/dev/add_interval", post(post_add_interval).options(options_ok))
        .route("/dev/seed_days", post(post_seed_days).options(options_ok))
        .route("/dev/reset", post(post_reset).options(options_ok))
        .with_state(state)
        .layer(cors)
}

fn ok<T: Serialize>(data: T) -> Response {
    Json(OkResponse {
        ok: true,
        data: Some(data),
    })
    .into_response()
}

fn err(status: StatusCode, error: impl Into<String>) -> Response {
    (
        status,
        Json(ErrResponse {
            ok: false,
            error: error.into(),
        }),
    )
        .into_response()
}

fn tracker_err(e: TrackerError) -> Response {
    let status = match e {
        TrackerError::Closed => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    err(status, e.to_string())
}

async fn options_ok() -> impl IntoResponse {
    StatusCode::OK
}

async fn health() -> impl IntoResponse {
    ok(HealthInfo {
        service: "domain_tracker",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Turns a payload into mirror updates plus the signal they accompany. Both
/// travel through the tracker queue together. Lifecycle payloads
/// (startup/install) run a startup pass.
pub async fn apply_signal(state: &AppState, payload: SignalPayload) -> Result<Value, TrackerError> {
    let (updates, signal) = match payload {
        SignalPayload::TabActivated {
            tab_id,
            window_id,
            tab,
        } => {
            let mut updates: Vec<MirrorUpdate> = tab.into_iter().map(MirrorUpdate::UpsertTab).collect();
            updates.push(MirrorUpdate::Activate { tab_id, window_id });
            (updates, Signal::TabActivated { tab_id, window_id })
        }
        SignalPayload::TabUpdated {
            tab_id,
            change_info,
            tab,
        } => {
            let mut tab = Tab { id: tab_id, ..tab };
            if let Some(url) = &change_info.url {
                tab.url = Some(url.clone());
            }
            (
                vec![MirrorUpdate::UpsertTab(tab.clone())],
                Signal::TabUpdated {
                    tab_id,
                    url: change_info.url,
                    tab,
                },
            )
        }
        SignalPayload::WindowFocusChanged { window_id } => {
            let window_id = (window_id != WINDOW_ID_NONE).then_some(window_id);
            (
                vec![MirrorUpdate::Focus(window_id)],
                Signal::WindowFocusChanged { window_id },
            )
        }
        SignalPayload::TabRemoved { tab_id } => (
            vec![MirrorUpdate::RemoveTab(tab_id)],
            Signal::TabRemoved { tab_id },
        ),
        SignalPayload::IdleStateChanged { state: idle } => {
            (Vec::new(), Signal::IdleStateChanged(idle))
        }
        SignalPayload::Startup { windows } | SignalPayload::Installed { windows } => {
            let updates = if windows.is_empty() {
                Vec::new()
            } else {
                vec![MirrorUpdate::LoadSnapshot(windows)]
            };
            let report = state.tracker.startup_with(updates).await?;
            return Ok(serde_json::to_value(report)?);
        }
    };
    state.tracker.signal_with(updates, signal).await?;
    Ok(Value::Null)
}

async fn post_signal(State(state): State<AppState>, Json(payload): Json<Value>) -> Response {
    let payload: SignalPayload = match serde_json::from_value(payload) {
        Ok(v) => v,
        Err(e) => return err(StatusCode::BAD_REQUEST, format!("invalid signal: {e}")),
    };
    match apply_signal(&state, payload).await {
        Ok(Value::Null) => Json(OkResponse::<()> {
            ok: true,
            data: None,
        })
        .into_response(),
        Ok(data) => ok(data),
        Err(e) => tracker_err(e),
    }
}

async fn post_message(State(state): State<AppState>, Json(payload): Json<Value>) -> Response {
    let msg: ExtensionMessage = match serde_json::from_value(payload) {
        Ok(v) => v,
        Err(_) => return err(StatusCode::BAD_REQUEST, "message needs a type"),
    };
    if msg.kind != FLUSH_MESSAGE {
        return err(StatusCode::BAD_REQUEST, format!("unknown message type {}", msg.kind));
    }
    match state.tracker.flush().await {
        Ok(_) => Json(serde_json::json!({ "ok": true })).into_response(),
        Err(e) => tracker_err(e),
    }
}

async fn post_flush(State(state): State<AppState>) -> Response {
    match state.tracker.flush().await {
        Ok(outcome) => ok(outcome),
        Err(e) => tracker_err(e),
    }
}

async fn get_days(State(state): State<AppState>) -> Response {
    match state.tracker.days().await {
        Ok(days) => ok(days),
        Err(e) => tracker_err(e),
    }
}

async fn get_today(State(state): State<AppState>) -> Response {
    match state.tracker.today().await {
        Ok((day, bucket)) => ok(TodayView { day, bucket }),
        Err(e) => tracker_err(e),
    }
}

async fn get_keys(State(state): State<AppState>) -> Response {
    match state.tracker.stored_keys().await {
        Ok(keys) => ok(keys),
        Err(e) => tracker_err(e),
    }
}

async fn get_state(State(state): State<AppState>) -> Response {
    match state.tracker.snapshot().await {
        Ok(snap) => ok(snap),
        Err(e) => tracker_err(e),
    }
}

async fn get_trace(State(state): State<AppState>, Query(q): Query<TraceQuery>) -> Response {
    match state.tracker.trace().await {
        Ok(rows) => {
            let skip = rows.len().saturating_sub(q.limit);
            ok(rows.into_iter().skip(skip).collect::<Vec<_>>())
        }
        Err(e) => tracker_err(e),
    }
}

async fn get_report(State(state): State<AppState>, Query(q): Query<ReportQuery>) -> Response {
    let days = match state.tracker.days().await {
        Ok(v) => v,
        Err(e) => return tracker_err(e),
    };
    match q.domain {
        Some(domain) => ok(report::domain_series(&days, &domain)),
        None => ok(report::build_report(&days, q.top, q.min_ms)),
    }
}

async fn get_export_csv(State(state): State<AppState>) -> Response {
    match state.tracker.days().await {
        Ok(days) => (
            [(header::CONTENT_TYPE, "text/csv; charset=utf-8")],
            report::export_csv(&days),
        )
            .into_response(),
        Err(e) => tracker_err(e),
    }
}

async fn post_add_interval(
    State(state): State<AppState>,
    Json(req): Json<AddIntervalRequest>,
) -> Response {
    match state
        .tracker
        .add_interval(&req.domain, req.start_ms, req.end_ms)
        .await
    {
        Ok(credits) => ok(credits),
        Err(e) => tracker_err(e),
    }
}

async fn post_seed_days(State(state): State<AppState>, Json(req): Json<SeedRequest>) -> Response {
    match state.tracker.seed_days_ago(req.days_ago).await {
        Ok(index) => ok(index),
        Err(e) => tracker_err(e),
    }
}

async fn post_reset(State(state): State<AppState>) -> Response {
    match state.tracker.reset().await {
        Ok(()) => Json(OkResponse::<()> {
            ok: true,
            data: None,
        })
        .into_response(),
        Err(e) => tracker_err(e),
    }
}
