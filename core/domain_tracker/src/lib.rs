//! Per-domain browsing time tracker.
//!
//! Browser signals drive a single-session state machine (`session`); finished
//! and checkpointed sessions are split at local midnight (`accumulator`) into
//! day buckets kept for a rolling window (`retention`).

pub mod accumulator;
pub mod browser;
pub mod calendar;
pub mod classify;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod http;
pub mod report;
pub mod retention;
pub mod session;
pub mod store;

pub use browser::{BrowserMirror, BrowserPlatform, MirrorUpdate, Tab, TabId, Window, WindowId};
pub use calendar::{DayCalendar, LocalZone};
pub use classify::{classify, Classification};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::TrackerConfig;
pub use dispatch::{spawn, spawn_with_mirror, TrackerHandle};
pub use error::{Result, TrackerError};
pub use retention::{DayBucket, RetentionStore, StorageChange};
pub use session::{IdleState, Session, SessionState, Signal, Tracker};
pub use store::{KeyValueStore, MemoryStore, SqliteStore};
