use crate::calendar::DEFAULT_RETENTION_DAYS;

pub const DEFAULT_TRACE_CAPACITY: usize = 200;

/// Engine-level settings; the daemon fills these from its command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerConfig {
    pub retention_days: u32,
    pub trace_capacity: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            retention_days: DEFAULT_RETENTION_DAYS,
            trace_capacity: DEFAULT_TRACE_CAPACITY,
        }
    }
}

impl TrackerConfig {
    pub fn normalized(self) -> Self {
        Self {
            retention_days: self.retention_days.max(1),
            trace_capacity: self.trace_capacity.max(1),
        }
    }
}
