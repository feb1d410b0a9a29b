use std::sync::Arc;

/// One completed kernel dispatch, timestamps in the device clock domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub device_id: Arc<str>,
    pub kernel: Arc<str>,
    pub end_ns: u64,
    pub duration_ns: u64,
}

impl Dispatch {
    pub fn new(device_id: &str, kernel: &str, end_ns: u64, duration_ns: u64) -> Self {
        Self {
            device_id: Arc::from(device_id),
            kernel: Arc::from(kernel),
            end_ns,
            duration_ns,
        }
    }

    pub fn key(&self) -> DispatchKey {
        DispatchKey {
            device_id: Arc::clone(&self.device_id),
            kernel: Arc::clone(&self.kernel),
        }
    }
}

/// Aggregation identity: one kernel on one device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DispatchKey {
    pub device_id: Arc<str>,
    pub kernel: Arc<str>,
}

impl DispatchKey {
    pub fn new(device_id: &str, kernel: &str) -> Self {
        Self {
            device_id: Arc::from(device_id),
            kernel: Arc::from(kernel),
        }
    }
}

/// Running totals for a key since process start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cumulative {
    pub dispatches: u64,
    pub total_duration_ns: u64,
}

impl Cumulative {
    pub const fn new(dispatches: u64, total_duration_ns: u64) -> Self {
        Self {
            dispatches,
            total_duration_ns,
        }
    }

    /// Accounts one more dispatch and returns the updated totals.
    pub fn record(&mut self, duration_ns: u64) -> Self {
        self.dispatches = self.dispatches.saturating_add(1);
        self.total_duration_ns = self.total_duration_ns.saturating_add(duration_ns);
        *self
    }
}
