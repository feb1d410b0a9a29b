use std::fmt::Write as _;
use std::sync::Arc;

/// Metric name suffix for the cumulative dispatch count.
pub const DISPATCH_COUNT: &str = "kernel_dispatch_count";

/// Metric name suffix for the cumulative dispatch duration.
pub const TOTAL_DURATION_NS: &str = "kernel_total_duration_ns";

/// Label carrying the device id.
pub const LABEL_CARD: &str = "card";

/// Label carrying the kernel name.
pub const LABEL_KERNEL: &str = "kernel";

/// Fully qualified names of the two exported series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricNames {
    pub dispatch_count: Arc<str>,
    pub total_duration_ns: Arc<str>,
}

impl MetricNames {
    /// Builds names under `namespace`. An empty namespace leaves them bare.
    pub fn new(namespace: &str) -> Self {
        let qualify = |suffix: &str| -> Arc<str> {
            if namespace.is_empty() {
                Arc::from(suffix)
            } else {
                Arc::from(format!("{namespace}_{suffix}"))
            }
        };

        Self {
            dispatch_count: qualify(DISPATCH_COUNT),
            total_duration_ns: qualify(TOTAL_DURATION_NS),
        }
    }
}

impl Default for MetricNames {
    fn default() -> Self {
        Self::new("omnistat")
    }
}

/// One sample of one series, stamped with the bin's closing edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricEntry {
    pub name: Arc<str>,
    pub device_id: Arc<str>,
    pub kernel: Arc<str>,
    pub value: u64,
    pub timestamp_ms: i64,
}

impl MetricEntry {
    /// Renders labels as `card="0",kernel="name"`.
    pub fn labels(&self) -> String {
        let mut out = String::with_capacity(self.device_id.len() + self.kernel.len() + 20);
        let _ = write!(
            out,
            "{LABEL_CARD}=\"{}\",{LABEL_KERNEL}=\"{}\"",
            escape_label_value(&self.device_id),
            escape_label_value(&self.kernel),
        );
        out
    }
}

/// Escapes backslash, double quote and newline in a label value.
pub fn escape_label_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out
}

/// Entries produced by one flush, ready for export.
#[derive(Debug, Clone)]
pub struct MetricBatch {
    pub entries: Vec<MetricEntry>,
}

impl MetricBatch {
    pub fn new(entries: Vec<MetricEntry>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
