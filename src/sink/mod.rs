//! Flushed dispatch metrics and the backends they are exported to.

pub mod exporter;
pub mod http;
pub mod log;
pub mod metric;

pub use exporter::Exporter;
pub use metric::{MetricBatch, MetricEntry, MetricNames};
