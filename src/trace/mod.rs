//! Kernel dispatch trace ingestion and time-binned aggregation.

pub mod aggregator;
pub mod dispatch;
pub mod parse;
pub mod queue;
pub mod window;

pub use aggregator::{DispatchAggregator, FlushOutput, PassSummary};
pub use dispatch::{Cumulative, Dispatch, DispatchKey};
pub use queue::IngestQueue;
