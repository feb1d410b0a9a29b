use anyhow::Result;

use super::http::HttpExporter;
use super::log::LogExporter;
use super::metric::MetricBatch;

/// Exporter dispatches flushed metric batches to a backend.
///
/// Uses enum dispatch rather than trait objects for zero-cost async dispatch
/// (avoids `Pin<Box<dyn Future>>` overhead on every export call).
pub enum Exporter {
    Http(HttpExporter),
    Log(LogExporter),
}

impl Exporter {
    /// Returns the exporter name for logging.
    pub fn name(&self) -> &str {
        match self {
            Self::Http(e) => e.name(),
            Self::Log(e) => e.name(),
        }
    }

    /// Initialize the exporter.
    pub async fn start(&mut self) -> Result<()> {
        match self {
            Self::Http(e) => e.start().await,
            Self::Log(e) => e.start().await,
        }
    }

    /// Export a batch of metrics.
    pub async fn export(&self, batch: &MetricBatch) -> Result<()> {
        match self {
            Self::Http(e) => e.export(batch).await,
            Self::Log(e) => e.export(batch).await,
        }
    }

    /// Shut down the exporter once everything handed to it has been sent.
    pub async fn stop(&mut self) -> Result<()> {
        match self {
            Self::Http(e) => e.stop().await,
            Self::Log(e) => e.stop().await,
        }
    }
}
