use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};

use super::metric::MetricBatch;

/// Writes every flushed entry to the log at info level.
#[derive(Debug, Default)]
pub struct LogExporter;

impl LogExporter {
    pub fn new() -> Self {
        Self
    }

    /// Returns the exporter name for logging.
    pub fn name(&self) -> &str {
        "log"
    }

    pub async fn start(&mut self) -> Result<()> {
        tracing::info!("log exporter started");
        Ok(())
    }

    pub async fn export(&self, batch: &MetricBatch) -> Result<()> {
        for entry in &batch.entries {
            tracing::info!(
                metric = %entry.name,
                labels = %entry.labels(),
                value = entry.value,
                time = %format_timestamp_ms(entry.timestamp_ms),
                "dispatch metric",
            );
        }
        Ok(())
    }

    pub async fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Formats Unix milliseconds as RFC 3339 in UTC, e.g. "2006-01-02T15:04:05.000Z".
fn format_timestamp_ms(ms: i64) -> String {
    match DateTime::<Utc>::from_timestamp_millis(ms) {
        Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Millis, true),
        None => ms.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::sink::metric::MetricEntry;

    #[test]
    fn test_format_timestamp_ms() {
        assert_eq!(format_timestamp_ms(0), "1970-01-01T00:00:00.000Z");
        assert_eq!(format_timestamp_ms(1_500), "1970-01-01T00:00:01.500Z");
    }

    #[test]
    fn test_format_timestamp_out_of_range_falls_back() {
        assert_eq!(format_timestamp_ms(i64::MAX), i64::MAX.to_string());
    }

    #[tokio::test]
    async fn test_export_accepts_any_batch() {
        let exporter = LogExporter::new();
        let batch = MetricBatch::new(vec![MetricEntry {
            name: Arc::from("omnistat_kernel_dispatch_count"),
            device_id: Arc::from("0"),
            kernel: Arc::from("k"),
            value: 1,
            timestamp_ms: 1000,
        }]);
        exporter.export(&batch).await.expect("export");
    }
}
