use anyhow::{Context, Result};
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};

use crate::trace::PassSummary;

const NAMESPACE: &str = "dispatchstat";

/// Prometheus metrics describing the collector itself.
///
/// All metrics use the "dispatchstat" namespace and live in a private
/// registry served at `/metrics`.
pub struct HealthMetrics {
    registry: Registry,

    /// Dispatch records accepted by the ingest endpoint.
    pub dispatches_received: Counter,
    /// Dispatch records discarded because their bin was outside the window.
    pub dispatches_dropped: CounterVec,
    /// Ingest requests by outcome.
    pub ingest_requests: CounterVec,
    /// Bins emitted by periodic and terminal flushes.
    pub bins_flushed: Counter,
    /// Metric entries handed to each exporter.
    pub entries_exported: CounterVec,
    /// Failed export attempts by exporter.
    pub export_errors: CounterVec,
    /// Distinct (card, kernel) pairs seen so far.
    pub tracked_kernels: Gauge,
    /// Bins currently open in the window.
    pub window_bins: Gauge,
    /// Records drained from the ingest queue by the last pass.
    pub pending_dispatches: Gauge,
    /// Wall time of one processing pass including the flush.
    pub process_duration: Histogram,
}

impl HealthMetrics {
    /// Creates and registers every metric.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let dispatches_received = Counter::with_opts(
            Opts::new(
                "dispatches_received_total",
                "Total dispatch records accepted by the ingest endpoint.",
            )
            .namespace(NAMESPACE),
        )?;
        let dispatches_dropped = CounterVec::new(
            Opts::new(
                "dispatches_dropped_total",
                "Total dispatch records dropped outside the bin window.",
            )
            .namespace(NAMESPACE),
            &["reason"],
        )?;
        let ingest_requests = CounterVec::new(
            Opts::new("ingest_requests_total", "Total ingest requests by status.")
                .namespace(NAMESPACE),
            &["status"],
        )?;
        let bins_flushed = Counter::with_opts(
            Opts::new("bins_flushed_total", "Total bins flushed to exporters.")
                .namespace(NAMESPACE),
        )?;
        let entries_exported = CounterVec::new(
            Opts::new(
                "entries_exported_total",
                "Total metric entries handed to each exporter.",
            )
            .namespace(NAMESPACE),
            &["exporter"],
        )?;
        let export_errors = CounterVec::new(
            Opts::new("export_errors_total", "Total export errors by exporter.")
                .namespace(NAMESPACE),
            &["exporter"],
        )?;
        let tracked_kernels = Gauge::with_opts(
            Opts::new(
                "tracked_kernels",
                "Number of distinct card and kernel pairs tracked.",
            )
            .namespace(NAMESPACE),
        )?;
        let window_bins = Gauge::with_opts(
            Opts::new("window_bins", "Number of bins open in the window.").namespace(NAMESPACE),
        )?;
        let pending_dispatches = Gauge::with_opts(
            Opts::new(
                "pending_dispatches",
                "Dispatch records drained by the last processing pass.",
            )
            .namespace(NAMESPACE),
        )?;
        let process_duration = Histogram::with_opts(
            HistogramOpts::new(
                "process_duration_seconds",
                "Duration of one processing and flush pass.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![
                0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0,
            ]),
        )?;

        registry.register(Box::new(dispatches_received.clone()))?;
        registry.register(Box::new(dispatches_dropped.clone()))?;
        registry.register(Box::new(ingest_requests.clone()))?;
        registry.register(Box::new(bins_flushed.clone()))?;
        registry.register(Box::new(entries_exported.clone()))?;
        registry.register(Box::new(export_errors.clone()))?;
        registry.register(Box::new(tracked_kernels.clone()))?;
        registry.register(Box::new(window_bins.clone()))?;
        registry.register(Box::new(pending_dispatches.clone()))?;
        registry.register(Box::new(process_duration.clone()))?;

        Ok(Self {
            registry,
            dispatches_received,
            dispatches_dropped,
            ingest_requests,
            bins_flushed,
            entries_exported,
            export_errors,
            tracked_kernels,
            window_bins,
            pending_dispatches,
            process_duration,
        })
    }

    /// Folds one processing pass into the drop and queue metrics.
    pub fn observe_pass(&self, pass: &PassSummary) {
        if pass.dropped_too_old > 0 {
            self.dispatches_dropped
                .with_label_values(&["too_old"])
                .inc_by(pass.dropped_too_old as f64);
        }
        if pass.dropped_in_future > 0 {
            self.dispatches_dropped
                .with_label_values(&["in_future"])
                .inc_by(pass.dropped_in_future as f64);
        }
        self.pending_dispatches.set(pass.drained as f64);
    }

    /// Renders the registry in the Prometheus text format.
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .context("encoding metrics")?;

        String::from_utf8(buffer).context("converting metrics to string")
    }
}
