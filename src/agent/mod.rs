use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::server::health::HealthMetrics;
use crate::server::Server;
use crate::sink::exporter::Exporter;
use crate::sink::http::HttpExporter;
use crate::sink::log::LogExporter;
use crate::sink::metric::{MetricBatch, MetricEntry, MetricNames};
use crate::trace::{DispatchAggregator, FlushOutput};

/// Agent orchestrates all components: aggregator, server, exporters.
pub struct Agent<C: Clock + 'static = SystemClock> {
    cfg: Config,
    clock: Option<C>,
    health: Arc<HealthMetrics>,
    server: Option<Server>,
    local_addr: Option<SocketAddr>,
    worker: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Agent<SystemClock> {
    /// Creates a new Agent reading the system clocks.
    pub fn new(cfg: Config) -> Result<Self> {
        Self::with_clock(cfg, SystemClock)
    }
}

impl<C: Clock + 'static> Agent<C> {
    /// Creates a new Agent, initializing health metrics.
    pub fn with_clock(cfg: Config, clock: C) -> Result<Self> {
        let health = Arc::new(HealthMetrics::new().context("creating health metrics")?);

        Ok(Self {
            cfg,
            clock: Some(clock),
            health,
            server: None,
            local_addr: None,
            worker: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Address the server is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    /// Start all components and begin accepting traces.
    pub async fn start(&mut self) -> Result<()> {
        let clock = self.clock.take().context("agent already started")?;

        // 1. Create the aggregator. A clock failure here is fatal.
        let aggregator = if self.cfg.trace.enabled {
            let aggregator = DispatchAggregator::new(
                clock,
                self.cfg.interval,
                self.cfg.trace.window,
                MetricNames::new(&self.cfg.metrics.namespace),
            )
            .context("creating dispatch aggregator")?;
            Some(aggregator)
        } else {
            warn!("trace collection disabled, ingest endpoint not mounted");
            None
        };

        // 2. Start exporters.
        let mut exporters = self.build_exporters();
        for exporter in &mut exporters {
            exporter
                .start()
                .await
                .with_context(|| format!("starting {} exporter", exporter.name()))?;
        }

        // 3. Start the server.
        let server = Server::new(
            &self.cfg.server.addr,
            aggregator.as_ref().map(|a| a.queue()),
            Arc::clone(&self.health),
        );
        let local_addr = server.start().await.context("starting server")?;
        self.local_addr = Some(local_addr);
        self.server = Some(server);

        // 4. Spawn the periodic processing task.
        match aggregator {
            Some(aggregator) => {
                let worker = Worker {
                    aggregator,
                    exporters,
                    health: Arc::clone(&self.health),
                };
                let interval = self.cfg.interval;
                let cancel = self.cancel.clone();
                self.worker = Some(tokio::spawn(worker.run(interval, cancel)));
            }
            None => {
                for exporter in &mut exporters {
                    if let Err(e) = exporter.stop().await {
                        error!(exporter = exporter.name(), error = %e, "error stopping exporter");
                    }
                }
            }
        }

        info!(addr = %local_addr, "agent fully started");

        Ok(())
    }

    /// Gracefully stop all components.
    ///
    /// Ingest stops first so the terminal flush sees every accepted record.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(server) = &self.server {
            server.stop().await?;
        }

        // Signal the worker to run its terminal flush.
        self.cancel.cancel();

        if let Some(worker) = self.worker.take() {
            worker.await.context("joining processing task")?;
        }

        info!("agent stopped");

        Ok(())
    }

    fn build_exporters(&self) -> Vec<Exporter> {
        let mut exporters = Vec::new();

        if self.cfg.export.http.enabled {
            let errors = self.health.export_errors.with_label_values(&["http"]);
            let exporter = HttpExporter::new(self.cfg.export.http.clone()).with_error_counter(errors);
            exporters.push(Exporter::Http(exporter));

            info!(
                address = %self.cfg.export.http.address,
                "HTTP exporter configured",
            );
        }

        if self.cfg.export.log.enabled {
            exporters.push(Exporter::Log(LogExporter::new()));
            info!("log exporter configured");
        }

        if exporters.is_empty() {
            warn!("no exporters configured, flushed metrics will be discarded");
        }

        exporters
    }
}

/// Owns the aggregator and exporters for the lifetime of the tick loop.
struct Worker<C: Clock> {
    aggregator: DispatchAggregator<C>,
    exporters: Vec<Exporter>,
    health: Arc<HealthMetrics>,
}

impl<C: Clock> Worker<C> {
    async fn run(mut self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let start = Instant::now();
                    match self.aggregator.update_metrics() {
                        Ok(output) => self.publish(output).await,
                        Err(e) => error!(error = %e, "dispatch processing failed"),
                    }
                    self.health
                        .process_duration
                        .observe(start.elapsed().as_secs_f64());
                }
            }
        }

        match self.aggregator.flush_metrics() {
            Ok(output) => self.publish(output).await,
            Err(e) => error!(error = %e, "terminal dispatch flush failed"),
        }

        for exporter in &mut self.exporters {
            if let Err(e) = exporter.stop().await {
                error!(exporter = exporter.name(), error = %e, "error stopping exporter");
            }
        }
    }

    async fn publish(&self, output: FlushOutput) {
        self.health.observe_pass(&output.pass);
        self.health.bins_flushed.inc_by(output.bins_flushed as f64);
        self.health
            .tracked_kernels
            .set(self.aggregator.tracked_keys() as f64);
        self.health
            .window_bins
            .set(self.aggregator.window().len() as f64);

        debug!(
            processed = output.pass.processed,
            dropped = output.pass.dropped(),
            bins_flushed = output.bins_flushed,
            entries = output.entries.len(),
            "tick complete",
        );

        self.export(output.entries).await;
    }

    async fn export(&self, entries: Vec<MetricEntry>) {
        if entries.is_empty() {
            return;
        }

        let batch = MetricBatch::new(entries);
        for exporter in &self.exporters {
            let name = exporter.name();
            match exporter.export(&batch).await {
                Ok(()) => self
                    .health
                    .entries_exported
                    .with_label_values(&[name])
                    .inc_by(batch.len() as f64),
                Err(e) => {
                    self.health.export_errors.with_label_values(&[name]).inc();
                    error!(exporter = name, error = %e, "export failed");
                }
            }
        }
    }
}
