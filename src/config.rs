use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the dispatchstat collector.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Sampling interval, which is also the bin width. Default: 1s.
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Kernel trace aggregation configuration.
    #[serde(default)]
    pub trace: TraceConfig,

    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Naming of the exported dispatch series.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Exporter configuration.
    #[serde(default)]
    pub export: ExportConfig,
}

/// Kernel trace aggregation configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TraceConfig {
    /// Accept trace uploads and aggregate them. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// How long bins are retained before the periodic flush emits them.
    /// Default: 30s.
    #[serde(default = "default_window", with = "humantime_serde")]
    pub window: Duration,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen address for ingest, /metrics and /healthz. Default: ":8001".
    #[serde(default = "default_server_addr")]
    pub addr: String,
}

/// Naming of the exported dispatch series.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Prefix joined to metric names with `_`. Empty disables it.
    /// Default: "omnistat".
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

/// Exporter configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExportConfig {
    #[serde(default)]
    pub log: LogExportConfig,

    #[serde(default)]
    pub http: HttpExportConfig,
}

/// Log exporter configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogExportConfig {
    /// Log every flushed entry at info level. Default: false.
    #[serde(default)]
    pub enabled: bool,
}

/// HTTP export configuration (JSON-line import endpoint).
#[derive(Debug, Clone, Deserialize)]
pub struct HttpExportConfig {
    /// Enable the HTTP exporter. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// HTTP endpoint to send data to.
    #[serde(default = "default_http_address")]
    pub address: String,

    /// Additional HTTP headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Compression algorithm (none, gzip, zstd, zlib, snappy). Default: gzip.
    #[serde(default = "default_compression")]
    pub compression: String,

    /// Maximum items per batch. Default: 512.
    #[serde(default = "default_http_batch_size")]
    pub batch_size: usize,

    /// Maximum wait before sending a batch. Default: 5s.
    #[serde(default = "default_http_batch_timeout", with = "humantime_serde")]
    pub batch_timeout: Duration,

    /// Maximum duration for an export operation. Default: 30s.
    #[serde(default = "default_http_export_timeout", with = "humantime_serde")]
    pub export_timeout: Duration,

    /// Maximum items to queue (dropped if full). Default: 8192.
    #[serde(default = "default_http_max_queue_size")]
    pub max_queue_size: usize,

    /// Number of concurrent workers. Default: 1.
    #[serde(default = "default_http_workers")]
    pub workers: usize,

    /// Enable HTTP keep-alive connections. Default: true.
    #[serde(default = "default_true")]
    pub keep_alive: bool,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_window() -> Duration {
    Duration::from_secs(30)
}

fn default_true() -> bool {
    true
}

fn default_server_addr() -> String {
    ":8001".to_string()
}

fn default_namespace() -> String {
    "omnistat".to_string()
}

fn default_http_address() -> String {
    "http://localhost:8428/api/v1/import".to_string()
}

fn default_compression() -> String {
    "gzip".to_string()
}

fn default_http_batch_size() -> usize {
    512
}

fn default_http_batch_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_http_export_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_http_max_queue_size() -> usize {
    8192
}

fn default_http_workers() -> usize {
    1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            interval: default_interval(),
            trace: TraceConfig::default(),
            server: ServerConfig::default(),
            metrics: MetricsConfig::default(),
            export: ExportConfig::default(),
        }
    }
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: default_window(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_server_addr(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
        }
    }
}

impl Default for HttpExportConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_http_address(),
            headers: HashMap::new(),
            compression: default_compression(),
            batch_size: default_http_batch_size(),
            batch_timeout: default_http_batch_timeout(),
            export_timeout: default_http_export_timeout(),
            max_queue_size: default_http_max_queue_size(),
            workers: default_http_workers(),
            keep_alive: true,
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            bail!("interval must be positive");
        }

        let interval_ms = self.interval.as_millis().max(1);
        let window_ms = self.trace.window.as_millis();
        if window_ms < interval_ms {
            bail!(
                "trace.window {:?} must not be shorter than interval {:?}",
                self.trace.window,
                self.interval
            );
        }

        if self.server.addr.is_empty() {
            bail!("server.addr is required");
        }

        // Validate HTTP export config if enabled.
        let http = &self.export.http;
        if http.enabled {
            if http.address.is_empty() {
                bail!("http address is required when enabled");
            }

            if http.max_queue_size == 0 {
                bail!("http max_queue_size must be positive when enabled");
            }
            if http.batch_size == 0 {
                bail!("http batch_size must be positive when enabled");
            }
            if http.workers == 0 {
                bail!("http workers must be positive when enabled");
            }

            let compression = &http.compression;
            match compression.as_str() {
                "none" | "gzip" | "zstd" | "zlib" | "snappy" => {}
                _ => bail!("invalid compression type: {compression}"),
            }
        }

        Ok(())
    }
}
