use std::io::Write;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use prometheus::Counter;
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

use crate::config::HttpExportConfig;

use super::metric::{MetricBatch, MetricEntry};

/// Series identity of one import line.
#[derive(Debug, Clone, Serialize)]
pub struct SeriesJson {
    #[serde(rename = "__name__")]
    pub name: Arc<str>,
    pub card: Arc<str>,
    pub kernel: Arc<str>,
}

/// One line of the JSON-line import format:
/// `{"metric":{..},"values":[v],"timestamps":[ms]}`.
#[derive(Debug, Clone, Serialize)]
pub struct ImportLineJson {
    pub metric: SeriesJson,
    pub values: [u64; 1],
    pub timestamps: [i64; 1],
}

impl From<&MetricEntry> for ImportLineJson {
    fn from(entry: &MetricEntry) -> Self {
        Self {
            metric: SeriesJson {
                name: Arc::clone(&entry.name),
                card: Arc::clone(&entry.device_id),
                kernel: Arc::clone(&entry.kernel),
            },
            values: [entry.value],
            timestamps: [entry.timestamp_ms],
        }
    }
}

/// HTTP JSON-line exporter with worker pool and compression.
///
/// Converts metric entries to newline-delimited JSON, optionally compresses,
/// and sends via HTTP POST. Uses a bounded channel and semaphore-limited
/// workers for backpressure.
pub struct HttpExporter {
    cfg: HttpExportConfig,
    errors: Option<Counter>,
    tx: Option<mpsc::Sender<ImportLineJson>>,
    task: Option<JoinHandle<()>>,
}

impl HttpExporter {
    /// Creates a new HTTP exporter with the given configuration.
    pub fn new(cfg: HttpExportConfig) -> Self {
        Self {
            cfg,
            errors: None,
            tx: None,
            task: None,
        }
    }

    /// Counts failed requests and dropped entries on `counter`.
    pub fn with_error_counter(mut self, counter: Counter) -> Self {
        self.errors = Some(counter);
        self
    }

    /// Returns the exporter name for logging.
    pub fn name(&self) -> &str {
        "http"
    }

    /// Start the background accumulator task.
    pub async fn start(&mut self) -> Result<()> {
        if self.cfg.max_queue_size == 0 {
            bail!("http max_queue_size must be positive");
        }
        if self.cfg.workers == 0 {
            bail!("http workers must be positive");
        }
        if self.cfg.batch_size == 0 {
            bail!("http batch_size must be positive");
        }
        if self.cfg.batch_timeout.is_zero() {
            bail!("http batch_timeout must be positive");
        }

        let (tx, mut rx) = mpsc::channel::<ImportLineJson>(self.cfg.max_queue_size);

        let cfg = Arc::new(self.cfg.clone());

        let mut client_builder = reqwest::Client::builder().timeout(cfg.export_timeout);

        if !cfg.keep_alive {
            client_builder = client_builder.pool_max_idle_per_host(0);
        }

        let client = client_builder.build().context("building HTTP client")?;

        let semaphore = Arc::new(Semaphore::new(cfg.workers));
        let errors = self.errors.clone();

        // Accumulator: batches items and dispatches them to workers. Exits once
        // every sender is gone and the channel is drained.
        let task = tokio::spawn(async move {
            let batch_size = cfg.batch_size;
            let mut batch = Vec::with_capacity(batch_size);
            let mut in_flight = tokio::task::JoinSet::new();
            let mut interval = tokio::time::interval(cfg.batch_timeout);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            let sender = BatchSender {
                client,
                cfg: Arc::clone(&cfg),
                semaphore,
                errors,
            };

            loop {
                tokio::select! {
                    item = rx.recv() => {
                        match item {
                            Some(item) => {
                                batch.push(item);

                                // Drain more items without blocking.
                                while batch.len() < batch_size {
                                    match rx.try_recv() {
                                        Ok(item) => batch.push(item),
                                        Err(_) => break,
                                    }
                                }

                                if batch.len() >= batch_size {
                                    let items = std::mem::replace(
                                        &mut batch,
                                        Vec::with_capacity(batch_size),
                                    );
                                    sender.spawn(&mut in_flight, items);
                                }
                            }
                            None => {
                                sender.spawn(&mut in_flight, std::mem::take(&mut batch));

                                while let Some(joined) = in_flight.join_next().await {
                                    if let Err(e) = joined {
                                        tracing::debug!(error = %e, "HTTP export worker join failed");
                                    }
                                }
                                return;
                            }
                        }
                    }

                    _ = interval.tick() => {
                        if !batch.is_empty() {
                            let items = std::mem::replace(
                                &mut batch,
                                Vec::with_capacity(batch_size),
                            );
                            sender.spawn(&mut in_flight, items);
                        }
                    }

                    joined = in_flight.join_next(), if !in_flight.is_empty() => {
                        if let Some(Err(e)) = joined {
                            tracing::debug!(error = %e, "HTTP export worker join failed");
                        }
                    }
                }
            }
        });

        self.tx = Some(tx);
        self.task = Some(task);

        tracing::info!(
            address = %self.cfg.address,
            compression = %self.cfg.compression,
            workers = self.cfg.workers,
            "HTTP exporter started",
        );

        Ok(())
    }

    /// Export a batch of entries by enqueuing JSON lines.
    ///
    /// Waits for queue capacity when the accumulator falls behind, so a large
    /// terminal flush is delivered whole.
    pub async fn export(&self, batch: &MetricBatch) -> Result<()> {
        let Some(tx) = &self.tx else {
            return Ok(());
        };

        for (i, entry) in batch.entries.iter().enumerate() {
            if tx.send(ImportLineJson::from(entry)).await.is_err() {
                let dropped = batch.entries.len() - i;
                bail!("HTTP export task stopped, {dropped} entries not queued");
            }
        }

        Ok(())
    }

    /// Stop the exporter, sending every queued item first.
    pub async fn stop(&mut self) -> Result<()> {
        // Dropping the sender lets the accumulator drain and exit.
        self.tx.take();

        if let Some(task) = self.task.take() {
            task.await.context("joining HTTP exporter task")?;
        }

        Ok(())
    }
}

/// Everything a worker needs to send one batch.
struct BatchSender {
    client: reqwest::Client,
    cfg: Arc<HttpExportConfig>,
    semaphore: Arc<Semaphore>,
    errors: Option<Counter>,
}

impl BatchSender {
    fn spawn(&self, in_flight: &mut tokio::task::JoinSet<()>, items: Vec<ImportLineJson>) {
        if items.is_empty() {
            return;
        }

        let client = self.client.clone();
        let cfg = Arc::clone(&self.cfg);
        let semaphore = Arc::clone(&self.semaphore);
        let errors = self.errors.clone();

        in_flight.spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    tracing::warn!(error = %e, "HTTP exporter semaphore closed");
                    return;
                }
            };

            if let Err(e) = send_batch(&client, &cfg, items).await {
                if let Some(errors) = &errors {
                    errors.inc();
                }
                tracing::error!(error = %e, "HTTP export request failed");
            }
        });
    }
}

/// Serializes items as newline-delimited JSON.
fn encode_lines(items: &[ImportLineJson]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(items.len() * 128);
    for item in items {
        serde_json::to_writer(&mut buf, item).context("serializing metric to JSON")?;
        buf.push(b'\n');
    }
    Ok(buf)
}

/// Sends one batch of items via HTTP.
async fn send_batch(
    client: &reqwest::Client,
    cfg: &HttpExportConfig,
    items: Vec<ImportLineJson>,
) -> Result<()> {
    if items.is_empty() {
        return Ok(());
    }

    let buf = encode_lines(&items)?;
    let raw_len = buf.len();

    let compressed = compress(&buf, &cfg.compression).context("compressing NDJSON data")?;

    let mut request = client
        .post(&cfg.address)
        .header("Content-Type", "application/x-ndjson")
        .body(compressed);

    if let Some(encoding) = content_encoding(&cfg.compression) {
        request = request.header("Content-Encoding", encoding);
    }

    for (k, v) in &cfg.headers {
        request = request.header(k.as_str(), v.as_str());
    }

    let resp = request
        .send()
        .await
        .context("sending HTTP export request")?;

    let status = resp.status();
    // Drain body for connection reuse.
    let _ = resp.bytes().await;

    if !status.is_success() {
        bail!("HTTP export unexpected status: {status}");
    }

    tracing::debug!(
        items = items.len(),
        bytes = raw_len,
        "exported batch via HTTP",
    );

    Ok(())
}

// --- Compression ---

/// Compresses data using the specified algorithm.
fn compress(data: &[u8], algorithm: &str) -> Result<Vec<u8>> {
    match algorithm {
        "none" | "" => Ok(data.to_vec()),
        "gzip" => compress_gzip(data),
        "zstd" => compress_zstd(data),
        "zlib" => compress_zlib(data),
        "snappy" => compress_snappy(data),
        other => bail!("unsupported compression: {other}"),
    }
}

/// Returns the Content-Encoding header value for the algorithm.
fn content_encoding(algorithm: &str) -> Option<&'static str> {
    match algorithm {
        "gzip" => Some("gzip"),
        "zstd" => Some("zstd"),
        "zlib" => Some("deflate"),
        "snappy" => Some("snappy"),
        _ => None,
    }
}

fn compress_gzip(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).context("gzip write")?;
    encoder.finish().context("gzip finish")
}

fn compress_zstd(data: &[u8]) -> Result<Vec<u8>> {
    zstd::encode_all(data, 0).context("zstd encode")
}

fn compress_zlib(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::write::ZlibEncoder;
    use flate2::Compression;

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).context("zlib write")?;
    encoder.finish().context("zlib finish")
}

fn compress_snappy(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = snap::raw::Encoder::new();
    encoder.compress_vec(data).context("snappy encode")
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;

    fn entry(kernel: &str, value: u64) -> MetricEntry {
        MetricEntry {
            name: Arc::from("omnistat_kernel_dispatch_count"),
            device_id: Arc::from("0"),
            kernel: Arc::from(kernel),
            value,
            timestamp_ms: 2000,
        }
    }

    #[test]
    fn test_compress_none() {
        let data = b"hello world";
        let result = compress(data, "none").expect("compress none");
        assert_eq!(result, data);
    }

    #[test]
    fn test_compress_gzip_roundtrip() {
        let data = b"{\"metric\":{},\"values\":[1],\"timestamps\":[1]}\n";
        let compressed = compress(data, "gzip").expect("gzip compress");
        assert_ne!(compressed, data.as_slice());

        let mut decoder = flate2::read::GzDecoder::new(compressed.as_slice());
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .expect("gzip decompress");
        assert_eq!(decompressed, data);
    }

    #[test]
    fn test_compress_zstd_roundtrip() {
        let data = b"kernel dispatch lines compressed with zstd";
        let compressed = compress(data, "zstd").expect("zstd compress");
        let decompressed = zstd::decode_all(compressed.as_slice()).expect("zstd decompress");
        assert_eq!(decompressed, data);
    }

    #[test]
    fn test_compress_zlib_roundtrip() {
        let data = b"kernel dispatch lines compressed with zlib";
        let compressed = compress(data, "zlib").expect("zlib compress");

        let mut decoder = flate2::read::ZlibDecoder::new(compressed.as_slice());
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .expect("zlib decompress");
        assert_eq!(decompressed, data);
    }

    #[test]
    fn test_compress_snappy_roundtrip() {
        let data = b"kernel dispatch lines compressed with snappy";
        let compressed = compress(data, "snappy").expect("snappy compress");
        let decompressed = snap::raw::Decoder::new()
            .decompress_vec(&compressed)
            .expect("snappy decompress");
        assert_eq!(decompressed, data);
    }

    #[test]
    fn test_compress_unknown_algorithm() {
        assert!(compress(b"x", "brotli").is_err());
    }

    #[test]
    fn test_content_encoding() {
        assert_eq!(content_encoding("gzip"), Some("gzip"));
        assert_eq!(content_encoding("zstd"), Some("zstd"));
        assert_eq!(content_encoding("zlib"), Some("deflate"));
        assert_eq!(content_encoding("snappy"), Some("snappy"));
        assert_eq!(content_encoding("none"), None);
        assert_eq!(content_encoding(""), None);
    }

    #[test]
    fn test_import_line_serialization() {
        let line = ImportLineJson::from(&entry("gemm", 3));
        let json = serde_json::to_string(&line).expect("serialize");
        assert_eq!(
            json,
            r#"{"metric":{"__name__":"omnistat_kernel_dispatch_count","card":"0","kernel":"gemm"},"values":[3],"timestamps":[2000]}"#
        );
    }

    #[test]
    fn test_import_line_escapes_kernel_name() {
        let line = ImportLineJson::from(&entry("void f<\"a\", b>()", 1));
        let json = serde_json::to_string(&line).expect("serialize");
        assert!(json.contains(r#""kernel":"void f<\"a\", b>()""#));
    }

    #[test]
    fn test_encode_lines_newline_delimited() {
        let items: Vec<ImportLineJson> = [entry("a", 1), entry("b", 2)]
            .iter()
            .map(ImportLineJson::from)
            .collect();
        let buf = encode_lines(&items).expect("encode");
        let text = String::from_utf8(buf).expect("utf8");

        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(text.ends_with('\n'));
        for line in lines {
            let value: serde_json::Value = serde_json::from_str(line).expect("valid json line");
            assert!(value["metric"]["__name__"].is_string());
        }
    }

    #[tokio::test]
    async fn test_export_before_start_is_noop() {
        let exporter = HttpExporter::new(HttpExportConfig::default());
        let batch = MetricBatch::new(vec![entry("a", 1)]);
        exporter.export(&batch).await.expect("export");
    }

    #[tokio::test]
    async fn test_export_larger_than_queue_delivers_everything() {
        use axum::extract::State;
        use axum::http::StatusCode;
        use axum::routing::post;

        type Lines = Arc<parking_lot::Mutex<Vec<String>>>;

        async fn collect(State(lines): State<Lines>, body: String) -> StatusCode {
            lines.lock().extend(body.lines().map(str::to_string));
            StatusCode::NO_CONTENT
        }

        let received: Lines = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let app = axum::Router::new()
            .route("/import", post(collect))
            .with_state(Arc::clone(&received));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let mut exporter = HttpExporter::new(HttpExportConfig {
            enabled: true,
            address: format!("http://{addr}/import"),
            compression: "none".to_string(),
            max_queue_size: 8,
            batch_size: 5,
            batch_timeout: std::time::Duration::from_millis(20),
            ..Default::default()
        });
        exporter.start().await.expect("start");

        let entries: Vec<MetricEntry> = (0..250).map(|i| entry(&format!("k{i}"), i)).collect();
        exporter
            .export(&MetricBatch::new(entries))
            .await
            .expect("export");
        exporter.stop().await.expect("stop");

        let lines = received.lock();
        assert_eq!(lines.len(), 250);
        let values: std::collections::HashSet<u64> = lines
            .iter()
            .map(|l| {
                let v: serde_json::Value = serde_json::from_str(l).expect("json line");
                v["values"][0].as_u64().expect("value")
            })
            .collect();
        assert_eq!(values.len(), 250);
    }

    #[tokio::test]
    async fn test_start_rejects_zero_workers() {
        let mut exporter = HttpExporter::new(HttpExportConfig {
            workers: 0,
            ..Default::default()
        });
        assert!(exporter.start().await.is_err());
    }
}
