pub mod health;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::trace::parse::parse_body;
use crate::trace::IngestQueue;

use self::health::HealthMetrics;

/// Path the profiler library posts trace CSV to.
pub const INGEST_PATH: &str = "/kernel_trace";

/// HTTP front end: trace ingest plus `/metrics` and `/healthz`.
pub struct Server {
    addr: String,
    queue: Option<Arc<IngestQueue>>,
    health: Arc<HealthMetrics>,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// Creates a server. Without a queue the ingest route is not mounted.
    pub fn new(addr: &str, queue: Option<Arc<IngestQueue>>, health: Arc<HealthMetrics>) -> Self {
        Self {
            addr: addr.to_string(),
            queue,
            health,
            shutdown: parking_lot::Mutex::new(None),
            task: parking_lot::Mutex::new(None),
        }
    }

    /// Binds the listener and serves in the background.
    ///
    /// Returns the bound address, which differs from the configured one when
    /// port 0 was requested.
    pub async fn start(&self) -> Result<SocketAddr> {
        let bind_addr = bind_address(&self.addr);

        let mut app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(Arc::clone(&self.health));

        if let Some(queue) = &self.queue {
            let state = Arc::new(IngestState {
                queue: Arc::clone(queue),
                health: Arc::clone(&self.health),
            });
            app = app.merge(
                Router::new()
                    .route(INGEST_PATH, post(ingest_handler))
                    .with_state(state),
            );
        }

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        let task = tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "server error");
            }
        });
        *self.task.lock() = Some(task);

        Ok(local_addr)
    }

    /// Stops accepting connections and waits for in-flight requests to finish.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        let task = self.task.lock().take();
        if let Some(task) = task {
            task.await.context("joining server task")?;
        }

        Ok(())
    }
}

/// Expands the `:port` shorthand to all interfaces.
fn bind_address(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

/// State for the ingest route, mounted only when tracing is enabled.
struct IngestState {
    queue: Arc<IngestQueue>,
    health: Arc<HealthMetrics>,
}

/// POST /kernel_trace - CSV rows of `device_id,kernel,start_ns,end_ns`.
///
/// A payload is accepted or rejected as a whole.
async fn ingest_handler(State(state): State<Arc<IngestState>>, body: Bytes) -> impl IntoResponse {
    match parse_body(&body) {
        Ok(dispatches) => {
            let count = state.queue.push_batch(dispatches);
            state.health.dispatches_received.inc_by(count as f64);
            state
                .health
                .ingest_requests
                .with_label_values(&["ok"])
                .inc();

            tracing::debug!(count, "queued dispatches");

            (StatusCode::OK, Json(json!({ "status": "ok" })))
        }
        Err(e) => {
            state
                .health
                .ingest_requests
                .with_label_values(&["error"])
                .inc();

            tracing::warn!(error = %e, bytes = body.len(), "rejecting trace payload");

            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": e.to_string() })),
            )
        }
    }
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(health): State<Arc<HealthMetrics>>) -> impl IntoResponse {
    match health.encode() {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
