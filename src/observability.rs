//! Observability for Catalyst.
//!
//! Provides tracing initialization, the Prometheus metrics listener, and
//! the recording helpers used by the pipeline, fan-out and batcher.

use crate::error::{CatalystError, Result};
use metrics::{counter, gauge, histogram};
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Logging and metrics settings.
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    /// Enable the Prometheus metrics listener.
    pub metrics_enabled: bool,
    /// Metrics bind address.
    pub metrics_addr: std::net::SocketAddr,
    /// Log level used when `RUST_LOG` is unset.
    pub log_level: String,
    /// Emit JSON logs.
    pub json_logs: bool,
    /// Optional log file appended to alongside stderr.
    pub log_file: Option<PathBuf>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            metrics_addr: "0.0.0.0:9090".parse().expect("valid socket address"),
            log_level: "info".to_string(),
            json_logs: false,
            log_file: None,
        }
    }
}

/// Initialize tracing. Safe to call once per process.
pub fn init(config: &ObservabilityConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    let file_layer = match &config.log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            Some(Box::new(fmt::layer().with_ansi(false).with_writer(std::sync::Arc::new(file)))
                as Box<dyn tracing_subscriber::Layer<_> + Send + Sync>)
        }
        None => None,
    };

    let stdout_layer: Box<dyn tracing_subscriber::Layer<_> + Send + Sync> = if config.json_logs {
        Box::new(fmt::layer().json())
    } else {
        Box::new(fmt::layer())
    };

    let result = registry.with(stdout_layer).with(file_layer).try_init();

    result.map_err(|e| CatalystError::Internal(format!("Failed to init logging: {e}")))?;

    info!("Observability initialized");
    Ok(())
}

/// Run the Prometheus metrics listener.
pub async fn run_metrics_server(config: ObservabilityConfig) -> Result<()> {
    let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| CatalystError::Internal(format!("Failed to install metrics recorder: {e}")))?;

    let app = axum::Router::new()
        .route(
            "/metrics",
            axum::routing::get(move || async move { handle.render() }),
        )
        .route("/health", axum::routing::get(|| async { "OK" }));

    let listener = TcpListener::bind(config.metrics_addr).await?;
    info!(addr = %config.metrics_addr, "Metrics server listening");

    axum::serve(listener, app)
        .await
        .map_err(|e| CatalystError::Internal(e.to_string()))?;

    Ok(())
}

/// Track a request currently being handled; decrements on drop so every
/// exit path (including chaos short-circuits and panics) is covered.
pub struct InFlightGuard {
    method: String,
    path: String,
}

impl InFlightGuard {
    pub fn new(method: &str, path: &str) -> Self {
        gauge!(
            "catalyst_handler_active_requests",
            "method" => method.to_string(),
            "path" => path.to_string()
        )
        .increment(1.0);
        Self {
            method: method.to_string(),
            path: path.to_string(),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        gauge!(
            "catalyst_handler_active_requests",
            "method" => self.method.clone(),
            "path" => self.path.clone()
        )
        .decrement(1.0);
    }
}

/// Record a completed request with its end-to-end duration.
pub fn record_request(method: &str, path: &str, status: u16, seconds: f64) {
    counter!(
        "catalyst_handler_requests_total",
        "method" => method.to_string(),
        "path" => path.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    histogram!(
        "catalyst_handler_request_duration_seconds",
        "method" => method.to_string(),
        "path" => path.to_string(),
        "status" => status.to_string()
    )
    .record(seconds);
}

/// Record a request that ended in a pipeline error.
pub fn record_handler_error(method: &str, path: &str, kind: &'static str) {
    counter!(
        "catalyst_handler_errors_total",
        "method" => method.to_string(),
        "path" => path.to_string(),
        "kind" => kind
    )
    .increment(1);
}

/// Record an attempted fan-out call and its outcome.
pub fn record_fanout(url: &str, success: bool) {
    counter!(
        "catalyst_fanout_calls_total",
        "url" => url.to_string(),
        "outcome" => if success { "ok" } else { "error" }
    )
    .increment(1);
}

/// Record a committed batch.
pub fn record_batch_committed(records: usize) {
    counter!("catalyst_batcher_batches_total").increment(1);
    counter!("catalyst_batcher_records_total").increment(records as u64);
}

/// Record a batch lost after retry exhaustion.
pub fn record_batch_error() {
    counter!("catalyst_batcher_errors_total").increment(1);
}

/// Record a capture that bypassed the queue via direct insert.
pub fn record_capture_fallback() {
    counter!("catalyst_batcher_fallback_total").increment(1);
}

/// Record a listener restart attempt.
pub fn record_restart(server: &str, success: bool) {
    counter!(
        "catalyst_restarts_total",
        "server" => server.to_string(),
        "outcome" => if success { "ok" } else { "error" }
    )
    .increment(1);
}
