//! Control plane.
//!
//! A dedicated listener (separate from every mocked listener) exposes the
//! captured transaction data, descriptor read/write, and liveness. Writing
//! a descriptor re-serializes it to YAML atomically and signals the
//! supervisor — through a bounded channel — to restart the affected
//! listener. The channel consumer applies a per-restart timeout.

use crate::config::{self, MockServer};
use crate::error::{CatalystError, Result};
use crate::shutdown::ShutdownCoordinator;
use crate::store::Store;
use crate::supervisor::Supervisor;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Default control-plane port.
pub const DEFAULT_CONTROL_PORT: u16 = 8282;
/// Restart signals queued between the control plane and the supervisor.
pub const RESTART_CHANNEL_CAPACITY: usize = 10;
/// How long one restart may run before it is abandoned and logged.
const RESTART_TIMEOUT: Duration = Duration::from_secs(30);
/// Settle delay before acting on a restart signal, so the PUT response
/// reaches the caller first.
const RESTART_SETTLE_DELAY: Duration = Duration::from_millis(100);

/// The stable response envelope for control-plane errors and confirmations.
#[derive(Debug, Serialize)]
pub struct ApiResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
}

impl ApiResponse {
    pub fn success(data: serde_json::Value, message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            data: Some(data),
            error: None,
            code: Some(200),
        }
    }

    pub fn error(error: impl Into<String>, code: u16, message: Option<String>) -> Self {
        Self {
            success: false,
            message,
            data: None,
            error: Some(error.into()),
            code: Some(code),
        }
    }
}

/// Shared state for control-plane handlers.
#[derive(Clone)]
pub struct ControlState {
    pub store: Store,
    pub config_dir: PathBuf,
    pub restart_tx: mpsc::Sender<String>,
}

/// Build the control-plane router.
pub fn router(state: ControlState) -> Router {
    Router::new()
        .route("/api/mock/data", get(get_data))
        .route("/api/mock/config", get(get_config).put(update_config))
        .route("/api/mock/health", get(health))
        .with_state(state)
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(tower_http::catch_panic::CatchPanicLayer::custom(
            handle_panic,
        ))
        .layer(axum::middleware::from_fn(log_request))
}

/// Serve the control plane until shutdown.
pub async fn run_control_server(
    port: u16,
    state: ControlState,
    coordinator: ShutdownCoordinator,
) -> Result<()> {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|_| CatalystError::PortBusy(port))?;

    info!(port, "Control plane listening");

    let app = router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { coordinator.wait_for_shutdown().await })
        .await
        .map_err(|e| CatalystError::Internal(e.to_string()))?;

    Ok(())
}

/// Consume restart signals, applying the per-restart timeout. Retries are
/// the supervisor's job; a timeout here abandons the restart and logs it.
pub fn spawn_restart_consumer(
    mut restart_rx: mpsc::Receiver<String>,
    supervisor: Arc<Supervisor>,
    coordinator: ShutdownCoordinator,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Restart consumer started");
        let mut shutdown = coordinator.watch();

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Restart consumer stopping");
                    return;
                }
                maybe = restart_rx.recv() => {
                    let Some(server_name) = maybe else {
                        info!("Restart channel closed");
                        return;
                    };

                    info!(server = %server_name, "Restart signal received");
                    tokio::time::sleep(RESTART_SETTLE_DELAY).await;

                    match tokio::time::timeout(RESTART_TIMEOUT, supervisor.restart(&server_name))
                        .await
                    {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            error!(server = %server_name, error = %e, "Restart failed");
                        }
                        Err(_) => {
                            error!(
                                server = %server_name,
                                timeout = ?RESTART_TIMEOUT,
                                "Restart abandoned after timeout"
                            );
                        }
                    }
                }
            }
        }
    })
}

/// GET /api/mock/health
async fn health() -> Response {
    let body = ApiResponse::success(
        serde_json::json!({
            "status": "healthy",
            "timestamp": Utc::now().to_rfc3339(),
        }),
        "Service is healthy",
    );
    (StatusCode::OK, Json(body)).into_response()
}

/// GET /api/mock/data — every captured transaction, most recent first.
async fn get_data(State(state): State<ControlState>) -> Response {
    let store = state.store.clone();
    let records = tokio::task::spawn_blocking(move || store.fetch_all()).await;

    match records {
        Ok(Ok(records)) => {
            info!(count = records.len(), "Returning captured transactions");
            (StatusCode::OK, Json(records)).into_response()
        }
        Ok(Err(e)) => {
            error!(error = %e, "Failed to query transaction store");
            envelope_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
                Some("Error retrieving data".to_string()),
            )
        }
        Err(e) => envelope_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            e.to_string(),
            Some("Error retrieving data".to_string()),
        ),
    }
}

/// GET /api/mock/config?server_name=<n> — the named descriptor as JSON.
async fn get_config(
    State(state): State<ControlState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let server_name = match require_server_name(&params) {
        Ok(name) => name,
        Err(response) => return response,
    };

    let Some(path) = config::find_config_file(&state.config_dir, &server_name) else {
        return envelope_error(
            StatusCode::NOT_FOUND,
            "configuration file not found",
            Some(format!("Configuration file not found: {server_name}")),
        );
    };

    let parsed = std::fs::read_to_string(&path)
        .map_err(|e| e.to_string())
        .and_then(|content| {
            serde_yaml::from_str::<serde_json::Value>(&content).map_err(|e| e.to_string())
        });

    match parsed {
        Ok(value) => {
            info!(server = %server_name, "Returning configuration");
            (StatusCode::OK, Json(value)).into_response()
        }
        Err(e) => {
            error!(server = %server_name, error = %e, "Failed to read configuration");
            envelope_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                e,
                Some("Error retrieving configuration".to_string()),
            )
        }
    }
}

/// PUT /api/mock/config?server_name=<n> — validate the JSON descriptor,
/// write it back as YAML atomically, then signal a restart.
async fn update_config(
    State(state): State<ControlState>,
    Query(params): Query<HashMap<String, String>>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    let server_name = match require_server_name(&params) {
        Ok(name) => name,
        Err(response) => return response,
    };

    let tree: MockServer = match serde_json::from_value(body.clone()) {
        Ok(tree) => tree,
        Err(e) => {
            return envelope_error(
                StatusCode::BAD_REQUEST,
                format!("invalid descriptor: {e}"),
                Some("Invalid JSON format".to_string()),
            );
        }
    };
    if let Err(e) = config::validate(&tree) {
        return envelope_error(StatusCode::BAD_REQUEST, e.to_string(), None);
    }

    let Some(path) = config::find_config_file(&state.config_dir, &server_name) else {
        return envelope_error(
            StatusCode::NOT_FOUND,
            "configuration file not found",
            Some(format!("Configuration file not found: {server_name}")),
        );
    };

    if let Err(e) = config::save_file(&tree, &path) {
        error!(server = %server_name, error = %e, "Failed to write configuration");
        return envelope_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            e.to_string(),
            Some("Error updating configuration".to_string()),
        );
    }

    info!(server = %server_name, "Configuration updated");

    let message = match state.restart_tx.try_send(server_name.clone()) {
        Ok(()) => "configuration updated; restart signaled".to_string(),
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(server = %server_name, "Restart channel full, dropping signal");
            format!("configuration updated; restart signal dropped: {}", CatalystError::ChannelFull)
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            warn!(server = %server_name, "Restart channel closed");
            format!("configuration updated; {}", CatalystError::ControllerClosed)
        }
    };

    (StatusCode::OK, Json(ApiResponse::success(body, message))).into_response()
}

fn require_server_name(params: &HashMap<String, String>) -> std::result::Result<String, Response> {
    let name = params
        .get("server_name")
        .map(|s| s.trim().to_string())
        .unwrap_or_default();

    if name.is_empty() {
        return Err(envelope_error(
            StatusCode::BAD_REQUEST,
            "invalid server name",
            Some("server_name parameter is required".to_string()),
        ));
    }
    if name.len() > 100 {
        return Err(envelope_error(
            StatusCode::BAD_REQUEST,
            "invalid server name",
            Some("server_name parameter is too long".to_string()),
        ));
    }
    Ok(name)
}

fn envelope_error(status: StatusCode, error: impl Into<String>, message: Option<String>) -> Response {
    (
        status,
        Json(ApiResponse::error(error, status.as_u16(), message)),
    )
        .into_response()
}

async fn log_request(req: axum::extract::Request, next: axum::middleware::Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = std::time::Instant::now();

    let response = next.run(req).await;

    info!(
        %method,
        path = %path,
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Control request"
    );
    response
}

fn handle_panic(err: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!(panic = detail, "Recovered panic in control plane");

    envelope_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal server error",
        Some("An unexpected error occurred".to_string()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_success_shape() {
        let response = ApiResponse::success(serde_json::json!({"a": 1}), "done");
        let encoded = serde_json::to_value(&response).unwrap();
        assert_eq!(encoded["success"], true);
        assert_eq!(encoded["code"], 200);
        assert_eq!(encoded["data"]["a"], 1);
        assert_eq!(encoded["message"], "done");
        assert!(encoded.get("error").is_none());
    }

    #[test]
    fn test_envelope_error_shape() {
        let response = ApiResponse::error("boom", 404, None);
        let encoded = serde_json::to_value(&response).unwrap();
        assert_eq!(encoded["success"], false);
        assert_eq!(encoded["error"], "boom");
        assert_eq!(encoded["code"], 404);
        assert!(encoded.get("data").is_none());
        assert!(encoded.get("message").is_none());
    }

    #[test]
    fn test_require_server_name_guards() {
        let mut params = HashMap::new();
        assert!(require_server_name(&params).is_err());

        params.insert("server_name".to_string(), "  ".to_string());
        assert!(require_server_name(&params).is_err());

        params.insert("server_name".to_string(), "x".repeat(101));
        assert!(require_server_name(&params).is_err());

        params.insert("server_name".to_string(), " alpha ".to_string());
        assert_eq!(require_server_name(&params).unwrap(), "alpha");
    }
}
