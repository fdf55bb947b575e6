//! Multi-listener supervisor.
//!
//! The supervisor owns the descriptor tree and the set of live listeners.
//! It builds each listener's router from its server entry (compiling
//! location schemas at creation), starts and stops listeners on their own
//! tasks, and performs the targeted restarts driven by the control plane —
//! including port changes, where the live listener must be found through
//! the previously stored configs rather than the reloaded one.

use crate::batcher::Batcher;
use crate::chaos::ChaosEngine;
use crate::config::{self, MockServer, Server};
use crate::error::{CatalystError, Result};
use crate::observability;
use crate::pipeline::{self, RouteState};
use crate::random::RandomCaches;
use crate::schema::SchemaCache;
use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use axum::routing::{MethodFilter, MethodRouter};
use axum::Router;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Grace period for a listener to finish in-flight requests on stop.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
/// How long a restart waits for the relevant port to come free.
const PORT_FREE_WAIT: Duration = Duration::from_secs(5);
/// Restart attempts before giving up.
const RESTART_ATTEMPTS: u32 = 3;

/// A live listener bound to its port.
pub struct Listener {
    pub port: u16,
    pub server_name: String,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Listener {
    /// Signal graceful shutdown and wait out the grace period.
    async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if tokio::time::timeout(SHUTDOWN_GRACE, self.handle)
            .await
            .is_err()
        {
            warn!(port = self.port, "Listener did not stop within grace period");
        }
    }
}

struct SupervisorState {
    /// Built but not yet started listeners.
    pending: Vec<(Server, Router)>,
    /// Running listeners by port.
    listeners: HashMap<u16, Listener>,
    /// The descriptor trees currently considered active.
    configs: Vec<MockServer>,
}

/// Owns the listener fleet. All mutation happens under one async mutex.
pub struct Supervisor {
    state: tokio::sync::Mutex<SupervisorState>,
    config_dir: Option<PathBuf>,
    batcher: Arc<Batcher>,
    caches: Arc<RandomCaches>,
    chaos: Arc<ChaosEngine>,
    http_client: reqwest::Client,
}

impl Supervisor {
    pub fn new(
        config_dir: Option<PathBuf>,
        batcher: Arc<Batcher>,
        caches: Arc<RandomCaches>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: tokio::sync::Mutex::new(SupervisorState {
                pending: Vec::new(),
                listeners: HashMap::new(),
                configs: Vec::new(),
            }),
            config_dir,
            batcher,
            caches,
            chaos: Arc::new(ChaosEngine::new()),
            http_client: reqwest::Client::new(),
        })
    }

    /// Build a listener for every server in the tree. Duplicate ports and
    /// schema compile failures are rejected here, before anything binds.
    pub async fn create_servers(&self, tree: &MockServer) -> Result<()> {
        let mut state = self.state.lock().await;

        for server in &tree.http.servers {
            let occupied = state.listeners.contains_key(&server.listen)
                || state.pending.iter().any(|(s, _)| s.listen == server.listen);
            if occupied {
                return Err(CatalystError::InvalidConfig {
                    field: "http.servers.listen".to_string(),
                    reason: format!("server on port {} already exists", server.listen),
                });
            }

            let router = self.build_router(server)?;
            info!(
                server = %server.name,
                port = server.listen,
                locations = server.location.len(),
                "Listener created"
            );
            state.pending.push((server.clone(), router));
        }

        state.configs.push(tree.clone());
        Ok(())
    }

    /// Start every pending listener on its own task. A listener that fails
    /// to bind is logged and skipped; it does not cascade.
    pub async fn start_all(&self) {
        let mut state = self.state.lock().await;
        let pending = std::mem::take(&mut state.pending);

        for (server, router) in pending {
            match start_listener(&server, router).await {
                Ok(listener) => {
                    state.listeners.insert(listener.port, listener);
                }
                Err(e) => {
                    error!(server = %server.name, port = server.listen, error = %e, "Failed to start listener");
                }
            }
        }
    }

    /// Gracefully stop every listener.
    pub async fn stop_all(&self) {
        let mut state = self.state.lock().await;
        let listeners: Vec<Listener> = state.listeners.drain().map(|(_, l)| l).collect();
        drop(state);

        for listener in listeners {
            info!(port = listener.port, server = %listener.server_name, "Stopping listener");
            listener.stop().await;
        }
    }

    /// Restart the named server from its descriptor file: up to three
    /// attempts with linear backoff; final failure leaves the listener
    /// absent.
    pub async fn restart(&self, server_name: &str) -> Result<()> {
        let mut last_error = CatalystError::ServerNotFound(server_name.to_string());

        for attempt in 1..=RESTART_ATTEMPTS {
            info!(server = server_name, attempt, "Restart attempt");
            match self.restart_attempt(server_name).await {
                Ok(()) => {
                    info!(server = server_name, attempt, "Restart succeeded");
                    observability::record_restart(server_name, true);
                    return Ok(());
                }
                Err(e) => {
                    warn!(server = server_name, attempt, error = %e, "Restart attempt failed");
                    last_error = e;
                    if attempt < RESTART_ATTEMPTS {
                        tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
                    }
                }
            }
        }

        error!(server = server_name, error = %last_error, "Restart failed after all attempts");
        observability::record_restart(server_name, false);
        Err(last_error)
    }

    async fn restart_attempt(&self, server_name: &str) -> Result<()> {
        let config_dir = self
            .config_dir
            .as_ref()
            .ok_or_else(|| CatalystError::ConfigNotFound(server_name.to_string()))?;

        let config_file = config::find_config_file(config_dir, server_name)
            .ok_or_else(|| CatalystError::ConfigNotFound(server_name.to_string()))?;
        let tree = config::load_file(&config_file)?;

        let target = tree
            .http
            .servers
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(server_name))
            .cloned()
            .ok_or_else(|| CatalystError::ServerNotFound(server_name.to_string()))?;
        let new_port = target.listen;

        let mut state = self.state.lock().await;

        // Locate the live listener: it may still be bound to the port the
        // *previous* descriptor declared, so search cached configs too.
        let old_port = if state.listeners.contains_key(&new_port) {
            Some(new_port)
        } else {
            state
                .configs
                .iter()
                .flat_map(|c| c.http.servers.iter())
                .find(|s| s.name.eq_ignore_ascii_case(server_name))
                .map(|s| s.listen)
                .filter(|port| state.listeners.contains_key(port))
        };

        if let Some(port) = old_port {
            if let Some(listener) = state.listeners.remove(&port) {
                info!(server = server_name, port, "Draining old listener");
                listener.stop().await;
            }
        } else {
            info!(server = server_name, port = new_port, "Server not running, will start fresh");
        }

        if !wait_for_port_free(new_port, PORT_FREE_WAIT).await {
            return Err(CatalystError::PortBusy(new_port));
        }

        let router = self.build_router(&target)?;
        let listener = start_listener(&target, router).await?;
        state.listeners.insert(listener.port, listener);

        // Swap the stored tree for this server's descriptor.
        let replaced = state.configs.iter_mut().find(|c| {
            c.http
                .servers
                .iter()
                .any(|s| s.name.eq_ignore_ascii_case(server_name))
        });
        match replaced {
            Some(slot) => *slot = tree,
            None => state.configs.push(tree),
        }

        Ok(())
    }

    /// Ports of all running listeners.
    pub async fn listener_ports(&self) -> Vec<u16> {
        let state = self.state.lock().await;
        let mut ports: Vec<u16> = state.listeners.keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    /// Build the axum router for one server entry, registering every
    /// location (including its schema) and the panic-recovery layer.
    fn build_router(&self, server: &Server) -> Result<Router> {
        let mut schemas = SchemaCache::new();
        for location in &server.location {
            if let Some(schema) = &location.schema {
                schemas.register(&location.path, location.method, schema)?;
            }
        }
        let schemas = Arc::new(schemas);

        let mut router = Router::new();
        let mut method_routers: HashMap<String, MethodRouter> = HashMap::new();

        for location in &server.location {
            let state = Arc::new(RouteState {
                location: location.clone(),
                server_name: server.name.clone(),
                request_logging: server.logger,
                schemas: Arc::clone(&schemas),
                chaos: Arc::clone(&self.chaos),
                caches: Arc::clone(&self.caches),
                batcher: Arc::clone(&self.batcher),
                http_client: self.http_client.clone(),
            });

            if location.is_static() {
                let dir = location.static_files_dir.clone().unwrap_or_default();
                info!(path = %location.path, dir = %dir, "Registering static mount");
                router = router.nest(&location.path, static_router(state, &dir));
                continue;
            }

            info!(
                method = %location.method,
                path = %location.path,
                status = location.status_code,
                "Registered route"
            );
            let handler = move |req: Request| {
                let state = Arc::clone(&state);
                async move { pipeline::handle(state, req).await }
            };
            let entry = method_routers.remove(&location.path).unwrap_or_default();
            method_routers.insert(
                location.path.clone(),
                entry.on(method_filter(location.method), handler),
            );
        }

        for (path, method_router) in method_routers {
            router = router.route(&path, method_router);
        }

        Ok(router.layer(tower_http::catch_panic::CatchPanicLayer::custom(
            handle_panic,
        )))
    }
}

/// Serve a static directory while still capturing each transaction.
fn static_router(state: Arc<RouteState>, dir: &str) -> Router {
    let capture_state = Arc::clone(&state);
    Router::new()
        .fallback_service(tower_http::services::ServeDir::new(dir))
        .layer(axum::middleware::from_fn(
            move |req: Request, next: axum::middleware::Next| {
                let state = Arc::clone(&capture_state);
                async move { pipeline::capture_static(state, req, next).await }
            },
        ))
}

/// Bind the listener's port and serve its router until shutdown.
async fn start_listener(server: &Server, router: Router) -> Result<Listener> {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], server.listen));
    let tcp = TcpListener::bind(addr)
        .await
        .map_err(|_| CatalystError::PortBusy(server.listen))?;

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let port = server.listen;
    let name = server.name.clone();
    let version = server.version.clone();

    let handle = tokio::spawn(async move {
        info!(server = %name, %version, port, "Listener started");
        let serve = axum::serve(tcp, router).with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        });
        if let Err(e) = serve.await {
            error!(server = %name, port, error = %e, "Listener terminated with error");
        }
    });

    Ok(Listener {
        port,
        server_name: server.name.clone(),
        shutdown_tx,
        handle,
    })
}

fn method_filter(method: crate::config::HttpMethod) -> MethodFilter {
    use crate::config::HttpMethod;
    match method {
        HttpMethod::GET => MethodFilter::GET,
        HttpMethod::POST => MethodFilter::POST,
        HttpMethod::PUT => MethodFilter::PUT,
        HttpMethod::DELETE => MethodFilter::DELETE,
        HttpMethod::PATCH => MethodFilter::PATCH,
    }
}

/// Panic recovery: the client sees a generic 500 and no other request is
/// affected.
fn handle_panic(err: Box<dyn std::any::Any + Send + 'static>) -> Response<Body> {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!(panic = detail, "Recovered panic in request handler");

    let mut response = Response::new(Body::from(
        serde_json::json!({ "error": "internal server error" }).to_string(),
    ));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

/// Whether the port can be bound right now.
pub fn is_port_available(port: u16) -> bool {
    std::net::TcpListener::bind(("0.0.0.0", port)).is_ok()
}

/// Poll until the port frees up or the deadline passes.
pub async fn wait_for_port_free(port: u16, max_wait: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + max_wait;
    while tokio::time::Instant::now() < deadline {
        if is_port_available(port) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    is_port_available(port)
}
