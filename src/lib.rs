//! Catalyst - a declarative mock HTTP server platform.
//!
//! Catalyst launches a fleet of independent HTTP listeners from YAML
//! descriptors. Routes, responses, request-schema validation, chaos
//! injection and fan-out side effects are all described as data. Every
//! served request is durably captured into an embedded SQLite store
//! through a batched writer, and a control-plane listener can read and
//! rewrite descriptors at runtime, restarting just the affected listener.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Catalyst                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Listeners: chaos → schema → template → fan-out → capture   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Control plane: data | config read/write | restart signals  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Supervisor: create / start / stop / targeted restart       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Batcher: bounded queues | batch workers | SQLite store     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use catalyst::config;
//!
//! #[tokio::main]
//! async fn main() -> catalyst::Result<()> {
//!     let dir = std::path::PathBuf::from("./config");
//!     let trees = config::load_dir(&dir)?;
//!     catalyst::run(trees, dir, catalyst::RuntimeOptions::default()).await
//! }
//! ```

pub mod batcher;
pub mod chaos;
pub mod config;
pub mod control;
pub mod error;
pub mod fanout;
pub mod observability;
pub mod pipeline;
pub mod random;
pub mod schema;
pub mod shutdown;
pub mod store;
pub mod supervisor;
pub mod template;

// Re-exports
pub use error::{CatalystError, Result};

use batcher::{Batcher, BatcherConfig};
use config::MockServer;
use control::ControlState;
use observability::ObservabilityConfig;
use random::RandomCaches;
use shutdown::ShutdownCoordinator;
use std::path::PathBuf;
use std::sync::Arc;
use store::Store;
use supervisor::Supervisor;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Process-level settings that are not part of any descriptor.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Control-plane port.
    pub control_port: u16,
    /// SQLite database file for captured transactions.
    pub db_path: PathBuf,
    /// Batched-writer tuning.
    pub batcher: BatcherConfig,
    /// Logging and metrics settings.
    pub observability: ObservabilityConfig,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            control_port: control::DEFAULT_CONTROL_PORT,
            db_path: PathBuf::from("./catalyst.db"),
            batcher: BatcherConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

/// Run Catalyst: wire store → batcher → supervisor → control plane and
/// serve until SIGINT/SIGTERM, then shut everything down gracefully.
pub async fn run(
    configs: Vec<MockServer>,
    config_dir: PathBuf,
    options: RuntimeOptions,
) -> Result<()> {
    info!(
        descriptors = configs.len(),
        config_dir = %config_dir.display(),
        "Starting Catalyst"
    );

    let store = Store::open(&options.db_path)?;
    let batcher = Arc::new(Batcher::new(store.clone(), options.batcher.clone()));
    batcher.start();

    let caches = RandomCaches::new();
    let supervisor = Supervisor::new(
        Some(config_dir.clone()),
        Arc::clone(&batcher),
        Arc::clone(&caches),
    );

    for tree in &configs {
        supervisor.create_servers(tree).await?;
    }
    supervisor.start_all().await;

    let coordinator = ShutdownCoordinator::new();

    let (restart_tx, restart_rx) = mpsc::channel(control::RESTART_CHANNEL_CAPACITY);
    let consumer = control::spawn_restart_consumer(
        restart_rx,
        Arc::clone(&supervisor),
        coordinator.clone(),
    );

    let control_state = ControlState {
        store: store.clone(),
        config_dir,
        restart_tx,
    };
    let control_coordinator = coordinator.clone();
    let control_port = options.control_port;
    let control_handle = tokio::spawn(async move {
        if let Err(e) =
            control::run_control_server(control_port, control_state, control_coordinator).await
        {
            error!(error = %e, "Control plane error");
        }
    });

    if options.observability.metrics_enabled {
        let obs = options.observability.clone();
        tokio::spawn(async move {
            if let Err(e) = observability::run_metrics_server(obs).await {
                error!(error = %e, "Metrics server error");
            }
        });
    }

    tokio::spawn(shutdown::listen_for_signals(coordinator.clone()));

    coordinator.wait_for_shutdown().await;
    info!("Shutting down Catalyst gracefully");

    supervisor.stop_all().await;
    let _ = consumer.await;
    batcher.stop().await;

    if !control_handle.is_finished() {
        warn!("Force aborting control plane");
        control_handle.abort();
    }

    info!("Catalyst shutdown complete");
    Ok(())
}
