//! Catalyst server binary.

use catalyst::batcher::BatcherConfig;
use catalyst::observability::{self, ObservabilityConfig};
use catalyst::{config, RuntimeOptions};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "catalyst-server")]
#[command(about = "Catalyst declarative mock HTTP server")]
struct Args {
    /// Directory containing YAML descriptor files
    #[arg(short, long, env = "CONFIG_DIR")]
    config: Option<PathBuf>,

    /// Path to a specific YAML descriptor file
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Control-plane port
    #[arg(long, default_value_t = catalyst::control::DEFAULT_CONTROL_PORT)]
    control_port: u16,

    /// SQLite database file for captured transactions
    #[arg(long, default_value = "./catalyst.db")]
    db: PathBuf,

    /// Metrics listener bind address
    #[arg(long, default_value = "0.0.0.0:9090")]
    metrics_addr: SocketAddr,

    /// Disable the Prometheus metrics listener
    #[arg(long)]
    no_metrics: bool,

    /// Log level used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit JSON logs
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load descriptors from a single file or from the directory.
    let (configs, config_dir) = if let Some(file) = &args.file {
        let tree = config::load_file(file)?;
        let dir = file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        (vec![tree], dir)
    } else {
        let dir = args
            .config
            .clone()
            .unwrap_or_else(config::config_dir_from_env);
        (config::load_dir(&dir)?, dir)
    };

    // The first configured logger path doubles as a log file sink.
    let log_file = configs
        .iter()
        .flat_map(|c| c.http.servers.iter())
        .find(|s| s.logger && !s.logger_path.is_empty())
        .map(|s| PathBuf::from(&s.logger_path));

    let observability_config = ObservabilityConfig {
        metrics_enabled: !args.no_metrics,
        metrics_addr: args.metrics_addr,
        log_level: args.log_level.clone(),
        json_logs: args.json_logs,
        log_file,
    };
    observability::init(&observability_config)?;

    let options = RuntimeOptions {
        control_port: args.control_port,
        db_path: args.db.clone(),
        batcher: BatcherConfig::default(),
        observability: observability_config,
    };

    catalyst::run(configs, config_dir, options).await?;
    Ok(())
}
