//! Host node binary.
//!
//! Runs the full node against simulated power, a synthetic tone and OS
//! sockets: `cargo run --bin node -- node.json`
//!
//! The config path may also come from `NODE_CONFIG`; without one the
//! defaults apply.
//!
//! ## Endpoints
//!
//! - Stats: http://localhost:8080/stats

use iot_audio_node::{Node, NodeConfig, NodeDrivers, NodeError};
use log::{error, info, warn};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

fn platform_init() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

fn config_path() -> Option<PathBuf> {
    std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("NODE_CONFIG").map(PathBuf::from))
}

fn load_config() -> Result<NodeConfig, String> {
    match config_path() {
        Some(path) => NodeConfig::load(&path).map_err(|e| format!("{:?}: {}", path, e)),
        None => {
            info!("No configuration given, using defaults");
            Ok(NodeConfig::default())
        }
    }
}

fn build_node(config: NodeConfig) -> Result<Node, NodeError> {
    let drivers = NodeDrivers::host(&config)?;
    Node::new(config, drivers)
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    platform_init();

    info!("=== IoT audio node starting ===");

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };
    let stats_port = config.stats_port;

    let mut node = match build_node(config) {
        Ok(node) => node,
        Err(e) => {
            error!("Failed to start node: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(port) = stats_port {
        info!("Stats server at http://localhost:{}/stats", port);
    }

    let cancel = CancellationToken::new();
    let exit = cancel.clone();
    let runner = tokio::task::spawn_blocking(move || node.run(&exit));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Failed to listen for Ctrl+C: {}", e);
            }
            info!("Shutting down...");
            cancel.cancel();
        }
        _ = cancel.cancelled() => {}
    }

    match runner.await {
        Ok(Ok(())) => info!("Goodbye"),
        Ok(Err(e)) => {
            error!("Node failed: {}", e);
            std::process::exit(1);
        }
        Err(e) => {
            error!("Node thread panicked: {}", e);
            std::process::exit(1);
        }
    }
}
