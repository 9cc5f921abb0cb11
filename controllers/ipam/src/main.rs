//! IPAM Controller
//!
//! Assigns IPv4 addresses to NetworkAttachments. For each attachment the
//! controller picks a free address inside the referenced subnet's block,
//! durably claims it by creating an IPLock named after the (VNI, address)
//! pair, and publishes the result in the attachment's status. The loop
//! tolerates concurrent controllers, crashes between steps, and reordered
//! watch notifications.

mod controller;
mod error;
mod lock;
mod metrics;
mod reconciler;
#[cfg(test)]
mod test_utils;
mod watcher;

use std::env;
use std::net::SocketAddr;
use std::sync::Arc;

use kube::Client;
use tracing::info;

use crate::controller::{Config, IpamController};
use crate::error::ControllerError;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt::init();

    info!("Starting IPAM Controller");

    // Load configuration from environment variables
    let workers = env::var("WORKERS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(2);
    let metrics_addr: SocketAddr = env::var("METRICS_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:9295".to_string())
        .parse()
        .map_err(|e| {
            ControllerError::InvalidConfig(format!("METRICS_ADDR is not a socket address: {e}"))
        })?;
    let metrics_path = env::var("METRICS_PATH").unwrap_or_else(|_| "/metrics".to_string());

    info!("Configuration:");
    info!("  Workers: {}", workers);
    info!("  Metrics: http://{}{}", metrics_addr, metrics_path);

    let client = Client::try_default().await?;
    let controller = IpamController::new(
        client,
        Config {
            workers,
            metrics_addr,
            metrics_path,
        },
    )?;
    Arc::new(controller).run().await
}
