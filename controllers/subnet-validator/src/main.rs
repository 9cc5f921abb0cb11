//! Subnet Validator
//!
//! Validates Subnets: among all subnets with the same VNI, CIDR blocks must
//! be pairwise disjoint and all must live in one namespace. The verdict is
//! written into each subnet's status, and resolution of one subnet triggers
//! revalidation of the subnets it used to conflict with.

mod conflicts;
mod controller;
mod error;
mod reconciler;
mod summary;
mod watcher;

use std::env;
use std::sync::Arc;

use kube::Client;
use tracing::info;

use crate::controller::Validator;
use crate::error::ControllerError;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt::init();

    info!("Starting subnet validation controller");

    let workers = env::var("WORKERS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(2);
    info!("Configuration:");
    info!("  Workers: {}", workers);

    let client = Client::try_default().await?;
    let validator = Validator::new(client, workers);
    Arc::new(validator).run().await
}
