//! Prometheus metrics for the IPAM controller.
//!
//! Histograms around every I/O boundary, served as text exposition on a
//! configurable HTTP address and path.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, Histogram, HistogramOpts, HistogramVec, Registry, TextEncoder};
use tracing::info;

/// Namespace and subsystem of every metric produced here.
const METRICS_NAMESPACE: &str = "kos";
const METRICS_SUBSYSTEM: &str = "ipam";

pub struct IpamMetrics {
    registry: Registry,

    /// IPLock.creationTimestamp - NetworkAttachment.creationTimestamp.
    /// Negative buckets surface clock skew between apiserver replicas.
    pub attachment_create_to_lock: Histogram,

    /// Round trip time to create/delete an IPLock, labelled by op and err
    pub lock_op: HistogramVec,

    /// Attachment creationTimestamp to return from status update
    pub attachment_create_to_address: Histogram,

    /// Round trip time to update attachment status
    pub attachment_update: Histogram,

    /// Kind of anticipation use (0, 1, or 2)
    pub anticipation_used: Histogram,

    /// Was the IP address in the status absent from the lock cache (0 or 1)?
    pub status_used: Histogram,
}

fn histogram_opts(name: &str, help: &str, buckets: Vec<f64>) -> HistogramOpts {
    HistogramOpts::new(name, help)
        .namespace(METRICS_NAMESPACE)
        .subsystem(METRICS_SUBSYSTEM)
        .buckets(buckets)
}

impl IpamMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let attachment_create_to_lock = Histogram::with_opts(histogram_opts(
            "attachment_create_to_lock_latency_seconds",
            "Latency from attachment creationTimestamp to IPLock creationTimestamp, in seconds",
            vec![
                -1.0, 0.0, 1.0, 2.0, 3.0, 4.0, 6.0, 8.0, 12.0, 16.0, 24.0, 32.0, 64.0,
            ],
        ))?;

        let lock_op = HistogramVec::new(
            histogram_opts(
                "ip_lock_latency_seconds",
                "Round trip latency to create/delete IPLock object, in seconds",
                vec![
                    -0.125, 0.0, 0.125, 0.25, 0.5, 1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0,
                ],
            ),
            &["op", "err"],
        )?;

        let attachment_create_to_address = Histogram::with_opts(histogram_opts(
            "attachment_create_to_address_latency_seconds",
            "Latency from attachment creationTimestamp to return from status update, in seconds",
            vec![
                -1.0, 0.0, 1.0, 2.0, 3.0, 4.0, 6.0, 8.0, 12.0, 16.0, 24.0, 32.0, 64.0,
            ],
        ))?;

        let attachment_update = Histogram::with_opts(histogram_opts(
            "attachment_update_latency_seconds",
            "Round trip latency to set attachment address, in seconds",
            vec![
                -0.125, 0.0, 0.125, 0.25, 0.5, 1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0,
            ],
        ))?;

        let anticipation_used = Histogram::with_opts(histogram_opts(
            "anticipation_used",
            "Kind of anticipation use",
            vec![0.0, 1.0, 2.0],
        ))?;

        let status_used = Histogram::with_opts(histogram_opts(
            "status_used",
            "Was the IP address in status used?",
            vec![0.0, 1.0],
        ))?;

        registry.register(Box::new(attachment_create_to_lock.clone()))?;
        registry.register(Box::new(lock_op.clone()))?;
        registry.register(Box::new(attachment_create_to_address.clone()))?;
        registry.register(Box::new(attachment_update.clone()))?;
        registry.register(Box::new(anticipation_used.clone()))?;
        registry.register(Box::new(status_used.clone()))?;

        Ok(Self {
            registry,
            attachment_create_to_lock,
            lock_op,
            attachment_create_to_address,
            attachment_update,
            anticipation_used,
            status_used,
        })
    }
}

/// Serves the text exposition endpoint until the process exits.
pub async fn serve(
    metrics: Arc<IpamMetrics>,
    addr: SocketAddr,
    path: String,
) -> std::io::Result<()> {
    let app = Router::new()
        .route(&path, get(render))
        .with_state(metrics);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Serving metrics on http://{}{}", addr, path);
    axum::serve(listener, app.into_make_service()).await
}

async fn render(State(metrics): State<Arc<IpamMetrics>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    match encoder.encode(&metrics.registry.gather(), &mut buf) {
        Ok(()) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, encoder.format_type().to_string())],
            buf,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, "text/plain".to_string())],
            e.to_string().into_bytes(),
        ),
    }
}
