//! Controller-specific error types.

use std::net::Ipv4Addr;

use controller_util::NamespacedName;
use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur in the IPAM controller. Every variant surfaces as
/// either a rate-limited requeue or a logged drop; none is fatal to the
/// process.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// The subnet block is exhausted
    #[error("no IP address available in {vni:x}/{base:x}--{last:x} for {attachment}")]
    NoAddressAvailable {
        vni: u32,
        base: u32,
        last: u32,
        attachment: NamespacedName,
    },

    /// The local address cache believed an address was free but the store
    /// holds a foreign lock for it
    #[error("cache incoherence at {0}")]
    CacheIncoherence(String),

    /// IPLock creation failed
    #[error("create of IPLock {lock} for {attachment} failed: {source}")]
    LockCreate {
        lock: String,
        attachment: NamespacedName,
        source: KubeError,
    },

    /// An allegedly existing IPLock could not be fetched
    #[error("failed to fetch allegedly existing IPLock {lock} for {attachment}: {source}")]
    LockFetch {
        lock: String,
        attachment: NamespacedName,
        source: KubeError,
    },

    /// Attachment status update failed
    #[error("failed to update status of NetworkAttachment {attachment} to record address {ip}: {source}")]
    StatusUpdate {
        attachment: NamespacedName,
        ip: Ipv4Addr,
        source: KubeError,
    },

    /// Object serialization failed
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Metric registration failed
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource watch failed
    #[error("resource watch failed: {0}")]
    Watch(String),
}
