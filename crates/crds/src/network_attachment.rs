//! NetworkAttachment CRD
//!
//! A workload's request to attach to a subnet. The spec is authored by the
//! user; the status is written by the IPAM controller once an address has
//! been locked.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "network.kos.dev",
    version = "v1alpha1",
    kind = "NetworkAttachment",
    namespaced,
    status = "NetworkAttachmentStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct NetworkAttachmentSpec {
    /// Name of a Subnet in the same namespace
    pub subnet: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct NetworkAttachmentStatus {
    /// Assigned address; empty until an address has been locked
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ipv4: String,

    /// VNI of the subnet at the time of assignment
    #[serde(default)]
    pub address_vni: u32,

    /// UID of the IPLock backing the assignment
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub lock_uid: String,
}
