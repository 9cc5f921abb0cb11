//! Subnet CRD
//!
//! Declares a VNI plus an IPv4 CIDR block, scoped to a namespace.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "network.kos.dev",
    version = "v1alpha1",
    kind = "Subnet",
    namespaced,
    status = "SubnetStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct SubnetSpec {
    /// Virtual network identifier; fits in 21 bits
    pub vni: u32,

    /// IPv4 CIDR block, e.g. "10.0.0.0/24"
    pub ipv4: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct SubnetStatus {
    /// Whether this subnet passed validation. Once set, it stays set until
    /// the spec's VNI or CIDR changes.
    #[serde(default)]
    pub validated: bool,

    /// Errors found by the controllers, grouped by concern
    #[serde(default)]
    pub errors: SubnetErrors,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct SubnetErrors {
    /// Conflicts found during validation, in human-readable form
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation: Vec<String>,
}
