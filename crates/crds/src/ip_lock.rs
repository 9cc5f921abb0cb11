//! IPLock CRD
//!
//! Existence of an IPLock claims one (VNI, IPv4) pair for exactly one
//! NetworkAttachment. The claim itself lives in the object's *name*
//! ("v1-<vni>-<a>-<b>-<c>-<d>"): the store's uniqueness constraint on
//! (namespace, name) is the mutual-exclusion primitive. The owning
//! attachment is recorded as a controller owner reference.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "network.kos.dev",
    version = "v1alpha1",
    kind = "IPLock",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct IPLockSpec {
    /// Name of the subnet the locked address was taken from
    pub subnet_name: String,
}
