//! Test utilities for unit testing reconciliation logic.
//!
//! Helpers for building attachments and locks with just enough metadata for
//! the analysis paths under test.

use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use crds::{IPLock, IPLockSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference, Time};

use crate::lock::make_lock_name;

pub fn create_test_lock(
    namespace: &str,
    vni: u32,
    ip: Ipv4Addr,
    uid: &str,
    created_secs: i64,
    owner: Option<(&str, &str, bool)>,
) -> Arc<IPLock> {
    let owner_references = owner.map(|(owner_name, owner_uid, controller)| {
        vec![OwnerReference {
            api_version: "network.kos.dev/v1alpha1".to_string(),
            kind: "NetworkAttachment".to_string(),
            name: owner_name.to_string(),
            uid: owner_uid.to_string(),
            controller: Some(controller),
            ..Default::default()
        }]
    });
    Arc::new(IPLock {
        metadata: ObjectMeta {
            namespace: Some(namespace.to_string()),
            name: Some(make_lock_name(vni, ip)),
            uid: Some(uid.to_string()),
            creation_timestamp: Some(Time(Utc.timestamp_opt(created_secs, 0).unwrap())),
            owner_references,
            ..Default::default()
        },
        spec: IPLockSpec {
            subnet_name: "s1".to_string(),
        },
    })
}
