//! Per-attachment reconciliation.
//!
//! Each pass analyzes the attachment against its subnet and the locks it
//! owns, releases locks it should no longer hold, then either keeps the
//! lock already published in its status, recovers an orphaned lock, trusts
//! an in-flight anticipated write, or picks and locks a fresh address and
//! publishes it.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use controller_util::{api_errors, NamespacedName};
use crds::{IPLock, IPLockSpec, NetworkAttachment, NetworkAttachmentStatus};
use ipnet::Ipv4Net;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::{DeleteParams, PostParams, Preconditions};
use kube::Resource;
use tracing::{debug, error, info, warn};

use crate::controller::{lock_guard, IpamController, NetworkAttachmentData, OWNING_ATTACHMENT_INDEX};
use crate::error::ControllerError;
use crate::lock::{self, ParsedLock, ParsedLockList};

/// What analysis concluded about one attachment: the subnet it wants, the
/// block bounds it must fit, and at most one lock worth keeping.
#[derive(Debug, Default)]
pub(crate) struct Analysis {
    pub subnet_name: String,
    pub subnet_rv: String,
    pub vni: u32,
    pub base_u: u32,
    pub last_u: u32,
    /// The usable lock already recorded in the attachment's status
    pub lock_in_status: Option<ParsedLock>,
    /// A usable lock recovered from a crash or a double-create race
    pub lock_for_status: Option<ParsedLock>,
}

/// Partition of the locks owned by one attachment name.
#[derive(Debug, Default)]
pub(crate) struct LockPartition {
    /// Owned by an older or newer edition of the attachment; never deleted
    /// here, a newer edition may have authority this reconciler has not
    /// observed yet
    pub time_slippers: ParsedLockList,
    /// Right owner, wrong (VNI, address-in-block)
    pub undesired: ParsedLockList,
    /// Right owner, right VNI, address inside the current block
    pub usable: ParsedLockList,
    /// The usable lock matching status.lockUID and status.ipv4
    pub lock_in_status: Option<ParsedLock>,
    /// Addresses of every lock looked at, to detect informer lag
    pub considered: HashSet<u32>,
}

/// Status fields and identity of the attachment being reconciled.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AttachmentFacts<'a> {
    pub uid: &'a str,
    pub status_ipv4: &'a str,
    pub status_lock_uid: &'a str,
}

impl LockPartition {
    pub(crate) fn consider(
        &mut self,
        ipl: &Arc<IPLock>,
        facts: Option<AttachmentFacts<'_>>,
        desired_vni: u32,
        desired_base_u: u32,
        desired_last_u: u32,
    ) {
        let Ok(parsed) = ParsedLock::from_lock(ipl) else {
            return;
        };
        self.considered.insert(parsed.addr_u);
        let owner_uid = lock::get_owner(&ipl.metadata, "NetworkAttachment")
            .map(|(_, uid)| uid)
            .unwrap_or_default();
        if let Some(facts) = facts {
            if owner_uid != facts.uid {
                self.time_slippers.push(parsed);
                return;
            }
        }
        if parsed.vni != desired_vni
            || parsed.addr_u < desired_base_u
            || parsed.addr_u > desired_last_u
        {
            self.undesired.push(parsed);
            return;
        }
        if let Some(facts) = facts {
            if parsed.uid == facts.status_lock_uid
                && !facts.status_ipv4.is_empty()
                && facts.status_ipv4 == parsed.ip().to_string()
            {
                self.lock_in_status = Some(parsed.clone());
            }
        }
        self.usable.push(parsed);
    }
}

/// Bounds of a CIDR block, as numbers.
pub(crate) fn block_bounds(block: &Ipv4Net) -> (u32, u32) {
    (u32::from(block.network()), u32::from(block.broadcast()))
}

/// Shrinks a block by the reserved addresses: the first two and the last
/// one, when the block holds at least four.
pub(crate) fn pickable_range(base_u: u32, last_u: u32) -> (u32, u32) {
    if last_u - base_u >= 3 {
        (base_u + 2, last_u - 1)
    } else {
        (base_u, last_u)
    }
}

/// Anticipation is only valid while the attachment sits at one of the two
/// resourceVersions bracketing our status write and the subnet has not
/// moved either.
pub(crate) fn anticipation_is_stale(
    data: &NetworkAttachmentData,
    att_rv: Option<&str>,
    subnet_rv: &str,
) -> bool {
    let Some(att_rv) = att_rv else {
        return true;
    };
    let rv_matches = data.anticipating_resource_version == att_rv
        || data.anticipated_resource_version == att_rv;
    !rv_matches || data.anticipation_subnet_rv != subnet_rv
}

impl IpamController {
    pub(crate) async fn process_network_attachment(
        &self,
        nsn: &NamespacedName,
    ) -> Result<(), ControllerError> {
        let att = self.attachments.get(nsn);
        let nadat = self.get_attachment_data(nsn, att.is_some());

        let Some(analysis) = self
            .analyze_and_release(nsn, att.as_deref(), nadat.as_deref())
            .await?
        else {
            // Wait-for-notification outcome; the triggering event re-enqueues.
            return Ok(());
        };

        let Some(att) = att else {
            if nadat.is_some() {
                self.clear_attachment_data(nsn);
            }
            return Ok(());
        };
        if analysis.lock_in_status.is_some() {
            return Ok(());
        }
        let Some(nadat) = nadat else {
            return Ok(());
        };

        let anticipated_ipv4 = lock_guard(&nadat).anticipated_ipv4;
        let att_rv = att.metadata.resource_version.as_deref().unwrap_or_default();
        let (lock_for_status, ip_for_status) = if let Some(lfs) = analysis.lock_for_status.clone() {
            let ip = lfs.ip();
            if Some(ip) == anticipated_ipv4 {
                debug!(
                    "Anticipation used with clue for attachment {}, resourceVersion={}",
                    nsn, att_rv
                );
                self.metrics.anticipation_used.observe(1.0);
                return Ok(());
            }
            (lfs, ip)
        } else if anticipated_ipv4.is_some() {
            debug!(
                "Anticipation used for attachment {}, resourceVersion={}",
                nsn, att_rv
            );
            self.metrics.anticipation_used.observe(2.0);
            return Ok(());
        } else {
            match self.pick_and_lock_address(nsn, &att, &analysis).await {
                Ok(Some(pair)) => pair,
                Ok(None) => {
                    // Permanent creation failure; nothing to publish.
                    self.metrics.anticipation_used.observe(0.0);
                    return Ok(());
                }
                Err(e) => {
                    self.metrics.anticipation_used.observe(0.0);
                    return Err(e);
                }
            }
        };
        let result = self
            .set_ip_in_status(nsn, &att, &nadat, &analysis.subnet_rv, &lock_for_status, ip_for_status)
            .await;
        self.metrics.anticipation_used.observe(0.0);
        result
    }

    /// Gathers desired state, partitions the owned locks, invalidates stale
    /// anticipation, and releases what should not survive. `Ok(None)` means
    /// drop without error and wait for a notification.
    async fn analyze_and_release(
        &self,
        nsn: &NamespacedName,
        att: Option<&NetworkAttachment>,
        nadat: Option<&Mutex<NetworkAttachmentData>>,
    ) -> Result<Option<Analysis>, ControllerError> {
        let mut analysis = Analysis::default();
        let mut status_ipv4 = String::new();
        let mut status_lock_uid = String::new();
        let mut att_uid = String::new();

        if let Some(att) = att {
            if let Some(status) = &att.status {
                status_ipv4 = status.ipv4.clone();
                status_lock_uid = status.lock_uid.clone();
            }
            analysis.subnet_name = att.spec.subnet.clone();
            att_uid = att.metadata.uid.clone().unwrap_or_default();

            let subnet_key = NamespacedName::new(&nsn.namespace, &analysis.subnet_name);
            let Some(subnet) = self.subnets.get(&subnet_key) else {
                error!(
                    "NetworkAttachment {} references Subnet {}, which does not exist now",
                    nsn, analysis.subnet_name
                );
                // Requeued upon notification of subnet creation.
                return Ok(None);
            };
            analysis.vni = subnet.spec.vni;
            analysis.subnet_rv = subnet
                .metadata
                .resource_version
                .clone()
                .unwrap_or_default();
            let block: Ipv4Net = match subnet.spec.ipv4.parse() {
                Ok(block) => block,
                Err(e) => {
                    warn!(
                        "NetworkAttachment {} references subnet {}, which has malformed spec.ipv4 {:?}: {}",
                        nsn, analysis.subnet_name, subnet.spec.ipv4, e
                    );
                    // A subnet update will trigger reconsideration.
                    return Ok(None);
                }
            };
            (analysis.base_u, analysis.last_u) = block_bounds(&block);
        }

        let facts = att.map(|_| AttachmentFacts {
            uid: &att_uid,
            status_ipv4: &status_ipv4,
            status_lock_uid: &status_lock_uid,
        });

        let mut partition = LockPartition::default();
        for ipl in self.locks.by_index(OWNING_ATTACHMENT_INDEX, &nsn.name) {
            partition.consider(&ipl, facts, analysis.vni, analysis.base_u, analysis.last_u);
        }

        if att.is_some() && !status_ipv4.is_empty() {
            // Make sure the lock backing the status is not skipped just
            // because its notification has not arrived yet.
            if let Ok(status_ip) = status_ipv4.parse::<Ipv4Addr>() {
                let mut status_used = 0.0;
                if !partition.considered.contains(&u32::from(status_ip)) {
                    let lock_name = lock::make_lock_name(analysis.vni, status_ip);
                    match self.lock_api(&nsn.namespace).get(&lock_name).await {
                        Ok(fetched) => {
                            let owner_name = lock::get_owner(&fetched.metadata, "NetworkAttachment")
                                .map(|(name, _)| name);
                            if owner_name.as_deref() == Some(&nsn.name) {
                                status_used = 1.0;
                                partition.consider(
                                    &Arc::new(fetched),
                                    facts,
                                    analysis.vni,
                                    analysis.base_u,
                                    analysis.last_u,
                                );
                            }
                        }
                        Err(e) => {
                            info!(
                                "For NetworkAttachment {} failed to fetch lock {} for IP in status: {}",
                                nsn, lock_name, e
                            );
                        }
                    }
                }
                self.metrics.status_used.observe(status_used);
            }
        }

        if let Some(nadat) = nadat {
            let mut data = lock_guard(nadat);
            let att_rv = att.and_then(|a| a.metadata.resource_version.as_deref());
            if anticipation_is_stale(&data, att_rv, &analysis.subnet_rv) {
                data.clear();
            }
        }

        let mut lock_for_status = None;
        let mut usable_to_release = ParsedLockList::new();
        if att.is_none() {
            usable_to_release = partition.usable.clone();
        } else if let Some(lis) = &partition.lock_in_status {
            usable_to_release = partition.usable.clone();
            usable_to_release.remove(lis);
        } else if !partition.usable.is_empty() {
            // Deterministic choice, so that concurrent controllers have a
            // fighting chance of electing the same lock.
            lock_for_status = partition.usable.best().cloned();
            usable_to_release = partition.usable.clone();
            if let Some(chosen) = &lock_for_status {
                usable_to_release.remove(chosen);
            }
        }
        let mut locks_to_release = partition.undesired.clone();
        locks_to_release.add_all(usable_to_release);

        debug!(
            "Analyzed attachment {}={}, subnet={}, shouldExist={}, desiredVNI={:x}, block={:x}--{:x}, lockInStatus={:?}, lockForStatus={:?}, locksToRelease={}, timeSlippers={}, status.ipv4={:?}",
            nsn,
            att_uid,
            analysis.subnet_name,
            att.is_some(),
            analysis.vni,
            analysis.base_u,
            analysis.last_u,
            partition.lock_in_status.as_ref().map(|l| l.to_string()),
            lock_for_status.as_ref().map(|l| l.to_string()),
            locks_to_release,
            partition.time_slippers,
            status_ipv4,
        );

        for lock_to_release in locks_to_release.iter() {
            self.delete_lock_object(lock_to_release).await?;
        }

        analysis.lock_in_status = partition.lock_in_status;
        analysis.lock_for_status = lock_for_status;
        Ok(Some(analysis))
    }

    async fn delete_lock_object(&self, parsed: &ParsedLock) -> Result<(), ControllerError> {
        let api = self.lock_api(&parsed.namespace);
        let dp = DeleteParams {
            preconditions: Some(Preconditions {
                uid: Some(parsed.uid.clone()),
                resource_version: None,
            }),
            ..Default::default()
        };
        let start = Instant::now();
        let result = api.delete(&parsed.name, &dp).await;
        self.metrics
            .lock_op
            .with_label_values(&["delete", bool_label(result.is_err())])
            .observe(start.elapsed().as_secs_f64());
        match result {
            Ok(_) => {
                debug!(
                    "Deleted IPLock {}/{}={}",
                    parsed.namespace, parsed.name, parsed.uid
                );
                Ok(())
            }
            Err(e) if api_errors::is_not_found(&e) || api_errors::is_gone(&e) => {
                debug!(
                    "IPLock {}/{}={} is undesired and already gone",
                    parsed.namespace, parsed.name, parsed.uid
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Picks a free address in the shrunk block and claims it by creating
    /// the lock object. `Ok(None)` reports a permanent creation failure
    /// that retrying cannot fix.
    async fn pick_and_lock_address(
        &self,
        nsn: &NamespacedName,
        att: &NetworkAttachment,
        analysis: &Analysis,
    ) -> Result<Option<(ParsedLock, Ipv4Addr)>, ControllerError> {
        let (addr_min, addr_max) = pickable_range(analysis.base_u, analysis.last_u);
        let Some(ip_u) = self.pick_address(analysis.vni, addr_min, addr_max) else {
            return Err(ControllerError::NoAddressAvailable {
                vni: analysis.vni,
                base: analysis.base_u,
                last: analysis.last_u,
                attachment: nsn.clone(),
            });
        };
        let ip = Ipv4Addr::from(ip_u);
        debug!(
            "Picked address {} from {:x}/{:x}--{:x} for {}",
            ip, analysis.vni, analysis.base_u, analysis.last_u, nsn
        );

        let att_uid = att.metadata.uid.clone().unwrap_or_default();
        let lock_name = lock::make_lock_name(analysis.vni, ip);
        let lock_obj = IPLock {
            metadata: ObjectMeta {
                namespace: Some(nsn.namespace.clone()),
                name: Some(lock_name.clone()),
                owner_references: Some(vec![OwnerReference {
                    api_version: NetworkAttachment::api_version(&()).into_owned(),
                    kind: "NetworkAttachment".to_string(),
                    name: nsn.name.clone(),
                    uid: att_uid.clone(),
                    controller: Some(true),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            spec: IPLockSpec {
                subnet_name: analysis.subnet_name.clone(),
            },
        };

        let api = self.lock_api(&nsn.namespace);
        let created: IPLock = loop {
            let start = Instant::now();
            let result = api.create(&PostParams::default(), &lock_obj).await;
            self.metrics
                .lock_op
                .with_label_values(&["create", bool_label(result.is_err())])
                .observe(start.elapsed().as_secs_f64());
            match result {
                Ok(created) => {
                    debug!(
                        "Locked IP address {} for {}={}, lockName={}, lockUID={:?}",
                        ip, nsn, att_uid, lock_name, created.metadata.uid
                    );
                    let lock_time = lock::creation_time(&created.metadata);
                    let att_time = lock::creation_time(&att.metadata);
                    self.metrics
                        .attachment_create_to_lock
                        .observe((lock_time - att_time).num_milliseconds() as f64 / 1000.0);
                    break created;
                }
                Err(e) if api_errors::is_already_exists(&e) => {
                    // Maybe it is ours
                    match api.get(&lock_name).await {
                        Ok(existing) => {
                            match lock::get_owner(&existing.metadata, "NetworkAttachment") {
                                Some((owner_name, owner_uid))
                                    if owner_name == nsn.name && owner_uid == att_uid =>
                                {
                                    debug!(
                                        "Recovered lockName={}, lockUID={:?} on address {} for {}={}",
                                        lock_name, existing.metadata.uid, ip, nsn, att_uid
                                    );
                                    break existing;
                                }
                                owner => {
                                    debug!(
                                        "Collision at IPLock {} for {}={}, owner is {:?}",
                                        lock_name, nsn, att_uid, owner
                                    );
                                    // The cache failed to avoid this collision.
                                    // Leave the bit set, something else is
                                    // holding the address. Retry in a while.
                                    return Err(ControllerError::CacheIncoherence(lock_name));
                                }
                            }
                        }
                        Err(e2) if api_errors::is_not_found(&e2) => {
                            // It was just there, now it is gone; create again.
                            warn!("IPLock {} disappeared before our eyes", lock_name);
                            continue;
                        }
                        Err(e2) => {
                            return Err(ControllerError::LockFetch {
                                lock: lock_name,
                                attachment: nsn.clone(),
                                source: e2,
                            });
                        }
                    }
                }
                Err(e) => {
                    let release_ok = self.release_address(analysis.vni, ip_u);
                    if api_errors::is_invalid(&e) || e.to_string().to_lowercase().contains("invalid")
                    {
                        error!(
                            "Permanent error creating IPLock {} for {} (releaseOK={}): {}",
                            lock_name, nsn, release_ok, e
                        );
                        return Ok(None);
                    }
                    warn!(
                        "Transient error creating IPLock {} for {} (releaseOK={}): {}",
                        lock_name, nsn, release_ok, e
                    );
                    return Err(ControllerError::LockCreate {
                        lock: lock_name,
                        attachment: nsn.clone(),
                        source: e,
                    });
                }
            }
        };

        let parsed = ParsedLock {
            namespace: nsn.namespace.clone(),
            name: lock_name,
            vni: analysis.vni,
            addr_u: ip_u,
            uid: created.metadata.uid.clone().unwrap_or_default(),
            creation_time: lock::creation_time(&created.metadata),
            obj: Some(Arc::new(created)),
        };
        Ok(Some((parsed, ip)))
    }

    /// Publishes the locked address in the attachment's status and
    /// remembers the write for anticipation.
    async fn set_ip_in_status(
        &self,
        nsn: &NamespacedName,
        att: &NetworkAttachment,
        nadat: &Mutex<NetworkAttachmentData>,
        subnet_rv: &str,
        lock_for_status: &ParsedLock,
        ip_for_status: Ipv4Addr,
    ) -> Result<(), ControllerError> {
        let mut updated = att.clone();
        updated.status = Some(NetworkAttachmentStatus {
            ipv4: ip_for_status.to_string(),
            address_vni: lock_for_status.vni,
            lock_uid: lock_for_status.uid.clone(),
        });
        let payload = serde_json::to_vec(&updated)?;

        let api = self.attachment_api(&nsn.namespace);
        let start = Instant::now();
        let result = api
            .replace_status(&nsn.name, &PostParams::default(), payload)
            .await;
        self.metrics
            .attachment_update
            .observe(start.elapsed().as_secs_f64());
        match result {
            Ok(written) => {
                let att_time = lock::creation_time(&att.metadata);
                self.metrics
                    .attachment_create_to_address
                    .observe((Utc::now() - att_time).num_seconds() as f64);
                let old_rv = att.metadata.resource_version.clone().unwrap_or_default();
                let new_rv = written
                    .metadata
                    .resource_version
                    .clone()
                    .unwrap_or_default();
                debug!(
                    "Recorded locked address {} in status of {}, old resourceVersion={}, new resourceVersion={}, subnetRV={}",
                    ip_for_status, nsn, old_rv, new_rv, subnet_rv
                );
                let mut data = lock_guard(nadat);
                data.anticipating_resource_version = old_rv;
                data.anticipated_resource_version = new_rv;
                data.anticipation_subnet_rv = subnet_rv.to_string();
                data.anticipated_ipv4 = Some(ip_for_status);
                Ok(())
            }
            Err(e) if api_errors::is_not_found(&e) => {
                debug!(
                    "NetworkAttachment {} was deleted while address {} was allocated",
                    nsn, ip_for_status
                );
                Ok(())
            }
            Err(e) => Err(ControllerError::StatusUpdate {
                attachment: nsn.clone(),
                ip: ip_for_status,
                source: e,
            }),
        }
    }
}

fn bool_label(b: bool) -> &'static str {
    if b {
        "true"
    } else {
        "false"
    }
}
