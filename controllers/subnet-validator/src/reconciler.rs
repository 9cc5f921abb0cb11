//! Per-subnet validation.
//!
//! A pass either cleans up after a deleted subnet or validates an existing
//! one: update its conflicts cache, honor the validated latch, live-list
//! the other subnets on its VNI, scan for conflicts, and write the verdict.

use controller_util::{api_errors, NamespacedName};
use crds::Subnet;
use kube::api::{ListParams, PostParams};
use kube::Api;
use tracing::{debug, error, info};

use crate::controller::Validator;
use crate::error::ControllerError;
use crate::summary::Summary;

const SUBNET_VNI_FIELD: &str = "spec.vni";

impl Validator {
    pub(crate) async fn process_subnet(&self, nsn: &NamespacedName) -> Result<(), ControllerError> {
        match self.subnets.get(nsn) {
            None => {
                self.process_deleted_subnet(nsn);
                Ok(())
            }
            Some(subnet) => self.process_existing_subnet(&subnet).await,
        }
    }

    fn process_deleted_subnet(&self, nsn: &NamespacedName) {
        self.stale_rvs.clear(nsn);

        // Old rivals might no longer have conflicts now that this subnet is
        // gone; give them another pass.
        let rivals = self.conflicts.clear(nsn);
        debug!(
            "Subnet {} deleted, re-queuing {} former rivals",
            nsn,
            rivals.len()
        );
        for rival in rivals {
            self.queue.add(rival);
        }
    }

    async fn process_existing_subnet(&self, subnet: &Subnet) -> Result<(), ControllerError> {
        let summary = Summary::new(subnet)?;

        let rv = subnet
            .metadata
            .resource_version
            .as_deref()
            .unwrap_or_default();
        if self.stale_rvs.is_stale(&summary.nsn, rv) {
            // Echo of our own status write; the fresh edition follows.
            return Ok(());
        }

        // The subnet may have been created or updated in a way that affects
        // validation; old rivals might no longer be in conflict with it.
        for rival in self.conflicts.update_owner(&summary) {
            self.queue.add(rival);
        }

        // A subnet stays validated once it becomes validated, unless and
        // until its VNI or CIDR block changes.
        if subnet.status.as_ref().is_some_and(|status| status.validated) {
            return Ok(());
        }

        // Live list instead of a cache read: with multiple validators the
        // informer could still hold sibling states a concurrent writer has
        // already replaced.
        let api: Api<Subnet> = Api::all(self.client.clone());
        let lp = ListParams::default().fields(&format!("{}={}", SUBNET_VNI_FIELD, summary.vni));
        let potential_rivals = match api.list(&lp).await {
            Ok(list) => list,
            Err(e) if api_errors::malformed_request(&e) => {
                error!(
                    "live list of all subnets against API server failed while validating {}: {}. There will be no retry because of the nature of the error",
                    summary.nsn, e
                );
                return Ok(());
            }
            Err(e) => return Err(ControllerError::LiveList(e)),
        };

        let (conflicts_msgs, conflict_found) =
            self.record_conflicts(&summary, &potential_rivals.items)?;

        self.update_subnet_validity(subnet, &summary, !conflict_found, conflicts_msgs)
            .await
    }

    /// Scans the live-listed subnets for conflicts with `candidate`,
    /// enrolling `candidate` as a rival in each conflicting subnet's cache.
    fn record_conflicts(
        &self,
        candidate: &Summary,
        potential_rivals: &[Subnet],
    ) -> Result<(Vec<String>, bool), ControllerError> {
        let mut conflicts_msgs = Vec::new();
        let mut conflict_found = false;
        for pr in potential_rivals {
            let potential_rival = match Summary::new(pr) {
                Ok(summary) => summary,
                Err(e) => {
                    error!("parsing a potential rival failed while validating {}: {}", candidate.nsn, e);
                    continue;
                }
            };

            if !potential_rival.conflict(candidate) || potential_rival.same_subnet_as(candidate) {
                continue;
            }

            conflict_found = true;
            if potential_rival.cidr_conflict(candidate) {
                info!(
                    "CIDR conflict found between {} ({:x}, {:x}) and {} ({:x}, {:x})",
                    candidate.nsn,
                    candidate.base_u,
                    candidate.last_u,
                    potential_rival.nsn,
                    potential_rival.base_u,
                    potential_rival.last_u
                );
                conflicts_msgs.push(format!(
                    "CIDR overlaps with {}'s ({})",
                    potential_rival.nsn, pr.spec.ipv4
                ));
            }
            if potential_rival.ns_conflict(candidate) {
                info!(
                    "Namespace conflict found between {} and {}",
                    candidate.nsn, potential_rival.nsn
                );
                conflicts_msgs.push(format!(
                    "same VNI but different namespace wrt {}",
                    potential_rival.nsn
                ));
            }

            self.conflicts.record_conflict(&potential_rival, candidate)?;
        }
        Ok((conflicts_msgs, conflict_found))
    }

    async fn update_subnet_validity(
        &self,
        subnet: &Subnet,
        summary: &Summary,
        validated: bool,
        validation_errors: Vec<String>,
    ) -> Result<(), ControllerError> {
        let mut updated = subnet.clone();
        let status = updated.status.get_or_insert_with(Default::default);
        status.validated = validated;
        status.errors.validation = validation_errors;
        let payload = serde_json::to_vec(&updated)?;

        let api: Api<Subnet> = Api::namespaced(self.client.clone(), &summary.nsn.namespace);
        match api
            .replace_status(&summary.nsn.name, &PostParams::default(), payload)
            .await
        {
            Ok(_) => {
                debug!(
                    "Wrote validated={} with {} errors into {}",
                    validated,
                    updated
                        .status
                        .as_ref()
                        .map(|s| s.errors.validation.len())
                        .unwrap_or(0),
                    summary.nsn
                );
                let prev_rv = subnet
                    .metadata
                    .resource_version
                    .clone()
                    .unwrap_or_default();
                self.stale_rvs.record(&summary.nsn, prev_rv);
                Ok(())
            }
            Err(e) if api_errors::malformed_request(&e) => {
                error!(
                    "failed to update subnet {} validation status: {}. There will be no retry because of the nature of the error",
                    summary.nsn, e
                );
                Ok(())
            }
            Err(e) => Err(ControllerError::StatusWrite {
                nsn: summary.nsn.clone(),
                source: e,
            }),
        }
    }
}
