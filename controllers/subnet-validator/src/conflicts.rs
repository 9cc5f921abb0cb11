//! Conflict bookkeeping between subnets.
//!
//! For each subnet the tracker remembers the last summary it was validated
//! under and the subnets that enrolled as its rivals. When the subnet
//! changes or goes away, the harvested rivals are re-queued: the conflict
//! they were recorded for may have disappeared. There is no guarantee an
//! entry is up to date; `record_conflict` detects the skew and asks the
//! caller to retry.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use controller_util::NamespacedName;
use thiserror::Error;

use crate::summary::Summary;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordConflictError {
    #[error("registration of {enrollee} as a rival of {enroller} failed: {enroller}'s conflicts cache not found")]
    MissingCache {
        enroller: NamespacedName,
        enrollee: NamespacedName,
    },

    /// The live list and the cache disagree about the enroller: one of the
    /// two is stale. The caller retries once the skew has resolved.
    #[error("registration of {enrollee} as a rival of {enroller} failed: mismatch between live data and conflicts cache data")]
    SummaryMismatch {
        enroller: NamespacedName,
        enrollee: NamespacedName,
    },
}

struct ConflictsEntry {
    owner_summary: Summary,
    rivals: Vec<NamespacedName>,
}

/// Per-subnet conflicts caches, keyed by the owning subnet.
pub struct ConflictsTracker {
    conflicts: Mutex<HashMap<NamespacedName, ConflictsEntry>>,
}

impl ConflictsTracker {
    pub fn new() -> Self {
        Self {
            conflicts: Mutex::new(HashMap::new()),
        }
    }

    /// Drops the entry for a deleted subnet, returning its rivals for
    /// re-validation.
    pub fn clear(&self, nsn: &NamespacedName) -> Vec<NamespacedName> {
        self.lock()
            .remove(nsn)
            .map(|entry| entry.rivals)
            .unwrap_or_default()
    }

    /// Installs the latest summary of a subnet. When the VNI or block
    /// changed, the old rivals are harvested and returned so they can be
    /// re-validated against the new data.
    pub fn update_owner(&self, summary: &Summary) -> Vec<NamespacedName> {
        let mut conflicts = self.lock();
        match conflicts.entry(summary.nsn.clone()) {
            Entry::Vacant(vacant) => {
                vacant.insert(ConflictsEntry {
                    owner_summary: summary.clone(),
                    rivals: Vec::new(),
                });
                Vec::new()
            }
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                let mut old_rivals = Vec::new();
                if summary.vni != entry.owner_summary.vni
                    || !summary.same_block_as(&entry.owner_summary)
                {
                    old_rivals = std::mem::take(&mut entry.rivals);
                }
                entry.owner_summary = summary.clone();
                old_rivals
            }
        }
    }

    /// Enrolls `enrollee` as a rival of `enroller`. Fails when the
    /// enroller has no cache entry or its cached summary disagrees with the
    /// live data the caller just read; both mean version skew that a retry
    /// resolves.
    pub fn record_conflict(
        &self,
        enroller: &Summary,
        enrollee: &Summary,
    ) -> Result<(), RecordConflictError> {
        let mut conflicts = self.lock();
        let Some(entry) = conflicts.get_mut(&enroller.nsn) else {
            return Err(RecordConflictError::MissingCache {
                enroller: enroller.nsn.clone(),
                enrollee: enrollee.nsn.clone(),
            });
        };
        if entry.owner_summary != *enroller {
            return Err(RecordConflictError::SummaryMismatch {
                enroller: enroller.nsn.clone(),
                enrollee: enrollee.nsn.clone(),
            });
        }
        entry.rivals.push(enrollee.nsn.clone());
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<NamespacedName, ConflictsEntry>> {
        self.conflicts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Resource versions this controller wrote itself, used to drop the watch
/// echo of its own status updates.
pub struct StaleRvs {
    stale_rvs: Mutex<HashMap<NamespacedName, String>>,
}

impl StaleRvs {
    pub fn new() -> Self {
        Self {
            stale_rvs: Mutex::new(HashMap::new()),
        }
    }

    /// True when `rv` is the echo of our own last write. Any other observed
    /// version clears the entry.
    pub fn is_stale(&self, nsn: &NamespacedName, rv: &str) -> bool {
        let mut stale_rvs = self.lock();
        if stale_rvs.get(nsn).is_some_and(|stale| stale == rv) {
            return true;
        }
        stale_rvs.remove(nsn);
        false
    }

    pub fn clear(&self, nsn: &NamespacedName) {
        self.lock().remove(nsn);
    }

    pub fn record(&self, nsn: &NamespacedName, rv: String) {
        self.lock().insert(nsn.clone(), rv);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<NamespacedName, String>> {
        self.stale_rvs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(namespace: &str, name: &str, vni: u32, base_u: u32, last_u: u32) -> Summary {
        Summary {
            nsn: NamespacedName::new(namespace, name),
            vni,
            base_u,
            last_u,
        }
    }

    #[test]
    fn record_requires_an_installed_owner() {
        let tracker = ConflictsTracker::new();
        let owner = summary("ex", "s1", 20, 0, 255);
        let rival = summary("ex", "s2", 20, 128, 255);
        assert_eq!(
            tracker.record_conflict(&owner, &rival),
            Err(RecordConflictError::MissingCache {
                enroller: owner.nsn.clone(),
                enrollee: rival.nsn.clone(),
            })
        );

        assert!(tracker.update_owner(&owner).is_empty());
        assert_eq!(tracker.record_conflict(&owner, &rival), Ok(()));
    }

    #[test]
    fn record_detects_version_skew() {
        let tracker = ConflictsTracker::new();
        let cached = summary("ex", "s1", 20, 0, 255);
        tracker.update_owner(&cached);
        // The live list saw a different block for the same subnet.
        let live = summary("ex", "s1", 20, 0, 127);
        let rival = summary("ex", "s2", 20, 128, 255);
        assert_eq!(
            tracker.record_conflict(&live, &rival),
            Err(RecordConflictError::SummaryMismatch {
                enroller: live.nsn.clone(),
                enrollee: rival.nsn.clone(),
            })
        );
    }

    #[test]
    fn spec_change_harvests_rivals_once() {
        let tracker = ConflictsTracker::new();
        let owner = summary("ex", "s1", 20, 0, 255);
        tracker.update_owner(&owner);
        let rival = summary("ex", "s2", 20, 128, 255);
        tracker.record_conflict(&owner, &rival).unwrap();

        // Same summary again: nothing to harvest.
        assert!(tracker.update_owner(&owner).is_empty());

        // Block change: the old rival comes back for re-validation.
        let moved = summary("ex", "s1", 20, 0x100, 0x1ff);
        assert_eq!(tracker.update_owner(&moved), vec![rival.nsn.clone()]);
        assert!(tracker.update_owner(&moved).is_empty());
    }

    #[test]
    fn vni_change_harvests_rivals() {
        let tracker = ConflictsTracker::new();
        let owner = summary("ex", "s1", 20, 0, 255);
        tracker.update_owner(&owner);
        let rival = summary("ex", "s2", 20, 128, 255);
        tracker.record_conflict(&owner, &rival).unwrap();

        let renumbered = summary("ex", "s1", 21, 0, 255);
        assert_eq!(tracker.update_owner(&renumbered), vec![rival.nsn]);
    }

    #[test]
    fn clear_returns_rivals_of_deleted_subnet() {
        let tracker = ConflictsTracker::new();
        let owner = summary("ex", "s1", 20, 0, 255);
        tracker.update_owner(&owner);
        let rival = summary("ex", "s2", 20, 128, 255);
        tracker.record_conflict(&owner, &rival).unwrap();

        assert_eq!(tracker.clear(&owner.nsn), vec![rival.nsn.clone()]);
        assert!(tracker.clear(&owner.nsn).is_empty());
        // The entry is gone entirely now.
        assert_eq!(
            tracker.record_conflict(&owner, &rival),
            Err(RecordConflictError::MissingCache {
                enroller: owner.nsn,
                enrollee: rival.nsn,
            })
        );
    }

    #[test]
    fn stale_rv_suppresses_only_the_echo() {
        let stale_rvs = StaleRvs::new();
        let nsn = NamespacedName::new("ex", "s1");
        stale_rvs.record(&nsn, "41".to_string());
        assert!(stale_rvs.is_stale(&nsn, "41"));
        // Still stale until a different version shows up.
        assert!(stale_rvs.is_stale(&nsn, "41"));
        assert!(!stale_rvs.is_stale(&nsn, "42"));
        // The mismatch cleared the entry.
        assert!(!stale_rvs.is_stale(&nsn, "41"));
    }

    #[test]
    fn clear_drops_the_stale_entry() {
        let stale_rvs = StaleRvs::new();
        let nsn = NamespacedName::new("ex", "s1");
        stale_rvs.record(&nsn, "41".to_string());
        stale_rvs.clear(&nsn);
        assert!(!stale_rvs.is_stale(&nsn, "41"));
    }
}
