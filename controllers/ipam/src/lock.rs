//! IPLock names and parsed lock values.
//!
//! The name of an IPLock is the claim: "v1-<vni>-<a>-<b>-<c>-<d>", decimal,
//! exactly six dash-separated tokens. Two controllers trying to lock the
//! same (VNI, address) pair collide on the name, and the store's uniqueness
//! constraint arbitrates.

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use crds::IPLock;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use thiserror::Error;

/// VNIs fit in 21 bits.
pub const MAX_VNI: u32 = (1 << 21) - 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LockNameError {
    #[error("lock name {0:?} is malformed")]
    Malformed(String),
    #[error("VNI in lock name {0:?} is out of range")]
    VniOutOfRange(String),
}

/// Name claiming `ip` on virtual network `vni`.
pub fn make_lock_name(vni: u32, ip: Ipv4Addr) -> String {
    let [a, b, c, d] = ip.octets();
    format!("v1-{vni}-{a}-{b}-{c}-{d}")
}

/// Inverse of [`make_lock_name`]. Failure is non-retryable: the object is
/// not one of ours and gets ignored.
pub fn parse_lock_name(name: &str) -> Result<(u32, u32), LockNameError> {
    let parts: Vec<&str> = name.split('-').collect();
    if parts.len() != 6 || parts[0] != "v1" {
        return Err(LockNameError::Malformed(name.to_string()));
    }
    let vni = parse_decimal(parts[1]).ok_or_else(|| LockNameError::Malformed(name.to_string()))?;
    if vni > MAX_VNI {
        return Err(LockNameError::VniOutOfRange(name.to_string()));
    }
    let mut addr_u: u32 = 0;
    for part in &parts[2..] {
        let octet = parse_decimal(part)
            .filter(|&o| o <= 255)
            .ok_or_else(|| LockNameError::Malformed(name.to_string()))?;
        addr_u = addr_u * 256 + octet;
    }
    Ok((vni, addr_u))
}

fn parse_decimal(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// Names of the controller owner references of kind NetworkAttachment.
/// Non-controller references are not followed.
pub fn owning_attachments(meta: &ObjectMeta) -> Vec<String> {
    meta.owner_references
        .iter()
        .flatten()
        .filter(|r| r.kind == "NetworkAttachment" && r.controller == Some(true))
        .map(|r| r.name.clone())
        .collect()
}

/// Name and UID of the controlling owner reference of the given kind, if
/// any. When several match, the last one wins.
pub fn get_owner(meta: &ObjectMeta, owner_kind: &str) -> Option<(String, String)> {
    let mut found = None;
    for r in meta.owner_references.iter().flatten() {
        if r.kind == owner_kind && r.controller == Some(true) {
            found = Some((r.name.clone(), r.uid.clone()));
        }
    }
    found
}

/// Immutable view of an IPLock, carrying everything reconciliation needs
/// without holding cross-object pointers.
#[derive(Debug, Clone)]
pub struct ParsedLock {
    pub namespace: String,
    pub name: String,
    pub vni: u32,
    /// The locked address, expressed as a number.
    pub addr_u: u32,
    pub uid: String,
    pub creation_time: DateTime<Utc>,
    pub obj: Option<Arc<IPLock>>,
}

impl ParsedLock {
    pub fn from_lock(lock: &Arc<IPLock>) -> Result<Self, LockNameError> {
        let name = lock.metadata.name.clone().unwrap_or_default();
        let (vni, addr_u) = parse_lock_name(&name)?;
        Ok(Self {
            namespace: lock.metadata.namespace.clone().unwrap_or_default(),
            name,
            vni,
            addr_u,
            uid: lock.metadata.uid.clone().unwrap_or_default(),
            creation_time: creation_time(&lock.metadata),
            obj: Some(Arc::clone(lock)),
        })
    }

    pub fn ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.addr_u)
    }

    /// Identity for set semantics; the namespace and name follow from the
    /// other fields.
    pub fn same_lock_as(&self, other: &ParsedLock) -> bool {
        self.vni == other.vni
            && self.uid == other.uid
            && self.creation_time == other.creation_time
            && self.addr_u == other.addr_u
    }

    /// Deterministic preference between rival locks: the earlier creation
    /// time wins, ties broken by the lexicographically greater UID.
    /// Independent controllers observing the same set of locks elect the
    /// same survivor, so they do not oscillate.
    pub fn is_better_than(&self, other: &ParsedLock) -> bool {
        if self.creation_time != other.creation_time {
            return self.creation_time < other.creation_time;
        }
        self.uid > other.uid
    }
}

pub fn creation_time(meta: &ObjectMeta) -> DateTime<Utc> {
    meta.creation_timestamp
        .as_ref()
        .map(|t| t.0)
        .unwrap_or(DateTime::UNIX_EPOCH)
}

impl fmt::Display for ParsedLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{:x}={}@{}",
            self.vni, self.addr_u, self.uid, self.creation_time
        )
    }
}

/// A small set of parsed locks with set-semantics insert and remove.
#[derive(Debug, Clone, Default)]
pub struct ParsedLockList(Vec<ParsedLock>);

impl ParsedLockList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ParsedLock> {
        self.0.iter()
    }

    pub fn push(&mut self, lock: ParsedLock) {
        self.0.push(lock);
    }

    pub fn has(&self, lock: &ParsedLock) -> bool {
        self.0.iter().any(|x| x.same_lock_as(lock))
    }

    /// The unique minimum under [`ParsedLock::is_better_than`].
    pub fn best(&self) -> Option<&ParsedLock> {
        let mut best = self.0.first()?;
        for elt in &self.0[1..] {
            if elt.is_better_than(best) {
                best = elt;
            }
        }
        Some(best)
    }

    /// Inserts unless an equal lock is already present. Returns whether the
    /// list changed.
    pub fn add(&mut self, lock: ParsedLock) -> bool {
        if self.has(&lock) {
            return false;
        }
        self.0.push(lock);
        true
    }

    /// Inserts every element of `other` not already present. Returns whether
    /// the list changed.
    pub fn add_all(&mut self, other: ParsedLockList) -> bool {
        let mut diff = false;
        for elt in other.0 {
            diff |= self.add(elt);
        }
        diff
    }

    /// Removes the lock equal to `lock`, if present. Returns whether the
    /// list changed.
    pub fn remove(&mut self, lock: &ParsedLock) -> bool {
        match self.0.iter().position(|x| x.same_lock_as(lock)) {
            Some(idx) => {
                self.0.remove(idx);
                true
            }
            None => false,
        }
    }
}

impl fmt::Display for ParsedLockList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (idx, parsed) in self.0.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{parsed}")?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    #[test]
    fn lock_name_round_trips() {
        let ip: Ipv4Addr = "10.1.0.5".parse().unwrap();
        let name = make_lock_name(7, ip);
        assert_eq!(name, "v1-7-10-1-0-5");
        assert_eq!(parse_lock_name(&name), Ok((7, u32::from(ip))));
    }

    #[test]
    fn vni_at_21_bit_boundary() {
        let ip = Ipv4Addr::new(255, 255, 255, 255);
        let name = make_lock_name(MAX_VNI, ip);
        assert_eq!(parse_lock_name(&name), Ok((MAX_VNI, u32::MAX)));
        assert_eq!(
            parse_lock_name(&make_lock_name(MAX_VNI + 1, ip)),
            Err(LockNameError::VniOutOfRange(format!(
                "v1-{}-255-255-255-255",
                MAX_VNI + 1
            )))
        );
    }

    #[test]
    fn malformed_lock_names_are_rejected() {
        for name in [
            "",
            "v1-7-10-1-0",          // five tokens
            "v1-7-10-1-0-5-9",      // seven tokens
            "v2-7-10-1-0-5",        // wrong prefix
            "v1-7-10-1-0-256",      // octet out of range
            "v1-7-10-1-0-x",        // non-decimal
            "v1--10-1-0-5",         // empty token
            "v1-+7-10-1-0-5",       // sign is not a digit
        ] {
            assert!(parse_lock_name(name).is_err(), "{name:?} should not parse");
        }
    }

    fn parsed(uid: &str, secs: i64, addr_u: u32) -> ParsedLock {
        ParsedLock {
            namespace: "ex".to_string(),
            name: make_lock_name(7, Ipv4Addr::from(addr_u)),
            vni: 7,
            addr_u,
            uid: uid.to_string(),
            creation_time: Utc.timestamp_opt(secs, 0).unwrap(),
            obj: None,
        }
    }

    #[test]
    fn earlier_creation_time_is_better() {
        let old = parsed("aa", 100, 1);
        let new = parsed("zz", 200, 2);
        assert!(old.is_better_than(&new));
        assert!(!new.is_better_than(&old));
    }

    #[test]
    fn greater_uid_breaks_creation_ties() {
        let low = parsed("aa", 100, 1);
        let high = parsed("zz", 100, 2);
        assert!(high.is_better_than(&low));
        assert!(!low.is_better_than(&high));
    }

    #[test]
    fn preference_is_a_strict_total_order() {
        let locks = [
            parsed("aa", 100, 1),
            parsed("zz", 100, 2),
            parsed("mm", 50, 3),
            parsed("aa", 200, 4),
        ];
        for x in &locks {
            assert!(!x.is_better_than(x));
            for y in &locks {
                if !x.same_lock_as(y) {
                    assert_ne!(x.is_better_than(y), y.is_better_than(x));
                }
                for z in &locks {
                    if x.is_better_than(y) && y.is_better_than(z) {
                        assert!(x.is_better_than(z));
                    }
                }
            }
        }
    }

    #[test]
    fn best_returns_the_unique_minimum() {
        let mut list = ParsedLockList::new();
        assert!(list.best().is_none());
        list.push(parsed("zz", 100, 2));
        list.push(parsed("mm", 50, 3));
        list.push(parsed("aa", 100, 1));
        let best = list.best().unwrap();
        assert_eq!(best.uid, "mm");
        for elt in list.iter() {
            assert!(!elt.is_better_than(best));
        }
    }

    #[test]
    fn list_has_set_semantics() {
        let mut list = ParsedLockList::new();
        assert!(list.add(parsed("aa", 100, 1)));
        assert!(!list.add(parsed("aa", 100, 1)));
        assert_eq!(list.len(), 1);

        let mut other = ParsedLockList::new();
        other.push(parsed("aa", 100, 1));
        other.push(parsed("bb", 100, 2));
        assert!(list.add_all(other));
        assert_eq!(list.len(), 2);

        assert!(list.remove(&parsed("aa", 100, 1)));
        assert!(!list.remove(&parsed("aa", 100, 1)));
        assert_eq!(list.len(), 1);
    }

    fn owner_ref(kind: &str, name: &str, controller: Option<bool>) -> OwnerReference {
        OwnerReference {
            api_version: "network.kos.dev/v1alpha1".to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            uid: format!("uid-{name}"),
            controller,
            ..Default::default()
        }
    }

    #[test]
    fn owning_attachments_follows_only_controller_refs() {
        let meta = ObjectMeta {
            owner_references: Some(vec![
                owner_ref("NetworkAttachment", "a1", Some(true)),
                owner_ref("NetworkAttachment", "a2", Some(false)),
                owner_ref("NetworkAttachment", "a3", None),
                owner_ref("Subnet", "s1", Some(true)),
            ]),
            ..Default::default()
        };
        assert_eq!(owning_attachments(&meta), vec!["a1".to_string()]);
    }

    #[test]
    fn get_owner_matches_kind_and_controller() {
        let meta = ObjectMeta {
            owner_references: Some(vec![
                owner_ref("Subnet", "s1", Some(true)),
                owner_ref("NetworkAttachment", "a1", Some(true)),
            ]),
            ..Default::default()
        };
        assert_eq!(
            get_owner(&meta, "NetworkAttachment"),
            Some(("a1".to_string(), "uid-a1".to_string()))
        );
        assert_eq!(get_owner(&ObjectMeta::default(), "NetworkAttachment"), None);
    }
}

