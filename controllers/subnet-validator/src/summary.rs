//! Canonicalized view of a subnet and its conflict predicates.

use controller_util::NamespacedName;
use crds::Subnet;
use ipnet::Ipv4Net;
use thiserror::Error;

/// VNIs fit in 21 bits.
pub const MAX_VNI: u32 = (1 << 21) - 1;

/// The data of a subnet relevant to validation: identity, VNI, and the
/// bounds of its CIDR block as numbers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    pub nsn: NamespacedName,
    pub vni: u32,
    pub base_u: u32,
    pub last_u: u32,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SummaryError {
    #[error("subnet {nsn} has malformed spec.ipv4 {cidr:?}: {reason}")]
    MalformedCidr {
        nsn: NamespacedName,
        cidr: String,
        reason: String,
    },

    #[error("subnet {nsn} has out-of-range spec.vni {vni}")]
    VniOutOfRange { nsn: NamespacedName, vni: u32 },
}

impl Summary {
    pub fn new(subnet: &Subnet) -> Result<Self, SummaryError> {
        let nsn = NamespacedName::from_meta(&subnet.metadata);
        if subnet.spec.vni > MAX_VNI {
            return Err(SummaryError::VniOutOfRange {
                nsn,
                vni: subnet.spec.vni,
            });
        }
        let block: Ipv4Net = subnet.spec.ipv4.parse().map_err(|e| {
            SummaryError::MalformedCidr {
                nsn: nsn.clone(),
                cidr: subnet.spec.ipv4.clone(),
                reason: format!("{e}"),
            }
        })?;
        Ok(Self {
            nsn,
            vni: subnet.spec.vni,
            base_u: u32::from(block.network()),
            last_u: u32::from(block.broadcast()),
        })
    }

    pub fn same_subnet_as(&self, other: &Summary) -> bool {
        self.nsn == other.nsn
    }

    pub fn same_block_as(&self, other: &Summary) -> bool {
        self.base_u == other.base_u && self.last_u == other.last_u
    }

    /// Same VNI with overlapping address blocks.
    pub fn cidr_conflict(&self, other: &Summary) -> bool {
        self.vni == other.vni && self.base_u <= other.last_u && other.base_u <= self.last_u
    }

    /// Same VNI spread across different namespaces.
    pub fn ns_conflict(&self, other: &Summary) -> bool {
        self.vni == other.vni && self.nsn.namespace != other.nsn.namespace
    }

    pub fn conflict(&self, other: &Summary) -> bool {
        self.cidr_conflict(other) || self.ns_conflict(other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crds::SubnetSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn subnet(namespace: &str, name: &str, vni: u32, ipv4: &str) -> Subnet {
        Subnet {
            metadata: ObjectMeta {
                namespace: Some(namespace.to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: SubnetSpec {
                vni,
                ipv4: ipv4.to_string(),
            },
            status: None,
        }
    }

    fn summary(namespace: &str, name: &str, vni: u32, ipv4: &str) -> Summary {
        Summary::new(&subnet(namespace, name, vni, ipv4)).unwrap()
    }

    #[test]
    fn parses_block_bounds() {
        let s = summary("ex", "s1", 7, "10.0.0.0/24");
        assert_eq!(s.base_u, 0x0a00_0000);
        assert_eq!(s.last_u, 0x0a00_00ff);
        // A host address inside the block canonicalizes to the same bounds.
        assert!(s.same_block_as(&summary("ex", "s2", 7, "10.0.0.9/24")));
    }

    #[test]
    fn rejects_malformed_cidr_and_oversized_vni() {
        assert!(matches!(
            Summary::new(&subnet("ex", "s1", 7, "10.0.0.0/33")),
            Err(SummaryError::MalformedCidr { .. })
        ));
        assert!(matches!(
            Summary::new(&subnet("ex", "s1", 7, "not-a-cidr")),
            Err(SummaryError::MalformedCidr { .. })
        ));
        assert!(matches!(
            Summary::new(&subnet("ex", "s1", 1 << 21, "10.0.0.0/24")),
            Err(SummaryError::VniOutOfRange { .. })
        ));
        assert!(Summary::new(&subnet("ex", "s1", MAX_VNI, "10.0.0.0/24")).is_ok());
    }

    #[test]
    fn overlapping_blocks_on_one_vni_conflict() {
        let outer = summary("ex", "s1", 20, "10.0.0.0/24");
        let inner = summary("ex", "s2", 20, "10.0.0.128/25");
        assert!(outer.cidr_conflict(&inner));
        assert!(inner.cidr_conflict(&outer));
        assert!(inner.conflict(&outer));
    }

    #[test]
    fn disjoint_blocks_or_different_vnis_do_not_conflict() {
        let a = summary("ex", "s1", 20, "10.0.0.0/25");
        let b = summary("ex", "s2", 20, "10.0.0.128/25");
        assert!(!a.cidr_conflict(&b));
        assert!(!a.conflict(&b));

        let other_vni = summary("ex", "s3", 21, "10.0.0.0/24");
        assert!(!a.cidr_conflict(&other_vni));
        assert!(!a.conflict(&other_vni));
    }

    #[test]
    fn one_vni_must_stay_in_one_namespace() {
        let a = summary("ex", "s1", 20, "10.0.0.0/25");
        let b = summary("other", "s2", 20, "10.0.0.128/25");
        assert!(a.ns_conflict(&b));
        assert!(a.conflict(&b));
        assert!(!a.ns_conflict(&summary("ex", "s3", 20, "10.1.0.0/24")));
    }

    #[test]
    fn identity_and_equality() {
        let a = summary("ex", "s1", 20, "10.0.0.0/24");
        assert!(a.same_subnet_as(&summary("ex", "s1", 21, "10.1.0.0/24")));
        assert!(!a.same_subnet_as(&summary("other", "s1", 20, "10.0.0.0/24")));
        assert_eq!(a, summary("ex", "s1", 20, "10.0.0.0/24"));
        assert_ne!(a, summary("ex", "s1", 20, "10.0.0.0/25"));
    }
}
