//! Static instance-type catalog.
//!
//! Local disk counts and virtualization modes for the instance types the
//! orchestrator knows about. Keep both tables sorted by key. Unknown types
//! fall back to one disk and paravirtual mode with a warning; the tables are
//! illustrative infrastructure data, so lookups never fail.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// How an instance type is virtualized, which decides the image it needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Virtualization {
    /// `pvm`
    Paravirtual,
    /// `hvm`
    Hardware,
}

impl Virtualization {
    pub fn as_str(self) -> &'static str {
        match self {
            Virtualization::Paravirtual => "pvm",
            Virtualization::Hardware => "hvm",
        }
    }

    /// Parse the provider's image virtualization label.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pvm" | "paravirtual" => Some(Virtualization::Paravirtual),
            "hvm" => Some(Virtualization::Hardware),
            _ => None,
        }
    }
}

const LOCAL_DISKS: &[(&str, u32)] = &[
    ("c1.medium", 1),
    ("c1.xlarge", 4),
    ("c3.2xlarge", 2),
    ("c3.4xlarge", 2),
    ("c3.8xlarge", 2),
    ("c3.large", 2),
    ("c3.xlarge", 2),
    ("cc1.4xlarge", 2),
    ("cc2.8xlarge", 4),
    ("cg1.4xlarge", 2),
    ("cr1.8xlarge", 2),
    ("g2.2xlarge", 1),
    ("hi1.4xlarge", 2),
    ("hs1.8xlarge", 24),
    ("i2.2xlarge", 2),
    ("i2.4xlarge", 4),
    ("i2.8xlarge", 8),
    ("i2.xlarge", 1),
    ("m1.large", 2),
    ("m1.medium", 1),
    ("m1.small", 1),
    ("m1.xlarge", 4),
    ("m2.2xlarge", 1),
    ("m2.4xlarge", 2),
    ("m2.xlarge", 1),
    ("m3.2xlarge", 2),
    ("m3.large", 1),
    ("m3.medium", 1),
    ("m3.xlarge", 2),
    ("r3.2xlarge", 1),
    ("r3.4xlarge", 1),
    ("r3.8xlarge", 2),
    ("r3.large", 1),
    ("r3.xlarge", 1),
    ("t1.micro", 0),
];

use Virtualization::{Hardware as Hvm, Paravirtual as Pvm};

const VIRTUALIZATION: &[(&str, Virtualization)] = &[
    ("c1.medium", Pvm),
    ("c1.xlarge", Pvm),
    ("c3.2xlarge", Pvm),
    ("c3.4xlarge", Pvm),
    ("c3.8xlarge", Pvm),
    ("c3.large", Pvm),
    ("c3.xlarge", Pvm),
    ("cc1.4xlarge", Hvm),
    ("cc2.8xlarge", Hvm),
    ("cg1.4xlarge", Hvm),
    ("cr1.8xlarge", Hvm),
    ("hi1.4xlarge", Pvm),
    ("hs1.8xlarge", Pvm),
    ("i2.2xlarge", Hvm),
    ("i2.4xlarge", Hvm),
    ("i2.8xlarge", Hvm),
    ("i2.xlarge", Hvm),
    ("m1.large", Pvm),
    ("m1.medium", Pvm),
    ("m1.small", Pvm),
    ("m1.xlarge", Pvm),
    ("m2.2xlarge", Pvm),
    ("m2.4xlarge", Pvm),
    ("m2.xlarge", Pvm),
    ("m3.2xlarge", Hvm),
    ("m3.large", Hvm),
    ("m3.medium", Hvm),
    ("m3.xlarge", Hvm),
    ("r3.2xlarge", Hvm),
    ("r3.4xlarge", Hvm),
    ("r3.8xlarge", Hvm),
    ("r3.large", Hvm),
    ("r3.xlarge", Hvm),
    ("t1.micro", Pvm),
    ("t2.medium", Hvm),
    ("t2.micro", Hvm),
    ("t2.small", Hvm),
];

/// Number of instance-local disks, assuming 1 for unknown types.
pub fn local_disk_count(instance_type: &str) -> u32 {
    match LOCAL_DISKS.binary_search_by_key(&instance_type, |&(name, _)| name) {
        Ok(idx) => LOCAL_DISKS[idx].1,
        Err(_) => {
            warn!(%instance_type, "unknown number of disks for instance type, assuming 1");
            1
        }
    }
}

/// Virtualization mode, assuming paravirtual for unknown types.
pub fn virtualization(instance_type: &str) -> Virtualization {
    match VIRTUALIZATION.binary_search_by_key(&instance_type, |&(name, _)| name) {
        Ok(idx) => VIRTUALIZATION[idx].1,
        Err(_) => {
            warn!(%instance_type, "unrecognized instance type, assuming pvm");
            Virtualization::Paravirtual
        }
    }
}

/// Instance families whose launches ignore the image's block device
/// mapping, so ephemeral disks must be mapped explicitly.
pub fn ignores_image_block_mappings(instance_type: &str) -> bool {
    instance_type.starts_with("m3.")
}
