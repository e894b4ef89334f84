//! Domain types for the Stratus orchestrator.
//!
//! These mirror the provider resources an action observes and mutates:
//! instances, isolation (security) groups with their ingress rules, and
//! spot requests. The provider owns all of them; Stratus only holds
//! snapshots returned by the last describe call.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Provider-assigned identifier of a compute instance.
pub type InstanceId = String;

/// Provider-assigned identifier of an isolation group.
pub type GroupId = String;

// ── Cluster naming ────────────────────────────────────────────────

/// Operator-supplied cluster identifier.
///
/// Every provider-side name belonging to a cluster is derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterName(String);

impl ClusterName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the isolation group holding the coordinator.
    pub fn coordinator_group(&self) -> String {
        format!("{}-coordinator", self.0)
    }

    /// Name of the isolation group holding the workers.
    pub fn worker_group(&self) -> String {
        format!("{}-workers", self.0)
    }

    /// Launch group shared by every spot request of one launch, so the
    /// provider grants them all or none.
    pub fn launch_group(&self) -> String {
        format!("launch-group-{}", self.0)
    }

    /// Human-readable `Name` tag for an instance.
    pub fn instance_name(&self, role: Role, instance_id: &str) -> String {
        format!("{}-{}-{}", self.0, role, instance_id)
    }
}

impl fmt::Display for ClusterName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Instances ─────────────────────────────────────────────────────

/// Provider lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    Pending,
    Running,
    Stopping,
    Stopped,
    ShuttingDown,
    Terminated,
}

impl InstanceState {
    /// Active instances are cluster members; stopping and stopped count
    /// because a stopped cluster can be started again.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            InstanceState::Pending
                | InstanceState::Running
                | InstanceState::Stopping
                | InstanceState::Stopped
        )
    }

    /// Shutting down or terminated: no further lifecycle calls apply.
    pub fn is_gone(self) -> bool {
        matches!(self, InstanceState::ShuttingDown | InstanceState::Terminated)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
            InstanceState::ShuttingDown => "shutting-down",
            InstanceState::Terminated => "terminated",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(InstanceState::Pending),
            "running" => Ok(InstanceState::Running),
            "stopping" => Ok(InstanceState::Stopping),
            "stopped" => Ok(InstanceState::Stopped),
            "shutting-down" => Ok(InstanceState::ShuttingDown),
            "terminated" => Ok(InstanceState::Terminated),
            other => Err(format!("unknown instance state: {other}")),
        }
    }
}

/// Cluster role, derived solely from isolation-group membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Coordinator,
    Worker,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Coordinator => f.write_str("coordinator"),
            Role::Worker => f.write_str("worker"),
        }
    }
}

/// Snapshot of a provider-managed compute instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub state: InstanceState,
    pub instance_type: String,
    /// Public DNS name; empty until the provider assigns one.
    pub public_address: String,
    pub private_address: String,
    pub zone: String,
    /// Names of every isolation group the instance belongs to.
    pub groups: Vec<String>,
    /// Set when the instance was granted through a spot request.
    pub spot_request_id: Option<String>,
}

impl Instance {
    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn in_group(&self, name: &str) -> bool {
        self.groups.iter().any(|g| g == name)
    }

    pub fn is_spot(&self) -> bool {
        self.spot_request_id.is_some()
    }

    /// Address used to reach the instance over the remote shell.
    pub fn address(&self) -> &str {
        &self.public_address
    }
}

// ── Isolation groups ──────────────────────────────────────────────

/// IP protocol of an ingress rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpProtocol {
    Tcp,
    Udp,
    Icmp,
    /// Every protocol and port.
    All,
}

impl IpProtocol {
    pub fn as_str(self) -> &'static str {
        match self {
            IpProtocol::Tcp => "tcp",
            IpProtocol::Udp => "udp",
            IpProtocol::Icmp => "icmp",
            IpProtocol::All => "-1",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "tcp" | "6" => IpProtocol::Tcp,
            "udp" | "17" => IpProtocol::Udp,
            "icmp" | "1" => IpProtocol::Icmp,
            _ => IpProtocol::All,
        }
    }
}

/// Inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortRange {
    pub from: u16,
    pub to: u16,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self { from: port, to: port }
    }

    pub fn new(from: u16, to: u16) -> Self {
        Self { from, to }
    }
}

/// Where ingress traffic may come from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleSource {
    Cidr { cidr: String },
    Group { id: GroupId, name: String },
}

/// A single ingress permission on an isolation group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IngressRule {
    pub protocol: IpProtocol,
    /// `None` for protocol-wide rules (`All`).
    pub ports: Option<PortRange>,
    pub source: RuleSource,
}

impl IngressRule {
    /// TCP port range open to a CIDR block.
    pub fn tcp(ports: PortRange, cidr: &str) -> Self {
        Self {
            protocol: IpProtocol::Tcp,
            ports: Some(ports),
            source: RuleSource::Cidr {
                cidr: cidr.to_string(),
            },
        }
    }

    /// All traffic from members of another (or the same) group.
    pub fn all_from_group(group: &SecurityGroup) -> Self {
        Self {
            protocol: IpProtocol::All,
            ports: None,
            source: RuleSource::Group {
                id: group.id.clone(),
                name: group.name.clone(),
            },
        }
    }

    /// Id of the group this rule references, if any.
    pub fn referenced_group(&self) -> Option<&str> {
        match &self.source {
            RuleSource::Group { id, .. } => Some(id),
            RuleSource::Cidr { .. } => None,
        }
    }
}

/// A named isolation group and its current ingress rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityGroup {
    pub id: GroupId,
    pub name: String,
    pub rules: Vec<IngressRule>,
}

// ── Spot requests ─────────────────────────────────────────────────

/// Provider state of a spot request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpotRequestState {
    Open,
    Active,
    Closed,
    Cancelled,
    Failed,
}

impl SpotRequestState {
    pub fn parse(s: &str) -> Self {
        match s {
            "open" => SpotRequestState::Open,
            "active" => SpotRequestState::Active,
            "closed" => SpotRequestState::Closed,
            "cancelled" => SpotRequestState::Cancelled,
            _ => SpotRequestState::Failed,
        }
    }
}

/// An outstanding bid for spare capacity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpotRequest {
    pub id: String,
    pub price: f64,
    pub zone: String,
    pub state: SpotRequestState,
    /// Bound instance once the request is active.
    pub instance_id: Option<InstanceId>,
}

// ── Launch inputs ─────────────────────────────────────────────────

/// Worker count per zone for one launch, in zone iteration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZonePlacement {
    entries: Vec<(String, u32)>,
}

impl ZonePlacement {
    pub fn new(entries: Vec<(String, u32)>) -> Self {
        Self { entries }
    }

    /// Total instances across all zones.
    pub fn total(&self) -> u32 {
        self.entries.iter().map(|(_, n)| n).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> {
        self.entries.iter().map(|(z, n)| (z.as_str(), *n))
    }

    /// Zones that receive at least one instance.
    pub fn non_empty(&self) -> impl Iterator<Item = (&str, u32)> {
        self.iter().filter(|(_, n)| *n > 0)
    }
}

/// Durable volume attached at launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub size_gib: u32,
    pub volume_type: String,
    pub delete_on_termination: bool,
}

/// What backs a block device mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockDeviceSource {
    /// Instance-local disk, e.g. `ephemeral0`.
    Ephemeral { virtual_name: String },
    Volume(VolumeSpec),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDevice {
    pub device_name: String,
    pub source: BlockDeviceSource,
}

/// Everything a run or spot request needs besides count and zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSpec {
    pub image_id: String,
    pub instance_type: String,
    pub key_pair: String,
    pub group_ids: Vec<GroupId>,
    pub block_devices: Vec<BlockDevice>,
    pub user_data: Option<String>,
}
