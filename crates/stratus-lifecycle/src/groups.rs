//! Isolation groups: creation, default ingress rules, teardown.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use stratus_core::{Error, IngressRule, PortRange, Result, SecurityGroup};
use stratus_provider::CloudProvider;

/// Teardown attempts before giving up.
pub const TEARDOWN_ATTEMPTS: u32 = 3;

/// Pause between revoking rules and deleting groups, for the provider to
/// observe the revokes.
pub const GROUP_SETTLE_DELAY: Duration = Duration::from_secs(30);

/// Ports opened on the coordinator to the authorized address range.
pub const COORDINATOR_PORTS: &[(u16, u16)] = &[
    (22, 22),
    (8080, 8081),
    (18080, 18080),
    (19999, 19999),
    (50030, 50030),
    (50070, 50070),
    (60070, 60070),
    (4040, 4045),
];

/// Monitoring web UI, opened on the coordinator only when enabled.
pub const MONITORING_PORT: u16 = 5080;

/// Ports opened on workers to the authorized address range.
pub const WORKER_PORTS: &[(u16, u16)] = &[
    (22, 22),
    (8080, 8081),
    (50060, 50060),
    (50075, 50075),
    (60060, 60060),
    (60075, 60075),
];

/// Manages the two isolation groups of a cluster.
#[derive(Clone)]
pub struct SecurityGroupManager {
    provider: Arc<dyn CloudProvider>,
    settle_delay: Duration,
}

impl SecurityGroupManager {
    pub fn new(provider: Arc<dyn CloudProvider>) -> Self {
        Self {
            provider,
            settle_delay: GROUP_SETTLE_DELAY,
        }
    }

    /// Return the group named `name`, creating it with no rules if absent.
    pub async fn ensure_group(&self, name: &str) -> Result<SecurityGroup> {
        let groups = self.provider.list_groups().await?;
        if let Some(existing) = groups.into_iter().find(|g| g.name == name) {
            debug!(group = %name, "reusing existing group");
            return Ok(existing);
        }
        info!(group = %name, "creating security group");
        let description = format!("stratus group {name}");
        Ok(self.provider.create_group(name, &description).await?)
    }

    /// Resolve a pre-existing group by name or id.
    pub async fn find_group(&self, name_or_id: &str) -> Result<SecurityGroup> {
        self.provider
            .list_groups()
            .await?
            .into_iter()
            .find(|g| g.name == name_or_id || g.id == name_or_id)
            .ok_or_else(|| Error::Configuration(format!("security group {name_or_id} does not exist")))
    }

    /// Open the default ports on groups that have no rules yet.
    ///
    /// Groups with any rule are left alone so operator edits survive a
    /// relaunch.
    pub async fn apply_default_rules(
        &self,
        coordinator: &SecurityGroup,
        workers: &SecurityGroup,
        source_cidr: &str,
        monitoring: bool,
    ) -> Result<()> {
        if coordinator.rules.is_empty() {
            let mut ports: Vec<(u16, u16)> = COORDINATOR_PORTS.to_vec();
            if monitoring {
                ports.push((MONITORING_PORT, MONITORING_PORT));
            }
            self.authorize_all(coordinator, &default_rules(coordinator, workers, &ports, source_cidr))
                .await?;
        }
        if workers.rules.is_empty() {
            self.authorize_all(workers, &default_rules(coordinator, workers, WORKER_PORTS, source_cidr))
                .await?;
        }
        Ok(())
    }

    async fn authorize_all(&self, group: &SecurityGroup, rules: &[IngressRule]) -> Result<()> {
        info!(group = %group.name, rules = rules.len(), "authorizing default rules");
        for rule in rules {
            self.provider.authorize_ingress(&group.id, rule).await?;
        }
        Ok(())
    }

    /// Delete the named groups.
    ///
    /// Groups of one cluster reference each other, so every rule in every
    /// group is revoked before any delete. Each attempt re-lists the groups
    /// still present; a failed revoke or delete is retried on the next
    /// attempt. Instances in the groups must already be terminated.
    pub async fn teardown_groups(&self, names: &[String]) -> Result<()> {
        info!(groups = ?names, "deleting security groups");
        for attempt in 1..=TEARDOWN_ATTEMPTS {
            let groups = match self.present(names).await {
                Ok(groups) => groups,
                Err(err) => {
                    warn!(attempt, error = %err, "listing groups failed");
                    continue;
                }
            };
            if groups.is_empty() {
                return Ok(());
            }

            let mut success = true;
            for group in &groups {
                for rule in &group.rules {
                    if let Err(err) = self.provider.revoke_ingress(&group.id, rule).await {
                        warn!(group = %group.name, error = %err, "failed to revoke rule");
                        success = false;
                    }
                }
            }

            tokio::time::sleep(self.settle_delay).await;

            for group in &groups {
                info!(group = %group.name, "deleting security group");
                if let Err(err) = self.provider.delete_group(&group.id).await {
                    warn!(group = %group.name, error = %err, "failed to delete group");
                    success = false;
                }
            }

            if success {
                return Ok(());
            }
            warn!(attempt, "group teardown incomplete, retrying");
        }

        let remaining = match self.present(names).await {
            Ok(groups) => groups.into_iter().map(|g| g.name).collect(),
            Err(_) => names.to_vec(),
        };
        if remaining.is_empty() {
            return Ok(());
        }
        Err(Error::PartialTeardown {
            attempts: TEARDOWN_ATTEMPTS,
            remaining,
        })
    }

    async fn present(&self, names: &[String]) -> Result<Vec<SecurityGroup>> {
        Ok(self
            .provider
            .list_groups()
            .await?
            .into_iter()
            .filter(|g| names.contains(&g.name))
            .collect())
    }
}

/// Rules for one group: all traffic from both cluster groups, then TCP
/// `ports` from `source_cidr`.
fn default_rules(
    coordinator: &SecurityGroup,
    workers: &SecurityGroup,
    ports: &[(u16, u16)],
    source_cidr: &str,
) -> Vec<IngressRule> {
    let mut rules = vec![
        IngressRule::all_from_group(coordinator),
        IngressRule::all_from_group(workers),
    ];
    rules.extend(
        ports
            .iter()
            .map(|&(from, to)| IngressRule::tcp(PortRange::new(from, to), source_cidr)),
    );
    rules
}
