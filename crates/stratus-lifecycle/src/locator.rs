//! Cluster discovery by isolation-group membership.

use std::sync::Arc;

use tracing::info;

use stratus_core::{ClusterName, Error, Instance, Result};
use stratus_provider::CloudProvider;

/// Active members of a cluster, split by role.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterMembers {
    pub coordinators: Vec<Instance>,
    pub workers: Vec<Instance>,
}

impl ClusterMembers {
    pub fn is_empty(&self) -> bool {
        self.coordinators.is_empty() && self.workers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.coordinators.len() + self.workers.len()
    }

    pub fn coordinator(&self) -> Option<&Instance> {
        self.coordinators.first()
    }

    /// Coordinators first, then workers.
    pub fn all(&self) -> impl Iterator<Item = &Instance> {
        self.coordinators.iter().chain(self.workers.iter())
    }
}

/// Finds the instances that make up a named cluster.
#[derive(Clone)]
pub struct ClusterLocator {
    provider: Arc<dyn CloudProvider>,
}

impl ClusterLocator {
    pub fn new(provider: Arc<dyn CloudProvider>) -> Self {
        Self { provider }
    }

    /// List active instances of `name`.
    ///
    /// Instances in the coordinator group are coordinators even if they
    /// are also in the worker group. With `require_coordinator`, a cluster
    /// without one is an error.
    pub async fn find(&self, name: &ClusterName, require_coordinator: bool) -> Result<ClusterMembers> {
        info!(cluster = %name, "searching for existing cluster");
        let coordinator_group = name.coordinator_group();
        let worker_group = name.worker_group();

        let mut members = ClusterMembers::default();
        for instance in self.provider.describe_instances(&[]).await? {
            if !instance.is_active() {
                continue;
            }
            if instance.in_group(&coordinator_group) {
                members.coordinators.push(instance);
            } else if instance.in_group(&worker_group) {
                members.workers.push(instance);
            }
        }

        if !members.is_empty() {
            info!(
                cluster = %name,
                "found {} coordinator(s), {} workers",
                members.coordinators.len(),
                members.workers.len()
            );
        }

        if require_coordinator && members.coordinators.is_empty() {
            let message = if members.workers.is_empty() {
                format!("could not find any existing cluster named {name}")
            } else {
                format!("found workers but no coordinator for cluster {name}")
            };
            return Err(Error::ClusterNotFound(message));
        }
        Ok(members)
    }
}
