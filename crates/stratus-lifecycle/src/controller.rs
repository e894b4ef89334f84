//! Lifecycle actions.
//!
//! Each action is a straight-line sequence over the components: locate,
//! check, mutate through the provider, wait, deploy. There is no state
//! machine to persist; a rerun rediscovers everything from the provider.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use stratus_core::{
    ClusterConfig, ClusterName, Error, GroupId, Instance, InstanceId, InstanceState, InstanceSpec,
    Result, Role, SecurityGroup, ZonePlacement, catalog,
};
use stratus_provider::CloudProvider;
use stratus_remote::RemoteExecutor;

use crate::acquire::{InstanceAcquirer, block_devices};
use crate::deploy::{Deployer, DeploymentPlan};
use crate::groups::SecurityGroupManager;
use crate::locator::{ClusterLocator, ClusterMembers};
use crate::placement::{coordinator_zone, worker_zones, zone_placement};
use crate::readiness::{ReadinessPoller, WaitTarget, cancelled, never_cancelled};

/// An operator-requested lifecycle action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Launch,
    /// Launch variant that skips acquisition and redeploys an existing cluster.
    Resume,
    Destroy,
    Stop,
    Start,
    RebootWorkers,
    Login,
    GetCoordinator,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Launch => "launch",
            Action::Resume => "resume",
            Action::Destroy => "destroy",
            Action::Stop => "stop",
            Action::Start => "start",
            Action::RebootWorkers => "reboot-workers",
            Action::Login => "login",
            Action::GetCoordinator => "get-coordinator",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = String;

    /// Parses the actions accepted on the command line. `resume` is not
    /// one of them; it is selected with a flag on `launch`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "launch" => Ok(Action::Launch),
            "destroy" => Ok(Action::Destroy),
            "stop" => Ok(Action::Stop),
            "start" => Ok(Action::Start),
            "reboot-workers" => Ok(Action::RebootWorkers),
            "login" => Ok(Action::Login),
            "get-coordinator" => Ok(Action::GetCoordinator),
            other => Err(format!("invalid action: {other}")),
        }
    }
}

/// How an action ended when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Completed,
    /// The operator did not confirm a destructive action.
    Declined,
    /// Address of the active coordinator.
    Coordinator(String),
}

/// Yes/no confirmation for destructive actions.
pub trait Prompt: Send + Sync {
    /// Show `message` and return whether the operator answered `y`.
    fn confirm(&self, message: &str) -> bool;
}

/// Runs lifecycle actions against one named cluster.
pub struct LifecycleController {
    config: ClusterConfig,
    cluster: ClusterName,
    provider: Arc<dyn CloudProvider>,
    executor: RemoteExecutor,
    deployer: Arc<dyn Deployer>,
    prompt: Arc<dyn Prompt>,
    groups: SecurityGroupManager,
    acquirer: InstanceAcquirer,
    locator: ClusterLocator,
    poller: ReadinessPoller,
    cancel: watch::Receiver<bool>,
}

impl LifecycleController {
    pub fn new(
        config: ClusterConfig,
        cluster: ClusterName,
        provider: Arc<dyn CloudProvider>,
        executor: RemoteExecutor,
        deployer: Arc<dyn Deployer>,
        prompt: Arc<dyn Prompt>,
    ) -> Self {
        Self {
            groups: SecurityGroupManager::new(provider.clone()),
            acquirer: InstanceAcquirer::new(provider.clone(), cluster.clone()),
            locator: ClusterLocator::new(provider.clone()),
            poller: ReadinessPoller::new(provider.clone(), executor.clone()),
            config,
            cluster,
            provider,
            executor,
            deployer,
            prompt,
            cancel: never_cancelled(),
        }
    }

    /// Cancellation for readiness waits and deployment; by default they
    /// cannot be cancelled.
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cluster(&self) -> &ClusterName {
        &self.cluster
    }

    /// Run `action`. `interrupt` ends spot acquisition early during launch
    /// and is ignored by every other action.
    pub async fn run<I>(&self, action: Action, interrupt: I) -> Result<ActionOutcome>
    where
        I: Future<Output = ()>,
    {
        self.config.validate()?;
        info!(cluster = %self.cluster, %action, "running action");
        match action {
            Action::Launch => self.launch(interrupt).await,
            Action::Resume => self.resume().await,
            Action::Destroy => self.destroy().await,
            Action::Stop => self.stop().await,
            Action::Start => self.start().await,
            Action::RebootWorkers => self.reboot_workers().await,
            Action::Login => self.login().await,
            Action::GetCoordinator => self.get_coordinator().await,
        }
    }

    // ── Launch ────────────────────────────────────────────────────

    async fn launch<I>(&self, interrupt: I) -> Result<ActionOutcome>
    where
        I: Future<Output = ()>,
    {
        let access = self.config.require_access()?;
        let workers = self.config.cluster.workers;
        if workers == 0 {
            return Err(Error::Configuration(
                "a cluster needs at least one worker".to_string(),
            ));
        }

        let existing = self.locator.find(&self.cluster, false).await?;
        let reuse = existing.workers.is_empty()
            && (existing.coordinators.is_empty() || self.config.cluster.reuse_coordinator);
        if !reuse {
            return Err(Error::ClusterOccupied {
                coordinator_group: self.cluster.coordinator_group(),
                worker_group: self.cluster.worker_group(),
            });
        }

        info!(cluster = %self.cluster, "setting up security groups");
        let coordinator_group = self.groups.ensure_group(&self.cluster.coordinator_group()).await?;
        let worker_group = self.groups.ensure_group(&self.cluster.worker_group()).await?;
        self.groups
            .apply_default_rules(
                &coordinator_group,
                &worker_group,
                &self.config.access.authorized_address,
                self.config.software.monitoring,
            )
            .await?;

        let image_id = self.verify_image().await?;
        let extra_groups = self.additional_groups().await?;
        let user_data = self.user_data().await?;
        let spec_for = |instance_type: &str, group: &SecurityGroup| InstanceSpec {
            image_id: image_id.clone(),
            instance_type: instance_type.to_string(),
            key_pair: access.key_pair.to_string(),
            group_ids: std::iter::once(group.id.clone())
                .chain(extra_groups.iter().cloned())
                .collect(),
            block_devices: block_devices(&self.config.storage, instance_type),
            user_data: user_data.clone(),
        };

        let zones = worker_zones(self.provider.as_ref(), &self.config.cluster.zone).await?;
        if zones.is_empty() {
            return Err(Error::Configuration(format!(
                "no availability zones found in region {}",
                self.config.cluster.region
            )));
        }
        let placement = zone_placement(workers, &zones);
        let worker_spec = spec_for(&self.config.cluster.instance_type, &worker_group);
        let worker_nodes = match self.config.cluster.spot_price {
            Some(price) => {
                self.acquirer
                    .acquire_spot(workers, &placement, price, &worker_spec, interrupt)
                    .await?
            }
            None => self.acquirer.acquire_on_demand(&placement, &worker_spec).await?,
        };

        // Workers acquired so far stay up if the coordinator cannot be launched.
        let coordinator_nodes = if existing.coordinators.is_empty() {
            let zone = coordinator_zone(self.provider.as_ref(), &self.config.cluster.zone, &zones)
                .await?
                .ok_or_else(|| Error::Configuration("no zone available for coordinator".into()))?;
            let spec = spec_for(self.config.coordinator_instance_type(), &coordinator_group);
            self.acquirer
                .acquire_on_demand(&ZonePlacement::new(vec![(zone, 1)]), &spec)
                .await?
        } else {
            self.acquirer
                .resume_stopped_coordinator(&existing.coordinators)
                .await?;
            existing.coordinators
        };

        self.acquirer
            .tag_instances(&coordinator_nodes, Role::Coordinator)
            .await?;
        self.acquirer.tag_instances(&worker_nodes, Role::Worker).await?;
        info!(
            cluster = %self.cluster,
            workers = worker_nodes.len(),
            coordinators = coordinator_nodes.len(),
            "instances acquired"
        );

        self.wait_and_deploy(&coordinator_nodes, &worker_nodes, true).await?;
        Ok(ActionOutcome::Completed)
    }

    async fn resume(&self) -> Result<ActionOutcome> {
        self.config.require_access()?;
        let members = self.locator.find(&self.cluster, true).await?;
        self.wait_and_deploy(&members.coordinators, &members.workers, true)
            .await?;
        Ok(ActionOutcome::Completed)
    }

    /// The configured image must exist; a virtualization mismatch with the
    /// instance type is only warned about.
    async fn verify_image(&self) -> Result<String> {
        let image_id = self.config.cluster.image.clone().ok_or_else(|| {
            Error::Configuration("must provide an image id (--image)".to_string())
        })?;
        let image = self.provider.describe_image(&image_id).await.map_err(|err| {
            Error::Configuration(format!("image {image_id} could not be found: {err}"))
        })?;
        let expected = catalog::virtualization(&self.config.cluster.instance_type);
        if let Some(actual) = image.virtualization {
            if actual != expected {
                warn!(
                    image = %image_id,
                    instance_type = %self.config.cluster.instance_type,
                    "image virtualization {} does not match instance type ({})",
                    actual.as_str(),
                    expected.as_str()
                );
            }
        }
        Ok(image_id)
    }

    async fn additional_groups(&self) -> Result<Vec<GroupId>> {
        match &self.config.cluster.additional_group {
            Some(name) => Ok(vec![self.groups.find_group(name).await?.id]),
            None => Ok(Vec::new()),
        }
    }

    async fn user_data(&self) -> Result<Option<String>> {
        match &self.config.cluster.user_data {
            Some(path) => Ok(Some(tokio::fs::read_to_string(path).await?)),
            None => Ok(None),
        }
    }

    /// Wait for every host to accept a remote shell, then deploy.
    async fn wait_and_deploy(
        &self,
        coordinators: &[Instance],
        workers: &[Instance],
        generate_ssh_key: bool,
    ) -> Result<()> {
        let all: Vec<Instance> = coordinators.iter().chain(workers).cloned().collect();
        let ready = self
            .poller
            .wait_for(&all, WaitTarget::RemoteShellReady, &mut self.cancel.clone())
            .await?;

        let refreshed = |nodes: &[Instance]| -> Vec<Instance> {
            nodes
                .iter()
                .map(|n| ready.iter().find(|r| r.id == n.id).unwrap_or(n).clone())
                .collect()
        };
        let plan = DeploymentPlan::build(
            &self.config,
            &refreshed(coordinators),
            &refreshed(workers),
            generate_ssh_key,
        )?;
        info!(cluster = %self.cluster, url = %plan.cluster_url, "deploying cluster");
        let mut cancel = self.cancel.clone();
        tokio::select! {
            result = self.deployer.deploy(&plan) => result?,
            () = cancelled(&mut cancel) => return Err(Error::Cancelled),
        }
        info!(cluster = %self.cluster, "done");
        Ok(())
    }

    // ── Destroy / stop / start / reboot ───────────────────────────

    async fn destroy(&self) -> Result<ActionOutcome> {
        let members = self.locator.find(&self.cluster, false).await?;
        let mut message = format!(
            "Are you sure you want to destroy the cluster {}?\n\
             The following instances will be terminated:\n",
            self.cluster
        );
        for instance in members.all() {
            message.push_str(&format!("> {}\n", instance.address()));
        }
        message.push_str(&format!(
            "ALL DATA ON ALL NODES WILL BE LOST!!\nDestroy cluster {} (y/N): ",
            self.cluster
        ));
        if !self.prompt.confirm(&message) {
            return Ok(ActionOutcome::Declined);
        }

        info!(cluster = %self.cluster, instances = members.len(), "terminating instances");
        let ids = ids(members.all());
        if !ids.is_empty() {
            self.provider.terminate_instances(&ids).await?;
        }

        if self.config.cluster.delete_groups {
            let all: Vec<Instance> = members.all().cloned().collect();
            self.poller
                .wait_for(
                    &all,
                    WaitTarget::State(InstanceState::Terminated),
                    &mut self.cancel.clone(),
                )
                .await?;
            self.groups
                .teardown_groups(&[self.cluster.coordinator_group(), self.cluster.worker_group()])
                .await?;
        }
        Ok(ActionOutcome::Completed)
    }

    async fn stop(&self) -> Result<ActionOutcome> {
        let message = format!(
            "Are you sure you want to stop the cluster {name}?\n\
             DATA ON EPHEMERAL DISKS WILL BE LOST, BUT THE CLUSTER WILL KEEP USING SPACE ON\n\
             DURABLE VOLUMES IF IT IS VOLUME-BACKED!!\n\
             All data on spot-instance workers will also be lost.\n\
             Stop cluster {name} (y/N): ",
            name = self.cluster
        );
        if !self.prompt.confirm(&message) {
            return Ok(ActionOutcome::Declined);
        }

        let members = self.locator.find(&self.cluster, false).await?;
        info!(cluster = %self.cluster, "stopping coordinator");
        let coordinators = ids(live(&members.coordinators));
        if !coordinators.is_empty() {
            self.provider.stop_instances(&coordinators).await?;
        }

        info!(cluster = %self.cluster, "stopping workers");
        let (spot, on_demand): (Vec<&Instance>, Vec<&Instance>) =
            live(&members.workers).partition(|i| i.is_spot());
        let spot = ids(spot.into_iter());
        let on_demand = ids(on_demand.into_iter());
        if !spot.is_empty() {
            self.provider.terminate_instances(&spot).await?;
        }
        if !on_demand.is_empty() {
            self.provider.stop_instances(&on_demand).await?;
        }
        Ok(ActionOutcome::Completed)
    }

    async fn start(&self) -> Result<ActionOutcome> {
        self.require_identity_file()?;
        let members = self.locator.find(&self.cluster, true).await?;
        info!(cluster = %self.cluster, "starting workers");
        let workers = ids(live(&members.workers));
        if !workers.is_empty() {
            self.provider.start_instances(&workers).await?;
        }
        info!(cluster = %self.cluster, "starting coordinator");
        let coordinators = ids(live(&members.coordinators));
        if !coordinators.is_empty() {
            self.provider.start_instances(&coordinators).await?;
        }
        self.wait_and_deploy(&members.coordinators, &members.workers, false)
            .await?;
        Ok(ActionOutcome::Completed)
    }

    async fn reboot_workers(&self) -> Result<ActionOutcome> {
        let message = format!(
            "Are you sure you want to reboot the cluster {name} workers?\n\
             Reboot cluster workers {name} (y/N): ",
            name = self.cluster
        );
        if !self.prompt.confirm(&message) {
            return Ok(ActionOutcome::Declined);
        }
        let members = self.locator.find(&self.cluster, false).await?;
        let workers = ids(live(&members.workers));
        info!(cluster = %self.cluster, workers = workers.len(), "rebooting workers");
        if !workers.is_empty() {
            self.provider.reboot_instances(&workers).await?;
        }
        Ok(ActionOutcome::Completed)
    }

    // ── Login / get-coordinator ───────────────────────────────────

    async fn login(&self) -> Result<ActionOutcome> {
        self.require_identity_file()?;
        let members = self.locator.find(&self.cluster, true).await?;
        let host = active_coordinator(&members)?;
        info!(cluster = %self.cluster, %host, "logging into coordinator");
        self.executor
            .interactive(host, self.config.access.proxy_port.as_deref())
            .await?;
        Ok(ActionOutcome::Completed)
    }

    async fn get_coordinator(&self) -> Result<ActionOutcome> {
        let members = self.locator.find(&self.cluster, true).await?;
        Ok(ActionOutcome::Coordinator(
            active_coordinator(&members)?.to_string(),
        ))
    }

    fn require_identity_file(&self) -> Result<()> {
        if self.config.access.identity_file.is_none() {
            return Err(Error::Configuration(
                "must provide an identity file (-i) for ssh connections".to_string(),
            ));
        }
        Ok(())
    }
}

fn active_coordinator(members: &ClusterMembers) -> Result<&str> {
    members
        .coordinator()
        .map(Instance::address)
        .ok_or_else(|| Error::ClusterNotFound("no coordinator found".to_string()))
}

/// Instances that lifecycle calls still apply to.
fn live(instances: &[Instance]) -> impl Iterator<Item = &Instance> {
    instances.iter().filter(|i| !i.state.is_gone())
}

fn ids<'a>(instances: impl Iterator<Item = &'a Instance>) -> Vec<InstanceId> {
    instances.map(|i| i.id.clone()).collect()
}
