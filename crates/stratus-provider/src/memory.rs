//! In-memory provider — a deterministic simulation of the provider API.
//!
//! Backs every orchestrator test. It keeps groups, instances, tags and spot
//! requests in a single mutex-guarded table, records each mutating call in
//! order, and mimics the provider behaviours the orchestrator depends on:
//!
//! - instances advance one lifecycle step per describe (pending → running,
//!   stopping → stopped, shutting-down → terminated)
//! - a group cannot be deleted while a live instance is in it or another
//!   group's rule references it
//! - spot requests are granted according to a scripted schedule, one step
//!   per describe of spot requests
//! - any operation can be made to fail a given number of times

use std::collections::{HashMap, HashSet, VecDeque};
use std::future;
use std::sync::{Mutex, MutexGuard};

use tracing::debug;

use stratus_core::{
    Instance, InstanceId, InstanceSpec, InstanceState, IngressRule, SecurityGroup, SpotRequest,
    SpotRequestState, Virtualization,
};

use crate::{CloudProvider, Image, ProviderError, ProviderFuture, ProviderResult, SpotBid};

/// A mutating call observed by the simulation.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderCall {
    CreateGroup { name: String },
    DeleteGroup { group_id: String },
    AuthorizeIngress { group_id: String, rule: IngressRule },
    RevokeIngress { group_id: String, rule: IngressRule },
    RunInstances {
        zone: String,
        count: u32,
        instance_type: String,
        group_ids: Vec<String>,
    },
    StartInstances { ids: Vec<InstanceId> },
    StopInstances { ids: Vec<InstanceId> },
    TerminateInstances { ids: Vec<InstanceId> },
    RebootInstances { ids: Vec<InstanceId> },
    CreateTag { id: String, key: String, value: String },
    RequestSpot {
        zone: String,
        count: u32,
        max_price: f64,
        launch_group: String,
    },
    DescribeSpotRequests { ids: Vec<String> },
    CancelSpotRequests { ids: Vec<String> },
}

struct SimSpotRequest {
    request: SpotRequest,
    spec: InstanceSpec,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    zones: Vec<String>,
    images: HashMap<String, Option<Virtualization>>,
    groups: Vec<SecurityGroup>,
    instances: Vec<Instance>,
    tags: HashMap<String, Vec<(String, String)>>,
    spot: Vec<SimSpotRequest>,
    /// Cumulative number of active spot requests after each describe.
    spot_grants: VecDeque<usize>,
    failures: HashMap<String, u32>,
    /// Instance types `run_instances` refuses to launch.
    unavailable_types: HashSet<String>,
    calls: Vec<ProviderCall>,
    frozen: bool,
}

impl Inner {
    fn next(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn check_failure(&mut self, operation: &str) -> ProviderResult<()> {
        if let Some(remaining) = self.failures.get_mut(operation) {
            if *remaining > 0 {
                *remaining -= 1;
                debug!(%operation, "injected provider failure");
                return Err(ProviderError::request(operation, "injected failure"));
            }
        }
        Ok(())
    }

    fn group_names(&self, operation: &str, ids: &[String]) -> ProviderResult<Vec<String>> {
        ids.iter()
            .map(|id| {
                self.groups
                    .iter()
                    .find(|g| &g.id == id)
                    .map(|g| g.name.clone())
                    .ok_or_else(|| ProviderError::NotFound {
                        operation: operation.to_string(),
                        resource: id.clone(),
                    })
            })
            .collect()
    }

    fn new_instance(
        &mut self,
        spec: &InstanceSpec,
        zone: &str,
        groups: Vec<String>,
        spot_request_id: Option<String>,
    ) -> Instance {
        let n = self.next();
        let instance = Instance {
            id: format!("i-{n:08x}"),
            state: InstanceState::Pending,
            instance_type: spec.instance_type.clone(),
            public_address: format!("ec2-{n}.compute.example"),
            private_address: format!("10.0.{}.{}", n / 256, n % 256),
            zone: zone.to_string(),
            groups,
            spot_request_id,
        };
        self.instances.push(instance.clone());
        instance
    }

    fn advance_lifecycle(&mut self) {
        if self.frozen {
            return;
        }
        for inst in &mut self.instances {
            inst.state = match inst.state {
                InstanceState::Pending => InstanceState::Running,
                InstanceState::Stopping => InstanceState::Stopped,
                InstanceState::ShuttingDown => InstanceState::Terminated,
                other => other,
            };
        }
    }

    fn grant_spot(&mut self) -> ProviderResult<()> {
        let Some(target) = self.spot_grants.pop_front() else {
            return Ok(());
        };
        let mut active = self
            .spot
            .iter()
            .filter(|s| s.request.state == SpotRequestState::Active)
            .count();
        let mut idx = 0;
        while active < target && idx < self.spot.len() {
            if self.spot[idx].request.state == SpotRequestState::Open {
                let spec = self.spot[idx].spec.clone();
                let zone = self.spot[idx].request.zone.clone();
                let request_id = self.spot[idx].request.id.clone();
                let groups = self.group_names("describe_spot_requests", &spec.group_ids)?;
                let instance = self.new_instance(&spec, &zone, groups, Some(request_id));
                let request = &mut self.spot[idx].request;
                request.state = SpotRequestState::Active;
                request.instance_id = Some(instance.id);
                active += 1;
            }
            idx += 1;
        }
        Ok(())
    }

    fn set_state(&mut self, ids: &[InstanceId], f: impl Fn(InstanceState) -> InstanceState) {
        for inst in self.instances.iter_mut().filter(|i| ids.contains(&i.id)) {
            inst.state = f(inst.state);
        }
    }
}

/// Deterministic in-process provider.
#[derive(Default)]
pub struct MemoryProvider {
    inner: Mutex<Inner>,
}

impl MemoryProvider {
    /// Create a provider whose region has the given zones.
    pub fn new(zones: &[&str]) -> Self {
        let inner = Inner {
            zones: zones.iter().map(|z| z.to_string()).collect(),
            ..Inner::default()
        };
        Self {
            inner: Mutex::new(inner),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a launchable image.
    pub fn with_image(self, image_id: &str, virtualization: Option<Virtualization>) -> Self {
        self.lock()
            .images
            .insert(image_id.to_string(), virtualization);
        self
    }

    /// Seed an existing instance.
    pub fn insert_instance(&self, instance: Instance) {
        self.lock().instances.push(instance);
    }

    /// Script how many spot requests are active after each successive
    /// describe of spot requests.
    pub fn set_spot_grants(&self, cumulative: impl IntoIterator<Item = usize>) {
        self.lock().spot_grants = cumulative.into_iter().collect();
    }

    /// Make `operation` fail its next `times` calls.
    pub fn fail_next(&self, operation: &str, times: u32) {
        self.lock().failures.insert(operation.to_string(), times);
    }

    /// Make every `run_instances` call for `instance_type` fail, leaving
    /// other types launchable.
    pub fn reject_instance_type(&self, instance_type: &str) {
        self.lock().unavailable_types.insert(instance_type.to_string());
    }

    /// Stop instances from advancing through lifecycle states.
    pub fn freeze_lifecycle(&self, frozen: bool) {
        self.lock().frozen = frozen;
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        self.lock().calls.clone()
    }

    pub fn instances(&self) -> Vec<Instance> {
        self.lock().instances.clone()
    }

    pub fn groups(&self) -> Vec<SecurityGroup> {
        self.lock().groups.clone()
    }

    pub fn spot_requests(&self) -> Vec<SpotRequest> {
        self.lock().spot.iter().map(|s| s.request.clone()).collect()
    }

    pub fn tags_for(&self, id: &str) -> Vec<(String, String)> {
        self.lock().tags.get(id).cloned().unwrap_or_default()
    }

    pub fn set_instance_state(&self, id: &str, state: InstanceState) {
        self.lock().set_state(&[id.to_string()], |_| state);
    }

    /// Apply `f` under the lock and hand back an already-resolved future.
    fn resolve<'a, T: Send + 'a>(
        &'a self,
        f: impl FnOnce(&mut Inner) -> ProviderResult<T>,
    ) -> ProviderFuture<'a, T> {
        let mut guard = self.lock();
        let result = f(&mut guard);
        Box::pin(future::ready(result))
    }
}

impl CloudProvider for MemoryProvider {
    fn list_groups(&self) -> ProviderFuture<'_, Vec<SecurityGroup>> {
        self.resolve(|inner| {
            inner.check_failure("list_groups")?;
            Ok(inner.groups.clone())
        })
    }

    fn create_group<'a>(
        &'a self,
        name: &'a str,
        _description: &'a str,
    ) -> ProviderFuture<'a, SecurityGroup> {
        self.resolve(move |inner| {
            inner.check_failure("create_group")?;
            if inner.groups.iter().any(|g| g.name == name) {
                return Err(ProviderError::request(
                    "create_group",
                    format!("group {name} already exists"),
                ));
            }
            let group = SecurityGroup {
                id: format!("sg-{:04}", inner.next()),
                name: name.to_string(),
                rules: Vec::new(),
            };
            inner.groups.push(group.clone());
            inner.calls.push(ProviderCall::CreateGroup {
                name: name.to_string(),
            });
            Ok(group)
        })
    }

    fn delete_group<'a>(&'a self, group_id: &'a str) -> ProviderFuture<'a, ()> {
        self.resolve(move |inner| {
            inner.calls.push(ProviderCall::DeleteGroup {
                group_id: group_id.to_string(),
            });
            inner.check_failure("delete_group")?;
            let Some(pos) = inner.groups.iter().position(|g| g.id == group_id) else {
                return Err(ProviderError::NotFound {
                    operation: "delete_group".into(),
                    resource: group_id.to_string(),
                });
            };
            let name = inner.groups[pos].name.clone();
            let in_use_by_instance = inner
                .instances
                .iter()
                .any(|i| i.state != InstanceState::Terminated && i.in_group(&name));
            let in_use_by_rule = inner.groups.iter().any(|g| {
                g.id != group_id
                    && g.rules
                        .iter()
                        .any(|r| r.referenced_group() == Some(group_id))
            });
            if in_use_by_instance || in_use_by_rule {
                return Err(ProviderError::DependencyViolation {
                    operation: "delete_group".into(),
                    resource: name,
                });
            }
            inner.groups.remove(pos);
            Ok(())
        })
    }

    fn authorize_ingress<'a>(
        &'a self,
        group_id: &'a str,
        rule: &'a IngressRule,
    ) -> ProviderFuture<'a, ()> {
        self.resolve(move |inner| {
            inner.check_failure("authorize_ingress")?;
            let group = inner
                .groups
                .iter_mut()
                .find(|g| g.id == group_id)
                .ok_or_else(|| ProviderError::NotFound {
                    operation: "authorize_ingress".into(),
                    resource: group_id.to_string(),
                })?;
            if group.rules.contains(rule) {
                return Err(ProviderError::request(
                    "authorize_ingress",
                    "the specified rule already exists",
                ));
            }
            group.rules.push(rule.clone());
            inner.calls.push(ProviderCall::AuthorizeIngress {
                group_id: group_id.to_string(),
                rule: rule.clone(),
            });
            Ok(())
        })
    }

    fn revoke_ingress<'a>(
        &'a self,
        group_id: &'a str,
        rule: &'a IngressRule,
    ) -> ProviderFuture<'a, ()> {
        self.resolve(move |inner| {
            inner.calls.push(ProviderCall::RevokeIngress {
                group_id: group_id.to_string(),
                rule: rule.clone(),
            });
            inner.check_failure("revoke_ingress")?;
            let group = inner
                .groups
                .iter_mut()
                .find(|g| g.id == group_id)
                .ok_or_else(|| ProviderError::NotFound {
                    operation: "revoke_ingress".into(),
                    resource: group_id.to_string(),
                })?;
            let before = group.rules.len();
            group.rules.retain(|r| r != rule);
            if group.rules.len() == before {
                return Err(ProviderError::NotFound {
                    operation: "revoke_ingress".into(),
                    resource: "rule".into(),
                });
            }
            Ok(())
        })
    }

    fn describe_instances<'a>(&'a self, ids: &'a [InstanceId]) -> ProviderFuture<'a, Vec<Instance>> {
        self.resolve(move |inner| {
            inner.check_failure("describe_instances")?;
            inner.advance_lifecycle();
            Ok(inner
                .instances
                .iter()
                .filter(|i| ids.is_empty() || ids.contains(&i.id))
                .cloned()
                .collect())
        })
    }

    fn run_instances<'a>(
        &'a self,
        spec: &'a InstanceSpec,
        zone: &'a str,
        count: u32,
    ) -> ProviderFuture<'a, Vec<Instance>> {
        self.resolve(move |inner| {
            inner.calls.push(ProviderCall::RunInstances {
                zone: zone.to_string(),
                count,
                instance_type: spec.instance_type.clone(),
                group_ids: spec.group_ids.clone(),
            });
            inner.check_failure("run_instances")?;
            if inner.unavailable_types.contains(&spec.instance_type) {
                return Err(ProviderError::request(
                    "run_instances",
                    format!("instance type {} is not available in {zone}", spec.instance_type),
                ));
            }
            let groups = inner.group_names("run_instances", &spec.group_ids)?;
            Ok((0..count)
                .map(|_| inner.new_instance(spec, zone, groups.clone(), None))
                .collect())
        })
    }

    fn start_instances<'a>(&'a self, ids: &'a [InstanceId]) -> ProviderFuture<'a, ()> {
        self.resolve(move |inner| {
            inner.calls.push(ProviderCall::StartInstances { ids: ids.to_vec() });
            inner.check_failure("start_instances")?;
            inner.set_state(ids, |s| match s {
                InstanceState::Stopped | InstanceState::Stopping => InstanceState::Pending,
                other => other,
            });
            Ok(())
        })
    }

    fn stop_instances<'a>(&'a self, ids: &'a [InstanceId]) -> ProviderFuture<'a, ()> {
        self.resolve(move |inner| {
            inner.calls.push(ProviderCall::StopInstances { ids: ids.to_vec() });
            inner.check_failure("stop_instances")?;
            inner.set_state(ids, |s| match s {
                InstanceState::Pending | InstanceState::Running => InstanceState::Stopping,
                other => other,
            });
            Ok(())
        })
    }

    fn terminate_instances<'a>(&'a self, ids: &'a [InstanceId]) -> ProviderFuture<'a, ()> {
        self.resolve(move |inner| {
            inner
                .calls
                .push(ProviderCall::TerminateInstances { ids: ids.to_vec() });
            inner.check_failure("terminate_instances")?;
            inner.set_state(ids, |s| match s {
                InstanceState::Terminated => InstanceState::Terminated,
                _ => InstanceState::ShuttingDown,
            });
            Ok(())
        })
    }

    fn reboot_instances<'a>(&'a self, ids: &'a [InstanceId]) -> ProviderFuture<'a, ()> {
        self.resolve(move |inner| {
            inner
                .calls
                .push(ProviderCall::RebootInstances { ids: ids.to_vec() });
            inner.check_failure("reboot_instances")
        })
    }

    fn create_tag<'a>(
        &'a self,
        id: &'a str,
        key: &'a str,
        value: &'a str,
    ) -> ProviderFuture<'a, ()> {
        self.resolve(move |inner| {
            inner.calls.push(ProviderCall::CreateTag {
                id: id.to_string(),
                key: key.to_string(),
                value: value.to_string(),
            });
            inner.check_failure("create_tag")?;
            inner
                .tags
                .entry(id.to_string())
                .or_default()
                .push((key.to_string(), value.to_string()));
            Ok(())
        })
    }

    fn request_spot_instances<'a>(
        &'a self,
        spec: &'a InstanceSpec,
        bid: SpotBid<'a>,
    ) -> ProviderFuture<'a, Vec<SpotRequest>> {
        self.resolve(move |inner| {
            inner.calls.push(ProviderCall::RequestSpot {
                zone: bid.zone.to_string(),
                count: bid.count,
                max_price: bid.max_price,
                launch_group: bid.launch_group.to_string(),
            });
            inner.check_failure("request_spot_instances")?;
            let mut created = Vec::new();
            for _ in 0..bid.count {
                let request = SpotRequest {
                    id: format!("sir-{:06}", inner.next()),
                    price: bid.max_price,
                    zone: bid.zone.to_string(),
                    state: SpotRequestState::Open,
                    instance_id: None,
                };
                created.push(request.clone());
                inner.spot.push(SimSpotRequest {
                    request,
                    spec: spec.clone(),
                });
            }
            Ok(created)
        })
    }

    fn describe_spot_requests<'a>(
        &'a self,
        ids: &'a [String],
    ) -> ProviderFuture<'a, Vec<SpotRequest>> {
        self.resolve(move |inner| {
            inner
                .calls
                .push(ProviderCall::DescribeSpotRequests { ids: ids.to_vec() });
            inner.check_failure("describe_spot_requests")?;
            inner.grant_spot()?;
            Ok(inner
                .spot
                .iter()
                .filter(|s| ids.is_empty() || ids.contains(&s.request.id))
                .map(|s| s.request.clone())
                .collect())
        })
    }

    fn cancel_spot_requests<'a>(&'a self, ids: &'a [String]) -> ProviderFuture<'a, ()> {
        self.resolve(move |inner| {
            inner
                .calls
                .push(ProviderCall::CancelSpotRequests { ids: ids.to_vec() });
            inner.check_failure("cancel_spot_requests")?;
            for sim in inner.spot.iter_mut().filter(|s| ids.contains(&s.request.id)) {
                sim.request.state = SpotRequestState::Cancelled;
            }
            Ok(())
        })
    }

    fn list_zones(&self) -> ProviderFuture<'_, Vec<String>> {
        self.resolve(|inner| {
            inner.check_failure("list_zones")?;
            Ok(inner.zones.clone())
        })
    }

    fn describe_image<'a>(&'a self, image_id: &'a str) -> ProviderFuture<'a, Image> {
        self.resolve(move |inner| {
            inner.check_failure("describe_image")?;
            match inner.images.get(image_id) {
                Some(virtualization) => Ok(Image {
                    id: image_id.to_string(),
                    virtualization: *virtualization,
                }),
                None => Err(ProviderError::NotFound {
                    operation: "describe_image".into(),
                    resource: image_id.to_string(),
                }),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratus_core::{PortRange, Virtualization};

    fn spec(group_ids: Vec<String>) -> InstanceSpec {
        InstanceSpec {
            image_id: "ami-1".into(),
            instance_type: "m1.large".into(),
            key_pair: "ops".into(),
            group_ids,
            block_devices: vec![],
            user_data: None,
        }
    }

    #[tokio::test]
    async fn instances_advance_one_step_per_describe() {
        let provider = MemoryProvider::new(&["a"]);
        let group = provider.create_group("demo-workers", "").await.unwrap();
        let launched = provider
            .run_instances(&spec(vec![group.id]), "a", 2)
            .await
            .unwrap();
        assert!(launched.iter().all(|i| i.state == InstanceState::Pending));
        assert!(launched.iter().all(|i| i.in_group("demo-workers")));

        let described = provider.describe_instances(&[]).await.unwrap();
        assert!(described.iter().all(|i| i.state == InstanceState::Running));
    }

    #[tokio::test]
    async fn group_in_use_by_rule_cannot_be_deleted() {
        let provider = MemoryProvider::new(&["a"]);
        let a = provider.create_group("a", "").await.unwrap();
        let b = provider.create_group("b", "").await.unwrap();
        provider
            .authorize_ingress(&a.id, &IngressRule::all_from_group(&b))
            .await
            .unwrap();

        let err = provider.delete_group(&b.id).await.unwrap_err();
        assert!(matches!(err, ProviderError::DependencyViolation { .. }));

        provider
            .revoke_ingress(&a.id, &IngressRule::all_from_group(&b))
            .await
            .unwrap();
        provider.delete_group(&b.id).await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_rule_is_rejected() {
        let provider = MemoryProvider::new(&["a"]);
        let g = provider.create_group("g", "").await.unwrap();
        let rule = IngressRule::tcp(PortRange::single(22), "0.0.0.0/0");
        provider.authorize_ingress(&g.id, &rule).await.unwrap();
        assert!(provider.authorize_ingress(&g.id, &rule).await.is_err());
    }

    #[tokio::test]
    async fn spot_requests_follow_grant_schedule() {
        let provider = MemoryProvider::new(&["a"]);
        let g = provider.create_group("w", "").await.unwrap();
        provider.set_spot_grants([0, 1]);
        let bid = SpotBid {
            zone: "a",
            count: 2,
            max_price: 0.1,
            launch_group: "launch-group-demo",
        };
        let reqs = provider
            .request_spot_instances(&spec(vec![g.id]), bid)
            .await
            .unwrap();
        let ids: Vec<String> = reqs.iter().map(|r| r.id.clone()).collect();

        let first = provider.describe_spot_requests(&ids).await.unwrap();
        assert!(first.iter().all(|r| r.state == SpotRequestState::Open));

        let second = provider.describe_spot_requests(&ids).await.unwrap();
        let active: Vec<_> = second
            .iter()
            .filter(|r| r.state == SpotRequestState::Active)
            .collect();
        assert_eq!(active.len(), 1);
        assert!(active[0].instance_id.is_some());
        assert_eq!(provider.instances().len(), 1);
        assert!(provider.instances()[0].is_spot());
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let provider = MemoryProvider::new(&["a"]);
        provider.fail_next("list_zones", 1);
        assert!(provider.list_zones().await.is_err());
        assert_eq!(provider.list_zones().await.unwrap(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn rejected_instance_type_fails_only_that_type() {
        let provider = MemoryProvider::new(&["a"]);
        let g = provider.create_group("w", "").await.unwrap();
        provider.reject_instance_type("m3.2xlarge");

        let mut big = spec(vec![g.id.clone()]);
        big.instance_type = "m3.2xlarge".into();
        assert!(provider.run_instances(&big, "a", 1).await.is_err());
        assert!(provider.instances().is_empty());

        provider.run_instances(&spec(vec![g.id]), "a", 1).await.unwrap();
        assert_eq!(provider.instances().len(), 1);
    }

    #[tokio::test]
    async fn unknown_image_is_not_found() {
        let provider =
            MemoryProvider::new(&["a"]).with_image("ami-1", Some(Virtualization::Hardware));
        assert!(provider.describe_image("ami-1").await.is_ok());
        assert!(matches!(
            provider.describe_image("ami-2").await,
            Err(ProviderError::NotFound { .. })
        ));
    }
}
