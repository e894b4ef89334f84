//! stratus-provider — the cloud provider boundary.
//!
//! The orchestrator consumes a small set of provider primitives (groups,
//! ingress rules, instances, tags, spot requests, zones, images) through
//! the object-safe [`CloudProvider`] trait. Two backends implement it:
//!
//! - **`ec2`**: the real provider, via `aws-sdk-ec2`
//! - **`memory`**: a deterministic in-process simulation for tests
//!
//! Methods return boxed futures so the trait can be used as
//! `Arc<dyn CloudProvider>`.

use std::future::Future;
use std::pin::Pin;

use stratus_core::{
    Instance, InstanceId, InstanceSpec, IngressRule, SecurityGroup, SpotRequest, Virtualization,
};

pub mod ec2;
pub mod error;
pub mod memory;

pub use ec2::Ec2Provider;
pub use error::{ProviderError, ProviderResult};
pub use memory::{MemoryProvider, ProviderCall};

/// Boxed future returned by every provider call.
pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = ProviderResult<T>> + Send + 'a>>;

/// A machine image as the provider describes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub id: String,
    pub virtualization: Option<Virtualization>,
}

/// Parameters of one spot request submission.
#[derive(Debug, Clone, Copy)]
pub struct SpotBid<'a> {
    pub zone: &'a str,
    pub count: u32,
    pub max_price: f64,
    pub launch_group: &'a str,
}

/// Primitive operations the orchestrator needs from a cloud provider.
pub trait CloudProvider: Send + Sync {
    /// Every isolation group visible to the account.
    fn list_groups(&self) -> ProviderFuture<'_, Vec<SecurityGroup>>;

    /// Create a group with no ingress rules.
    fn create_group<'a>(&'a self, name: &'a str, description: &'a str)
    -> ProviderFuture<'a, SecurityGroup>;

    fn delete_group<'a>(&'a self, group_id: &'a str) -> ProviderFuture<'a, ()>;

    fn authorize_ingress<'a>(
        &'a self,
        group_id: &'a str,
        rule: &'a IngressRule,
    ) -> ProviderFuture<'a, ()>;

    fn revoke_ingress<'a>(&'a self, group_id: &'a str, rule: &'a IngressRule)
    -> ProviderFuture<'a, ()>;

    /// Describe the given instances, or every instance when `ids` is empty.
    fn describe_instances<'a>(&'a self, ids: &'a [InstanceId]) -> ProviderFuture<'a, Vec<Instance>>;

    /// Launch exactly `count` instances in `zone`.
    fn run_instances<'a>(
        &'a self,
        spec: &'a InstanceSpec,
        zone: &'a str,
        count: u32,
    ) -> ProviderFuture<'a, Vec<Instance>>;

    fn start_instances<'a>(&'a self, ids: &'a [InstanceId]) -> ProviderFuture<'a, ()>;

    fn stop_instances<'a>(&'a self, ids: &'a [InstanceId]) -> ProviderFuture<'a, ()>;

    fn terminate_instances<'a>(&'a self, ids: &'a [InstanceId]) -> ProviderFuture<'a, ()>;

    fn reboot_instances<'a>(&'a self, ids: &'a [InstanceId]) -> ProviderFuture<'a, ()>;

    fn create_tag<'a>(&'a self, id: &'a str, key: &'a str, value: &'a str)
    -> ProviderFuture<'a, ()>;

    /// Submit one spot request covering `bid.count` instances.
    fn request_spot_instances<'a>(
        &'a self,
        spec: &'a InstanceSpec,
        bid: SpotBid<'a>,
    ) -> ProviderFuture<'a, Vec<SpotRequest>>;

    fn describe_spot_requests<'a>(&'a self, ids: &'a [String]) -> ProviderFuture<'a, Vec<SpotRequest>>;

    fn cancel_spot_requests<'a>(&'a self, ids: &'a [String]) -> ProviderFuture<'a, ()>;

    /// Availability zones of the configured region, in provider order.
    fn list_zones(&self) -> ProviderFuture<'_, Vec<String>>;

    fn describe_image<'a>(&'a self, image_id: &'a str) -> ProviderFuture<'a, Image>;
}
