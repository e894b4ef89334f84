//! Instance acquisition: on-demand runs, spot requests, resume, tagging.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use stratus_core::catalog;
use stratus_core::config::StorageConfig;
use stratus_core::{
    BlockDevice, BlockDeviceSource, ClusterName, Error, Instance, InstanceId, InstanceSpec, Result,
    Role, SpotRequestState, VolumeSpec, ZonePlacement,
};
use stratus_provider::{CloudProvider, ProviderError, SpotBid};

use crate::locator::ClusterLocator;

/// Interval between spot request polls; the first poll waits one interval.
pub const SPOT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Why spot polling stopped before every request was granted.
enum Interrupt {
    Operator,
    Provider(ProviderError),
}

/// Drives the provider to create or restart cluster instances.
#[derive(Clone)]
pub struct InstanceAcquirer {
    provider: Arc<dyn CloudProvider>,
    locator: ClusterLocator,
    cluster: ClusterName,
}

impl InstanceAcquirer {
    pub fn new(provider: Arc<dyn CloudProvider>, cluster: ClusterName) -> Self {
        Self {
            locator: ClusterLocator::new(provider.clone()),
            provider,
            cluster,
        }
    }

    /// One run request per zone with a non-zero count, results in zone order.
    pub async fn acquire_on_demand(
        &self,
        placement: &ZonePlacement,
        spec: &InstanceSpec,
    ) -> Result<Vec<Instance>> {
        let mut instances = Vec::new();
        for (zone, count) in placement.non_empty() {
            let launched = self.provider.run_instances(spec, zone, count).await?;
            info!(
                cluster = %self.cluster,
                %zone,
                instance_type = %spec.instance_type,
                "launched {} instance(s)",
                launched.len()
            );
            instances.extend(launched);
        }
        Ok(instances)
    }

    /// Request `count` spot instances across `placement` at `max_price` and
    /// wait until every one is granted.
    ///
    /// If `cancel` resolves or a poll fails, every issued request is
    /// cancelled once and the error reports how many cluster instances
    /// are already running.
    pub async fn acquire_spot<C>(
        &self,
        count: u32,
        placement: &ZonePlacement,
        max_price: f64,
        spec: &InstanceSpec,
        cancel: C,
    ) -> Result<Vec<Instance>>
    where
        C: Future<Output = ()>,
    {
        let launch_group = self.cluster.launch_group();
        let mut request_ids = Vec::new();
        for (zone, zone_count) in placement.non_empty() {
            let bid = SpotBid {
                zone,
                count: zone_count,
                max_price,
                launch_group: &launch_group,
            };
            let requests = self.provider.request_spot_instances(spec, bid).await?;
            request_ids.extend(requests.into_iter().map(|r| r.id));
        }
        info!(
            cluster = %self.cluster,
            requests = request_ids.len(),
            max_price,
            "requested {count} spot instance(s), waiting for grants"
        );

        let wanted = usize::try_from(count).unwrap_or(usize::MAX);
        let poll = self.poll_spot_requests(&request_ids, wanted);
        tokio::pin!(poll);
        tokio::pin!(cancel);
        let outcome = tokio::select! {
            result = &mut poll => result.map_err(Interrupt::Provider),
            () = &mut cancel => Err(Interrupt::Operator),
        };

        match outcome {
            Ok(granted) => {
                info!(cluster = %self.cluster, "all {count} spot instance(s) granted");
                Ok(self.provider.describe_instances(&granted).await?)
            }
            Err(interrupt) => self.abandon_spot(&request_ids, interrupt).await,
        }
    }

    async fn poll_spot_requests(
        &self,
        request_ids: &[String],
        wanted: usize,
    ) -> std::result::Result<Vec<InstanceId>, ProviderError> {
        loop {
            tokio::time::sleep(SPOT_POLL_INTERVAL).await;
            let requests = self.provider.describe_spot_requests(request_ids).await?;
            let granted: BTreeSet<InstanceId> = requests
                .into_iter()
                .filter(|r| r.state == SpotRequestState::Active)
                .filter_map(|r| r.instance_id)
                .collect();
            if granted.len() >= wanted {
                return Ok(granted.into_iter().collect());
            }
            info!(
                cluster = %self.cluster,
                "{} of {wanted} spot instance(s) granted, waiting",
                granted.len()
            );
        }
    }

    async fn abandon_spot(&self, request_ids: &[String], interrupt: Interrupt) -> Result<Vec<Instance>> {
        let (reason, operator_cancelled) = match interrupt {
            Interrupt::Operator => ("cancelled by operator".to_string(), true),
            Interrupt::Provider(err) => (err.to_string(), false),
        };
        warn!(cluster = %self.cluster, %reason, "canceling spot instance requests");
        if let Err(err) = self.provider.cancel_spot_requests(request_ids).await {
            warn!(cluster = %self.cluster, error = %err, "failed to cancel spot requests");
        }

        let running = match self.locator.find(&self.cluster, false).await {
            Ok(members) => members.len(),
            Err(err) => {
                warn!(cluster = %self.cluster, error = %err, "could not re-check cluster");
                0
            }
        };
        if running > 0 {
            warn!(
                cluster = %self.cluster,
                "{running} instance(s) may still be running and must be destroyed separately"
            );
        }
        Err(Error::SpotAcquisitionInterrupted {
            reason,
            running,
            operator_cancelled,
        })
    }

    /// Start every existing coordinator that is not on its way out.
    pub async fn resume_stopped_coordinator(&self, existing: &[Instance]) -> Result<()> {
        let ids: Vec<InstanceId> = existing
            .iter()
            .filter(|i| !i.state.is_gone())
            .map(|i| i.id.clone())
            .collect();
        if ids.is_empty() {
            return Ok(());
        }
        info!(cluster = %self.cluster, instances = ?ids, "starting existing coordinator");
        self.provider.start_instances(&ids).await?;
        Ok(())
    }

    /// Tag each instance with `Name = <cluster>-<role>-<id>`.
    pub async fn tag_instances(&self, instances: &[Instance], role: Role) -> Result<()> {
        for instance in instances {
            let name = self.cluster.instance_name(role, &instance.id);
            debug!(instance = %instance.id, %name, "tagging");
            self.provider.create_tag(&instance.id, "Name", &name).await?;
        }
        Ok(())
    }
}

/// Block device mappings for an instance type.
///
/// Durable volumes land on `/dev/sds` onwards. Instance families that
/// ignore image-declared mappings get their local disks mapped explicitly
/// on `/dev/sdb` onwards.
pub fn block_devices(storage: &StorageConfig, instance_type: &str) -> Vec<BlockDevice> {
    let mut devices = Vec::new();
    if storage.volume_size > 0 {
        for i in 0..storage.volume_count {
            devices.push(BlockDevice {
                device_name: device_name(b's', i),
                source: BlockDeviceSource::Volume(VolumeSpec {
                    size_gib: storage.volume_size,
                    volume_type: storage.volume_type.clone(),
                    delete_on_termination: true,
                }),
            });
        }
    }
    if catalog::ignores_image_block_mappings(instance_type) {
        for i in 0..catalog::local_disk_count(instance_type) {
            devices.push(BlockDevice {
                device_name: device_name(b'b', i),
                source: BlockDeviceSource::Ephemeral {
                    virtual_name: format!("ephemeral{i}"),
                },
            });
        }
    }
    devices
}

fn device_name(first: u8, offset: u32) -> String {
    let letter = u32::from(first) + offset;
    let letter = char::from_u32(letter).unwrap_or('z');
    format!("/dev/sd{letter}")
}
