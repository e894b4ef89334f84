//! EC2 backend.
//!
//! Thin mapping between the [`CloudProvider`] primitives and
//! `aws-sdk-ec2`. Credentials come from the standard AWS chain
//! (environment, profile, instance metadata).

use aws_config::BehaviorVersion;
use aws_sdk_ec2::Client;
use aws_sdk_ec2::config::Region;
use aws_sdk_ec2::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_ec2::types::{
    BlockDeviceMapping, EbsBlockDevice, Filter, InstanceType, IpPermission, IpRange, Placement,
    RequestSpotLaunchSpecification, SpotPlacement, Tag, UserIdGroupPair, VolumeType,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::debug;

use stratus_core::{
    BlockDevice, BlockDeviceSource, Instance, InstanceId, InstanceSpec, InstanceState,
    IngressRule, IpProtocol, PortRange, RuleSource, SecurityGroup, SpotRequest, SpotRequestState,
    Virtualization,
};

use crate::{CloudProvider, Image, ProviderError, ProviderFuture, SpotBid};

/// Provider backed by the EC2 API of a single region.
#[derive(Clone)]
pub struct Ec2Provider {
    client: Client,
    region: String,
}

impl Ec2Provider {
    /// Load credentials from the default chain and bind to `region`.
    pub async fn connect(region: &str) -> Self {
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .load()
            .await;
        debug!(%region, "ec2 client configured");
        Self {
            client: Client::new(&config),
            region: region.to_string(),
        }
    }
}

fn sdk_error<E, R>(operation: &str, resource: &str, err: SdkError<E, R>) -> ProviderError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    match err.code() {
        Some("DependencyViolation") => ProviderError::DependencyViolation {
            operation: operation.to_string(),
            resource: resource.to_string(),
        },
        Some(code) if code.ends_with(".NotFound") => ProviderError::NotFound {
            operation: operation.to_string(),
            resource: resource.to_string(),
        },
        _ => ProviderError::request(operation, DisplayErrorContext(&err)),
    }
}

// ── Conversions ───────────────────────────────────────────────────

fn to_permission(rule: &IngressRule) -> IpPermission {
    let mut perm = IpPermission::builder().ip_protocol(rule.protocol.as_str());
    if let Some(ports) = rule.ports {
        perm = perm
            .from_port(i32::from(ports.from))
            .to_port(i32::from(ports.to));
    }
    match &rule.source {
        RuleSource::Cidr { cidr } => perm.ip_ranges(IpRange::builder().cidr_ip(cidr).build()),
        RuleSource::Group { id, .. } => {
            perm.user_id_group_pairs(UserIdGroupPair::builder().group_id(id).build())
        }
    }
    .build()
}

fn from_permission(perm: &IpPermission) -> Vec<IngressRule> {
    let protocol = IpProtocol::parse(perm.ip_protocol().unwrap_or("-1"));
    let ports = match (perm.from_port(), perm.to_port()) {
        (Some(from), Some(to)) if protocol != IpProtocol::All => {
            match (u16::try_from(from), u16::try_from(to)) {
                (Ok(from), Ok(to)) => Some(PortRange::new(from, to)),
                _ => None,
            }
        }
        _ => None,
    };
    let cidrs = perm.ip_ranges().iter().filter_map(|r| r.cidr_ip()).map(|cidr| {
        RuleSource::Cidr {
            cidr: cidr.to_string(),
        }
    });
    let groups = perm.user_id_group_pairs().iter().filter_map(|pair| {
        pair.group_id().map(|id| RuleSource::Group {
            id: id.to_string(),
            name: pair.group_name().unwrap_or_default().to_string(),
        })
    });
    cidrs
        .chain(groups)
        .map(|source| IngressRule {
            protocol,
            ports,
            source,
        })
        .collect()
}

fn from_group(group: &aws_sdk_ec2::types::SecurityGroup) -> SecurityGroup {
    SecurityGroup {
        id: group.group_id().unwrap_or_default().to_string(),
        name: group.group_name().unwrap_or_default().to_string(),
        rules: group.ip_permissions().iter().flat_map(from_permission).collect(),
    }
}

fn from_instance(inst: &aws_sdk_ec2::types::Instance) -> Instance {
    let state = inst
        .state()
        .and_then(|s| s.name())
        .and_then(|name| name.as_str().parse().ok())
        .unwrap_or(InstanceState::Pending);
    Instance {
        id: inst.instance_id().unwrap_or_default().to_string(),
        state,
        instance_type: inst
            .instance_type()
            .map(|t| t.as_str().to_string())
            .unwrap_or_default(),
        public_address: inst.public_dns_name().unwrap_or_default().to_string(),
        private_address: inst.private_ip_address().unwrap_or_default().to_string(),
        zone: inst
            .placement()
            .and_then(|p| p.availability_zone())
            .unwrap_or_default()
            .to_string(),
        groups: inst
            .security_groups()
            .iter()
            .filter_map(|g| g.group_name())
            .map(str::to_string)
            .collect(),
        spot_request_id: inst.spot_instance_request_id().map(str::to_string),
    }
}

fn from_spot_request(req: &aws_sdk_ec2::types::SpotInstanceRequest) -> SpotRequest {
    let zone = req
        .launched_availability_zone()
        .or_else(|| {
            req.launch_specification()
                .and_then(|spec| spec.placement())
                .and_then(|p| p.availability_zone())
        })
        .unwrap_or_default();
    SpotRequest {
        id: req.spot_instance_request_id().unwrap_or_default().to_string(),
        price: req
            .spot_price()
            .and_then(|p| p.parse().ok())
            .unwrap_or_default(),
        zone: zone.to_string(),
        state: req
            .state()
            .map_or(SpotRequestState::Failed, |s| SpotRequestState::parse(s.as_str())),
        instance_id: req.instance_id().map(str::to_string),
    }
}

fn to_mapping(device: &BlockDevice) -> BlockDeviceMapping {
    let mapping = BlockDeviceMapping::builder().device_name(&device.device_name);
    match &device.source {
        BlockDeviceSource::Ephemeral { virtual_name } => mapping.virtual_name(virtual_name),
        BlockDeviceSource::Volume(volume) => mapping.ebs(
            EbsBlockDevice::builder()
                .volume_size(i32::try_from(volume.size_gib).unwrap_or(i32::MAX))
                .volume_type(VolumeType::from(volume.volume_type.as_str()))
                .delete_on_termination(volume.delete_on_termination)
                .build(),
        ),
    }
    .build()
}

fn encoded_user_data(spec: &InstanceSpec) -> Option<String> {
    spec.user_data.as_ref().map(|data| STANDARD.encode(data))
}

fn count_i32(count: u32) -> i32 {
    i32::try_from(count).unwrap_or(i32::MAX)
}

// ── CloudProvider ─────────────────────────────────────────────────

impl CloudProvider for Ec2Provider {
    fn list_groups(&self) -> ProviderFuture<'_, Vec<SecurityGroup>> {
        Box::pin(async move {
            let mut groups = Vec::new();
            let mut token = None;
            loop {
                let out = self
                    .client
                    .describe_security_groups()
                    .set_next_token(token)
                    .send()
                    .await
                    .map_err(|e| sdk_error("describe_security_groups", "groups", e))?;
                groups.extend(out.security_groups().iter().map(from_group));
                token = out.next_token().map(str::to_string);
                if token.is_none() {
                    break;
                }
            }
            Ok(groups)
        })
    }

    fn create_group<'a>(
        &'a self,
        name: &'a str,
        description: &'a str,
    ) -> ProviderFuture<'a, SecurityGroup> {
        Box::pin(async move {
            let out = self
                .client
                .create_security_group()
                .group_name(name)
                .description(description)
                .send()
                .await
                .map_err(|e| sdk_error("create_security_group", name, e))?;
            Ok(SecurityGroup {
                id: out.group_id().unwrap_or_default().to_string(),
                name: name.to_string(),
                rules: Vec::new(),
            })
        })
    }

    fn delete_group<'a>(&'a self, group_id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.client
                .delete_security_group()
                .group_id(group_id)
                .send()
                .await
                .map_err(|e| sdk_error("delete_security_group", group_id, e))?;
            Ok(())
        })
    }

    fn authorize_ingress<'a>(
        &'a self,
        group_id: &'a str,
        rule: &'a IngressRule,
    ) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.client
                .authorize_security_group_ingress()
                .group_id(group_id)
                .ip_permissions(to_permission(rule))
                .send()
                .await
                .map_err(|e| sdk_error("authorize_security_group_ingress", group_id, e))?;
            Ok(())
        })
    }

    fn revoke_ingress<'a>(
        &'a self,
        group_id: &'a str,
        rule: &'a IngressRule,
    ) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.client
                .revoke_security_group_ingress()
                .group_id(group_id)
                .ip_permissions(to_permission(rule))
                .send()
                .await
                .map_err(|e| sdk_error("revoke_security_group_ingress", group_id, e))?;
            Ok(())
        })
    }

    fn describe_instances<'a>(&'a self, ids: &'a [InstanceId]) -> ProviderFuture<'a, Vec<Instance>> {
        Box::pin(async move {
            let mut instances = Vec::new();
            let mut token = None;
            loop {
                let mut req = self.client.describe_instances().set_next_token(token);
                if !ids.is_empty() {
                    req = req.set_instance_ids(Some(ids.to_vec()));
                }
                let out = req
                    .send()
                    .await
                    .map_err(|e| sdk_error("describe_instances", "instances", e))?;
                for reservation in out.reservations() {
                    instances.extend(reservation.instances().iter().map(from_instance));
                }
                token = out.next_token().map(str::to_string);
                if token.is_none() {
                    break;
                }
            }
            Ok(instances)
        })
    }

    fn run_instances<'a>(
        &'a self,
        spec: &'a InstanceSpec,
        zone: &'a str,
        count: u32,
    ) -> ProviderFuture<'a, Vec<Instance>> {
        Box::pin(async move {
            let out = self
                .client
                .run_instances()
                .image_id(&spec.image_id)
                .instance_type(InstanceType::from(spec.instance_type.as_str()))
                .key_name(&spec.key_pair)
                .set_security_group_ids(Some(spec.group_ids.clone()))
                .placement(Placement::builder().availability_zone(zone).build())
                .set_block_device_mappings(Some(spec.block_devices.iter().map(to_mapping).collect()))
                .set_user_data(encoded_user_data(spec))
                .min_count(count_i32(count))
                .max_count(count_i32(count))
                .send()
                .await
                .map_err(|e| sdk_error("run_instances", zone, e))?;
            Ok(out.instances().iter().map(from_instance).collect())
        })
    }

    fn start_instances<'a>(&'a self, ids: &'a [InstanceId]) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.client
                .start_instances()
                .set_instance_ids(Some(ids.to_vec()))
                .send()
                .await
                .map_err(|e| sdk_error("start_instances", "instances", e))?;
            Ok(())
        })
    }

    fn stop_instances<'a>(&'a self, ids: &'a [InstanceId]) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.client
                .stop_instances()
                .set_instance_ids(Some(ids.to_vec()))
                .send()
                .await
                .map_err(|e| sdk_error("stop_instances", "instances", e))?;
            Ok(())
        })
    }

    fn terminate_instances<'a>(&'a self, ids: &'a [InstanceId]) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.client
                .terminate_instances()
                .set_instance_ids(Some(ids.to_vec()))
                .send()
                .await
                .map_err(|e| sdk_error("terminate_instances", "instances", e))?;
            Ok(())
        })
    }

    fn reboot_instances<'a>(&'a self, ids: &'a [InstanceId]) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.client
                .reboot_instances()
                .set_instance_ids(Some(ids.to_vec()))
                .send()
                .await
                .map_err(|e| sdk_error("reboot_instances", "instances", e))?;
            Ok(())
        })
    }

    fn create_tag<'a>(
        &'a self,
        id: &'a str,
        key: &'a str,
        value: &'a str,
    ) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.client
                .create_tags()
                .resources(id)
                .tags(Tag::builder().key(key).value(value).build())
                .send()
                .await
                .map_err(|e| sdk_error("create_tags", id, e))?;
            Ok(())
        })
    }

    fn request_spot_instances<'a>(
        &'a self,
        spec: &'a InstanceSpec,
        bid: SpotBid<'a>,
    ) -> ProviderFuture<'a, Vec<SpotRequest>> {
        Box::pin(async move {
            let launch = RequestSpotLaunchSpecification::builder()
                .image_id(&spec.image_id)
                .instance_type(InstanceType::from(spec.instance_type.as_str()))
                .key_name(&spec.key_pair)
                .set_security_group_ids(Some(spec.group_ids.clone()))
                .placement(SpotPlacement::builder().availability_zone(bid.zone).build())
                .set_block_device_mappings(Some(spec.block_devices.iter().map(to_mapping).collect()))
                .set_user_data(encoded_user_data(spec))
                .build();
            let out = self
                .client
                .request_spot_instances()
                .spot_price(bid.max_price.to_string())
                .instance_count(count_i32(bid.count))
                .launch_group(bid.launch_group)
                .launch_specification(launch)
                .send()
                .await
                .map_err(|e| sdk_error("request_spot_instances", bid.zone, e))?;
            Ok(out
                .spot_instance_requests()
                .iter()
                .map(from_spot_request)
                .collect())
        })
    }

    fn describe_spot_requests<'a>(
        &'a self,
        ids: &'a [String],
    ) -> ProviderFuture<'a, Vec<SpotRequest>> {
        Box::pin(async move {
            let mut req = self.client.describe_spot_instance_requests();
            if !ids.is_empty() {
                req = req.set_spot_instance_request_ids(Some(ids.to_vec()));
            }
            let out = req
                .send()
                .await
                .map_err(|e| sdk_error("describe_spot_instance_requests", "requests", e))?;
            Ok(out
                .spot_instance_requests()
                .iter()
                .map(from_spot_request)
                .collect())
        })
    }

    fn cancel_spot_requests<'a>(&'a self, ids: &'a [String]) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            if ids.is_empty() {
                return Ok(());
            }
            self.client
                .cancel_spot_instance_requests()
                .set_spot_instance_request_ids(Some(ids.to_vec()))
                .send()
                .await
                .map_err(|e| sdk_error("cancel_spot_instance_requests", "requests", e))?;
            Ok(())
        })
    }

    fn list_zones(&self) -> ProviderFuture<'_, Vec<String>> {
        Box::pin(async move {
            let out = self
                .client
                .describe_availability_zones()
                .filters(Filter::builder().name("state").values("available").build())
                .send()
                .await
                .map_err(|e| sdk_error("describe_availability_zones", &self.region, e))?;
            Ok(out
                .availability_zones()
                .iter()
                .filter_map(|z| z.zone_name())
                .map(str::to_string)
                .collect())
        })
    }

    fn describe_image<'a>(&'a self, image_id: &'a str) -> ProviderFuture<'a, Image> {
        Box::pin(async move {
            let out = self
                .client
                .describe_images()
                .image_ids(image_id)
                .send()
                .await
                .map_err(|e| sdk_error("describe_images", image_id, e))?;
            let image = out.images().first().ok_or_else(|| ProviderError::NotFound {
                operation: "describe_images".into(),
                resource: image_id.to_string(),
            })?;
            Ok(Image {
                id: image_id.to_string(),
                virtualization: image
                    .virtualization_type()
                    .and_then(|v| Virtualization::parse(v.as_str())),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cidr_rule_round_trips_through_permission() {
        let rule = IngressRule::tcp(PortRange::new(8080, 8081), "10.0.0.0/8");
        let perm = to_permission(&rule);
        assert_eq!(perm.ip_protocol(), Some("tcp"));
        assert_eq!(perm.from_port(), Some(8080));
        assert_eq!(from_permission(&perm), vec![rule]);
    }

    #[test]
    fn group_rule_has_no_ports() {
        let group = SecurityGroup {
            id: "sg-1".into(),
            name: "demo-workers".into(),
            rules: vec![],
        };
        let perm = to_permission(&IngressRule::all_from_group(&group));
        assert_eq!(perm.ip_protocol(), Some("-1"));
        assert_eq!(perm.from_port(), None);
        let rules = from_permission(&perm);
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].referenced_group(), Some("sg-1"));
    }

    #[test]
    fn ephemeral_mapping_uses_virtual_name() {
        let mapping = to_mapping(&BlockDevice {
            device_name: "/dev/sdb".into(),
            source: BlockDeviceSource::Ephemeral {
                virtual_name: "ephemeral0".into(),
            },
        });
        assert_eq!(mapping.device_name(), Some("/dev/sdb"));
        assert_eq!(mapping.virtual_name(), Some("ephemeral0"));
        assert!(mapping.ebs().is_none());
    }
}
