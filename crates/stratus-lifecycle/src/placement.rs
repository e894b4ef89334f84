//! Worker placement across availability zones.
//!
//! Workers are spread as evenly as possible: every zone gets the same
//! base count and the first `total % zones` zones get one more.

use rand::seq::SliceRandom;

use stratus_core::{Result, ZonePlacement};
use stratus_provider::CloudProvider;

/// Zone option value selecting every zone of the region.
pub const ALL_ZONES: &str = "all";

/// Instances assigned to the zone at `zone_index` out of `num_zones`.
pub fn partition(total: u32, num_zones: u32, zone_index: u32) -> u32 {
    if num_zones == 0 {
        return 0;
    }
    let base = total / num_zones;
    if zone_index < total % num_zones {
        base + 1
    } else {
        base
    }
}

/// Full placement of `total` instances over `zones`, in zone order.
pub fn zone_placement(total: u32, zones: &[String]) -> ZonePlacement {
    let num_zones = u32::try_from(zones.len()).unwrap_or(u32::MAX);
    ZonePlacement::new(
        zones
            .iter()
            .zip(0..num_zones)
            .map(|(zone, idx)| (zone.clone(), partition(total, num_zones, idx)))
            .collect(),
    )
}

/// Zones workers are spread over, from the operator's zone option.
///
/// `all` is every zone the provider lists; an empty option picks one of
/// them at random; anything else is taken as a zone name.
pub async fn worker_zones(provider: &dyn CloudProvider, option: &str) -> Result<Vec<String>> {
    match option {
        ALL_ZONES => Ok(provider.list_zones().await?),
        "" => Ok(random_zone(provider).await?.into_iter().collect()),
        zone => Ok(vec![zone.to_string()]),
    }
}

/// Zone for the coordinator: the first worker zone, or a random one when
/// workers span every zone.
pub async fn coordinator_zone(
    provider: &dyn CloudProvider,
    option: &str,
    worker_zones: &[String],
) -> Result<Option<String>> {
    if option == ALL_ZONES {
        return random_zone(provider).await;
    }
    Ok(worker_zones.first().cloned())
}

async fn random_zone(provider: &dyn CloudProvider) -> Result<Option<String>> {
    let zones = provider.list_zones().await?;
    Ok(zones.choose(&mut rand::thread_rng()).cloned())
}
