//! On-device fabric (XBAR) ceilings.
//!
//! A device's internal crossbar is shared by all its links. Its ceiling
//! depends on how the device is being exercised across every active route,
//! so the access pattern is aggregated first and the topology is queried
//! once per endpoint.

use super::Flow;
use crate::topology::{DeviceId, FabricAccess, Route, Topology, TransferOp};
use std::collections::HashMap;

/// Aggregates how each device is accessed across all flows.
pub fn access_map(flows: &[Flow<'_>]) -> HashMap<DeviceId, FabricAccess> {
    let mut map: HashMap<DeviceId, FabricAccess> = HashMap::new();
    for flow in flows {
        let src = flow.route.data_source(flow.direction);
        let dst = flow.route.data_dest(flow.direction);
        let (initiator, initiator_access, target, target_access) = match flow.op {
            TransferOp::Write => (src, FabricAccess::WRITES, dst, FabricAccess::WRITTEN_TO),
            TransferOp::Read => (dst, FabricAccess::READS, src, FabricAccess::READ_FROM),
        };
        if let Some(dev) = initiator {
            *map.entry(dev).or_default() |= initiator_access;
        }
        if let Some(dev) = target {
            *map.entry(dev).or_default() |= target_access;
        }
    }
    map
}

/// Fabric ceiling for a route in bytes per second: the lower of its
/// endpoints' per-link ceilings times the links the route uses there.
/// `None` when no endpoint is fabric-limited.
pub fn route_ceiling(
    topology: &dyn Topology,
    route: &Route,
    access: &HashMap<DeviceId, FabricAccess>,
) -> Option<f64> {
    let mut endpoints = vec![(route.local, route.links.len())];
    if let Some(remote) = route.remote {
        if remote != route.local {
            let links = if route.remote_links.is_empty() {
                route.links.len()
            } else {
                route.remote_links.len()
            };
            endpoints.push((remote, links));
        }
    }

    endpoints
        .into_iter()
        .filter_map(|(dev, links)| {
            let pattern = access.get(&dev).copied().unwrap_or_default();
            if pattern.is_empty() {
                return None;
            }
            topology
                .fabric_bandwidth(dev, pattern)
                .map(|per_link| per_link * links as f64)
        })
        .reduce(f64::min)
}
