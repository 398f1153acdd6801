//! Builder-style simulated topology.

use crate::power::SimPowerHal;
use linkstress_core::topology::{
    Capability, Connection, ConnectionId, DeviceId, Direction, FabricAccess, LinkId, LinkState,
    LpCounterControl, ObservableFraction, PowerStateControl, Route, RouteId, ThermalControl,
    Topology, TransferHw, TransferType,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Device {
    hal: Option<Arc<SimPowerHal>>,
    fabric_bps: Option<f64>,
    half_granularity_war: bool,
}

/// In-memory topology. Links default to `Active`.
#[derive(Default)]
pub struct SimTopology {
    devices: HashMap<DeviceId, Device>,
    connections: HashMap<ConnectionId, Connection>,
    link_states: Mutex<HashMap<(DeviceId, LinkId), LinkState>>,
    remote_engines: HashSet<(RouteId, Direction)>,
    next_connection: u32,
}

impl SimTopology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a device. `hal` provides power, counter, and thermal registers.
    pub fn with_device(mut self, device: DeviceId, hal: Option<Arc<SimPowerHal>>) -> Self {
        self.devices.entry(device).or_default().hal = hal;
        self
    }

    /// Per-link fabric ceiling for `device`, independent of access pattern.
    pub fn with_fabric(mut self, device: DeviceId, bytes_per_sec: f64) -> Self {
        self.devices.entry(device).or_default().fabric_bps = Some(bytes_per_sec);
        self
    }

    pub fn with_half_granularity_war(mut self, device: DeviceId) -> Self {
        self.devices.entry(device).or_default().half_granularity_war = true;
        self
    }

    pub fn with_connection(mut self, from: DeviceId, to: DeviceId, collapsed: bool) -> Self {
        let id = ConnectionId(self.next_connection);
        self.next_connection += 1;
        self.connections.insert(
            id,
            Connection {
                id,
                from,
                to,
                collapsed_responses: collapsed,
            },
        );
        self
    }

    /// Marks the engine driving `route`/`direction` as living on the peer.
    pub fn with_remote_engine(mut self, route: RouteId, direction: Direction) -> Self {
        self.remote_engines.insert((route, direction));
        self
    }

    pub fn set_link_state(&self, device: DeviceId, link: LinkId, state: LinkState) {
        self.link_states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((device, link), state);
    }

    pub fn hal(&self, device: DeviceId) -> Option<Arc<SimPowerHal>> {
        self.devices.get(&device).and_then(|d| d.hal.clone())
    }
}

impl Topology for SimTopology {
    fn link_status(&self, device: DeviceId, link: LinkId) -> anyhow::Result<LinkState> {
        anyhow::ensure!(self.devices.contains_key(&device), "unknown device {}", device);
        Ok(self
            .link_states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(device, link))
            .copied()
            .unwrap_or(LinkState::Active))
    }

    fn transfer_hw(&self, route: &Route, _direction: Direction) -> TransferHw {
        if route.is_sysmem() {
            TransferHw::CopyEngine
        } else {
            TransferHw::Sm
        }
    }

    fn is_hw_local(&self, route: &Route, direction: Direction) -> bool {
        !self.remote_engines.contains(&(route.id, direction))
    }

    fn connection(&self, id: ConnectionId) -> Option<Connection> {
        self.connections.get(&id).cloned()
    }

    fn fabric_bandwidth(&self, device: DeviceId, _access: FabricAccess) -> Option<f64> {
        self.devices.get(&device).and_then(|d| d.fabric_bps)
    }

    fn needs_half_granularity_war(&self, device: DeviceId) -> bool {
        self.devices
            .get(&device)
            .is_some_and(|d| d.half_granularity_war)
    }

    fn supports(&self, device: DeviceId, _capability: Capability) -> bool {
        self.hal(device).is_some()
    }

    fn power_control(&self, device: DeviceId) -> Option<Arc<dyn PowerStateControl>> {
        self.hal(device).map(|h| h as Arc<dyn PowerStateControl>)
    }

    fn lp_counters(&self, device: DeviceId) -> Option<Arc<dyn LpCounterControl>> {
        self.hal(device).map(|h| h as Arc<dyn LpCounterControl>)
    }

    fn thermal_control(&self, device: DeviceId) -> Option<Arc<dyn ThermalControl>> {
        self.hal(device).map(|h| h as Arc<dyn ThermalControl>)
    }
}

/// Route builder with single-link defaults.
#[derive(Debug, Clone)]
pub struct RouteSpec {
    route: Route,
}

impl RouteSpec {
    /// Device talking to itself.
    pub fn loopback(id: u32, device: DeviceId) -> Self {
        Self::base(id, device, Some(device), TransferType::LOOPBACK)
    }

    pub fn p2p(id: u32, local: DeviceId, remote: DeviceId) -> Self {
        let mut spec = Self::base(id, local, Some(remote), TransferType::P2P);
        spec.route.remote_links = vec![LinkId(0)];
        spec
    }

    pub fn sysmem(id: u32, local: DeviceId) -> Self {
        Self::base(id, local, None, TransferType::SYSMEM)
    }

    fn base(id: u32, local: DeviceId, remote: Option<DeviceId>, tt: TransferType) -> Self {
        Self {
            route: Route {
                id: RouteId(id),
                local,
                remote,
                transfer_type: tt,
                links: vec![LinkId(0)],
                remote_links: Vec::new(),
                connections: Vec::new(),
                link_bandwidth: 50.0e9,
                sublink_width: 8,
                observable: ObservableFraction::default(),
            },
        }
    }

    pub fn links(mut self, links: &[u32]) -> Self {
        self.route.links = links.iter().copied().map(LinkId).collect();
        self
    }

    pub fn remote_links(mut self, links: &[u32]) -> Self {
        self.route.remote_links = links.iter().copied().map(LinkId).collect();
        self
    }

    pub fn connections(mut self, ids: &[u32]) -> Self {
        self.route.connections = ids.iter().copied().map(ConnectionId).collect();
        self
    }

    /// Raw per-link bandwidth in bytes per second.
    pub fn link_bandwidth(mut self, bytes_per_sec: f64) -> Self {
        self.route.link_bandwidth = bytes_per_sec;
        self
    }

    pub fn build(self) -> Arc<Route> {
        Arc::new(self.route)
    }
}
