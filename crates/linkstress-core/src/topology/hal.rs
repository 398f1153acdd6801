//! Collaborator interfaces consumed by the engine.
//!
//! Topology discovery, copy execution, buffer management, and register access
//! live outside this crate. The engine only sees these traits; the
//! `linkstress-sim` crate provides in-memory implementations.

use super::route::{Connection, ConnectionId, DeviceId, Direction, FabricAccess, LinkId, Route};
use super::route::{RouteId, TransferHw};
use anyhow::{Result, anyhow};
use rand::rngs::StdRng;
use rand::{RngExt as _, SeedableRng};
use std::sync::Arc;

/// Training state of a physical link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    #[default]
    Untrained,
    Active,
    Sleep,
    Off,
    Fault,
}

impl LinkState {
    /// Only trained links (active or sleeping) can report power transitions.
    pub fn reports_transitions(&self) -> bool {
        matches!(self, LinkState::Active | LinkState::Sleep)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Untrained => "untrained",
            LinkState::Active => "active",
            LinkState::Sleep => "sleep",
            LinkState::Off => "off",
            LinkState::Fault => "fault",
        }
    }
}

/// Sub-link operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubLinkPowerState {
    #[default]
    FullBandwidth,
    LowPower,
}

/// Optional per-device interfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    PowerState,
    LpCounters,
    Thermal,
}

/// Low-power entry or exit count read from hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LpCount {
    pub count: u64,
    pub overflowed: bool,
}

pub trait PowerStateControl: Send + Sync {
    fn request_power_state(
        &self,
        link: LinkId,
        state: SubLinkPowerState,
        wait_for_completion: bool,
    ) -> Result<()>;
    fn power_state_status(&self, link: LinkId) -> Result<SubLinkPowerState>;
    /// Whether the hardware can toggle power states autonomously.
    fn supports_lp_hw_toggle(&self) -> bool;
    /// Starts the hardware toggle generator. Stopped by the next
    /// [`request_power_state`](Self::request_power_state).
    fn start_power_state_toggle(&self, link: LinkId, on_us: u32, off_us: u32) -> Result<()>;
}

pub trait LpCounterControl: Send + Sync {
    fn clear_lp_counts(&self, link: LinkId) -> Result<()>;
    fn lp_entry_or_exit_count(&self, link: LinkId, is_entry: bool) -> Result<LpCount>;
}

pub trait ThermalControl: Send + Sync {
    fn start_thermal_throttling(&self, on_count: u32, off_count: u32) -> Result<()>;
    fn stop_thermal_throttling(&self) -> Result<()>;
    fn start_thermal_slowdown(&self, period_us: u32) -> Result<()>;
    fn stop_thermal_slowdown(&self) -> Result<()>;
}

/// Device topology and capability lookup.
pub trait Topology: Send + Sync {
    fn link_status(&self, device: DeviceId, link: LinkId) -> Result<LinkState>;
    fn transfer_hw(&self, route: &Route, direction: Direction) -> TransferHw;
    fn is_hw_local(&self, route: &Route, direction: Direction) -> bool;
    fn connection(&self, id: ConnectionId) -> Option<Connection>;
    /// Per-link fabric bandwidth ceiling in bytes per second for the given
    /// aggregate access pattern. `None` means the fabric never limits.
    fn fabric_bandwidth(&self, device: DeviceId, access: FabricAccess) -> Option<f64>;
    /// Device revisions whose flit granularity is halved by a hardware erratum.
    fn needs_half_granularity_war(&self, _device: DeviceId) -> bool {
        false
    }
    fn supports(&self, device: DeviceId, capability: Capability) -> bool;
    fn power_control(&self, device: DeviceId) -> Option<Arc<dyn PowerStateControl>>;
    fn lp_counters(&self, device: DeviceId) -> Option<Arc<dyn LpCounterControl>>;
    fn thermal_control(&self, device: DeviceId) -> Option<Arc<dyn ThermalControl>>;
}

/// One copy operation requested of the copy engine.
#[derive(Debug, Clone, PartialEq)]
pub struct CopyRequest {
    pub route: RouteId,
    pub direction: Direction,
    pub hw: TransferHw,
    pub bytes: u64,
    /// Idle gaps the engine inserts so links can drop into low power.
    pub idle_gaps: u32,
}

/// Byte and time totals reported by a copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CopyCounters {
    pub bytes: u64,
    pub elapsed_ns: u64,
}

/// A copy that has been queued but not yet started.
pub trait PreparedCopy: Send {
    fn trigger(&mut self) -> Result<()>;
    /// Returns the final counters once the copy has finished.
    fn poll(&mut self) -> Result<Option<CopyCounters>>;
    /// Aborts a running copy. Returns whatever was transferred.
    fn stop(&mut self) -> Result<CopyCounters>;
    /// Checks destination contents. Data integrity is the engine's concern.
    fn verify(&mut self) -> Result<()> {
        Ok(())
    }
}

pub trait CopyEngine: Send + Sync {
    fn setup(&self, route: &Route, request: &CopyRequest) -> Result<Box<dyn PreparedCopy>>;
}

/// Where a surface lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryDomain {
    SystemMemory,
    DeviceLocal(DeviceId),
}

/// Pattern written into a surface before a mode runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillPattern {
    Random { seed: u64 },
    Fixed(u32),
}

/// A buffer owned by the surface pool.
pub trait Surface: Send {
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn map(&mut self) -> Result<()>;
    fn unmap(&mut self) -> Result<()>;
    fn is_mapped(&self) -> bool;
    fn bytes(&self) -> Result<&[u8]>;
    fn bytes_mut(&mut self) -> Result<&mut [u8]>;

    fn fill(&mut self, pattern: FillPattern) -> Result<()> {
        let buf = self.bytes_mut()?;
        match pattern {
            FillPattern::Random { seed } => {
                let mut rng = StdRng::seed_from_u64(seed);
                for b in buf.iter_mut() {
                    *b = rng.random::<u8>();
                }
            }
            FillPattern::Fixed(word) => {
                let bytes = word.to_le_bytes();
                for (i, b) in buf.iter_mut().enumerate() {
                    *b = bytes[i % 4];
                }
            }
        }
        Ok(())
    }
}

pub trait SurfaceAllocator: Send + Sync {
    fn acquire(&self, domain: MemoryDomain, bytes: usize) -> Result<Box<dyn Surface>>;
    fn release(&self, surface: Box<dyn Surface>) -> Result<()>;
}

/// Collaborators a test mode needs, bundled.
#[derive(Clone)]
pub struct Platform {
    pub topology: Arc<dyn Topology>,
    pub copy_engine: Arc<dyn CopyEngine>,
    pub surfaces: Arc<dyn SurfaceAllocator>,
}

impl Platform {
    pub fn new(
        topology: Arc<dyn Topology>,
        copy_engine: Arc<dyn CopyEngine>,
        surfaces: Arc<dyn SurfaceAllocator>,
    ) -> Self {
        Self {
            topology,
            copy_engine,
            surfaces,
        }
    }

    /// Looks up `id`, failing if the topology does not know it.
    pub fn connection(&self, id: ConnectionId) -> Result<Connection> {
        self.topology
            .connection(id)
            .ok_or_else(|| anyhow!("unknown connection {}", id))
    }
}
