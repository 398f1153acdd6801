//! Route and connection model plus the collaborator seam.

pub mod hal;
pub mod route;

pub use hal::{
    Capability, CopyCounters, CopyEngine, CopyRequest, FillPattern, LinkState, LpCount,
    LpCounterControl, MemoryDomain, Platform, PowerStateControl, PreparedCopy, SubLinkPowerState,
    Surface, SurfaceAllocator, ThermalControl, Topology,
};
pub use route::{
    Connection, ConnectionId, DeviceId, Direction, FabricAccess, LinkId, ObservableFraction,
    Pattern, Route, RouteId, TransferHw, TransferOp, TransferType,
};
