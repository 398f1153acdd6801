use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u32);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// A device on the interconnect (GPU, switch, or the host bridge).
    DeviceId
);
id_type!(
    /// A physical link, numbered per device.
    LinkId
);
id_type!(
    /// A logical route under test.
    RouteId
);
id_type!(
    /// A physical connection between two device ports, possibly shared by routes.
    ConnectionId
);

/// Transfer-type classification of a route. Bitmask; a mode under test
/// aggregates the types of all its routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TransferType(u8);

impl TransferType {
    pub const NONE: TransferType = TransferType(0);
    pub const P2P: TransferType = TransferType(1 << 0);
    pub const SYSMEM: TransferType = TransferType(1 << 1);
    pub const LOOPBACK: TransferType = TransferType(1 << 2);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: TransferType) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for TransferType {
    type Output = TransferType;

    fn bitor(self, rhs: TransferType) -> TransferType {
        TransferType(self.0 | rhs.0)
    }
}

impl BitOrAssign for TransferType {
    fn bitor_assign(&mut self, rhs: TransferType) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for TransferType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        let mut names = Vec::new();
        if self.contains(TransferType::P2P) {
            names.push("p2p");
        }
        if self.contains(TransferType::SYSMEM) {
            names.push("sysmem");
        }
        if self.contains(TransferType::LOOPBACK) {
            names.push("loopback");
        }
        write!(f, "{}", names.join("|"))
    }
}

/// Traffic direction relative to the device under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Data enters the device under test.
    In,
    /// Data leaves the device under test.
    Out,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::In, Direction::Out];

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which hardware moves the data for a direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferHw {
    #[default]
    CopyEngine,
    /// Shader/compute units issuing loads and stores.
    Sm,
    Cpu,
}

/// Protocol operation the initiating engine issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferOp {
    Read,
    Write,
}

impl TransferOp {
    /// A local engine pushes outbound data and pulls inbound data; a remote
    /// engine does the opposite.
    pub fn for_direction(direction: Direction, hw_local: bool) -> TransferOp {
        match (direction, hw_local) {
            (Direction::Out, true) | (Direction::In, false) => TransferOp::Write,
            (Direction::In, true) | (Direction::Out, false) => TransferOp::Read,
        }
    }
}

/// Whether one or both directions of a route carry traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pattern {
    Unidir,
    Bidir,
}

/// Highest fraction of raw bandwidth observable per transfer pattern.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObservableFraction {
    pub unidir_read: f64,
    pub unidir_write: f64,
    pub bidir_read: f64,
    pub bidir_write: f64,
}

impl Default for ObservableFraction {
    fn default() -> Self {
        Self {
            unidir_read: 1.0,
            unidir_write: 1.0,
            bidir_read: 1.0,
            bidir_write: 1.0,
        }
    }
}

impl ObservableFraction {
    pub fn get(&self, op: TransferOp, pattern: Pattern) -> f64 {
        match (pattern, op) {
            (Pattern::Unidir, TransferOp::Read) => self.unidir_read,
            (Pattern::Unidir, TransferOp::Write) => self.unidir_write,
            (Pattern::Bidir, TransferOp::Read) => self.bidir_read,
            (Pattern::Bidir, TransferOp::Write) => self.bidir_write,
        }
    }
}

/// How a device's on-chip fabric is exercised across all active routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FabricAccess(u8);

impl FabricAccess {
    pub const NONE: FabricAccess = FabricAccess(0);
    /// The device issues reads.
    pub const READS: FabricAccess = FabricAccess(1 << 0);
    /// The device issues writes.
    pub const WRITES: FabricAccess = FabricAccess(1 << 1);
    /// A peer reads from this device.
    pub const READ_FROM: FabricAccess = FabricAccess(1 << 2);
    /// A peer writes to this device.
    pub const WRITTEN_TO: FabricAccess = FabricAccess(1 << 3);

    pub fn contains(self, other: FabricAccess) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for FabricAccess {
    type Output = FabricAccess;

    fn bitor(self, rhs: FabricAccess) -> FabricAccess {
        FabricAccess(self.0 | rhs.0)
    }
}

impl BitOrAssign for FabricAccess {
    fn bitor_assign(&mut self, rhs: FabricAccess) {
        self.0 |= rhs.0;
    }
}

/// A physical connection between a port on `from` and a port on `to`.
///
/// Flits travelling `from → to` are the forward side of the connection,
/// `to → from` the reverse side. Loopback connections have `from == to`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub id: ConnectionId,
    pub from: DeviceId,
    pub to: DeviceId,
    /// Response-only flits are batched into one when both ends support it.
    pub collapsed_responses: bool,
}

/// A logical test path between the device under test and a peer, system
/// memory, or itself.
///
/// Immutable for the lifetime of a test mode; owned by the topology and
/// shared with the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub id: RouteId,
    pub local: DeviceId,
    /// Peer device, `None` for system memory.
    pub remote: Option<DeviceId>,
    pub transfer_type: TransferType,
    /// Links on the local device.
    pub links: Vec<LinkId>,
    /// Links on the remote device, empty for system memory and loopback.
    pub remote_links: Vec<LinkId>,
    pub connections: Vec<ConnectionId>,
    /// Raw per-link bandwidth in bytes per second.
    pub link_bandwidth: f64,
    pub sublink_width: u32,
    pub observable: ObservableFraction,
}

impl Route {
    pub fn is_loopback(&self) -> bool {
        self.transfer_type.contains(TransferType::LOOPBACK)
    }

    pub fn is_sysmem(&self) -> bool {
        self.remote.is_none()
    }

    /// Raw bandwidth of all links in bytes per second.
    pub fn raw_bandwidth(&self) -> f64 {
        self.link_bandwidth * self.links.len() as f64
    }

    /// Device the data leaves from in `direction`; `None` is system memory.
    pub fn data_source(&self, direction: Direction) -> Option<DeviceId> {
        match direction {
            Direction::Out => Some(self.local),
            Direction::In => self.remote_or_self(),
        }
    }

    /// Device the data arrives at in `direction`; `None` is system memory.
    pub fn data_dest(&self, direction: Direction) -> Option<DeviceId> {
        match direction {
            Direction::Out => self.remote_or_self(),
            Direction::In => Some(self.local),
        }
    }

    fn remote_or_self(&self) -> Option<DeviceId> {
        if self.is_loopback() {
            Some(self.local)
        } else {
            self.remote
        }
    }

    /// Every (device, link) pair this route occupies.
    pub fn device_links(&self) -> Vec<(DeviceId, LinkId)> {
        let mut out: Vec<(DeviceId, LinkId)> =
            self.links.iter().map(|&l| (self.local, l)).collect();
        if let Some(remote) = self.remote
            && remote != self.local
        {
            out.extend(self.remote_links.iter().map(|&l| (remote, l)));
        }
        out
    }
}
