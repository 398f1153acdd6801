//! In-memory interconnect collaborators for exercising `linkstress-core`
//! without hardware.
//!
//! Provides a builder-style topology, a rate-driven copy engine, a surface
//! pool that tracks outstanding buffers, and per-device power/counter/thermal
//! registers with fault injection.

pub mod copy;
pub mod power;
pub mod surface;
pub mod topology;

pub mod test_util;

pub use copy::{EngineCounters, SimCopyEngine};
pub use power::SimPowerHal;
pub use surface::{SimSurface, SimSurfacePool};
pub use topology::{RouteSpec, SimTopology};

use linkstress_core::topology::Platform;
use std::sync::Arc;

/// A platform built from simulated parts, with handles kept for inspection.
pub struct SimPlatform {
    pub topology: Arc<SimTopology>,
    pub engine: Arc<SimCopyEngine>,
    pub surfaces: Arc<SimSurfacePool>,
}

impl SimPlatform {
    /// Wires `engine` to report idle-gap entries into `topology`.
    pub fn new(topology: SimTopology, engine: SimCopyEngine) -> Self {
        let topology = Arc::new(topology);
        let engine = Arc::new(engine.with_idle_sink(topology.clone()));
        Self {
            topology,
            engine,
            surfaces: Arc::new(SimSurfacePool::new()),
        }
    }

    pub fn with_surfaces(mut self, pool: SimSurfacePool) -> Self {
        self.surfaces = Arc::new(pool);
        self
    }

    pub fn platform(&self) -> Platform {
        Platform::new(
            self.topology.clone(),
            self.engine.clone(),
            self.surfaces.clone(),
        )
    }
}
