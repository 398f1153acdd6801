//! Simulated copy engine.
//!
//! A copy "runs" at a configured rate: it reports done once the wall-clock
//! time it would have taken has passed, and its counters carry the simulated
//! duration so measured bandwidth is exact (plus optional seeded jitter).

use crate::topology::SimTopology;
use linkstress_core::topology::{
    CopyCounters, CopyEngine, CopyRequest, DeviceId, Direction, LinkId, PreparedCopy, Route,
    RouteId,
};
use quanta::Instant;
use rand::RngExt as _;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::trace;

type Key = (RouteId, Direction);

/// Call counters, shared with every copy the engine hands out.
#[derive(Debug, Default)]
pub struct EngineCounters {
    pub setups: AtomicU64,
    pub triggers: AtomicU64,
    pub completions: AtomicU64,
    pub stops: AtomicU64,
    pub verifies: AtomicU64,
}

pub struct SimCopyEngine {
    default_rate: f64,
    rates: HashMap<Key, f64>,
    hung: HashSet<Key>,
    corrupt: HashSet<Key>,
    jitter: f64,
    rng: Mutex<StdRng>,
    idle_sink: Option<Arc<SimTopology>>,
    counters: Arc<EngineCounters>,
}

impl SimCopyEngine {
    /// Every copy runs at `bytes_per_sec` unless overridden.
    pub fn new(bytes_per_sec: f64) -> Self {
        Self {
            default_rate: bytes_per_sec,
            rates: HashMap::new(),
            hung: HashSet::new(),
            corrupt: HashSet::new(),
            jitter: 0.0,
            rng: Mutex::new(StdRng::seed_from_u64(0)),
            idle_sink: None,
            counters: Arc::new(EngineCounters::default()),
        }
    }

    pub fn with_rate(mut self, route: RouteId, direction: Direction, bytes_per_sec: f64) -> Self {
        self.rates.insert((route, direction), bytes_per_sec);
        self
    }

    /// Copies on this route/direction never finish on their own.
    pub fn with_hang(mut self, route: RouteId, direction: Direction) -> Self {
        self.hung.insert((route, direction));
        self
    }

    /// Verification fails for this route/direction.
    pub fn with_corruption(mut self, route: RouteId, direction: Direction) -> Self {
        self.corrupt.insert((route, direction));
        self
    }

    /// Scales each copy's rate by a seeded factor in `[1 - j, 1 + j]`.
    pub fn with_jitter(mut self, fraction: f64, seed: u64) -> Self {
        self.jitter = fraction.clamp(0.0, 1.0);
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    /// Finished copies with idle gaps add LP entries on the route's links.
    pub fn with_idle_sink(mut self, topology: Arc<SimTopology>) -> Self {
        self.idle_sink = Some(topology);
        self
    }

    pub fn counters(&self) -> Arc<EngineCounters> {
        self.counters.clone()
    }

    fn rate_for(&self, key: Key) -> f64 {
        let base = self.rates.get(&key).copied().unwrap_or(self.default_rate);
        if self.jitter == 0.0 {
            return base;
        }
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        let factor = 1.0 + self.jitter * (rng.random::<f64>() * 2.0 - 1.0);
        base * factor
    }
}

impl CopyEngine for SimCopyEngine {
    fn setup(&self, route: &Route, request: &CopyRequest) -> anyhow::Result<Box<dyn PreparedCopy>> {
        anyhow::ensure!(request.bytes > 0, "zero-byte copy on route {}", route.id);
        let key = (request.route, request.direction);
        let rate = self.rate_for(key);
        anyhow::ensure!(rate > 0.0, "route {} has no bandwidth", route.id);
        self.counters.setups.fetch_add(1, Ordering::Relaxed);
        let idle = match &self.idle_sink {
            Some(topo) if request.idle_gaps > 0 => Some((topo.clone(), route.device_links())),
            _ => None,
        };
        Ok(Box::new(SimCopy {
            bytes: request.bytes,
            sim_ns: (request.bytes as f64 * 1e9 / rate).round() as u64,
            hung: self.hung.contains(&key),
            corrupt: self.corrupt.contains(&key),
            idle_gaps: request.idle_gaps,
            idle,
            started: None,
            finished: false,
            counters: self.counters.clone(),
        }))
    }
}

type IdleTarget = (Arc<SimTopology>, Vec<(DeviceId, LinkId)>);

struct SimCopy {
    bytes: u64,
    sim_ns: u64,
    hung: bool,
    corrupt: bool,
    idle_gaps: u32,
    idle: Option<IdleTarget>,
    started: Option<Instant>,
    finished: bool,
    counters: Arc<EngineCounters>,
}

impl SimCopy {
    fn finish(&mut self) -> CopyCounters {
        self.finished = true;
        self.counters.completions.fetch_add(1, Ordering::Relaxed);
        if let Some((topo, links)) = &self.idle {
            for &(device, link) in links {
                if let Some(hal) = topo.hal(device) {
                    hal.inject_lp_entries(link, self.idle_gaps as u64);
                }
            }
        }
        CopyCounters {
            bytes: self.bytes,
            elapsed_ns: self.sim_ns,
        }
    }
}

impl PreparedCopy for SimCopy {
    fn trigger(&mut self) -> anyhow::Result<()> {
        anyhow::ensure!(self.started.is_none(), "copy triggered twice");
        self.started = Some(Instant::now());
        self.counters.triggers.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn poll(&mut self) -> anyhow::Result<Option<CopyCounters>> {
        let Some(started) = self.started else {
            anyhow::bail!("copy polled before trigger");
        };
        anyhow::ensure!(!self.finished, "copy polled after completion");
        if self.hung || (started.elapsed().as_nanos() as u64) < self.sim_ns {
            return Ok(None);
        }
        trace!("sim copy of {} bytes complete", self.bytes);
        Ok(Some(self.finish()))
    }

    fn stop(&mut self) -> anyhow::Result<CopyCounters> {
        self.counters.stops.fetch_add(1, Ordering::Relaxed);
        let elapsed_ns = self
            .started
            .map_or(0, |s| s.elapsed().as_nanos() as u64)
            .min(self.sim_ns);
        let bytes = if self.hung || self.sim_ns == 0 {
            0
        } else {
            (self.bytes as u128 * elapsed_ns as u128 / self.sim_ns as u128) as u64
        };
        self.finished = true;
        Ok(CopyCounters { bytes, elapsed_ns })
    }

    fn verify(&mut self) -> anyhow::Result<()> {
        self.counters.verifies.fetch_add(1, Ordering::Relaxed);
        anyhow::ensure!(!self.corrupt, "destination does not match source");
        Ok(())
    }
}
