//! # Direction Data
//!
//! One traffic direction on one route. Holds the hardware-path
//! classification, the byte/time totals the bandwidth check reads, and the
//! optional CPU traffic threads with the surfaces they own.
//!
//! Totals only move while no traffic thread is running: each thread counts
//! locally and its counters are merged after it has been joined. Surfaces are
//! shared with a thread through `Arc<Mutex<_>>`, and are only returned to the
//! pool once the thread is gone and the `Arc` is unique again.

use crate::config::TrafficConfig;
use crate::error::{Result, StickyError, StressError};
use crate::topology::{
    CopyCounters, DeviceId, Direction, FillPattern, MemoryDomain, Platform, RouteId, Surface,
    TransferHw, TransferOp, TransferType,
};
use quanta::Instant;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{debug, warn};

/// Pattern written to destination surfaces before each mode activation.
pub const DEST_FILL_WORD: u32 = 0xC0DE_F00D;

/// Source and destination surface owned by one traffic thread.
pub struct SurfacePair {
    source: Box<dyn Surface>,
    dest: Box<dyn Surface>,
}

impl SurfacePair {
    /// One pass over the pair: read the source, write the destination.
    fn transfer(&mut self) -> anyhow::Result<u64> {
        let src = self.source.bytes()?;
        let dst = self.dest.bytes_mut()?;
        let n = src.len().min(dst.len());
        dst[..n].copy_from_slice(&src[..n]);
        Ok(n as u64)
    }
}

struct TrafficThread {
    pair: Arc<Mutex<SurfacePair>>,
    handle: Option<thread::JoinHandle<Result<CopyCounters>>>,
}

pub struct DirectionData {
    route: RouteId,
    direction: Direction,
    in_use: bool,
    pub hw: TransferHw,
    pub hw_local: bool,
    pub op: TransferOp,
    total_bytes: u64,
    total_time_ns: u64,
    copies: u64,
    efficiency: f64,
    max_bandwidth: f64,
    cpu_bytes: u64,
    cpu_time_ns: u64,
    running: Arc<AtomicBool>,
    threads: Vec<TrafficThread>,
}

impl DirectionData {
    pub fn new(route: RouteId, direction: Direction) -> Self {
        Self {
            route,
            direction,
            in_use: false,
            hw: TransferHw::default(),
            hw_local: true,
            op: TransferOp::for_direction(direction, true),
            total_bytes: 0,
            total_time_ns: 0,
            copies: 0,
            efficiency: 0.0,
            max_bandwidth: 0.0,
            cpu_bytes: 0,
            cpu_time_ns: 0,
            running: Arc::new(AtomicBool::new(false)),
            threads: Vec::new(),
        }
    }

    pub fn route(&self) -> RouteId {
        self.route
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn in_use(&self) -> bool {
        self.in_use
    }

    pub fn set_in_use(&mut self, in_use: bool) {
        self.in_use = in_use;
    }

    /// Records which engine drives this direction and whether it is local.
    pub fn set_hw(&mut self, hw: TransferHw, hw_local: bool) {
        self.hw = hw;
        self.hw_local = hw_local;
        self.op = TransferOp::for_direction(self.direction, hw_local);
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn total_time_ns(&self) -> u64 {
        self.total_time_ns
    }

    pub fn copies(&self) -> u64 {
        self.copies
    }

    pub fn efficiency(&self) -> f64 {
        self.efficiency
    }

    pub fn max_bandwidth(&self) -> f64 {
        self.max_bandwidth
    }

    pub fn cpu_bytes(&self) -> u64 {
        self.cpu_bytes
    }

    pub fn cpu_time_ns(&self) -> u64 {
        self.cpu_time_ns
    }

    pub fn surface_pairs(&self) -> usize {
        self.threads.len()
    }

    pub fn threads_running(&self) -> bool {
        self.threads.iter().any(|t| t.handle.is_some())
    }

    /// Measured bandwidth in bytes per second, if anything was measured.
    pub fn bandwidth(&self) -> Option<f64> {
        if self.total_time_ns == 0 {
            None
        } else {
            Some(self.total_bytes as f64 * 1e9 / self.total_time_ns as f64)
        }
    }

    /// Stores the model output for this mode.
    pub fn set_model(&mut self, efficiency: f64, max_bandwidth: f64) {
        self.efficiency = efficiency;
        self.max_bandwidth = max_bandwidth;
    }

    /// Resets totals at the start of a mode.
    pub fn reset_stats(&mut self) {
        self.total_bytes = 0;
        self.total_time_ns = 0;
        self.copies = 0;
        self.cpu_bytes = 0;
        self.cpu_time_ns = 0;
    }

    /// Adds the counters of one finished engine copy.
    pub fn add_copy_stats(&mut self, counters: CopyCounters) -> Result<()> {
        if self.threads_running() {
            return Err(StressError::Setup(format!(
                "route {} {}: stats update while traffic threads run",
                self.route, self.direction
            )));
        }
        self.total_bytes += counters.bytes;
        self.total_time_ns += counters.elapsed_ns;
        self.copies += 1;
        Ok(())
    }

    /// Acquires one surface pair per CPU traffic thread and maps it.
    ///
    /// The device-local side is the device under test; the far side is system
    /// memory unless the route loops back onto the same device.
    pub fn acquire(
        &mut self,
        platform: &Platform,
        traffic: &TrafficConfig,
        transfer_type: TransferType,
        device: DeviceId,
    ) -> Result<()> {
        if !self.in_use || traffic.cpu_threads == 0 || !self.threads.is_empty() {
            return Ok(());
        }
        let near = MemoryDomain::DeviceLocal(device);
        let far = if transfer_type.contains(TransferType::LOOPBACK)
            && !transfer_type.contains(TransferType::SYSMEM)
        {
            near
        } else {
            MemoryDomain::SystemMemory
        };
        let (src_domain, dst_domain) = match self.direction {
            Direction::Out => (near, far),
            Direction::In => (far, near),
        };

        for _ in 0..traffic.cpu_threads {
            let pair = self.acquire_pair(platform, src_domain, dst_domain, traffic.surface_bytes)?;
            self.threads.push(TrafficThread {
                pair: Arc::new(Mutex::new(pair)),
                handle: None,
            });
        }
        debug!(
            "route {} {}: acquired {} surface pairs",
            self.route,
            self.direction,
            self.threads.len()
        );
        Ok(())
    }

    fn acquire_pair(
        &self,
        platform: &Platform,
        src_domain: MemoryDomain,
        dst_domain: MemoryDomain,
        bytes: usize,
    ) -> Result<SurfacePair> {
        let setup = |e: anyhow::Error| {
            StressError::Setup(format!(
                "route {} {}: surface acquisition failed: {:#}",
                self.route, self.direction, e
            ))
        };
        let source = platform.surfaces.acquire(src_domain, bytes).map_err(setup)?;
        let dest = match platform.surfaces.acquire(dst_domain, bytes) {
            Ok(d) => d,
            Err(e) => {
                discard_surface(platform, source);
                return Err(setup(e));
            }
        };
        let mut pair = SurfacePair { source, dest };
        let mapped = pair.source.map().and_then(|()| pair.dest.map());
        if let Err(e) = mapped {
            discard_surface(platform, pair.source);
            discard_surface(platform, pair.dest);
            return Err(setup(e));
        }
        Ok(pair)
    }

    /// Fills sources with a seeded random pattern and destinations with a
    /// fixed word so every activation starts from the same contents.
    pub fn setup_test_surfaces(&mut self, traffic: &TrafficConfig) -> Result<()> {
        for (idx, t) in self.threads.iter().enumerate() {
            let mut pair = t.pair.lock().unwrap_or_else(|e| e.into_inner());
            let seed = traffic.seed ^ ((self.route.0 as u64) << 32) ^ idx as u64;
            pair.source.fill(FillPattern::Random { seed })?;
            pair.dest.fill(FillPattern::Fixed(DEST_FILL_WORD))?;
        }
        Ok(())
    }

    pub fn start_copies(&mut self) -> Result<()> {
        if self.threads.is_empty() || self.threads_running() {
            return Ok(());
        }
        self.running.store(true, Ordering::Release);
        let mut spawn_err = None;
        for (idx, t) in self.threads.iter_mut().enumerate() {
            let pair = t.pair.clone();
            let running = self.running.clone();
            let name = format!("cpu-{}-{}-{}", self.route, self.direction, idx);
            match thread::Builder::new()
                .name(name.clone())
                .spawn(move || traffic_loop(&pair, &running))
            {
                Ok(h) => t.handle = Some(h),
                Err(e) => {
                    spawn_err = Some(StressError::Setup(format!(
                        "failed to spawn {}: {}",
                        name, e
                    )));
                    break;
                }
            }
        }
        match spawn_err {
            Some(e) => {
                if let Err(stop_err) = self.stop_copies() {
                    warn!(
                        "route {} {}: stopping traffic after spawn failure: {}",
                        self.route, self.direction, stop_err
                    );
                }
                Err(e)
            }
            None => Ok(()),
        }
    }

    /// Signals every traffic thread and joins it, merging its counters.
    /// Joins all threads even when one of them failed.
    pub fn stop_copies(&mut self) -> Result<()> {
        self.running.store(false, Ordering::Release);
        let mut sticky = StickyError::new();
        for t in &mut self.threads {
            let Some(handle) = t.handle.take() else {
                continue;
            };
            match handle.join() {
                Ok(Ok(c)) => {
                    self.cpu_bytes += c.bytes;
                    self.cpu_time_ns += c.elapsed_ns;
                }
                Ok(Err(e)) => sticky.record(e),
                Err(_) => sticky.record(StressError::Collaborator(anyhow::anyhow!(
                    "cpu traffic thread on route {} {} panicked",
                    self.route,
                    self.direction
                ))),
            }
        }
        sticky.into_result()
    }

    /// Unmaps and returns every surface. Sets `any_released` when something
    /// was handed back; a no-op once everything is released.
    pub fn release(&mut self, platform: &Platform, any_released: &mut bool) -> Result<()> {
        let mut sticky = StickyError::new();
        sticky.check(self.stop_copies());
        for t in self.threads.drain(..) {
            let pair = match Arc::try_unwrap(t.pair) {
                Ok(m) => m.into_inner().unwrap_or_else(|e| e.into_inner()),
                Err(_) => {
                    sticky.record(StressError::Setup(format!(
                        "route {} {}: surface still shared at release",
                        self.route, self.direction
                    )));
                    continue;
                }
            };
            for mut s in [pair.source, pair.dest] {
                if s.is_mapped()
                    && let Err(e) = s.unmap()
                {
                    sticky.record(StressError::Collaborator(e.context("unmapping surface")));
                }
                match platform.surfaces.release(s) {
                    Ok(()) => *any_released = true,
                    Err(e) => {
                        sticky.record(StressError::Collaborator(e.context("releasing surface")))
                    }
                }
            }
        }
        sticky.into_result()
    }
}

impl Drop for DirectionData {
    fn drop(&mut self) {
        if self.threads_running() {
            warn!(
                "route {} {} dropped with running traffic threads",
                self.route, self.direction
            );
            let _ = self.stop_copies();
        }
    }
}

/// Returns a surface from a half-built pair, unmapping it first.
fn discard_surface(platform: &Platform, mut surface: Box<dyn Surface>) {
    if surface.is_mapped()
        && let Err(e) = surface.unmap()
    {
        warn!("unmapping orphaned surface failed: {}", e);
    }
    if let Err(e) = platform.surfaces.release(surface) {
        warn!("releasing orphaned surface failed: {}", e);
    }
}

fn traffic_loop(pair: &Mutex<SurfacePair>, running: &AtomicBool) -> Result<CopyCounters> {
    let start = Instant::now();
    let mut bytes = 0u64;
    while running.load(Ordering::Acquire) {
        let mut guard = pair.lock().unwrap_or_else(|e| e.into_inner());
        bytes += guard.transfer()?;
        drop(guard);
        thread::yield_now();
    }
    Ok(CopyCounters {
        bytes,
        elapsed_ns: start.elapsed().as_nanos() as u64,
    })
}
