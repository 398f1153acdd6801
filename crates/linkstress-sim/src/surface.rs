//! Vec-backed surface pool that tracks what is outstanding.

use linkstress_core::topology::{MemoryDomain, Surface, SurfaceAllocator};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

pub struct SimSurface {
    data: Vec<u8>,
    mapped: bool,
    domain: MemoryDomain,
}

impl SimSurface {
    pub fn domain(&self) -> MemoryDomain {
        self.domain
    }
}

impl Surface for SimSurface {
    fn len(&self) -> usize {
        self.data.len()
    }

    fn map(&mut self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.mapped, "surface already mapped");
        self.mapped = true;
        Ok(())
    }

    fn unmap(&mut self) -> anyhow::Result<()> {
        anyhow::ensure!(self.mapped, "surface not mapped");
        self.mapped = false;
        Ok(())
    }

    fn is_mapped(&self) -> bool {
        self.mapped
    }

    fn bytes(&self) -> anyhow::Result<&[u8]> {
        anyhow::ensure!(self.mapped, "surface not mapped");
        Ok(&self.data)
    }

    fn bytes_mut(&mut self) -> anyhow::Result<&mut [u8]> {
        anyhow::ensure!(self.mapped, "surface not mapped");
        Ok(&mut self.data)
    }
}

/// Surface pool. `live()` is the number of surfaces not yet released.
#[derive(Debug, Default)]
pub struct SimSurfacePool {
    live: AtomicUsize,
    acquired: AtomicU64,
    /// Acquisitions that succeed before the pool starts refusing.
    capacity: Option<usize>,
}

impl SimSurfacePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::default()
        }
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn total_acquired(&self) -> u64 {
        self.acquired.load(Ordering::SeqCst)
    }
}

impl SurfaceAllocator for SimSurfacePool {
    fn acquire(&self, domain: MemoryDomain, bytes: usize) -> anyhow::Result<Box<dyn Surface>> {
        if let Some(cap) = self.capacity {
            anyhow::ensure!(self.live() < cap, "surface pool exhausted ({} live)", cap);
        }
        self.live.fetch_add(1, Ordering::SeqCst);
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimSurface {
            data: vec![0; bytes],
            mapped: false,
            domain,
        }))
    }

    fn release(&self, surface: Box<dyn Surface>) -> anyhow::Result<()> {
        anyhow::ensure!(!surface.is_mapped(), "released a mapped surface");
        self.live.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_limits_live_surfaces() {
        let pool = SimSurfacePool::with_capacity(1);
        let s = pool.acquire(MemoryDomain::SystemMemory, 16).unwrap();
        assert!(pool.acquire(MemoryDomain::SystemMemory, 16).is_err());
        pool.release(s).unwrap();
        assert_eq!(pool.live(), 0);
        assert!(pool.acquire(MemoryDomain::SystemMemory, 16).is_ok());
        assert_eq!(pool.total_acquired(), 2);
    }

    #[test]
    fn mapped_surface_cannot_be_released() {
        let pool = SimSurfacePool::new();
        let mut s = pool.acquire(MemoryDomain::SystemMemory, 16).unwrap();
        s.map().unwrap();
        assert!(pool.release(s).is_err());
    }
}
