//! Simulated per-device power, LP counter, and thermal registers.

use linkstress_core::topology::{
    LinkId, LpCount, LpCounterControl, PowerStateControl, SubLinkPowerState, ThermalControl,
};
use quanta::Instant;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy)]
struct HwToggle {
    started: Instant,
    period_us: u64,
}

#[derive(Debug, Default)]
struct LinkRegs {
    state: SubLinkPowerState,
    entries: u64,
    overflowed: bool,
    toggle: Option<HwToggle>,
}

impl LinkRegs {
    /// Folds a running hardware toggle into the entry count.
    fn settle_toggle(&mut self) {
        if let Some(t) = self.toggle.take() {
            let elapsed_us = t.started.elapsed().as_micros() as u64;
            self.entries += elapsed_us / t.period_us.max(1);
        }
    }

    fn live_entries(&self) -> u64 {
        let running = self.toggle.map_or(0, |t| {
            t.started.elapsed().as_micros() as u64 / t.period_us.max(1)
        });
        self.entries + running
    }
}

#[derive(Debug, Default)]
struct ThermalRegs {
    throttling: Option<(u32, u32)>,
    slowdown_period_us: Option<u32>,
    throttle_starts: u32,
    slowdown_starts: u32,
}

/// Register file of one simulated device.
///
/// Every software transition into low power bumps that link's entry
/// counter, as does every period of a running hardware toggle generator.
#[derive(Debug)]
pub struct SimPowerHal {
    hw_toggle: bool,
    counter_limit: u64,
    links: Mutex<HashMap<LinkId, LinkRegs>>,
    thermal: Mutex<ThermalRegs>,
}

impl Default for SimPowerHal {
    fn default() -> Self {
        Self::new(false)
    }
}

impl SimPowerHal {
    pub fn new(hw_toggle: bool) -> Self {
        Self {
            hw_toggle,
            counter_limit: u32::MAX as u64,
            links: Mutex::new(HashMap::new()),
            thermal: Mutex::new(ThermalRegs::default()),
        }
    }

    /// Counter width in values; reads at or above it report overflow.
    pub fn with_counter_limit(mut self, limit: u64) -> Self {
        self.counter_limit = limit;
        self
    }

    fn links(&self) -> std::sync::MutexGuard<'_, HashMap<LinkId, LinkRegs>> {
        self.links.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn thermal(&self) -> std::sync::MutexGuard<'_, ThermalRegs> {
        self.thermal.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Adds entries the engine did not request, as spurious hardware would.
    pub fn inject_lp_entries(&self, link: LinkId, count: u64) {
        self.links().entry(link).or_default().entries += count;
    }

    pub fn set_overflow(&self, link: LinkId) {
        self.links().entry(link).or_default().overflowed = true;
    }

    pub fn state(&self, link: LinkId) -> SubLinkPowerState {
        self.links().get(&link).map(|r| r.state).unwrap_or_default()
    }

    pub fn hw_toggle_running(&self, link: LinkId) -> bool {
        self.links().get(&link).is_some_and(|r| r.toggle.is_some())
    }

    pub fn throttling(&self) -> Option<(u32, u32)> {
        self.thermal().throttling
    }

    pub fn slowdown_active(&self) -> bool {
        self.thermal().slowdown_period_us.is_some()
    }

    pub fn thermal_starts(&self) -> (u32, u32) {
        let t = self.thermal();
        (t.throttle_starts, t.slowdown_starts)
    }
}

impl PowerStateControl for SimPowerHal {
    fn request_power_state(
        &self,
        link: LinkId,
        state: SubLinkPowerState,
        _wait_for_completion: bool,
    ) -> anyhow::Result<()> {
        let mut links = self.links();
        let regs = links.entry(link).or_default();
        regs.settle_toggle();
        if state == SubLinkPowerState::LowPower && regs.state != SubLinkPowerState::LowPower {
            regs.entries += 1;
        }
        regs.state = state;
        Ok(())
    }

    fn power_state_status(&self, link: LinkId) -> anyhow::Result<SubLinkPowerState> {
        Ok(self.state(link))
    }

    fn supports_lp_hw_toggle(&self) -> bool {
        self.hw_toggle
    }

    fn start_power_state_toggle(&self, link: LinkId, on_us: u32, off_us: u32) -> anyhow::Result<()> {
        anyhow::ensure!(self.hw_toggle, "hardware toggle not supported");
        let mut links = self.links();
        let regs = links.entry(link).or_default();
        regs.settle_toggle();
        regs.toggle = Some(HwToggle {
            started: Instant::now(),
            period_us: on_us as u64 + off_us as u64,
        });
        Ok(())
    }
}

impl LpCounterControl for SimPowerHal {
    fn clear_lp_counts(&self, link: LinkId) -> anyhow::Result<()> {
        let mut links = self.links();
        let regs = links.entry(link).or_default();
        regs.settle_toggle();
        regs.entries = 0;
        regs.overflowed = false;
        Ok(())
    }

    fn lp_entry_or_exit_count(&self, link: LinkId, _is_entry: bool) -> anyhow::Result<LpCount> {
        let links = self.links();
        let Some(regs) = links.get(&link) else {
            return Ok(LpCount::default());
        };
        let count = regs.live_entries();
        Ok(LpCount {
            count: count.min(self.counter_limit),
            overflowed: regs.overflowed || count >= self.counter_limit,
        })
    }
}

impl ThermalControl for SimPowerHal {
    fn start_thermal_throttling(&self, on_count: u32, off_count: u32) -> anyhow::Result<()> {
        let mut t = self.thermal();
        anyhow::ensure!(t.throttling.is_none(), "thermal throttling already active");
        t.throttling = Some((on_count, off_count));
        t.throttle_starts += 1;
        Ok(())
    }

    fn stop_thermal_throttling(&self) -> anyhow::Result<()> {
        self.thermal().throttling = None;
        Ok(())
    }

    fn start_thermal_slowdown(&self, period_us: u32) -> anyhow::Result<()> {
        let mut t = self.thermal();
        anyhow::ensure!(t.slowdown_period_us.is_none(), "thermal slowdown already active");
        t.slowdown_period_us = Some(period_us);
        t.slowdown_starts += 1;
        Ok(())
    }

    fn stop_thermal_slowdown(&self) -> anyhow::Result<()> {
        self.thermal().slowdown_period_us = None;
        Ok(())
    }
}
