//! # Test Mode Orchestrator
//!
//! Owns the routes under test and drives one mode through its lifecycle:
//!
//! ```text
//! initialize → acquire_resources → do_one_copy × N → check_bandwidth
//!                                                   → check_lp_count
//!            → release_resources
//! ```
//!
//! A copy cycle prepares every copy before triggering any of them, starts
//! the power and slowdown controllers only after the trigger, and tears
//! down everything it started on every exit path. Checks are sticky: every
//! route and link is checked, and the first failure is returned.

use crate::calc::{self, Expectation, Flow};
use crate::config::TestModeConfig;
use crate::direction::DirectionData;
use crate::error::{Result, StickyError, StressError};
use crate::lp_counter::{self, LpCounterKey, LpCounterRegistry, LpExpectation};
use crate::power::{PowerStateToggle, ThermalSlowdown, ThermalTarget, ThermalThrottle, ToggleTarget};
use crate::registry::{ActiveTestRegistry, AsyncErrorSink, Registration};
use crate::stats::{
    AsyncErrorCount, BandwidthRecord, DirectionStats, LpRecord, ModeReport, REPORT_SCHEMA_VERSION,
    to_gbps,
};
use crate::topology::{
    Capability, CopyCounters, CopyRequest, DeviceId, Direction, LinkId, Platform, PreparedCopy,
    Route, RouteId, SubLinkPowerState, TransferType,
};
use crate::calc::tolerance::BandwidthVerdict;
use quanta::Instant;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Callback run between thread start and trigger (interactive debugging).
pub type PauseHook = Box<dyn FnMut() + Send>;

/// Which routes and directions a mode exercises.
#[derive(Debug, Clone)]
pub struct RouteMask {
    /// `None` selects every route.
    pub routes: Option<BTreeSet<RouteId>>,
    pub directions: Vec<Direction>,
}

impl Default for RouteMask {
    fn default() -> Self {
        Self::all()
    }
}

impl RouteMask {
    pub fn all() -> Self {
        Self {
            routes: None,
            directions: Direction::ALL.to_vec(),
        }
    }

    pub fn only(routes: impl IntoIterator<Item = RouteId>) -> Self {
        Self {
            routes: Some(routes.into_iter().collect()),
            ..Self::all()
        }
    }

    pub fn with_directions(mut self, directions: &[Direction]) -> Self {
        self.directions = directions.to_vec();
        self
    }

    pub fn selects(&self, route: RouteId) -> bool {
        self.routes.as_ref().is_none_or(|r| r.contains(&route))
    }
}

/// One route under test with its two directions.
pub struct RouteEntry {
    pub route: Arc<Route>,
    dirs: [DirectionData; 2],
}

impl RouteEntry {
    fn new(route: Arc<Route>) -> Self {
        let id = route.id;
        Self {
            route,
            dirs: [
                DirectionData::new(id, Direction::In),
                DirectionData::new(id, Direction::Out),
            ],
        }
    }

    fn slot(direction: Direction) -> usize {
        match direction {
            Direction::In => 0,
            Direction::Out => 1,
        }
    }

    pub fn direction(&self, direction: Direction) -> &DirectionData {
        &self.dirs[Self::slot(direction)]
    }

    pub fn direction_mut(&mut self, direction: Direction) -> &mut DirectionData {
        &mut self.dirs[Self::slot(direction)]
    }

    pub fn in_use(&self) -> impl Iterator<Item = &DirectionData> {
        self.dirs.iter().filter(|d| d.in_use())
    }

    pub fn any_in_use(&self) -> bool {
        self.dirs.iter().any(|d| d.in_use())
    }
}

struct ActiveCopy {
    route: RouteId,
    direction: Direction,
    idle_gaps: u32,
    prepared: Box<dyn PreparedCopy>,
    triggered: bool,
    done: Option<CopyCounters>,
}

/// Everything one copy cycle starts. Torn down by `finish_cycle`.
#[derive(Default)]
struct Cycle {
    copies: Vec<ActiveCopy>,
    throttle: Option<ThermalThrottle>,
    slowdown: Option<ThermalSlowdown>,
    threads_started: bool,
}

pub struct TestMode {
    platform: Platform,
    config: TestModeConfig,
    sink: Arc<AsyncErrorSink>,
    _registration: Registration,
    entries: BTreeMap<RouteId, RouteEntry>,
    expectations: BTreeMap<(RouteId, Direction), Expectation>,
    transfer_type: TransferType,
    resources_acquired: bool,
    lp_counters: LpCounterRegistry,
    toggled: BTreeMap<LpCounterKey, u64>,
    idle_entries: BTreeMap<LpCounterKey, u64>,
    toggle: Option<PowerStateToggle>,
    pause_hook: Option<PauseHook>,
    cycles: u64,
    failed_cycles: u64,
    bandwidth_records: Vec<BandwidthRecord>,
    lp_records: Vec<LpRecord>,
}

impl TestMode {
    pub fn new(
        platform: Platform,
        config: TestModeConfig,
        registry: &Arc<ActiveTestRegistry>,
    ) -> Self {
        let sink = AsyncErrorSink::new();
        let registration = registry.register(&sink);
        Self {
            platform,
            config,
            sink,
            _registration: registration,
            entries: BTreeMap::new(),
            expectations: BTreeMap::new(),
            transfer_type: TransferType::NONE,
            resources_acquired: false,
            lp_counters: LpCounterRegistry::new(),
            toggled: BTreeMap::new(),
            idle_entries: BTreeMap::new(),
            toggle: None,
            pause_hook: None,
            cycles: 0,
            failed_cycles: 0,
            bandwidth_records: Vec::new(),
            lp_records: Vec::new(),
        }
    }

    /// Builds a mode from TOML configuration text.
    pub fn from_toml(
        platform: Platform,
        config: &str,
        registry: &Arc<ActiveTestRegistry>,
    ) -> Result<Self> {
        let config = TestModeConfig::from_toml_str(config).map_err(StressError::Config)?;
        Ok(Self::new(platform, config, registry))
    }

    pub fn config(&self) -> &TestModeConfig {
        &self.config
    }

    pub fn sink(&self) -> &Arc<AsyncErrorSink> {
        &self.sink
    }

    pub fn transfer_type(&self) -> TransferType {
        self.transfer_type
    }

    pub fn entries(&self) -> impl Iterator<Item = &RouteEntry> {
        self.entries.values()
    }

    pub fn entry(&self, route: RouteId) -> Option<&RouteEntry> {
        self.entries.get(&route)
    }

    pub fn expectation(&self, route: RouteId, direction: Direction) -> Option<&Expectation> {
        self.expectations.get(&(route, direction))
    }

    pub fn lp_counters(&self) -> &LpCounterRegistry {
        &self.lp_counters
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn resources_acquired(&self) -> bool {
        self.resources_acquired
    }

    pub fn set_pause_hook(&mut self, hook: PauseHook) {
        self.pause_hook = Some(hook);
    }

    /// Builds the route table for the selected routes and directions and
    /// runs the bandwidth model over the resulting traffic mix.
    pub fn initialize(&mut self, routes: &[Arc<Route>], mask: &RouteMask) -> Result<()> {
        if self.resources_acquired {
            return Err(StressError::Setup(
                "resources must be released before re-initializing".to_string(),
            ));
        }
        self.entries.clear();
        self.expectations.clear();
        self.transfer_type = TransferType::NONE;
        self.toggled.clear();
        self.idle_entries.clear();
        self.bandwidth_records.clear();
        self.lp_records.clear();
        self.cycles = 0;
        self.failed_cycles = 0;

        let topology = &self.platform.topology;
        for route in routes.iter().filter(|r| mask.selects(r.id)) {
            let mut entry = RouteEntry::new(route.clone());
            for &direction in &mask.directions {
                let dir = entry.direction_mut(direction);
                dir.set_hw(
                    topology.transfer_hw(route, direction),
                    topology.is_hw_local(route, direction),
                );
                dir.set_in_use(true);
            }
            self.transfer_type |= route.transfer_type;
            self.entries.insert(route.id, entry);
        }

        let flows: Vec<Flow<'_>> = self
            .entries
            .values()
            .flat_map(|e| {
                e.in_use().map(move |d| Flow {
                    route: &e.route,
                    direction: d.direction(),
                    op: d.op,
                })
            })
            .collect();
        let model = calc::expectations(topology.as_ref(), &self.config, &flows)
            .map_err(|e| StressError::Setup(format!("bandwidth model failed: {:#}", e)))?;
        drop(flows);

        for exp in model {
            if let Some(entry) = self.entries.get_mut(&exp.route) {
                entry
                    .direction_mut(exp.direction)
                    .set_model(exp.efficiency, exp.expected);
            }
            self.expectations.insert((exp.route, exp.direction), exp);
        }

        info!(
            "Initialized {} routes ({} directions), transfer type {}",
            self.entries.len(),
            self.expectations.len(),
            self.transfer_type
        );
        Ok(())
    }

    /// (device, link) pairs occupied by routes with traffic.
    fn participating_links(&self) -> BTreeSet<(DeviceId, LinkId)> {
        self.entries
            .values()
            .filter(|e| e.any_in_use())
            .flat_map(|e| e.route.device_links())
            .collect()
    }

    fn participating_devices(&self) -> BTreeSet<DeviceId> {
        self.participating_links().into_iter().map(|(d, _)| d).collect()
    }

    /// Forces full bandwidth when power features are on, snapshots LP
    /// baselines for trained links, and acquires direction resources.
    /// A failure here is fatal; `release_resources` cleans up whatever was
    /// acquired before it.
    pub fn acquire_resources(&mut self) -> Result<()> {
        if self.resources_acquired {
            return Ok(());
        }
        self.resources_acquired = true;
        let topology = self.platform.topology.clone();
        let links = self.participating_links();

        let mut trained = Vec::with_capacity(links.len());
        for &(device, link) in &links {
            let state = topology.link_status(device, link).map_err(|e| {
                StressError::Setup(format!(
                    "link status of device {} link {}: {:#}",
                    device, link, e
                ))
            })?;
            if state.reports_transitions() {
                trained.push((device, link));
            } else {
                debug!(
                    "Skipping device {} link {} in state {}",
                    device,
                    link,
                    state.as_str()
                );
            }
        }

        if self.config.power_features_enabled() {
            for &(device, link) in &trained {
                let Some(power) = topology.power_control(device) else {
                    continue;
                };
                power
                    .request_power_state(link, SubLinkPowerState::FullBandwidth, true)
                    .map_err(|e| {
                        StressError::Setup(format!(
                            "forcing full bandwidth on device {} link {}: {:#}",
                            device, link, e
                        ))
                    })?;
            }
        }

        for &(device, link) in &trained {
            if !topology.supports(device, Capability::LpCounters) {
                continue;
            }
            let Some(counters) = topology.lp_counters(device) else {
                continue;
            };
            self.lp_counters
                .insert_baseline(LpCounterKey { device, link }, counters)
                .map_err(|e| {
                    StressError::Setup(format!(
                        "LP baseline on device {} link {}: {:#}",
                        device, link, e
                    ))
                })?;
        }

        for entry in self.entries.values_mut() {
            let route = entry.route.clone();
            for dir in entry.dirs.iter_mut() {
                dir.reset_stats();
                dir.acquire(
                    &self.platform,
                    &self.config.traffic,
                    route.transfer_type,
                    route.local,
                )?;
                dir.setup_test_surfaces(&self.config.traffic)?;
            }
        }
        info!(
            "Resources acquired: {} LP counters on {} links",
            self.lp_counters.len(),
            links.len()
        );
        Ok(())
    }

    /// Runs one synchronized copy cycle across every route and direction in
    /// use. Everything started is stopped exactly once before returning.
    pub fn do_one_copy(&mut self, timeout: Duration) -> Result<()> {
        self.sink.enter_cycle()?;
        let result = self.run_cycle(timeout);
        self.sink.exit_cycle();

        let mut sticky = StickyError::new();
        sticky.check(result);
        for e in self.sink.take_pending() {
            sticky.record(e);
        }
        self.cycles += 1;
        if sticky.is_err() {
            self.failed_cycles += 1;
        }
        sticky.into_result()
    }

    fn run_cycle(&mut self, timeout: Duration) -> Result<()> {
        if !self.resources_acquired {
            return Err(StressError::Setup(
                "copy cycle before resources were acquired".to_string(),
            ));
        }
        let mut cycle = Cycle::default();
        let mut sticky = StickyError::new();

        let run = match self.prepare_copies(&mut cycle) {
            Ok(()) => self.drive_cycle(&mut cycle, timeout),
            Err(e) => Err(e),
        };
        sticky.check(run);
        sticky.check(self.finish_cycle(&mut cycle));

        if self.config.power_features_enabled() {
            for e in self.lp_counters.poll() {
                sticky.record(e);
            }
        }
        sticky.check(self.collect_cycle_stats(&mut cycle));
        sticky.into_result()
    }

    /// Step 1: queue every copy without starting it.
    fn prepare_copies(&self, cycle: &mut Cycle) -> Result<()> {
        let gaps = self.config.copy.idle_gaps_per_copy;
        for entry in self.entries.values() {
            for dir in entry.in_use() {
                let request = CopyRequest {
                    route: entry.route.id,
                    direction: dir.direction(),
                    hw: dir.hw,
                    bytes: self.config.copy.bytes_per_copy,
                    idle_gaps: gaps,
                };
                let prepared = self
                    .platform
                    .copy_engine
                    .setup(&entry.route, &request)
                    .map_err(|e| {
                        StressError::Collaborator(e.context(format!(
                            "copy setup on route {} {}",
                            entry.route.id,
                            dir.direction()
                        )))
                    })?;
                cycle.copies.push(ActiveCopy {
                    route: entry.route.id,
                    direction: dir.direction(),
                    idle_gaps: gaps,
                    prepared,
                    triggered: false,
                    done: None,
                });
            }
        }
        debug!("Prepared {} copies", cycle.copies.len());
        Ok(())
    }

    /// Steps 2 through 7.
    fn drive_cycle(&mut self, cycle: &mut Cycle, timeout: Duration) -> Result<()> {
        if let Some(throttle) = self.config.thermal.throttling {
            let mut t = ThermalThrottle::new(
                self.thermal_targets(),
                throttle.on_count,
                throttle.off_count,
            );
            let started = t.start();
            cycle.throttle = Some(t);
            started?;
        }

        cycle.threads_started = true;
        for entry in self.entries.values_mut() {
            for dir in entry.dirs.iter_mut().filter(|d| d.in_use()) {
                dir.start_copies()?;
            }
        }

        if let Some(hook) = self.pause_hook.as_mut() {
            hook();
        }

        for c in cycle.copies.iter_mut() {
            c.prepared.trigger().map_err(|e| {
                StressError::Collaborator(
                    e.context(format!("triggering copy on route {} {}", c.route, c.direction)),
                )
            })?;
            c.triggered = true;
        }

        if let Some(interval) = self.config.power.toggle_interval {
            let targets = self.toggle_targets();
            let hw = &self.config.power.hw_toggle;
            let mode = PowerStateToggle::select_mode(
                &targets,
                interval,
                self.config.power.prefer_hw_toggle,
                hw.on_us,
                hw.off_us,
            );
            let toggle = self.toggle.insert(PowerStateToggle::new(
                mode,
                targets,
                self.config.power.join_timeout,
            ));
            toggle.start()?;
        }
        if let Some(period_us) = self.config.thermal.slowdown_period_us {
            let mut s = ThermalSlowdown::new(
                self.thermal_targets(),
                period_us,
                self.config.power.join_timeout,
            );
            let started = s.start();
            cycle.slowdown = Some(s);
            started?;
        }

        self.wait_for_copies(cycle, timeout)
    }

    fn wait_for_copies(&self, cycle: &mut Cycle, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        loop {
            let mut pending = 0usize;
            for c in cycle.copies.iter_mut().filter(|c| c.done.is_none()) {
                match c.prepared.poll() {
                    Ok(Some(counters)) => c.done = Some(counters),
                    Ok(None) => pending += 1,
                    Err(e) => {
                        return Err(StressError::Collaborator(e.context(format!(
                            "polling copy on route {} {}",
                            c.route, c.direction
                        ))));
                    }
                }
            }
            if pending == 0 {
                return Ok(());
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(StressError::Timeout {
                    what: format!("{} of {} copies", pending, cycle.copies.len()),
                    elapsed_ms: elapsed.as_millis() as u64,
                });
            }
            thread::sleep(self.config.copy.poll_interval);
        }
    }

    /// Stops controllers, copies, and traffic threads. Runs on every path
    /// out of a cycle; each piece is stopped at most once.
    fn finish_cycle(&mut self, cycle: &mut Cycle) -> Result<()> {
        let mut sticky = StickyError::new();

        sticky.check(self.stop_toggle());
        if let Some(mut s) = cycle.slowdown.take() {
            sticky.check(s.stop());
        }
        if let Some(mut t) = cycle.throttle.take() {
            sticky.check(t.stop());
        }

        for c in cycle.copies.iter_mut() {
            if c.triggered && c.done.is_none() {
                match c.prepared.stop() {
                    Ok(partial) => debug!(
                        "Stopped copy on route {} {} after {} bytes",
                        c.route, c.direction, partial.bytes
                    ),
                    Err(e) => sticky.record(StressError::Collaborator(e.context(format!(
                        "stopping copy on route {} {}",
                        c.route, c.direction
                    )))),
                }
            }
        }

        if std::mem::take(&mut cycle.threads_started) {
            for entry in self.entries.values_mut() {
                for dir in entry.dirs.iter_mut() {
                    sticky.check(dir.stop_copies());
                }
            }
        }
        sticky.into_result()
    }

    fn stop_toggle(&mut self) -> Result<()> {
        let Some(mut toggle) = self.toggle.take() else {
            return Ok(());
        };
        let (outcome, result) = toggle.stop();
        for (key, expectation) in outcome.expected {
            let add = match expectation {
                LpExpectation::Range { expected } => expected,
                LpExpectation::AtLeast { minimum } => minimum,
            };
            *self.toggled.entry(key).or_default() += add;
        }
        result
    }

    /// Step 9: merge finished copies into direction totals, record idle-gap
    /// entries, and verify payloads when configured.
    fn collect_cycle_stats(&mut self, cycle: &mut Cycle) -> Result<()> {
        let mut sticky = StickyError::new();
        for c in cycle.copies.iter_mut() {
            let Some(counters) = c.done else {
                continue;
            };
            let Some(entry) = self.entries.get_mut(&c.route) else {
                continue;
            };
            sticky.check(entry.direction_mut(c.direction).add_copy_stats(counters));

            if c.idle_gaps > 0 {
                for (device, link) in entry.route.device_links() {
                    *self
                        .idle_entries
                        .entry(LpCounterKey { device, link })
                        .or_default() += c.idle_gaps as u64;
                }
            }
            if self.config.copy.verify_data
                && let Err(e) = c.prepared.verify()
            {
                sticky.record(StressError::Collaborator(e.context(format!(
                    "data mismatch on route {} {}",
                    c.route, c.direction
                ))));
            }
        }
        sticky.into_result()
    }

    fn toggle_targets(&self) -> Vec<ToggleTarget> {
        let topology = &self.platform.topology;
        let mut targets = Vec::new();
        for (device, link) in self.participating_links() {
            if !topology.supports(device, Capability::PowerState) {
                continue;
            }
            match topology.power_control(device) {
                Some(control) => targets.push(ToggleTarget {
                    key: LpCounterKey { device, link },
                    control,
                }),
                None => warn!("Device {} has no power-state interface", device),
            }
        }
        targets
    }

    fn thermal_targets(&self) -> Vec<ThermalTarget> {
        let topology = &self.platform.topology;
        self.participating_devices()
            .into_iter()
            .filter(|&d| topology.supports(d, Capability::Thermal))
            .filter_map(|device| {
                topology
                    .thermal_control(device)
                    .map(|control| ThermalTarget { device, control })
            })
            .collect()
    }

    /// Judges every direction in use against its window. Failures are
    /// appended to `failures`; in unlocked mode a measurement under the
    /// expected value is a failure too.
    pub fn check_bandwidth(&mut self, mut failures: Option<&mut Vec<BandwidthRecord>>) -> Result<()> {
        if self.config.bandwidth.skip_check {
            info!("Bandwidth check skipped");
            return Ok(());
        }
        let mut sticky = StickyError::new();
        let mut records = Vec::with_capacity(self.expectations.len());
        let show = self.config.bandwidth.show_bandwidth_data;
        let unlocked = self.config.bandwidth.unlocked;

        for entry in self.entries.values() {
            for dir in entry.in_use() {
                let Some(exp) = self.expectations.get(&(entry.route.id, dir.direction())) else {
                    continue;
                };
                let measured = dir.bandwidth().unwrap_or(0.0);
                let verdict = exp.window.judge(measured);
                let record = BandwidthRecord {
                    route: entry.route.id,
                    direction: dir.direction(),
                    op: dir.op,
                    efficiency: exp.efficiency,
                    measured_gbps: to_gbps(measured),
                    expected_gbps: to_gbps(exp.expected),
                    minimum_gbps: to_gbps(exp.window.minimum),
                    maximum_gbps: to_gbps(exp.window.maximum),
                    fabric_limited: exp.fabric_limited,
                    verdict,
                };
                if show {
                    info!(
                        "route {} {}: {:.3} GB/s (expected {:.3}, window [{:.3}, {:.3}], eff {:.4})",
                        record.route,
                        record.direction,
                        record.measured_gbps,
                        record.expected_gbps,
                        record.minimum_gbps,
                        record.maximum_gbps,
                        record.efficiency
                    );
                } else {
                    debug!(
                        "route {} {}: {:.3} GB/s (expected {:.3})",
                        record.route, record.direction, record.measured_gbps, record.expected_gbps
                    );
                }

                let kind = match verdict {
                    BandwidthVerdict::Pass => None,
                    BandwidthVerdict::BelowExpected if !unlocked => {
                        warn!(
                            "route {} {}: {:.3} GB/s is below expected {:.3} GB/s",
                            record.route,
                            record.direction,
                            record.measured_gbps,
                            record.expected_gbps
                        );
                        None
                    }
                    // Unlocked diagnostic mode holds every route to its expected value.
                    BandwidthVerdict::BelowExpected => Some("below expected"),
                    BandwidthVerdict::TooLow => Some("too low"),
                    BandwidthVerdict::TooHigh => Some("too high"),
                };
                if let Some(kind) = kind {
                    let err = StressError::Bandwidth {
                        route: record.route,
                        direction: record.direction,
                        kind,
                        measured: record.measured_gbps,
                        minimum: record.minimum_gbps,
                        maximum: record.maximum_gbps,
                    };
                    error!("{}", err);
                    if let Some(sink) = failures.as_deref_mut() {
                        sink.push(record.clone());
                    }
                    sticky.record(err);
                }
                records.push(record);
            }
        }
        self.bandwidth_records = records;
        sticky.into_result()
    }

    /// Compares LP entry counts against what the controllers requested.
    /// Toggled links use a range check; links that only saw idle insertion
    /// must have entered low power at least once per gap.
    pub fn check_lp_count(&mut self, tolerance: u64, tolerance_percent: f64) -> Result<()> {
        let mut sticky = StickyError::new();
        let mut records = Vec::new();

        for counter in self.lp_counters.snapshot() {
            let key = counter.key;
            let expectation = if let Some(&expected) = self.toggled.get(&key) {
                Some(LpExpectation::Range { expected })
            } else {
                self.idle_entries
                    .get(&key)
                    .map(|&minimum| LpExpectation::AtLeast { minimum })
            };
            let result = match expectation {
                Some(exp) => lp_counter::evaluate(&counter, exp, tolerance, tolerance_percent),
                None if counter.overflowed => Err(StressError::CounterOverflow {
                    device: key.device,
                    link: key.link,
                }),
                None => continue,
            };
            let passed = result.is_ok();
            if let Err(e) = result {
                error!("{}", e);
                sticky.record(e);
            }
            records.push(LpRecord {
                device: key.device,
                link: key.link,
                expectation: expectation.unwrap_or(LpExpectation::AtLeast { minimum: 0 }),
                actual: counter.count,
                overflowed: counter.overflowed,
                passed,
            });
        }
        debug!("Checked {} LP counters", records.len());
        self.lp_records = records;
        sticky.into_result()
    }

    /// Stops any lingering toggle, stops counter collection, and releases
    /// every direction. Always runs to completion; the first error wins.
    pub fn release_resources(&mut self) -> Result<()> {
        let mut sticky = StickyError::new();
        sticky.check(self.stop_toggle());
        self.lp_counters.clear();

        let mut any_released = false;
        for entry in self.entries.values_mut() {
            for dir in entry.dirs.iter_mut() {
                sticky.check(dir.release(&self.platform, &mut any_released));
            }
        }
        if self.resources_acquired {
            info!("Resources released (surfaces returned: {})", any_released);
        }
        self.resources_acquired = false;
        sticky.into_result()
    }

    pub fn report(&self) -> ModeReport {
        let directions = self
            .entries
            .values()
            .flat_map(|e| e.in_use())
            .map(|d| DirectionStats {
                route: d.route(),
                direction: d.direction(),
                copies: d.copies(),
                total_bytes: d.total_bytes(),
                total_time_ns: d.total_time_ns(),
                cpu_bytes: d.cpu_bytes(),
                cpu_time_ns: d.cpu_time_ns(),
            })
            .collect();
        ModeReport {
            schema_version: REPORT_SCHEMA_VERSION,
            cycles: self.cycles,
            failed_cycles: self.failed_cycles,
            directions,
            bandwidth: self.bandwidth_records.clone(),
            lp: self.lp_records.clone(),
            unlocked: self.config.bandwidth.unlocked,
            async_errors: self
                .sink
                .counts()
                .into_iter()
                .map(|(key, count)| AsyncErrorCount { key, count })
                .collect(),
        }
    }
}

impl Drop for TestMode {
    fn drop(&mut self) {
        if self.resources_acquired
            && let Err(e) = self.release_resources()
        {
            warn!("Release on drop failed: {}", e);
        }
    }
}
