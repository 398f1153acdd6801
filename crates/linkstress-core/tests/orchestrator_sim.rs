//! End-to-end test mode runs against the simulated platform.
//!
//! Covers:
//! 1. Initialize/acquire/release round trip leaves no threads or surfaces
//! 2. Loopback unidirectional write judged against a 45 GB/s model
//! 3. Timed-out cycles still join every thread and release cleanly
//! 4. LP count checks for software toggle, hardware toggle, and idle insertion
//! 5. Thermal controllers, async error broadcast, and data verification

use linkstress_core::config::{TestModeConfig, ThrottleConfig};
use linkstress_core::orchestrator::RouteMask;
use linkstress_core::registry::{ActiveTestRegistry, AsyncErrorKind, AsyncEvent};
use linkstress_core::stats::BandwidthRecord;
use linkstress_core::topology::{
    DeviceId, Direction, LinkId, LinkState, Route, RouteId, SubLinkPowerState,
};
use linkstress_core::{StressError, TestMode};
use linkstress_sim::test_util::init_tracing;
use linkstress_sim::{RouteSpec, SimCopyEngine, SimPlatform, SimPowerHal, SimTopology};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

const DEV: DeviceId = DeviceId(0);
const GB: f64 = 1.0e9;

// ─── Fixtures ────────────────────────────────────────────────────────────

fn loopback_topology(hal: Option<Arc<SimPowerHal>>) -> SimTopology {
    SimTopology::new()
        .with_device(DEV, hal)
        .with_connection(DEV, DEV, false)
}

fn loopback_route() -> Arc<Route> {
    RouteSpec::loopback(1, DEV).connections(&[0]).build()
}

/// 50 GB/s link, 9 data flits per header flit: 45 GB/s expected.
fn loopback_config() -> TestModeConfig {
    let mut cfg = TestModeConfig::default();
    cfg.bandwidth.threshold_percent = 90.0;
    cfg.protocol.packet_bytes = 144;
    cfg.copy.bytes_per_copy = 4_500_000;
    cfg.copy.timeout = Duration::from_secs(2);
    cfg
}

fn out_only() -> RouteMask {
    RouteMask::all().with_directions(&[Direction::Out])
}

fn run_loopback_at(
    rate_gbps: f64,
    cfg: TestModeConfig,
) -> (TestMode, Vec<BandwidthRecord>, Result<(), StressError>) {
    let sim = SimPlatform::new(loopback_topology(None), SimCopyEngine::new(rate_gbps * GB));
    let mut mode = TestMode::new(sim.platform(), cfg, &ActiveTestRegistry::new());
    mode.initialize(&[loopback_route()], &out_only()).unwrap();
    mode.acquire_resources().unwrap();
    mode.do_one_copy(Duration::from_secs(2)).unwrap();
    let mut failures = Vec::new();
    let result = mode.check_bandwidth(Some(&mut failures));
    mode.release_resources().unwrap();
    (mode, failures, result)
}

// ─── Lifecycle ───────────────────────────────────────────────────────────

#[test]
fn initialize_then_release_leaves_nothing_behind() {
    init_tracing();
    let sim = SimPlatform::new(loopback_topology(None), SimCopyEngine::new(45.0 * GB));
    let mut cfg = loopback_config();
    cfg.traffic.cpu_threads = 2;
    cfg.traffic.surface_bytes = 4096;
    let mut mode = TestMode::new(sim.platform(), cfg, &ActiveTestRegistry::new());

    mode.initialize(&[loopback_route()], &RouteMask::all()).unwrap();
    mode.release_resources().unwrap();
    assert_eq!(sim.surfaces.live(), 0);

    mode.acquire_resources().unwrap();
    // Two directions, two threads each, a source and a destination per thread.
    assert_eq!(sim.surfaces.live(), 8);
    mode.acquire_resources().unwrap();
    assert_eq!(sim.surfaces.live(), 8);

    mode.release_resources().unwrap();
    assert_eq!(sim.surfaces.live(), 0);
    for entry in mode.entries() {
        for d in Direction::ALL {
            assert!(!entry.direction(d).threads_running());
            assert_eq!(entry.direction(d).surface_pairs(), 0);
        }
    }
    mode.release_resources().unwrap();
}

#[test]
fn cpu_traffic_runs_during_cycles() {
    init_tracing();
    let sim = SimPlatform::new(loopback_topology(None), SimCopyEngine::new(1.0 * GB));
    let mut cfg = loopback_config();
    // 20 ms per copy at 1 GB/s.
    cfg.copy.bytes_per_copy = 20_000_000;
    cfg.traffic.cpu_threads = 1;
    cfg.traffic.surface_bytes = 1024;
    let mut mode = TestMode::new(sim.platform(), cfg, &ActiveTestRegistry::new());
    mode.initialize(&[loopback_route()], &out_only()).unwrap();
    mode.acquire_resources().unwrap();
    mode.do_one_copy(Duration::from_secs(2)).unwrap();

    let entry = mode.entry(RouteId(1)).unwrap();
    let out = entry.direction(Direction::Out);
    assert!(!out.threads_running());
    assert!(out.cpu_bytes() > 0);
    assert_eq!(out.copies(), 1);
    assert_eq!(out.total_bytes(), 20_000_000);
    mode.release_resources().unwrap();
    assert_eq!(sim.surfaces.live(), 0);
}

#[test]
fn surface_exhaustion_is_fatal_but_releasable() {
    init_tracing();
    let sim = SimPlatform::new(loopback_topology(None), SimCopyEngine::new(45.0 * GB))
        .with_surfaces(linkstress_sim::SimSurfacePool::with_capacity(3));
    let mut cfg = loopback_config();
    cfg.traffic.cpu_threads = 2;
    let mut mode = TestMode::new(sim.platform(), cfg, &ActiveTestRegistry::new());
    mode.initialize(&[loopback_route()], &out_only()).unwrap();

    let err = mode.acquire_resources().unwrap_err();
    assert!(err.is_fatal(), "{err}");
    mode.release_resources().unwrap();
    assert_eq!(sim.surfaces.live(), 0);
}

// ─── Bandwidth ───────────────────────────────────────────────────────────

#[test]
fn loopback_write_at_expected_rate_passes() {
    init_tracing();
    let (mode, failures, result) = run_loopback_at(45.0, loopback_config());
    result.unwrap();
    assert!(failures.is_empty());
    let exp = mode.expectation(RouteId(1), Direction::Out).unwrap();
    assert!((exp.expected - 45.0 * GB).abs() < 1.0);
    assert!((exp.efficiency - 0.9).abs() < 1e-12);
    assert!(mode.report().passed());
}

#[test]
fn slightly_below_expected_warns_but_passes() {
    init_tracing();
    let (mode, failures, result) = run_loopback_at(44.9, loopback_config());
    result.unwrap();
    assert!(failures.is_empty());
    let report = mode.report();
    assert_eq!(
        report.bandwidth[0].verdict,
        linkstress_core::calc::tolerance::BandwidthVerdict::BelowExpected
    );
}

#[test]
fn unlocked_mode_fails_below_expected() {
    init_tracing();
    let mut cfg = loopback_config();
    cfg.bandwidth.unlocked = true;
    let (mode, failures, result) = run_loopback_at(44.9, cfg);
    let err = result.unwrap_err();
    assert!(err.to_string().contains("bandwidth below expected"), "{err}");
    assert!(!mode.report().passed());
    assert!(matches!(
        err,
        StressError::Bandwidth {
            kind: "below expected",
            ..
        }
    ));
    assert_eq!(failures.len(), 1);
    assert!((failures[0].measured_gbps - 44.9).abs() < 1e-3);
}

#[test]
fn far_below_threshold_fails_too_low() {
    init_tracing();
    let (mode, failures, result) = run_loopback_at(40.0, loopback_config());
    let err = result.unwrap_err();
    assert!(err.to_string().contains("bandwidth too low"), "{err}");
    assert!(matches!(
        err,
        StressError::Bandwidth {
            route: RouteId(1),
            direction: Direction::Out,
            ..
        }
    ));
    assert_eq!(failures.len(), 1);
    assert!(!mode.report().passed());
}

#[test]
fn every_failing_route_is_reported() {
    init_tracing();
    let topo = loopback_topology(None).with_connection(DEV, DEV, false);
    let engine = SimCopyEngine::new(45.0 * GB)
        .with_rate(RouteId(1), Direction::Out, 10.0 * GB)
        .with_rate(RouteId(2), Direction::Out, 90.0 * GB);
    let sim = SimPlatform::new(topo, engine);
    let routes = [
        RouteSpec::loopback(1, DEV).connections(&[0]).build(),
        RouteSpec::loopback(2, DEV).connections(&[1]).build(),
    ];
    let mut mode = TestMode::new(sim.platform(), loopback_config(), &ActiveTestRegistry::new());
    mode.initialize(&routes, &out_only()).unwrap();
    mode.acquire_resources().unwrap();
    mode.do_one_copy(Duration::from_secs(2)).unwrap();
    let mut failures = Vec::new();
    assert!(mode.check_bandwidth(Some(&mut failures)).is_err());
    let routes: Vec<RouteId> = failures.iter().map(|f| f.route).collect();
    assert_eq!(routes, vec![RouteId(1), RouteId(2)]);
    mode.release_resources().unwrap();
}

#[test]
fn skip_check_ignores_bad_bandwidth() {
    init_tracing();
    let mut cfg = loopback_config();
    cfg.bandwidth.skip_check = true;
    let (_, failures, result) = run_loopback_at(1.0, cfg);
    result.unwrap();
    assert!(failures.is_empty());
}

// ─── Timeouts ────────────────────────────────────────────────────────────

#[test]
fn timeout_joins_everything_and_release_succeeds() {
    init_tracing();
    let hal = Arc::new(SimPowerHal::default());
    let topo = loopback_topology(Some(hal.clone()));
    let engine = SimCopyEngine::new(45.0 * GB).with_hang(RouteId(1), Direction::Out);
    let sim = SimPlatform::new(topo, engine);
    let counters = sim.engine.counters();

    let mut cfg = loopback_config();
    cfg.traffic.cpu_threads = 1;
    cfg.traffic.surface_bytes = 1024;
    cfg.power.toggle_interval = Some(Duration::from_micros(200));
    cfg.thermal.slowdown_period_us = Some(100);
    let mut mode = TestMode::new(sim.platform(), cfg, &ActiveTestRegistry::new());
    mode.initialize(&[loopback_route()], &RouteMask::all()).unwrap();
    mode.acquire_resources().unwrap();

    let err = mode.do_one_copy(Duration::from_millis(20)).unwrap_err();
    assert!(matches!(err, StressError::Timeout { .. }), "{err}");
    assert!(!mode.sink().in_cycle());
    assert_eq!(counters.stops.load(Ordering::Relaxed), 1);
    for d in Direction::ALL {
        assert!(!mode.entry(RouteId(1)).unwrap().direction(d).threads_running());
    }
    assert_eq!(hal.state(LinkId(0)), SubLinkPowerState::FullBandwidth);
    assert!(!hal.slowdown_active());

    mode.release_resources().unwrap();
    assert_eq!(sim.surfaces.live(), 0);
    assert_eq!(mode.report().failed_cycles, 1);
}

// ─── LP counts ───────────────────────────────────────────────────────────

fn lp_mode(hal: Arc<SimPowerHal>, cfg: TestModeConfig) -> (SimPlatform, TestMode) {
    let sim = SimPlatform::new(loopback_topology(Some(hal)), SimCopyEngine::new(1.0 * GB));
    let mut mode = TestMode::new(sim.platform(), cfg, &ActiveTestRegistry::new());
    mode.initialize(&[loopback_route()], &RouteMask::all()).unwrap();
    mode.acquire_resources().unwrap();
    (sim, mode)
}

fn toggle_config() -> TestModeConfig {
    let mut cfg = loopback_config();
    // 10 ms per copy at 1 GB/s.
    cfg.copy.bytes_per_copy = 10_000_000;
    cfg.power.toggle_interval = Some(Duration::from_micros(500));
    cfg
}

#[test]
fn software_toggle_counts_match() {
    init_tracing();
    let hal = Arc::new(SimPowerHal::default());
    let (_sim, mut mode) = lp_mode(hal.clone(), toggle_config());
    mode.do_one_copy(Duration::from_secs(2)).unwrap();
    mode.do_one_copy(Duration::from_secs(2)).unwrap();

    mode.check_lp_count(0, 0.0).unwrap();
    let report = mode.report();
    assert_eq!(report.lp.len(), 1);
    assert!(report.lp[0].actual > 0);
    assert_eq!(hal.state(LinkId(0)), SubLinkPowerState::FullBandwidth);

    hal.inject_lp_entries(LinkId(0), 5);
    mode.lp_counters().poll();
    let err = mode.check_lp_count(0, 0.0).unwrap_err();
    assert!(matches!(err, StressError::LpCount { .. }), "{err}");
    mode.release_resources().unwrap();
}

#[test]
fn hardware_toggle_estimates_from_elapsed_time() {
    init_tracing();
    let hal = Arc::new(SimPowerHal::new(true));
    let mut cfg = toggle_config();
    cfg.power.hw_toggle.on_us = 50;
    cfg.power.hw_toggle.off_us = 50;
    let (_sim, mut mode) = lp_mode(hal.clone(), cfg);
    mode.do_one_copy(Duration::from_secs(2)).unwrap();
    assert!(!hal.hw_toggle_running(LinkId(0)));

    mode.check_lp_count(2, 0.0).unwrap();
    let report = mode.report();
    assert!(report.lp[0].actual >= 90, "{:?}", report.lp[0]);
    mode.release_resources().unwrap();
}

#[test]
fn idle_insertion_uses_at_least_semantics() {
    init_tracing();
    let hal = Arc::new(SimPowerHal::default());
    let mut cfg = loopback_config();
    cfg.copy.idle_gaps_per_copy = 3;
    let (_sim, mut mode) = lp_mode(hal.clone(), cfg);
    mode.do_one_copy(Duration::from_secs(2)).unwrap();
    mode.do_one_copy(Duration::from_secs(2)).unwrap();

    // Extra entries never fail an at-least check.
    hal.inject_lp_entries(LinkId(0), 40);
    mode.lp_counters().poll();
    mode.check_lp_count(0, 0.0).unwrap();

    hal.set_overflow(LinkId(0));
    mode.lp_counters().poll();
    assert!(matches!(
        mode.check_lp_count(1000, 100.0),
        Err(StressError::CounterOverflow { .. })
    ));
    mode.release_resources().unwrap();
}

#[test]
fn untrained_links_get_no_counter() {
    init_tracing();
    let hal = Arc::new(SimPowerHal::default());
    let topo = loopback_topology(Some(hal));
    topo.set_link_state(DEV, LinkId(1), LinkState::Untrained);
    let sim = SimPlatform::new(topo, SimCopyEngine::new(45.0 * GB));
    let route = RouteSpec::loopback(1, DEV)
        .links(&[0, 1])
        .connections(&[0])
        .build();
    let mut mode = TestMode::new(sim.platform(), toggle_config(), &ActiveTestRegistry::new());
    mode.initialize(&[route], &RouteMask::all()).unwrap();
    mode.acquire_resources().unwrap();
    let keys: Vec<LinkId> = mode.lp_counters().snapshot().iter().map(|c| c.key.link).collect();
    assert_eq!(keys, vec![LinkId(0)]);
    mode.release_resources().unwrap();
    assert!(mode.lp_counters().is_empty());
}

// ─── Thermal, async errors, verification ─────────────────────────────────

#[test]
fn thermal_throttling_lowers_expectation_and_is_stopped() {
    init_tracing();
    let hal = Arc::new(SimPowerHal::default());
    let mut cfg = loopback_config();
    cfg.thermal.throttling = Some(ThrottleConfig {
        on_count: 1,
        off_count: 1,
    });
    let sim = SimPlatform::new(loopback_topology(Some(hal.clone())), SimCopyEngine::new(33.75 * GB));
    let mut mode = TestMode::new(sim.platform(), cfg, &ActiveTestRegistry::new());
    mode.initialize(&[loopback_route()], &out_only()).unwrap();
    let exp = mode.expectation(RouteId(1), Direction::Out).unwrap();
    assert!((exp.expected - 33.75 * GB).abs() < 1.0);
    // Thermal drift: max = expected * (2 - threshold).
    assert!((exp.window.maximum - 33.75 * GB * 1.1).abs() < 1.0);

    mode.acquire_resources().unwrap();
    mode.do_one_copy(Duration::from_secs(2)).unwrap();
    assert_eq!(hal.thermal_starts(), (1, 0));
    assert!(hal.throttling().is_none());
    mode.check_bandwidth(None).unwrap();
    mode.release_resources().unwrap();
}

#[test]
fn slowdown_toggle_runs_once_per_cycle() {
    init_tracing();
    let hal = Arc::new(SimPowerHal::default());
    let mut cfg = loopback_config();
    cfg.thermal.slowdown_period_us = Some(100);
    let (_sim, mut mode) = lp_mode(hal.clone(), cfg);
    mode.do_one_copy(Duration::from_secs(2)).unwrap();
    mode.do_one_copy(Duration::from_secs(2)).unwrap();
    assert_eq!(hal.thermal_starts(), (0, 2));
    assert!(!hal.slowdown_active());
    mode.release_resources().unwrap();
}

#[test]
fn async_error_fails_only_the_cycle_in_flight() {
    init_tracing();
    let registry = ActiveTestRegistry::new();
    let sim = SimPlatform::new(loopback_topology(None), SimCopyEngine::new(45.0 * GB));
    let mut mode = TestMode::new(sim.platform(), loopback_config(), &registry);
    mode.initialize(&[loopback_route()], &out_only()).unwrap();
    mode.acquire_resources().unwrap();

    let event = AsyncEvent {
        device: DEV,
        link: Some(LinkId(0)),
        kind: AsyncErrorKind::Replay,
        message: "replay limit".into(),
    };
    assert_eq!(registry.broadcast(&event), 1);
    mode.do_one_copy(Duration::from_secs(2)).unwrap();

    let reg = registry.clone();
    let ev = event.clone();
    mode.set_pause_hook(Box::new(move || {
        reg.broadcast(&ev);
    }));
    let err = mode.do_one_copy(Duration::from_secs(2)).unwrap_err();
    assert!(matches!(err, StressError::AsyncError { .. }), "{err}");

    let report = mode.report();
    assert_eq!(report.cycles, 2);
    assert_eq!(report.failed_cycles, 1);
    assert_eq!(report.async_errors.len(), 1);
    assert_eq!(report.async_errors[0].count, 2);
    mode.release_resources().unwrap();
    drop(mode);
    assert_eq!(registry.active(), 0);
}

#[test]
fn reentrant_cycle_is_rejected() {
    init_tracing();
    let sim = SimPlatform::new(loopback_topology(None), SimCopyEngine::new(45.0 * GB));
    let mut mode = TestMode::new(sim.platform(), loopback_config(), &ActiveTestRegistry::new());
    mode.initialize(&[loopback_route()], &out_only()).unwrap();
    mode.acquire_resources().unwrap();
    mode.sink().enter_cycle().unwrap();
    assert!(matches!(
        mode.do_one_copy(Duration::from_secs(1)),
        Err(StressError::Reentrant)
    ));
    mode.sink().exit_cycle();
    mode.do_one_copy(Duration::from_secs(1)).unwrap();
}

#[test]
fn verify_data_reports_corruption() {
    init_tracing();
    let engine = SimCopyEngine::new(45.0 * GB).with_corruption(RouteId(1), Direction::Out);
    let sim = SimPlatform::new(loopback_topology(None), engine);
    let counters = sim.engine.counters();
    let mut cfg = loopback_config();
    cfg.copy.verify_data = true;
    let mut mode = TestMode::new(sim.platform(), cfg, &ActiveTestRegistry::new());
    mode.initialize(&[loopback_route()], &RouteMask::all()).unwrap();
    mode.acquire_resources().unwrap();
    let err = mode.do_one_copy(Duration::from_secs(2)).unwrap_err();
    assert!(err.to_string().contains("data mismatch on route 1 out"), "{err}");
    assert_eq!(counters.verifies.load(Ordering::Relaxed), 2);
    mode.release_resources().unwrap();
}

#[test]
fn report_serializes_to_json() {
    init_tracing();
    let (mode, _, result) = run_loopback_at(45.0, loopback_config());
    result.unwrap();
    let json: serde_json::Value = serde_json::from_str(&mode.report().to_json().unwrap()).unwrap();
    assert_eq!(json["cycles"], 1);
    assert_eq!(json["bandwidth"][0]["verdict"], "pass");
    assert_eq!(json["directions"][0]["total_bytes"], 4_500_000);
}
