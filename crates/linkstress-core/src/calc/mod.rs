//! Analytical bandwidth model.
//!
//! Pure function of topology and traffic mix: packet efficiency per shared
//! connection, fabric ceilings per device, and the tolerance window each
//! measurement is judged against.

pub mod efficiency;
pub mod fabric;
pub mod tolerance;

use crate::config::TestModeConfig;
use crate::topology::{Direction, Pattern, Route, RouteId, Topology, TransferOp};
use efficiency::EfficiencyCalculator;
use tolerance::{BandwidthWindow, DriftConditions, drift_allowance};

/// One active route and direction.
#[derive(Debug, Clone, Copy)]
pub struct Flow<'a> {
    pub route: &'a Route,
    pub direction: Direction,
    pub op: TransferOp,
}

/// Model output for one flow.
#[derive(Debug, Clone, PartialEq)]
pub struct Expectation {
    pub route: RouteId,
    pub direction: Direction,
    pub efficiency: f64,
    /// Raw link bandwidth scaled by efficiency and observable fraction.
    pub link_bandwidth: f64,
    pub fabric_ceiling: Option<f64>,
    pub expected: f64,
    pub fabric_limited: bool,
    pub window: BandwidthWindow,
}

/// Computes the expected bandwidth and window of every flow.
pub fn expectations(
    topology: &dyn Topology,
    config: &TestModeConfig,
    flows: &[Flow<'_>],
) -> anyhow::Result<Vec<Expectation>> {
    let mut calc = EfficiencyCalculator::new(topology, &config.protocol, flows);
    let access = fabric::access_map(flows);
    let threshold = config.threshold();

    let thermal_scale = if config.thermal.enabled() {
        1.0 - config.thermal.duty() * config.drift.thermal_slowdown_factor
    } else {
        1.0
    };

    let mut out = Vec::with_capacity(flows.len());
    for flow in flows {
        let efficiency = calc.route_efficiency(flow)?;
        let pattern = if flows
            .iter()
            .any(|f| f.route.id == flow.route.id && f.direction != flow.direction)
        {
            Pattern::Bidir
        } else {
            Pattern::Unidir
        };
        let link_bandwidth =
            flow.route.raw_bandwidth() * efficiency * flow.route.observable.get(flow.op, pattern);
        let fabric_ceiling = fabric::route_ceiling(topology, flow.route, &access);
        let fabric_limited = fabric_ceiling.is_some_and(|c| c < link_bandwidth);
        let expected = fabric_ceiling.map_or(link_bandwidth, |c| c.min(link_bandwidth)) * thermal_scale;

        let allowance = drift_allowance(
            &config.drift,
            threshold,
            DriftConditions {
                low_power: config.power.toggling() || config.copy.idle_gaps_per_copy > 0,
                thermal: config.thermal.enabled(),
                fabric_limited,
            },
        );

        out.push(Expectation {
            route: flow.route.id,
            direction: flow.direction,
            efficiency,
            link_bandwidth,
            fabric_ceiling,
            expected,
            fabric_limited,
            window: BandwidthWindow::new(expected, threshold, allowance),
        });
    }
    Ok(out)
}


#[cfg(test)]
mod tests {
    use super::test_support::{StaticTopology, route};
    use super::*;
    use crate::config::{ProtocolConfig, ThrottleConfig};
    use crate::topology::DeviceId;

    fn loopback_config() -> TestModeConfig {
        let mut cfg = TestModeConfig::default();
        cfg.bandwidth.threshold_percent = 90.0;
        cfg.protocol = ProtocolConfig {
            packet_bytes: 144,
            ..ProtocolConfig::default()
        };
        cfg
    }

    #[test]
    fn loopback_write_expects_45_gbps() {
        let topo = StaticTopology::single_connection(DeviceId(0), DeviceId(0), false);
        let r = route(1, 0, Some(0), &[0]);
        let flows = [Flow {
            route: &r,
            direction: Direction::Out,
            op: TransferOp::Write,
        }];
        let exp = expectations(&topo, &loopback_config(), &flows).unwrap();
        assert_eq!(exp.len(), 1);
        assert!((exp[0].expected - 45.0e9).abs() < 1.0, "{}", exp[0].expected);
        assert!(!exp[0].fabric_limited);
        assert!((exp[0].window.minimum - 40.5e9).abs() < 1.0);
    }

    #[test]
    fn fabric_caps_expected_and_widens_window() {
        let mut topo = StaticTopology::single_connection(DeviceId(0), DeviceId(1), false);
        topo.fabric.insert(DeviceId(1), 30.0e9);
        let r = route(1, 0, Some(1), &[0]);
        let flows = [Flow {
            route: &r,
            direction: Direction::Out,
            op: TransferOp::Write,
        }];
        let exp = expectations(&topo, &loopback_config(), &flows).unwrap();
        assert!(exp[0].fabric_limited);
        assert!((exp[0].expected - 30.0e9).abs() < 1.0);
        assert!((exp[0].window.maximum - 30.0e9 * 1.12).abs() < 1.0);
    }

    #[test]
    fn thermal_duty_reduces_expected() {
        let topo = StaticTopology::single_connection(DeviceId(0), DeviceId(0), false);
        let r = route(1, 0, Some(0), &[0]);
        let flows = [Flow {
            route: &r,
            direction: Direction::Out,
            op: TransferOp::Write,
        }];
        let mut cfg = loopback_config();
        cfg.thermal.throttling = Some(ThrottleConfig {
            on_count: 1,
            off_count: 1,
        });
        let exp = expectations(&topo, &cfg, &flows).unwrap();
        // Half duty, half slowdown: 45 * 0.75
        assert!((exp[0].expected - 33.75e9).abs() < 1.0);
    }

    #[test]
    fn bidir_uses_bidir_fraction() {
        let topo = StaticTopology::single_connection(DeviceId(0), DeviceId(1), false);
        let mut r = route(1, 0, Some(1), &[0]);
        r.observable.bidir_write = 0.5;
        let flows = [
            Flow {
                route: &r,
                direction: Direction::Out,
                op: TransferOp::Write,
            },
            Flow {
                route: &r,
                direction: Direction::In,
                op: TransferOp::Read,
            },
        ];
        let exp = expectations(&topo, &TestModeConfig::default(), &flows).unwrap();
        assert!(exp[0].link_bandwidth < exp[1].link_bandwidth);
    }
}
