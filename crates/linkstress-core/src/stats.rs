use crate::calc::tolerance::BandwidthVerdict;
use crate::lp_counter::LpExpectation;
use crate::registry::ErrorCountKey;
use crate::topology::{DeviceId, Direction, LinkId, RouteId, TransferOp};
use serde::{Deserialize, Serialize};

pub const REPORT_SCHEMA_VERSION: u32 = 1;

const GB: f64 = 1.0e9;

pub fn to_gbps(bytes_per_sec: f64) -> f64 {
    bytes_per_sec / GB
}

/// One route/direction bandwidth check, in GB/s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandwidthRecord {
    pub route: RouteId,
    pub direction: Direction,
    pub op: TransferOp,
    pub efficiency: f64,
    pub measured_gbps: f64,
    pub expected_gbps: f64,
    pub minimum_gbps: f64,
    pub maximum_gbps: f64,
    pub fabric_limited: bool,
    pub verdict: BandwidthVerdict,
}

/// One link's low-power count check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LpRecord {
    pub device: DeviceId,
    pub link: LinkId,
    pub expectation: LpExpectation,
    pub actual: u64,
    pub overflowed: bool,
    pub passed: bool,
}

/// Byte/time totals of one direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectionStats {
    pub route: RouteId,
    pub direction: Direction,
    pub copies: u64,
    pub total_bytes: u64,
    pub total_time_ns: u64,
    pub cpu_bytes: u64,
    pub cpu_time_ns: u64,
}

/// An asynchronous error tally entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsyncErrorCount {
    #[serde(flatten)]
    pub key: ErrorCountKey,
    pub count: u64,
}

/// Everything a mode measured and decided, for JSON output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModeReport {
    pub schema_version: u32,
    pub cycles: u64,
    pub failed_cycles: u64,
    pub directions: Vec<DirectionStats>,
    pub bandwidth: Vec<BandwidthRecord>,
    pub lp: Vec<LpRecord>,
    /// Set when every route was held to its expected value.
    #[serde(skip_serializing_if = "std::ops::Not::not", default)]
    pub unlocked: bool,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub async_errors: Vec<AsyncErrorCount>,
}

impl ModeReport {
    pub fn passed(&self) -> bool {
        self.failed_cycles == 0
            && self.bandwidth.iter().all(|b| {
                !b.verdict.is_failure()
                    && !(self.unlocked && b.verdict == BandwidthVerdict::BelowExpected)
            })
            && self.lp.iter().all(|l| l.passed)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::AsyncErrorKind;

    fn record(verdict: BandwidthVerdict) -> BandwidthRecord {
        BandwidthRecord {
            route: RouteId(1),
            direction: Direction::Out,
            op: TransferOp::Write,
            efficiency: 0.9,
            measured_gbps: 44.9,
            expected_gbps: 45.0,
            minimum_gbps: 40.5,
            maximum_gbps: 45.0045,
            fabric_limited: false,
            verdict,
        }
    }

    #[test]
    fn report_json_shape() {
        let report = ModeReport {
            schema_version: REPORT_SCHEMA_VERSION,
            cycles: 3,
            bandwidth: vec![record(BandwidthVerdict::BelowExpected)],
            lp: vec![LpRecord {
                device: DeviceId(0),
                link: LinkId(2),
                expectation: LpExpectation::AtLeast { minimum: 12 },
                actual: 14,
                overflowed: false,
                passed: true,
            }],
            async_errors: vec![AsyncErrorCount {
                key: ErrorCountKey {
                    device: DeviceId(0),
                    link: None,
                    kind: AsyncErrorKind::Crc,
                },
                count: 2,
            }],
            ..Default::default()
        };
        assert!(report.passed());

        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["bandwidth"][0]["verdict"], "below_expected");
        assert_eq!(json["bandwidth"][0]["direction"], "out");
        assert_eq!(json["lp"][0]["expectation"]["kind"], "at_least");
        assert_eq!(json["lp"][0]["expectation"]["minimum"], 12);
        assert_eq!(json["async_errors"][0]["kind"], "crc");
        assert_eq!(json["async_errors"][0]["count"], 2);
    }

    #[test]
    fn empty_async_errors_are_omitted() {
        let json = serde_json::to_value(ModeReport::default()).unwrap();
        assert!(json.get("async_errors").is_none());
    }

    #[test]
    fn any_failure_fails_report() {
        let mut report = ModeReport {
            bandwidth: vec![record(BandwidthVerdict::Pass), record(BandwidthVerdict::TooLow)],
            ..Default::default()
        };
        assert!(!report.passed());
        report.bandwidth.pop();
        assert!(report.passed());
        report.failed_cycles = 1;
        assert!(!report.passed());
    }

    #[test]
    fn unlocked_report_fails_below_expected() {
        let mut report = ModeReport {
            bandwidth: vec![record(BandwidthVerdict::BelowExpected)],
            ..Default::default()
        };
        assert!(report.passed());
        report.unlocked = true;
        assert!(!report.passed());
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["unlocked"], true);
    }
}
