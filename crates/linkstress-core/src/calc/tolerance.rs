//! Pass/fail windows around an expected bandwidth.

use crate::config::DriftConfig;
use serde::{Deserialize, Serialize};

/// Conditions that widen the upper bound of a window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriftConditions {
    pub low_power: bool,
    pub thermal: bool,
    pub fabric_limited: bool,
}

/// Fractional allowance above expected: the largest of the applicable
/// calibration constants.
pub fn drift_allowance(drift: &DriftConfig, threshold: f64, cond: DriftConditions) -> f64 {
    let mut allowance = drift.base_ppm / 1_000_000.0;
    if cond.low_power {
        allowance = allowance.max(drift.low_power_percent / 100.0);
    }
    if cond.thermal {
        // Symmetric window: max = expected * (2 - threshold).
        allowance = allowance.max(1.0 - threshold);
    }
    if cond.fabric_limited {
        allowance = allowance.max(drift.fabric_percent / 100.0);
    }
    allowance
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BandwidthVerdict {
    Pass,
    /// Inside the window but under the expected value.
    BelowExpected,
    TooLow,
    TooHigh,
}

impl BandwidthVerdict {
    pub fn is_failure(&self) -> bool {
        matches!(self, BandwidthVerdict::TooLow | BandwidthVerdict::TooHigh)
    }
}

/// Accepted range for one measurement, bytes per second.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BandwidthWindow {
    pub expected: f64,
    pub minimum: f64,
    pub maximum: f64,
}

impl BandwidthWindow {
    /// `threshold` is the lower bound as a fraction of expected.
    pub fn new(expected: f64, threshold: f64, allowance: f64) -> Self {
        Self {
            expected,
            minimum: expected * threshold,
            maximum: expected * (1.0 + allowance),
        }
    }

    pub fn judge(&self, measured: f64) -> BandwidthVerdict {
        if measured < self.minimum {
            BandwidthVerdict::TooLow
        } else if measured > self.maximum {
            BandwidthVerdict::TooHigh
        } else if measured < self.expected {
            BandwidthVerdict::BelowExpected
        } else {
            BandwidthVerdict::Pass
        }
    }
}
