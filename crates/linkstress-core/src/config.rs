use std::time::Duration;

use serde::Deserialize;

pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TestModeConfigInput {
    pub version: u32,
    pub copy: CopyConfigInput,
    pub bandwidth: BandwidthConfigInput,
    pub drift: DriftConfigInput,
    pub protocol: ProtocolConfigInput,
    pub power: PowerConfigInput,
    pub thermal: ThermalConfigInput,
    pub traffic: TrafficConfigInput,
    pub lp: LpConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CopyConfigInput {
    pub bytes_per_copy: Option<u64>,
    pub timeout_ms: Option<u64>,
    pub poll_interval_us: Option<u64>,
    pub idle_gaps_per_copy: Option<u32>,
    pub verify_data: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BandwidthConfigInput {
    pub threshold_percent: Option<f64>,
    pub show_bandwidth_data: bool,
    pub unlocked: bool,
    pub skip_check: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DriftConfigInput {
    pub base_ppm: Option<f64>,
    pub low_power_percent: Option<f64>,
    pub fabric_percent: Option<f64>,
    pub thermal_slowdown_factor: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProtocolConfigInput {
    pub flit_bytes: Option<u32>,
    pub packet_bytes: Option<u32>,
    pub request_header_flits: Option<u32>,
    pub read_response_header_flits: Option<u32>,
    pub write_response_flits: Option<u32>,
    pub collapsed_response_count: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PowerConfigInput {
    pub toggle_interval_us: Option<u64>,
    pub hw_toggle_on_us: Option<u32>,
    pub hw_toggle_off_us: Option<u32>,
    pub prefer_hw_toggle: Option<bool>,
    pub join_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ThermalConfigInput {
    pub throttle_on_count: Option<u32>,
    pub throttle_off_count: Option<u32>,
    pub slowdown_period_us: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TrafficConfigInput {
    pub cpu_threads: Option<usize>,
    pub surface_bytes: Option<usize>,
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LpConfigInput {
    pub tolerance: Option<u64>,
    pub tolerance_percent: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CopyConfig {
    pub bytes_per_copy: u64,
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub idle_gaps_per_copy: u32,
    pub verify_data: bool,
}

impl Default for CopyConfig {
    fn default() -> Self {
        Self {
            bytes_per_copy: 64 * 1024 * 1024,
            timeout: Duration::from_millis(5000),
            poll_interval: Duration::from_micros(200),
            idle_gaps_per_copy: 0,
            verify_data: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BandwidthConfig {
    /// Lower bound as a percentage of expected bandwidth.
    pub threshold_percent: f64,
    pub show_bandwidth_data: bool,
    /// Diagnostic mode: below-expected passes are recorded instead of warned.
    pub unlocked: bool,
    pub skip_check: bool,
}

impl Default for BandwidthConfig {
    fn default() -> Self {
        Self {
            threshold_percent: 95.0,
            show_bandwidth_data: false,
            unlocked: false,
            skip_check: false,
        }
    }
}

/// Upper-bound allowances. These are calibration data for specific hardware,
/// so every one of them is configurable.
#[derive(Debug, Clone, PartialEq)]
pub struct DriftConfig {
    pub base_ppm: f64,
    pub low_power_percent: f64,
    pub fabric_percent: f64,
    /// Fraction of bandwidth lost while thermal slowdown is asserted.
    pub thermal_slowdown_factor: f64,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            base_ppm: 100.0,
            low_power_percent: 2.0,
            fabric_percent: 12.0,
            thermal_slowdown_factor: 0.5,
        }
    }
}

/// Flit-level protocol model used for packet efficiency.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolConfig {
    pub flit_bytes: u32,
    pub packet_bytes: u32,
    pub request_header_flits: u32,
    pub read_response_header_flits: u32,
    pub write_response_flits: u32,
    /// Responses batched into one flit when collapsing is supported.
    pub collapsed_response_count: u32,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            flit_bytes: 16,
            packet_bytes: 256,
            request_header_flits: 1,
            read_response_header_flits: 1,
            write_response_flits: 1,
            collapsed_response_count: 4,
        }
    }
}

/// Hardware toggle timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwToggleConfig {
    pub on_us: u32,
    pub off_us: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PowerConfig {
    /// Software toggle half-period. `None` disables power-state toggling.
    pub toggle_interval: Option<Duration>,
    pub hw_toggle: HwToggleConfig,
    pub prefer_hw_toggle: bool,
    pub join_timeout: Duration,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            toggle_interval: None,
            hw_toggle: HwToggleConfig {
                on_us: 100,
                off_us: 100,
            },
            prefer_hw_toggle: true,
            join_timeout: Duration::from_millis(1000),
        }
    }
}

impl PowerConfig {
    pub fn toggling(&self) -> bool {
        self.toggle_interval.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleConfig {
    pub on_count: u32,
    pub off_count: u32,
}

impl ThrottleConfig {
    /// Fraction of time the throttle is asserted.
    pub fn duty(&self) -> f64 {
        let total = self.on_count as f64 + self.off_count as f64;
        if total == 0.0 {
            0.0
        } else {
            self.on_count as f64 / total
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThermalConfig {
    pub throttling: Option<ThrottleConfig>,
    pub slowdown_period_us: Option<u32>,
}

impl ThermalConfig {
    pub fn enabled(&self) -> bool {
        self.throttling.is_some() || self.slowdown_period_us.is_some()
    }

    /// Duty cycle of thermal slowdown. The slowdown toggle asserts for half
    /// of each period.
    pub fn duty(&self) -> f64 {
        match (self.throttling, self.slowdown_period_us) {
            (Some(t), _) => t.duty(),
            (None, Some(_)) => 0.5,
            (None, None) => 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrafficConfig {
    pub cpu_threads: usize,
    pub surface_bytes: usize,
    pub seed: u64,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            cpu_threads: 0,
            surface_bytes: 1024 * 1024,
            seed: 0x5eed,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LpConfig {
    pub tolerance: u64,
    pub tolerance_percent: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestModeConfig {
    pub version: u32,
    pub copy: CopyConfig,
    pub bandwidth: BandwidthConfig,
    pub drift: DriftConfig,
    pub protocol: ProtocolConfig,
    pub power: PowerConfig,
    pub thermal: ThermalConfig,
    pub traffic: TrafficConfig,
    pub lp: LpConfig,
}

impl Default for TestModeConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            copy: CopyConfig::default(),
            bandwidth: BandwidthConfig::default(),
            drift: DriftConfig::default(),
            protocol: ProtocolConfig::default(),
            power: PowerConfig::default(),
            thermal: ThermalConfig::default(),
            traffic: TrafficConfig::default(),
            lp: LpConfig::default(),
        }
    }
}

impl TestModeConfigInput {
    pub fn resolve(self) -> Result<TestModeConfig, String> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(format!("Unsupported config version {}", version));
        }

        let copy_defaults = CopyConfig::default();
        let copy = CopyConfig {
            bytes_per_copy: self
                .copy
                .bytes_per_copy
                .unwrap_or(copy_defaults.bytes_per_copy)
                .max(1),
            timeout: self
                .copy
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(copy_defaults.timeout),
            poll_interval: self
                .copy
                .poll_interval_us
                .map(Duration::from_micros)
                .unwrap_or(copy_defaults.poll_interval),
            idle_gaps_per_copy: self.copy.idle_gaps_per_copy.unwrap_or(0),
            verify_data: self.copy.verify_data.unwrap_or(false),
        };

        let bandwidth = BandwidthConfig {
            threshold_percent: self
                .bandwidth
                .threshold_percent
                .unwrap_or(BandwidthConfig::default().threshold_percent)
                .clamp(1.0, 100.0),
            show_bandwidth_data: self.bandwidth.show_bandwidth_data,
            unlocked: self.bandwidth.unlocked,
            skip_check: self.bandwidth.skip_check,
        };

        let drift_defaults = DriftConfig::default();
        let drift = DriftConfig {
            base_ppm: self.drift.base_ppm.unwrap_or(drift_defaults.base_ppm),
            low_power_percent: self
                .drift
                .low_power_percent
                .unwrap_or(drift_defaults.low_power_percent),
            fabric_percent: self
                .drift
                .fabric_percent
                .unwrap_or(drift_defaults.fabric_percent),
            thermal_slowdown_factor: self
                .drift
                .thermal_slowdown_factor
                .unwrap_or(drift_defaults.thermal_slowdown_factor)
                .clamp(0.0, 1.0),
        };
        if drift.base_ppm < 0.0 || drift.low_power_percent < 0.0 || drift.fabric_percent < 0.0 {
            return Err("Drift allowances must be non-negative".to_string());
        }

        let proto_defaults = ProtocolConfig::default();
        let protocol = ProtocolConfig {
            flit_bytes: self
                .protocol
                .flit_bytes
                .unwrap_or(proto_defaults.flit_bytes),
            packet_bytes: self
                .protocol
                .packet_bytes
                .unwrap_or(proto_defaults.packet_bytes),
            request_header_flits: self
                .protocol
                .request_header_flits
                .unwrap_or(proto_defaults.request_header_flits),
            read_response_header_flits: self
                .protocol
                .read_response_header_flits
                .unwrap_or(proto_defaults.read_response_header_flits),
            write_response_flits: self
                .protocol
                .write_response_flits
                .unwrap_or(proto_defaults.write_response_flits),
            collapsed_response_count: self
                .protocol
                .collapsed_response_count
                .unwrap_or(proto_defaults.collapsed_response_count)
                .max(1),
        };
        if protocol.flit_bytes == 0 || protocol.packet_bytes < protocol.flit_bytes {
            return Err(format!(
                "Packet size {} must hold at least one {}-byte flit",
                protocol.packet_bytes, protocol.flit_bytes
            ));
        }

        let power_defaults = PowerConfig::default();
        let power = PowerConfig {
            toggle_interval: self
                .power
                .toggle_interval_us
                .filter(|&us| us > 0)
                .map(Duration::from_micros),
            hw_toggle: HwToggleConfig {
                on_us: self
                    .power
                    .hw_toggle_on_us
                    .unwrap_or(power_defaults.hw_toggle.on_us)
                    .max(1),
                off_us: self
                    .power
                    .hw_toggle_off_us
                    .unwrap_or(power_defaults.hw_toggle.off_us)
                    .max(1),
            },
            prefer_hw_toggle: self
                .power
                .prefer_hw_toggle
                .unwrap_or(power_defaults.prefer_hw_toggle),
            join_timeout: self
                .power
                .join_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(power_defaults.join_timeout),
        };

        let throttling = match (self.thermal.throttle_on_count, self.thermal.throttle_off_count) {
            (Some(on), Some(off)) if on + off > 0 => Some(ThrottleConfig {
                on_count: on,
                off_count: off,
            }),
            (None, None) => None,
            _ => {
                return Err(
                    "Thermal throttling needs both throttle_on_count and throttle_off_count"
                        .to_string(),
                );
            }
        };
        let thermal = ThermalConfig {
            throttling,
            slowdown_period_us: self.thermal.slowdown_period_us.filter(|&p| p > 0),
        };

        let traffic_defaults = TrafficConfig::default();
        let traffic = TrafficConfig {
            cpu_threads: self.traffic.cpu_threads.unwrap_or(0),
            surface_bytes: self
                .traffic
                .surface_bytes
                .unwrap_or(traffic_defaults.surface_bytes)
                .max(64),
            seed: self.traffic.seed.unwrap_or(traffic_defaults.seed),
        };

        let lp = LpConfig {
            tolerance: self.lp.tolerance.unwrap_or(0),
            tolerance_percent: self.lp.tolerance_percent.unwrap_or(0.0).max(0.0),
        };

        Ok(TestModeConfig {
            version,
            copy,
            bandwidth,
            drift,
            protocol,
            power,
            thermal,
            traffic,
            lp,
        })
    }
}

impl TestModeConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, String> {
        if input.trim().is_empty() {
            return Ok(TestModeConfig::default());
        }
        let parsed: TestModeConfigInput =
            toml::from_str(input).map_err(|e| format!("Invalid config TOML: {}", e))?;
        parsed.resolve()
    }

    /// Bandwidth lower bound as a fraction.
    pub fn threshold(&self) -> f64 {
        self.bandwidth.threshold_percent / 100.0
    }

    /// Whether any link power or thermal feature is active.
    pub fn power_features_enabled(&self) -> bool {
        self.power.toggling() || self.thermal.enabled() || self.copy.idle_gaps_per_copy > 0
    }
}
