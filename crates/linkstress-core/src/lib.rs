//! # linkstress-core
//!
//! Stress engine for point-to-point interconnect links. Drives copy traffic on
//! many routes at once, toggles link power states while the traffic flows, and
//! verifies measured throughput and low-power transition counts against an
//! analytical model.
//!
//! ## Crate structure
//!
//! - [`topology`]: Routes, connections, and the collaborator traits the engine consumes
//! - [`direction`]: Per-direction resources, CPU traffic threads, and byte/time counters
//! - [`calc`]: Packet efficiency, fabric ceilings, and tolerance windows
//! - [`power`]: Background power-state and thermal controllers
//! - [`lp_counter`]: Low-power entry counter registry
//! - [`orchestrator`]: The test mode: acquire, copy, check, release
//! - [`registry`]: Session-owned registry of active test modes
//! - [`config`]: TOML configuration
//! - [`stats`]: Serializable result snapshots
//! - [`error`]: Error taxonomy

pub mod calc;
pub mod config;
pub mod direction;
pub mod error;
pub mod lp_counter;
pub mod orchestrator;
pub mod power;
pub mod registry;
pub mod stats;
pub mod topology;

pub use error::{Result, StressError};
pub use orchestrator::TestMode;
