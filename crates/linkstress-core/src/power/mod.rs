//! # Power and Thermal Controllers
//!
//! Background control loops that run alongside the copy traffic. Every
//! controller walks `Idle → Running → StopRequested → Joined` and performs
//! its corrective action (full bandwidth, deassert slowdown) before it is
//! reported joined.

pub mod task;
pub mod thermal;
pub mod toggle;

pub use task::{BackgroundTask, ControllerState, Joined, StopSignal};
pub use thermal::{ThermalSlowdown, ThermalTarget, ThermalThrottle};
pub use toggle::{PowerStateToggle, ToggleMode, ToggleOutcome, ToggleTarget};
