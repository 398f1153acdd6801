//! Error taxonomy for a test mode.
//!
//! Fatal setup failures abort the mode. Everything else is collected: poll
//! timeouts, bandwidth and LP-count mismatches, and counter overflows are
//! reported per route or per link, and checking continues.

use crate::topology::{DeviceId, Direction, LinkId, RouteId};
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum StressError {
    #[error("setup failed: {0}")]
    Setup(String),
    #[error("timed out after {elapsed_ms} ms waiting for {what}")]
    Timeout { what: String, elapsed_ms: u64 },
    #[error("bandwidth {kind} on route {route} {direction}: measured {measured:.3} GB/s, window [{minimum:.3}, {maximum:.3}] GB/s")]
    Bandwidth {
        route: RouteId,
        direction: Direction,
        kind: &'static str,
        measured: f64,
        minimum: f64,
        maximum: f64,
    },
    #[error("low-power count mismatch on device {device} link {link}: expected {expected}, got {actual}")]
    LpCount {
        device: DeviceId,
        link: LinkId,
        expected: u64,
        actual: u64,
    },
    #[error("low-power counter overflowed on device {device} link {link}")]
    CounterOverflow { device: DeviceId, link: LinkId },
    #[error("{what} did not exit within {timeout_ms} ms")]
    ThreadJoin { what: String, timeout_ms: u64 },
    #[error("copy cycle already in progress")]
    Reentrant,
    #[error("asynchronous error on device {device}: {message}")]
    AsyncError { device: DeviceId, message: String },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Collaborator(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, StressError>;

impl StressError {
    /// Fatal errors abort the mode instead of being accumulated.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StressError::Setup(_) | StressError::Config(_))
    }
}

/// First-error-wins accumulator.
///
/// Keeps the first error as the overall result; later errors are logged and
/// counted so every failing route or link is still reported.
#[derive(Debug, Default)]
pub struct StickyError {
    first: Option<StressError>,
    count: usize,
}

impl StickyError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, err: StressError) {
        self.count += 1;
        if self.first.is_none() {
            self.first = Some(err);
        } else {
            error!("additional failure: {}", err);
        }
    }

    /// Records the error side of `result`, passing any value through.
    pub fn check<T>(&mut self, result: Result<T>) -> Option<T> {
        match result {
            Ok(v) => Some(v),
            Err(e) => {
                self.record(e);
                None
            }
        }
    }

    pub fn is_err(&self) -> bool {
        self.first.is_some()
    }

    /// Number of errors recorded, including the first.
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn into_result(self) -> Result<()> {
        match self.first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
