//! Thermal throttling and the thermal slowdown toggle.

use super::task::{BackgroundTask, ControllerState};
use crate::error::{Result, StickyError, StressError};
use crate::topology::{DeviceId, ThermalControl};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long the slowdown task parks between running-flag checks.
const SLOWDOWN_PARK: Duration = Duration::from_millis(50);

#[derive(Clone)]
pub struct ThermalTarget {
    pub device: DeviceId,
    pub control: Arc<dyn ThermalControl>,
}

/// Hardware duty-cycle throttling. Programmed once per cycle; no thread.
pub struct ThermalThrottle {
    targets: Vec<ThermalTarget>,
    on_count: u32,
    off_count: u32,
    state: ControllerState,
    started: Vec<usize>,
}

impl ThermalThrottle {
    pub fn new(targets: Vec<ThermalTarget>, on_count: u32, off_count: u32) -> Self {
        Self {
            targets,
            on_count,
            off_count,
            state: ControllerState::Idle,
            started: Vec::new(),
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Starts throttling on every target. A device that refuses is skipped
    /// and the error is returned after the rest have been started.
    pub fn start(&mut self) -> Result<()> {
        if self.state != ControllerState::Idle {
            return Err(StressError::Setup(format!(
                "thermal throttle cannot start from {}",
                self.state.as_str()
            )));
        }
        if self.targets.is_empty() {
            warn!("No thermal-capable devices; throttling is a no-op");
        }
        let mut sticky = StickyError::new();
        for (idx, t) in self.targets.iter().enumerate() {
            match t.control.start_thermal_throttling(self.on_count, self.off_count) {
                Ok(()) => self.started.push(idx),
                Err(e) => sticky.record(StressError::Collaborator(
                    e.context(format!("starting thermal throttling on device {}", t.device)),
                )),
            }
        }
        self.state = ControllerState::Running;
        info!(
            "Thermal throttling on={} off={} started on {} devices",
            self.on_count,
            self.off_count,
            self.started.len()
        );
        sticky.into_result()
    }

    /// Stops throttling on every device it was started on.
    pub fn stop(&mut self) -> Result<()> {
        if self.state != ControllerState::Running {
            return Ok(());
        }
        self.state = ControllerState::StopRequested;
        let mut sticky = StickyError::new();
        for idx in self.started.drain(..) {
            let t = &self.targets[idx];
            if let Err(e) = t.control.stop_thermal_throttling() {
                sticky.record(StressError::Collaborator(
                    e.context(format!("stopping thermal throttling on device {}", t.device)),
                ));
            }
        }
        self.state = ControllerState::Joined;
        debug!("Thermal throttling stopped");
        sticky.into_result()
    }
}

impl Drop for ThermalThrottle {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Thermal throttle stop on drop failed: {}", e);
        }
    }
}

/// Periodic slowdown toggle. Requested once, then held by a background task
/// until stopped; the task deasserts the slowdown on its way out.
pub struct ThermalSlowdown {
    targets: Vec<ThermalTarget>,
    period_us: u32,
    join_timeout: Duration,
    state: ControllerState,
    task: Option<BackgroundTask<Result<()>>>,
}

impl ThermalSlowdown {
    pub fn new(targets: Vec<ThermalTarget>, period_us: u32, join_timeout: Duration) -> Self {
        Self {
            targets,
            period_us,
            join_timeout,
            state: ControllerState::Idle,
            task: None,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn start(&mut self) -> Result<()> {
        if self.state != ControllerState::Idle {
            return Err(StressError::Setup(format!(
                "thermal slowdown cannot start from {}",
                self.state.as_str()
            )));
        }
        if self.targets.is_empty() {
            warn!("No thermal-capable devices; slowdown toggle is a no-op");
        }
        let targets = self.targets.clone();
        let period_us = self.period_us;
        self.task = Some(BackgroundTask::spawn("thermal-slowdown", move |signal| {
            let mut sticky = StickyError::new();
            let mut asserted = Vec::with_capacity(targets.len());
            for t in &targets {
                match t.control.start_thermal_slowdown(period_us) {
                    Ok(()) => asserted.push(t),
                    Err(e) => sticky.record(StressError::Collaborator(
                        e.context(format!("starting thermal slowdown on device {}", t.device)),
                    )),
                }
            }
            while signal.wait(SLOWDOWN_PARK) {}
            for t in asserted {
                if let Err(e) = t.control.stop_thermal_slowdown() {
                    sticky.record(StressError::Collaborator(
                        e.context(format!("stopping thermal slowdown on device {}", t.device)),
                    ));
                }
            }
            sticky.into_result()
        })?);
        self.state = ControllerState::Running;
        info!(
            "Thermal slowdown period={}us started on {} devices",
            self.period_us,
            self.targets.len()
        );
        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        if self.state != ControllerState::Running {
            return Ok(());
        }
        self.state = ControllerState::StopRequested;
        let mut sticky = StickyError::new();
        if let Some(mut task) = self.task.take() {
            match task.stop(self.join_timeout) {
                Ok(joined) => {
                    if let Some(late) = joined.late {
                        sticky.record(late);
                    }
                    sticky.check(joined.value);
                }
                Err(e) => sticky.record(e),
            }
        }
        self.state = ControllerState::Joined;
        sticky.into_result()
    }
}

impl Drop for ThermalSlowdown {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Thermal slowdown stop on drop failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeThermal {
        log: Mutex<Vec<&'static str>>,
        refuse: bool,
    }

    impl ThermalControl for FakeThermal {
        fn start_thermal_throttling(&self, _on: u32, _off: u32) -> anyhow::Result<()> {
            if self.refuse {
                anyhow::bail!("not supported");
            }
            self.log.lock().unwrap().push("throttle-start");
            Ok(())
        }
        fn stop_thermal_throttling(&self) -> anyhow::Result<()> {
            self.log.lock().unwrap().push("throttle-stop");
            Ok(())
        }
        fn start_thermal_slowdown(&self, _period_us: u32) -> anyhow::Result<()> {
            self.log.lock().unwrap().push("slowdown-start");
            Ok(())
        }
        fn stop_thermal_slowdown(&self) -> anyhow::Result<()> {
            self.log.lock().unwrap().push("slowdown-stop");
            Ok(())
        }
    }

    fn target(ctrl: &Arc<FakeThermal>, device: u32) -> ThermalTarget {
        ThermalTarget {
            device: DeviceId(device),
            control: ctrl.clone(),
        }
    }

    #[test]
    fn throttle_start_stop_pairs() {
        let ctrl = Arc::new(FakeThermal::default());
        let mut throttle = ThermalThrottle::new(vec![target(&ctrl, 0)], 1, 3);
        throttle.start().unwrap();
        assert_eq!(throttle.state(), ControllerState::Running);
        throttle.stop().unwrap();
        throttle.stop().unwrap();
        assert_eq!(throttle.state(), ControllerState::Joined);
        assert_eq!(
            ctrl.log.lock().unwrap().as_slice(),
            &["throttle-start", "throttle-stop"]
        );
    }

    #[test]
    fn refused_device_is_not_stopped() {
        let good = Arc::new(FakeThermal::default());
        let bad = Arc::new(FakeThermal {
            refuse: true,
            ..Default::default()
        });
        let mut throttle = ThermalThrottle::new(vec![target(&bad, 1), target(&good, 0)], 1, 1);
        assert!(throttle.start().is_err());
        throttle.stop().unwrap();
        assert!(bad.log.lock().unwrap().is_empty());
        assert_eq!(good.log.lock().unwrap().len(), 2);
    }

    #[test]
    fn slowdown_is_deasserted_on_stop() {
        let ctrl = Arc::new(FakeThermal::default());
        let mut slowdown =
            ThermalSlowdown::new(vec![target(&ctrl, 0)], 1000, Duration::from_secs(2));
        slowdown.start().unwrap();
        std::thread::sleep(Duration::from_millis(5));
        slowdown.stop().unwrap();
        assert_eq!(slowdown.state(), ControllerState::Joined);
        assert_eq!(
            ctrl.log.lock().unwrap().as_slice(),
            &["slowdown-start", "slowdown-stop"]
        );
    }

    #[test]
    fn dropping_running_slowdown_joins() {
        let ctrl = Arc::new(FakeThermal::default());
        let mut slowdown =
            ThermalSlowdown::new(vec![target(&ctrl, 0)], 1000, Duration::from_secs(2));
        slowdown.start().unwrap();
        drop(slowdown);
        assert_eq!(ctrl.log.lock().unwrap().last(), Some(&"slowdown-stop"));
    }
}
