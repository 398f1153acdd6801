//! Sub-link power-state toggling.
//!
//! Software mode runs a loop that alternates each target link between full
//! bandwidth and low power every `interval`, counting every low-power entry
//! it requested. Hardware mode programs the link's toggle generator and
//! estimates the entry count from elapsed time.

use super::task::{BackgroundTask, ControllerState, StopSignal};
use crate::error::{Result, StickyError, StressError};
use crate::lp_counter::{LpCounterKey, LpExpectation, hw_toggle_expected};
use crate::topology::{PowerStateControl, SubLinkPowerState};
use quanta::Instant;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A link the controller drives.
#[derive(Clone)]
pub struct ToggleTarget {
    pub key: LpCounterKey,
    pub control: Arc<dyn PowerStateControl>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleMode {
    /// Half-period of the software loop.
    Software { interval: Duration },
    Hardware { on_us: u32, off_us: u32 },
}

/// Expected low-power entries per link, produced when the controller stops.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToggleOutcome {
    pub expected: BTreeMap<LpCounterKey, LpExpectation>,
    pub elapsed: Duration,
}

pub struct PowerStateToggle {
    mode: ToggleMode,
    targets: Vec<ToggleTarget>,
    join_timeout: Duration,
    state: ControllerState,
    started_at: Option<Instant>,
    /// Indices of targets whose hardware generator was started.
    hw_started: Vec<usize>,
    task: Option<BackgroundTask<BTreeMap<LpCounterKey, u64>>>,
}

impl PowerStateToggle {
    pub fn new(mode: ToggleMode, targets: Vec<ToggleTarget>, join_timeout: Duration) -> Self {
        Self {
            mode,
            targets,
            join_timeout,
            state: ControllerState::Idle,
            started_at: None,
            hw_started: Vec::new(),
            task: None,
        }
    }

    /// Picks hardware mode when preferred and every target supports it.
    pub fn select_mode(
        targets: &[ToggleTarget],
        interval: Duration,
        prefer_hw: bool,
        on_us: u32,
        off_us: u32,
    ) -> ToggleMode {
        let hw_capable =
            !targets.is_empty() && targets.iter().all(|t| t.control.supports_lp_hw_toggle());
        if prefer_hw && hw_capable {
            ToggleMode::Hardware { on_us, off_us }
        } else {
            ToggleMode::Software { interval }
        }
    }

    pub fn mode(&self) -> ToggleMode {
        self.mode
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn targets(&self) -> &[ToggleTarget] {
        &self.targets
    }

    /// Starts toggling. In hardware mode a link that refuses is skipped: the
    /// controller still runs on the others, and the error is returned after
    /// all of them were tried so `stop` restores every started link.
    pub fn start(&mut self) -> Result<()> {
        if self.state != ControllerState::Idle {
            return Err(StressError::Setup(format!(
                "power toggle cannot start from {}",
                self.state.as_str()
            )));
        }
        if self.targets.is_empty() {
            warn!("No power-state capable links; power toggle is a no-op");
        }
        let mut refused = StickyError::new();
        match self.mode {
            ToggleMode::Hardware { on_us, off_us } => {
                for (idx, t) in self.targets.iter().enumerate() {
                    match t.control.start_power_state_toggle(t.key.link, on_us, off_us) {
                        Ok(()) => self.hw_started.push(idx),
                        Err(e) => refused.record(StressError::Collaborator(e.context(format!(
                            "starting hw toggle on device {} link {}",
                            t.key.device, t.key.link
                        )))),
                    }
                }
                info!(
                    "Hardware power toggle started on {} of {} links (on={}us off={}us)",
                    self.hw_started.len(),
                    self.targets.len(),
                    on_us,
                    off_us
                );
            }
            ToggleMode::Software { interval } => {
                let targets = self.targets.clone();
                self.task = Some(BackgroundTask::spawn("lp-toggle", move |signal| {
                    software_toggle_loop(&targets, interval, &signal)
                })?);
                info!(
                    "Software power toggle started on {} links (interval={}us)",
                    self.targets.len(),
                    interval.as_micros()
                );
            }
        }
        self.started_at = Some(Instant::now());
        self.state = ControllerState::Running;
        refused.into_result()
    }

    /// Stops toggling, restores full bandwidth, and reports how many entries
    /// each link should have seen. Errors from the corrective requests are
    /// accumulated; the controller always ends up joined.
    pub fn stop(&mut self) -> (ToggleOutcome, Result<()>) {
        let mut sticky = StickyError::new();
        let mut outcome = ToggleOutcome::default();
        if self.state != ControllerState::Running {
            return (outcome, Ok(()));
        }
        self.state = ControllerState::StopRequested;
        outcome.elapsed = self.started_at.map(|t| t.elapsed()).unwrap_or_default();

        match self.mode {
            ToggleMode::Hardware { on_us, off_us } => {
                let started = std::mem::take(&mut self.hw_started);
                for &idx in &started {
                    sticky.check(force_full_bandwidth(&self.targets[idx]));
                }
                let elapsed_us = outcome.elapsed.as_micros() as u64;
                let expected = hw_toggle_expected(elapsed_us, on_us, off_us);
                for idx in started {
                    outcome
                        .expected
                        .insert(self.targets[idx].key, LpExpectation::Range { expected });
                }
            }
            ToggleMode::Software { .. } => {
                if let Some(mut task) = self.task.take() {
                    match task.stop(self.join_timeout) {
                        Ok(joined) => {
                            if let Some(late) = joined.late {
                                sticky.record(late);
                            }
                            for (key, expected) in joined.value {
                                outcome.expected.insert(key, LpExpectation::Range { expected });
                            }
                        }
                        Err(e) => sticky.record(e),
                    }
                }
            }
        }
        self.state = ControllerState::Joined;
        debug!(
            "Power toggle stopped after {} ms",
            outcome.elapsed.as_millis()
        );
        (outcome, sticky.into_result())
    }
}

impl Drop for PowerStateToggle {
    fn drop(&mut self) {
        if self.state == ControllerState::Running {
            let (_, result) = self.stop();
            if let Err(e) = result {
                warn!("Power toggle stop on drop failed: {}", e);
            }
        }
    }
}

fn force_full_bandwidth(t: &ToggleTarget) -> Result<()> {
    t.control
        .request_power_state(t.key.link, SubLinkPowerState::FullBandwidth, true)
        .map_err(|e| {
            StressError::Collaborator(e.context(format!(
                "restoring full bandwidth on device {} link {}",
                t.key.device, t.key.link
            )))
        })
}

fn software_toggle_loop(
    targets: &[ToggleTarget],
    interval: Duration,
    signal: &StopSignal,
) -> BTreeMap<LpCounterKey, u64> {
    let mut entries: BTreeMap<LpCounterKey, u64> = targets.iter().map(|t| (t.key, 0)).collect();

    while signal.is_running() {
        for t in targets {
            match t
                .control
                .request_power_state(t.key.link, SubLinkPowerState::LowPower, false)
            {
                Ok(()) => *entries.entry(t.key).or_default() += 1,
                Err(e) => warn!(
                    "Low-power request failed device={} link={}: {}",
                    t.key.device, t.key.link, e
                ),
            }
        }
        if !signal.wait(interval) {
            break;
        }
        for t in targets {
            if let Err(e) =
                t.control
                    .request_power_state(t.key.link, SubLinkPowerState::FullBandwidth, false)
            {
                warn!(
                    "Full-bandwidth request failed device={} link={}: {}",
                    t.key.device, t.key.link, e
                );
            }
        }
        if !signal.wait(interval) {
            break;
        }
    }

    for t in targets {
        if let Err(e) = force_full_bandwidth(t) {
            warn!("{}", e);
        }
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{DeviceId, LinkId};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingPower {
        hw: bool,
        refuse_hw: Option<LinkId>,
        requests: Mutex<Vec<(LinkId, SubLinkPowerState)>>,
        hw_started: Mutex<Vec<(LinkId, u32, u32)>>,
    }

    impl PowerStateControl for RecordingPower {
        fn request_power_state(
            &self,
            link: LinkId,
            state: SubLinkPowerState,
            _wait: bool,
        ) -> anyhow::Result<()> {
            self.requests.lock().unwrap().push((link, state));
            Ok(())
        }
        fn power_state_status(&self, link: LinkId) -> anyhow::Result<SubLinkPowerState> {
            Ok(self
                .requests
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|(l, _)| *l == link)
                .map(|(_, s)| *s)
                .unwrap_or_default())
        }
        fn supports_lp_hw_toggle(&self) -> bool {
            self.hw
        }
        fn start_power_state_toggle(&self, link: LinkId, on: u32, off: u32) -> anyhow::Result<()> {
            if self.refuse_hw == Some(link) {
                anyhow::bail!("toggle generator busy on link {}", link);
            }
            self.hw_started.lock().unwrap().push((link, on, off));
            Ok(())
        }
    }

    fn target(ctrl: &Arc<RecordingPower>, link: u32) -> ToggleTarget {
        ToggleTarget {
            key: LpCounterKey {
                device: DeviceId(0),
                link: LinkId(link),
            },
            control: ctrl.clone(),
        }
    }

    #[test]
    fn software_loop_counts_entries_and_restores_full_bandwidth() {
        let ctrl = Arc::new(RecordingPower::default());
        let targets = vec![target(&ctrl, 0), target(&ctrl, 1)];
        let mut toggle = PowerStateToggle::new(
            ToggleMode::Software {
                interval: Duration::from_millis(2),
            },
            targets,
            Duration::from_secs(2),
        );
        toggle.start().unwrap();
        assert_eq!(toggle.state(), ControllerState::Running);
        std::thread::sleep(Duration::from_millis(30));
        let (outcome, result) = toggle.stop();
        result.unwrap();
        assert_eq!(toggle.state(), ControllerState::Joined);

        let low_requests = ctrl
            .requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, s)| *s == SubLinkPowerState::LowPower)
            .count() as u64;
        let counted: u64 = outcome
            .expected
            .values()
            .map(|e| match e {
                LpExpectation::Range { expected } => *expected,
                LpExpectation::AtLeast { minimum } => *minimum,
            })
            .sum();
        assert!(counted > 0);
        assert_eq!(counted, low_requests);
        for link in [LinkId(0), LinkId(1)] {
            assert_eq!(
                ctrl.power_state_status(link).unwrap(),
                SubLinkPowerState::FullBandwidth
            );
        }
    }

    #[test]
    fn hardware_mode_estimates_from_elapsed_time() {
        let ctrl = Arc::new(RecordingPower {
            hw: true,
            ..Default::default()
        });
        let targets = vec![target(&ctrl, 3)];
        let mode = PowerStateToggle::select_mode(&targets, Duration::from_millis(1), true, 50, 50);
        assert_eq!(mode, ToggleMode::Hardware { on_us: 50, off_us: 50 });
        let mut toggle = PowerStateToggle::new(mode, targets, Duration::from_secs(1));
        toggle.start().unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let (outcome, result) = toggle.stop();
        result.unwrap();

        assert_eq!(ctrl.hw_started.lock().unwrap().as_slice(), &[(LinkId(3), 50, 50)]);
        let key = LpCounterKey {
            device: DeviceId(0),
            link: LinkId(3),
        };
        let LpExpectation::Range { expected } = outcome.expected[&key] else {
            panic!("hardware toggle uses range semantics");
        };
        let period_us = 100;
        assert!(expected >= 5_000 / period_us);
        assert_eq!(
            ctrl.requests.lock().unwrap().last().copied(),
            Some((LinkId(3), SubLinkPowerState::FullBandwidth))
        );
    }

    #[test]
    fn refused_hw_link_leaves_started_links_restorable() {
        let ctrl = Arc::new(RecordingPower {
            hw: true,
            refuse_hw: Some(LinkId(1)),
            ..Default::default()
        });
        let targets = vec![target(&ctrl, 0), target(&ctrl, 1)];
        let mut toggle = PowerStateToggle::new(
            ToggleMode::Hardware { on_us: 10, off_us: 10 },
            targets,
            Duration::from_secs(1),
        );
        assert!(toggle.start().is_err());
        assert_eq!(toggle.state(), ControllerState::Running);

        let (outcome, result) = toggle.stop();
        result.unwrap();
        assert_eq!(toggle.state(), ControllerState::Joined);
        assert_eq!(
            ctrl.requests.lock().unwrap().as_slice(),
            &[(LinkId(0), SubLinkPowerState::FullBandwidth)]
        );
        let links: Vec<LinkId> = outcome.expected.keys().map(|k| k.link).collect();
        assert_eq!(links, vec![LinkId(0)]);
    }

    #[test]
    fn select_mode_falls_back_to_software() {
        let ctrl = Arc::new(RecordingPower::default());
        let targets = vec![target(&ctrl, 0)];
        let interval = Duration::from_micros(250);
        assert_eq!(
            PowerStateToggle::select_mode(&targets, interval, true, 1, 1),
            ToggleMode::Software { interval }
        );
        assert_eq!(
            PowerStateToggle::select_mode(&[], interval, true, 1, 1),
            ToggleMode::Software { interval }
        );
    }

    #[test]
    fn stop_without_start_is_noop() {
        let mut toggle = PowerStateToggle::new(
            ToggleMode::Software {
                interval: Duration::from_millis(1),
            },
            Vec::new(),
            Duration::from_secs(1),
        );
        let (outcome, result) = toggle.stop();
        assert!(result.is_ok());
        assert!(outcome.expected.is_empty());
        assert_eq!(toggle.state(), ControllerState::Idle);
    }

    #[test]
    fn restart_after_join_is_rejected() {
        let mut toggle = PowerStateToggle::new(
            ToggleMode::Software {
                interval: Duration::from_millis(1),
            },
            Vec::new(),
            Duration::from_secs(1),
        );
        toggle.start().unwrap();
        let _ = toggle.stop();
        assert!(toggle.start().is_err());
    }
}
