//! # Low-Power Entry Counters
//!
//! One counter per (device, link) whose link can report power transitions.
//! A baseline is snapshotted when resources are acquired; each poll adds the
//! hardware delta since the previous read. Overflow is sticky: once a
//! counter has overflowed its value is meaningless.

use crate::error::StressError;
use crate::topology::{DeviceId, LinkId, LpCounterControl};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct LpCounterKey {
    pub device: DeviceId,
    pub link: LinkId,
}

/// Cumulative low-power entries seen on one link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LpCounter {
    pub key: LpCounterKey,
    /// Raw hardware value at the last read.
    pub last_raw: u64,
    /// Entries accumulated since the baseline.
    pub count: u64,
    pub overflowed: bool,
}

struct Entry {
    counter: LpCounter,
    control: Arc<dyn LpCounterControl>,
}

/// Registry of LP counters for the links under test.
///
/// Insertion and removal take the registry lock; a poll reads hardware
/// outside the lock and merges the deltas afterwards.
#[derive(Default)]
pub struct LpCounterRegistry {
    entries: Mutex<BTreeMap<LpCounterKey, Entry>>,
}

impl LpCounterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears the hardware counter and records its baseline.
    pub fn insert_baseline(
        &self,
        key: LpCounterKey,
        control: Arc<dyn LpCounterControl>,
    ) -> anyhow::Result<()> {
        control.clear_lp_counts(key.link)?;
        let baseline = control.lp_entry_or_exit_count(key.link, true)?;
        let counter = LpCounter {
            key,
            last_raw: baseline.count,
            count: 0,
            overflowed: baseline.overflowed,
        };
        debug!(
            "LP baseline device={} link={} raw={}",
            key.device, key.link, baseline.count
        );
        self.lock().insert(key, Entry { counter, control });
        Ok(())
    }

    pub fn remove(&self, key: &LpCounterKey) -> bool {
        self.lock().remove(key).is_some()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains(&self, key: &LpCounterKey) -> bool {
        self.lock().contains_key(key)
    }

    /// Reads every counter and accumulates the delta since the last read.
    /// A read failure is reported for that link only.
    pub fn poll(&self) -> Vec<StressError> {
        let targets: Vec<(LpCounterKey, Arc<dyn LpCounterControl>)> = self
            .lock()
            .iter()
            .map(|(k, e)| (*k, e.control.clone()))
            .collect();

        let mut reads = Vec::with_capacity(targets.len());
        let mut errors = Vec::new();
        for (key, control) in targets {
            match control.lp_entry_or_exit_count(key.link, true) {
                Ok(raw) => reads.push((key, raw)),
                Err(e) => {
                    warn!(
                        "LP count read failed device={} link={}: {}",
                        key.device, key.link, e
                    );
                    errors.push(StressError::Collaborator(e.context(format!(
                        "reading LP count on device {} link {}",
                        key.device, key.link
                    ))));
                }
            }
        }

        let mut entries = self.lock();
        for (key, raw) in reads {
            let Some(entry) = entries.get_mut(&key) else {
                continue;
            };
            let c = &mut entry.counter;
            if raw.overflowed || raw.count < c.last_raw {
                c.overflowed = true;
            } else {
                c.count += raw.count - c.last_raw;
            }
            c.last_raw = raw.count;
        }
        errors
    }

    pub fn snapshot(&self) -> Vec<LpCounter> {
        self.lock().values().map(|e| e.counter).collect()
    }

    pub fn get(&self, key: &LpCounterKey) -> Option<LpCounter> {
        self.lock().get(key).map(|e| e.counter)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<LpCounterKey, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// What a link's counter is checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum LpExpectation {
    /// Toggling: the count must land within tolerance of `expected`.
    Range { expected: u64 },
    /// Idle insertion: links must have entered low power at least this often.
    AtLeast { minimum: u64 },
}

/// Expected entries for a hardware toggle generator running for `elapsed_us`.
pub fn hw_toggle_expected(elapsed_us: u64, on_us: u32, off_us: u32) -> u64 {
    let period = on_us as u64 + off_us as u64;
    if period == 0 { 0 } else { elapsed_us / period }
}

/// Checks one counter. Overflow fails regardless of value.
pub fn evaluate(
    counter: &LpCounter,
    expectation: LpExpectation,
    tolerance: u64,
    tolerance_percent: f64,
) -> Result<(), StressError> {
    let key = counter.key;
    if counter.overflowed {
        return Err(StressError::CounterOverflow {
            device: key.device,
            link: key.link,
        });
    }
    match expectation {
        LpExpectation::Range { expected } => {
            let pct_slack = (expected as f64 * tolerance_percent / 100.0).ceil() as u64;
            // One extra for an interval that was cut short by the stop.
            let slack = tolerance.max(pct_slack) + 1;
            if counter.count.abs_diff(expected) > slack {
                return Err(StressError::LpCount {
                    device: key.device,
                    link: key.link,
                    expected,
                    actual: counter.count,
                });
            }
        }
        LpExpectation::AtLeast { minimum } => {
            if counter.count.saturating_add(tolerance) < minimum {
                return Err(StressError::LpCount {
                    device: key.device,
                    link: key.link,
                    expected: minimum,
                    actual: counter.count,
                });
            }
        }
    }
    Ok(())
}
