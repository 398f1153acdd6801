//! # Active Test Registry
//!
//! Session-owned set of live test modes. Asynchronous hardware error
//! reports are broadcast through it to every registered test; nothing here
//! is process-global.
//!
//! Each test owns an [`AsyncErrorSink`]. The sink carries the test's
//! `in_cycle` flag, which doubles as the copy-cycle reentrancy guard: an
//! error that arrives while a cycle is in flight fails that cycle, one that
//! arrives between cycles is counted and logged only.

use crate::error::{Result, StressError};
use crate::topology::{DeviceId, LinkId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, warn};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AsyncErrorKind {
    Crc,
    Replay,
    Recovery,
    Fatal,
}

impl AsyncErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AsyncErrorKind::Crc => "crc",
            AsyncErrorKind::Replay => "replay",
            AsyncErrorKind::Recovery => "recovery",
            AsyncErrorKind::Fatal => "fatal",
        }
    }
}

impl fmt::Display for AsyncErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flat key for the asynchronous error tally.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ErrorCountKey {
    pub device: DeviceId,
    /// `None` for device-wide errors.
    pub link: Option<LinkId>,
    pub kind: AsyncErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncEvent {
    pub device: DeviceId,
    pub link: Option<LinkId>,
    pub kind: AsyncErrorKind,
    pub message: String,
}

/// Per-test receiver of broadcast errors.
#[derive(Debug, Default)]
pub struct AsyncErrorSink {
    in_cycle: AtomicBool,
    pending: Mutex<Vec<StressError>>,
    counts: Mutex<BTreeMap<ErrorCountKey, u64>>,
}

impl AsyncErrorSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Marks a copy cycle as in flight. Fails if one already is.
    pub fn enter_cycle(&self) -> Result<()> {
        self.in_cycle
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| StressError::Reentrant)
    }

    pub fn exit_cycle(&self) {
        self.in_cycle.store(false, Ordering::Release);
    }

    pub fn in_cycle(&self) -> bool {
        self.in_cycle.load(Ordering::Acquire)
    }

    pub fn deliver(&self, event: &AsyncEvent) {
        let key = ErrorCountKey {
            device: event.device,
            link: event.link,
            kind: event.kind,
        };
        *lock(&self.counts).entry(key).or_default() += 1;

        if self.in_cycle() {
            lock(&self.pending).push(StressError::AsyncError {
                device: event.device,
                message: format!("{}: {}", event.kind, event.message),
            });
        } else {
            warn!(
                "Async {} error on device {} outside a copy cycle: {}",
                event.kind, event.device, event.message
            );
        }
    }

    /// Drains errors received during the current cycle.
    pub fn take_pending(&self) -> Vec<StressError> {
        std::mem::take(&mut *lock(&self.pending))
    }

    pub fn error_count(&self, key: &ErrorCountKey) -> u64 {
        lock(&self.counts).get(key).copied().unwrap_or(0)
    }

    pub fn counts(&self) -> BTreeMap<ErrorCountKey, u64> {
        lock(&self.counts).clone()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Default)]
pub struct ActiveTestRegistry {
    next_id: AtomicU64,
    entries: Mutex<Vec<(u64, Weak<AsyncErrorSink>)>>,
}

impl ActiveTestRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Adds `sink`; it stays registered until the returned guard is dropped.
    pub fn register(self: &Arc<Self>, sink: &Arc<AsyncErrorSink>) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.entries).push((id, Arc::downgrade(sink)));
        debug!("Registered active test {}", id);
        Registration {
            registry: Arc::downgrade(self),
            id,
        }
    }

    /// Delivers `event` to every live test. Returns how many received it.
    pub fn broadcast(&self, event: &AsyncEvent) -> usize {
        let sinks: Vec<Arc<AsyncErrorSink>> = {
            let mut entries = lock(&self.entries);
            entries.retain(|(_, w)| w.strong_count() > 0);
            entries.iter().filter_map(|(_, w)| w.upgrade()).collect()
        };
        for sink in &sinks {
            sink.deliver(event);
        }
        sinks.len()
    }

    pub fn active(&self) -> usize {
        lock(&self.entries)
            .iter()
            .filter(|(_, w)| w.strong_count() > 0)
            .count()
    }

    fn deregister(&self, id: u64) {
        lock(&self.entries).retain(|(i, _)| *i != id);
        debug!("Deregistered active test {}", id);
    }
}

/// Removes its test from the registry on drop.
#[derive(Debug)]
pub struct Registration {
    registry: Weak<ActiveTestRegistry>,
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(reg) = self.registry.upgrade() {
            reg.deregister(self.id);
        }
    }
}
