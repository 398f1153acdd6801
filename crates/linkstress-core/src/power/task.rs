use crate::error::{Result, StressError};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Lifecycle of a background controller. Transitions are strictly forward
/// and never skip a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Running,
    StopRequested,
    Joined,
}

impl ControllerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControllerState::Idle => "idle",
            ControllerState::Running => "running",
            ControllerState::StopRequested => "stop_requested",
            ControllerState::Joined => "joined",
        }
    }
}

/// Cooperative stop signal handed to a background loop.
///
/// [`wait`](Self::wait) is the loop's suspension point: it sleeps for the
/// requested interval but wakes immediately when a stop is requested.
#[derive(Clone)]
pub struct StopSignal {
    running: Arc<AtomicBool>,
    wake: Receiver<()>,
}

impl StopSignal {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Sleeps up to `interval`. Returns `false` once a stop was requested.
    pub fn wait(&self, interval: Duration) -> bool {
        match self.wake.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => self.is_running(),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }
}

/// Result of joining a task. `late` is set when the task outlived the
/// bounded wait and had to be joined after the deadline.
#[derive(Debug)]
pub struct Joined<T> {
    pub value: T,
    pub late: Option<StressError>,
}

/// A named background thread with an atomic running flag and a bounded join.
///
/// Dropping an unjoined task stops and joins it, so a task is never leaked.
pub struct BackgroundTask<T> {
    name: String,
    state: ControllerState,
    running: Arc<AtomicBool>,
    wake_tx: Option<Sender<()>>,
    done_rx: Receiver<()>,
    handle: Option<thread::JoinHandle<T>>,
}

impl<T: Send + 'static> BackgroundTask<T> {
    pub fn spawn<F>(name: &str, body: F) -> Result<Self>
    where
        F: FnOnce(StopSignal) -> T + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let (wake_tx, wake_rx) = bounded::<()>(0);
        let (done_tx, done_rx) = bounded::<()>(1);
        let signal = StopSignal {
            running: running.clone(),
            wake: wake_rx,
        };

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let out = body(signal);
                let _ = done_tx.send(());
                out
            })
            .map_err(|e| StressError::Setup(format!("failed to spawn {}: {}", name, e)))?;

        debug!("{} started", name);
        Ok(Self {
            name: name.to_string(),
            state: ControllerState::Running,
            running,
            wake_tx: Some(wake_tx),
            done_rx,
            handle: Some(handle),
        })
    }
}

impl<T> BackgroundTask<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Clears the running flag and wakes the loop. Idempotent.
    pub fn request_stop(&mut self) {
        if self.state == ControllerState::Running {
            self.running.store(false, Ordering::Release);
            // Disconnecting the wake channel interrupts any pending wait.
            self.wake_tx.take();
            self.state = ControllerState::StopRequested;
        }
    }

    /// Stops the task and joins it, waiting at most `timeout` before
    /// reporting it late. The thread is joined either way.
    pub fn stop(&mut self, timeout: Duration) -> Result<Joined<T>> {
        self.request_stop();
        let handle = self.handle.take().ok_or_else(|| {
            StressError::Setup(format!("{} already joined", self.name))
        })?;

        let late = match self.done_rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => None,
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "{} still running {} ms after stop; joining anyway",
                    self.name,
                    timeout.as_millis()
                );
                Some(StressError::ThreadJoin {
                    what: self.name.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        };

        let value = handle.join().map_err(|_| {
            StressError::Collaborator(anyhow::anyhow!("{} panicked", self.name))
        });
        self.state = ControllerState::Joined;
        debug!("{} joined", self.name);
        Ok(Joined { value: value?, late })
    }
}

impl<T> Drop for BackgroundTask<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.request_stop();
            let _ = handle.join();
            self.state = ControllerState::Joined;
        }
    }
}
