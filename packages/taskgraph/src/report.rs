//! Periodic progress reporting.

use std::{
    sync::{Arc, Condvar, Mutex},
    thread::{self, JoinHandle},
    time::Duration,
};

use tracing::info;

use crate::task::TaskState;

/// Per-state task counts at one instant.
#[derive(Clone, Copy, Default, Debug)]
pub(crate) struct StateCounts {
    pub pending: usize,
    pub ready: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl StateCounts {
    pub(crate) fn tally(states: impl IntoIterator<Item = TaskState>) -> Self {
        let mut counts = StateCounts::default();
        for state in states {
            match state {
                TaskState::Pending => counts.pending += 1,
                TaskState::Ready => counts.ready += 1,
                TaskState::Running => counts.running += 1,
                TaskState::Succeeded => counts.succeeded += 1,
                TaskState::Failed => counts.failed += 1,
                TaskState::Skipped => counts.skipped += 1,
            }
        }
        counts
    }
}

/// Emits a progress record every `interval` until stopped.
///
/// The reporter thread holds no locks between snapshots; the snapshot
/// closure is expected to take (and release) whatever lock guards the task
/// list.
pub(crate) struct Reporter {
    signal: Arc<StopSignal>,
    handle: Option<JoinHandle<()>>,
}

impl Reporter {
    pub(crate) fn start(
        interval: Duration,
        snapshot: impl Fn() -> StateCounts + Send + 'static,
    ) -> Self {
        let signal = StopSignal::new();
        let handle = thread::Builder::new()
            .name("taskgraph-reporter".to_owned())
            .spawn({
                let signal = signal.clone();
                move || {
                    loop {
                        if signal.wait_timeout(interval) {
                            break;
                        }
                        let counts = snapshot();
                        info!(
                            pending = counts.pending,
                            ready = counts.ready,
                            running = counts.running,
                            succeeded = counts.succeeded,
                            failed = counts.failed,
                            skipped = counts.skipped,
                            "task graph progress"
                        );
                    }
                }
            })
            .expect("spawn reporter thread");
        Reporter {
            signal,
            handle: Some(handle),
        }
    }

    /// Stop the reporter and wait for it to exit. Idempotent.
    pub(crate) fn shutdown(&mut self) {
        self.signal.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Reporter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A simple signal for stopping a thread using a condition variable.
pub(crate) struct StopSignal {
    stopped: Mutex<bool>,
    condvar: Condvar,
}

impl StopSignal {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            stopped: Mutex::new(false),
            condvar: Condvar::new(),
        })
    }

    /// Wait for the signal or timeout. Returns true if signaled to stop.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        let stopped = self.stopped.lock().expect("mutex is poisoned");
        if *stopped {
            return true;
        }
        let (stop, _) = self
            .condvar
            .wait_timeout(stopped, timeout)
            .expect("mutex is poisoned");
        *stop
    }

    /// Whether the signal has fired, without waiting.
    pub(crate) fn stopped(&self) -> bool {
        *self.stopped.lock().expect("mutex is poisoned")
    }

    /// Signal waiting threads to stop.
    pub(crate) fn stop(&self) {
        let mut stopped = self.stopped.lock().expect("mutex is poisoned");
        *stopped = true;
        self.condvar.notify_all();
    }
}
