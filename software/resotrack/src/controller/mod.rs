//! Long-running measurement tasks and the plumbing they share.
//!
//! Each task runs its loop on a dedicated thread, reports progress through
//! a channel of [`TaskEvent`]s, and is stopped cooperatively.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use crossbeam::channel::{Receiver, Sender, unbounded};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub mod context;
mod nonblocking;
mod recorder;
mod sweep;
pub mod timing;
mod tracking;

pub use context::RunCtx;
pub use recorder::{
    Acquisition, DataRecorder, Fields, RecordSample, RecorderConfig, TickReport,
};
pub use sweep::{FrequencySweeper, SweepConfig, SweepRun, SweepSample};
pub use tracking::{FrequencyTracker, TrackingConfig, TrackingLoop, TrackingSample};

/// Notification from a running task.
///
/// Every run ends with exactly one `Finished`.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent<S> {
    /// Human-readable progress message
    Status(String),

    /// A new sample was collected
    Sample(S),

    /// Steps completed out of the planned total
    Progress { done: usize, total: usize },

    /// Seconds since the run started
    Elapsed(f64),

    /// A problem that did not by itself end the run
    Error(String),

    Finished(Termination),
}

/// Why a run ended
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Termination {
    /// Ran to its planned end
    Completed,

    /// Stopped on request
    Stopped,

    Failed(String),
}

/// Lifecycle of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    Running,

    /// Stop requested, loop not yet exited
    Stopping,
}

/// Handle to a task thread with a shared stop signal.
pub(crate) struct RunHandle {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl RunHandle {
    /// Write to shared stop signal, indicating that the
    /// thread should exit.
    pub(crate) fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Check if the thread is still running.
    pub(crate) fn is_running(&self) -> bool {
        self.join
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Wait for the thread to finish running.
    pub(crate) fn join(&mut self) -> Result<()> {
        match self.join.take() {
            Some(h) => h.join().map_err(|_| Error::Panicked),
            None => Ok(()),
        }
    }
}

impl Drop for RunHandle {
    /// Make sure to stop the thread when we exit to avoid leaking resources.
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

/// Event channel and thread handle common to every task
pub(crate) struct TaskCore<S> {
    name: &'static str,
    tx: Sender<TaskEvent<S>>,
    rx: Receiver<TaskEvent<S>>,
    handle: Option<RunHandle>,
}

impl<S: Send + 'static> TaskCore<S> {
    pub(crate) fn new(name: &'static str) -> Self {
        let (tx, rx) = unbounded();
        Self {
            name,
            tx,
            rx,
            handle: None,
        }
    }

    pub(crate) fn events(&self) -> Receiver<TaskEvent<S>> {
        self.rx.clone()
    }

    pub(crate) fn sender(&self) -> Sender<TaskEvent<S>> {
        self.tx.clone()
    }

    pub(crate) fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(RunHandle::is_running)
    }

    pub(crate) fn state(&self) -> TaskState {
        match &self.handle {
            Some(h) if h.is_running() && h.stop_requested() => TaskState::Stopping,
            Some(h) if h.is_running() => TaskState::Running,
            _ => TaskState::Idle,
        }
    }

    /// Fail if a run is in progress, and reap the thread of a finished one
    pub(crate) fn ensure_idle(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(Error::AlreadyRunning);
        }
        if let Some(mut h) = self.handle.take() {
            h.join()?;
        }
        Ok(())
    }

    /// Run `body` on a new thread. `body` receives the stop signal.
    pub(crate) fn spawn(
        &mut self,
        body: impl FnOnce(Arc<AtomicBool>) + Send + 'static,
    ) -> Result<()> {
        self.ensure_idle()?;
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let join = std::thread::Builder::new()
            .name(self.name.to_string())
            .spawn(move || body(thread_stop))?;
        self.handle = Some(RunHandle {
            stop,
            join: Some(join),
        });
        Ok(())
    }

    /// Request a stop. Does nothing when idle.
    pub(crate) fn stop(&self) {
        if let Some(h) = &self.handle {
            h.stop();
        }
    }

    /// Wait for the current run, if any, to exit.
    pub(crate) fn join(&mut self) -> Result<()> {
        match self.handle.take() {
            Some(mut h) => h.join(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::nonblocking::FinishGuard;
    use super::*;

    #[test]
    fn lifecycle() {
        let mut core = TaskCore::<u32>::new("test-task");
        let events = core.events();

        // Idle stop and join are no-ops
        core.stop();
        core.join().unwrap();
        assert_eq!(core.state(), TaskState::Idle);

        let tx = core.sender();
        core.spawn(move |stop| {
            let mut finish = FinishGuard::new("test-task", tx.clone());
            while !stop.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(1));
            }
            finish.finish(Termination::Stopped);
        })
        .unwrap();
        assert!(matches!(core.spawn(|_| ()), Err(Error::AlreadyRunning)));

        core.stop();
        core.join().unwrap();
        assert!(!core.is_running());

        let finished: Vec<_> = events
            .try_iter()
            .filter(|e| matches!(e, TaskEvent::Finished(_)))
            .collect();
        assert_eq!(finished, [TaskEvent::Finished(Termination::Stopped)]);

        // Can run again once finished
        core.spawn(|_| ()).unwrap();
        core.join().unwrap();
    }

    #[test]
    fn panic_is_reported_once() {
        let mut core = TaskCore::<u32>::new("test-task");
        let events = core.events();
        let tx = core.sender();
        core.spawn(move |_| {
            let _finish = FinishGuard::new("test-task", tx);
            panic!("boom");
        })
        .unwrap();
        assert!(matches!(core.join(), Err(Error::Panicked)));

        let all: Vec<_> = events.try_iter().collect();
        assert_eq!(all.len(), 1);
        assert!(matches!(&all[0], TaskEvent::Finished(Termination::Failed(_))));
    }
}
