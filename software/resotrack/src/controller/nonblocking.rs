//! Drop-guards that run a task's exit sequence however its thread ends.
use std::sync::Arc;

use crossbeam::channel::Sender;
use tracing::{error, info, warn};

use resotrack_shared::SignalGenerator;

use super::{TaskEvent, Termination};

/// Drop-guard to guarantee that exactly one `Finished` event is sent
/// if the task exits its loop for any reason.
pub(super) struct FinishGuard<S> {
    task: &'static str,
    events: Sender<TaskEvent<S>>,
    termination: Option<Termination>,
}

impl<S> FinishGuard<S> {
    pub(super) fn new(task: &'static str, events: Sender<TaskEvent<S>>) -> Self {
        Self {
            task,
            events,
            termination: None,
        }
    }

    /// Record how the run ended; reported when the guard drops
    pub(super) fn finish(&mut self, termination: Termination) {
        self.termination = Some(termination);
    }
}

impl<S> Drop for FinishGuard<S> {
    fn drop(&mut self) {
        // No termination recorded means the thread is unwinding
        let termination = self
            .termination
            .take()
            .unwrap_or_else(|| Termination::Failed(format!("{} thread panicked", self.task)));
        match &termination {
            Termination::Failed(msg) => error!("{} failed: {msg}", self.task),
            other => info!("{} finished: {other:?}", self.task),
        }
        let _ = self.events.send(TaskEvent::Finished(termination));
    }
}

/// Drop-guard that de-energizes the generator output and then resets it
/// when a task that drives the generator exits for any reason.
pub(super) struct OutputGuard {
    generator: Arc<dyn SignalGenerator>,
}

impl OutputGuard {
    pub(super) fn new(generator: Arc<dyn SignalGenerator>) -> Self {
        Self { generator }
    }
}

impl Drop for OutputGuard {
    fn drop(&mut self) {
        let address = self.generator.address().to_owned();
        if let Err(e) = self.generator.set_output(false) {
            warn!("Could not disable output of {address}: {e}");
        }
        match self.generator.reset() {
            Ok(()) => info!("Output of {address} disabled and instrument reset"),
            Err(e) => warn!("Could not reset {address}: {e}"),
        }
    }
}
