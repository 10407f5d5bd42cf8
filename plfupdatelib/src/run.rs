use std::{
    fmt,
    ops::Deref,
    sync::atomic::{AtomicBool, Ordering},
};

use log::warn;

use crate::error::{CompletionCallback, RunOutcome, UpdaterError};

/// Running flag and completion callback shared by the runs of one worker.
pub(crate) struct RunState {
    running: AtomicBool,
    completion: Option<CompletionCallback>,
}

impl RunState {
    pub(crate) fn new(completion: Option<CompletionCallback>) -> Self {
        Self {
            running: AtomicBool::new(false),
            completion,
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Claim the worker for one run. Fails with [`UpdaterError::ThreadBusy`]
    /// if a run is already in progress.
    pub(crate) fn begin<S: Deref<Target = Self>>(state: S) -> Result<RunClaim<S>, UpdaterError> {
        state.running.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| UpdaterError::ThreadBusy)?;

        Ok(RunClaim {
            state,
            finished: false,
        })
    }

    fn end(&self, outcome: &RunOutcome) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(cb) = &self.completion {
            cb(outcome);
        }
    }
}

impl fmt::Debug for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunState")
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

/// A claimed run. The run ends exactly once: through [`Self::finish`], or on
/// drop if the run future was aborted, in which case it counts as cancelled.
pub(crate) struct RunClaim<S: Deref<Target = RunState>> {
    state: S,
    finished: bool,
}

impl<S: Deref<Target = RunState>> RunClaim<S> {
    pub(crate) fn finish(mut self, outcome: RunOutcome) -> RunOutcome {
        self.finished = true;
        self.state.end(&outcome);
        outcome
    }
}

impl<S: Deref<Target = RunState>> fmt::Debug for RunClaim<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunClaim")
            .field("state", &*self.state)
            .field("finished", &self.finished)
            .finish()
    }
}

impl<S: Deref<Target = RunState>> Drop for RunClaim<S> {
    fn drop(&mut self) {
        if !self.finished {
            warn!("Run was dropped before it finished");
            self.state.end(&RunOutcome::Cancelled);
        }
    }
}
