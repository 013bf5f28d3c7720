//! A scheduled run and its status state machine.

use std::cmp::Reverse;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::Rid;
use super::pool::StateChanged;
use crate::config::WorkerConfig;
use crate::error::WorkerError;
use crate::notifier::Notifier;
use crate::protocol::Expid;
use crate::worker::{CloseSignal, RunOutcome, Worker};

/// Where a run is in its pipeline.
///
/// ```text
/// pending → [flushing →] preparing → prepare_done → running ⇄ paused
///         → run_done → analyzing → deleting
/// ```
/// Any state may move to `deleting`, which is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Flushing,
    Preparing,
    PrepareDone,
    Running,
    Paused,
    RunDone,
    Analyzing,
    Deleting,
}

impl RunStatus {
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::*;
        match (self, next) {
            (Deleting, _) => false,
            (_, Deleting) => true,
            (Pending, Flushing | Preparing) => true,
            (Flushing, Preparing) => true,
            (Preparing, PrepareDone) => true,
            (PrepareDone, Running) => true,
            (Running, Paused | RunDone) => true,
            (Paused, Running) => true,
            (RunDone, Analyzing) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Flushing => "flushing",
            Self::Preparing => "preparing",
            Self::PrepareDone => "prepare_done",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::RunDone => "run_done",
            Self::Analyzing => "analyzing",
            Self::Deleting => "deleting",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Comparable priority: higher priority, then earlier due date, then older RID.
pub type PriorityKey = (i32, Reverse<i64>, Reverse<Rid>);

#[derive(Debug)]
struct RunState {
    status: RunStatus,
    termination_requested: bool,
}

/// Submission parameters of a run.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub rid: Rid,
    pub pipeline_name: String,
    pub wd: Option<PathBuf>,
    pub expid: Expid,
    pub priority: i32,
    pub due_date: Option<DateTime<Utc>>,
    pub flush: bool,
    /// Repository revision this run holds a reference on.
    pub repo_rev: Option<String>,
}

/// A worker plus its scheduling metadata.
///
/// Status is mutated only by the stage currently driving the run (and by
/// the deleter). Worker calls go through wrappers that turn every call made
/// after [`close`](Self::close) into a silent completion.
pub struct Run {
    spec: RunSpec,
    state: Mutex<RunState>,
    worker: tokio::sync::Mutex<Worker>,
    closer: CloseSignal,
    config: WorkerConfig,
    notifier: Arc<Notifier>,
    state_changed: StateChanged,
}

impl Run {
    pub(crate) fn new(
        spec: RunSpec,
        worker: Worker,
        config: WorkerConfig,
        notifier: Arc<Notifier>,
        state_changed: StateChanged,
    ) -> Self {
        Self {
            spec,
            state: Mutex::new(RunState {
                status: RunStatus::Pending,
                termination_requested: false,
            }),
            closer: worker.close_signal(),
            worker: tokio::sync::Mutex::new(worker),
            config,
            notifier,
            state_changed,
        }
    }

    pub fn rid(&self) -> Rid {
        self.spec.rid
    }

    pub fn pipeline_name(&self) -> &str {
        &self.spec.pipeline_name
    }

    pub fn expid(&self) -> &Expid {
        &self.spec.expid
    }

    pub fn priority(&self) -> i32 {
        self.spec.priority
    }

    pub fn due_date(&self) -> Option<DateTime<Utc>> {
        self.spec.due_date
    }

    pub fn flush(&self) -> bool {
        self.spec.flush
    }

    pub(crate) fn repo_rev(&self) -> Option<&str> {
        self.spec.repo_rev.as_deref()
    }

    fn lock_state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> RunStatus {
        self.lock_state().status
    }

    /// Move to `status`, publish the change and wake the pool's stages.
    ///
    /// Returns `false` (and changes nothing) for a transition the state
    /// machine does not allow, e.g. a stage finishing a run that was
    /// meanwhile marked for deletion.
    pub async fn set_status(&self, status: RunStatus) -> bool {
        {
            let mut state = self.lock_state();
            if !state.status.can_transition_to(status) {
                debug!(rid = self.rid(), from = %state.status, to = %status, "ignoring status transition");
                return false;
            }
            state.status = status;
        }
        if !self.closer.is_closed() {
            self.notifier.set_status(self.rid(), status).await;
        }
        self.state_changed.notify();
        true
    }

    pub fn termination_requested(&self) -> bool {
        self.lock_state().termination_requested
    }

    pub fn request_termination(&self) {
        self.lock_state().termination_requested = true;
    }

    /// Read and clear the flag, so a request arriving during the next resume
    /// is delivered on the one after.
    pub(crate) fn take_termination_request(&self) -> bool {
        std::mem::take(&mut self.lock_state().termination_requested)
    }

    pub fn priority_key(&self) -> PriorityKey {
        let due = self
            .spec
            .due_date
            .map(|d| d.timestamp_micros())
            .unwrap_or(0);
        (self.spec.priority, Reverse(due), Reverse(self.spec.rid))
    }

    pub fn is_runnable(&self, now: DateTime<Utc>) -> bool {
        self.spec.due_date.is_none_or(|due| due <= now)
    }

    /// Runnable runs first, then by priority key.
    pub fn scheduling_key(&self, now: DateTime<Utc>) -> (bool, PriorityKey) {
        (self.is_runnable(now), self.priority_key())
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_closed()
    }

    /// Resolves once the run's worker starts closing.
    pub async fn closed(&self) {
        self.closer.closed().await
    }

    pub async fn build(&self) -> Result<(), WorkerError> {
        if self.closer.is_closed() {
            return Ok(());
        }
        let mut worker = self.worker.lock().await;
        if self.closer.is_closed() {
            return Ok(());
        }
        let result = worker
            .build(
                self.spec.rid,
                &self.spec.pipeline_name,
                self.spec.wd.as_deref(),
                &self.spec.expid,
                self.spec.priority,
                self.config.build_timeout,
            )
            .await;
        self.unless_closed(result, ())
    }

    pub async fn prepare(&self) -> Result<(), WorkerError> {
        if self.closer.is_closed() {
            return Ok(());
        }
        let mut worker = self.worker.lock().await;
        let result = worker.prepare().await;
        self.unless_closed(result, ())
    }

    pub async fn run(&self) -> Result<RunOutcome, WorkerError> {
        if self.closer.is_closed() {
            return Ok(RunOutcome::Completed);
        }
        let mut worker = self.worker.lock().await;
        let result = worker.run().await;
        self.unless_closed(result, RunOutcome::Completed)
    }

    pub async fn resume(&self, terminate: bool) -> Result<RunOutcome, WorkerError> {
        if self.closer.is_closed() {
            return Ok(RunOutcome::Completed);
        }
        let mut worker = self.worker.lock().await;
        let result = worker.resume(terminate).await;
        self.unless_closed(result, RunOutcome::Completed)
    }

    pub async fn analyze(&self) -> Result<(), WorkerError> {
        if self.closer.is_closed() {
            return Ok(());
        }
        let mut worker = self.worker.lock().await;
        let result = worker.analyze().await;
        self.unless_closed(result, ())
    }

    pub async fn write_results(&self) -> Result<(), WorkerError> {
        if self.closer.is_closed() {
            return Ok(());
        }
        let mut worker = self.worker.lock().await;
        let result = worker
            .write_results(self.config.write_results_timeout)
            .await;
        self.unless_closed(result, ())
    }

    /// Tear down the worker and withdraw the run from the published table.
    pub async fn close(&self) {
        // Interrupts whichever stage holds the worker lock.
        self.closer.close();
        {
            let mut worker = self.worker.lock().await;
            worker.close(self.config.term_timeout).await;
        }
        self.notifier.remove(self.rid()).await;
        debug!(rid = self.rid(), "run closed");
    }

    fn unless_closed<T>(&self, result: Result<T, WorkerError>, fallback: T) -> Result<T, WorkerError> {
        match result {
            Err(e) if self.closer.is_closed() => {
                debug!(rid = self.rid(), error = %e, "suppressed worker error after close");
                Ok(fallback)
            }
            other => other,
        }
    }
}
