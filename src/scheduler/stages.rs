//! The three stage tasks of a pipeline.
//!
//! Each stage loops: inspect the pool, drive the best eligible run through
//! its stage, or wait on the pool's state-changed signal. A failure is
//! logged once and the run goes to the deleter; the stage itself keeps
//! going.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error};

use super::deleter::Deleter;
use super::pool::RunPool;
use super::run::{Run, RunStatus};
use crate::error::WorkerError;
use crate::worker::RunOutcome;

/// What the prepare stage should do next.
pub(crate) enum PrepareSelection {
    Ready(Arc<Run>),
    /// Nothing eligible now; the earliest relevant due date is this far away.
    Sleep(Duration),
    /// Nothing eligible until the pool changes.
    Idle,
}

/// Best pending run, unless an already prepared run outranks it.
///
/// Not-yet-due runs are never selected; if one of them would take
/// precedence once due, the stage sleeps until then.
pub(crate) fn select_for_prepare(runs: &[Arc<Run>], now: DateTime<Utc>) -> PrepareSelection {
    let prepared_max = runs
        .iter()
        .filter(|r| r.status() == RunStatus::PrepareDone)
        .map(|r| r.priority_key())
        .max();
    let takes_precedence = |r: &Run| prepared_max.is_none_or(|max| r.priority_key() > max);

    let pending: Vec<&Arc<Run>> = runs
        .iter()
        .filter(|r| r.status() == RunStatus::Pending)
        .collect();

    let candidate = pending
        .iter()
        .filter(|r| r.is_runnable(now))
        .max_by_key(|r| r.priority_key());
    if let Some(candidate) = candidate {
        if takes_precedence(candidate) {
            return PrepareSelection::Ready(Arc::clone(candidate));
        }
    }

    pending
        .iter()
        .filter(|r| !r.is_runnable(now) && takes_precedence(r))
        .filter_map(|r| r.due_date())
        .map(|due| (due - now).to_std().unwrap_or_default())
        .min()
        .map_or(PrepareSelection::Idle, PrepareSelection::Sleep)
}

/// Highest-key run in `status`.
pub(crate) fn top_with_status(runs: &[Arc<Run>], status: RunStatus) -> Option<Arc<Run>> {
    runs.iter()
        .filter(|r| r.status() == status)
        .max_by_key(|r| r.priority_key())
        .cloned()
}

fn log_failure(stage: &str, run: &Run, error: &WorkerError) {
    if error.is_internal() {
        // Already reported by the experiment itself.
        debug!(rid = run.rid(), stage, error = %error, "experiment failed, deleting run");
    } else {
        error!(rid = run.rid(), stage, error = %error, "worker failed, deleting run");
    }
}

/// `false` when the pool is gone.
async fn wait_for_change(changed: &mut watch::Receiver<u64>) -> bool {
    changed.changed().await.is_ok()
}

pub(crate) async fn prepare_stage(pool: Arc<RunPool>, deleter: Deleter) {
    let mut changed = pool.state_changed().subscribe();
    loop {
        changed.borrow_and_update();
        let run = match select_for_prepare(&pool.runs(), Utc::now()) {
            PrepareSelection::Idle => {
                if !wait_for_change(&mut changed).await {
                    return;
                }
                continue;
            }
            PrepareSelection::Sleep(delay) => {
                debug!(pipeline = %pool.pipeline_name(), ?delay, "waiting for due date");
                if let Ok(Err(_)) = tokio::time::timeout(delay, changed.changed()).await {
                    return;
                }
                continue;
            }
            PrepareSelection::Ready(run) => run,
        };

        if run.flush() && !wait_for_flush(&pool, &run, &mut changed).await {
            continue;
        }
        if !run.set_status(RunStatus::Preparing).await {
            continue;
        }

        let result = async {
            run.build().await?;
            run.prepare().await
        }
        .await;
        match result {
            Ok(()) => {
                run.set_status(RunStatus::PrepareDone).await;
            }
            Err(e) => {
                log_failure("prepare", &run, &e);
                deleter.delete(run.rid()).await;
            }
        }
    }
}

/// Hold a flush run in `flushing` until no other run of equal or higher
/// priority is between `pending` and `deleting`. `false` if the run was
/// closed meanwhile.
async fn wait_for_flush(pool: &RunPool, run: &Arc<Run>, changed: &mut watch::Receiver<u64>) -> bool {
    if !run.set_status(RunStatus::Flushing).await {
        return false;
    }
    loop {
        changed.borrow_and_update();
        if run.is_closed() {
            return false;
        }
        let blocked = pool.runs().iter().any(|other| {
            !Arc::ptr_eq(other, run)
                && other.priority() >= run.priority()
                && !matches!(other.status(), RunStatus::Pending | RunStatus::Deleting)
        });
        if !blocked {
            return true;
        }
        tokio::select! {
            result = changed.changed() => {
                if result.is_err() {
                    return false;
                }
            }
            _ = run.closed() => return false,
        }
    }
}

/// Runs prepared runs, preempting cooperatively.
///
/// `stack` holds paused runs, most recently preempted on top. A prepared
/// run that outranks the top is started first; otherwise the top resumes.
pub(crate) async fn run_stage(pool: Arc<RunPool>, deleter: Deleter) {
    let mut changed = pool.state_changed().subscribe();
    let mut stack: Vec<Arc<Run>> = Vec::new();
    loop {
        changed.borrow_and_update();
        // Runs deleted while paused are dropped.
        stack.retain(|r| r.status() == RunStatus::Paused);

        let next = top_with_status(&pool.runs(), RunStatus::PrepareDone);
        let preempt = match (stack.last(), &next) {
            (Some(top), Some(next)) => next.priority_key() > top.priority_key(),
            (Some(_), None) => false,
            (None, _) => true,
        };
        let run = if preempt {
            match next {
                Some(next) => next,
                None => {
                    if !wait_for_change(&mut changed).await {
                        return;
                    }
                    continue;
                }
            }
        } else {
            match stack.pop() {
                Some(top) => top,
                None => continue,
            }
        };

        let resuming = run.status() == RunStatus::Paused;
        if !run.set_status(RunStatus::Running).await {
            continue;
        }
        let outcome = if resuming {
            run.resume(run.take_termination_request()).await
        } else {
            run.run().await
        };

        match outcome {
            Ok(RunOutcome::Completed) => {
                run.set_status(RunStatus::RunDone).await;
            }
            Ok(RunOutcome::Paused) => {
                if run.set_status(RunStatus::Paused).await {
                    stack.push(run);
                }
            }
            Err(e) => {
                log_failure("run", &run, &e);
                deleter.delete(run.rid()).await;
            }
        }
    }
}

/// Analyzes finished runs, writes their results and hands them to the
/// deleter whatever the outcome.
pub(crate) async fn analyze_stage(pool: Arc<RunPool>, deleter: Deleter) {
    let mut changed = pool.state_changed().subscribe();
    loop {
        changed.borrow_and_update();
        let Some(run) = top_with_status(&pool.runs(), RunStatus::RunDone) else {
            if !wait_for_change(&mut changed).await {
                return;
            }
            continue;
        };
        if !run.set_status(RunStatus::Analyzing).await {
            continue;
        }

        // Results are still written after an experiment-side analysis
        // failure; a broken worker gets no further requests.
        let writable = match run.analyze().await {
            Ok(()) => true,
            Err(e) => {
                log_failure("analyze", &run, &e);
                e.is_internal()
            }
        };
        if writable {
            if let Err(e) = run.write_results().await {
                log_failure("write_results", &run, &e);
            }
        }
        deleter.delete(run.rid()).await;
    }
}
