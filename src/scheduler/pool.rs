//! Runs of one pipeline.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::Rid;
use super::run::{Run, RunSpec, RunStatus};
use super::scheduler::SchedulerContext;
use crate::error::SchedulerError;
use crate::notifier::RunInfo;
use crate::protocol::Expid;
use crate::worker::Worker;

/// The pool's "state changed" condition.
///
/// Stages mark the current version seen, inspect the pool, and wait for
/// the next version if nothing was eligible. Every notify bumps the version,
/// so a change between inspecting and waiting is never lost.
#[derive(Debug, Clone)]
pub struct StateChanged(Arc<watch::Sender<u64>>);

impl StateChanged {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self(Arc::new(tx))
    }

    pub fn notify(&self) {
        self.0.send_modify(|version| *version = version.wrapping_add(1));
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.0.subscribe()
    }
}

impl Default for StateChanged {
    fn default() -> Self {
        Self::new()
    }
}

/// `RID → Run` for one pipeline. Membership changes only through
/// [`submit`](Self::submit) and [`delete`](Self::delete).
pub struct RunPool {
    pipeline_name: String,
    runs: RwLock<BTreeMap<Rid, Arc<Run>>>,
    state_changed: StateChanged,
    ctx: Arc<SchedulerContext>,
}

/// A submission whose revision is checked out and whose RID is issued.
///
/// Preparing may wait on the repository and the RID cache, so it happens
/// before the submission is bound to a pipeline.
#[derive(Debug)]
pub struct Submission {
    rid: Rid,
    expid: Expid,
    wd: Option<PathBuf>,
    repo_rev: Option<String>,
    repo_msg: Option<String>,
    priority: i32,
    due_date: Option<DateTime<Utc>>,
    flush: bool,
}

impl Submission {
    /// Resolve the revision and issue a RID.
    ///
    /// `expid.repo_rev == Some(None)` is resolved to the repository head;
    /// every repository run holds a checkout reference until deleted.
    pub async fn prepare(
        ctx: &SchedulerContext,
        mut expid: Expid,
        priority: i32,
        due_date: Option<DateTime<Utc>>,
        flush: bool,
    ) -> Result<Self, SchedulerError> {
        let (wd, repo_rev, repo_msg) = match expid.repo_rev.clone() {
            None => (None, None, None),
            Some(rev) => {
                let rev = match rev {
                    Some(rev) => rev,
                    None => ctx.repository.head().await?,
                };
                let checkout = ctx.repository.request_rev(&rev).await?;
                expid.repo_rev = Some(Some(rev.clone()));
                (Some(checkout.wd), Some(rev), checkout.message)
            }
        };
        let rid = ctx.rids.issue().await;
        Ok(Self {
            rid,
            expid,
            wd,
            repo_rev,
            repo_msg,
            priority,
            due_date,
            flush,
        })
    }

    /// Drop a submission that was never admitted, returning its checkout.
    pub async fn abandon(self, ctx: &SchedulerContext) {
        if let Some(rev) = &self.repo_rev {
            ctx.repository.release_rev(rev).await;
        }
        debug!(rid = self.rid, "submission abandoned");
    }
}

#[derive(Serialize)]
struct SubmissionRecord<'a> {
    rid: Rid,
    time: DateTime<Utc>,
    pipeline: &'a str,
    expid: &'a Expid,
    priority: i32,
    due_date: Option<DateTime<Utc>>,
    flush: bool,
}

impl RunPool {
    pub fn new(pipeline_name: impl Into<String>, ctx: Arc<SchedulerContext>) -> Self {
        Self {
            pipeline_name: pipeline_name.into(),
            runs: RwLock::new(BTreeMap::new()),
            state_changed: StateChanged::new(),
            ctx,
        }
    }

    pub fn pipeline_name(&self) -> &str {
        &self.pipeline_name
    }

    pub fn state_changed(&self) -> &StateChanged {
        &self.state_changed
    }

    /// Publish a prepared submission as a `pending` run of this pool.
    pub async fn admit(&self, submission: Submission) -> Arc<Run> {
        let Submission {
            rid,
            expid,
            wd,
            repo_rev,
            repo_msg,
            priority,
            due_date,
            flush,
        } = submission;
        let info = RunInfo {
            pipeline: self.pipeline_name.clone(),
            expid: expid.clone(),
            priority,
            due_date,
            flush,
            status: RunStatus::Pending,
            repo_msg,
        };
        let spec = RunSpec {
            rid,
            pipeline_name: self.pipeline_name.clone(),
            wd,
            expid,
            priority,
            due_date,
            flush,
            repo_rev,
        };

        let worker = Worker::new(self.ctx.config.worker.clone(), self.ctx.handlers.clone());
        let run = Arc::new(Run::new(
            spec,
            worker,
            self.ctx.config.worker.clone(),
            self.ctx.notifier.clone(),
            self.state_changed.clone(),
        ));

        self.ctx.notifier.insert(rid, info).await;
        self.write_runs().insert(rid, run.clone());
        self.state_changed.notify();

        info!(rid, pipeline = %self.pipeline_name, priority, flush, "run submitted");
        run
    }

    /// Close the run's worker, release its revision and drop it. Unknown
    /// RIDs are ignored.
    pub async fn delete(&self, rid: Rid) {
        let Some(run) = self.get(rid) else {
            return;
        };
        run.close().await;
        if let Some(rev) = run.repo_rev() {
            self.ctx.repository.release_rev(rev).await;
        }
        self.write_runs().remove(&rid);
        self.state_changed.notify();
        debug!(rid, pipeline = %self.pipeline_name, "run removed from pool");
    }

    pub fn get(&self, rid: Rid) -> Option<Arc<Run>> {
        self.read_runs().get(&rid).cloned()
    }

    pub fn contains(&self, rid: Rid) -> bool {
        self.read_runs().contains_key(&rid)
    }

    /// Runs in RID order.
    pub fn runs(&self) -> Vec<Arc<Run>> {
        self.read_runs().values().cloned().collect()
    }

    pub fn rids(&self) -> Vec<Rid> {
        self.read_runs().keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.read_runs().is_empty()
    }

    fn read_runs(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<Rid, Arc<Run>>> {
        self.runs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_runs(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<Rid, Arc<Run>>> {
        self.runs.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append the run to the submission log, if one is configured.
    pub async fn log_submission(&self, run: &Run) {
        let Some(path) = self.ctx.config.submission_log.as_ref() else {
            return;
        };
        let record = SubmissionRecord {
            rid: run.rid(),
            time: Utc::now(),
            pipeline: &self.pipeline_name,
            expid: run.expid(),
            priority: run.priority(),
            due_date: run.due_date(),
            flush: run.flush(),
        };
        if let Err(e) = append_json_line(path, &record).await {
            warn!(rid = run.rid(), path = %path.display(), error = %e, "failed to append submission log");
        }
    }
}

async fn append_json_line(path: &Path, record: &impl Serialize) -> std::io::Result<()> {
    let mut line = serde_json::to_string(record)?;
    line.push('\n');
    let mut file = OpenOptions::new().create(true).append(true).open(path).await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await
}
