//! Scheduler facade: named pipelines plus the deleter.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::Rid;
use super::deleter::{Deleter, Pipelines};
use super::handlers::MasterHandlers;
use super::pipeline::Pipeline;
use super::pool::{RunPool, Submission};
use super::run::{Run, RunStatus};
use crate::config::SchedulerConfig;
use crate::datasets::DatasetDb;
use crate::error::SchedulerError;
use crate::notifier::{Modification, Notifier, RunInfo};
use crate::protocol::Expid;
use crate::repository::ExperimentRepo;
use crate::rid::RidCounter;
use crate::worker::WorkerHandlers;

/// Everything a pool needs from its scheduler, passed down explicitly.
pub struct SchedulerContext {
    pub config: SchedulerConfig,
    pub notifier: Arc<Notifier>,
    pub rids: RidCounter,
    pub repository: Arc<ExperimentRepo>,
    /// Serves requests from every worker the scheduler spawns.
    pub handlers: Arc<dyn WorkerHandlers>,
}

impl SchedulerContext {
    pub fn new(
        config: SchedulerConfig,
        repository: Arc<ExperimentRepo>,
        handlers: Arc<dyn WorkerHandlers>,
    ) -> Self {
        let rids = RidCounter::open(&config.rid_cache, &config.results_dir);
        Self {
            config,
            notifier: Arc::new(Notifier::new()),
            rids,
            repository,
            handlers,
        }
    }
}

/// External collaborators of the scheduler.
pub struct SchedulerDeps {
    pub repository: Arc<ExperimentRepo>,
    pub datasets: Arc<DatasetDb>,
}

pub(super) struct Inner {
    ctx: Arc<SchedulerContext>,
    pipelines: Pipelines,
    deleter: Deleter,
    deleter_task: Mutex<Option<JoinHandle<()>>>,
    terminated: AtomicBool,
}

/// Externally callable scheduler. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    pub(super) inner: Arc<Inner>,
}

impl Scheduler {
    /// Start the deleter; pipelines are created on first submission.
    pub fn start(config: SchedulerConfig, deps: SchedulerDeps) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let handlers = Arc::new(MasterHandlers::new(weak.clone(), deps.datasets));
            let ctx = Arc::new(SchedulerContext::new(config, deps.repository, handlers));
            let pipelines = Pipelines::default();
            let (deleter, deleter_task) = Deleter::start(pipelines.clone());
            Inner {
                ctx,
                pipelines,
                deleter,
                deleter_task: Mutex::new(Some(deleter_task)),
                terminated: AtomicBool::new(false),
            }
        });
        info!(next_rid = inner.ctx.rids.peek(), "scheduler started");
        Self { inner }
    }

    /// Queue a run; creates the pipeline on first use.
    pub async fn submit(
        &self,
        pipeline_name: &str,
        expid: Expid,
        priority: i32,
        due_date: Option<DateTime<Utc>>,
        flush: bool,
    ) -> Result<Rid, SchedulerError> {
        if self.inner.terminated.load(Ordering::SeqCst) {
            return Err(SchedulerError::Terminated);
        }

        let submission =
            Submission::prepare(&self.inner.ctx, expid, priority, due_date, flush).await?;

        // Held from lookup to insertion so garbage collection cannot retire
        // the pipeline in between.
        let mut pipelines = self.inner.pipelines.write().await;
        if self.inner.terminated.load(Ordering::SeqCst) {
            drop(pipelines);
            submission.abandon(&self.inner.ctx).await;
            return Err(SchedulerError::Terminated);
        }
        let pool = pipelines
            .entry(pipeline_name.to_string())
            .or_insert_with(|| {
                debug!(pipeline = pipeline_name, "creating pipeline");
                Arc::new(Pipeline::start(
                    pipeline_name,
                    self.inner.ctx.clone(),
                    self.inner.deleter.clone(),
                ))
            })
            .pool()
            .clone();
        let run = pool.admit(submission).await;
        drop(pipelines);

        pool.log_submission(&run).await;
        Ok(run.rid())
    }

    /// Hard delete: the worker is closed and the run removed.
    pub async fn delete(&self, rid: Rid) {
        self.inner.deleter.delete(rid).await;
    }

    /// Graceful for running or paused runs (the flag reaches the worker on
    /// its next resume); a plain delete otherwise.
    pub async fn request_termination(&self, rid: Rid) {
        let Some((_, run)) = self.find(rid).await else {
            debug!(rid, "termination requested for unknown run");
            return;
        };
        match run.status() {
            RunStatus::Running | RunStatus::Paused => {
                info!(rid, "termination requested");
                run.request_termination();
            }
            _ => self.delete(rid).await,
        }
    }

    pub async fn get_status(&self) -> BTreeMap<Rid, RunInfo> {
        self.inner.ctx.notifier.snapshot().await
    }

    /// Would pausing now let something else run?
    ///
    /// True if termination was requested or a prepared run outranks this
    /// one. Advisory: a higher-priority submission can arrive right after.
    pub async fn check_pause(&self, rid: Rid) -> Result<bool, SchedulerError> {
        let (pool, run) = self
            .find(rid)
            .await
            .ok_or(SchedulerError::RunNotFound { rid })?;
        if run.status() != RunStatus::Running {
            return Ok(false);
        }
        if run.termination_requested() {
            return Ok(true);
        }
        let prepared_max = pool
            .runs()
            .iter()
            .filter(|r| r.status() == RunStatus::PrepareDone)
            .map(|r| r.priority_key())
            .max();
        Ok(prepared_max.is_some_and(|max| max > run.priority_key()))
    }

    pub async fn check_termination(&self, rid: Rid) -> Result<bool, SchedulerError> {
        let (_, run) = self
            .find(rid)
            .await
            .ok_or(SchedulerError::RunNotFound { rid })?;
        Ok(run.termination_requested())
    }

    /// Stream of schedule modifications.
    pub fn subscribe(&self) -> broadcast::Receiver<Modification> {
        self.inner.ctx.notifier.subscribe()
    }

    /// Names of the live pipelines.
    pub async fn pipeline_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.pipelines.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Reject new submissions, delete every run and wait until the deleter
    /// has drained.
    pub async fn stop(&self) {
        self.inner.terminated.store(true, Ordering::SeqCst);

        let rids: Vec<Rid> = self
            .inner
            .pipelines
            .read()
            .await
            .values()
            .flat_map(|p| p.pool().rids())
            .collect();
        for rid in rids {
            self.inner.deleter.delete(rid).await;
        }
        self.inner.deleter.join().await;

        let task = self
            .inner
            .deleter_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }

        let remaining = self.inner.pipelines.read().await.len();
        if remaining > 0 {
            warn!(remaining, "some pipelines were not garbage-collected");
        }
        info!("scheduler stopped");
    }

    async fn find(&self, rid: Rid) -> Option<(Arc<RunPool>, Arc<Run>)> {
        self.inner
            .pipelines
            .read()
            .await
            .values()
            .find_map(|p| p.pool().get(rid).map(|run| (p.pool().clone(), run)))
    }
}
