//! A named lane: one pool and its three stage tasks.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::deleter::Deleter;
use super::pool::RunPool;
use super::scheduler::SchedulerContext;
use super::stages;

pub struct Pipeline {
    pool: Arc<RunPool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Pipeline {
    pub(crate) fn start(name: &str, ctx: Arc<SchedulerContext>, deleter: Deleter) -> Self {
        let pool = Arc::new(RunPool::new(name, ctx));
        let tasks = vec![
            tokio::spawn(stages::prepare_stage(pool.clone(), deleter.clone())),
            tokio::spawn(stages::run_stage(pool.clone(), deleter.clone())),
            tokio::spawn(stages::analyze_stage(pool.clone(), deleter)),
        ];
        debug!(pipeline = name, "pipeline started");
        Self {
            pool,
            tasks: Mutex::new(tasks),
        }
    }

    pub fn pool(&self) -> &Arc<RunPool> {
        &self.pool
    }

    /// Cancel the stage tasks and wait for them to finish.
    pub async fn stop(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(pipeline = %self.pool.pipeline_name(), error = %e, "stage task failed");
                }
            }
        }
        debug!(pipeline = %self.pool.pipeline_name(), "pipeline stopped");
    }
}
