//! Serialized run teardown and pipeline garbage collection.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::Rid;
use super::pipeline::Pipeline;
use super::run::{Run, RunStatus};

/// Named pipelines, shared by the scheduler facade and the deleter.
pub(crate) type Pipelines = Arc<RwLock<HashMap<String, Arc<Pipeline>>>>;

/// Handle for queueing deletions. Cheap to clone; every stage holds one.
#[derive(Clone)]
pub struct Deleter {
    pipelines: Pipelines,
    tx: mpsc::UnboundedSender<Rid>,
    /// Requests queued but not yet fully processed.
    pending: Arc<watch::Sender<usize>>,
}

impl Deleter {
    pub(crate) fn start(pipelines: Pipelines) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (pending, _rx) = watch::channel(0);
        let pending = Arc::new(pending);
        let task = tokio::spawn(process(pipelines.clone(), pending.clone(), rx));
        (
            Self {
                pipelines,
                tx,
                pending,
            },
            task,
        )
    }

    /// Mark the run `deleting` and queue its teardown. Repeated requests
    /// for the same RID are harmless: only the first finds the run.
    pub async fn delete(&self, rid: Rid) {
        debug!(rid, "delete requested");
        if let Some(run) = find_run(&self.pipelines, rid).await {
            run.set_status(RunStatus::Deleting).await;
        }
        self.pending.send_modify(|n| *n += 1);
        if self.tx.send(rid).is_err() {
            self.pending.send_modify(|n| *n = n.saturating_sub(1));
            warn!(rid, "deleter is stopped, dropping delete request");
        }
    }

    /// Wait until every queued request has been processed.
    pub async fn join(&self) {
        let mut rx = self.pending.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

async fn find_run(pipelines: &Pipelines, rid: Rid) -> Option<Arc<Run>> {
    pipelines
        .read()
        .await
        .values()
        .find_map(|p| p.pool().get(rid))
}

async fn process(
    pipelines: Pipelines,
    pending: Arc<watch::Sender<usize>>,
    mut rx: mpsc::UnboundedReceiver<Rid>,
) {
    while let Some(rid) = rx.recv().await {
        delete_run(&pipelines, rid).await;
        gc_pipelines(&pipelines).await;
        pending.send_modify(|n| *n = n.saturating_sub(1));
    }
}

async fn delete_run(pipelines: &Pipelines, rid: Rid) {
    let pool = pipelines
        .read()
        .await
        .values()
        .find(|p| p.pool().contains(rid))
        .map(|p| p.pool().clone());
    let Some(pool) = pool else {
        debug!(rid, "nothing to delete");
        return;
    };
    debug!(rid, pipeline = %pool.pipeline_name(), "deleting run");
    pool.delete(rid).await;
    debug!(rid, "deletion completed");
}

/// Drop pipelines whose pool is empty and stop their stages. Removal
/// happens under the write lock so no submission can reach a pipeline
/// that is being stopped.
async fn gc_pipelines(pipelines: &Pipelines) {
    let removed: Vec<(String, Arc<Pipeline>)> = {
        let mut map = pipelines.write().await;
        let empty: Vec<String> = map
            .iter()
            .filter(|(_, p)| p.pool().is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        empty
            .into_iter()
            .filter_map(|name| map.remove(&name).map(|p| (name, p)))
            .collect()
    };
    for (name, pipeline) in removed {
        debug!(pipeline = %name, "garbage-collecting pipeline");
        pipeline.stop().await;
    }
}
