//! Master-side answers to worker requests.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::Rid;
use super::scheduler::{Inner, Scheduler};
use crate::datasets::DatasetDb;
use crate::error::HandlerError;
use crate::protocol::SchedulerQuery;
use crate::worker::WorkerHandlers;

/// Handlers for every worker a scheduler spawns. Holds the scheduler
/// weakly, so workers outliving it get `SchedulerGone` answers.
pub struct MasterHandlers {
    scheduler: Weak<Inner>,
    datasets: Arc<DatasetDb>,
}

impl MasterHandlers {
    pub(super) fn new(scheduler: Weak<Inner>, datasets: Arc<DatasetDb>) -> Self {
        Self {
            scheduler,
            datasets,
        }
    }

    fn scheduler(&self) -> Result<Scheduler, HandlerError> {
        self.scheduler
            .upgrade()
            .map(|inner| Scheduler { inner })
            .ok_or(HandlerError::SchedulerGone)
    }
}

#[async_trait]
impl WorkerHandlers for MasterHandlers {
    async fn get_dataset(&self, key: &str) -> Result<Value, HandlerError> {
        self.datasets.get(key).await
    }

    async fn update_dataset(&self, key: &str, value: Value) -> Result<(), HandlerError> {
        self.datasets.set(key, value).await;
        Ok(())
    }

    async fn scheduler(
        &self,
        rid: Option<Rid>,
        query: SchedulerQuery,
    ) -> Result<Value, HandlerError> {
        debug!(rid = ?rid, ?query, "scheduler request from worker");
        let scheduler = self.scheduler()?;
        match query {
            SchedulerQuery::Submit {
                pipeline_name,
                expid,
                priority,
                due_date,
                flush,
            } => {
                let new_rid = scheduler
                    .submit(&pipeline_name, expid, priority, due_date, flush)
                    .await?;
                Ok(Value::from(new_rid))
            }
            SchedulerQuery::Delete { rid } => {
                scheduler.delete(rid).await;
                Ok(Value::Null)
            }
            SchedulerQuery::RequestTermination { rid } => {
                scheduler.request_termination(rid).await;
                Ok(Value::Null)
            }
            SchedulerQuery::GetStatus => {
                Ok(serde_json::to_value(scheduler.get_status().await).unwrap_or_default())
            }
            SchedulerQuery::CheckPause { rid } => {
                Ok(Value::Bool(scheduler.check_pause(rid).await?))
            }
            SchedulerQuery::CheckTermination { rid } => {
                Ok(Value::Bool(scheduler.check_termination(rid).await?))
            }
        }
    }
}
