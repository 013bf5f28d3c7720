//! Scheduler RPC over HTTP.

use std::collections::BTreeMap;

use axum::{Json, extract::State, http::StatusCode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use super::AppState;
use crate::error::SchedulerError;
use crate::notifier::RunInfo;
use crate::protocol::{Expid, Reply};
use crate::scheduler::{Rid, Scheduler};

fn default_pipeline() -> String {
    "main".to_string()
}

/// One facade call, dispatched by `method`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum ControlRequest {
    Submit {
        #[serde(default = "default_pipeline")]
        pipeline_name: String,
        expid: Expid,
        #[serde(default)]
        priority: i32,
        #[serde(default)]
        due_date: Option<DateTime<Utc>>,
        #[serde(default)]
        flush: bool,
    },
    Delete {
        rid: Rid,
    },
    RequestTermination {
        rid: Rid,
    },
    GetStatus,
    CheckPause {
        rid: Rid,
    },
}

/// Execute a request against the scheduler.
pub async fn dispatch(scheduler: &Scheduler, request: ControlRequest) -> Result<Value, SchedulerError> {
    match request {
        ControlRequest::Submit {
            pipeline_name,
            expid,
            priority,
            due_date,
            flush,
        } => {
            let rid = scheduler
                .submit(&pipeline_name, expid, priority, due_date, flush)
                .await?;
            Ok(Value::from(rid))
        }
        ControlRequest::Delete { rid } => {
            scheduler.delete(rid).await;
            Ok(Value::Null)
        }
        ControlRequest::RequestTermination { rid } => {
            scheduler.request_termination(rid).await;
            Ok(Value::Null)
        }
        ControlRequest::GetStatus => {
            Ok(serde_json::to_value(scheduler.get_status().await).unwrap_or_default())
        }
        ControlRequest::CheckPause { rid } => Ok(Value::Bool(scheduler.check_pause(rid).await?)),
    }
}

pub(super) async fn call(
    State(state): State<AppState>,
    Json(request): Json<ControlRequest>,
) -> (StatusCode, Json<Reply>) {
    info!(?request, "control request");
    match dispatch(&state.scheduler, request).await {
        Ok(data) => (StatusCode::OK, Json(Reply::ok(data))),
        Err(e) => {
            warn!(error = %e, "control request failed");
            let status = match e {
                SchedulerError::RunNotFound { .. } => StatusCode::NOT_FOUND,
                SchedulerError::Terminated => StatusCode::SERVICE_UNAVAILABLE,
                SchedulerError::Repository(_) => StatusCode::BAD_REQUEST,
            };
            (status, Json(Reply::failed(e)))
        }
    }
}

pub(super) async fn schedule(State(state): State<AppState>) -> Json<BTreeMap<Rid, RunInfo>> {
    Json(state.scheduler.get_status().await)
}
