//! Capability object answering worker-initiated requests.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::HandlerError;
use crate::protocol::{LogLevel, SchedulerQuery};
use crate::scheduler::Rid;

/// Ports a worker subprocess can reach on the master side.
///
/// Watchdog creation and deletion are served by the worker itself and are
/// not part of this trait.
#[async_trait]
pub trait WorkerHandlers: Send + Sync {
    /// A log record emitted by the experiment.
    async fn log(&self, rid: Option<Rid>, level: LogLevel, message: &str) {
        match level {
            LogLevel::Trace => tracing::trace!(rid = ?rid, "{message}"),
            LogLevel::Debug => tracing::debug!(rid = ?rid, "{message}"),
            LogLevel::Info => tracing::info!(rid = ?rid, "{message}"),
            LogLevel::Warning => tracing::warn!(rid = ?rid, "{message}"),
            LogLevel::Error => tracing::error!(rid = ?rid, "{message}"),
        }
    }

    async fn get_dataset(&self, key: &str) -> Result<Value, HandlerError>;

    async fn update_dataset(&self, key: &str, value: Value) -> Result<(), HandlerError>;

    /// A scheduler operation issued from inside an experiment.
    async fn scheduler(&self, rid: Option<Rid>, query: SchedulerQuery)
    -> Result<Value, HandlerError>;
}

/// Handlers for workers that are not attached to a scheduler.
///
/// Logs are forwarded, everything else fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedHandlers;

#[async_trait]
impl WorkerHandlers for DetachedHandlers {
    async fn get_dataset(&self, key: &str) -> Result<Value, HandlerError> {
        Err(HandlerError::DatasetNotFound {
            key: key.to_string(),
        })
    }

    async fn update_dataset(&self, _key: &str, _value: Value) -> Result<(), HandlerError> {
        Err(HandlerError::SchedulerGone)
    }

    async fn scheduler(
        &self,
        _rid: Option<Rid>,
        _query: SchedulerQuery,
    ) -> Result<Value, HandlerError> {
        Err(HandlerError::SchedulerGone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn detached_dataset_writes_fail() {
        let handlers = DetachedHandlers;
        let err = handlers
            .update_dataset("result", Value::from(1))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::SchedulerGone));
        assert!(matches!(
            handlers.get_dataset("result").await,
            Err(HandlerError::DatasetNotFound { .. })
        ));
    }
}
