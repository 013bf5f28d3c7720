//! Published schedule state.
//!
//! The notifier keeps the `{rid → RunInfo}` table that `get_status` returns
//! and fans every change out as a [`Modification`] so subscribers can keep a
//! local mirror.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{RwLock, broadcast};
use tracing::debug;

use crate::protocol::Expid;
use crate::scheduler::{Rid, RunStatus};

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Published view of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    pub pipeline: String,
    pub expid: Expid,
    pub priority: i32,
    pub due_date: Option<DateTime<Utc>>,
    pub flush: bool,
    pub status: RunStatus,
    /// Commit message of the repository revision, if any.
    pub repo_msg: Option<String>,
}

/// One change to the published table.
///
/// `path` addresses the container the change applies to: `[]` is the table
/// itself, `[rid]` is one run's entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Modification {
    Setitem {
        path: Vec<Value>,
        key: Value,
        value: Value,
    },
    Delitem {
        path: Vec<Value>,
        key: Value,
    },
}

impl Modification {
    /// Apply to a mirrored copy of the table. Paths that do not resolve are
    /// ignored.
    pub fn apply(&self, target: &mut Value) {
        let (path, key) = match self {
            Self::Setitem { path, key, .. } | Self::Delitem { path, key } => (path, key),
        };

        let mut container = target;
        for segment in path {
            match container.get_mut(object_key(segment)) {
                Some(next) => container = next,
                None => return,
            }
        }
        let Some(map) = container.as_object_mut() else {
            return;
        };

        match self {
            Self::Setitem { value, .. } => {
                map.insert(object_key(key), value.clone());
            }
            Self::Delitem { .. } => {
                map.remove(&object_key(key));
            }
        }
    }
}

/// JSON object keys are strings; RIDs travel as numbers.
fn object_key(key: &Value) -> String {
    match key {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Schedule table plus a broadcast channel of its modifications.
pub struct Notifier {
    runs: RwLock<BTreeMap<Rid, RunInfo>>,
    tx: broadcast::Sender<Modification>,
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Self {
            runs: RwLock::new(BTreeMap::new()),
            tx,
        }
    }

    /// Subscribe to modifications. Each mirror calls this.
    pub fn subscribe(&self) -> broadcast::Receiver<Modification> {
        self.tx.subscribe()
    }

    pub async fn insert(&self, rid: Rid, info: RunInfo) {
        let value = serde_json::to_value(&info).unwrap_or_default();
        self.runs.write().await.insert(rid, info);
        self.publish(Modification::Setitem {
            path: Vec::new(),
            key: Value::from(rid),
            value,
        });
    }

    pub async fn set_status(&self, rid: Rid, status: RunStatus) {
        {
            let mut runs = self.runs.write().await;
            let Some(info) = runs.get_mut(&rid) else {
                return;
            };
            info.status = status;
        }
        self.publish(Modification::Setitem {
            path: vec![Value::from(rid)],
            key: Value::from("status"),
            value: serde_json::to_value(status).unwrap_or_default(),
        });
    }

    pub async fn remove(&self, rid: Rid) {
        if self.runs.write().await.remove(&rid).is_some() {
            self.publish(Modification::Delitem {
                path: Vec::new(),
                key: Value::from(rid),
            });
        }
    }

    pub async fn get(&self, rid: Rid) -> Option<RunInfo> {
        self.runs.read().await.get(&rid).cloned()
    }

    /// Read-only copy of the whole table.
    pub async fn snapshot(&self) -> BTreeMap<Rid, RunInfo> {
        self.runs.read().await.clone()
    }

    fn publish(&self, modification: Modification) {
        // No receivers is fine.
        if self.tx.send(modification).is_err() {
            debug!("no schedule subscribers");
        }
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}
