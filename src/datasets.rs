//! In-memory dataset store shared with workers.

use std::collections::BTreeMap;

use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::HandlerError;

#[derive(Debug, Default)]
pub struct DatasetDb {
    data: RwLock<BTreeMap<String, Value>>,
}

impl DatasetDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &str) -> Result<Value, HandlerError> {
        self.data
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| HandlerError::DatasetNotFound {
                key: key.to_string(),
            })
    }

    /// Insert or replace. A `null` value deletes the key.
    pub async fn set(&self, key: &str, value: Value) {
        let mut data = self.data.write().await;
        if value.is_null() {
            data.remove(key);
        } else {
            data.insert(key.to_string(), value);
        }
    }

    pub async fn snapshot(&self) -> BTreeMap<String, Value> {
        self.data.read().await.clone()
    }
}
